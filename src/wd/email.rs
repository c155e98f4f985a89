use crate::wd::config::ConfigStore;
use crate::wd::crypto::SecretVault;
use crate::wd::logger::{LogLevel, LogSink, Logger};
use crate::wd::util::steady_time_ms;
use anyhow::Context as _;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DEFAULT_SMTP_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_DELAY_S: u64 = 300;
const DEFAULT_MAX_LOGS: usize = 1000;
const DEFAULT_TIMEOUT_ON_SHUTDOWN_MS: u64 = 3000;

/// SMTP collaborator: accepts one batched message and delivers it. The sink
/// decides when to flush and what to send; everything below the batch is this
/// sender's business.
#[derive(Clone)]
pub struct EmailSender {
    smtp_server_url: String,
    default_source_address: String,
    username: String,
    password: String,
    timeout_ms: u64,
    logger: Logger,
}

impl EmailSender {
    pub fn configure(
        cfg: &ConfigStore,
        vault: &SecretVault,
        logger: &Logger,
        section: &str,
    ) -> EmailSender {
        logger.debug(
            "EmailSender::configure",
            format!("reading configuration from section: {section}"),
        );
        let smtp_server_url = cfg.get_string(section, "smtpServerUrl", "");
        let default_source_address = cfg.get_string(section, "defaultSourceAddress", "");
        if smtp_server_url.is_empty() || default_source_address.is_empty() {
            logger.error(
                "EmailSender::configure",
                format!("smtpServerUrl or defaultSourceAddress not configured in section: {section}"),
            );
        }
        let username = cfg.get_string(section, "username", "");
        let password =
            vault.get_possibly_encrypted_string(cfg, section, "password", "", logger);
        let timeout_ms = cfg.get_number(section, "timeout", DEFAULT_SMTP_TIMEOUT_MS);
        logger.debug(
            "EmailSender::configure",
            format!(
                "smtpServer={smtp_server_url}, defaultSourceAddress={default_source_address}, username={username}, password={}, timeout={timeout_ms}",
                if password.is_empty() { "<none>" } else { "<non-empty>" }
            ),
        );
        EmailSender {
            smtp_server_url,
            default_source_address,
            username,
            password,
            timeout_ms,
            logger: logger.clone(),
        }
    }

    /// Sends one plain-text message. `timeout_ms` of 0 means the configured
    /// default. Outcomes are logged; the records carry an `EmailSender`
    /// location, which keeps them out of the email sinks.
    pub fn send_simple_email(
        &self,
        subject: &str,
        utf8_body: String,
        to_addresses: &[String],
        from_address: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<()> {
        let to_string = to_addresses.join(", ");
        self.logger.info(
            "EmailSender::send_simple_email",
            format!("sending email to {to_string}"),
        );

        let result = self.transmit(subject, utf8_body, to_addresses, from_address, timeout_ms);
        match &result {
            Ok(()) => self.logger.info(
                "EmailSender::send_simple_email",
                format!("email sent successfully to {to_string}"),
            ),
            Err(e) => self.logger.error(
                "EmailSender::send_simple_email",
                format!("delivery to {to_string} failed: {e:#}"),
            ),
        }
        result
    }

    fn transmit(
        &self,
        subject: &str,
        utf8_body: String,
        to_addresses: &[String],
        from_address: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!self.smtp_server_url.is_empty(), "smtpServerUrl not configured");
        let timeout = if timeout_ms > 0 { timeout_ms } else { self.timeout_ms };

        let mut builder = SmtpTransport::from_url(&self.smtp_server_url)
            .with_context(|| format!("invalid smtpServerUrl {}", self.smtp_server_url))?
            .timeout(Some(Duration::from_millis(timeout)));
        if !self.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(self.username.clone(), self.password.clone()));
        }
        let transport = builder.build();

        let from = if from_address.is_empty() {
            &self.default_source_address
        } else {
            from_address
        };
        let mut message = Message::builder()
            .from(from.parse::<Mailbox>().with_context(|| format!("invalid sender address {from}"))?)
            .subject(subject);
        for to in to_addresses {
            message = message
                .to(to.parse::<Mailbox>().with_context(|| format!("invalid recipient address {to}"))?);
        }
        let email = message.body(utf8_body).context("failed to build message")?;

        transport.send(&email).context("SMTP delivery failed")?;
        Ok(())
    }
}

struct EmailQueue {
    records: VecDeque<String>,
    // stamped when the queue goes from empty to non-empty
    watermark_ms: u64,
}

/// Log sink that batches matching records and mails them out, either when the
/// batch grows past `maxLogs` or when the oldest record has waited `maxDelay`
/// seconds (or immediately on a forced flush).
pub struct EmailLogSink {
    min_log_level: LogLevel,
    recipients: Vec<String>,
    subject: String,
    max_delay_s: u64,
    max_logs: usize,
    timeout_on_shutdown_ms: u64,
    sender: EmailSender,
    queue: Mutex<EmailQueue>,
}

impl EmailLogSink {
    /// Creates and registers one sink per object under `parent_section`
    /// (normally `log.email`).
    pub fn configure_all(
        cfg: &ConfigStore,
        vault: &SecretVault,
        logger: &Logger,
        parent_section: &str,
    ) {
        for key in cfg.get_keys(parent_section, true, false, false) {
            let section = format!("{parent_section}.{key}");
            if let Some(sink) = EmailLogSink::configure(cfg, vault, logger, &section) {
                logger.register_sink(Arc::new(sink));
            }
        }
    }

    pub fn configure(
        cfg: &ConfigStore,
        vault: &SecretVault,
        logger: &Logger,
        section: &str,
    ) -> Option<EmailLogSink> {
        let min_log_level =
            LogLevel::from_number(cfg.get_number(section, "minLogLevel", 0i64));
        let recipients = cfg.get_string_vector(section, "recipients");
        let email_section = cfg.get_string(section, "emailSection", "");

        if email_section.is_empty() || recipients.is_empty() || min_log_level >= LogLevel::MaskAll {
            logger.debug(
                "EmailLogSink::configure",
                format!("section={section}: disabled or not fully configured"),
            );
            return None;
        }

        let mut subject = cfg.get_string(section, "subject", "");
        if subject.is_empty() {
            // portable default in the form of "service @ host"
            subject = format!("{}@{}", executable_name(), hostname());
        }
        let max_delay_s = cfg.get_number(section, "maxDelay", DEFAULT_MAX_DELAY_S);
        let max_logs = cfg.get_number(section, "maxLogs", DEFAULT_MAX_LOGS);
        let timeout_on_shutdown_ms =
            cfg.get_number(section, "timeoutOnShutdown", DEFAULT_TIMEOUT_ON_SHUTDOWN_MS);

        let sender = EmailSender::configure(cfg, vault, logger, &email_section);

        logger.debug(
            "EmailLogSink::configure",
            format!(
                "section={section}: minLogLevel={}, emailSection={email_section}, recipients={}, subject={subject}, maxDelay={max_delay_s}, maxLogs={max_logs}, timeoutOnShutdown={timeout_on_shutdown_ms}",
                min_log_level as u8,
                recipients.join(", ")
            ),
        );

        Some(EmailLogSink {
            min_log_level,
            recipients,
            subject,
            max_delay_s,
            max_logs,
            timeout_on_shutdown_ms,
            sender,
            queue: Mutex::new(EmailQueue {
                records: VecDeque::new(),
                watermark_ms: 0,
            }),
        })
    }
}

impl LogSink for EmailLogSink {
    fn min_log_level(&self) -> LogLevel {
        self.min_log_level
    }

    fn log(&self, level: LogLevel, formatted: &str) {
        if level < self.min_log_level {
            return;
        }
        // records produced by the transport itself are deliberately ignored,
        // so a delivery failure cannot start an email sending loop
        if formatted.contains("EmailSender") {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if queue.records.is_empty() {
            queue.watermark_ms = steady_time_ms();
        }
        queue.records.push_back(formatted.to_string());
    }

    fn flush(&self, still_running: bool, force: bool) {
        let batch = {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.records.is_empty() {
                return;
            }
            let age_ms = steady_time_ms().saturating_sub(queue.watermark_ms);
            if !force && queue.records.len() < self.max_logs && age_ms < self.max_delay_s * 1000 {
                return;
            }
            std::mem::take(&mut queue.records)
        };
        // the queue lock is released; from here on logging is safe again

        let body: String = batch.into_iter().collect();
        let sender = self.sender.clone();
        let subject = self.subject.clone();
        let recipients = self.recipients.clone();

        if still_running {
            // fire & forget: assume we'll be up long enough for the delivery
            let worker = thread::Builder::new().name("email-sender".into()).spawn(move || {
                let _ = sender.send_simple_email(&subject, body, &recipients, "", 0);
            });
            drop(worker);
            if force {
                // a forced flush may mean the software is shutting down; give
                // the detached worker a moment to get going
                thread::sleep(Duration::from_millis(100));
            }
        } else {
            // shutting down: a detached worker would most likely be cancelled,
            // so deliver with the short shutdown timeout and wait for it
            let timeout_ms = self.timeout_on_shutdown_ms;
            let worker = thread::Builder::new().name("email-sender".into()).spawn(move || {
                let _ = sender.send_simple_email(&subject, body, &recipients, "", timeout_ms);
            });
            if let Ok(handle) = worker {
                let _ = handle.join();
            }
        }
    }
}

fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "svcwatchdog".to_string())
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_setup() -> (ConfigStore, SecretVault, Logger) {
        let cfg = ConfigStore::from_value(json!({
            "log": {
                "minConsoleLevel": 6,
                "email": {
                    "alerts": {
                        "minLogLevel": 3,
                        "recipients": ["ops@example.com"],
                        "emailSection": "smtp",
                        "maxDelay": 3600,
                        "maxLogs": 1000,
                        "timeoutOnShutdown": 50
                    },
                    "broken": {
                        "minLogLevel": 3,
                        "recipients": []
                    }
                }
            },
            "smtp": {
                // nothing listens here; deliveries fail fast in tests
                "smtpServerUrl": "smtp://127.0.0.1:1",
                "defaultSourceAddress": "svc@example.com"
            }
        }));
        let vault = SecretVault::from_password("pw");
        let logger = Logger::configure(&cfg, "log");
        (cfg, vault, logger)
    }

    #[test]
    fn misconfigured_sections_are_rejected() {
        let (cfg, vault, logger) = test_setup();
        assert!(EmailLogSink::configure(&cfg, &vault, &logger, "log.email.broken").is_none());
        assert!(EmailLogSink::configure(&cfg, &vault, &logger, "log.email.alerts").is_some());
    }

    #[test]
    fn default_subject_names_the_service_and_host() {
        let cfg = ConfigStore::from_value(json!({
            "log": { "minConsoleLevel": 6 },
            "s": {
                "minLogLevel": 3,
                "recipients": ["ops@example.com"],
                "emailSection": "smtp"
            },
            "smtp": { "smtpServerUrl": "smtp://127.0.0.1:1", "defaultSourceAddress": "a@b.c" }
        }));
        let vault = SecretVault::from_password("pw");
        let logger = Logger::configure(&cfg, "log");
        let sink = EmailLogSink::configure(&cfg, &vault, &logger, "s").unwrap();
        assert!(sink.subject.contains('@'));
    }

    #[test]
    fn records_below_threshold_and_transport_records_are_ignored() {
        let (cfg, vault, logger) = test_setup();
        let sink = EmailLogSink::configure(&cfg, &vault, &logger, "log.email.alerts").unwrap();
        sink.log(LogLevel::Information, "below threshold\n");
        sink.log(LogLevel::Error, "EmailSender::send_simple_email: delivery failed\n");
        sink.log(LogLevel::Error, "a real problem\n");
        let queue = sink.queue.lock().unwrap();
        assert_eq!(queue.records.len(), 1);
        assert_eq!(queue.records[0], "a real problem\n");
    }

    #[test]
    fn watermark_is_stamped_on_first_record_only() {
        let (cfg, vault, logger) = test_setup();
        let sink = EmailLogSink::configure(&cfg, &vault, &logger, "log.email.alerts").unwrap();
        sink.log(LogLevel::Error, "first\n");
        let first_mark = sink.queue.lock().unwrap().watermark_ms;
        std::thread::sleep(Duration::from_millis(15));
        sink.log(LogLevel::Error, "second\n");
        assert_eq!(sink.queue.lock().unwrap().watermark_ms, first_mark);
    }

    #[test]
    fn flush_waits_until_a_condition_is_met() {
        let (cfg, vault, logger) = test_setup();
        let sink = EmailLogSink::configure(&cfg, &vault, &logger, "log.email.alerts").unwrap();
        sink.log(LogLevel::Error, "queued\n");
        // neither forced, nor full, nor old enough: the batch stays put
        sink.flush(true, false);
        assert_eq!(sink.queue.lock().unwrap().records.len(), 1);
        // a forced shutdown flush drains the queue (delivery fails fast, and
        // the worker is joined with the shutdown timeout)
        sink.flush(false, true);
        assert!(sink.queue.lock().unwrap().records.is_empty());
    }
}
