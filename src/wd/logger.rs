use crate::wd::config::ConfigStore;
use crate::wd::sync_event::SyncEvent;
use anyhow::Context as _;
use chrono::Local;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024; // 20 MiB
const DEFAULT_MAX_WRITE_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Anything and everything you might want to know about a running block of code.
    Verbose = 0,
    /// Internal system events that aren't necessarily observable from the outside.
    Debug = 1,
    /// The lifeblood of operational intelligence - things happen.
    Information = 2,
    /// Service is degraded or endangered.
    Warning = 3,
    /// Functionality is unavailable, invariants are broken or data is lost.
    Error = 4,
    /// If you have a pager, it goes off when one of these occurs.
    Fatal = 5,
    /// Threshold value that masks every record; not a level records carry.
    MaskAll = 6,
}

impl LogLevel {
    pub fn from_number(n: i64) -> LogLevel {
        match n {
            0 => LogLevel::Verbose,
            1 => LogLevel::Debug,
            2 => LogLevel::Information,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            5 => LogLevel::Fatal,
            _ => LogLevel::MaskAll,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Verbose => "VRB",
            LogLevel::Debug => "DBG",
            LogLevel::Information => "INF",
            LogLevel::Warning => "WRN",
            LogLevel::Error => "ERR",
            LogLevel::Fatal => "FAT",
            LogLevel::MaskAll => "OFF",
        }
    }
}

/// Pluggable log destination.
pub trait LogSink: Send + Sync {
    /// Advisory threshold; records below it are not offered to the sink.
    fn min_log_level(&self) -> LogLevel;

    /// Called under the logger mutex; must be fast and must never log back
    /// into the logger.
    fn log(&self, level: LogLevel, formatted: &str);

    /// Called from the flusher thread only; may block briefly.
    /// `still_running=false` indicates teardown.
    fn flush(&self, still_running: bool, force: bool);
}

struct LoggerShared {
    queue: VecDeque<String>,
    sinks: Vec<Arc<dyn LogSink>>,
    // raw from the config until start(), absolute afterwards
    file_path: Option<PathBuf>,
}

struct LoggerInner {
    min_console_level: LogLevel,
    min_file_level: LogLevel,
    max_file_size: u64,
    max_old_files: usize,
    max_write_delay: u64,
    log_thread_id: bool,
    shared: Mutex<LoggerShared>,
    // lowest threshold over all registered sinks, kept outside the mutex so
    // the front end can skip formatting without taking the lock
    min_sink_level: AtomicU8,
    trigger: SyncEvent,
    running: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Thread-safe logging front end with a background flusher.
///
/// Records are formatted on the producing thread; the mutex is held only for
/// the console write, the file-queue push and the sink fan-out. The file is
/// written exclusively by the flusher thread.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn configure(cfg: &ConfigStore, section: &str) -> Logger {
        // the older consoleLevel/fileLevel spellings are accepted as aliases
        let console_default = cfg.get_number(section, "consoleLevel", 0i64);
        let min_console_level =
            LogLevel::from_number(cfg.get_number(section, "minConsoleLevel", console_default));
        let file_default = cfg.get_number(section, "fileLevel", 0i64);
        let mut min_file_level =
            LogLevel::from_number(cfg.get_number(section, "minFileLevel", file_default));

        let file_path = cfg.get_string(section, "filePath", "");
        let file_path = if file_path.is_empty() {
            // no file path means no file logging
            min_file_level = LogLevel::MaskAll;
            None
        } else {
            Some(PathBuf::from(&file_path))
        };

        Logger {
            inner: Arc::new(LoggerInner {
                min_console_level,
                min_file_level,
                max_file_size: cfg.get_number(section, "maxFileSize", DEFAULT_MAX_FILE_SIZE),
                max_old_files: cfg.get_number(section, "maxOldFiles", 0usize),
                max_write_delay: cfg.get_number(section, "maxWriteDelay", DEFAULT_MAX_WRITE_DELAY_MS),
                log_thread_id: cfg.get_bool(section, "logThreadId", false),
                shared: Mutex::new(LoggerShared {
                    queue: VecDeque::new(),
                    sinks: Vec::new(),
                    file_path,
                }),
                min_sink_level: AtomicU8::new(LogLevel::MaskAll as u8),
                trigger: SyncEvent::new(false, true),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // the working directory is settled by now, so a relative filePath can
        // be pinned down and its directory created
        let file_path = {
            let mut shared = self.inner.shared.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(p) = shared.file_path.take() {
                let p = std::path::absolute(&p).unwrap_or(p);
                if let Some(parent) = p.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                shared.file_path = Some(p);
            }
            shared.file_path.clone()
        };
        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("logger-flush".into())
            .spawn(move || run_flusher(inner))
        {
            Ok(handle) => {
                let mut worker = self.inner.worker.lock().unwrap_or_else(|p| p.into_inner());
                *worker = Some(handle);
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                eprintln!("logger: failed to start flusher thread: {e}");
                return;
            }
        }
        self.debug(
            "Logger::start",
            format!(
                "consoleLevel={}, fileLevel={}, filePath={}, maxFileSize={}, maxOldFiles={}, maxWriteDelay={}, logThreadId={}",
                self.inner.min_console_level as u8,
                self.inner.min_file_level as u8,
                file_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                self.inner.max_file_size,
                self.inner.max_old_files,
                self.inner.max_write_delay,
                self.inner.log_thread_id
            ),
        );
    }

    /// Stops the flusher thread after one final forced flush pass, so late
    /// shutdown records still reach the file and the sinks.
    pub fn shutdown(&self) {
        if self.inner.running.load(Ordering::SeqCst) {
            self.debug("Logger::shutdown", "shutting down");
        }
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = {
            let mut worker = self.inner.worker.lock().unwrap_or_else(|p| p.into_inner());
            worker.take()
        };
        self.inner.trigger.set_event();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        let mut shared = self.inner.shared.lock().unwrap_or_else(|p| p.into_inner());
        let level = sink.min_log_level() as u8;
        shared.sinks.push(sink);
        self.inner.min_sink_level.fetch_min(level, Ordering::SeqCst);
    }

    pub fn log(&self, level: LogLevel, location: &str, message: &str) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let min_sink = LogLevel::from_number(inner.min_sink_level.load(Ordering::SeqCst) as i64);
        if level < inner.min_console_level && level < inner.min_file_level && level < min_sink {
            // nobody is interested, formatting would be wasted work
            return;
        }

        let formatted = inner.format_record(level, location, message);

        let mut shared = inner.shared.lock().unwrap_or_else(|p| p.into_inner());
        if level >= inner.min_console_level {
            // console output under the lock, so concurrent records don't interleave
            print!("{formatted}");
        }
        if shared.file_path.is_some() && level >= inner.min_file_level {
            shared.queue.push_back(formatted.clone());
        }
        for sink in &shared.sinks {
            if level >= sink.min_log_level() {
                sink.log(level, &formatted);
            }
        }
    }

    pub fn verbose(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Verbose, location, message.as_ref());
    }

    pub fn debug(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, location, message.as_ref());
    }

    pub fn info(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Information, location, message.as_ref());
    }

    pub fn warning(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, location, message.as_ref());
    }

    pub fn error(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Error, location, message.as_ref());
    }

    pub fn fatal(&self, location: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Fatal, location, message.as_ref());
    }
}

fn run_flusher(inner: Arc<LoggerInner>) {
    loop {
        inner.trigger.wait_timeout(inner.max_write_delay);
        let still_running = inner.running.load(Ordering::SeqCst);
        inner.flush_pass(still_running, !still_running);
        if !still_running {
            break;
        }
    }
}

impl LoggerInner {
    fn format_record(&self, level: LogLevel, location: &str, message: &str) -> String {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let thread_prefix = if self.log_thread_id {
            // a stable 32-bit hash is good enough to tell threads apart
            let mut hasher = DefaultHasher::new();
            thread::current().id().hash(&mut hasher);
            format!("{:08x}: ", hasher.finish() as u32)
        } else {
            String::new()
        };
        let location_prefix = if location.is_empty() {
            String::new()
        } else {
            format!("{location}: ")
        };
        format!(
            "{timestamp} [{}] {thread_prefix}{location_prefix}{message}\n",
            level.tag()
        )
    }

    /// One iteration of the background thread: drain the queue into the file,
    /// rotate and prune if needed, then let every sink flush. I/O problems go
    /// to stderr only; the flusher never logs through the front end.
    fn flush_pass(&self, still_running: bool, force: bool) {
        let (batch, sinks, file_path) = {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            (
                std::mem::take(&mut shared.queue),
                shared.sinks.clone(),
                shared.file_path.clone(),
            )
        };

        if let Some(path) = &file_path {
            if !batch.is_empty() {
                if let Err(e) = self.persist(path, &batch) {
                    eprintln!("logger: unable to write to file {}: {e:#}", path.display());
                    // worth trying to create the folder again, although it should already exist
                    if let Some(parent) = path.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                }
            }
        }

        for sink in &sinks {
            sink.flush(still_running, force);
        }
    }

    fn persist(&self, path: &Path, batch: &VecDeque<String>) -> anyhow::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        for record in batch {
            file.write_all(record.as_bytes())
                .with_context(|| format!("append to {}", path.display()))?;
        }
        file.flush()?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        drop(file);

        // rotation is a recommendation, not a hard cap: it happens after the
        // write that crossed the threshold, so a record is never split
        if self.max_file_size > 0 && size > self.max_file_size {
            self.rotate(path);
        }
        Ok(())
    }

    fn rotate(&self, path: &Path) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let timestamp = Local::now().format("%Y%m%d%H%M%S");
        let rotated = path.with_file_name(format!("{stem}.{timestamp}{extension}"));
        if let Err(e) = fs::rename(path, &rotated) {
            eprintln!(
                "logger: failed to rotate {} to {}: {e}",
                path.display(),
                rotated.display()
            );
            return;
        }
        if self.max_old_files > 0 {
            self.prune_archives(path, &stem, &extension);
        }
    }

    fn prune_archives(&self, path: &Path, stem: &str, extension: &str) {
        let Some(dir) = path.parent() else { return };
        let Ok(entries) = fs::read_dir(dir) else { return };
        let mut archives: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p != path)
            .filter(|p| {
                match p.file_name().map(|n| n.to_string_lossy().into_owned()) {
                    Some(name) => name.starts_with(stem) && name.ends_with(extension),
                    None => false,
                }
            })
            .collect();
        if archives.len() <= self.max_old_files {
            return;
        }
        // archive names embed the rotation timestamp, so the name order is the
        // chronological order
        archives.sort();
        let excess = archives.len() - self.max_old_files;
        for victim in &archives[..excess] {
            let _ = fs::remove_file(victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn quiet_logger(file_path: &Path, extra: serde_json::Value) -> Logger {
        let mut section = json!({
            "minConsoleLevel": 6,
            "minFileLevel": 0,
            "filePath": file_path.to_string_lossy(),
            "maxWriteDelay": 50
        });
        if let (Some(target), Some(source)) = (section.as_object_mut(), extra.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        let cfg = ConfigStore::from_value(json!({ "log": section }));
        Logger::configure(&cfg, "log")
    }

    #[test]
    fn records_reach_the_file_with_the_expected_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let logger = quiet_logger(&path, json!({ "logThreadId": true }));
        logger.start();
        logger.info("Widget::frobnicate", "hello world");
        logger.shutdown();

        let contents = fs::read_to_string(&path).unwrap();
        let line = contents.lines().find(|l| l.contains("hello world")).unwrap();
        // 2025-06-01 12:34:56.789 [INF] cafebabe: Widget::frobnicate: hello world
        assert_eq!(&line[4..5], "-");
        assert_eq!(&line[10..11], " ");
        assert_eq!(&line[19..20], ".");
        assert!(line.contains("[INF]"));
        assert!(line.contains("Widget::frobnicate: hello world"));
        let after_tag = line.split("[INF] ").nth(1).unwrap();
        let thread_prefix = after_tag.split(": ").next().unwrap();
        assert_eq!(thread_prefix.len(), 8);
        assert!(thread_prefix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_threshold_filters_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let logger = quiet_logger(&path, json!({ "minFileLevel": 4 }));
        logger.start();
        logger.info("Test::info", "below threshold");
        logger.error("Test::error", "above threshold");
        logger.shutdown();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("below threshold"));
        assert!(contents.contains("above threshold"));
    }

    #[test]
    fn oversized_file_is_rotated_with_a_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        // maxWriteDelay is high, so the single drain happens in the final
        // shutdown pass and exactly one rotation is observed
        let logger = quiet_logger(&path, json!({ "maxFileSize": 500, "maxWriteDelay": 10000 }));
        logger.start();
        for i in 0..20 {
            logger.info("Rotation::test", format!("record number {i} with some padding"));
        }
        logger.shutdown();

        let archives: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("svc.") && n.ends_with(".log") && *n != "svc.log")
            .collect();
        assert_eq!(archives.len(), 1);
        let timestamp = archives[0]
            .strip_prefix("svc.")
            .unwrap()
            .strip_suffix(".log")
            .unwrap();
        assert_eq!(timestamp.len(), 14);
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn retention_keeps_only_the_newest_archives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        for ts in ["20200101000000", "20210101000000", "20220101000000"] {
            fs::write(dir.path().join(format!("svc.{ts}.log")), "old archive\n").unwrap();
        }
        let logger =
            quiet_logger(&path, json!({ "maxFileSize": 10, "maxOldFiles": 2, "maxWriteDelay": 10000 }));
        logger.start();
        logger.info("Retention::test", "this record alone exceeds maxFileSize");
        logger.shutdown();

        let mut archives: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("svc.") && n.ends_with(".log") && *n != "svc.log")
            .collect();
        archives.sort();
        assert_eq!(archives.len(), 2);
        // the two oldest pre-seeded archives must be gone
        assert!(!archives.contains(&"svc.20200101000000.log".to_string()));
        assert!(!archives.contains(&"svc.20210101000000.log".to_string()));
        assert_eq!(archives[0], "svc.20220101000000.log");
    }

    struct CountingSink {
        min_level: LogLevel,
        seen: Mutex<Vec<String>>,
        flushes: Mutex<Vec<(bool, bool)>>,
    }

    impl LogSink for CountingSink {
        fn min_log_level(&self) -> LogLevel {
            self.min_level
        }

        fn log(&self, _level: LogLevel, formatted: &str) {
            self.seen
                .lock()
                .unwrap()
                .push(formatted.to_string());
        }

        fn flush(&self, still_running: bool, force: bool) {
            self.flushes.lock().unwrap().push((still_running, force));
        }
    }

    #[test]
    fn sinks_receive_matching_records_and_a_final_forced_flush() {
        let dir = tempfile::tempdir().unwrap();
        let logger = quiet_logger(&dir.path().join("svc.log"), json!({}));
        let sink = Arc::new(CountingSink {
            min_level: LogLevel::Warning,
            seen: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
        });
        logger.register_sink(sink.clone());
        logger.start();
        logger.info("Sink::test", "too quiet");
        logger.warning("Sink::test", "loud enough");
        std::thread::sleep(Duration::from_millis(150));
        logger.shutdown();

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("loud enough"));
        let flushes = sink.flushes.lock().unwrap();
        assert!(flushes.len() >= 2, "periodic and final flush expected");
        let last = flushes.last().unwrap();
        assert_eq!(*last, (false, true));
    }

    #[test]
    fn logging_before_start_and_after_shutdown_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let logger = quiet_logger(&path, json!({}));
        logger.log(LogLevel::Error, "Test::early", "too early");
        logger.start();
        logger.shutdown();
        logger.log(LogLevel::Error, "Test::late", "too late");

        let contents = fs::read_to_string(&path).unwrap_or_default();
        assert!(!contents.contains("too early"));
        assert!(!contents.contains("too late"));
    }
}
