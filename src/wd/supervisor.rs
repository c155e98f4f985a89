use crate::wd::config::ConfigStore;
use crate::wd::logger::{LogLevel, Logger};
use crate::wd::service::ServiceHandler;
use crate::wd::shutdown_event::ShutdownEvent;
use crate::wd::sync_event::SyncEvent;
use crate::wd::util::{printable, steady_time_ms};
use anyhow::Context as _;
use std::env;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const ENV_SHUTDOWN_EVENT: &str = "SHUTDOWN_EVENT";
pub const ENV_WATCHDOG_PORT: &str = "WATCHDOG_PORT";
pub const ENV_WATCHDOG_SECRET: &str = "WATCHDOG_SECRET";

const SHUTDOWN_EVENT_PREFIX: &str = "Global\\SvcWatchDog.";
const POLL_TICK_MS: u64 = 200;
const POST_SPAWN_SETTLE_MS: u64 = 250;
const DEFAULT_RESTART_DELAY_MS: u64 = 5000;
const DEFAULT_SHUTDOWN_TIME_MS: u64 = 10_000;

/// Spawn-monitor-restart control over a single child process.
///
/// One live child per supervisor instance. The main loop runs on the service
/// thread; the control callbacks ([`ServiceHandler`]) only flip flags, arm the
/// kill deadline and pulse the loop trigger, so they return promptly.
pub struct Supervisor {
    section: String,
    cfg: Arc<ConfigStore>,
    logger: Logger,
    service_name: String,
    exe_file: PathBuf,
    exe_dir: PathBuf,
    working_directory: PathBuf,
    argv: Mutex<Vec<String>>,
    target_executable: Mutex<Option<PathBuf>>,
    // monotonic deadline for forced termination; 0 = not scheduled
    kill_time: AtomicU64,
    is_running: AtomicBool,
    loop_trigger: SyncEvent,
    shutdown_event: Mutex<Option<ShutdownEvent>>,
}

impl Supervisor {
    pub fn new(cfg: Arc<ConfigStore>, logger: Logger) -> anyhow::Result<Supervisor> {
        let section = "svcWatchDog".to_string();

        let exe_file = env::current_exe().context("cannot determine the executable path")?;
        let exe_dir = exe_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let service_name = exe_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "svcwatchdog".to_string());

        let work_dir = cfg.get_string(&section, "workDir", "");
        // joining an absolute workDir replaces the base, so both spellings work
        let working_directory = exe_dir.join(work_dir);
        let working_directory =
            std::path::absolute(&working_directory).unwrap_or(working_directory);

        let supervisor = Supervisor {
            section,
            cfg,
            logger,
            service_name,
            exe_file,
            exe_dir,
            working_directory,
            argv: Mutex::new(Vec::new()),
            target_executable: Mutex::new(None),
            kill_time: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            loop_trigger: SyncEvent::new(false, true),
            shutdown_event: Mutex::new(None),
        };
        // originate from a known point, so relative logger paths resolve sanely
        supervisor.cd_to_working_dir();
        Ok(supervisor)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn exe_file(&self) -> &Path {
        &self.exe_file
    }

    pub fn exe_dir(&self) -> &Path {
        &self.exe_dir
    }

    /// Reads the child arguments and resolves the target executable. Called
    /// once the logger is up; a broken configuration is logged, not fatal -
    /// the run loop then idles until the service is stopped.
    pub fn configure(&self) {
        let lg = &self.logger;
        lg.info(
            "Supervisor::configure",
            format!("service name: {}", self.service_name),
        );
        lg.debug("Supervisor::configure", format!("exeFile={}", self.exe_file.display()));
        lg.debug("Supervisor::configure", format!("exeDir={}", self.exe_dir.display()));
        lg.debug(
            "Supervisor::configure",
            format!("workDir={}", self.working_directory.display()),
        );

        let use_path = self.cfg.get_bool(&self.section, "usePath", false);
        lg.debug("Supervisor::configure", format!("usePath={use_path}"));

        let mut argv = self.cfg.get_string_vector(&self.section, "args");
        if argv.is_empty() {
            lg.error("Supervisor::configure", "args missing or empty, check configuration");
            return;
        }
        for (i, arg) in argv.iter().enumerate() {
            lg.info("Supervisor::configure", format!("arg #{i}: {arg}"));
        }

        let mut target = PathBuf::from(&argv[0]);
        if use_path {
            let path_var = env::var_os("PATH").unwrap_or_default();
            lg.debug(
                "Supervisor::configure",
                format!("searching path {}", path_var.to_string_lossy()),
            );
            match resolve_on_path(&path_var, &argv[0]) {
                Some(hit) => {
                    argv[0] = hit.to_string_lossy().into_owned();
                    target = hit;
                }
                None => {
                    // the loop still enters; the next spawn fails and the
                    // restart delay applies
                    lg.error(
                        "Supervisor::configure",
                        format!("target executable {} not found in path", argv[0]),
                    );
                }
            }
        }
        lg.debug(
            "Supervisor::configure",
            format!("using target executable {}", target.display()),
        );

        *self.argv.lock().unwrap_or_else(|p| p.into_inner()) = argv;
        *self.target_executable.lock().unwrap_or_else(|p| p.into_inner()) = Some(target);
    }

    /// Arms the run loop. Must happen before `run_loop`, so a stop request
    /// arriving first is not lost.
    pub fn activate(&self) {
        self.is_running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn cd_to_working_dir(&self) {
        // originate from workdir or from the exe's directory, never from
        // wherever the service manager happened to start us
        if let Err(e) = env::set_current_dir(&self.exe_dir) {
            self.logger.error(
                "Supervisor::cd_to_working_dir",
                format!(
                    "failed to change directory to the folder where the svcwatchdog binary is ({}): {e}",
                    self.exe_dir.display()
                ),
            );
            return;
        }
        if let Err(e) = env::set_current_dir(&self.working_directory) {
            self.logger.error(
                "Supervisor::cd_to_working_dir",
                format!(
                    "failed to change directory to the working folder {}: {e}",
                    self.working_directory.display()
                ),
            );
        }
    }

    /// The supervision loop: spawn, watch, terminate, repeat. Exits when the
    /// running flag is cleared and the current child has been dealt with.
    pub fn run_loop(&self) {
        let lg = &self.logger;

        let target = {
            let target = self.target_executable.lock().unwrap_or_else(|p| p.into_inner());
            target.clone()
        };
        let argv = self.argv.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let Some(target) = target else {
            lg.error("Supervisor::run_loop", "parameters missing, check configuration");
            while self.is_running.load(Ordering::SeqCst) {
                self.loop_trigger.wait_timeout(1000);
            }
            return;
        };

        self.cd_to_working_dir();

        let watchdog_timeout: i64 = self.cfg.get_number(&self.section, "watchdogTimeout", -1);
        lg.info("Supervisor::run_loop", format!("watchdogTimeout={watchdog_timeout}"));

        // if UDP liveness is configured, listen on an OS-chosen loopback port
        let mut watchdog: Option<(UdpSocket, u16, String)> = None;
        if watchdog_timeout > 0 {
            // not much of a secret, but it should do
            let secret = format!("{}{}", rand::random::<u64>(), steady_time_ms());
            if let Some((socket, port)) = start_udp_watchdog(lg) {
                lg.info(
                    "Supervisor::run_loop",
                    format!("listening on 127.0.0.1:{port} (UDP)"),
                );
                watchdog = Some((socket, port, secret));
            }
        }

        let event_name = shutdown_event_name(&self.working_directory, steady_time_ms());
        match ShutdownEvent::create(&event_name) {
            Ok(event) => {
                let mut slot = self.shutdown_event.lock().unwrap_or_else(|p| p.into_inner());
                *slot = Some(event);
            }
            Err(e) => {
                // graceful signaling degrades to a no-op; the kill deadline
                // still enforces termination
                lg.error(
                    "Supervisor::run_loop",
                    format!("failed to create shutdown event {event_name}: {e:#}"),
                );
            }
        }

        while self.is_running.load(Ordering::SeqCst) {
            {
                let slot = self.shutdown_event.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(event) = slot.as_ref() {
                    // might be signaled by the previous watchdog-initiated shutdown
                    event.reset_event();
                }
            }
            // kill time might be set by the previous watchdog-initiated shutdown as well
            self.kill_time.store(0, Ordering::SeqCst);

            lg.info("Supervisor::run_loop", format!("starting {}", target.display()));
            let child = self.spawn_child(&target, &argv, watchdog.as_ref(), &event_name);

            self.loop_trigger.wait_timeout(POST_SPAWN_SETTLE_MS);

            let mut exit_status: Option<ExitStatus> = None;
            if let Some(mut child) = child {
                exit_status = self.watch_child(&mut child, watchdog.as_ref(), watchdog_timeout);

                if exit_status.is_none() {
                    lg.warning("Supervisor::run_loop", "forcibly terminating child process");
                }
                // try to terminate the child in any case - better safe than sorry
                let _ = child.kill();
                thread::sleep(Duration::from_millis(50));
                let _ = child.wait();
            }

            let exit_text = exit_status.map(describe_exit).unwrap_or_else(|| "unknown".to_string());
            let level = if self.is_running.load(Ordering::SeqCst) {
                LogLevel::Warning
            } else {
                LogLevel::Information
            };
            lg.log(
                level,
                "Supervisor::run_loop",
                &format!("{} died, exit code {exit_text}", target.display()),
            );

            if self.is_running.load(Ordering::SeqCst) {
                let restart_delay: u64 =
                    self.cfg
                        .get_number(&self.section, "restartDelay", DEFAULT_RESTART_DELAY_MS);
                lg.debug(
                    "Supervisor::run_loop",
                    format!("waiting {restart_delay} ms before restarting"),
                );
                self.loop_trigger.wait_timeout(restart_delay);
            }
        }

        // release the per-run resources; the UDP socket goes out of scope here
        let mut slot = self.shutdown_event.lock().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }

    fn spawn_child(
        &self,
        target: &Path,
        argv: &[String],
        watchdog: Option<&(UdpSocket, u16, String)>,
        event_name: &str,
    ) -> Option<Child> {
        let mut command = Command::new(target);
        command.args(&argv[1..]);
        command.env(ENV_SHUTDOWN_EVENT, event_name);
        if let Some((_, port, secret)) = watchdog {
            command.env(ENV_WATCHDOG_PORT, port.to_string());
            command.env(ENV_WATCHDOG_SECRET, secret);
        }
        match command.spawn() {
            Ok(child) => Some(child),
            Err(e) => {
                self.logger.error(
                    "Supervisor::spawn_child",
                    format!("failed to start {}: {e}", target.display()),
                );
                None
            }
        }
    }

    /// Polls the child roughly every 200 ms until it exits or the kill
    /// deadline is reached. While the watchdog is active and no shutdown is
    /// pending, pings are drained and a starved liveness window initiates a
    /// graceful shutdown.
    fn watch_child(
        &self,
        child: &mut Child,
        watchdog: Option<&(UdpSocket, u16, String)>,
        watchdog_timeout: i64,
    ) -> Option<ExitStatus> {
        let lg = &self.logger;
        let mut next_ping = steady_time_ms() + watchdog_timeout.max(0) as u64;

        loop {
            self.loop_trigger.wait_timeout(POLL_TICK_MS);

            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    lg.warning(
                        "Supervisor::watch_child",
                        format!("failed to query the child exit status: {e}"),
                    );
                }
            }

            let now = steady_time_ms();
            let kill_time = self.kill_time.load(Ordering::SeqCst);
            if kill_time != 0 && now >= kill_time {
                return None;
            }

            if let Some((socket, _, secret)) = watchdog {
                if kill_time == 0 {
                    while receive_udp_ping(socket, secret, lg) {
                        // the process is alive and well
                        lg.verbose("Supervisor::watch_child", "received watchdog ping");
                        next_ping = now + watchdog_timeout.max(0) as u64;
                    }
                    if now > next_ping {
                        lg.warning(
                            "Supervisor::watch_child",
                            "child process stopped sending valid UDP ping packets, restarting it",
                        );
                        self.initiate_process_shutdown();
                    }
                }
            }
        }
    }

    /// Signals the shutdown event (best-effort; its absence is tolerated) and
    /// arms the forced-termination deadline.
    pub fn initiate_process_shutdown(&self) {
        let shutdown_time: u64 =
            self.cfg
                .get_number(&self.section, "shutdownTime", DEFAULT_SHUTDOWN_TIME_MS);
        self.logger.info(
            "Supervisor::initiate_process_shutdown",
            format!("signalling the process and setting timeout to now + {shutdown_time} ms"),
        );
        {
            let slot = self.shutdown_event.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(event) = slot.as_ref() {
                event.set_event();
            }
        }
        self.kill_time.store(steady_time_ms() + shutdown_time, Ordering::SeqCst);
    }
}

impl ServiceHandler for Supervisor {
    fn on_init(&self) -> bool {
        self.logger.debug("Supervisor::on_init", "doing nothing");
        true
    }

    fn run(&self) {
        self.run_loop();
    }

    fn on_stop(&self) {
        self.logger.debug("Supervisor::on_stop", "stopping service");
        self.is_running.store(false, Ordering::SeqCst);
        self.cd_to_working_dir();
        self.initiate_process_shutdown();
        self.loop_trigger.set_event();
    }

    fn on_shutdown(&self) {
        self.logger.debug("Supervisor::on_shutdown", "shutting down");
        self.on_stop();
    }

    fn on_pause(&self) {
        self.logger.verbose("Supervisor::on_pause", "doing nothing");
    }

    fn on_continue(&self) {
        self.logger.verbose("Supervisor::on_continue", "doing nothing");
    }

    fn on_user_control(&self, opcode: u32) -> bool {
        self.logger.debug("Supervisor::on_user_control", format!("opcode={opcode}"));
        self.cd_to_working_dir();
        false
    }
}

/// Builds the cross-process event name: the absolute working directory plus a
/// monotonic timestamp, reduced to lowercase alphanumerics, behind a fixed
/// prefix.
fn shutdown_event_name(working_directory: &Path, stamp: u64) -> String {
    let raw = format!("{}{stamp}", working_directory.display());
    let mut name = String::from(SHUTDOWN_EVENT_PREFIX);
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_lowercase());
        }
    }
    name
}

/// First regular file named `name` in the `PATH`-style list wins.
fn resolve_on_path(path_var: &OsStr, name: &str) -> Option<PathBuf> {
    for dir in env::split_paths(path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn start_udp_watchdog(logger: &Logger) -> Option<(UdpSocket, u16)> {
    let socket = match UdpSocket::bind(("127.0.0.1", 0)) {
        Ok(socket) => socket,
        Err(e) => {
            logger.error("Supervisor::start_udp_watchdog", format!("bind failed: {e}"));
            return None;
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        logger.error(
            "Supervisor::start_udp_watchdog",
            format!("failed to make the watchdog socket non-blocking: {e}"),
        );
        return None;
    }
    match socket.local_addr() {
        Ok(addr) => Some((socket, addr.port())),
        Err(e) => {
            logger.error(
                "Supervisor::start_udp_watchdog",
                format!("failed to read the assigned port: {e}"),
            );
            None
        }
    }
}

/// Drains one datagram. A ping is valid iff the payload equals the current
/// secret byte-for-byte; anything else is normalized and logged.
fn receive_udp_ping(socket: &UdpSocket, secret: &str, logger: &Logger) -> bool {
    let mut buffer = [0u8; 1024];
    match socket.recv_from(&mut buffer) {
        Ok((received, _)) => {
            if buffer[..received] == *secret.as_bytes() {
                return true;
            }
            logger.warning(
                "Supervisor::receive_udp_ping",
                format!("received invalid ping data: {}", printable(&buffer[..received])),
            );
            false
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(e) => {
            logger.error("Supervisor::receive_udp_ping", format!("recvfrom failed: {e}"));
            false
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => match status.signal() {
            Some(signal) => format!("signal {signal}"),
            None => "unknown".to_string(),
        },
    }
}
