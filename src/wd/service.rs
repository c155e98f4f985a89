use crate::wd::logger::Logger;
use anyhow::Context as _;
use signal_hook::consts::signal::{SIGCONT, SIGHUP, SIGINT, SIGTERM, SIGTSTP, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use std::ffi::OsStr;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// First opcode of the user-control range.
pub const SERVICE_CONTROL_USER: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    StopPending,
    Stopped,
}

impl ServiceState {
    fn as_str(self) -> &'static str {
        match self {
            ServiceState::StartPending => "start-pending",
            ServiceState::Running => "running",
            ServiceState::StopPending => "stop-pending",
            ServiceState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControl {
    Stop,
    Pause,
    Continue,
    Interrogate,
    Shutdown,
    User(u32),
}

/// The seam between the service adapter and whatever does the actual work.
pub trait ServiceHandler: Send + Sync {
    fn on_init(&self) -> bool {
        true
    }
    fn run(&self);
    fn on_stop(&self);
    fn on_shutdown(&self) {
        self.on_stop();
    }
    fn on_pause(&self) {}
    fn on_continue(&self) {}
    /// Returns true if the opcode was handled.
    fn on_user_control(&self, _opcode: u32) -> bool {
        false
    }
}

/// Bridges the OS service manager and a [`ServiceHandler`].
///
/// Control requests arrive as signals (SIGTERM/SIGINT map to Stop, SIGHUP to
/// Shutdown, SIGUSR1 to Interrogate, SIGTSTP/SIGCONT to the no-op
/// Pause/Continue pair, SIGUSR2 to the user-control range). Status is
/// reported back through the `NOTIFY_SOCKET` datagram protocol when the
/// process runs under a service manager; otherwise publication is a no-op.
pub struct ServiceAdapter {
    service_name: String,
    handler: Arc<dyn ServiceHandler>,
    logger: Logger,
    state: Mutex<ServiceState>,
    exit_code: AtomicI32,
}

impl ServiceAdapter {
    pub fn new(
        service_name: &str,
        handler: Arc<dyn ServiceHandler>,
        logger: Logger,
    ) -> Arc<ServiceAdapter> {
        Arc::new(ServiceAdapter {
            service_name: service_name.to_string(),
            handler,
            logger,
            state: Mutex::new(ServiceState::Stopped),
            exit_code: AtomicI32::new(0),
        })
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn set_status(&self, state: ServiceState) {
        self.logger.debug(
            "ServiceAdapter::set_status",
            format!("service={}, state={}", self.service_name, state.as_str()),
        );
        {
            let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
            *current = state;
        }
        self.publish_status(state);
    }

    fn publish_status(&self, state: ServiceState) {
        let Some(socket) = std::env::var_os("NOTIFY_SOCKET") else {
            return;
        };
        let payload = match state {
            ServiceState::StartPending => "STATUS=starting".to_string(),
            ServiceState::Running => "READY=1\nSTATUS=running".to_string(),
            ServiceState::StopPending => "STOPPING=1\nSTATUS=stopping".to_string(),
            ServiceState::Stopped => {
                format!("STATUS=stopped (exit code {})", self.exit_code.load(Ordering::SeqCst))
            }
        };
        if let Err(e) = sd_notify(&socket, &payload) {
            // never let a reporting problem take the service down
            self.logger.debug(
                "ServiceAdapter::publish_status",
                format!("status notification failed: {e:#}"),
            );
        }
    }

    /// Routes one control request to the handler, then republishes status,
    /// mirroring the classic dispatcher contract. Must return promptly; the
    /// heavy lifting happens on the supervisor thread.
    pub fn handle_control(&self, control: ServiceControl) {
        match control {
            ServiceControl::Stop => {
                self.set_status(ServiceState::StopPending);
                self.handler.on_stop();
            }
            ServiceControl::Shutdown => {
                self.set_status(ServiceState::StopPending);
                self.handler.on_shutdown();
            }
            ServiceControl::Pause => self.handler.on_pause(),
            ServiceControl::Continue => self.handler.on_continue(),
            ServiceControl::Interrogate => {
                let state = self.state();
                self.publish_status(state);
            }
            ServiceControl::User(opcode) => {
                if opcode < SERVICE_CONTROL_USER || !self.handler.on_user_control(opcode) {
                    self.logger.error(
                        "ServiceAdapter::handle_control",
                        format!("unknown user control code {opcode}"),
                    );
                }
            }
        }
    }

    /// The service entry point: drives the handler through the
    /// StartPending/Running/StopPending/Stopped state machine and returns the
    /// exit code to report to the caller.
    pub fn service_main(self: &Arc<Self>) -> anyhow::Result<i32> {
        self.logger.verbose("ServiceAdapter::service_main", "entering");
        self.set_status(ServiceState::StartPending);

        let signals = self.start_control_listener()?;

        if self.handler.on_init() {
            self.set_status(ServiceState::Running);
            self.handler.run();
        } else {
            self.logger.error("ServiceAdapter::service_main", "initialization failed");
            self.set_exit_code(1);
        }

        self.set_status(ServiceState::Stopped);
        signals.close();
        self.logger.verbose("ServiceAdapter::service_main", "done");
        Ok(self.exit_code.load(Ordering::SeqCst))
    }

    fn start_control_listener(
        self: &Arc<Self>,
    ) -> anyhow::Result<signal_hook::iterator::Handle> {
        let mut signals = Signals::new([
            SIGTERM, SIGINT, SIGHUP, SIGUSR1, SIGUSR2, SIGTSTP, SIGCONT,
        ])
        .context("failed to register control signal handlers")?;
        let handle = signals.handle();
        let adapter = Arc::clone(self);
        thread::Builder::new()
            .name("svc-control".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let control = match signal {
                        SIGTERM | SIGINT => ServiceControl::Stop,
                        SIGHUP => ServiceControl::Shutdown,
                        SIGUSR1 => ServiceControl::Interrogate,
                        SIGTSTP => ServiceControl::Pause,
                        SIGCONT => ServiceControl::Continue,
                        SIGUSR2 => ServiceControl::User(SERVICE_CONTROL_USER),
                        other => {
                            adapter.logger.error(
                                "ServiceAdapter::control_listener",
                                format!("unexpected signal {other}"),
                            );
                            continue;
                        }
                    };
                    adapter.logger.debug(
                        "ServiceAdapter::control_listener",
                        format!("signal {signal} -> {control:?}"),
                    );
                    adapter.handle_control(control);
                }
            })
            .context("failed to start the control listener thread")?;
        Ok(handle)
    }
}

/// True when a service manager is driving this process.
pub fn under_service_manager() -> bool {
    std::env::var_os("NOTIFY_SOCKET").is_some() || std::env::var_os("INVOCATION_ID").is_some()
}

/// Minimal sd_notify: one datagram to the socket named by `NOTIFY_SOCKET`
/// (a leading `@` selects the abstract namespace).
fn sd_notify(socket_name: &OsStr, payload: &str) -> anyhow::Result<()> {
    let socket = UnixDatagram::unbound().context("failed to create notification socket")?;
    let bytes = socket_name.as_bytes();
    if let Some(abstract_name) = bytes.strip_prefix(b"@") {
        let addr = SocketAddr::from_abstract_name(abstract_name)
            .context("invalid abstract notification socket name")?;
        socket
            .send_to_addr(payload.as_bytes(), &addr)
            .context("failed to send status notification")?;
    } else {
        socket
            .send_to(payload.as_bytes(), Path::new(socket_name))
            .context("failed to send status notification")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wd::config::ConfigStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn quiet_logger() -> Logger {
        let cfg = ConfigStore::from_value(json!({ "log": { "minConsoleLevel": 6 } }));
        Logger::configure(&cfg, "log")
    }

    #[derive(Default)]
    struct RecordingHandler {
        runs: AtomicUsize,
        stops: AtomicUsize,
        shutdowns: AtomicUsize,
        user_controls: AtomicUsize,
    }

    impl ServiceHandler for RecordingHandler {
        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.on_stop();
        }

        fn on_user_control(&self, opcode: u32) -> bool {
            self.user_controls.fetch_add(1, Ordering::SeqCst);
            opcode == SERVICE_CONTROL_USER
        }
    }

    #[test]
    fn service_main_walks_the_state_machine() {
        let handler = Arc::new(RecordingHandler::default());
        let adapter = ServiceAdapter::new("testsvc", handler.clone(), quiet_logger());
        let code = adapter.service_main().unwrap();
        assert_eq!(code, 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.state(), ServiceState::Stopped);
    }

    #[test]
    fn stop_and_shutdown_reach_the_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let adapter = ServiceAdapter::new("testsvc", handler.clone(), quiet_logger());
        adapter.handle_control(ServiceControl::Stop);
        assert_eq!(adapter.state(), ServiceState::StopPending);
        assert_eq!(handler.stops.load(Ordering::SeqCst), 1);

        adapter.handle_control(ServiceControl::Shutdown);
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pause_continue_and_interrogate_are_harmless() {
        let handler = Arc::new(RecordingHandler::default());
        let adapter = ServiceAdapter::new("testsvc", handler.clone(), quiet_logger());
        adapter.handle_control(ServiceControl::Pause);
        adapter.handle_control(ServiceControl::Continue);
        adapter.handle_control(ServiceControl::Interrogate);
        assert_eq!(handler.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_controls_are_forwarded() {
        let handler = Arc::new(RecordingHandler::default());
        let adapter = ServiceAdapter::new("testsvc", handler.clone(), quiet_logger());
        adapter.handle_control(ServiceControl::User(SERVICE_CONTROL_USER));
        assert_eq!(handler.user_controls.load(Ordering::SeqCst), 1);
        // below the user range the handler is not consulted
        adapter.handle_control(ServiceControl::User(42));
        assert_eq!(handler.user_controls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sd_notify_sends_one_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        sd_notify(path.as_os_str(), "READY=1\nSTATUS=running").unwrap();
        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        let payload = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(payload.contains("READY=1"));
        assert!(payload.contains("STATUS=running"));
    }
}
