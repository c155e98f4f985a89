use anyhow::Context as _;
use std::io::{ErrorKind, Read as _, Write as _};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ACCEPT_POLL_MS: u64 = 100;

/// Named, cross-process, manual-reset event.
///
/// The name is bound in the Linux abstract socket namespace, so no filesystem
/// cleanup is ever needed and the name can carry arbitrary characters. A
/// consumer connects to the name (exported via `SHUTDOWN_EVENT`) and blocks on
/// a one-byte read; the byte arrives when the event is signaled. While the
/// event stays signaled, new connections complete immediately. `reset_event`
/// parks new connections again.
///
/// One producer (the supervisor), N consumers (in practice only the child).
pub struct ShutdownEvent {
    name: String,
    signaled: Arc<AtomicBool>,
    parked: Arc<Mutex<Vec<UnixStream>>>,
    closing: Arc<AtomicBool>,
    acceptor: Option<thread::JoinHandle<()>>,
}

impl ShutdownEvent {
    pub fn create(name: &str) -> anyhow::Result<ShutdownEvent> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())
            .with_context(|| format!("invalid event name {name}"))?;
        let listener = UnixListener::bind_addr(&addr)
            .with_context(|| format!("failed to bind event socket {name}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to make the event socket non-blocking")?;

        let signaled = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let signaled = Arc::clone(&signaled);
            let parked = Arc::clone(&parked);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("shutdown-event".into())
                .spawn(move || acceptor_loop(listener, signaled, parked, closing))
                .context("failed to start the event acceptor thread")?
        };

        Ok(ShutdownEvent {
            name: name.to_string(),
            signaled,
            parked,
            closing,
            acceptor: Some(acceptor),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the event: every parked consumer is released, and consumers
    /// connecting later complete immediately until the event is reset.
    pub fn set_event(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        let mut parked = self.parked.lock().unwrap_or_else(|p| p.into_inner());
        for mut conn in parked.drain(..) {
            let _ = conn.write_all(b"1");
        }
    }

    pub fn reset_event(&self) {
        self.signaled.store(false, Ordering::SeqCst);
    }

    /// Consumer side: blocks until the named event is signaled or the timeout
    /// expires. Returns true if the event was observed signaled.
    pub fn wait(name: &str, timeout: Duration) -> bool {
        let Ok(addr) = SocketAddr::from_abstract_name(name.as_bytes()) else {
            return false;
        };
        let Ok(mut stream) = UnixStream::connect_addr(&addr) else {
            return false;
        };
        if stream.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        matches!(stream.read(&mut byte), Ok(n) if n > 0)
    }
}

fn acceptor_loop(
    listener: UnixListener,
    signaled: Arc<AtomicBool>,
    parked: Arc<Mutex<Vec<UnixStream>>>,
    closing: Arc<AtomicBool>,
) {
    while !closing.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut conn, _addr)) => {
                if signaled.load(Ordering::SeqCst) {
                    let _ = conn.write_all(b"1");
                } else {
                    let mut parked = parked.lock().unwrap_or_else(|p| p.into_inner());
                    parked.push(conn);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
        }
    }
}

impl Drop for ShutdownEvent {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}
