//! Cooperative shutdown shared between the lifecycle controller and the
//! protocol engine.
//!
//! There is no process-global state: everything hangs off clones of one
//! [`Shutdown`] token. Requesting shutdown flips the flag and shuts down
//! the registered socket descriptors so a blocking `accept` or `read`
//! returns immediately. A grace-period watchdog ends the process anyway
//! if the loops do not unwind in time.

use std::os::unix::io::RawFd;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::errors::Error;

/// Hard deadline between a termination signal and forced process exit.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

const NO_FD: i32 = -1;

struct Inner {
    requested: AtomicBool,
    listener: AtomicI32,
    client: AtomicI32,
}

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                listener: AtomicI32::new(NO_FD),
                client: AtomicI32::new(NO_FD),
            }),
        }
    }

    /// Whether shutdown has been requested. Serve loops consult this
    /// between requests, and blocking calls consult it after failing to
    /// tell a deliberate shutdown apart from a genuine fault.
    pub fn requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Request cooperative shutdown and unblock pending accepts/reads by
    /// shutting down the registered descriptors.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        for slot in [&self.inner.listener, &self.inner.client] {
            let fd = slot.load(Ordering::SeqCst);
            if fd != NO_FD {
                // SHUT_RDWR makes a blocked accept/read return immediately;
                // the descriptor itself stays owned by its socket object.
                unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
            }
        }
    }

    pub(crate) fn register_listener(&self, fd: RawFd) {
        self.inner.listener.store(fd, Ordering::SeqCst);
    }

    pub(crate) fn register_client(&self, fd: RawFd) {
        self.inner.client.store(fd, Ordering::SeqCst);
    }

    /// Forget a client descriptor when its connection ends, so a later
    /// shutdown cannot touch a reused fd number.
    pub(crate) fn clear_client(&self, fd: RawFd) {
        let _ = self
            .inner
            .client
            .compare_exchange(fd, NO_FD, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Turn SIGINT/SIGTERM into a shutdown request, with a forced exit
    /// after `grace` as the backstop for blocking calls that survived the
    /// descriptor shutdown.
    pub fn install_signal_handlers(&self, grace: Duration) -> Result<(), Error> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Signal)?;
        let token = self.clone();
        thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                if signals.forever().next().is_some() {
                    info!("termination signal received");
                    token.request();
                    thread::sleep(grace);
                    // a deliberate shutdown is a success, even when forced
                    process::exit(0);
                }
            })
            .map_err(Error::Signal)?;
        Ok(())
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn request_sets_the_flag_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.requested());
        shutdown.request();
        assert!(shutdown.requested());
        // idempotent, also with no registered descriptors
        shutdown.request();
        assert!(shutdown.requested());
    }

    #[test]
    fn clones_share_the_flag() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        shutdown.request();
        assert!(clone.requested());
    }

    #[test]
    fn request_leaves_a_cleared_descriptor_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut served, _) = listener.accept().unwrap();

        let shutdown = Shutdown::new();
        shutdown.register_client(served.as_raw_fd());
        shutdown.clear_client(served.as_raw_fd());
        shutdown.request();

        // the descriptor was forgotten before the request, so the socket
        // must still be fully usable
        served.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn clear_client_ignores_foreign_fd() {
        let shutdown = Shutdown::new();
        shutdown.register_client(42);
        shutdown.clear_client(7);
        assert_eq!(shutdown.inner.client.load(Ordering::SeqCst), 42);
        shutdown.clear_client(42);
        assert_eq!(shutdown.inner.client.load(Ordering::SeqCst), NO_FD);
    }
}
