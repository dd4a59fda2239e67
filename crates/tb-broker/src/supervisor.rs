//! Process supervisor notifications
//!
//! The daemon runs under a supervisor that expects a readiness
//! notification once startup completes and then periodic liveness pings.
//! Both are datagrams sent to the socket named by `NOTIFY_SOCKET`; when it
//! is unset the notifier does nothing.
//!
//! The liveness task runs on its own and never waits on allocation, power
//! or console work, so a long driver call cannot starve it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

#[cfg(unix)]
type Socket = (UnixDatagram, String);
#[cfg(not(unix))]
type Socket = std::convert::Infallible;

/// Sends state notifications to the process supervisor
pub struct SupervisorNotifier {
    socket: Option<Socket>,
    /// Ping interval requested by the supervisor, if any
    watchdog: Option<Duration>,
}

impl SupervisorNotifier {
    /// Notifier configured from `NOTIFY_SOCKET` and `WATCHDOG_USEC`
    pub fn from_env() -> Self {
        let watchdog = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|usec| usec.parse::<u64>().ok())
            .filter(|usec| *usec > 0)
            .map(Duration::from_micros);
        let socket = std::env::var("NOTIFY_SOCKET").ok().and_then(open);
        Self { socket, watchdog }
    }

    /// Notifier that never sends anything
    pub fn disabled() -> Self {
        Self {
            socket: None,
            watchdog: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Interval to ping at: the configured one, or more often if the
    /// supervisor's watchdog demands it
    pub fn ping_interval(&self, configured: Duration) -> Duration {
        match self.watchdog {
            Some(watchdog) => configured.min(watchdog / 2),
            None => configured,
        }
    }

    /// Send a raw `KEY=VALUE` notification
    pub fn notify(&self, state: &str) -> io::Result<()> {
        match &self.socket {
            Some(socket) => send(socket, state.as_bytes()),
            None => Ok(()),
        }
    }

    pub fn ready(&self) {
        if let Err(e) = self.notify("READY=1") {
            tracing::warn!("Failed to notify supervisor of readiness: {}", e);
        }
    }

    pub fn stopping(&self) {
        if let Err(e) = self.notify("STOPPING=1") {
            tracing::debug!("Failed to notify supervisor of shutdown: {}", e);
        }
    }
}

#[cfg(unix)]
fn open(path: String) -> Option<Socket> {
    match UnixDatagram::unbound() {
        Ok(socket) => Some((socket, path)),
        Err(e) => {
            tracing::warn!("Cannot create supervisor notification socket: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn open(_path: String) -> Option<Socket> {
    tracing::warn!("Supervisor notifications need Unix domain sockets; ignoring NOTIFY_SOCKET");
    None
}

#[cfg(unix)]
fn send((socket, path): &Socket, message: &[u8]) -> io::Result<()> {
    // A leading '@' names a socket in the abstract namespace
    match path.strip_prefix('@') {
        Some(name) => send_abstract(socket, name, message),
        None => socket.send_to(message, path).map(|_| ()),
    }
}

#[cfg(not(unix))]
fn send(socket: &Socket, _message: &[u8]) -> io::Result<()> {
    match *socket {}
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, message: &[u8]) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.send_to_addr(message, &addr).map(|_| ())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn send_abstract(_socket: &UnixDatagram, _name: &str, _message: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract notification sockets need Linux",
    ))
}

/// Ping the supervisor every `interval` until `cancel` fires
pub async fn run_liveness(
    notifier: Arc<SupervisorNotifier>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if !notifier.is_enabled() {
        tracing::debug!("No supervisor socket, liveness pings disabled");
        return;
    }

    let interval = notifier.ping_interval(interval);
    let mut ticker = tokio::time::interval(interval);
    tracing::info!("Starting supervisor liveness pings (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = notifier.notify("WATCHDOG=1") {
                    tracing::warn!("Failed to send liveness ping: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Liveness task shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = SupervisorNotifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(notifier.notify("READY=1").is_ok());
    }

    #[test]
    fn test_watchdog_shortens_interval() {
        let mut notifier = SupervisorNotifier::disabled();
        assert_eq!(
            notifier.ping_interval(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        notifier.watchdog = Some(Duration::from_secs(8));
        assert_eq!(
            notifier.ping_interval(Duration::from_secs(10)),
            Duration::from_secs(4)
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pings_reach_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let notifier = Arc::new(SupervisorNotifier {
            socket: Some((UnixDatagram::unbound().unwrap(), path.display().to_string())),
            watchdog: None,
        });
        notifier.ready();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_liveness(
            Arc::clone(&notifier),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");

        cancel.cancel();
        task.await.unwrap();
    }
}
