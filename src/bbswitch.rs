use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram as StdUnixDatagram};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::time;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum PowerSwitchError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bbswitchd communication failed: {0}")]
    Io(#[from] io::Error),
    #[error("No reply from bbswitchd after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
}

/// Datagram client of the bbswitchd power switching daemon.
///
/// Requests are NUL-terminated ASCII commands (`on`, `off`, `status`). A
/// switch succeeds when the reply is empty or a single NUL; anything else is
/// the daemon's error message.
#[derive(Clone, Debug)]
pub struct BbswitchClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl BbswitchClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends a raw command and returns the reply, if the daemon sent one.
    pub async fn send_command(&self, command: &str) -> Result<Option<String>, PowerSwitchError> {
        let reply = self.exchange(command).await?;
        let text = String::from_utf8_lossy(&reply);
        let text = text.trim_end_matches('\0');
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    /// Powers the discrete GPU on or off.
    pub async fn set_gpu_state(&self, enabled: bool) -> Result<(), PowerSwitchError> {
        let command = if enabled { "on" } else { "off" };
        log::info!("Requesting bbswitchd to switch GPU {}", command);
        match self.send_command(command).await? {
            Some(message) => Err(PowerSwitchError::Rejected(message)),
            None => Ok(()),
        }
    }

    async fn exchange(&self, command: &str) -> Result<Vec<u8>, PowerSwitchError> {
        let socket = local_socket()?;
        socket
            .connect(&self.socket_path)
            .map_err(|source| PowerSwitchError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let mut request = command.as_bytes().to_vec();
        request.push(0);
        socket.send(&request).await?;

        let mut buf = [0u8; 1024];
        let len = time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| PowerSwitchError::Timeout(self.timeout))??;
        Ok(buf[..len].to_vec())
    }
}

// The daemon replies to the sender address, so the socket needs a name
fn local_socket() -> io::Result<UnixDatagram> {
    let name = format!(
        "dgm-{}-{}",
        std::process::id(),
        NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)
    );
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let socket = StdUnixDatagram::bind_addr(&addr)?;
    socket.set_nonblocking(true)?;
    UnixDatagram::from_std(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    // Answers one datagram with `reply` and hands back what it received
    fn serve_once(path: &Path, reply: &'static [u8]) -> thread::JoinHandle<Vec<u8>> {
        let server = StdUnixDatagram::bind(path).unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).unwrap();
            server.send_to_addr(reply, &peer).unwrap();
            buf[..len].to_vec()
        })
    }

    #[tokio::test]
    async fn switch_on_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbswitchd.sock");
        let server = serve_once(&path, b"\0");

        BbswitchClient::new(&path, WAIT).set_gpu_state(true).await.unwrap();
        assert_eq!(server.join().unwrap(), b"on\0");
    }

    #[tokio::test]
    async fn daemon_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbswitchd.sock");
        let server = serve_once(&path, b"Device or resource busy\0");

        let err = BbswitchClient::new(&path, WAIT).set_gpu_state(false).await.unwrap_err();
        assert_eq!(server.join().unwrap(), b"off\0");
        assert!(matches!(&err, PowerSwitchError::Rejected(message) if message == "Device or resource busy"));
        assert_eq!(err.to_string(), "Device or resource busy");
    }

    #[tokio::test]
    async fn status_returns_the_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbswitchd.sock");
        let server = serve_once(&path, b"0000:01:00.0 OFF\0");

        let reply = BbswitchClient::new(&path, WAIT).send_command("status").await.unwrap();
        assert_eq!(reply.as_deref(), Some("0000:01:00.0 OFF"));
        assert_eq!(server.join().unwrap(), b"status\0");
    }

    #[tokio::test]
    async fn missing_daemon_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let client = BbswitchClient::new(dir.path().join("absent.sock"), WAIT);
        let err = client.set_gpu_state(true).await.unwrap_err();
        assert!(matches!(err, PowerSwitchError::Connect { .. }));
    }

    #[tokio::test]
    async fn silent_daemon_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbswitchd.sock");
        let _server = StdUnixDatagram::bind(&path).unwrap();

        let client = BbswitchClient::new(&path, Duration::from_millis(50));
        let err = client.set_gpu_state(true).await.unwrap_err();
        assert!(matches!(err, PowerSwitchError::Timeout(_)));
    }
}
