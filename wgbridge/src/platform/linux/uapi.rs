use async_trait::async_trait;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::platform::traits::{ControlListener, ControlSocketProvider};

/// Directory holding per-interface control sockets
pub const SOCKET_DIR: &str = "/var/run/wireguard";

/// Unix-domain control sockets named `<dir>/<interface>.sock`
#[derive(Debug, Clone)]
pub struct UnixControlSockets {
    dir: PathBuf,
}

impl Default for UnixControlSockets {
    fn default() -> Self {
        Self::new(SOCKET_DIR)
    }
}

impl UnixControlSockets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the control socket for an interface
    pub fn socket_path(&self, interface: &str) -> PathBuf {
        socket_path_in(&self.dir, interface)
    }
}

pub fn socket_path_in(dir: &Path, interface: &str) -> PathBuf {
    dir.join(format!("{}.sock", interface))
}

/// Bound control socket that is not accepting yet. Unlinks its file if
/// dropped before [`ControlSocketProvider::listen`] takes it.
#[derive(Debug)]
pub struct OpenControlSocket {
    listener: Option<StdUnixListener>,
    path: PathBuf,
}

impl Drop for OpenControlSocket {
    fn drop(&mut self) {
        if self.listener.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl ControlSocketProvider for UnixControlSockets {
    type Socket = OpenControlSocket;
    type Listener = UnixControlListener;

    fn open(&self, interface: &str) -> io::Result<OpenControlSocket> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.dir)?;

        let path = self.socket_path(interface);

        // A socket that still answers belongs to a live device
        if StdUnixStream::connect(&path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("control socket {} is in use", path.display()),
            ));
        }
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = StdUnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;

        Ok(OpenControlSocket {
            listener: Some(listener),
            path,
        })
    }

    fn listen(
        &self,
        _interface: &str,
        mut socket: OpenControlSocket,
    ) -> io::Result<UnixControlListener> {
        let std_listener = socket
            .listener
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket already consumed"))?;
        let path = std::mem::take(&mut socket.path);

        let listener = match UnixListener::from_std(std_listener) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        Ok(UnixControlListener {
            listener,
            path,
            closed: CancellationToken::new(),
            unlinked: AtomicBool::new(false),
        })
    }
}

/// Accepting control socket
#[derive(Debug)]
pub struct UnixControlListener {
    listener: UnixListener,
    path: PathBuf,
    closed: CancellationToken,
    unlinked: AtomicBool,
}

impl UnixControlListener {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ControlListener for UnixControlListener {
    type Conn = UnixStream;

    async fn accept(&self) -> io::Result<UnixStream> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "control socket closed",
            )),
            result = self.listener.accept() => result.map(|(stream, _)| stream),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        if !self.unlinked.swap(true, Ordering::SeqCst) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for UnixControlListener {
    fn drop(&mut self) {
        self.close();
    }
}
