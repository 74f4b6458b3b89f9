use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use boringtun::x25519::StaticSecret;

use crate::device::{Device, DeviceFactory};
use crate::error::UapiError;
use crate::logging::SharedLogger;
use crate::platform::VirtualInterface;
use crate::runtime::{run_worker, SessionManager};
use crate::tunnel::uapi::{status_line, InterfaceDump, Operation, SetRequest};
use crate::{log_error, log_verbose};

/// Mutable interface state shared by the control plane and the data plane
#[derive(Default)]
pub struct DeviceState {
    pub private_key: Option<StaticSecret>,
    /// Configured port before bind, actual port after
    pub listen_port: u16,
    pub fwmark: u32,
    pub sessions: SessionManager,
}

impl DeviceState {
    pub fn dump(&self) -> InterfaceDump {
        InterfaceDump {
            private_key: self.private_key.as_ref().map(|key| key.to_bytes()),
            listen_port: self.listen_port,
            fwmark: self.fwmark,
            peers: self.sessions.iter().map(|session| session.dump()).collect(),
        }
    }
}

/// Userspace WireGuard device on top of a virtual interface
pub struct TunnelDevice<T> {
    /// Present until the data plane takes it over
    interface: Mutex<Option<T>>,
    state: Arc<Mutex<DeviceState>>,
    socket: watch::Sender<Option<Arc<UdpSocket>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    done: CancellationToken,
    logger: SharedLogger,
}

impl<T: VirtualInterface> TunnelDevice<T> {
    pub fn new(interface: T, logger: SharedLogger) -> Self {
        let (socket, _) = watch::channel(None);
        Self {
            interface: Mutex::new(Some(interface)),
            state: Arc::new(Mutex::new(DeviceState::default())),
            socket,
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            logger,
        }
    }

    fn is_bound(&self) -> bool {
        self.socket.borrow().is_some()
    }

    /// Hand a freshly bound socket to the data plane. Refused once the
    /// device is shutting down, so a late handler cannot leak a socket.
    fn install_socket(&self, state: &mut DeviceState, socket: UdpSocket) -> io::Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is closed"));
        }
        state.listen_port = socket.local_addr()?.port();
        log_verbose!(self.logger, "UDP bound to port {}", state.listen_port);

        self.socket.send_replace(Some(Arc::new(socket)));
        Ok(())
    }

    async fn apply(&self, request: SetRequest) -> Result<(), UapiError> {
        let mut state = self.state.lock().await;

        // Socket changes go first: nothing is committed if they fail
        let fwmark = request.fwmark.unwrap_or(state.fwmark);
        match request.listen_port {
            Some(port) if self.is_bound() && port != state.listen_port => {
                let socket = bind_marked(port, fwmark)
                    .await
                    .map_err(|source| UapiError::PortInUse { port, source })?;
                self.install_socket(&mut state, socket)?;
            }
            Some(port) if !self.is_bound() => state.listen_port = port,
            _ if fwmark != state.fwmark => {
                if let Some(socket) = self.socket.borrow().as_deref() {
                    set_mark(socket, fwmark)?;
                }
            }
            _ => {}
        }
        state.fwmark = fwmark;

        if let Some(key) = request.private_key {
            state.private_key = key.map(StaticSecret::from);
            let local = state.private_key.clone();
            state.sessions.rebuild_all(local.as_ref());
        }

        if request.replace_peers {
            state.sessions.clear();
        }

        let local = state.private_key.clone();
        for peer in &request.peers {
            state.sessions.apply(peer, local.as_ref());
        }

        Ok(())
    }

    async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some((op, body)) = read_transaction(reader).await? {
            let reply = match Operation::parse(&op) {
                Ok(Operation::Get) => {
                    let dump = self.state.lock().await.dump();
                    dump.render() + &status_line(&Ok(()))
                }
                Ok(Operation::Set) => {
                    let result = self.apply_config(&body).await;
                    if let Err(e) = &result {
                        log_error!(self.logger, "Configuration rejected: {}", e);
                    }
                    status_line(&result)
                }
                Err(e) => {
                    log_error!(self.logger, "{}", e);
                    writer.write_all(status_line(&Err(e)).as_bytes()).await?;
                    return writer.flush().await;
                }
            };
            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: VirtualInterface> Device for TunnelDevice<T> {
    async fn apply_config(&self, config: &str) -> Result<(), UapiError> {
        // Nothing is applied unless the whole request parses
        let request = SetRequest::parse(config)?;
        self.apply(request).await
    }

    async fn mark_up(&self) -> io::Result<()> {
        let mut slot = self.interface.lock().await;
        let Some(interface) = slot.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "device is closed or already up",
            ));
        };
        interface.set_link_up().await?;

        {
            let mut state = self.state.lock().await;
            let socket = bind_marked(state.listen_port, state.fwmark).await?;
            self.install_socket(&mut state, socket)?;
        }

        let Some(interface) = slot.take() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "interface released"));
        };
        let worker = run_worker(
            interface,
            self.state.clone(),
            self.socket.subscribe(),
            self.shutdown.clone(),
            self.logger.clone(),
        );
        let done = self.done.clone();
        *self.worker.lock().await = Some(tokio::spawn(async move {
            worker.await;
            done.cancel();
        }));

        log_verbose!(self.logger, "Device up");
        Ok(())
    }

    async fn handle_connection<C>(&self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(conn);
        let mut reader = BufReader::new(reader);
        if let Err(e) = self.serve(&mut reader, &mut writer).await {
            tracing::debug!("UAPI connection ended: {}", e);
        }
        let _ = writer.shutdown().await;
    }

    async fn wait(&self) {
        self.done.cancelled().await
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                log_error!(self.logger, "Data plane task failed: {}", e);
            }
        }
        self.socket.send_replace(None);
        self.interface.lock().await.take();
        self.done.cancel();
    }
}

/// Builds [`TunnelDevice`]s for the controller
pub struct TunnelFactory;

impl<T: VirtualInterface> DeviceFactory<T> for TunnelFactory {
    type Device = TunnelDevice<T>;

    fn new_device(&self, interface: T, logger: SharedLogger) -> TunnelDevice<T> {
        TunnelDevice::new(interface, logger)
    }
}

/// Read one `op` line and its body up to the terminating empty line.
/// Returns `None` on a clean EOF between transactions.
async fn read_transaction<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<(String, String)>> {
    let mut op = String::new();
    if reader.read_line(&mut op).await? == 0 {
        return Ok(None);
    }

    let mut body = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\n" {
            break;
        }
        body.push_str(&line);
    }

    Ok(Some((op.trim_end().to_string(), body)))
}

async fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    // First try dual-stack (IPv6 with IPv4 mapped)
    let addr_v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    if let Ok(socket) = UdpSocket::bind(addr_v6).await {
        return Ok(socket);
    }

    // Fall back to IPv4 only
    let addr_v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    UdpSocket::bind(addr_v4).await
}

async fn bind_marked(port: u16, fwmark: u32) -> io::Result<UdpSocket> {
    let socket = bind_udp(port).await?;
    if fwmark != 0 {
        set_mark(&socket, fwmark)?;
    }
    Ok(socket)
}

fn set_mark(socket: &UdpSocket, mark: u32) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
