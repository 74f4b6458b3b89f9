//! In-memory stand-ins for the interface, control socket and device used by
//! the lifecycle tests.

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{IdentityFields, LogLevel};
use crate::device::{Device, DeviceFactory};
use crate::error::UapiError;
use crate::logging::{PlainLogger, SharedLogger};
use crate::platform::{ControlListener, ControlSocketProvider, InterfaceProvider, VirtualInterface};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    InterfaceCreated { name: String, mtu: u32 },
    InterfaceDropped,
    SocketOpened(String),
    Listening(String),
    ListenerClosed,
    AcceptFailed,
    DeviceConfigured(String),
    DeviceUp,
    ConnectionHandled,
    DeviceClosed,
}

/// Ordered log of lifecycle events shared by all fakes
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

pub fn quiet_logger() -> SharedLogger {
    let identity = IdentityFields {
        name: "test".to_string(),
        pid: 1,
        thread_id: 1,
    };
    Arc::new(PlainLogger::new(LogLevel::Silent, &identity, "test"))
}

pub struct FakeInterface {
    name: String,
    io: DuplexStream,
    recorder: Recorder,
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.recorder.push(Event::InterfaceDropped);
    }
}

#[async_trait]
impl VirtualInterface for FakeInterface {
    fn name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    async fn set_link_up(&self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FakeInterface {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for FakeInterface {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Creates [`FakeInterface`]s, optionally renaming or failing
#[derive(Default)]
pub struct FakeInterfaces {
    pub recorder: Recorder,
    pub assigned_name: Option<String>,
    pub fail: bool,
    /// Packet side of the most recently created interface
    pub peer_end: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl InterfaceProvider for FakeInterfaces {
    type Interface = FakeInterface;

    async fn create(&self, name: &str, mtu: u32) -> io::Result<FakeInterface> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "tun unavailable"));
        }
        self.recorder.push(Event::InterfaceCreated {
            name: name.to_string(),
            mtu,
        });

        let (io, peer) = tokio::io::duplex(4096);
        *self.peer_end.lock().unwrap() = Some(peer);

        Ok(FakeInterface {
            name: self.assigned_name.clone().unwrap_or_else(|| name.to_string()),
            io,
            recorder: self.recorder.clone(),
        })
    }
}

/// Client side of a [`FakeListener`]
#[derive(Clone)]
pub struct Connector(mpsc::UnboundedSender<DuplexStream>);

impl Connector {
    pub async fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        self.0.send(server).expect("listener dropped");
        client
    }
}

pub struct FakeListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
    fail_accept: bool,
    recorder: Recorder,
}

impl FakeListener {
    pub fn new(recorder: Recorder) -> (Self, Connector) {
        Self::build(recorder, false)
    }

    /// A listener whose first accept fails
    pub fn failing(recorder: Recorder) -> (Self, Connector) {
        Self::build(recorder, true)
    }

    fn build(recorder: Recorder, fail_accept: bool) -> (Self, Connector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            incoming: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            fail_accept,
            recorder,
        };
        (listener, Connector(tx))
    }
}

#[async_trait]
impl ControlListener for FakeListener {
    type Conn = DuplexStream;

    async fn accept(&self) -> io::Result<DuplexStream> {
        if self.fail_accept {
            self.recorder.push(Event::AcceptFailed);
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "accept failed"));
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "closed"))
            }
            conn = incoming.recv() => {
                conn.ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.recorder.push(Event::ListenerClosed);
        }
        self.closed.cancel();
    }
}

/// Control socket provider handing out one prepared [`FakeListener`]
pub struct FakeSockets {
    pub recorder: Recorder,
    pub fail_open: bool,
    pub fail_listen: bool,
    listener: Mutex<Option<FakeListener>>,
}

impl FakeSockets {
    pub fn new(recorder: Recorder) -> (Self, Connector) {
        let (listener, connector) = FakeListener::new(recorder.clone());
        (Self::with_listener(recorder, listener), connector)
    }

    pub fn with_listener(recorder: Recorder, listener: FakeListener) -> Self {
        Self {
            recorder,
            fail_open: false,
            fail_listen: false,
            listener: Mutex::new(Some(listener)),
        }
    }
}

impl ControlSocketProvider for FakeSockets {
    type Socket = String;
    type Listener = FakeListener;

    fn open(&self, interface: &str) -> io::Result<String> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "socket busy"));
        }
        self.recorder.push(Event::SocketOpened(interface.to_string()));
        Ok(interface.to_string())
    }

    fn listen(&self, interface: &str, socket: String) -> io::Result<FakeListener> {
        assert_eq!(interface, socket);
        if self.fail_listen {
            return Err(io::Error::other("listen failed"));
        }
        self.recorder.push(Event::Listening(interface.to_string()));
        self.listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::other("listener already taken"))
    }
}

/// Device answering every transaction with `errno=0`
pub struct FakeDevice {
    recorder: Recorder,
    interface: Mutex<Option<FakeInterface>>,
    done: CancellationToken,
    fail_config: bool,
    fail_up: bool,
}

impl FakeDevice {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            interface: Mutex::new(None),
            done: CancellationToken::new(),
            fail_config: false,
            fail_up: false,
        }
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn apply_config(&self, config: &str) -> Result<(), UapiError> {
        if self.fail_config {
            return Err(UapiError::invalid("private_key", "rejected"));
        }
        self.recorder.push(Event::DeviceConfigured(config.to_string()));
        Ok(())
    }

    async fn mark_up(&self) -> io::Result<()> {
        if self.fail_up {
            return Err(io::Error::other("bind failed"));
        }
        self.recorder.push(Event::DeviceUp);
        Ok(())
    }

    async fn handle_connection<C>(&self, mut conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\n\n") {
            match conn.read(&mut byte).await {
                Ok(1) => request.push(byte[0]),
                _ => return,
            }
        }
        self.recorder.push(Event::ConnectionHandled);
        let _ = conn.write_all(b"errno=0\n\n").await;
        let _ = conn.shutdown().await;
    }

    async fn wait(&self) {
        self.done.cancelled().await
    }

    async fn close(&self) {
        self.interface.lock().unwrap().take();
        self.recorder.push(Event::DeviceClosed);
        self.done.cancel();
    }
}

/// Builds [`FakeDevice`]s sharing one completion token
#[derive(Default)]
pub struct FakeFactory {
    pub recorder: Recorder,
    pub done: CancellationToken,
    pub fail_config: bool,
    pub fail_up: bool,
}

impl DeviceFactory<FakeInterface> for FakeFactory {
    type Device = FakeDevice;

    fn new_device(&self, interface: FakeInterface, _logger: SharedLogger) -> FakeDevice {
        FakeDevice {
            recorder: self.recorder.clone(),
            interface: Mutex::new(Some(interface)),
            done: self.done.clone(),
            fail_config: self.fail_config,
            fail_up: self.fail_up,
        }
    }
}
