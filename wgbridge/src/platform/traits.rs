use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Creates virtual network interfaces
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    type Interface: VirtualInterface;

    /// Create an interface; the OS may pick a different name than requested
    async fn create(&self, name: &str, mtu: u32) -> io::Result<Self::Interface>;
}

/// A virtual network interface carrying raw IP packets.
///
/// Dropping the interface releases it.
#[async_trait]
pub trait VirtualInterface: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {
    /// Name the OS actually assigned
    fn name(&self) -> io::Result<String>;

    /// Bring the link operationally up
    async fn set_link_up(&self) -> io::Result<()>;
}

/// Opens and binds per-interface control sockets
pub trait ControlSocketProvider: Send + Sync {
    /// Bound socket that is not yet accepting
    type Socket: Send;
    type Listener: ControlListener;

    fn open(&self, interface: &str) -> io::Result<Self::Socket>;

    fn listen(&self, interface: &str, socket: Self::Socket) -> io::Result<Self::Listener>;
}

/// Accepting side of a control socket
#[async_trait]
pub trait ControlListener: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next control connection. Fails once the listener is
    /// closed.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Stop accepting and release the endpoint. Safe to call repeatedly.
    fn close(&self);
}
