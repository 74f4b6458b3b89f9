use async_trait::async_trait;
use std::ffi::CString;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tun::Tun;

use crate::platform::linux::netlink::LinkManager;
use crate::platform::traits::{InterfaceProvider, VirtualInterface};

/// Creates Linux TUN devices through `/dev/net/tun`
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxTunProvider;

#[async_trait]
impl InterfaceProvider for LinuxTunProvider {
    type Interface = LinuxTun;

    async fn create(&self, name: &str, mtu: u32) -> io::Result<LinuxTun> {
        LinuxTun::new(name, mtu)
    }
}

/// Linux TUN device
pub struct LinuxTun {
    tun: Tun,
    name: String,
    index: u32,
}

impl LinuxTun {
    /// Create a new TUN device. The link stays down until
    /// [`VirtualInterface::set_link_up`] is called.
    pub fn new(name: &str, mtu: u32) -> io::Result<Self> {
        let tun = Tun::builder()
            .name(name)
            .tap(false)
            .packet_info(false)
            .mtu(mtu as i32)
            .try_build()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let tun_name = tun.name().to_string();
        let index = interface_index(&tun_name)?;

        tracing::info!(
            "Created TUN device {} (index={}, mtu={})",
            tun_name,
            index,
            mtu
        );

        Ok(Self {
            tun,
            name: tun_name,
            index,
        })
    }
}

/// Resolve an interface name to its kernel index
pub fn interface_index(name: &str) -> io::Result<u32> {
    let name_cstr =
        CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: name_cstr is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };

    if index == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(index)
}

#[async_trait]
impl VirtualInterface for LinuxTun {
    fn name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    async fn set_link_up(&self) -> io::Result<()> {
        let links = LinkManager::new()?;
        links.set_link_up(self.index).await
    }
}

impl AsyncRead for LinuxTun {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tun).poll_read(cx, buf)
    }
}

impl AsyncWrite for LinuxTun {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.tun).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tun).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tun).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_index_loopback() {
        assert!(interface_index("lo").unwrap() > 0);
    }

    #[test]
    fn test_interface_index_missing() {
        assert!(interface_index("wgbridge-none0").is_err());
    }
}
