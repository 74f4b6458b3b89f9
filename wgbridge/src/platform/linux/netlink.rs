use rtnetlink::Handle;
use std::io;

/// Link state control over rtnetlink
pub struct LinkManager {
    handle: Handle,
}

impl LinkManager {
    /// Open a netlink connection. Must be called inside a Tokio runtime.
    pub fn new() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;

        // Spawn the connection handler
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    /// Bring interface up
    pub async fn set_link_up(&self, iface_index: u32) -> io::Result<()> {
        self.handle
            .link()
            .set(iface_index)
            .up()
            .execute()
            .await
            .map_err(|e| io::Error::other(format!("failed to set link {} up: {}", iface_index, e)))
    }
}
