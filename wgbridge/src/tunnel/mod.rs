pub mod device;
pub mod peer;
pub mod router;
pub mod uapi;

pub use device::{DeviceState, TunnelDevice, TunnelFactory};
pub use peer::{PeerConfig, PeerSession};
pub use router::{extract_dest_ip, AllowedIpsRouter};
