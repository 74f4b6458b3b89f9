pub mod traits;

#[cfg(target_os = "linux")]
pub mod linux;

pub use traits::{ControlListener, ControlSocketProvider, InterfaceProvider, VirtualInterface};

#[cfg(target_os = "linux")]
pub use linux::{LinuxTunProvider, UnixControlSockets};
