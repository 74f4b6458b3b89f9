pub mod netlink;
pub mod tun;
pub mod uapi;

pub use netlink::LinkManager;
pub use tun::{interface_index, LinuxTun, LinuxTunProvider};
pub use uapi::{OpenControlSocket, UnixControlListener, UnixControlSockets, SOCKET_DIR};
