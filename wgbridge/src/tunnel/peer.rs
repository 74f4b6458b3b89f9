use base64::Engine;
use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use ip_network::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;
use boringtun::x25519::{PublicKey, StaticSecret};

use crate::tunnel::uapi::{PeerDump, PeerUpdate};

/// Configuration of one peer, as installed over the control socket
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }
}

/// Wrapper around boringtun's Tunn with additional state management
pub struct PeerSession {
    /// The boringtun tunnel instance; absent until the device has a private key
    tunn: Option<Tunn>,
    config: PeerConfig,
    /// Peer index (unique identifier within the device)
    index: u32,
}

impl PeerSession {
    pub fn new(config: PeerConfig, index: u32) -> Self {
        Self {
            tunn: None,
            config,
            index,
        }
    }

    /// (Re)build the noise session for the given local key
    pub fn rebuild(&mut self, local_private_key: Option<&StaticSecret>) {
        self.tunn = local_private_key.and_then(|key| {
            Tunn::new(
                key.clone(),
                self.config.public_key,
                self.config.preshared_key,
                self.config.persistent_keepalive.filter(|k| *k != 0),
                self.index,
                None,
            )
            .map_err(|e| tracing::warn!("Failed to create session for peer {}: {}", self.index, e))
            .ok()
        });
    }

    /// Merge a control-socket update. Returns true when the noise session
    /// must be rebuilt.
    pub fn update(&mut self, update: &PeerUpdate) -> bool {
        let mut rebuild = false;

        if let Some(psk) = update.preshared_key {
            rebuild |= self.config.preshared_key != psk;
            self.config.preshared_key = psk;
        }
        if let Some(keepalive) = update.persistent_keepalive {
            rebuild |= self.config.persistent_keepalive != Some(keepalive);
            self.config.persistent_keepalive = Some(keepalive);
        }
        if let Some(endpoint) = update.endpoint {
            self.config.endpoint = Some(endpoint);
        }
        if update.replace_allowed_ips {
            self.config.allowed_ips.clear();
        }
        for allowed_ip in &update.allowed_ips {
            if !self.config.allowed_ips.contains(allowed_ip) {
                self.config.allowed_ips.push(*allowed_ip);
            }
        }

        rebuild
    }

    pub fn remove_allowed_ip(&mut self, network: IpNetwork) {
        self.config.allowed_ips.retain(|allowed| *allowed != network);
    }

    /// Get the peer's current endpoint
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.config.endpoint
    }

    /// Update the peer's endpoint (e.g., after roaming)
    pub fn set_endpoint(&mut self, addr: SocketAddr) {
        if self.config.endpoint != Some(addr) {
            tracing::debug!(
                "Peer {} endpoint changed: {:?} -> {}",
                base64::prelude::BASE64_STANDARD.encode(self.config.public_key.as_bytes()),
                self.config.endpoint,
                addr
            );
            self.config.endpoint = Some(addr);
        }
    }

    /// Get the peer index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the peer configuration
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn has_session(&self) -> bool {
        self.tunn.is_some()
    }

    /// Encrypt an IP packet for transmission to this peer
    pub fn encapsulate<'a>(&mut self, src: &[u8], dst: &'a mut [u8]) -> TunnResult<'a> {
        match &mut self.tunn {
            Some(tunn) => tunn.encapsulate(src, dst),
            None => TunnResult::Done,
        }
    }

    /// Decrypt an incoming WireGuard packet. Without a session nothing can
    /// be authenticated, so every datagram is rejected.
    pub fn decapsulate<'a>(
        &mut self,
        src_addr: Option<IpAddr>,
        datagram: &[u8],
        dst: &'a mut [u8],
    ) -> TunnResult<'a> {
        match &mut self.tunn {
            Some(tunn) => tunn.decapsulate(src_addr, datagram, dst),
            None => TunnResult::Err(WireGuardError::NoCurrentSession),
        }
    }

    /// Process timer events (keepalive, rekey, etc.)
    pub fn update_timers<'a>(&mut self, dst: &'a mut [u8]) -> TunnResult<'a> {
        match &mut self.tunn {
            Some(tunn) => tunn.update_timers(dst),
            None => TunnResult::Done,
        }
    }

    /// Check if this peer is allowed to send/receive traffic for the given IP
    pub fn is_allowed_ip(&self, addr: IpAddr) -> bool {
        self.config.allowed_ips.iter().any(|allowed| allowed.contains(addr))
    }

    /// Snapshot for a `get` transaction
    pub fn dump(&self) -> PeerDump {
        let (last_handshake, tx_bytes, rx_bytes) = match &self.tunn {
            Some(tunn) => {
                let (since_handshake, tx, rx, _, _) = tunn.stats();
                let last_handshake =
                    since_handshake.and_then(|elapsed| SystemTime::now().checked_sub(elapsed));
                (last_handshake, tx as u64, rx as u64)
            }
            None => (None, 0, 0),
        };

        PeerDump {
            public_key: self.config.public_key.to_bytes(),
            preshared_key: self.config.preshared_key,
            endpoint: self.config.endpoint,
            last_handshake,
            tx_bytes,
            rx_bytes,
            persistent_keepalive: self.config.persistent_keepalive.unwrap_or(0),
            allowed_ips: self.config.allowed_ips.clone(),
        }
    }

    /// Format packet for logging
    pub fn format_packet(data: &[u8]) -> String {
        if data.len() < 20 {
            return format!("{} bytes (too short)", data.len());
        }

        let version = (data[0] >> 4) & 0xf;
        match version {
            4 => {
                let src = std::net::Ipv4Addr::new(data[12], data[13], data[14], data[15]);
                let dst = std::net::Ipv4Addr::new(data[16], data[17], data[18], data[19]);
                let proto = data[9];
                format!("IPv4 {} -> {} proto={} len={}", src, dst, proto, data.len())
            }
            6 => format!("IPv6 {} bytes", data.len()),
            _ => format!("{} bytes (unknown version {})", data.len(), version),
        }
    }
}
