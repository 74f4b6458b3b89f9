use boringtun::noise::{errors::WireGuardError, TunnResult};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use boringtun::x25519::{PublicKey, StaticSecret};

use crate::logging::SharedLogger;
use crate::platform::VirtualInterface;
use crate::tunnel::device::DeviceState;
use crate::tunnel::uapi::PeerUpdate;
use crate::tunnel::{extract_dest_ip, AllowedIpsRouter, PeerConfig, PeerSession};
use crate::{log_error, log_verbose};

/// Maximum packet size (MTU + some overhead)
const MAX_PACKET_SIZE: usize = 65536;

/// Timer interval for keepalives/handshakes
const TIMER_INTERVAL_MS: u64 = 250;

/// Local session indices are 24 bits; boringtun owns the low byte
const MAX_PEER_INDEX: u32 = 1 << 24;

/// Currently bound UDP socket, swapped on rebind
pub type SocketWatch = watch::Receiver<Option<Arc<UdpSocket>>>;

/// Session manager containing all peer sessions
#[derive(Default)]
pub struct SessionManager {
    /// Peer sessions indexed by their index
    sessions: HashMap<u32, PeerSession>,
    /// Map from public key to session index
    key_to_index: HashMap<[u8; 32], u32>,
    /// AllowedIPs router
    router: AllowedIpsRouter,
    next_index: u32,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a session by index
    pub fn get_mut(&mut self, index: u32) -> Option<&mut PeerSession> {
        self.sessions.get_mut(&index)
    }

    /// Find peer for destination IP
    pub fn find_peer_for_dest(&mut self, dest: IpAddr) -> Option<&mut PeerSession> {
        let idx = self.router.lookup(dest)?;
        self.sessions.get_mut(&idx)
    }

    /// Sessions in index order
    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.index());
        sessions.into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    /// Drop every peer
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.key_to_index.clear();
        self.router = AllowedIpsRouter::default();
    }

    /// Rebuild every noise session after the local key changed
    pub fn rebuild_all(&mut self, local: Option<&StaticSecret>) {
        for session in self.sessions.values_mut() {
            session.rebuild(local);
        }
    }

    /// Apply one peer section of a `set` transaction
    pub fn apply(&mut self, update: &PeerUpdate, local: Option<&StaticSecret>) {
        if update.remove {
            if let Some(idx) = self.key_to_index.remove(&update.public_key) {
                self.sessions.remove(&idx);
                self.refresh_routes();
            }
            return;
        }

        let idx = match self.key_to_index.get(&update.public_key) {
            Some(idx) => *idx,
            None if update.update_only => return,
            None => {
                let idx = self.allocate_index();
                let config = PeerConfig::new(PublicKey::from(update.public_key));
                let mut session = PeerSession::new(config, idx);
                session.rebuild(local);
                self.sessions.insert(idx, session);
                self.key_to_index.insert(update.public_key, idx);
                idx
            }
        };

        // An allowed IP belongs to at most one peer
        for network in &update.allowed_ips {
            if let Some(owner) = self.router.owner(*network).filter(|owner| *owner != idx) {
                if let Some(other) = self.sessions.get_mut(&owner) {
                    other.remove_allowed_ip(*network);
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(&idx) {
            if session.update(update) {
                session.rebuild(local);
            }
        }
        self.refresh_routes();
    }

    fn allocate_index(&mut self) -> u32 {
        loop {
            let idx = self.next_index;
            self.next_index = (self.next_index + 1) % MAX_PEER_INDEX;
            if !self.sessions.contains_key(&idx) {
                return idx;
            }
        }
    }

    fn refresh_routes(&mut self) {
        self.router = AllowedIpsRouter::new(
            self.sessions
                .iter()
                .map(|(idx, session)| (*idx, session.config())),
        );
    }
}

/// Run the data plane until shutdown or until the interface closes
pub async fn run_worker<T: VirtualInterface>(
    mut tun: T,
    state: Arc<Mutex<DeviceState>>,
    mut udp: SocketWatch,
    shutdown: CancellationToken,
    logger: SharedLogger,
) {
    // Buffers for packet processing
    let mut tun_buf = vec![0u8; MAX_PACKET_SIZE];
    let mut udp_buf = vec![0u8; MAX_PACKET_SIZE];
    let mut out_buf = vec![0u8; MAX_PACKET_SIZE];

    // Timer for keepalives
    let mut timer = tokio::time::interval(Duration::from_millis(TIMER_INTERVAL_MS));

    log_verbose!(logger, "Data plane started");

    loop {
        let socket = udp.borrow().clone();

        tokio::select! {
            biased;

            // Shutdown signal
            _ = shutdown.cancelled() => {
                log_verbose!(logger, "Data plane stopping");
                break;
            }

            // Socket was rebound
            changed = udp.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            // TUN device read (outbound: tunnel -> network)
            result = tun.read(&mut tun_buf) => {
                match result {
                    Ok(0) => {
                        log_verbose!(logger, "Interface closed");
                        break;
                    }
                    Ok(n) => {
                        let mut state = state.lock().await;
                        handle_tun_packet(
                            &tun_buf[..n],
                            &mut state.sessions,
                            socket.as_deref(),
                            &mut out_buf,
                        ).await;
                    }
                    Err(e) => {
                        log_error!(logger, "TUN read error: {}", e);
                        break;
                    }
                }
            }

            // UDP socket read (inbound: network -> tunnel)
            result = recv_from(socket.as_deref(), &mut udp_buf) => {
                match result {
                    Ok((n, src_addr)) if n > 0 => {
                        let Some(socket) = socket.as_deref() else { continue };
                        let src_addr = canonical(src_addr);
                        let mut state = state.lock().await;
                        if let Err(e) = handle_udp_packet(
                            &udp_buf[..n],
                            src_addr,
                            &mut state.sessions,
                            &mut tun,
                            socket,
                            &mut out_buf,
                        ).await {
                            log_error!(logger, "Failed to deliver packet from {}: {}", src_addr, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("UDP read error: {}", e);
                    }
                }
            }

            // Timer tick for keepalives/handshakes
            _ = timer.tick() => {
                let mut state = state.lock().await;
                handle_timers(&mut state.sessions, socket.as_deref(), &mut out_buf).await;
            }
        }
    }
}

async fn recv_from(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Unmap `::ffff:a.b.c.d` sources received on a dual-stack socket
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Handle a packet from the TUN device (outbound)
async fn handle_tun_packet(
    packet: &[u8],
    sessions: &mut SessionManager,
    udp: Option<&UdpSocket>,
    out_buf: &mut [u8],
) {
    // Extract destination IP to find the right peer
    let Some(dest_ip) = extract_dest_ip(packet) else {
        tracing::trace!("Dropping non-IP packet from TUN");
        return;
    };

    // Find the peer for this destination
    let Some(session) = sessions.find_peer_for_dest(dest_ip) else {
        tracing::trace!("No peer for destination {}", dest_ip);
        return;
    };

    let endpoint = session.endpoint();
    tracing::trace!(
        "TUN -> peer {}: {} (endpoint: {:?})",
        session.index(),
        PeerSession::format_packet(packet),
        endpoint
    );

    // Encapsulate the packet
    match session.encapsulate(packet, out_buf) {
        TunnResult::WriteToNetwork(data) => match (udp, endpoint) {
            (Some(udp), Some(endpoint)) => {
                if let Err(e) = udp.send_to(data, endpoint).await {
                    tracing::debug!("Failed to send to {}: {}", endpoint, e);
                }
            }
            _ => tracing::debug!("No endpoint for peer {}, packet dropped", session.index()),
        },
        TunnResult::Done => {
            // Packet was queued (handshake in progress)
        }
        TunnResult::Err(e) => {
            tracing::debug!("Encapsulation error for peer {}: {:?}", session.index(), e);
        }
        _ => {
            tracing::warn!("Unexpected TunnResult from encapsulate");
        }
    }
}

/// Peer index addressed by a WireGuard message, if it names one
fn receiver_peer_index(packet: &[u8]) -> Option<u32> {
    let field = match packet[0] {
        // Handshake response: sender at 4..8, receiver at 8..12
        2 if packet.len() >= 12 => &packet[8..12],
        // Cookie reply and transport data: receiver at 4..8
        3 | 4 if packet.len() >= 8 => &packet[4..8],
        _ => return None,
    };
    let receiver = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
    Some(receiver >> 8)
}

/// Handle a packet from the UDP socket (inbound)
async fn handle_udp_packet<W: AsyncWrite + Unpin>(
    packet: &[u8],
    src_addr: SocketAddr,
    sessions: &mut SessionManager,
    tun: &mut W,
    udp: &UdpSocket,
    out_buf: &mut [u8],
) -> io::Result<()> {
    if packet.len() < 4 {
        return Ok(());
    }

    if let Some(idx) = receiver_peer_index(packet) {
        match sessions.get_mut(idx) {
            Some(session) => {
                process_peer_packet(packet, src_addr, session, tun, udp, out_buf).await?;
            }
            None => tracing::debug!("Unknown receiver index {} from {}", idx, src_addr),
        }
        return Ok(());
    }

    // Handshake initiation - try all peers
    for session in sessions.iter_mut() {
        if process_peer_packet(packet, src_addr, session, tun, udp, out_buf).await? {
            return Ok(());
        }
    }

    tracing::debug!("No peer accepted handshake packet from {}", src_addr);
    Ok(())
}

/// Process a packet for a specific peer. Returns false if the peer
/// rejected it.
async fn process_peer_packet<W: AsyncWrite + Unpin>(
    packet: &[u8],
    src_addr: SocketAddr,
    session: &mut PeerSession,
    tun: &mut W,
    udp: &UdpSocket,
    out_buf: &mut [u8],
) -> io::Result<bool> {
    if !session.has_session() {
        return Ok(false);
    }

    // Only authenticated results may move the endpoint
    match session.decapsulate(Some(src_addr.ip()), packet, out_buf) {
        TunnResult::WriteToNetwork(response) => {
            session.set_endpoint(src_addr);
            udp.send_to(response, src_addr).await?;

            // Flush packets queued behind the handshake
            loop {
                match session.decapsulate(None, &[], out_buf) {
                    TunnResult::WriteToNetwork(queued) => {
                        udp.send_to(queued, src_addr).await?;
                    }
                    _ => break,
                }
            }
        }
        TunnResult::WriteToTunnelV4(data, src_ip) => {
            session.set_endpoint(src_addr);
            write_to_tun(session, data, IpAddr::V4(src_ip), tun).await?;
        }
        TunnResult::WriteToTunnelV6(data, src_ip) => {
            session.set_endpoint(src_addr);
            write_to_tun(session, data, IpAddr::V6(src_ip), tun).await?;
        }
        TunnResult::Done => {}
        TunnResult::Err(e) => {
            tracing::trace!("Decapsulation error from {}: {:?}", src_addr, e);
            return Ok(false);
        }
    }

    Ok(true)
}

async fn write_to_tun<W: AsyncWrite + Unpin>(
    session: &PeerSession,
    data: &[u8],
    src_ip: IpAddr,
    tun: &mut W,
) -> io::Result<()> {
    // Verify source IP is allowed
    if !session.is_allowed_ip(src_ip) {
        tracing::debug!("Dropping packet - source IP {} not in AllowedIPs", src_ip);
        return Ok(());
    }

    tracing::trace!("UDP -> TUN: {}", PeerSession::format_packet(data));
    tun.write_all(data).await
}

/// Handle timer events for all peers
async fn handle_timers(sessions: &mut SessionManager, udp: Option<&UdpSocket>, out_buf: &mut [u8]) {
    for session in sessions.iter_mut() {
        let endpoint = session.endpoint();
        match session.update_timers(out_buf) {
            TunnResult::WriteToNetwork(data) => {
                if let (Some(udp), Some(endpoint)) = (udp, endpoint) {
                    if let Err(e) = udp.send_to(data, endpoint).await {
                        tracing::debug!("Failed to send timer packet to {}: {}", endpoint, e);
                    }
                }
            }
            TunnResult::Err(WireGuardError::ConnectionExpired) => {
                tracing::trace!("Session with peer {} expired", session.index());
            }
            TunnResult::Err(e) => {
                tracing::debug!("Timer error for peer {}: {:?}", session.index(), e);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::uapi::parse_allowed_ip;

    fn keys(sessions: &SessionManager) -> Vec<[u8; 32]> {
        sessions.iter().map(|s| s.config().public_key.to_bytes()).collect()
    }

    fn update(key: u8) -> PeerUpdate {
        PeerUpdate {
            public_key: [key; 32],
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }

    #[test]
    fn test_receiver_index_by_message_type() {
        let mut data = [0u8; 32];
        data[0] = 4;
        data[4..8].copy_from_slice(&((5u32 << 8) | 3).to_le_bytes());
        assert_eq!(receiver_peer_index(&data), Some(5));

        let mut response = [0u8; 92];
        response[0] = 2;
        response[4..8].copy_from_slice(&(9u32 << 8).to_le_bytes());
        response[8..12].copy_from_slice(&(2u32 << 8).to_le_bytes());
        assert_eq!(receiver_peer_index(&response), Some(2));

        let mut init = [0u8; 148];
        init[0] = 1;
        assert_eq!(receiver_peer_index(&init), None);
    }

    #[test]
    fn test_apply_adds_and_removes_peers() {
        let mut sessions = SessionManager::new();
        let local = StaticSecret::from([7u8; 32]);

        let mut add = update(1);
        add.allowed_ips = vec![parse_allowed_ip("10.0.0.0/24").unwrap()];
        sessions.apply(&add, Some(&local));
        assert_eq!(keys(&sessions), vec![[1u8; 32]]);
        let peer = sessions.find_peer_for_dest("10.0.0.9".parse().unwrap()).unwrap();
        assert!(peer.has_session());

        let mut remove = update(1);
        remove.remove = true;
        sessions.apply(&remove, Some(&local));
        assert!(keys(&sessions).is_empty());
        assert!(sessions.find_peer_for_dest("10.0.0.9".parse().unwrap()).is_none());
    }

    #[test]
    fn test_update_only_skips_unknown_peer() {
        let mut sessions = SessionManager::new();
        let mut only = update(3);
        only.update_only = true;
        sessions.apply(&only, None);
        assert!(keys(&sessions).is_empty());
    }

    #[test]
    fn test_allowed_ip_moves_between_peers() {
        let mut sessions = SessionManager::new();
        let network = parse_allowed_ip("10.9.0.0/16").unwrap();

        let mut first = update(1);
        first.allowed_ips = vec![network];
        sessions.apply(&first, None);

        let mut second = update(2);
        second.allowed_ips = vec![network];
        sessions.apply(&second, None);

        let first_peer = sessions.iter().find(|s| s.config().public_key.to_bytes() == [1u8; 32]);
        assert!(first_peer.unwrap().config().allowed_ips.is_empty());
        let owner = sessions.find_peer_for_dest("10.9.1.1".parse().unwrap()).unwrap();
        assert_eq!(owner.config().public_key.as_bytes(), &[2u8; 32]);
    }

    #[test]
    fn test_canonical_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:51820".parse().unwrap();
        assert_eq!(canonical(mapped), "127.0.0.1:51820".parse().unwrap());
    }
}
