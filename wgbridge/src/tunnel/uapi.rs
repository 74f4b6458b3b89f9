//! Cross-platform userspace configuration protocol.
//!
//! A transaction is an operation line (`get=1` or `set=1`), zero or more
//! `key=value` lines and an empty line. Keys are hex, allowed IPs are CIDR.

use ip_network::IpNetwork;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::keys::{decode_key_hex, encode_key_hex};
use crate::error::UapiError;

/// Operation requested by the first line of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
}

impl Operation {
    pub fn parse(line: &str) -> Result<Self, UapiError> {
        match line {
            "get=1" => Ok(Operation::Get),
            "set=1" => Ok(Operation::Set),
            other => Err(UapiError::UnknownOperation(other.to_string())),
        }
    }
}

/// Update for a 32-byte key where all zeros clears the value
pub type KeyUpdate = Option<[u8; 32]>;

/// Parsed body of a `set` transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRequest {
    pub private_key: Option<KeyUpdate>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub replace_peers: bool,
    pub peers: Vec<PeerUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: [u8; 32],
    pub remove: bool,
    pub update_only: bool,
    pub preshared_key: Option<KeyUpdate>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNetwork>,
}

impl PeerUpdate {
    fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl SetRequest {
    /// Parse `key=value` lines. Parsing stops at the first empty line.
    pub fn parse(body: &str) -> Result<Self, UapiError> {
        let mut request = SetRequest::default();

        for line in body.lines() {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| UapiError::MalformedLine(line.to_string()))?;

            if key == "public_key" {
                let public_key = parse_key(key, value)?;
                request.peers.push(PeerUpdate::new(public_key));
                continue;
            }

            match request.peers.last_mut() {
                None => request.apply_interface_key(key, value)?,
                Some(peer) => peer.apply_key(key, value)?,
            }
        }

        Ok(request)
    }

    fn apply_interface_key(&mut self, key: &str, value: &str) -> Result<(), UapiError> {
        match key {
            "private_key" => self.private_key = Some(parse_key_update(key, value)?),
            "listen_port" => {
                self.listen_port = Some(value.parse().map_err(|_| UapiError::invalid(key, value))?)
            }
            "fwmark" => {
                self.fwmark = Some(value.parse().map_err(|_| UapiError::invalid(key, value))?)
            }
            "replace_peers" => self.replace_peers = parse_true(key, value)?,
            _ => return Err(UapiError::UnexpectedKey(key.to_string())),
        }
        Ok(())
    }
}

impl PeerUpdate {
    fn apply_key(&mut self, key: &str, value: &str) -> Result<(), UapiError> {
        match key {
            "remove" => self.remove = parse_true(key, value)?,
            "update_only" => self.update_only = parse_true(key, value)?,
            "preshared_key" => self.preshared_key = Some(parse_key_update(key, value)?),
            "endpoint" => {
                self.endpoint =
                    Some(parse_endpoint(value).ok_or_else(|| UapiError::invalid(key, value))?)
            }
            "persistent_keepalive_interval" => {
                self.persistent_keepalive =
                    Some(value.parse().map_err(|_| UapiError::invalid(key, value))?)
            }
            "replace_allowed_ips" => self.replace_allowed_ips = parse_true(key, value)?,
            "allowed_ip" => self
                .allowed_ips
                .push(parse_allowed_ip(value).ok_or_else(|| UapiError::invalid(key, value))?),
            "protocol_version" => {
                if value != "1" {
                    return Err(UapiError::invalid(key, value));
                }
            }
            _ => return Err(UapiError::UnexpectedKey(key.to_string())),
        }
        Ok(())
    }
}

fn parse_true(key: &str, value: &str) -> Result<bool, UapiError> {
    match value {
        "true" => Ok(true),
        _ => Err(UapiError::invalid(key, value)),
    }
}

fn parse_key(key: &str, value: &str) -> Result<[u8; 32], UapiError> {
    decode_key_hex(value).ok_or_else(|| UapiError::invalid(key, value))
}

fn parse_key_update(key: &str, value: &str) -> Result<KeyUpdate, UapiError> {
    let bytes = parse_key(key, value)?;
    Ok(if bytes == [0u8; 32] { None } else { Some(bytes) })
}

/// Parse `ip:port` or `[ipv6]:port`
fn parse_endpoint(value: &str) -> Option<SocketAddr> {
    value.parse().ok()
}

/// Parse `ip/prefix`; host bits are cleared
pub fn parse_allowed_ip(value: &str) -> Option<IpNetwork> {
    let (ip, prefix) = value.split_once('/')?;
    let ip: IpAddr = ip.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    IpNetwork::new_truncate(ip, prefix).ok()
}

/// Interface state reported by a `get` transaction
#[derive(Debug, Clone, Default)]
pub struct InterfaceDump {
    pub private_key: Option<[u8; 32]>,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: Vec<PeerDump>,
}

#[derive(Debug, Clone)]
pub struct PeerDump {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNetwork>,
}

impl InterfaceDump {
    /// Render the `get` response body, without the trailing `errno` line
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "private_key={}", encode_key_hex(key));
        }
        if self.listen_port != 0 {
            let _ = writeln!(out, "listen_port={}", self.listen_port);
        }
        if self.fwmark != 0 {
            let _ = writeln!(out, "fwmark={}", self.fwmark);
        }

        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", encode_key_hex(&peer.public_key));
            let _ = writeln!(
                out,
                "preshared_key={}",
                encode_key_hex(&peer.preshared_key.unwrap_or([0u8; 32]))
            );
            let _ = writeln!(out, "protocol_version=1");
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }

            let since_epoch = peer
                .last_handshake
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .unwrap_or(Duration::ZERO);
            let _ = writeln!(out, "last_handshake_time_sec={}", since_epoch.as_secs());
            let _ = writeln!(out, "last_handshake_time_nsec={}", since_epoch.subsec_nanos());
            let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes);
            let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes);
            let _ = writeln!(
                out,
                "persistent_keepalive_interval={}",
                peer.persistent_keepalive
            );
            for allowed_ip in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", allowed_ip);
            }
        }

        out
    }
}

/// Response line closing a transaction
pub fn status_line(result: &Result<(), UapiError>) -> String {
    match result {
        Ok(()) => "errno=0\n\n".to_string(),
        Err(e) => format!("errno={}\n\n", e.errno()),
    }
}
