use std::io::{self, BufRead};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use boringtun::x25519::StaticSecret;

use crate::cli::args::AddArgs;
use crate::config::keys::{
    decode_key, decode_key_hex, derive_public_key, encode_key, generate_private_key,
};
use crate::config::{DeviceConfig, Flavor, IdentityFields, LoggerSettings};
use crate::device::DeviceController;
use crate::discovery::{self, PROC_ROOT};
use crate::error::{ConfigError, Result, WgError};
use crate::launcher::{self, LaunchRequest, RunMode};
use crate::logging;
use crate::platform::linux::{interface_index, LinuxTunProvider, UnixControlSockets};
use crate::tunnel::TunnelFactory;

/// Execute the 'add' command
pub async fn cmd_add(args: AddArgs) -> Result<()> {
    if let Some(dir) = &args.log_dir {
        if !dir.is_dir() {
            return Err(ConfigError::MissingLogDir(dir.clone()).into());
        }
    }

    match RunMode::from_env() {
        RunMode::Launch => {
            if interface_index(&args.interface).is_ok() {
                return Err(ConfigError::InterfaceExists(args.interface).into());
            }

            let request = LaunchRequest::from_current(args.flavor, &args.interface, args.log_dir);
            let pid = launcher::spawn_detached(&request)?;
            println!("Started {} worker for {} (pid {})", args.flavor, args.interface, pid);
            Ok(())
        }
        RunMode::Foreground => run_worker(args).await,
    }
}

/// Serve the interface until a termination signal arrives
async fn run_worker(args: AddArgs) -> Result<()> {
    let mut config = DeviceConfig::new(&args.interface, args.flavor);
    config.mtu = args.mtu.unwrap_or(0);
    config.logger_settings = LoggerSettings {
        level: args.log_level,
        structured: args.json,
        identity: IdentityFields::current(env!("CARGO_PKG_NAME")),
    };

    logging::init(&config.logger_settings);

    let controller =
        DeviceController::new(LinuxTunProvider, UnixControlSockets::default(), TunnelFactory);
    controller.start(&mut config).await?;
    Ok(())
}

/// Execute the 'down' command
pub async fn cmd_down(interface: String, flavor: Flavor) -> Result<()> {
    let worker = discovery::find(Path::new(PROC_ROOT), &interface, flavor)?
        .ok_or_else(|| WgError::Other(format!("No {} worker is serving {}", flavor, interface)))?;

    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(worker.pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    tracing::info!("Sent SIGTERM to {} (pid {})", interface, worker.pid);
    Ok(())
}

/// Execute the 'status' command
pub async fn cmd_status(interface: Option<String>) -> Result<()> {
    match interface {
        Some(iface) => {
            let path = UnixControlSockets::default().socket_path(&iface);
            let dump = query_device(&path).await?;
            print!("{}", format_status(&iface, &dump, SystemTime::now()));
        }
        None => {
            let workers = discovery::scan(Path::new(PROC_ROOT))?;
            if workers.is_empty() {
                println!("No running workers");
            }
            for worker in workers {
                println!("{}\t{}\tpid {}", worker.interface, worker.flavor, worker.pid);
            }
        }
    }
    Ok(())
}

/// Run a `get` transaction and return the key/value lines
async fn query_device(path: &Path) -> Result<Vec<(String, String)>> {
    let mut stream = UnixStream::connect(path).await.map_err(|e| {
        WgError::Other(format!("Cannot reach {}: {}", path.display(), e))
    })?;
    stream.write_all(b"get=1\n\n").await?;
    stream.shutdown().await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    parse_get_reply(&reply)
}

fn parse_get_reply(reply: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in reply.lines().take_while(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            return Err(WgError::Other(format!("Malformed reply line: {}", line)));
        };
        if key == "errno" {
            if value != "0" {
                return Err(WgError::Other(format!("Device returned errno={}", value)));
            }
            return Ok(pairs);
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Err(WgError::Other("Truncated reply from device".to_string()))
}

fn hex_to_base64(value: &str) -> String {
    decode_key_hex(value)
        .map(|key| encode_key(&key))
        .unwrap_or_else(|| value.to_string())
}

fn format_status(interface: &str, dump: &[(String, String)], now: SystemTime) -> String {
    let mut out = format!("interface: {}\n", interface);
    let mut handshake_sec = 0u64;
    let mut tx_bytes = "0";

    for (key, value) in dump {
        match key.as_str() {
            "private_key" => {
                if let Some(bytes) = decode_key_hex(value) {
                    let public = derive_public_key(&StaticSecret::from(bytes));
                    out += &format!("  public key: {}\n", encode_key(public.as_bytes()));
                }
            }
            "listen_port" => out += &format!("  listening port: {}\n", value),
            "fwmark" => out += &format!("  fwmark: 0x{:x}\n", value.parse::<u32>().unwrap_or(0)),
            "public_key" => out += &format!("\npeer: {}\n", hex_to_base64(value)),
            "endpoint" => out += &format!("  endpoint: {}\n", value),
            "allowed_ip" => out += &format!("  allowed ip: {}\n", value),
            "last_handshake_time_sec" => handshake_sec = value.parse().unwrap_or(0),
            "last_handshake_time_nsec" => {
                if handshake_sec != 0 {
                    let at = UNIX_EPOCH + Duration::from_secs(handshake_sec);
                    let ago = now.duration_since(at).unwrap_or_default().as_secs();
                    out += &format!("  latest handshake: {} seconds ago\n", ago);
                }
            }
            "tx_bytes" => tx_bytes = value.as_str(),
            "rx_bytes" => {
                out += &format!("  transfer: {} B received, {} B sent\n", value, tx_bytes)
            }
            "persistent_keepalive_interval" if value != "0" => {
                out += &format!("  persistent keepalive: every {} seconds\n", value)
            }
            _ => {}
        }
    }
    out
}

/// Execute the 'genkey' command
pub fn cmd_genkey() {
    let private_key = generate_private_key();
    let encoded = encode_key(&private_key.to_bytes());
    println!("{}", encoded);
}

/// Execute the 'pubkey' command
pub fn cmd_pubkey() -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .map_err(|e| WgError::Other(format!("Failed to read from stdin: {}", e)))?;

    let private_key = StaticSecret::from(decode_key(&line)?);
    let public_key = derive_public_key(&private_key);
    println!("{}", encode_key(public_key.as_bytes()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::encode_key_hex;

    #[test]
    fn test_parse_get_reply() {
        let pairs = parse_get_reply("listen_port=51820\nfwmark=3\nerrno=0\n\n").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("listen_port".to_string(), "51820".to_string()),
                ("fwmark".to_string(), "3".to_string()),
            ]
        );

        assert!(parse_get_reply("errno=-22\n\n").is_err());
        assert!(parse_get_reply("listen_port=1\n").is_err());
        assert!(parse_get_reply("garbage\nerrno=0\n\n").is_err());
    }

    #[test]
    fn test_format_status() {
        let private = [0x11u8; 32];
        let peer = [0x22u8; 32];
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let dump: Vec<(String, String)> = [
            ("private_key", encode_key_hex(&private)),
            ("listen_port", "51820".to_string()),
            ("public_key", encode_key_hex(&peer)),
            ("endpoint", "192.0.2.1:51820".to_string()),
            ("last_handshake_time_sec", "990".to_string()),
            ("last_handshake_time_nsec", "0".to_string()),
            ("tx_bytes", "20".to_string()),
            ("rx_bytes", "10".to_string()),
            ("persistent_keepalive_interval", "0".to_string()),
            ("allowed_ip", "10.0.0.2/32".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let status = format_status("wg0", &dump, now);
        let public = derive_public_key(&StaticSecret::from(private));
        assert!(status.starts_with("interface: wg0\n"));
        assert!(status.contains(&format!("  public key: {}\n", encode_key(public.as_bytes()))));
        assert!(status.contains(&format!("\npeer: {}\n", encode_key(&peer))));
        assert!(status.contains("  latest handshake: 10 seconds ago\n"));
        assert!(status.contains("  allowed ip: 10.0.0.2/32\n"));
        assert!(status.contains("  transfer: 10 B received, 20 B sent\n"));
        assert!(!status.contains("persistent keepalive"));
    }

    #[tokio::test]
    async fn test_add_rejects_missing_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let args = AddArgs {
            interface: "wg9".to_string(),
            mtu: None,
            flavor: Flavor::Wg,
            log_dir: Some(dir.path().join("missing")),
            log_level: crate::config::LogLevel::Error,
            json: false,
        };
        let err = cmd_add(args).await.unwrap_err();
        assert!(matches!(err, WgError::Config(ConfigError::MissingLogDir(_))));
    }
}
