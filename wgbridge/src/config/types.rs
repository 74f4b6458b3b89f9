use std::fmt;

/// Default MTU applied when none is configured
pub const DEFAULT_MTU: u32 = 1420;

/// Accepted MTU range for the `add` command
pub const MTU_RANGE: std::ops::RangeInclusive<u32> = 500..=1500;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Characters rejected in interface names
const FORBIDDEN_NAME_CHARS: &str = "!@#$%^&*()_+-=}{][|'~?";

/// VPN flavor served by a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Flavor {
    /// Plain WireGuard
    #[default]
    Wg,
    /// AmneziaWG (obfuscated WireGuard)
    Awg,
}

impl Flavor {
    /// Tag stored in the worker's environment for discovery
    pub fn tag(&self) -> &'static str {
        match self {
            Flavor::Wg => "wg",
            Flavor::Awg => "awg",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "wg" => Some(Flavor::Wg),
            "awg" => Some(Flavor::Awg),
            _ => None,
        }
    }

    /// Configuration applied before the device is marked up.
    ///
    /// AmneziaWG devices start with a freshly generated identity so the
    /// interface is usable before an operator installs its own key.
    pub fn initial_config(&self) -> Option<String> {
        match self {
            Flavor::Wg => None,
            Flavor::Awg => {
                let key = super::keys::generate_private_key();
                Some(format!(
                    "private_key={}\n",
                    super::keys::encode_key_hex(&key.to_bytes())
                ))
            }
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Device log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, clap::ValueEnum)]
pub enum LogLevel {
    /// Nothing is logged
    #[default]
    Silent,
    /// Errors only
    Error,
    /// Errors and verbose messages
    #[value(alias = "debug")]
    Verbose,
}

/// Identity attached to every device log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFields {
    pub name: String,
    pub pid: u32,
    pub thread_id: i64,
}

impl IdentityFields {
    /// Identity of the calling process and thread
    pub fn current(name: &str) -> Self {
        // SAFETY: gettid has no preconditions and cannot fail.
        let thread_id = unsafe { libc::syscall(libc::SYS_gettid) } as i64;

        Self {
            name: name.to_string(),
            pid: std::process::id(),
            thread_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerSettings {
    pub level: LogLevel,
    /// Emit line-oriented JSON instead of plain text
    pub structured: bool,
    pub identity: IdentityFields,
}

/// Configuration consumed by the device lifecycle controller
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Requested interface name; replaced by the name the OS assigned once
    /// the interface exists
    pub interface_name: String,
    /// MTU (0 = DEFAULT_MTU)
    pub mtu: u32,
    pub flavor: Flavor,
    pub logger_settings: LoggerSettings,
}

impl DeviceConfig {
    pub fn new(interface_name: impl Into<String>, flavor: Flavor) -> Self {
        Self {
            interface_name: interface_name.into(),
            mtu: 0,
            flavor,
            logger_settings: LoggerSettings {
                level: LogLevel::Silent,
                structured: false,
                identity: IdentityFields::current(env!("CARGO_PKG_NAME")),
            },
        }
    }

    /// MTU to create the interface with
    pub fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 {
            DEFAULT_MTU
        } else {
            self.mtu
        }
    }
}

/// Check an interface name against the characters and length the tools accept
pub fn validate_interface_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err("name is longer than 15 bytes");
    }
    if name.contains(|c: char| FORBIDDEN_NAME_CHARS.contains(c) || c.is_whitespace() || c == '/')
    {
        return Err("invalid character in interface name, example: wg0, wg1");
    }
    Ok(())
}
