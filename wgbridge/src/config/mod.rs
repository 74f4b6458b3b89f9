pub mod keys;
pub mod types;

pub use types::{
    validate_interface_name, DeviceConfig, Flavor, IdentityFields, LogLevel, LoggerSettings,
    DEFAULT_MTU, MTU_RANGE,
};
