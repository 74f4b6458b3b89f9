pub mod args;
pub mod commands;

pub use args::{AddArgs, Cli, Commands};
