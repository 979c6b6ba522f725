//! peerwire CLI library
//!
//! Argument parsing, layered configuration and the command handlers behind
//! the `peerwire` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::{ChatText, CommandDispatcher, CHAT_TEXT_TYPE};
pub use config::{AppConfig, CodecKind};
pub use error::{CliError, Result};
