pub mod cli;
pub mod config;
pub mod protocol;

pub use cli::{Delimiter, ShellCommand, prompt};
pub use config::ServerConfig;
pub use protocol::{RunMode, Server, ServerHandle, Session};
