mod client;
mod commands;
mod server;

pub use client::DaemonClient;
pub use commands::{ClientCommand, DaemonStatus, ServerEvent};
pub use server::run_daemon;
