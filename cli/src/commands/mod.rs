//! CLI command definitions and dispatch.

mod list;
mod login;
mod logout;
mod pull;

use clap::{Parser, Subcommand};
use vmpull_core::config::StorageConfig;

/// vmpull: pull VM images from OCI registries.
#[derive(Parser)]
#[command(name = "vmpull", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull a VM image from a registry
    Pull(pull::PullArgs),
    /// List pulled and local VMs
    List(list::ListArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
}

/// Storage root for this invocation (`VMPULL_HOME` or `~/.vmpull`).
pub(crate) fn storage() -> StorageConfig {
    StorageConfig::default()
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Pull(args) => pull::execute(args).await,
        Command::List(args) => list::execute(args).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
    }
}
