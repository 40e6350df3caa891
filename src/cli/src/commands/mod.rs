//! CLI command definitions and dispatch.

mod check_push;
mod digest;
mod login;
mod logout;
mod rebase;

use std::path::PathBuf;
use std::sync::Arc;

use a3s_rebase_core::Options;
use a3s_rebase_runtime::{DefaultKeychain, RegistryClient};
use clap::{Parser, Subcommand};

/// A3S Rebase — swap the base of a container image in place.
#[derive(Parser, Debug)]
#[command(name = "a3s-rebase", version, about)]
pub struct Cli {
    /// Options file (default: ~/.a3s/rebase.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Allow plain HTTP registries
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Platform to select from multi-arch images (os/arch[/variant])
    #[arg(long, global = true)]
    pub platform: Option<String>,

    /// Log progress
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebase an image onto a new base image and push it
    Rebase(rebase::RebaseArgs),
    /// Check that credentials allow pushing to a repository
    CheckPush(check_push::CheckPushArgs),
    /// Print the manifest digest of an image
    Digest(digest::DigestArgs),
    /// Log in to a registry
    Login(login::LoginArgs),
    /// Log out from a registry
    Logout(logout::LogoutArgs),
}

/// Build the options for this invocation: file, then command-line flags.
pub(crate) fn load_options(cli: &Cli) -> a3s_rebase_core::Result<Options> {
    let mut options = match cli.config {
        Some(ref path) => Options::load(path)?,
        None => Options::load_default()?,
    };
    if cli.insecure {
        options.name.insecure = true;
    }
    if let Some(ref platform) = cli.platform {
        options.transport.platform = Some(platform.clone());
    }
    options.validate()?;
    Ok(options)
}

/// Registry client using the default keychain.
pub(crate) fn registry_client(options: &Options) -> a3s_rebase_core::Result<RegistryClient> {
    RegistryClient::new(Arc::new(DefaultKeychain::new()), &options.transport)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let options = load_options(&cli)?;
    match cli.command {
        Command::Rebase(args) => rebase::execute(args, &options).await,
        Command::CheckPush(args) => check_push::execute(args, &options).await,
        Command::Digest(args) => digest::execute(args, &options).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
    }
}
