//! `a3s-rebase logout` command — Remove stored registry credentials.

use clap::Args;

#[derive(Args, Debug)]
pub struct LogoutArgs {
    /// Registry server (default: index.docker.io)
    pub server: Option<String>,
}

pub async fn execute(args: LogoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args
        .server
        .unwrap_or_else(|| a3s_rebase_core::config::DEFAULT_REGISTRY.to_string());

    let store = a3s_rebase_runtime::oci::CredentialStore::default_path()?;
    if store.remove(&server)? {
        println!("Removing login credentials for {}", server);
    } else {
        println!("Not logged in to {}", server);
    }

    Ok(())
}
