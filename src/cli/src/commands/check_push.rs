//! `a3s-rebase check-push` command — Verify push access before doing work.

use a3s_rebase_core::Options;
use a3s_rebase_runtime::{check_push_permission, Reference};
use clap::Args;

#[derive(Args, Debug)]
pub struct CheckPushArgs {
    /// Repository or image to check (e.g., "ghcr.io/org/app")
    pub image: String,
}

pub async fn execute(args: CheckPushArgs, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let reference = Reference::parse(&args.image, &options.name)?;
    let client = super::registry_client(options)?;

    check_push_permission(&reference, &client).await?;

    println!("Push access to {} confirmed", reference.context());
    Ok(())
}
