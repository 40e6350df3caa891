//! `a3s-rebase digest` command — Print an image's manifest digest.

use a3s_rebase_core::Options;
use a3s_rebase_runtime::{ImagePuller, Reference};
use clap::Args;

#[derive(Args, Debug)]
pub struct DigestArgs {
    /// Image reference (e.g., "ghcr.io/org/app:v1")
    pub image: String,
}

pub async fn execute(args: DigestArgs, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let reference = Reference::parse(&args.image, &options.name)?;
    let puller = ImagePuller::new(super::registry_client(options)?)?;

    let digest = puller.digest(&reference).await?;

    println!("{}", digest);
    Ok(())
}
