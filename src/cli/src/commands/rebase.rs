//! `a3s-rebase rebase` command — Rebase an image onto a new base and push it.

use a3s_rebase_core::Options;
use a3s_rebase_runtime::{RebaseRequest, Rebaser, Reference};
use clap::Args;

#[derive(Args, Debug)]
pub struct RebaseArgs {
    /// Image to rebase (e.g., "ghcr.io/org/app:v1")
    #[arg(conflicts_with = "original")]
    pub image: Option<String>,

    /// Image to rebase; use the positional argument instead
    #[arg(long)]
    pub original: Option<String>,

    /// Old base image to remove (default: from the base digest annotation)
    #[arg(long, alias = "old_base")]
    pub old_base: Option<String>,

    /// New base image to insert (default: from the base name annotation)
    #[arg(long, alias = "new_base")]
    pub new_base: Option<String>,

    /// Tag to apply to the rebased image (default: overwrite the original)
    #[arg(short, long)]
    pub tag: Option<String>,
}

pub async fn execute(args: RebaseArgs, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let original = args
        .original
        .or(args.image)
        .ok_or("An image to rebase is required (positional or --original)")?;

    let parse = |s: &str| Reference::parse(s, &options.name);
    let request = RebaseRequest {
        original: parse(&original)?,
        old_base: args.old_base.as_deref().map(parse).transpose()?,
        new_base: args.new_base.as_deref().map(parse).transpose()?,
        tag: args.tag.as_deref().map(parse).transpose()?,
    };

    let client = super::registry_client(options)?;
    let rebaser = Rebaser::new(client, &options.name)?;
    let outcome = rebaser.rebase_and_push(&request).await?;

    println!("{}", outcome.reference);
    Ok(())
}
