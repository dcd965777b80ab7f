//! `modelvault resolve` - match an image's references against the
//! registry and report what would be downloaded.

use clap::Args;
use console::style;
use modelvault::metadata;
use modelvault::resolver::ResolveOutcome;

use crate::error::CliError;

use super::Context;

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Image id or image page URL
    pub image: String,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub async fn run(ctx: &Context, args: ResolveArgs) -> Result<(), CliError> {
    let registry = ctx.registry();
    let resolver = ctx.resolver(registry.clone());

    let image_id = metadata::parse_image_id(&args.image)?;
    let metadata = metadata::fetch_metadata(&registry, image_id)
        .await?
        .ok_or_else(|| CliError::Input(format!("image {image_id} not found")))?;

    let outcome = resolver.resolve(&metadata.resources).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

pub fn print_outcome(outcome: &ResolveOutcome) {
    println!(
        "{} resolved, {} unresolved",
        style(outcome.resolved_count).green(),
        if outcome.unresolved_count > 0 {
            style(outcome.unresolved_count).red()
        } else {
            style(outcome.unresolved_count).dim()
        }
    );

    for resource in &outcome.resources {
        if resource.resolved {
            let status = if resource.already_downloaded {
                style("have").dim()
            } else {
                style("need").yellow()
            };
            let size = resource
                .size_bytes()
                .map(format_size)
                .unwrap_or_else(|| "?".to_string());
            println!(
                "  [{status}] {} ({}, {size})",
                resource.name, resource.kind
            );
        } else {
            println!(
                "  [{}] {} ({})",
                style("fail").red(),
                resource.name,
                resource.error.as_deref().unwrap_or("unresolved")
            );
        }
    }
}

/// Human-readable byte size.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
