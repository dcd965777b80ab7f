//! `modelvault fetch` - print generation metadata for an image.

use clap::Args;
use console::style;
use modelvault::metadata::{self, Metadata};

use crate::error::CliError;

use super::Context;

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Image id or image page URL
    pub image: String,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub async fn run(ctx: &Context, args: FetchArgs) -> Result<(), CliError> {
    let registry = ctx.registry();
    let image_id = metadata::parse_image_id(&args.image)?;
    let metadata = metadata::fetch_metadata(&registry, image_id)
        .await?
        .ok_or_else(|| CliError::Input(format!("image {image_id} not found")))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metadata).unwrap_or_default());
    } else {
        print_summary(&metadata);
    }
    Ok(())
}

fn print_summary(metadata: &Metadata) {
    println!("{}", style("Generation metadata").bold());
    println!("  Model:    {}", metadata.model_name);
    println!("  Sampler:  {}", metadata.sampler);
    if let Some(steps) = metadata.steps {
        println!("  Steps:    {steps}");
    }
    if let Some(cfg) = metadata.cfg_scale {
        println!("  CFG:      {cfg}");
    }
    if let Some(seed) = metadata.seed {
        println!("  Seed:     {seed}");
    }
    println!("  Size:     {}x{}", metadata.width, metadata.height);
    if !metadata.prompt.is_empty() {
        println!("  Prompt:   {}", truncate(&metadata.prompt, 120));
    }

    println!();
    println!(
        "{} ({})",
        style("Declared resources").bold(),
        metadata.resources.len()
    );
    for resource in &metadata.resources {
        let kind = resource
            .kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "?".to_string());
        let name = resource.name.as_deref().unwrap_or("(unnamed)");
        let detail = match (resource.model_version_id, resource.hash.as_deref()) {
            (Some(id), _) => format!("version {id}"),
            (None, Some(hash)) => format!("hash {hash}"),
            (None, None) => "no identifier".to_string(),
        };
        println!("  [{kind}] {name} ({detail})");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_and_long() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }
}
