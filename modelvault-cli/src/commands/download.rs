//! `modelvault download` - fetch, resolve, and download everything an
//! image depends on, with live progress bars.

use std::collections::HashMap;
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use modelvault::config::DownloadConfig;
use modelvault::downloads::{DownloadManager, TaskEvent, TaskId, TaskStatus};
use modelvault::metadata;

use crate::error::CliError;

use super::resolve::print_outcome;
use super::Context;

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Image id or image page URL
    pub image: String,

    /// Resolve and report only; download nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum parallel downloads
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,

    /// Seconds without data before a download is considered stalled
    #[arg(long, default_value_t = 60)]
    pub idle_timeout: u64,
}

pub async fn run(ctx: &Context, args: DownloadArgs) -> Result<(), CliError> {
    let registry = ctx.registry();
    let resolver = ctx.resolver(registry.clone());

    let image_id = metadata::parse_image_id(&args.image)?;
    let metadata = metadata::fetch_metadata(&registry, image_id)
        .await?
        .ok_or_else(|| CliError::Input(format!("image {image_id} not found")))?;
    let outcome = resolver.resolve(&metadata.resources).await;
    print_outcome(&outcome);

    if args.dry_run {
        return Ok(());
    }
    if !outcome.resources.iter().any(|r| r.needs_download()) {
        println!("{}", style("Nothing to download.").green());
        return Ok(());
    }

    let config = DownloadConfig::default()
        .with_concurrency(args.concurrency)
        .with_idle_timeout(Duration::from_secs(args.idle_timeout));
    let manager = DownloadManager::with_verifier(config, Default::default(), ctx.api_key.clone())?;

    // Ctrl+C turns into a cooperative cancel-all; tasks clean up their
    // partial files before going terminal.
    {
        let manager = manager.clone();
        ctrlc::set_handler(move || {
            eprintln!("\ninterrupted, cancelling downloads...");
            manager.cancel_all();
        })
        .map_err(|e| CliError::Signal(e.to_string()))?;
    }

    let mut subscriber = manager.subscribe();
    let batch = manager.submit_batch(&outcome.resources);
    for skipped in &batch.skipped {
        println!(
            "  {} {} ({})",
            style("skip").dim(),
            skipped.name,
            skipped.reason
        );
    }

    let multi = MultiProgress::new();
    let bar_style = ProgressStyle::with_template(
        "{msg:24!} [{bar:30.cyan/dim}] {bytes}/{total_bytes} {bytes_per_sec}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();

    // Drive the bars from the event stream until the umbrella task goes
    // terminal.
    let final_status = loop {
        let Some(event) = subscriber.recv().await else {
            break manager
                .task(batch.batch_id)
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Failed);
        };
        if event.task_id == batch.batch_id {
            if event.status.is_terminal() {
                break event.status;
            }
            continue;
        }
        if !batch.children.contains(&event.task_id) {
            continue;
        }
        update_bar(&multi, &bar_style, &mut bars, &event);
    };

    for bar in bars.values() {
        bar.finish();
    }

    match final_status {
        TaskStatus::Completed => {
            println!("{}", style("All downloads completed.").green().bold());
            Ok(())
        }
        TaskStatus::Cancelled => {
            println!("{}", style("Downloads cancelled.").yellow());
            Ok(())
        }
        status => {
            let detail = manager
                .task(batch.batch_id)
                .and_then(|t| t.error)
                .unwrap_or_else(|| status.to_string());
            Err(CliError::Input(detail))
        }
    }
}

fn update_bar(
    multi: &MultiProgress,
    style_template: &ProgressStyle,
    bars: &mut HashMap<TaskId, ProgressBar>,
    event: &TaskEvent,
) {
    let bar = bars.entry(event.task_id).or_insert_with(|| {
        let bar = multi.add(ProgressBar::new(event.total_bytes.max(1)));
        bar.set_style(style_template.clone());
        bar.set_message(event.resource_name.clone());
        bar
    });

    if event.total_bytes > 0 {
        bar.set_length(event.total_bytes);
    }
    bar.set_position(event.bytes_downloaded);

    match event.status {
        TaskStatus::Verifying => bar.set_message(format!("{} (verifying)", event.resource_name)),
        TaskStatus::Completed => bar.finish_with_message(format!("{} ✓", event.resource_name)),
        TaskStatus::Failed => {
            bar.abandon_with_message(format!(
                "{} ✗ {}",
                event.resource_name,
                event.error.as_deref().unwrap_or("failed")
            ));
        }
        TaskStatus::Cancelled => {
            bar.abandon_with_message(format!("{} (cancelled)", event.resource_name));
        }
        _ => {}
    }
}
