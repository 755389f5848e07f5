use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use recollect::admin::DaemonStats;

use crate::client::DaemonClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};

#[derive(Parser)]
pub struct StatsCommand {}

impl StatsCommand {
    pub async fn execute(&self, client: &DaemonClient, format: OutputFormat) -> CliResult<()> {
        let stats = client.stats().await?;
        match format {
            OutputFormat::Json => print_json(&stats)?,
            OutputFormat::Table => print_stats(&stats),
        }
        Ok(())
    }
}

fn format_uptime(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn print_stats(stats: &DaemonStats) {
    println!("Recollect Statistics");
    println!("====================\n");
    println!("Uptime: {}\n", format_uptime(stats.uptime_secs));

    let mut stages = Table::new();
    stages
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Stage", "Queued", "Batches", "Items", "Failed", "Avg batch"]);
    for stage in &stats.stages {
        stages.add_row([
            stage.name.clone(),
            stage.queued.to_string(),
            stage.batches_processed.to_string(),
            stage.items_processed.to_string(),
            stage.failed_batches.to_string(),
            format!("{:.1}", stage.average_batch_size),
        ]);
    }
    println!("{stages}\n");

    let jobs = &stats.jobs;
    println!(
        "Jobs: {} pending, {} processing, {} completed, {} failed",
        jobs.pending, jobs.processing, jobs.completed, jobs.failed
    );
    println!(
        "Caches: {} memories tracked, {} cached queries ({:.0}% hit rate)",
        stats.memory_cache_size,
        stats.query_cache_size,
        stats.query_cache_hit_rate * 100.0
    );

    match &stats.decryption {
        Some(d) => println!(
            "Decryption: {}/{} key servers healthy, {} session keys, {} decrypted, {} integrity failures",
            d.healthy_key_servers, d.key_servers, d.session_keys, d.decryptions, d.integrity_failures
        ),
        None => println!("Decryption: disabled"),
    }
}
