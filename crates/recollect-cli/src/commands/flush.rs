use clap::Parser;

use crate::client::DaemonClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};

#[derive(Parser)]
pub struct FlushCommand {}

impl FlushCommand {
    pub async fn execute(&self, client: &DaemonClient, format: OutputFormat) -> CliResult<()> {
        let flushed = client.flush().await?;
        match format {
            OutputFormat::Json => print_json(&flushed)?,
            OutputFormat::Table => {
                println!("Processed {} queued items", flushed.processed);
                if flushed.queued > 0 {
                    println!("{} items moved on to later stages and are still queued", flushed.queued);
                }
            }
        }
        Ok(())
    }
}
