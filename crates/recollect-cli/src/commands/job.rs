use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use recollect::pipeline::JobStatus;

use crate::client::DaemonClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, print_json};

#[derive(Parser)]
pub struct JobCommand {
    #[clap(help = "Job id returned by ingest")]
    pub id: String,

    #[clap(long, help = "Wait up to this many milliseconds for the job to finish")]
    pub wait: Option<u64>,
}

impl JobCommand {
    pub async fn execute(&self, client: &DaemonClient, format: OutputFormat) -> CliResult<()> {
        let status = client.job(&self.id, self.wait).await?;
        match format {
            OutputFormat::Json => print_json(&status)?,
            OutputFormat::Table => print_job(&status),
        }
        Ok(())
    }
}

pub(crate) fn print_job(status: &JobStatus) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Field", "Value"]);

    table.add_row(["Job", status.id.as_str()]);
    table.add_row(["Memory", status.memory_id.as_str()]);
    table.add_row(["User", status.user_id.as_str()]);
    table.add_row(["Stage", &format!("{:?}", status.stage)]);
    table.add_row(["State", &format!("{:?}", status.state)]);
    table.add_row(["Started", &format_timestamp(&status.started_at)]);
    if let Some(ended) = &status.ended_at {
        table.add_row(["Ended", &format_timestamp(ended)]);
    }
    if let Some(ms) = status.processing_time_ms {
        table.add_row(["Processing time", &format!("{ms} ms")]);
    }
    if status.cached {
        table.add_row(["Cached", "yes"]);
    }
    if let Some(error) = &status.error {
        table.add_row(["Error", error.as_str()]);
    }

    println!("{table}");
}
