use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use recollect::pipeline::{MemoryInput, SubmitOptions, new_memory_id};
use recollect::server::SubmitRequest;

use crate::client::DaemonClient;
use crate::commands::job::print_job;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};

#[derive(Parser)]
pub struct IngestCommand {
    #[clap(help = "Memory content text")]
    pub text: String,

    #[clap(long, short, help = "Owner of the memory")]
    pub user: String,

    #[clap(long, help = "Memory id (generated when omitted)")]
    pub id: Option<String>,

    #[clap(long, default_value = "general", help = "Memory category")]
    pub category: String,

    #[clap(long, default_value = "5.0", help = "Importance from 0 to 10")]
    pub importance: f32,

    #[clap(long = "tag", help = "Tag to attach (repeatable)")]
    pub tags: Vec<String>,

    #[clap(long = "entity", help = "Entity label to link in the knowledge graph (repeatable)")]
    pub entities: Vec<String>,

    #[clap(long, help = "Flush the embedding queue right away")]
    pub immediate: bool,

    #[clap(long, help = "Queue ahead of normal-priority memories")]
    pub high_priority: bool,

    #[clap(long, help = "Wait up to this many milliseconds for the job to finish")]
    pub wait: Option<u64>,
}

impl IngestCommand {
    fn request(&self) -> SubmitRequest {
        let id = self.id.clone().unwrap_or_else(new_memory_id);
        let mut memory = MemoryInput::new(id, self.user.clone(), self.text.clone())
            .with_category(self.category.clone())
            .with_importance(self.importance);
        memory.tags = self.tags.clone();
        memory.entities = self.entities.clone();
        SubmitRequest {
            memory,
            options: SubmitOptions {
                immediate_processing: self.immediate,
                high_priority: self.high_priority,
            },
        }
    }

    pub async fn execute(&self, client: &DaemonClient, format: OutputFormat) -> CliResult<()> {
        let submitted = client.submit(&self.request()).await?;

        if let Some(wait_ms) = self.wait {
            let status = client.job(&submitted.job_id, Some(wait_ms)).await?;
            return match format {
                OutputFormat::Json => print_json(&status),
                OutputFormat::Table => {
                    print_job(&status);
                    Ok(())
                }
            };
        }

        match format {
            OutputFormat::Json => print_json(&submitted)?,
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Memory", "Job"]);
                table.add_row([submitted.memory_id.as_str(), submitted.job_id.as_str()]);
                println!("{table}");
                println!("\nQueued. Check progress with: recollect-cli job {}", submitted.job_id);
            }
        }
        Ok(())
    }
}
