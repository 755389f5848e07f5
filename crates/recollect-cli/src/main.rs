use clap::{Parser, Subcommand};
use recollect_cli::commands::{FlushCommand, IngestCommand, JobCommand, SearchCommand, StatsCommand};
use recollect_cli::error::CliResult;
use recollect_cli::output::OutputFormat;
use recollect_cli::{DEFAULT_DAEMON_URL, DaemonClient};

#[derive(Parser)]
#[command(name = "recollect-cli")]
#[command(about = "Recollect CLI - Management tool for the recollect daemon")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(
        long,
        global = true,
        default_value = DEFAULT_DAEMON_URL,
        help = "Base URL of the running daemon"
    )]
    pub url: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Submit a memory to the ingestion pipeline")]
    Ingest(IngestCommand),

    #[clap(about = "Search a user's memories")]
    Search(SearchCommand),

    #[clap(about = "Show the status of an ingestion job")]
    Job(JobCommand),

    #[clap(about = "Flush every pipeline queue now")]
    Flush(FlushCommand),

    #[clap(about = "Show daemon statistics")]
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let client = DaemonClient::new(&cli.url)?;

    match &cli.command {
        Command::Ingest(cmd) => cmd.execute(&client, format).await,
        Command::Search(cmd) => cmd.execute(&client, format).await,
        Command::Job(cmd) => cmd.execute(&client, format).await,
        Command::Flush(cmd) => cmd.execute(&client, format).await,
        Command::Stats(cmd) => cmd.execute(&client, format).await,
    }
}
