pub mod client;
pub mod commands;
pub mod error;
pub mod output;

pub use client::{DEFAULT_DAEMON_URL, DaemonClient};
pub use commands::{FlushCommand, IngestCommand, JobCommand, SearchCommand, StatsCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_timestamp, truncate_string};
