pub mod flush;
pub mod ingest;
pub mod job;
pub mod search;
pub mod stats;

pub use flush::FlushCommand;
pub use ingest::IngestCommand;
pub use job::JobCommand;
pub use search::SearchCommand;
pub use stats::StatsCommand;
