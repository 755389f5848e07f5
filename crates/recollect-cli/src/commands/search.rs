use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use recollect::retrieval::{QueryFilters, QueryOptions, SearchType, UnifiedMemoryQuery};

use crate::client::DaemonClient;
use crate::error::{CliError, CliResult};
use crate::output::{OutputFormat, format_timestamp, print_json, truncate_string};

#[derive(Parser)]
pub struct SearchCommand {
    #[clap(help = "Query text (may be empty for temporal searches)", default_value = "")]
    pub query: String,

    #[clap(long, short, help = "User whose memories are searched")]
    pub user: String,

    #[clap(
        long,
        short = 't',
        default_value = "hybrid",
        help = "Strategy: vector, semantic, graph, temporal, keyword or hybrid"
    )]
    pub r#type: String,

    #[clap(long, short, help = "Maximum number of results")]
    pub k: Option<usize>,

    #[clap(long, help = "Minimum vector similarity (0.0-1.0)")]
    pub threshold: Option<f32>,

    #[clap(long = "category", help = "Only these categories (repeatable)")]
    pub categories: Vec<String>,

    #[clap(long = "tag", help = "Only memories carrying any of these tags (repeatable)")]
    pub tags: Vec<String>,

    #[clap(long, help = "Bypass the daemon's query cache")]
    pub no_cache: bool,

    #[clap(long, help = "Return metadata and scores only")]
    pub no_content: bool,

    #[clap(long, help = "Leave encrypted results encrypted")]
    pub no_decrypt: bool,

    #[clap(long, help = "Attach per-memory analytics")]
    pub analytics: bool,

    #[clap(long, help = "Attach linked entity labels")]
    pub relationships: bool,
}

fn parse_search_type(name: &str) -> CliResult<SearchType> {
    match name.to_lowercase().as_str() {
        "vector" => Ok(SearchType::Vector),
        "semantic" => Ok(SearchType::Semantic),
        "graph" => Ok(SearchType::Graph),
        "temporal" => Ok(SearchType::Temporal),
        "keyword" => Ok(SearchType::Keyword),
        "hybrid" => Ok(SearchType::Hybrid),
        other => Err(CliError(format!(
            "Unknown search type: {other}. Use vector, semantic, graph, temporal, keyword or hybrid."
        ))),
    }
}

impl SearchCommand {
    fn query(&self) -> CliResult<UnifiedMemoryQuery> {
        let mut query = UnifiedMemoryQuery::new(self.query.clone(), self.user.clone())
            .with_search_type(parse_search_type(&self.r#type)?)
            .with_filters(QueryFilters {
                categories: self.categories.clone(),
                tags: self.tags.clone(),
                ..Default::default()
            })
            .with_options(QueryOptions {
                use_cache: !self.no_cache,
                include_content: !self.no_content,
                include_analytics: self.analytics,
                include_relationships: self.relationships,
                auto_decrypt: !self.no_decrypt,
            });
        query.similarity.k = self.k;
        query.similarity.threshold = self.threshold;
        query.validate()?;
        Ok(query)
    }

    pub async fn execute(&self, client: &DaemonClient, format: OutputFormat) -> CliResult<()> {
        let context = client.search(&self.query()?).await?;

        if let OutputFormat::Json = format {
            return print_json(&context);
        }

        if context.results.is_empty() {
            println!("No memories found.");
        } else {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(["Score", "ID", "Category", "Created", "Content"]);

            for result in &context.results {
                let content = match (&result.content, result.encrypted) {
                    (Some(text), _) => truncate_string(text, 60),
                    (None, true) => "[encrypted]".to_string(),
                    (None, false) => String::new(),
                };
                table.add_row([
                    format!("{:.3}", result.relevance_score),
                    truncate_string(&result.id, 12),
                    result.category.clone(),
                    format_timestamp(&result.created_at),
                    content,
                ]);
            }
            println!("{table}");
        }

        let stats = &context.stats;
        println!(
            "\n{} results via {} in {} ms (cache hit rate {:.0}%)",
            stats.total_results,
            stats.search_type.as_str(),
            stats.timings.total_ms,
            stats.cache_hit_rate * 100.0
        );
        if !stats.strategies_failed.is_empty() {
            let failed: Vec<&str> = stats.strategies_failed.iter().map(|s| s.as_str()).collect();
            println!("Degraded: {} unavailable", failed.join(", "));
        }
        for suggestion in &context.suggestions {
            println!("  hint: {suggestion}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_type() {
        assert_eq!(parse_search_type("Graph").unwrap(), SearchType::Graph);
        assert!(parse_search_type("fuzzy").is_err());
    }

    #[test]
    fn test_query_from_arguments() {
        let command = SearchCommand::parse_from([
            "search", "coffee", "--user", "u1", "-t", "vector", "-k", "5", "--no-cache",
        ]);
        let query = command.query().unwrap();
        assert_eq!(query.search_type, SearchType::Vector);
        assert_eq!(query.similarity.k, Some(5));
        assert!(!query.options.use_cache);
        assert!(query.options.include_content);
    }

    #[test]
    fn test_empty_query_needs_temporal_type() {
        let command = SearchCommand::parse_from(["search", "--user", "u1"]);
        assert!(command.query().is_err());
    }
}
