//! Default search queries used when `SEARCH_QUERIES` is not set.

use jobcrawler_core::Query;

const DEFAULT_KEYWORDS: &[&str] = &[
    "software engineer",
    "backend developer",
    "data analyst",
    "product manager",
    "devops engineer",
];

pub fn default_queries() -> Vec<Query> {
    DEFAULT_KEYWORDS
        .iter()
        .map(|k| Query {
            keywords: k.to_string(),
            location: None,
            max_results: Some(50),
        })
        .collect()
}
