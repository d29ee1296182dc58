use std::path::PathBuf;
use std::time::Duration;

/// Proxy configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,

    // Upstream
    pub upstream_base_url: String,
    pub api_key: Option<String>,
    pub rate_limit_rps: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,

    // Read path
    pub request_deadline: Duration,
    pub freshness_window_hours: i64,
    pub poll_interval: Duration,
    pub poll_wait: Duration,
    pub batch_cap: usize,

    // Hot cache
    pub cache_capacity: u64,
    pub paper_ttl: Duration,
    pub relation_ttl: Duration,
    pub search_ttl: Duration,
    pub negative_ttl: Duration,
    pub lock_ttl: Duration,

    // Relation ingestion
    pub large_relation_threshold: u64,
    pub relation_page_size: u64,
    pub ingest_page_cap: u64,
    pub relation_inline_cap: usize,

    // Search
    pub prefer_local_search: bool,
    pub local_search_min_results: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("SCHOLAR_PROXY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs_or_default().join(".scholar-proxy"));

        Self {
            data_dir,
            upstream_base_url: std::env::var("SCHOLAR_PROXY_UPSTREAM_URL")
                .unwrap_or_else(|_| "https://api.semanticscholar.org/graph/v1".to_string()),
            api_key: std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok(),
            rate_limit_rps: env_parse("SCHOLAR_PROXY_UPSTREAM_RPS", 10),
            retry_max_attempts: env_parse("SCHOLAR_PROXY_RETRY_ATTEMPTS", 3),
            retry_base_delay: Duration::from_millis(env_parse("SCHOLAR_PROXY_RETRY_BASE_MS", 500)),
            retry_max_delay: Duration::from_millis(env_parse("SCHOLAR_PROXY_RETRY_MAX_MS", 30_000)),
            request_timeout: Duration::from_secs(env_parse("SCHOLAR_PROXY_HTTP_TIMEOUT_SECS", 30)),
            request_deadline: Duration::from_secs(env_parse("SCHOLAR_PROXY_DEADLINE_SECS", 10)),
            freshness_window_hours: env_parse("SCHOLAR_PROXY_FRESHNESS_HOURS", 24),
            poll_interval: Duration::from_millis(env_parse("SCHOLAR_PROXY_POLL_INTERVAL_MS", 500)),
            poll_wait: Duration::from_millis(env_parse("SCHOLAR_PROXY_POLL_WAIT_MS", 4_000)),
            batch_cap: env_parse("SCHOLAR_PROXY_BATCH_CAP", 500),
            cache_capacity: env_parse("SCHOLAR_PROXY_CACHE_CAPACITY", 50_000),
            paper_ttl: Duration::from_secs(env_parse("SCHOLAR_PROXY_PAPER_TTL_SECS", 6 * 3600)),
            relation_ttl: Duration::from_secs(env_parse("SCHOLAR_PROXY_RELATION_TTL_SECS", 6 * 3600)),
            search_ttl: Duration::from_secs(env_parse("SCHOLAR_PROXY_SEARCH_TTL_SECS", 1_800)),
            negative_ttl: Duration::from_secs(env_parse("SCHOLAR_PROXY_NEGATIVE_TTL_SECS", 300)),
            lock_ttl: Duration::from_secs(env_parse("SCHOLAR_PROXY_LOCK_TTL_SECS", 300)),
            large_relation_threshold: env_parse("SCHOLAR_PROXY_LARGE_RELATION_THRESHOLD", 100),
            relation_page_size: env_parse("SCHOLAR_PROXY_RELATION_PAGE_SIZE", 100),
            ingest_page_cap: env_parse("SCHOLAR_PROXY_INGEST_PAGE_CAP", 50),
            relation_inline_cap: env_parse("SCHOLAR_PROXY_RELATION_INLINE_CAP", 100),
            prefer_local_search: std::env::var("SCHOLAR_PROXY_PREFER_LOCAL_SEARCH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            local_search_min_results: env_parse("SCHOLAR_PROXY_LOCAL_SEARCH_MIN", 5),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn dirs_or_default() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.batch_cap, 500);
        assert_eq!(cfg.large_relation_threshold, 100);
        assert_eq!(cfg.relation_page_size, 100);
        assert!(cfg.negative_ttl < cfg.paper_ttl);
        assert!(cfg.search_ttl < cfg.paper_ttl);
    }
}
