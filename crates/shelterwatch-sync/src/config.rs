use std::path::PathBuf;

/// Runtime settings, read from the environment with local-development defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub history_file: PathBuf,
    pub captures_dir: PathBuf,
    pub items_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub capture_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("SHELTERWATCH_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let path_or = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join(default))
        };

        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/shelterwatch.db".to_string()),
            history_file: path_or("HISTORY_FILE", "data/source-history.yaml"),
            captures_dir: path_or("CAPTURES_DIR", "data/html"),
            items_dir: path_or("ITEMS_DIR", "data/items"),
            scheduler_enabled: lookup("SHELTERWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            capture_cron: lookup("CAPTURE_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: lookup("SHELTERWATCH_USER_AGENT")
                .unwrap_or_else(|| "shelterwatch-bot/0.1".to_string()),
            http_timeout_secs: lookup("SHELTERWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root,
        }
    }

    pub fn sources_file(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    /// Directory holding the extracted item sets of one source.
    pub fn items_dir_for(&self, source_id: &str) -> PathBuf {
        self.items_dir.join(source_id)
    }
}
