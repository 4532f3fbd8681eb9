use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ai::AiConfig;
use crate::scoring::ScoringConfig;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

/// Directory from the environment, falling back to `default`. An empty value or
/// `off` disables the feature.
fn env_dir(name: &str, default: &str) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("off") => None,
        Ok(v) => Some(PathBuf::from(v.trim())),
        Err(_) => Some(PathBuf::from(default)),
    }
}

/// Per-run policy. Passed explicitly into every run; nothing reads it globally.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Items processed per source per run; the rest are deferred to the next run.
    pub batch_size: usize,
    pub score_threshold: u8,
    pub max_in_flight: usize,
    pub fetch_timeout: Duration,
    /// When non-empty, only these source ids run.
    pub only_sources: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            score_threshold: 50,
            max_in_flight: 8,
            fetch_timeout: Duration::from_secs(60),
            only_sources: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("INTAKE_BATCH_SIZE", defaults.batch_size),
            score_threshold: env_or::<u8>("INTAKE_SCORE_THRESHOLD", defaults.score_threshold).min(100),
            max_in_flight: env_or("INTAKE_MAX_IN_FLIGHT", defaults.max_in_flight),
            fetch_timeout: Duration::from_secs(env_or(
                "INTAKE_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
            only_sources: Vec::new(),
        }
    }

    /// Concurrency actually used: at least one, never more than the batch.
    pub fn effective_in_flight(&self) -> usize {
        self.max_in_flight.max(1).min(self.batch_size.max(1))
    }

    pub fn includes(&self, source_id: &str) -> bool {
        self.only_sources.is_empty() || self.only_sources.iter().any(|s| s == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub workspace_root: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub web_port: u16,
    pub run: RunConfig,
    pub scoring: ScoringConfig,
    pub ai: Option<AiConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_path: PathBuf::from("sources.yaml"),
            workspace_root: PathBuf::from("."),
            artifacts_dir: Some(PathBuf::from("./artifacts")),
            reports_dir: Some(PathBuf::from("./reports")),
            user_agent: "content-intake-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            // Six fields: seconds first.
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
            web_port: 3000,
            run: RunConfig::default(),
            scoring: ScoringConfig::default(),
            ai: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut scoring = defaults.scoring;
        scoring.ai_weight = env_or("AI_WEIGHT", scoring.ai_weight).clamp(0.0, 1.0);
        scoring.ai_timeout = Duration::from_secs(env_or("AI_TIMEOUT_SECS", scoring.ai_timeout.as_secs()));

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            sources_path: std::env::var("INTAKE_SOURCES")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            workspace_root: defaults.workspace_root,
            artifacts_dir: env_dir("ARTIFACTS_DIR", "./artifacts"),
            reports_dir: env_dir("REPORTS_DIR", "./reports"),
            user_agent: std::env::var("INTAKE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("INTAKE_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scheduler_enabled: env_flag("INTAKE_SCHEDULER_ENABLED"),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
            web_port: env_or("INTAKE_WEB_PORT", defaults.web_port),
            run: RunConfig::from_env(),
            scoring,
            ai: AiConfig::from_env(),
        }
    }
}
