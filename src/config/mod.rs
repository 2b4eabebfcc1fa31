use crate::{constants, MendError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;


/// Top-level configuration, assembled from the environment once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: BackendConfig,
    pub queue: QueueConfig,
    pub logs: LogConfig,
    pub worker: WorkerConfig,
    pub runner: RunnerConfig,
    pub repo_cache: RepoCacheConfig,
    pub webhooks: WebhookSecrets,
}

/// Dispatcher + read API bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// Connection strings for the three backends. The memory engine is the
/// only scheme this crate ships; the DSNs are still validated so a
/// misconfigured deployment fails at boot, not mid-claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub queue_dsn: String,
    pub store_dsn: String,
    pub log_dsn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub high_water: usize,
    /// When true, enqueue waits for capacity instead of failing fast.
    pub block_on_full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub retention_seconds: u64,
    pub max_lines_per_task: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub plan_timeout_seconds: u64,
    pub execute_timeout_seconds: u64,
    pub claim_visibility_seconds: u64,
    pub max_attempts: u32,
}

/// LLM CLI subprocess invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Path to the runner binary; discovered on PATH when unset.
    pub binary: Option<String>,
    /// Arguments prepended before the task descriptor path.
    pub base_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCacheConfig {
    pub root: String,
    /// Base URL working copies are cloned from, joined with the repo's
    /// `owner/name`.
    pub remote_base: String,
    pub clone_depth: u32,
    pub acquire_timeout_seconds: u64,
    pub sensitive_path_patterns: Vec<String>,
}

/// Per-provider webhook verification secrets plus the bot identities
/// filtered out for loop prevention. Secrets are held here rather than on
/// installation rows so single-tenant deployments work without an OAuth
/// flow; the dispatcher checks the installation record first and falls
/// back to these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSecrets {
    pub code_host_secret: Option<String>,
    pub issue_tracker_secret: Option<String>,
    pub chat_signing_secret: Option<String>,
    pub error_reporter_secret: Option<String>,
    pub bot_identities: Vec<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            MendError::Configuration(format!("{key} has an invalid value: {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn validate_dsn(key: &str, dsn: &str) -> Result<()> {
    if dsn == "memory://" || dsn.starts_with("memory://") {
        return Ok(());
    }
    Err(MendError::Configuration(format!(
        "{key}: unsupported DSN scheme in {dsn:?} (this build ships the memory:// engine only)"
    )))
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file when present.
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file loaded"),
        }

        let server = ServerConfig {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        };

        let backends = BackendConfig {
            queue_dsn: env::var("QUEUE_DSN").unwrap_or_else(|_| "memory://".to_string()),
            store_dsn: env::var("STORE_DSN").unwrap_or_else(|_| "memory://".to_string()),
            log_dsn: env::var("LOG_DSN").unwrap_or_else(|_| "memory://".to_string()),
        };
        validate_dsn("QUEUE_DSN", &backends.queue_dsn)?;
        validate_dsn("STORE_DSN", &backends.store_dsn)?;
        validate_dsn("LOG_DSN", &backends.log_dsn)?;

        let queue = QueueConfig {
            high_water: env_or("QUEUE_HIGH_WATER", constants::DEFAULT_QUEUE_HIGH_WATER)?,
            block_on_full: env_or("QUEUE_BLOCK_ON_FULL", false)?,
        };

        let logs = LogConfig {
            retention_seconds: env_or("LOG_RETENTION_SECONDS", constants::DEFAULT_LOG_RETENTION_SECS)?,
            max_lines_per_task: env_or(
                "LOG_MAX_LINES_PER_TASK",
                constants::DEFAULT_LOG_MAX_LINES_PER_TASK,
            )?,
        };
        if logs.max_lines_per_task == 0 {
            return Err(MendError::Configuration(
                "LOG_MAX_LINES_PER_TASK must be at least 1".to_string(),
            ));
        }

        let worker = WorkerConfig {
            worker_count: env_or("WORKER_COUNT", 2usize)?,
            plan_timeout_seconds: env_or(
                "PLAN_TIMEOUT_SECONDS",
                constants::DEFAULT_PLAN_TIMEOUT_SECS,
            )?,
            execute_timeout_seconds: env_or(
                "EXECUTE_TIMEOUT_SECONDS",
                constants::DEFAULT_EXECUTE_TIMEOUT_SECS,
            )?,
            claim_visibility_seconds: env_or(
                "CLAIM_VISIBILITY_SECONDS",
                constants::DEFAULT_CLAIM_VISIBILITY_SECS,
            )?,
            max_attempts: env_or("MAX_ATTEMPTS", constants::DEFAULT_MAX_ATTEMPTS)?,
        };
        if worker.max_attempts == 0 {
            return Err(MendError::Configuration(
                "MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let runner = RunnerConfig {
            binary: env_opt("RUNNER_BINARY"),
            base_args: env_opt("RUNNER_BASE_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        };

        let repo_cache = RepoCacheConfig {
            root: env::var("REPO_CACHE_ROOT").unwrap_or_else(|_| "./repo-cache".to_string()),
            remote_base: env::var("REPO_REMOTE_BASE")
                .unwrap_or_else(|_| "https://github.com".to_string()),
            clone_depth: env_or("REPO_CLONE_DEPTH", constants::DEFAULT_CLONE_DEPTH)?,
            acquire_timeout_seconds: env_or(
                "CACHE_ACQUIRE_TIMEOUT_SECONDS",
                constants::DEFAULT_CACHE_ACQUIRE_TIMEOUT_SECS,
            )?,
            sensitive_path_patterns: env_opt("SENSITIVE_PATH_PATTERNS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| {
                    constants::DEFAULT_SENSITIVE_PATH_PATTERNS
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
        };

        let webhooks = WebhookSecrets {
            code_host_secret: env_opt("CODE_HOST_WEBHOOK_SECRET"),
            issue_tracker_secret: env_opt("ISSUE_TRACKER_WEBHOOK_SECRET"),
            chat_signing_secret: env_opt("CHAT_SIGNING_SECRET"),
            error_reporter_secret: env_opt("ERROR_REPORTER_WEBHOOK_SECRET"),
            bot_identities: env_opt("BOT_IDENTITIES")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["mend-bot".to_string()]),
        };

        Ok(Config {
            server,
            backends,
            queue,
            logs,
            worker,
            runner,
            repo_cache,
            webhooks,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Deterministic configuration for tests, independent of the process
    /// environment.
    pub fn for_tests() -> Self {
        Config {
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            backends: BackendConfig {
                queue_dsn: "memory://".to_string(),
                store_dsn: "memory://".to_string(),
                log_dsn: "memory://".to_string(),
            },
            queue: QueueConfig {
                high_water: 100,
                block_on_full: false,
            },
            logs: LogConfig {
                retention_seconds: constants::DEFAULT_LOG_RETENTION_SECS,
                max_lines_per_task: 1000,
            },
            worker: WorkerConfig {
                worker_count: 1,
                plan_timeout_seconds: 30,
                execute_timeout_seconds: 30,
                claim_visibility_seconds: 30,
                max_attempts: constants::DEFAULT_MAX_ATTEMPTS,
            },
            runner: RunnerConfig {
                binary: None,
                base_args: Vec::new(),
            },
            repo_cache: RepoCacheConfig {
                root: "./repo-cache".to_string(),
                remote_base: "https://github.com".to_string(),
                clone_depth: 1,
                acquire_timeout_seconds: 5,
                sensitive_path_patterns: constants::DEFAULT_SENSITIVE_PATH_PATTERNS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            webhooks: WebhookSecrets {
                code_host_secret: Some("code-host-secret".to_string()),
                issue_tracker_secret: Some("issue-tracker-secret".to_string()),
                chat_signing_secret: Some("chat-secret".to_string()),
                error_reporter_secret: Some("error-reporter-secret".to_string()),
                bot_identities: vec!["mend-bot".to_string()],
            },
        }
    }
}
