use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use shared_types::{RuntimeSelection, WorkerLimits};
use tracing::warn;

use crate::orchestrator::OrchestratorSettings;
use crate::sandbox::Mount;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the hypervisor listens on
    pub port: u16,
    /// Path to the hypervisor SQLite database
    pub database_url: String,
    /// Root for per-conversation mailboxes (`<data_dir>/mailboxes/<conversation>`)
    pub data_dir: PathBuf,
    /// Container CLI used to run sandboxes (`docker`, `podman`)
    pub sandbox_cli: String,
    /// Worker image
    pub sandbox_image: String,
    /// Reserved instance-name prefix; orphan cleanup only touches these
    pub sandbox_name_prefix: String,
    /// Whole-lifetime budget for one worker
    pub worker_timeout: Duration,
    /// Per-round budget inside the worker; strictly shorter than `worker_timeout`
    pub round_timeout: Duration,
    /// Wait between close/stop/kill escalation steps
    pub grace: Duration,
    /// How long a worker can sit without input before it is closed
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub round_timeout_terminates: bool,
    /// Pre-validated host/sandbox mount pairs
    pub mounts: Vec<Mount>,
    /// Secret values forwarded in the envelope, keyed by env var name
    pub secrets: BTreeMap<String, String>,
    /// Runtime used when a conversation has none pinned
    pub default_runtime: RuntimeSelection,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir = PathBuf::from(env_str("HYPERVISOR_DATA_DIR", "./data"));
        // Container runtimes need absolute host paths for bind mounts.
        let data_dir = if data_dir.is_absolute() {
            data_dir
        } else {
            std::env::current_dir()?.join(data_dir)
        };

        let mounts = env_csv("SANDBOX_MOUNTS", &[])
            .iter()
            .map(|raw| raw.parse::<Mount>())
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            port: env_parse("HYPERVISOR_PORT", 9090)?,
            database_url: env_str("HYPERVISOR_DATABASE_URL", "sqlite:./data/hypervisor.db"),
            data_dir,
            sandbox_cli: env_str("SANDBOX_CLI", "docker"),
            sandbox_image: env_str("SANDBOX_IMAGE", "agent-sandbox:latest"),
            sandbox_name_prefix: env_str("SANDBOX_NAME_PREFIX", "agent-sandbox"),
            worker_timeout: Duration::from_secs(env_parse("SANDBOX_WORKER_TIMEOUT_SECS", 1800)?),
            round_timeout: Duration::from_secs(env_parse("SANDBOX_ROUND_TIMEOUT_SECS", 1500)?),
            grace: Duration::from_secs(env_parse("SANDBOX_GRACE_SECS", 10)?),
            idle_timeout: Duration::from_secs(env_parse("SANDBOX_IDLE_TIMEOUT_SECS", 300)?),
            poll_interval: Duration::from_millis(env_parse("SANDBOX_POLL_MS", 500)?),
            max_concurrent: env_parse("SANDBOX_MAX_CONCURRENT", 5)?,
            round_timeout_terminates: env_parse("SANDBOX_ROUND_TIMEOUT_TERMINATES", true)?,
            mounts,
            secrets: collect_secrets(&env_csv("SANDBOX_SECRETS", &[])),
            default_runtime: runtime_from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.round_timeout >= self.worker_timeout {
            return Err(anyhow::anyhow!(
                "SANDBOX_ROUND_TIMEOUT_SECS ({}s) must be shorter than SANDBOX_WORKER_TIMEOUT_SECS ({}s)",
                self.round_timeout.as_secs(),
                self.worker_timeout.as_secs()
            ));
        }
        if self.max_concurrent == 0 {
            return Err(anyhow::anyhow!("SANDBOX_MAX_CONCURRENT must be at least 1"));
        }
        if self.sandbox_name_prefix.is_empty() {
            return Err(anyhow::anyhow!("SANDBOX_NAME_PREFIX must not be empty"));
        }
        Ok(())
    }

    pub fn mailbox_root(&self) -> PathBuf {
        self.data_dir.join("mailboxes")
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            image: self.sandbox_image.clone(),
            name_prefix: self.sandbox_name_prefix.clone(),
            mounts: self.mounts.clone(),
            mailbox_root: self.mailbox_root(),
            worker_timeout: self.worker_timeout,
            grace: self.grace,
            idle_timeout: self.idle_timeout,
            max_concurrent: self.max_concurrent,
            limits: WorkerLimits {
                round_timeout_ms: self.round_timeout.as_millis() as u64,
                poll_interval_ms: self.poll_interval.as_millis() as u64,
                round_timeout_terminates: self.round_timeout_terminates,
            },
            secrets: self.secrets.clone(),
            default_runtime: self.default_runtime.clone(),
        }
    }
}

fn runtime_from_env() -> anyhow::Result<RuntimeSelection> {
    let credential = std::env::var("AGENT_CREDENTIAL").ok();
    let model = std::env::var("AGENT_MODEL").ok();
    match env_str("AGENT_RUNTIME", "claude").as_str() {
        "claude" => Ok(RuntimeSelection::Claude { model, credential }),
        "opencode" => Ok(RuntimeSelection::Opencode {
            provider: env_str("AGENT_PROVIDER", "anthropic"),
            model: model.ok_or_else(|| {
                anyhow::anyhow!("AGENT_MODEL is required when AGENT_RUNTIME=opencode")
            })?,
            credential,
        }),
        other => Err(anyhow::anyhow!(
            "Invalid AGENT_RUNTIME '{other}'. Expected 'claude' or 'opencode'"
        )),
    }
}

fn collect_secrets(names: &[String]) -> BTreeMap<String, String> {
    let mut secrets = BTreeMap::new();
    for name in names {
        match std::env::var(name) {
            Ok(value) => {
                secrets.insert(name.clone(), value);
            }
            Err(_) => warn!(secret = %name, "secret listed in SANDBOX_SECRETS is not set"),
        }
    }
    secrets
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
