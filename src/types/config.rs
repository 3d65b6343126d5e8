//! Configuration structures.
//!
//! Configuration is loaded from a JSON file. Every section falls back to its
//! defaults when omitted, and relative paths are anchored at the directory of
//! the configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::MessageType;
use crate::types::{Error, Result};

/// Global relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coordinate registry source.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Durable mailbox channel.
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Actuator delivery tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Idempotency ledger and anti-flood guard.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Alert rate limiting.
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Submission policy.
    #[serde(default)]
    pub router: RouterConfig,

    /// Input device backend.
    #[serde(default)]
    pub actuator: ActuatorConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Relative paths inside the file are resolved against the file's own
    /// directory so the result never depends on the process working directory.
    pub fn load(path: &Path) -> Result<Self> {
        let path = std::fs::canonicalize(path)
            .map_err(|e| Error::config(format!("config file {}: {}", path.display(), e)))?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("config file {}: {}", path.display(), e)))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("config file {}: {}", path.display(), e)))?;

        let base = path
            .parent()
            .ok_or_else(|| Error::config(format!("config file {} has no parent", path.display())))?;
        config.anchor_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicitly supplied path; there is no working-directory
    /// fallback.
    pub fn load_required(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Err(Error::config(
                "no configuration: pass --config or set SWARM_RELAY_CONFIG",
            )),
        }
    }

    /// Resolve every relative path against `base`.
    pub fn anchor_paths(&mut self, base: &Path) {
        self.registry.path = anchor(base, &self.registry.path);
        self.mailbox.root = anchor(base, &self.mailbox.root);
        if let Some(journal) = self.mailbox.attempt_journal.take() {
            self.mailbox.attempt_journal = Some(anchor(base, &journal));
        }
    }

    /// Reject settings that would make the relay misbehave silently.
    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_attempts == 0 {
            return Err(Error::config("delivery.max_attempts must be at least 1"));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(Error::config("delivery.queue_capacity must be at least 1"));
        }
        if self.delivery.attempt_timeout.is_zero() {
            return Err(Error::config("delivery.attempt_timeout must be non-zero"));
        }
        if self.ledger.ttl.is_zero() {
            return Err(Error::config("ledger.ttl must be non-zero"));
        }
        if self.ledger.max_entries == 0 {
            return Err(Error::config("ledger.max_entries must be at least 1"));
        }
        let b = &self.registry.bounds;
        if b.min_x > b.max_x || b.min_y > b.max_y {
            return Err(Error::config("registry.bounds are inverted"));
        }
        Ok(())
    }
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Coordinate registry source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry document (absolute after `Config::load`).
    pub path: PathBuf,

    /// Valid screen area for agent coordinates.
    pub bounds: ScreenBounds,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("agents.json"),
            bounds: ScreenBounds::default(),
        }
    }
}

/// Inclusive rectangle of addressable screen coordinates.
///
/// Negative values are legal: monitors left of or above the primary display
/// have negative coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenBounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl ScreenBounds {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

impl Default for ScreenBounds {
    fn default() -> Self {
        Self {
            min_x: -3840,
            min_y: -2160,
            max_x: 7680,
            max_y: 4320,
        }
    }
}

/// Durable mailbox channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Directory holding one `<agent>.jsonl` log per agent.
    pub root: PathBuf,

    /// Optional JSON-lines journal of every delivery attempt, read by the
    /// reporting service.
    pub attempt_journal: Option<PathBuf>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("mailboxes"),
            attempt_journal: None,
        }
    }
}

/// Actuator delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per delivery, first try included.
    pub max_attempts: u32,

    /// Wall-clock bound on a single attempt.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Base backoff between attempts; multiplied by the attempt number.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// Maximum queued deliveries. Overflow is left in the mailbox only.
    pub queue_capacity: usize,

    /// Upper bound for `MessageRouter::drain`.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(250),
            queue_capacity: 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Idempotency ledger and anti-flood guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Retention of idempotency keys; also the message-id time bucket width.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Background sweep period.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Hard cap on retained keys; oldest are evicted first.
    pub max_entries: usize,

    /// Window of the (sender, recipient, type) limiter. Defaults to `ttl`.
    #[serde(with = "humantime_serde")]
    pub flood_window: Option<Duration>,

    /// Message types that bypass the triple limiter (hash dedup still applies).
    pub flood_exempt_types: Vec<MessageType>,
}

impl LedgerConfig {
    pub fn effective_flood_window(&self) -> Duration {
        self.flood_window.unwrap_or(self.ttl)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            max_entries: 10_000,
            flood_window: None,
            flood_exempt_types: Vec::new(),
        }
    }
}

/// Alert rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Alerts allowed per (agent, kind) within `window`.
    pub max_per_window: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_per_window: 1,
            window: Duration::from_secs(600),
        }
    }
}

/// Submission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Sender ids accepted without a registry entry (humans, schedulers).
    pub operator_ids: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            operator_ids: vec!["operator".to_string()],
        }
    }
}

/// Which input device drives the actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorBackend {
    /// Real input through `xdotool` (and `xclip` for the clipboard).
    Xdotool,
    /// Record actions without touching the desktop.
    DryRun,
}

/// Input device backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub backend: ActuatorBackend,

    /// Program used for pointer/keyboard input.
    pub xdotool_program: String,

    /// Program used to load the clipboard.
    pub clipboard_program: String,

    /// Per-keystroke delay for direct typing.
    pub type_delay_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            backend: ActuatorBackend::Xdotool,
            xdotool_program: "xdotool".to_string(),
            clipboard_program: "xclip".to_string(),
            type_delay_ms: 12,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
