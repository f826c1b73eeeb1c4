//! Configuration management with file persistence and hot reload

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::arms::{ArmDomains, ArmFilter, ArmSpace, DEFAULT_TOP_K};
use crate::bandit::DEFAULT_EPSILON;
use crate::goals::{GoalMode, GoalWeightTable, GoalWeights};
use crate::reward::RewardConfig;
use crate::storage::default_database_path;

/// Cadence configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bandit: BanditConfig,
    pub reward: RewardConfig,
    pub goal: GoalConfig,
    pub arms: ArmsConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Exploration floor
    pub epsilon: f64,
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalConfig {
    pub mode: GoalMode,
    pub weights: GoalWeightTable,
    /// Per-mode dimension restriction, keyed by mode name
    pub restrictions: BTreeMap<String, ArmFilter>,
}

impl Default for GoalConfig {
    fn default() -> Self {
        let mut restrictions = BTreeMap::new();
        restrictions.insert(
            GoalMode::Monetize.to_string(),
            ArmFilter::default().with_cta_variants(&["join_pilot", "book_call"]),
        );
        Self {
            mode: GoalMode::Impact,
            weights: GoalWeightTable::default(),
            restrictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmsConfig {
    pub top_k: usize,
    pub domains: ArmDomains,
}

impl Default for ArmsConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            domains: ArmDomains::default(),
        }
    }
}

/// Hours during which no new selection starts; wraps midnight when
/// `start > end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: u8,
    pub end: u8,
}

impl QuietHours {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&hour)
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// One independently scheduled action kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionKindConfig {
    pub name: String,
    pub min_interval_minutes: u64,
    pub max_interval_minutes: u64,
    #[serde(default)]
    pub jitter_secs: u64,
    /// Dimension values fixed for this kind
    #[serde(default, skip_serializing_if = "ArmFilter::is_empty")]
    pub pins: ArmFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global pause switch; no new selections while false
    pub live: bool,
    pub resolve_grace_minutes: u64,
    pub timeout_hours: u64,
    pub reconcile_min_minutes: u64,
    pub reconcile_max_minutes: u64,
    /// Offset applied to UTC when deriving the posting hour and quiet hours
    pub utc_offset_hours: i32,
    pub config_poll_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    pub actions: Vec<ActionKindConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            live: false,
            resolve_grace_minutes: 60,
            timeout_hours: 48,
            reconcile_min_minutes: 35,
            reconcile_max_minutes: 60,
            utc_offset_hours: 0,
            config_poll_secs: 30,
            quiet_hours: None,
            actions: vec![
                ActionKindConfig {
                    name: "post".to_string(),
                    min_interval_minutes: 45,
                    max_interval_minutes: 90,
                    jitter_secs: 300,
                    pins: ArmFilter::default(),
                },
                ActionKindConfig {
                    name: "question".to_string(),
                    min_interval_minutes: 25,
                    max_interval_minutes: 45,
                    jitter_secs: 180,
                    pins: ArmFilter::default().with_post_type("question"),
                },
            ],
        }
    }
}

impl SchedulerConfig {
    pub fn resolve_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.resolve_grace_minutes as i64)
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.timeout_hours as i64)
    }

    pub fn action(&self, name: &str) -> Option<&ActionKindConfig> {
        self.actions.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

const KEYS: &[&str] = &[
    "bandit.epsilon",
    "bandit.seed",
    "reward.window_days",
    "reward.method",
    "reward.revenue_per_click",
    "goal.mode",
    "goal.weights.IMPACT",
    "goal.weights.REVENUE",
    "goal.weights.AUTHORITY",
    "goal.weights.FAME",
    "goal.weights.MONETIZE",
    "arms.top_k",
    "arms.post_types",
    "arms.topics",
    "arms.hour_bins",
    "arms.cta_variants",
    "arms.intensities",
    "scheduler.live",
    "scheduler.resolve_grace_minutes",
    "scheduler.timeout_hours",
    "scheduler.reconcile_min_minutes",
    "scheduler.reconcile_max_minutes",
    "scheduler.quiet_hours",
    "scheduler.utc_offset_hours",
    "scheduler.config_poll_secs",
    "storage.database_path",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("CADENCE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("cadence")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create config directory: {}", dir.display())
                })?;
            }
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.bandit.epsilon) {
            return Err(anyhow!("bandit.epsilon must be between 0.0 and 1.0"));
        }
        self.reward.validate()?;
        self.goal.weights.validate()?;
        self.arm_space()?;

        let s = &self.scheduler;
        if s.resolve_grace() >= s.timeout() {
            return Err(anyhow!(
                "scheduler.resolve_grace_minutes must be shorter than scheduler.timeout_hours"
            ));
        }
        if s.reconcile_min_minutes == 0 || s.reconcile_min_minutes > s.reconcile_max_minutes {
            return Err(anyhow!(
                "scheduler reconcile interval must satisfy 1 <= min <= max"
            ));
        }
        if let Some(q) = s.quiet_hours {
            if q.start > 23 || q.end > 23 {
                return Err(anyhow!("scheduler.quiet_hours must be within 0-23"));
            }
        }
        if !(-12..=14).contains(&s.utc_offset_hours) {
            return Err(anyhow!("scheduler.utc_offset_hours must be within -12..=14"));
        }
        if s.config_poll_secs == 0 {
            return Err(anyhow!("scheduler.config_poll_secs must be at least 1"));
        }

        let mut names: Vec<&str> = Vec::new();
        for action in &s.actions {
            if action.name.trim().is_empty() {
                return Err(anyhow!("action kinds need a name"));
            }
            if names.contains(&action.name.as_str()) {
                return Err(anyhow!("duplicate action kind '{}'", action.name));
            }
            names.push(&action.name);
            if action.min_interval_minutes == 0
                || action.min_interval_minutes > action.max_interval_minutes
            {
                return Err(anyhow!(
                    "action '{}': interval must satisfy 1 <= min <= max",
                    action.name
                ));
            }
            self.arms
                .domains
                .restrict(&action.pins)
                .with_context(|| format!("action '{}' pins", action.name))?;
        }
        Ok(())
    }

    /// Build the arm space described by `arms` and `goal.restrictions`
    pub fn arm_space(&self) -> crate::Result<ArmSpace> {
        let mut space = ArmSpace::new(self.arms.domains.clone(), self.arms.top_k)?;
        for (name, filter) in &self.goal.restrictions {
            let mode: GoalMode = name.parse()?;
            space = space.with_goal_restriction(mode, filter.clone())?;
        }
        Ok(space)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        if let Some(mode) = key.strip_prefix("goal.weights.") {
            let mode: GoalMode = mode.parse()?;
            let w = self
                .goal
                .weights
                .get(mode)
                .ok_or_else(|| anyhow!("No weights configured for {}", mode))?;
            return Ok(format!("{},{},{},{}", w.fame, w.revenue, w.authority, w.penalty));
        }

        let value = match key {
            "bandit.epsilon" => self.bandit.epsilon.to_string(),
            "bandit.seed" => self
                .bandit
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(entropy)".to_string()),

            "reward.window_days" => self.reward.window_days.to_string(),
            "reward.method" => self.reward.method.to_string(),
            "reward.revenue_per_click" => self.reward.revenue_per_click.to_string(),

            "goal.mode" => self.goal.mode.to_string(),

            "arms.top_k" => self.arms.top_k.to_string(),
            "arms.post_types" => self.arms.domains.post_types.join(", "),
            "arms.topics" => self.arms.domains.topics.join(", "),
            "arms.hour_bins" => join_numbers(&self.arms.domains.hour_bins),
            "arms.cta_variants" => self.arms.domains.cta_variants.join(", "),
            "arms.intensities" => join_numbers(&self.arms.domains.intensities),

            "scheduler.live" => self.scheduler.live.to_string(),
            "scheduler.resolve_grace_minutes" => self.scheduler.resolve_grace_minutes.to_string(),
            "scheduler.timeout_hours" => self.scheduler.timeout_hours.to_string(),
            "scheduler.reconcile_min_minutes" => self.scheduler.reconcile_min_minutes.to_string(),
            "scheduler.reconcile_max_minutes" => self.scheduler.reconcile_max_minutes.to_string(),
            "scheduler.quiet_hours" => match self.scheduler.quiet_hours {
                Some(q) => format!("{}-{}", q.start, q.end),
                None => "off".to_string(),
            },
            "scheduler.utc_offset_hours" => self.scheduler.utc_offset_hours.to_string(),
            "scheduler.config_poll_secs" => self.scheduler.config_poll_secs.to_string(),

            "storage.database_path" => self.storage.database_path.display().to_string(),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `cadence config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key; the result is validated as a whole
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if let Some(mode) = key.strip_prefix("goal.weights.") {
            let mode: GoalMode = mode.parse()?;
            let parts = parse_list::<f64>(value, "goal weights")?;
            let &[fame, revenue, authority, penalty] = parts.as_slice() else {
                return Err(anyhow!(
                    "Goal weights take four values: fame,revenue,authority,penalty"
                ));
            };
            self.goal
                .weights
                .set(mode, GoalWeights::new(fame, revenue, authority, penalty));
            return Ok(());
        }

        match key {
            "bandit.epsilon" => self.bandit.epsilon = parse_value(value, key)?,
            "bandit.seed" => {
                self.bandit.seed = match value.trim() {
                    "" | "none" | "entropy" => None,
                    v => Some(parse_value(v, key)?),
                }
            }

            "reward.window_days" => self.reward.window_days = parse_value(value, key)?,
            "reward.method" => self.reward.method = value.parse()?,
            "reward.revenue_per_click" => self.reward.revenue_per_click = parse_value(value, key)?,

            "goal.mode" => self.goal.mode = value.parse()?,

            "arms.top_k" => self.arms.top_k = parse_value(value, key)?,
            "arms.post_types" => self.arms.domains.post_types = parse_list(value, key)?,
            "arms.topics" => self.arms.domains.topics = parse_list(value, key)?,
            "arms.hour_bins" => self.arms.domains.hour_bins = parse_list(value, key)?,
            "arms.cta_variants" => self.arms.domains.cta_variants = parse_list(value, key)?,
            "arms.intensities" => self.arms.domains.intensities = parse_list(value, key)?,

            "scheduler.live" => self.scheduler.live = parse_switch(value)?,
            "scheduler.resolve_grace_minutes" => {
                self.scheduler.resolve_grace_minutes = parse_value(value, key)?
            }
            "scheduler.timeout_hours" => self.scheduler.timeout_hours = parse_value(value, key)?,
            "scheduler.reconcile_min_minutes" => {
                self.scheduler.reconcile_min_minutes = parse_value(value, key)?
            }
            "scheduler.reconcile_max_minutes" => {
                self.scheduler.reconcile_max_minutes = parse_value(value, key)?
            }
            "scheduler.quiet_hours" => {
                self.scheduler.quiet_hours = match value.trim() {
                    "" | "off" | "none" => None,
                    v => {
                        let (start, end) = v
                            .split_once('-')
                            .ok_or_else(|| anyhow!("Quiet hours take the form START-END, e.g. 23-6"))?;
                        Some(QuietHours {
                            start: parse_value(start, key)?,
                            end: parse_value(end, key)?,
                        })
                    }
                }
            }
            "scheduler.utc_offset_hours" => self.scheduler.utc_offset_hours = parse_value(value, key)?,
            "scheduler.config_poll_secs" => self.scheduler.config_poll_secs = parse_value(value, key)?,

            "storage.database_path" => self.storage.database_path = PathBuf::from(value.trim()),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `cadence config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// Every settable key
    pub fn keys() -> &'static [&'static str] {
        KEYS
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn join_numbers(values: &[u8]) -> String {
    values
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_value<T>(value: &str, key: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

fn parse_list<T>(value: &str, key: &str) -> anyhow::Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(s, key))
        .collect()
}

fn parse_switch(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(anyhow!("Expected on/off, got '{}'", other)),
    }
}

/// Shared, hot-swappable configuration.
///
/// Readers take an `Arc<Config>` snapshot per tick; a swap never tears a
/// reader's view. The version counter lets consumers notice a swap cheaply.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    version: AtomicU64,
    source: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigHandle {
    /// In-memory handle with no backing file
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(0),
            source: None,
            last_modified: Mutex::new(None),
        }
    }

    /// Handle backed by a file that [`reload_if_changed`](Self::reload_if_changed) polls
    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(0),
            last_modified: Mutex::new(modified_time(&path)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Validate and swap in a new configuration
    pub fn replace(&self, config: Config) -> anyhow::Result<()> {
        config.validate()?;
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(config);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Re-read the backing file if its modification time moved.
    ///
    /// Returns whether a new configuration was applied. An invalid file is an
    /// error and leaves the current configuration in place.
    pub fn reload_if_changed(&self) -> anyhow::Result<bool> {
        let Some(path) = &self.source else {
            return Ok(false);
        };
        let modified = modified_time(path);
        {
            let mut last = self.last_modified.lock().unwrap_or_else(|p| p.into_inner());
            if *last == modified {
                return Ok(false);
            }
            *last = modified;
        }

        let config = Config::load_from(path)?;
        if *self.snapshot() == config {
            debug!(path = %path.display(), "Config file touched without changes");
            return Ok(false);
        }
        self.replace(config)?;
        info!(path = %path.display(), version = self.version(), "Configuration reloaded");
        Ok(true)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
