use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub reactor: ReactorConfig,
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub shard_count: usize,
    pub tick_interval_ms: u64,
    pub action_queue_capacity: usize,
    pub worker_queue_capacity: usize,
    pub max_pending_messages: usize,
    pub max_stage_retries: u32,
    pub check_tag_interval_ticks: u32,
    pub idle_timeout_ticks: u32,
    pub whitelist_off_of_person: bool,
    pub system_uid: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            tick_interval_ms: 100,
            action_queue_capacity: 1024,
            worker_queue_capacity: 1024,
            max_pending_messages: 1024,
            max_stage_retries: 5,
            check_tag_interval_ticks: 100,
            idle_timeout_ticks: 6000,
            whitelist_off_of_person: false,
            system_uid: "____system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub election_timeout_tick: u32,
    pub heartbeat_timeout_tick: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_tick: 10,
            heartbeat_timeout_tick: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

/// Partial config layered over a base (deployment file over defaults,
/// environment over file).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigOverride {
    pub logging: Option<LoggingConfigOverride>,
    pub reactor: Option<ReactorConfigOverride>,
    pub consensus: Option<ConsensusConfigOverride>,
}

impl ConfigOverride {
    pub fn apply_to(&self, target: &mut Config) {
        if let Some(logging) = &self.logging {
            logging.apply_to(&mut target.logging);
        }
        if let Some(reactor) = &self.reactor {
            reactor.apply_to(&mut target.reactor);
        }
        if let Some(consensus) = &self.consensus {
            consensus.apply_to(&mut target.consensus);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReactorConfigOverride {
    pub shard_count: Option<usize>,
    pub tick_interval_ms: Option<u64>,
    pub action_queue_capacity: Option<usize>,
    pub worker_queue_capacity: Option<usize>,
    pub max_pending_messages: Option<usize>,
    pub max_stage_retries: Option<u32>,
    pub check_tag_interval_ticks: Option<u32>,
    pub idle_timeout_ticks: Option<u32>,
    pub whitelist_off_of_person: Option<bool>,
    pub system_uid: Option<String>,
}

impl ReactorConfigOverride {
    pub fn apply_to(&self, target: &mut ReactorConfig) {
        if let Some(shard_count) = self.shard_count {
            target.shard_count = shard_count;
        }
        if let Some(tick_interval_ms) = self.tick_interval_ms {
            target.tick_interval_ms = tick_interval_ms;
        }
        if let Some(capacity) = self.action_queue_capacity {
            target.action_queue_capacity = capacity;
        }
        if let Some(capacity) = self.worker_queue_capacity {
            target.worker_queue_capacity = capacity;
        }
        if let Some(max) = self.max_pending_messages {
            target.max_pending_messages = max;
        }
        if let Some(max) = self.max_stage_retries {
            target.max_stage_retries = max;
        }
        if let Some(ticks) = self.check_tag_interval_ticks {
            target.check_tag_interval_ticks = ticks;
        }
        if let Some(ticks) = self.idle_timeout_ticks {
            target.idle_timeout_ticks = ticks;
        }
        if let Some(off) = self.whitelist_off_of_person {
            target.whitelist_off_of_person = off;
        }
        if let Some(uid) = self.system_uid.as_ref() {
            target.system_uid = uid.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConsensusConfigOverride {
    pub election_timeout_tick: Option<u32>,
    pub heartbeat_timeout_tick: Option<u32>,
}

impl ConsensusConfigOverride {
    pub fn apply_to(&self, target: &mut ConsensusConfig) {
        if let Some(ticks) = self.election_timeout_tick {
            target.election_timeout_tick = ticks;
        }
        if let Some(ticks) = self.heartbeat_timeout_tick {
            target.heartbeat_timeout_tick = ticks;
        }
    }
}
