//! Kernel configuration
//!
//! Boot-time tunables for the scheduler, capability tables, IPC and the
//! recycler. Loaded from TOML; every field has a default so an empty file
//! (or no file) boots a four-core kernel.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Number of priority levels
pub const PRIO_NUM: usize = 256;
/// Highest priority
pub const MAX_PRIO: usize = PRIO_NUM - 1;
/// Reserved for idle threads
pub const IDLE_PRIO: usize = 0;
/// Upper bound on simulated cores
pub const MAX_CPUS: usize = 64;
/// Upper bound on `cap.max_transfer`
pub const MAX_TRANSFER_CAPS: usize = 64;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub sched: SchedConfig,

    #[serde(default)]
    pub cap: CapConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub recycle: RecycleConfig,
}

/// Selection discipline within one priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// Round-robin: equal-priority threads share the core by budget
    Pbrr,
    /// FIFO: the running thread keeps the core until it blocks or yields
    Pbfifo,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Number of simulated cores
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    #[serde(default = "default_policy")]
    pub policy: SchedPolicy,

    /// Ticks a thread may run before round-robin rotation
    #[serde(default = "default_budget")]
    pub default_budget: u32,

    /// Priority given to threads that do not ask for one
    #[serde(default = "default_prio")]
    pub default_prio: usize,

    /// Scheduler tick length in microseconds
    #[serde(default = "default_tick_us")]
    pub tick_us: u64,

    /// Save FPU state lazily on first use after a switch
    #[serde(default = "default_true")]
    pub lazy_fpu: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            policy: default_policy(),
            default_budget: default_budget(),
            default_prio: default_prio(),
            tick_us: default_tick_us(),
            lazy_fpu: true,
        }
    }
}

/// Capability table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapConfig {
    /// Slots added each time a table grows
    #[serde(default = "default_slot_chunk")]
    pub slot_chunk: usize,

    /// Hard limit on slots per cap_group
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    /// Caps moved by one `transfer_caps`
    #[serde(default = "default_max_transfer")]
    pub max_transfer: usize,

    /// Live kernel objects before allocation reports out-of-memory
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
}

impl Default for CapConfig {
    fn default() -> Self {
        Self {
            slot_chunk: default_slot_chunk(),
            max_slots: default_max_slots(),
            max_transfer: default_max_transfer(),
            max_objects: default_max_objects(),
        }
    }
}

/// IPC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Staging area per call/reply message
    #[serde(default = "default_msg_max_len")]
    pub msg_max_len: usize,

    /// Payload limit for fire-and-forget messages
    #[serde(default = "default_notify_max_len")]
    pub notify_max_len: usize,

    /// Pending messages per channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            msg_max_len: default_msg_max_len(),
            notify_max_len: default_notify_max_len(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Recycler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecycleConfig {
    /// Entries in the user-visible exit ring
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u32,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            ring_entries: default_ring_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cpus() -> usize {
    4
}

fn default_policy() -> SchedPolicy {
    SchedPolicy::Pbrr
}

fn default_budget() -> u32 {
    1
}

fn default_prio() -> usize {
    10
}

fn default_tick_us() -> u64 {
    10_000 // 10ms
}

fn default_slot_chunk() -> usize {
    64
}

fn default_max_slots() -> usize {
    4096
}

fn default_max_transfer() -> usize {
    16
}

fn default_max_objects() -> usize {
    1 << 16
}

fn default_msg_max_len() -> usize {
    4096
}

fn default_notify_max_len() -> usize {
    152
}

fn default_channel_capacity() -> usize {
    64
}

fn default_ring_entries() -> u32 {
    64
}

impl KernelConfig {
    /// Load configuration from file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the kernel cannot boot with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sched;
        if s.cpus == 0 || s.cpus > MAX_CPUS {
            return Err(ConfigError::Invalid(format!(
                "sched.cpus must be in 1..={MAX_CPUS}, got {}",
                s.cpus
            )));
        }
        if s.default_budget == 0 {
            return Err(ConfigError::Invalid("sched.default_budget must be non-zero".into()));
        }
        if s.default_prio <= IDLE_PRIO || s.default_prio > MAX_PRIO {
            return Err(ConfigError::Invalid(format!(
                "sched.default_prio must be in 1..={MAX_PRIO}, got {}",
                s.default_prio
            )));
        }
        if s.tick_us == 0 {
            return Err(ConfigError::Invalid("sched.tick_us must be non-zero".into()));
        }

        let c = &self.cap;
        // Slots 0 and 1 are reserved for the group itself and its vmspace.
        if c.slot_chunk < 2 || c.max_slots < c.slot_chunk {
            return Err(ConfigError::Invalid(
                "cap.slot_chunk must be >= 2 and <= cap.max_slots".into(),
            ));
        }
        if c.max_transfer == 0 || c.max_objects == 0 {
            return Err(ConfigError::Invalid(
                "cap.max_transfer and cap.max_objects must be non-zero".into(),
            ));
        }
        if c.max_transfer > MAX_TRANSFER_CAPS {
            return Err(ConfigError::Invalid(format!(
                "cap.max_transfer must be at most {MAX_TRANSFER_CAPS}, got {}",
                c.max_transfer
            )));
        }

        let i = &self.ipc;
        if i.msg_max_len == 0 || i.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "ipc.msg_max_len and ipc.channel_capacity must be non-zero".into(),
            ));
        }
        if i.notify_max_len > i.msg_max_len {
            return Err(ConfigError::Invalid(
                "ipc.notify_max_len exceeds ipc.msg_max_len".into(),
            ));
        }

        if self.recycle.ring_entries == 0 {
            return Err(ConfigError::Invalid("recycle.ring_entries must be non-zero".into()));
        }
        Ok(())
    }
}
