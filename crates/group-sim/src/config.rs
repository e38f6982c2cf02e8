//! Simulation configuration loading

use std::path::Path;

use anyhow::{bail, Context, Result};
use group_core::discovery::DEFAULT_LOOKUP_NAME;
use group_core::BroadcastConfig;
use serde::{Deserialize, Serialize};

/// Settings for one simulated run
///
/// Keys are camelCase throughout, matching the nested `broadcast` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimConfig {
    /// Number of processes, numbered from 1
    #[serde(default = "default_processes")]
    pub processes: u64,

    /// Processes allowed to export their service reference
    #[serde(default = "default_authorized")]
    pub authorized: Vec<u64>,

    /// Application messages to multicast, round-robin over the processes
    #[serde(default = "default_messages")]
    pub messages: usize,

    /// Links on which every unicast fails
    #[serde(default)]
    pub fail_links: Vec<LinkCut>,

    /// Start the last process late and announce its join to the group
    #[serde(default = "default_true")]
    pub join: bool,

    /// Broadcaster settings shared by every process
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Name the proxy is exported under
    #[serde(default = "default_lookup_name")]
    pub lookup_name: String,
}

/// An unreachable destination. Without `from`, every sender is cut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCut {
    #[serde(default)]
    pub from: Option<u64>,
    pub to: u64,
}

fn default_processes() -> u64 {
    3
}

fn default_authorized() -> Vec<u64> {
    vec![1]
}

fn default_messages() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_lookup_name() -> String {
    DEFAULT_LOOKUP_NAME.to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            authorized: default_authorized(),
            messages: default_messages(),
            fail_links: Vec::new(),
            join: true,
            broadcast: BroadcastConfig::default(),
            lookup_name: default_lookup_name(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a YAML file, falling back to defaults when it
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: SimConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Check that every referenced process exists.
    pub fn validate(&self) -> Result<()> {
        if self.processes == 0 {
            bail!("at least one process is required");
        }
        if self.join && self.processes < 2 {
            bail!("a late join needs at least two processes");
        }
        if self.lookup_name.is_empty() {
            bail!("lookup name must not be empty");
        }

        let in_range = |n: u64| (1..=self.processes).contains(&n);
        if let Some(n) = self.authorized.iter().find(|n| !in_range(**n)) {
            bail!("authorized process {n} is out of range 1..={}", self.processes);
        }
        for cut in &self.fail_links {
            if !in_range(cut.to) || cut.from.is_some_and(|from| !in_range(from)) {
                bail!("link cut {cut:?} refers to an unknown process");
            }
        }
        Ok(())
    }

    /// Whether process `n` may export its reference.
    pub fn is_authorized(&self, n: u64) -> bool {
        self.authorized.contains(&n)
    }
}
