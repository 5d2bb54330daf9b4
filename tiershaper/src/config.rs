// Configuration load/save and validation

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use tiershaper_common::{Direction, MEGABYTE, Primitive, Tier};

use crate::table::DEFAULT_MAX_ENTRIES;

const CONFIG_DIR: &str = "tiershaper";
const CONFIG_FILE: &str = "config.json";

/// Bandwidth plan for one direction, all rates in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Guaranteed hardware bandwidth; the ceiling the tiers share
    pub hw_guaranteed_bps: u64,
    pub hw_burstable_bps: u64,

    pub l0_min_bps: u64,
    pub l0_max_bps: u64,

    pub l1_min_bps: u64,
    pub l1_max_bps: u64,

    pub l2_min_bps: u64,
    pub l2_max_bps: u64,
}

impl GlobalConfig {
    /// An all-zero config means "not configured"
    pub fn is_unset(&self) -> bool {
        *self == GlobalConfig::default()
    }

    pub fn apply_defaults(&mut self) {
        if self.hw_guaranteed_bps != 0 && self.hw_burstable_bps == 0 {
            self.hw_burstable_bps = self.hw_guaranteed_bps;
        }
        if self.l0_max_bps == 0 {
            self.l0_max_bps = self.hw_guaranteed_bps;
        }
        if self.l0_min_bps == 0 {
            self.l0_min_bps = self
                .hw_guaranteed_bps
                .saturating_sub(self.l1_min_bps)
                .saturating_sub(self.l2_min_bps);
        }
    }

    /// Tiers whose minimum is below 1 MB/s. The allocator works in whole
    /// MB/s, so under congestion such a tier can be pushed down to 0, and a
    /// cap of 0 means unlimited for both admission primitives.
    pub fn unshaped_floors(&self) -> impl Iterator<Item = Tier> + '_ {
        Tier::ALL.into_iter().filter(move |tier| {
            let min = match tier {
                Tier::T0 => self.l0_min_bps,
                Tier::T1 => self.l1_min_bps,
                Tier::T2 => self.l2_min_bps,
            };
            min < MEGABYTE
        })
    }

    /// Check the plan's invariants. A minimum below 1 MB/s is accepted but
    /// logged, see [`GlobalConfig::unshaped_floors`].
    pub fn validate(&self) -> Result<()> {
        let hw = self.hw_guaranteed_bps;
        if hw == 0
            && self.hw_burstable_bps == 0
            && self.l0_min_bps == 0
            && self.l0_max_bps == 0
            && self.l1_min_bps == 0
            && self.l1_max_bps == 0
            && self.l2_min_bps == 0
            && self.l2_max_bps == 0
        {
            return Ok(());
        }

        if hw > self.hw_burstable_bps {
            bail!(
                "guaranteed bandwidth {} exceeds burstable bandwidth {}",
                hw,
                self.hw_burstable_bps
            );
        }
        if self.l1_max_bps > hw {
            bail!("L1 max {} exceeds guaranteed bandwidth {}", self.l1_max_bps, hw);
        }
        if self.l2_max_bps > hw {
            bail!("L2 max {} exceeds guaranteed bandwidth {}", self.l2_max_bps, hw);
        }
        if self.l1_min_bps > self.l1_max_bps {
            bail!("L1 min {} exceeds L1 max {}", self.l1_min_bps, self.l1_max_bps);
        }
        if self.l2_min_bps > self.l2_max_bps {
            bail!("L2 min {} exceeds L2 max {}", self.l2_min_bps, self.l2_max_bps);
        }
        if self.l1_max_bps.saturating_add(self.l2_max_bps) > hw {
            bail!(
                "L1 max + L2 max ({}) exceeds guaranteed bandwidth {}",
                self.l1_max_bps.saturating_add(self.l2_max_bps),
                hw
            );
        }
        for tier in self.unshaped_floors() {
            log::warn!(
                "{} minimum is below 1 MB/s; it goes unshaped once suppressed to its floor",
                tier
            );
        }
        Ok(())
    }
}

impl fmt::Display for GlobalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw {} online-min {} online-max {} offline-l1-min {} offline-l1-max {} offline-l2-min {} offline-l2-max {}",
            self.hw_guaranteed_bps,
            self.l0_min_bps,
            self.l0_max_bps,
            self.l1_min_bps,
            self.l1_max_bps,
            self.l2_min_bps,
            self.l2_max_bps
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSection {
    pub ingress: GlobalConfig,
    pub egress: GlobalConfig,
}

impl GlobalSection {
    pub fn get(&self, direction: Direction) -> &GlobalConfig {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

/// A pod as known to the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodConfig {
    pub pod_id: String,
    #[serde(default)]
    pub pod_uid: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub host_network: bool,
    /// Class id of the pod's traffic (0 = L0, 1 = L1, 2 = L2)
    #[serde(default)]
    pub priority: Option<u32>,
    /// Cgroup inode of the pod
    pub entity_id: u64,
    /// Ingress cap, 0 for none
    #[serde(default)]
    pub rx_bps: u64,
    /// Egress cap, 0 for none
    #[serde(default)]
    pub tx_bps: u64,
}

impl PodConfig {
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
    }

    pub fn class_id(&self) -> u32 {
        self.priority.unwrap_or(0)
    }
}

/// What to do with packets whose local address maps to no entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Shape at the global stage using the packet's own class id
    #[default]
    GlobalOnly,
    /// Admit without shaping
    Admit,
}

/// Admission primitive per stage for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePrimitives {
    pub entity: Primitive,
    pub global: Primitive,
}

impl StagePrimitives {
    pub fn preferred(direction: Direction) -> Self {
        let primitive = Primitive::preferred(direction);
        Self {
            entity: primitive,
            global: primitive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingOptions {
    pub ingress: StagePrimitives,
    pub egress: StagePrimitives,
    pub unresolved: UnresolvedPolicy,
    pub max_entries: usize,
}

impl Default for ShapingOptions {
    fn default() -> Self {
        Self {
            ingress: StagePrimitives::preferred(Direction::Ingress),
            egress: StagePrimitives::preferred(Direction::Egress),
            unresolved: UnresolvedPolicy::default(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl ShapingOptions {
    pub fn primitives(&self, direction: Direction) -> StagePrimitives {
        match direction {
            Direction::Ingress => self.ingress,
            Direction::Egress => self.egress,
        }
    }
}

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalSection,

    #[serde(default)]
    pub pods: Vec<PodConfig>,

    #[serde(default)]
    pub shaping: ShapingOptions,
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("Could not determine config directory")?;
        Ok(base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(p) => Ok(p.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load configuration; a missing file yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(path)?;

        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_json::from_str(&contents)
            .context(format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = Self::resolve_path(path)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Apply defaults to both directions and validate everything
    pub fn check(&mut self) -> Result<()> {
        for direction in Direction::ALL {
            let cfg = match direction {
                Direction::Ingress => &mut self.global.ingress,
                Direction::Egress => &mut self.global.egress,
            };
            cfg.apply_defaults();
            cfg.validate()
                .with_context(|| format!("{} config is not valid", direction))?;
        }
        for pod in &self.pods {
            if !pod.host_network && pod.entity_id == 0 {
                bail!("pod {} has no entity id", pod.pod_id);
            }
        }
        if self.shaping.max_entries == 0 {
            bail!("max_entries must be greater than zero");
        }
        Ok(())
    }

    /// Add or replace a pod by id
    pub fn set_pod(&mut self, pod: PodConfig) {
        match self.pods.iter_mut().find(|p| p.pod_id == pod.pod_id) {
            Some(existing) => *existing = pod,
            None => self.pods.push(pod),
        }
    }

    pub fn remove_pod(&mut self, pod_id: &str) -> Option<PodConfig> {
        let idx = self.pods.iter().position(|p| p.pod_id == pod_id)?;
        Some(self.pods.remove(idx))
    }

    /// Load the config at `path` and replace its global plan with the one in
    /// the legacy key/value file. Pods and shaping options are kept; a config
    /// that fails to load is an error, never silently replaced.
    pub fn import_legacy(path: Option<&Path>, legacy: &Path) -> Result<Self> {
        let (ingress, egress) = load_legacy(legacy)?;
        let mut config = Self::load(path)?;
        config.global.ingress = ingress;
        config.global.egress = egress;
        Ok(config)
    }
}

/// Parse the legacy key/value format (`hw_tx_bps_max 100` or
/// `hw_tx_bps_max=100`, one per line). Returns (ingress, egress); missing or
/// unparseable keys are 0.
pub fn parse_legacy(contents: &str) -> (GlobalConfig, GlobalConfig) {
    let mut ingress = GlobalConfig::default();
    let mut egress = GlobalConfig::default();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            },
        };
        let digits: &str = {
            let end = value
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(value.len());
            &value[..end]
        };
        let Ok(value) = digits.parse::<u64>() else {
            log::debug!("Ignoring legacy key {} with value {:?}", key, value);
            continue;
        };

        let field = match key {
            "hw_tx_bps_max" => &mut egress.hw_guaranteed_bps,
            "online_tx_bps_min" => &mut egress.l0_min_bps,
            "online_tx_bps_max" => &mut egress.l0_max_bps,
            "offline_l1_tx_bps_min" => &mut egress.l1_min_bps,
            "offline_l1_tx_bps_max" => &mut egress.l1_max_bps,
            "offline_l2_tx_bps_min" => &mut egress.l2_min_bps,
            "offline_l2_tx_bps_max" => &mut egress.l2_max_bps,
            "hw_rx_bps_max" => &mut ingress.hw_guaranteed_bps,
            "online_rx_bps_min" => &mut ingress.l0_min_bps,
            "online_rx_bps_max" => &mut ingress.l0_max_bps,
            "offline_l1_rx_bps_min" => &mut ingress.l1_min_bps,
            "offline_l1_rx_bps_max" => &mut ingress.l1_max_bps,
            "offline_l2_rx_bps_min" => &mut ingress.l2_min_bps,
            "offline_l2_rx_bps_max" => &mut ingress.l2_max_bps,
            _ => {
                log::debug!("Ignoring unknown legacy key {}", key);
                continue;
            }
        };
        *field = value;
    }

    (ingress, egress)
}

pub fn load_legacy(path: &Path) -> Result<(GlobalConfig, GlobalConfig)> {
    let contents =
        fs::read_to_string(path).context(format!("Failed to read legacy config: {:?}", path))?;
    Ok(parse_legacy(&contents))
}

/// Parse a rate string (e.g., "10M", "500K", "1.5G", "2500") to bytes per
/// second. Units are decimal.
pub fn parse_rate(rate: &str) -> Result<u64> {
    let rate = rate.trim().to_uppercase();
    let rate = rate.strip_suffix("B/S").unwrap_or(&rate);
    let rate = rate.strip_suffix('B').unwrap_or(rate);

    let (num_str, multiplier) = if let Some(n) = rate.strip_suffix('K') {
        (n, 1_000.0)
    } else if let Some(n) = rate.strip_suffix('M') {
        (n, 1_000_000.0)
    } else if let Some(n) = rate.strip_suffix('G') {
        (n, 1_000_000_000.0)
    } else {
        return rate
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("Invalid rate: {}", rate));
    };

    let number: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid rate number: {}", num_str))?;
    if !number.is_finite() || number < 0.0 {
        bail!("Invalid rate number: {}", num_str);
    }

    Ok((number * multiplier) as u64)
}
