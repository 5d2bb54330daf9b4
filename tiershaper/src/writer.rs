// Control-plane access to the shaping maps

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tiershaper_common::{
    Direction, EntityId, GlobalRateCfg, RateCfgSnapshot, RingSnapshot, StatsSnapshot, Tier,
    TierSnapshot,
};

use crate::config::{Config, GlobalConfig, PodConfig};
use crate::maps::ShaperMaps;
use crate::resolver::AddrKey;

/// Configured caps of one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityRate {
    pub entity: EntityId,
    pub rx_bps: u64,
    pub tx_bps: u64,
}

/// One row of the pod directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodInfo {
    pub addr: IpAddr,
    pub entity: EntityId,
    pub class_id: u32,
}

/// Writes configuration into [`ShaperMaps`] and reads state back.
///
/// Mutating calls take `&mut self`: the maps tolerate concurrent readers but
/// only one writer.
pub struct MapWriter {
    maps: Arc<ShaperMaps>,
}

fn desired_snapshot(cfg: &GlobalConfig) -> RateCfgSnapshot {
    RateCfgSnapshot {
        configured: !cfg.is_unset(),
        hw_bps: cfg.hw_guaranteed_bps,
        hw_burstable_bps: cfg.hw_burstable_bps,
        tiers: [
            (cfg.l0_min_bps, cfg.l0_max_bps),
            (cfg.l1_min_bps, cfg.l1_max_bps),
            (cfg.l2_min_bps, cfg.l2_max_bps),
        ],
    }
}

fn store_cfg(target: &GlobalRateCfg, desired: &RateCfgSnapshot) {
    target.hw_bps.store(desired.hw_bps, Ordering::Relaxed);
    target
        .hw_burstable_bps
        .store(desired.hw_burstable_bps, Ordering::Relaxed);
    for tier in Tier::ALL {
        let (min, max) = desired.tiers[tier.index()];
        let bounds = &target.tiers[tier.index()];
        bounds.min_bps.store(min, Ordering::Relaxed);
        bounds.max_bps.store(max, Ordering::Relaxed);
    }
    // Publish last so readers never shape against a half-written config
    target.set_configured(desired.configured);
}

impl MapWriter {
    pub fn new(maps: Arc<ShaperMaps>) -> Self {
        Self { maps }
    }

    pub fn maps(&self) -> &Arc<ShaperMaps> {
        &self.maps
    }

    /// Default, validate and store both directions. Directions whose stored
    /// config already matches are left untouched.
    pub fn write_global_config(&mut self, ingress: &GlobalConfig, egress: &GlobalConfig) -> Result<()> {
        let mut ingress = *ingress;
        let mut egress = *egress;

        ingress.apply_defaults();
        ingress
            .validate()
            .with_context(|| format!("ingress config is not valid: {}", ingress))?;
        egress.apply_defaults();
        egress
            .validate()
            .with_context(|| format!("egress config is not valid: {}", egress))?;

        for (direction, cfg) in [(Direction::Ingress, &ingress), (Direction::Egress, &egress)] {
            let target = &self.maps.direction(direction).cfg;
            let desired = desired_snapshot(cfg);
            if target.snapshot() == desired {
                log::debug!("{} global config unchanged", direction);
                continue;
            }
            log::info!("write global config {}: {}", direction, cfg);
            store_cfg(target, &desired);
        }
        Ok(())
    }

    pub fn global_config(&self) -> (GlobalConfig, GlobalConfig) {
        let read = |direction: Direction| {
            let snap = self.maps.direction(direction).cfg.snapshot();
            GlobalConfig {
                hw_guaranteed_bps: snap.hw_bps,
                hw_burstable_bps: snap.hw_burstable_bps,
                l0_min_bps: snap.tiers[0].0,
                l0_max_bps: snap.tiers[0].1,
                l1_min_bps: snap.tiers[1].0,
                l1_max_bps: snap.tiers[1].1,
                l2_min_bps: snap.tiers[2].0,
                l2_max_bps: snap.tiers[2].1,
            }
        };
        (read(Direction::Ingress), read(Direction::Egress))
    }

    /// Map the pod's addresses to its entity and apply its caps.
    /// Host-network pods share the node's addresses and are skipped.
    pub fn write_pod_info(&mut self, pod: &PodConfig) -> Result<()> {
        if pod.host_network {
            log::debug!("Skipping host-network pod {}", pod.pod_id);
            return Ok(());
        }
        if pod.entity_id == 0 {
            bail!("pod {} has no entity id", pod.pod_id);
        }

        for addr in pod.addresses() {
            let (entry, created) = self
                .maps
                .pods
                .table()
                .get_or_insert(AddrKey::from(addr))
                .with_context(|| format!("error put pod map entry for {}", addr))?;
            entry.class_id.store(pod.class_id(), Ordering::Relaxed);
            entry.entity.store(pod.entity_id, Ordering::Relaxed);
            if created {
                log::info!(
                    "pod {} address {} -> entity {} class {}",
                    pod.pod_id,
                    addr,
                    pod.entity_id,
                    pod.class_id()
                );
            }
        }

        self.write_entity_rate(EntityId(pod.entity_id), pod.rx_bps, pod.tx_bps)
    }

    /// Remove the pod's address entries; missing entries are fine
    pub fn delete_pod_info(&mut self, pod: &PodConfig) -> Result<()> {
        if pod.host_network {
            return Ok(());
        }
        for addr in pod.addresses() {
            if self.maps.pods.table().remove(&AddrKey::from(addr)) {
                log::info!("pod {} address {} removed", pod.pod_id, addr);
            }
        }
        Ok(())
    }

    /// Set an entity's caps. A rate of 0 removes that direction's limiter;
    /// an unchanged rate leaves the limiter's bookkeeping alone.
    pub fn write_entity_rate(&mut self, entity: EntityId, rx_bps: u64, tx_bps: u64) -> Result<()> {
        if entity.0 == 0 {
            bail!("entity id 0 is reserved");
        }
        for (direction, rate) in [(Direction::Ingress, rx_bps), (Direction::Egress, tx_bps)] {
            let table = self.maps.entity_table(direction);
            if rate == 0 {
                if table.remove(&entity) {
                    log::info!("entity {} {} rate removed", entity, direction);
                }
                continue;
            }

            if let Some(existing) = table.get(&entity) {
                if existing.limiter.bps() == rate {
                    continue;
                }
            }

            let (slot, _) = table
                .get_or_insert(entity)
                .with_context(|| format!("error put {} rate for entity {}", direction, entity))?;
            slot.limiter.reset();
            slot.limiter.set_bps(rate);
            log::info!("entity {} {} rate {} B/s", entity, direction, rate);
        }
        Ok(())
    }

    pub fn delete_entity_rate(&mut self, entity: EntityId) -> Result<()> {
        for direction in Direction::ALL {
            if self.maps.entity_table(direction).remove(&entity) {
                log::info!("entity {} {} rate removed", entity, direction);
            }
        }
        Ok(())
    }

    /// Push a whole config: global plan first, then every pod
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        self.write_global_config(&config.global.ingress, &config.global.egress)?;
        for pod in &config.pods {
            self.write_pod_info(pod)
                .with_context(|| format!("Failed to apply pod {}", pod.pod_id))?;
        }
        Ok(())
    }

    pub fn entity_rates(&self) -> Vec<EntityRate> {
        let mut rates: BTreeMap<EntityId, EntityRate> = BTreeMap::new();
        for direction in Direction::ALL {
            for (entity, value) in self.maps.entity_table(direction).iter() {
                let row = rates.entry(entity).or_insert(EntityRate {
                    entity,
                    ..Default::default()
                });
                match direction {
                    Direction::Ingress => row.rx_bps = value.limiter.bps(),
                    Direction::Egress => row.tx_bps = value.limiter.bps(),
                }
            }
        }
        rates.into_values().collect()
    }

    pub fn list_pods(&self) -> Vec<PodInfo> {
        let mut pods: Vec<(AddrKey, PodInfo)> = self
            .maps
            .pods
            .table()
            .iter()
            .map(|(key, entry)| {
                (
                    key,
                    PodInfo {
                        addr: key.to_ip(),
                        entity: entry.entity(),
                        class_id: entry.class_id(),
                    },
                )
            })
            .collect();
        pods.sort_by_key(|(key, _)| *key);
        pods.into_iter().map(|(_, info)| info).collect()
    }

    pub fn global_rate(&self, direction: Direction) -> TierSnapshot {
        self.maps.direction(direction).tiers.snapshot()
    }

    pub fn net_stat(&self, direction: Direction) -> RingSnapshot {
        self.maps.direction(direction).net_stat.snapshot()
    }

    pub fn stats(&self, direction: Direction) -> StatsSnapshot {
        self.maps.direction(direction).stats.snapshot()
    }

    pub fn entity_stats(&self, direction: Direction, entity: EntityId) -> Option<StatsSnapshot> {
        self.maps
            .entity(direction, entity)
            .map(|e| e.stats.snapshot())
    }
}
