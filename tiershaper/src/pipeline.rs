// Per-packet shaping pipeline
//
// direction -> entity resolution -> entity gate -> tier gate -> estimator
// -> allocator -> verdict. Runs concurrently on any number of threads with
// no locks and no allocation; faults are counted, never returned.

use std::sync::Arc;

use tiershaper_common::{Admission, PacketDescriptor, ShapingFault, Tier, Verdict};

use crate::config::{ShapingOptions, UnresolvedPolicy};
use crate::maps::ShaperMaps;
use crate::packet::Packet;
use crate::resolver::EntityResolver;

pub struct ShapingPipeline<R> {
    maps: Arc<ShaperMaps>,
    resolver: R,
    options: ShapingOptions,
}

impl ShapingPipeline<Arc<ShaperMaps>> {
    /// Pipeline resolving entities through the maps' own pod directory
    pub fn with_pod_directory(maps: Arc<ShaperMaps>, options: ShapingOptions) -> Self {
        Self::new(maps.clone(), maps, options)
    }
}

impl<R: EntityResolver> ShapingPipeline<R> {
    pub fn new(maps: Arc<ShaperMaps>, resolver: R, options: ShapingOptions) -> Self {
        Self {
            maps,
            resolver,
            options,
        }
    }

    /// Decide the fate of `packet` at time `now`. On `Admit` the packet's
    /// `tstamp` may have been moved into the future.
    #[inline]
    pub fn process(&self, packet: &mut Packet, now: u64) -> Verdict {
        let direction = packet.direction;
        let dir = self.maps.direction(direction);
        dir.stats.record_seen(packet.len);

        let Some(addr) = packet.lookup_addr() else {
            dir.stats.record_fault(ShapingFault::MalformedPacket);
            dir.stats.record_fail_open();
            return Verdict::Admit;
        };

        let resolved = self.resolver.resolve(addr, direction);
        if resolved.is_none() && self.options.unresolved == UnresolvedPolicy::Admit {
            return Verdict::Admit;
        }

        // Host-network traffic falls back to its own class id
        let mut desc = PacketDescriptor {
            size: packet.len,
            direction,
            departure_ns: packet.tstamp,
            tier: resolved
                .and_then(|r| r.tier)
                .or_else(|| Tier::from_class_id(packet.class_id)),
            entity: resolved.map(|r| r.entity),
        };
        let verdict = self.shape(&mut desc, now);
        packet.tstamp = desc.departure_ns;
        verdict
    }

    fn shape(&self, desc: &mut PacketDescriptor, now: u64) -> Verdict {
        let dir = self.maps.direction(desc.direction);
        let primitives = self.options.primitives(desc.direction);
        let size = desc.size;

        if desc.departure_ns != 0 && desc.departure_ns < now {
            dir.stats.record_fault(ShapingFault::ClockSkew);
        }
        let requested = desc.departure_ns.max(now);

        dir.net_stat.record(size, now);

        // Entity gate
        if let Some(entity) = desc.entity.and_then(|id| self.maps.entity(desc.direction, id)) {
            entity.stats.record_seen(size);
            if entity.limiter.bps() == 0 {
                entity.stats.record_fault(ShapingFault::RateUnconfigured);
            } else if primitives
                .entity
                .admit(&entity.limiter, size, &mut desc.departure_ns, now)
                == Verdict::Drop
            {
                entity.stats.record_drop(size);
                entity.stats.record_fault(ShapingFault::CapacityExceeded);
                dir.stats.record_drop(size);
                dir.stats.record_fault(ShapingFault::CapacityExceeded);
                return Verdict::Drop;
            } else if desc.departure_ns > requested {
                entity.stats.record_paced();
            }
        }

        // Tier gate
        if let Some(tier) = desc.tier {
            if !dir.cfg.is_configured() {
                dir.stats.record_fault(ShapingFault::ConfigurationMissing);
                dir.stats.record_fail_open();
            } else {
                dir.tiers.ensure_init(&dir.cfg, now);
                let limiter = dir.tiers.limiter(tier);
                if limiter.bps() == 0 {
                    dir.stats.record_fault(ShapingFault::RateUnconfigured);
                }
                if primitives.global.admit(limiter, size, &mut desc.departure_ns, now)
                    == Verdict::Drop
                {
                    dir.stats.record_drop(size);
                    dir.stats.record_fault(ShapingFault::CapacityExceeded);
                    return Verdict::Drop;
                }
                dir.tiers.adjust(&dir.cfg, &dir.net_stat, now);
            }
        }

        if desc.departure_ns > requested {
            dir.stats.record_paced();
        }
        Verdict::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tiershaper_common::{Direction, EntityId, NSEC_PER_MSEC, NSEC_PER_SEC, Primitive};

    use crate::config::{GlobalConfig, PodConfig, StagePrimitives};
    use crate::packet::AddrPair;
    use crate::resolver::Resolved;
    use crate::writer::MapWriter;

    const MB: u64 = 1_000_000;
    const POD: [u8; 4] = [10, 0, 0, 1];
    const REMOTE: [u8; 4] = [192, 0, 2, 1];

    fn plan() -> GlobalConfig {
        GlobalConfig {
            hw_guaranteed_bps: 100 * MB,
            l1_min_bps: 10 * MB,
            l1_max_bps: 30 * MB,
            l2_min_bps: 10 * MB,
            l2_max_bps: 30 * MB,
            ..Default::default()
        }
    }

    fn setup(options: ShapingOptions) -> (MapWriter, ShapingPipeline<Arc<ShaperMaps>>) {
        let maps = Arc::new(ShaperMaps::with_max_entries(64));
        let writer = MapWriter::new(maps.clone());
        (writer, ShapingPipeline::with_pod_directory(maps, options))
    }

    fn egress_from(src: [u8; 4], len: u64, class_id: u32) -> Packet {
        Packet::new(
            Direction::Egress,
            len,
            AddrPair {
                src: IpAddr::V4(Ipv4Addr::from(src)),
                dst: IpAddr::V4(Ipv4Addr::from(REMOTE)),
            },
            class_id,
        )
    }

    fn ingress_to(dst: [u8; 4], len: u64, class_id: u32) -> Packet {
        Packet::new(
            Direction::Ingress,
            len,
            AddrPair {
                src: IpAddr::V4(Ipv4Addr::from(REMOTE)),
                dst: IpAddr::V4(Ipv4Addr::from(dst)),
            },
            class_id,
        )
    }

    fn pod(tx_bps: u64, rx_bps: u64, priority: u32) -> PodConfig {
        PodConfig {
            pod_id: "default/app".into(),
            ipv4: Some(Ipv4Addr::from(POD)),
            priority: Some(priority),
            entity_id: 500,
            rx_bps,
            tx_bps,
            ..Default::default()
        }
    }

    #[test]
    fn test_malformed_packet_fails_open() {
        let (writer, pipeline) = setup(ShapingOptions::default());
        let mut packet = Packet::from_ip_bytes(Direction::Egress, &[0xde, 0xad], 2);
        assert_eq!(pipeline.process(&mut packet, 0), Verdict::Admit);
        let stats = writer.stats(Direction::Egress);
        assert_eq!(stats.fault(ShapingFault::MalformedPacket), 1);
        assert_eq!(stats.packets_fail_open, 1);
        // Malformed packets are not accounted in the estimator
        assert_eq!(writer.net_stat(Direction::Egress).open.index, 0);
    }

    #[test]
    fn test_missing_global_config_fails_open() {
        let (writer, pipeline) = setup(ShapingOptions::default());
        for i in 0..100 {
            let mut packet = egress_from(REMOTE, 10 * MB, 2);
            assert_eq!(pipeline.process(&mut packet, i), Verdict::Admit);
            assert_eq!(packet.tstamp, 0);
        }
        let stats = writer.stats(Direction::Egress);
        assert_eq!(stats.fault(ShapingFault::ConfigurationMissing), 100);
        assert_eq!(stats.packets_dropped, 0);
    }

    #[test]
    fn test_entity_token_bucket_drops_on_ingress() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_pod_info(&pod(0, 2 * MB, 0)).unwrap();

        let now = NSEC_PER_SEC;
        assert_eq!(pipeline.process(&mut ingress_to(POD, MB, 0), now), Verdict::Admit);
        assert_eq!(pipeline.process(&mut ingress_to(POD, MB, 0), now), Verdict::Admit);
        assert_eq!(pipeline.process(&mut ingress_to(POD, MB, 0), now), Verdict::Drop);

        let entity = writer.entity_stats(Direction::Ingress, EntityId(500)).unwrap();
        assert_eq!(entity.packets_total, 3);
        assert_eq!(entity.packets_dropped, 1);
        assert_eq!(writer.stats(Direction::Ingress).packets_dropped, 1);
    }

    #[test]
    fn test_entity_edt_paces_on_egress() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_pod_info(&pod(MB, 0, 0)).unwrap();

        let mut first = egress_from(POD, MB, 0);
        assert_eq!(pipeline.process(&mut first, 0), Verdict::Admit);
        assert_eq!(first.tstamp, 0);

        let mut second = egress_from(POD, MB, 0);
        assert_eq!(pipeline.process(&mut second, 0), Verdict::Admit);
        assert_eq!(second.tstamp, NSEC_PER_SEC);
        assert_eq!(writer.stats(Direction::Egress).packets_paced, 1);

        let mut third = egress_from(POD, MB, 0);
        assert_eq!(pipeline.process(&mut third, 0), Verdict::Drop);
    }

    #[test]
    fn test_entity_drop_skips_global_stage() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_global_config(&plan(), &plan()).unwrap();
        writer.write_pod_info(&pod(0, MB, 2)).unwrap();

        pipeline.process(&mut ingress_to(POD, MB, 0), 0);
        assert_eq!(pipeline.process(&mut ingress_to(POD, MB, 0), 0), Verdict::Drop);

        // The global L2 bucket only paid for the admitted packet
        let l2 = writer.global_rate(Direction::Ingress).tiers[Tier::T2.index()];
        assert_eq!(l2.tokens, 30 * MB - MB);
    }

    #[test]
    fn test_resolved_tier_wins_over_packet_class() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_global_config(&plan(), &plan()).unwrap();
        writer.write_pod_info(&pod(0, 0, 1)).unwrap();

        // Packet claims L0, pod is L1
        pipeline.process(&mut ingress_to(POD, MB, 0), 0);
        let tiers = writer.global_rate(Direction::Ingress).tiers;
        assert_eq!(tiers[Tier::T1.index()].tokens, 30 * MB - MB);
        assert_eq!(tiers[Tier::T0.index()].last_update_ns, tiershaper_common::UNSET);
    }

    #[test]
    fn test_host_network_uses_packet_class() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_global_config(&plan(), &plan()).unwrap();

        // L2 on egress is paced at 30 MB/s
        let mut a = egress_from(REMOTE, 30 * MB, 2);
        let mut b = egress_from(REMOTE, 15 * MB, 2);
        assert_eq!(pipeline.process(&mut a, 0), Verdict::Admit);
        assert_eq!(pipeline.process(&mut b, 0), Verdict::Admit);
        assert_eq!(b.tstamp, NSEC_PER_SEC / 2);

        // Unknown class ids skip the global stage entirely
        let mut c = egress_from(REMOTE, 100 * MB, 7);
        assert_eq!(pipeline.process(&mut c, 0), Verdict::Admit);
        assert_eq!(c.tstamp, 0);
    }

    #[test]
    fn test_unresolved_admit_policy() {
        let options = ShapingOptions {
            unresolved: UnresolvedPolicy::Admit,
            ..Default::default()
        };
        let (mut writer, pipeline) = setup(options);
        writer.write_global_config(&plan(), &plan()).unwrap();

        for _ in 0..10 {
            let mut p = ingress_to(REMOTE, 50 * MB, 2);
            assert_eq!(pipeline.process(&mut p, 0), Verdict::Admit);
        }
        assert_eq!(writer.net_stat(Direction::Ingress).open.index, 0);
    }

    #[test]
    fn test_primitives_are_configurable() {
        let options = ShapingOptions {
            egress: StagePrimitives {
                entity: Primitive::TokenBucket,
                global: Primitive::TokenBucket,
            },
            ..Default::default()
        };
        let (mut writer, pipeline) = setup(options);
        writer.write_pod_info(&pod(MB, 0, 0)).unwrap();

        let mut first = egress_from(POD, MB, 0);
        assert_eq!(pipeline.process(&mut first, 0), Verdict::Admit);
        let mut second = egress_from(POD, MB, 0);
        assert_eq!(pipeline.process(&mut second, 0), Verdict::Drop);
        assert_eq!(second.tstamp, 0);
    }

    #[test]
    fn test_stale_departure_counts_clock_skew() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_pod_info(&pod(MB, 0, 0)).unwrap();

        let now = 10 * NSEC_PER_SEC;
        let mut p = egress_from(POD, 1000, 0);
        p.tstamp = now - 5 * NSEC_PER_MSEC;
        assert_eq!(pipeline.process(&mut p, now), Verdict::Admit);
        assert_eq!(writer.stats(Direction::Egress).fault(ShapingFault::ClockSkew), 1);
        // The stale stamp is not reported as pacing
        assert_eq!(writer.stats(Direction::Egress).packets_paced, 0);
    }

    #[test]
    fn test_allocator_runs_from_the_packet_path() {
        let (mut writer, pipeline) = setup(ShapingOptions::default());
        writer.write_global_config(&plan(), &plan()).unwrap();

        // 200 MB/s of L0 ingress traffic with no entity: L2 and L1 get squeezed
        let mut now = NSEC_PER_SEC;
        let end = 4 * NSEC_PER_SEC;
        while now < end {
            pipeline.process(&mut ingress_to(REMOTE, 200_000, 0), now);
            now += NSEC_PER_MSEC;
        }
        let tiers = writer.global_rate(Direction::Ingress).tiers;
        assert_eq!(tiers[Tier::T2.index()].bps, 10 * MB);
        assert_eq!(tiers[Tier::T1.index()].bps, 10 * MB);
        assert!(tiers[Tier::T0.index()].bps >= 80 * MB);
    }

    struct Fixed(Option<Resolved>);

    impl EntityResolver for Fixed {
        fn resolve(&self, _addr: IpAddr, _direction: Direction) -> Option<Resolved> {
            self.0
        }
    }

    #[test]
    fn test_custom_resolver() {
        let maps = Arc::new(ShaperMaps::with_max_entries(8));
        let mut writer = MapWriter::new(maps.clone());
        writer.write_entity_rate(EntityId(9), 0, MB).unwrap();
        let pipeline = ShapingPipeline::new(
            maps,
            Fixed(Some(Resolved {
                entity: EntityId(9),
                tier: None,
            })),
            ShapingOptions::default(),
        );

        let mut a = egress_from(REMOTE, MB, 0);
        let mut b = egress_from(REMOTE, MB, 0);
        pipeline.process(&mut a, 0);
        pipeline.process(&mut b, 0);
        assert_eq!(b.tstamp, NSEC_PER_SEC);
    }
}
