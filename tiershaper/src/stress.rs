// Real-time multi-threaded load against the pipeline

use anyhow::{Context, Result, bail};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use tiershaper_common::{Direction, StatsSnapshot};

use crate::clock::{Clock, MonotonicClock};
use crate::maps::ShaperMaps;
use crate::packet::Packet;
use crate::pipeline::ShapingPipeline;
use crate::report::{human_rate, stats_line};
use crate::writer::MapWriter;

#[derive(Debug, Clone, Copy)]
pub struct StressOptions {
    pub threads: usize,
    /// Run time; `None` runs until Ctrl+C
    pub duration: Option<Duration>,
    pub packet_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StressSummary {
    pub elapsed: Duration,
    pub ingress: StatsSnapshot,
    pub egress: StatsSnapshot,
}

impl StressSummary {
    pub fn packets_per_sec(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        ((self.ingress.packets_total + self.egress.packets_total) as f64 / secs) as u64
    }
}

/// Local addresses the workers cycle through: every configured pod address
/// plus one unknown address for the unresolved path
fn local_addrs(writer: &MapWriter) -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = writer.list_pods().iter().map(|p| p.addr).collect();
    addrs.push(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)));
    addrs
}

/// Raw IP packet of `len` bytes (at least a full header) from `src` to `dst`
fn ip_frame(src: IpAddr, dst: IpAddr, len: usize) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut frame = vec![0u8; len.max(20)];
            frame[0] = 0x45;
            frame[12..16].copy_from_slice(&src.octets());
            frame[16..20].copy_from_slice(&dst.octets());
            frame
        }
        (src, dst) => {
            let mut frame = vec![0u8; len.max(40)];
            frame[0] = 0x60;
            frame[8..24].copy_from_slice(&to_v6(src).octets());
            frame[24..40].copy_from_slice(&to_v6(dst).octets());
            frame
        }
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Ingress and egress frames for every local address
fn frames(addrs: &[IpAddr], packet_size: u64) -> Vec<[Vec<u8>; 2]> {
    let len = packet_size as usize;
    addrs
        .iter()
        .map(|&local| {
            let remote = match local {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            };
            let mut pair = [Vec::new(), Vec::new()];
            pair[Direction::Ingress.index()] = ip_frame(remote, local, len);
            pair[Direction::Egress.index()] = ip_frame(local, remote, len);
            pair
        })
        .collect()
}

fn worker(
    id: usize,
    pipeline: Arc<ShapingPipeline<Arc<ShaperMaps>>>,
    frames: Arc<Vec<[Vec<u8>; 2]>>,
    stop: Arc<AtomicBool>,
) {
    let clock = MonotonicClock;
    let mut i = id;
    while !stop.load(Ordering::Relaxed) {
        let direction = Direction::ALL[i % 2];
        let frame = &frames[(i / 2) % frames.len()][direction.index()];
        let mut packet = Packet::from_ip_bytes(direction, frame, (i % 3) as u32);
        pipeline.process(&mut packet, clock.now_ns());
        i = i.wrapping_add(1);
    }
    log::debug!("stress worker {} stopped", id);
}

fn stop_workers(stop: &AtomicBool, handles: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        if handle.join().is_err() {
            log::warn!("A stress worker panicked");
        }
    }
}

/// Spawn `count` workers; if one fails to start, the ones already running
/// are stopped and joined before the error is returned
fn spawn_workers<F>(count: usize, stop: &AtomicBool, mut spawn: F) -> Result<Vec<JoinHandle<()>>>
where
    F: FnMut(usize) -> std::io::Result<JoinHandle<()>>,
{
    let mut handles = Vec::with_capacity(count);
    for id in 0..count {
        match spawn(id) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                stop_workers(stop, handles);
                return Err(e).context(format!("Failed to start stress worker {}", id));
            }
        }
    }
    Ok(handles)
}

pub async fn run(
    pipeline: Arc<ShapingPipeline<Arc<ShaperMaps>>>,
    writer: &MapWriter,
    options: StressOptions,
) -> Result<StressSummary> {
    if options.threads == 0 {
        bail!("at least one thread is required");
    }

    let addrs = local_addrs(writer);
    let frames = Arc::new(frames(&addrs, options.packet_size));
    let stop = Arc::new(AtomicBool::new(false));
    let clock = MonotonicClock;
    let started = clock.now_ns();

    log::info!(
        "Starting {} stress worker(s) over {} local address(es)",
        options.threads,
        addrs.len()
    );

    let handles = spawn_workers(options.threads, &stop, |id| {
        let pipeline = pipeline.clone();
        let frames = frames.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name(format!("stress-{id}"))
            .spawn(move || worker(id, pipeline, frames, stop))
    })?;

    let mut ticker = interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut last = [writer.stats(Direction::Ingress), writer.stats(Direction::Egress)];

    let deadline = async {
        match options.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::info!("Duration elapsed, stopping workers");
                break;
            }
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping workers");
                break;
            }
            _ = ticker.tick() => {
                for direction in Direction::ALL {
                    let now = writer.stats(direction);
                    let delta = now.since(&last[direction.index()]);
                    let caps = writer.global_rate(direction);
                    log::info!(
                        "{} | L0 {} L1 {} L2 {}",
                        stats_line(direction.name(), &delta),
                        human_rate(caps.tiers[0].bps),
                        human_rate(caps.tiers[1].bps),
                        human_rate(caps.tiers[2].bps)
                    );
                    last[direction.index()] = now;
                }
            }
        }
    }

    stop_workers(&stop, handles);

    Ok(StressSummary {
        elapsed: Duration::from_nanos(clock.now_ns().saturating_sub(started)),
        ingress: writer.stats(Direction::Ingress),
        egress: writer.stats(Direction::Egress),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GlobalConfig, PodConfig};

    const MB: u64 = 1_000_000;

    #[tokio::test]
    async fn test_stress_run_counts_packets() {
        let mut config = Config::default();
        config.global.egress = GlobalConfig {
            hw_guaranteed_bps: 100 * MB,
            l1_max_bps: 30 * MB,
            l2_max_bps: 30 * MB,
            ..Default::default()
        };
        config.pods.push(PodConfig {
            pod_id: "p".into(),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            entity_id: 1,
            tx_bps: 2 * MB,
            rx_bps: 2 * MB,
            ..Default::default()
        });

        let maps = Arc::new(ShaperMaps::with_max_entries(64));
        let mut writer = MapWriter::new(maps.clone());
        writer.apply_config(&config).unwrap();
        let pipeline = Arc::new(ShapingPipeline::with_pod_directory(maps, config.shaping));

        let summary = run(
            pipeline,
            &writer,
            StressOptions {
                threads: 2,
                duration: Some(Duration::from_millis(200)),
                packet_size: 1500,
            },
        )
        .await
        .unwrap();

        assert!(summary.egress.packets_total > 0);
        assert!(summary.ingress.packets_total > 0);
        // Entity caps are far below what two spinning threads offer
        assert!(summary.ingress.packets_dropped > 0 || summary.egress.packets_dropped > 0);
        assert!(summary.packets_per_sec() > 0);
    }

    #[test]
    fn test_frames_resolve_to_local_addr() {
        let local = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7));
        let frames = frames(&[local, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))], 100);
        for direction in Direction::ALL {
            let packet = Packet::from_ip_bytes(direction, &frames[0][direction.index()], 0);
            assert_eq!(packet.lookup_addr(), Some(local));
            assert_eq!(packet.len, 100);
        }
        // Short sizes still carry a whole header
        let v4 = &frames[1][Direction::Egress.index()];
        assert_eq!(v4.len(), 100);
        assert_eq!(ip_frame(local, local, 10).len(), 40);
    }

    #[test]
    fn test_failed_spawn_stops_running_workers() {
        let stop = Arc::new(AtomicBool::new(false));
        let result = spawn_workers(4, &stop, |id| {
            if id == 2 {
                return Err(std::io::Error::other("no threads left"));
            }
            let stop = stop.clone();
            Ok(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
            }))
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("stress worker 2"));
        // Reaching this point means the two spinning workers were joined
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stress_requires_threads() {
        let maps = Arc::new(ShaperMaps::with_max_entries(4));
        let writer = MapWriter::new(maps.clone());
        let pipeline = Arc::new(ShapingPipeline::with_pod_directory(
            maps,
            Default::default(),
        ));
        let options = StressOptions {
            threads: 0,
            duration: Some(Duration::from_millis(1)),
            packet_size: 100,
        };
        assert!(run(pipeline, &writer, options).await.is_err());
    }
}
