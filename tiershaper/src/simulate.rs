// Deterministic virtual-time scenario runner
//
// Flows emit fixed-size packets at a constant offered rate. Every packet
// goes through the real pipeline on a manual clock; admitted bytes are
// credited to the interval of their departure time.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tiershaper_common::{Direction, NSEC_PER_MSEC, NSEC_PER_SEC, Tier, Verdict};

use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::maps::ShaperMaps;
use crate::packet::{AddrPair, Packet};
use crate::pipeline::ShapingPipeline;
use crate::report::human_rate;
use crate::writer::MapWriter;

fn default_packet_size() -> u64 {
    1500
}

fn default_report_interval() -> u64 {
    1000
}

fn default_remote() -> IpAddr {
    IpAddr::from([192, 0, 2, 1])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub direction: Direction,
    /// Address of the local end (the pod side)
    pub local: IpAddr,
    #[serde(default = "default_remote")]
    pub remote: IpAddr,
    #[serde(default)]
    pub class_id: u32,
    #[serde(default = "default_packet_size")]
    pub packet_size: u64,
    /// Offered load in bytes per second
    pub rate_bps: u64,
    #[serde(default)]
    pub start_ms: u64,
    #[serde(default)]
    pub stop_ms: Option<u64>,
}

impl Flow {
    fn packet(&self) -> Packet {
        let headers = match self.direction {
            Direction::Egress => AddrPair {
                src: self.local,
                dst: self.remote,
            },
            Direction::Ingress => AddrPair {
                src: self.remote,
                dst: self.local,
            },
        };
        Packet::new(self.direction, self.packet_size, headers, self.class_id)
    }

    fn gap_ns(&self) -> u64 {
        let gap = self.packet_size as u128 * NSEC_PER_SEC as u128 / self.rate_bps as u128;
        u64::try_from(gap).unwrap_or(u64::MAX).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: Config,
    pub duration_ms: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
    pub flows: Vec<Flow>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read scenario: {:?}", path))?;
        serde_json::from_str(&contents).context(format!("Failed to parse scenario: {:?}", path))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSample {
    pub admitted_bytes: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_paced: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalReport {
    pub end_ms: u64,
    /// Tier caps at the end of the interval, [direction][tier]
    pub tiers: [[u64; 3]; 2],
    pub flows: Vec<FlowSample>,
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub interval_ms: u64,
    pub flow_names: Vec<String>,
    pub intervals: Vec<IntervalReport>,
}

impl SimulationReport {
    /// Admitted throughput of flow `flow` during interval `interval`
    pub fn throughput(&self, interval: usize, flow: usize) -> u64 {
        let bytes = self.intervals[interval].flows[flow].admitted_bytes;
        bytes.saturating_mul(1000) / self.interval_ms.max(1)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, interval) in self.intervals.iter().enumerate() {
            let _ = writeln!(out, "t={:>6}ms", interval.end_ms);
            for direction in Direction::ALL {
                let caps = interval.tiers[direction.index()];
                let _ = write!(out, "  {:8}", direction.to_string());
                for tier in Tier::ALL {
                    let _ = write!(out, " {} {:>12}", tier, human_rate(caps[tier.index()]));
                }
                let _ = writeln!(out);
            }
            for (f, name) in self.flow_names.iter().enumerate() {
                let sample = &interval.flows[f];
                let _ = writeln!(
                    out,
                    "  {:16} {:>12} sent {:>8} dropped {:>8} paced {:>8}",
                    name,
                    human_rate(self.throughput(i, f)),
                    sample.packets_sent,
                    sample.packets_dropped,
                    sample.packets_paced
                );
            }
        }
        out
    }
}

/// Virtual time starts here so that no timestamp is ever 0
const SIM_EPOCH_NS: u64 = NSEC_PER_SEC;

pub fn run(scenario: &Scenario) -> Result<SimulationReport> {
    if scenario.report_interval_ms == 0 {
        bail!("report_interval_ms must be greater than zero");
    }
    for flow in &scenario.flows {
        if flow.rate_bps == 0 || flow.packet_size == 0 {
            bail!("flow {} needs a non-zero rate and packet size", flow.name);
        }
    }

    let mut config = scenario.config.clone();
    config.check()?;

    let maps = Arc::new(ShaperMaps::with_max_entries(config.shaping.max_entries));
    let mut writer = MapWriter::new(maps.clone());
    writer.apply_config(&config)?;
    let pipeline = ShapingPipeline::with_pod_directory(maps, config.shaping);
    let clock = ManualClock::new(SIM_EPOCH_NS);

    let interval_ns = scenario.report_interval_ms * NSEC_PER_MSEC;
    let end = SIM_EPOCH_NS + scenario.duration_ms * NSEC_PER_MSEC;
    let n_intervals = scenario.duration_ms.div_ceil(scenario.report_interval_ms) as usize;

    let mut intervals: Vec<IntervalReport> = (0..n_intervals)
        .map(|i| IntervalReport {
            end_ms: ((i as u64 + 1) * scenario.report_interval_ms).min(scenario.duration_ms),
            tiers: [[0; 3]; 2],
            flows: vec![FlowSample::default(); scenario.flows.len()],
        })
        .collect();

    let mut queue: BinaryHeap<Reverse<(u64, usize)>> = scenario
        .flows
        .iter()
        .enumerate()
        .map(|(i, f)| Reverse((SIM_EPOCH_NS + f.start_ms * NSEC_PER_MSEC, i)))
        .collect();

    log::info!(
        "Simulating {} flow(s) for {}ms",
        scenario.flows.len(),
        scenario.duration_ms
    );

    let bucket = |t: u64| ((t - SIM_EPOCH_NS) / interval_ns) as usize;
    let mut next_boundary = 0usize;

    let snapshot_tiers = |report: &mut IntervalReport| {
        for direction in Direction::ALL {
            let snap = writer.global_rate(direction);
            for tier in Tier::ALL {
                report.tiers[direction.index()][tier.index()] = snap.tiers[tier.index()].bps;
            }
        }
    };

    while let Some(Reverse((t, f))) = queue.pop() {
        if t >= end {
            break;
        }
        while next_boundary < n_intervals && bucket(t) > next_boundary {
            snapshot_tiers(&mut intervals[next_boundary]);
            next_boundary += 1;
        }

        let flow = &scenario.flows[f];
        if let Some(stop) = flow.stop_ms {
            if t >= SIM_EPOCH_NS + stop * NSEC_PER_MSEC {
                continue;
            }
        }

        clock.set(t);
        let now = clock.now_ns();
        let mut packet = flow.packet();
        let verdict = pipeline.process(&mut packet, now);

        let sent_in = bucket(now);
        intervals[sent_in].flows[f].packets_sent += 1;
        match verdict {
            Verdict::Admit => {
                let departure = packet.tstamp.max(now);
                if departure > now {
                    intervals[sent_in].flows[f].packets_paced += 1;
                }
                let idx = bucket(departure);
                if idx < n_intervals {
                    intervals[idx].flows[f].admitted_bytes += flow.packet_size;
                }
            }
            Verdict::Drop => intervals[sent_in].flows[f].packets_dropped += 1,
        }

        queue.push(Reverse((t.saturating_add(flow.gap_ns()), f)));
    }

    while next_boundary < n_intervals {
        snapshot_tiers(&mut intervals[next_boundary]);
        next_boundary += 1;
    }

    for direction in Direction::ALL {
        log::debug!("{} stats: {:?}", direction, writer.stats(direction));
    }

    Ok(SimulationReport {
        interval_ms: scenario.report_interval_ms,
        flow_names: scenario.flows.iter().map(|f| f.name.clone()).collect(),
        intervals,
    })
}
