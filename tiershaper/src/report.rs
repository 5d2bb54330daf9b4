// Human-readable tables for the CLI

use std::fmt::Write as _;

use tiershaper_common::{Direction, RingSnapshot, ShapingFault, StatsSnapshot, Tier, TierSnapshot};

use crate::config::GlobalConfig;
use crate::writer::{EntityRate, PodInfo};

/// Format a rate as a human-readable string (e.g., "1.5 MB/s", "500 KB/s")
pub fn human_rate(bytes_per_sec: u64) -> String {
    const KB: u64 = 1_000;
    const MB: u64 = KB * 1_000;
    const GB: u64 = MB * 1_000;

    if bytes_per_sec >= GB {
        format!("{:.1} GB/s", bytes_per_sec as f64 / GB as f64)
    } else if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec as f64 / MB as f64)
    } else if bytes_per_sec >= KB {
        format!("{:.1} KB/s", bytes_per_sec as f64 / KB as f64)
    } else {
        format!("{} B/s", bytes_per_sec)
    }
}

/// Like [`human_rate`], with 0 shown as "-"
fn rate_or_dash(bps: u64) -> String {
    if bps == 0 {
        "-".to_string()
    } else {
        human_rate(bps)
    }
}

pub fn global_config_table(ingress: &GlobalConfig, egress: &GlobalConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:12} {:>14} {:>14}", "", "ingress", "egress");
    let rows: [(&str, fn(&GlobalConfig) -> u64); 8] = [
        ("guaranteed", |c| c.hw_guaranteed_bps),
        ("burstable", |c| c.hw_burstable_bps),
        ("L0 min", |c| c.l0_min_bps),
        ("L0 max", |c| c.l0_max_bps),
        ("L1 min", |c| c.l1_min_bps),
        ("L1 max", |c| c.l1_max_bps),
        ("L2 min", |c| c.l2_min_bps),
        ("L2 max", |c| c.l2_max_bps),
    ];
    for (name, field) in rows {
        let _ = writeln!(
            out,
            "{:12} {:>14} {:>14}",
            name,
            rate_or_dash(field(ingress)),
            rate_or_dash(field(egress))
        );
    }
    out
}

pub fn tier_table(direction: Direction, snapshot: &TierSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} tiers:", direction);
    for tier in Tier::ALL {
        let s = &snapshot.tiers[tier.index()];
        let _ = writeln!(out, "  {:4} {:>14}", tier.to_string(), rate_or_dash(s.bps));
    }
    out
}

pub fn ring_table(direction: Direction, snapshot: &RingSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} estimator: open epoch #{} ({} bytes)",
        direction, snapshot.open.index, snapshot.open.val
    );
    for slot in snapshot.slots.iter().filter(|s| s.index != 0) {
        let _ = writeln!(
            out,
            "  #{:<8} ts {:>16} {:>14}",
            slot.index,
            slot.ts,
            human_rate(slot.val)
        );
    }
    out
}

pub fn stats_line(label: &str, stats: &StatsSnapshot) -> String {
    let mut line = format!(
        "{:10} pkts {:>10} bytes {:>14} dropped {:>8} paced {:>8} fail-open {:>8}",
        label,
        stats.packets_total,
        stats.bytes_total,
        stats.packets_dropped,
        stats.packets_paced,
        stats.packets_fail_open
    );
    for fault in ShapingFault::ALL {
        let n = stats.fault(fault);
        if n != 0 {
            let _ = write!(line, " [{}: {}]", fault, n);
        }
    }
    line
}

pub fn pod_table(pods: &[PodInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:40} {:>20} {:>8}", "address", "entity", "class");
    for pod in pods {
        let _ = writeln!(
            out,
            "{:40} {:>20} {:>8}",
            pod.addr.to_string(),
            pod.entity.to_string(),
            pod.class_id
        );
    }
    out
}

pub fn entity_rate_table(rates: &[EntityRate]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:20} {:>14} {:>14}", "entity", "rx", "tx");
    for rate in rates {
        let _ = writeln!(
            out,
            "{:20} {:>14} {:>14}",
            rate.entity.to_string(),
            rate_or_dash(rate.rx_bps),
            rate_or_dash(rate.tx_bps)
        );
    }
    out
}
