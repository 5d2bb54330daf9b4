mod clock;
mod config;
mod maps;
mod packet;
mod pipeline;
mod report;
mod resolver;
mod simulate;
mod stress;
mod table;
mod writer;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tiershaper_common::{Direction, EntityId};

use crate::config::{Config, GlobalConfig, PodConfig, parse_rate};
use crate::maps::ShaperMaps;
use crate::pipeline::ShapingPipeline;
use crate::writer::MapWriter;

/// TierShaper - tiered bandwidth shaping with per-pod caps
#[derive(Parser, Debug)]
#[command(name = "tiershaper")]
#[command(version)]
#[command(about = "Per-packet tiered bandwidth shaping engine", long_about = None)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/tiershaper/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or edit the global bandwidth plan
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage pods and their caps
    Pod {
        #[command(subcommand)]
        action: PodAction,
    },
    /// Run a virtual-time scenario through the pipeline
    Simulate {
        /// Scenario JSON file
        scenario: PathBuf,
    },
    /// Hammer the pipeline from several threads in real time
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Seconds to run (default: until Ctrl+C)
        #[arg(long, value_name = "SECONDS")]
        duration: Option<u64>,
        #[arg(long, default_value_t = 1500)]
        packet_size: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective global config for both directions
    Show,
    /// Apply defaults and validate; exits non-zero on error
    Check,
    /// Convert a legacy key/value file into the JSON config
    Legacy {
        file: PathBuf,
        /// Save into the config file instead of printing
        #[arg(long)]
        write: bool,
    },
    /// Set the global plan of one direction (e.g., "--hw 1G --l1-max 300M")
    Set {
        #[arg(long, value_enum)]
        direction: DirectionArg,
        #[arg(long, value_name = "RATE")]
        hw: Option<String>,
        #[arg(long, value_name = "RATE")]
        burstable: Option<String>,
        #[arg(long, value_name = "RATE")]
        l0_min: Option<String>,
        #[arg(long, value_name = "RATE")]
        l0_max: Option<String>,
        #[arg(long, value_name = "RATE")]
        l1_min: Option<String>,
        #[arg(long, value_name = "RATE")]
        l1_max: Option<String>,
        #[arg(long, value_name = "RATE")]
        l2_min: Option<String>,
        #[arg(long, value_name = "RATE")]
        l2_max: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PodAction {
    /// List the pod directory and entity caps
    List,
    /// Add or update a pod
    Set {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "")]
        uid: String,
        #[arg(long)]
        ipv4: Option<Ipv4Addr>,
        #[arg(long)]
        ipv6: Option<Ipv6Addr>,
        /// Cgroup inode of the pod
        #[arg(long)]
        entity: u64,
        /// Class id: 0 = L0 (online), 1 = L1, 2 = L2
        #[arg(long)]
        priority: Option<u32>,
        /// Ingress cap (e.g., "10M")
        #[arg(long, value_name = "RATE")]
        rx: Option<String>,
        /// Egress cap (e.g., "10M")
        #[arg(long, value_name = "RATE")]
        tx: Option<String>,
        #[arg(long)]
        host_network: bool,
    },
    /// Remove a pod
    Delete { id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DirectionArg {
    Ingress,
    Egress,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Ingress => Direction::Ingress,
            DirectionArg::Egress => Direction::Egress,
        }
    }
}

fn parse_opt_rate(rate: Option<&str>) -> Result<u64> {
    rate.map(parse_rate).transpose().map(|r| r.unwrap_or(0))
}

/// Build the shared maps and push `config` into them, as a running
/// shaper would at startup
fn load_maps(config: &Config) -> Result<MapWriter> {
    let maps = Arc::new(ShaperMaps::with_max_entries(config.shaping.max_entries));
    let mut writer = MapWriter::new(maps);
    writer.apply_config(config)?;
    Ok(writer)
}

fn run_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load(path)?;
            let writer = load_maps(&config)?;
            let (ingress, egress) = writer.global_config();
            print!("{}", report::global_config_table(&ingress, &egress));
            println!();
            for direction in Direction::ALL {
                let p = config.shaping.primitives(direction);
                println!(
                    "{:8} entity stage: {:12} global stage: {}",
                    direction.to_string(),
                    p.entity.name(),
                    p.global.name()
                );
            }
            println!("unresolved packets: {:?}", config.shaping.unresolved);
            println!("table capacity:     {}", config.shaping.max_entries);
        }
        ConfigAction::Check => {
            let mut config = Config::load(path)?;
            config.check()?;
            println!(
                "Config OK: {} pod(s), ingress {}, egress {}",
                config.pods.len(),
                if config.global.ingress.is_unset() { "unset" } else { "set" },
                if config.global.egress.is_unset() { "unset" } else { "set" }
            );
        }
        ConfigAction::Legacy { file, write } => {
            let config = Config::import_legacy(path, &file)?;
            if write {
                config.save(path)?;
                println!("Imported {:?}", file);
            } else {
                println!("{}", serde_json::to_string_pretty(&config.global)?);
            }
        }
        ConfigAction::Set {
            direction,
            hw,
            burstable,
            l0_min,
            l0_max,
            l1_min,
            l1_max,
            l2_min,
            l2_max,
        } => {
            let cfg = GlobalConfig {
                hw_guaranteed_bps: parse_opt_rate(hw.as_deref())?,
                hw_burstable_bps: parse_opt_rate(burstable.as_deref())?,
                l0_min_bps: parse_opt_rate(l0_min.as_deref())?,
                l0_max_bps: parse_opt_rate(l0_max.as_deref())?,
                l1_min_bps: parse_opt_rate(l1_min.as_deref())?,
                l1_max_bps: parse_opt_rate(l1_max.as_deref())?,
                l2_min_bps: parse_opt_rate(l2_min.as_deref())?,
                l2_max_bps: parse_opt_rate(l2_max.as_deref())?,
            };
            let direction = Direction::from(direction);
            let mut config = Config::load(path)?;
            match direction {
                Direction::Ingress => config.global.ingress = cfg,
                Direction::Egress => config.global.egress = cfg,
            }
            let mut checked = config.clone();
            checked.check()?;
            config.save(path)?;
            println!("{} config: {}", direction, checked.global.get(direction));
        }
    }
    Ok(())
}

fn run_pod(path: Option<&Path>, action: PodAction) -> Result<()> {
    let mut config = Config::load(path)?;
    match action {
        PodAction::List => {
            let writer = load_maps(&config)?;
            print!("{}", report::pod_table(&writer.list_pods()));
            println!();
            print!("{}", report::entity_rate_table(&writer.entity_rates()));
        }
        PodAction::Set {
            id,
            uid,
            ipv4,
            ipv6,
            entity,
            priority,
            rx,
            tx,
            host_network,
        } => {
            let pod = PodConfig {
                pod_id: id.clone(),
                pod_uid: uid,
                ipv4,
                ipv6,
                host_network,
                priority,
                entity_id: entity,
                rx_bps: parse_opt_rate(rx.as_deref())?,
                tx_bps: parse_opt_rate(tx.as_deref())?,
            };
            config.set_pod(pod);
            // Reject anything the shaper would refuse before saving
            load_maps(&config).with_context(|| format!("pod {} not accepted", id))?;
            config.save(path)?;
            println!("Pod {} saved", id);
        }
        PodAction::Delete { id } => {
            let mut writer = load_maps(&config)?;
            let Some(pod) = config.remove_pod(&id) else {
                anyhow::bail!("pod {} not found", id);
            };
            // Same teardown a running shaper does when the pod goes away
            writer.delete_pod_info(&pod)?;
            if !config.pods.iter().any(|p| p.entity_id == pod.entity_id) {
                writer.delete_entity_rate(EntityId(pod.entity_id))?;
            }
            config.save(path)?;
            println!("Pod {} removed", id);
        }
    }
    Ok(())
}

async fn run_stress(
    path: Option<&Path>,
    threads: usize,
    duration: Option<u64>,
    packet_size: u64,
) -> Result<()> {
    let config = Config::load(path)?;
    let writer = load_maps(&config)?;
    let pipeline = Arc::new(ShapingPipeline::with_pod_directory(
        writer.maps().clone(),
        config.shaping,
    ));

    println!("TierShaper stress: {} thread(s)", threads);
    match duration {
        Some(d) => println!("Running for {} seconds... (Press Ctrl+C to stop early)", d),
        None => println!("Press Ctrl+C to stop..."),
    }

    let summary = stress::run(
        pipeline,
        &writer,
        stress::StressOptions {
            threads,
            duration: duration.map(Duration::from_secs),
            packet_size,
        },
    )
    .await?;

    println!();
    println!("{}", report::stats_line("ingress", &summary.ingress));
    println!("{}", report::stats_line("egress", &summary.egress));
    println!(
        "{} packets/s over {:.1}s",
        summary.packets_per_sec(),
        summary.elapsed.as_secs_f64()
    );
    for rate in writer.entity_rates() {
        for direction in Direction::ALL {
            if let Some(stats) = writer.entity_stats(direction, rate.entity) {
                let label = format!("{} {}", rate.entity, direction);
                println!("{}", report::stats_line(&label, &stats));
            }
        }
    }
    for direction in Direction::ALL {
        print!("{}", report::tier_table(direction, &writer.global_rate(direction)));
        print!("{}", report::ring_table(direction, &writer.net_stat(direction)));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let path = args.config.as_deref();
    match args.command {
        Command::Config { action } => run_config(path, action),
        Command::Pod { action } => run_pod(path, action),
        Command::Simulate { scenario } => {
            let scenario = simulate::Scenario::load(&scenario)?;
            let report = simulate::run(&scenario)?;
            print!("{}", report.render());
            Ok(())
        }
        Command::Stress {
            threads,
            duration,
            packet_size,
        } => run_stress(path, threads, duration, packet_size).await,
    }
}
