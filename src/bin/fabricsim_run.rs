//! A minimal demo allocator: loads a topology config, injects synthetic
//! demand, and reports the admitted/dropped edges each round produces. Not
//! part of the library's contract -- a real allocator issues demand from its
//! own scheduling decisions and consumes admitted batches over whatever wire
//! protocol connects it to the fabric (spec §6 names both as external
//! collaborators the core only exchanges data with).

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use fabricsim::config::TopologyConfig;
use fabricsim::{topology, EndpointId, FlowId};

#[derive(Parser)]
#[command(about = "Drives a fabricsim emulation with synthetic uniform-random demand")]
struct Args {
    /// Path to a JSON topology configuration file.
    config: PathBuf,
    /// Timeslots advanced per `run()` call.
    #[arg(long = "timeslots", default_value_t = 1000)]
    timeslots: u64,
    /// Number of `run()` calls; demand is re-injected before each.
    #[arg(long = "rounds", default_value_t = 1)]
    rounds: u64,
    /// Seed for both the topology's per-router PRNGs and this binary's
    /// demand generator.
    #[arg(long = "seed", default_value_t = 1)]
    seed: u64,
    /// Packets of demand injected per endpoint, per round.
    #[arg(long = "demand-per-endpoint", default_value_t = 4)]
    demand_per_endpoint: u32,
}

fn main() -> ExitCode {
    #[cfg(feature = "cli-logging")]
    env_logger::init();

    let args = Args::parse();

    let text = match fs::read_to_string(&args.config) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("failed to read {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    let config: TopologyConfig = match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to parse {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let mut emulation = match topology::build(&config, args.seed) {
        Ok(emulation) => emulation,
        Err(err) => {
            eprintln!("failed to build topology: {err}");
            return ExitCode::FAILURE;
        }
    };

    let num_endpoints = config.num_racks * config.endpoints_per_rack;
    let mut demand_rng = ChaCha8Rng::seed_from_u64(args.seed ^ 0x5EED_0000_0000_0001);

    for round in 0..args.rounds {
        for src in 0..num_endpoints {
            let dst = loop {
                let candidate = demand_rng.gen_range(0..num_endpoints);
                if candidate != src {
                    break candidate;
                }
            };
            emulation.add_backlog(
                EndpointId(src as u16),
                EndpointId(dst as u16),
                FlowId((round % u16::MAX as u64) as u16),
                args.demand_per_endpoint,
            );
        }

        let admitted = match emulation.run(args.timeslots) {
            Ok(admitted) => admitted,
            Err(err) => {
                eprintln!("run failed: {err}");
                return ExitCode::FAILURE;
            }
        };

        let mut admit_count = 0usize;
        let mut drop_count = 0usize;
        for batch in &admitted {
            for edge in batch.edges() {
                if edge.dropped {
                    drop_count += 1;
                } else {
                    admit_count += 1;
                }
            }
        }
        println!(
            "round {round}: admitted={admit_count} dropped={drop_count} in_system={}",
            emulation.packets_in_system()
        );
        print!("{}", emulation.snapshot_stats().report());
    }

    emulation.shutdown();
    println!("shutdown: in_system={}", emulation.packets_in_system());
    ExitCode::SUCCESS
}
