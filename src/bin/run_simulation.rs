//! Run consensus simulation batches and append one CSV result row per run.
//!
//! Example: produce twenty fail-stop runs at n = 7:
//!
//! ```text
//! run_simulation --scenario FailStop --nodes 7 --fail 2 --role failstop \
//!     --runs 20 --out failstop.csv
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dbft_consensus::binary_consensus::BcVariant;
use dbft_consensus::chain::ExactDuplicate;
use dbft_consensus::config::ConsensusConfig;
use dbft_consensus::metrics::register_metrics;
use dbft_consensus::simulation::{write_results, Role, Simulation, SimulationConfig};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "run_simulation", about = "Drive consensus simulation batches")]
struct Cli {
    /// Scenario label written into the result rows.
    #[arg(long, default_value = "Ok")]
    scenario: String,
    /// Total participant count.
    #[arg(long, default_value_t = 7)]
    nodes: usize,
    /// Number of faulty participants.
    #[arg(long, default_value_t = 0)]
    fail: usize,
    /// Behavior of the faulty participants: failstop, txrejector or
    /// binconcrasher.
    #[arg(long, default_value = "failstop")]
    role: String,
    /// Consensus variant: async or psync.
    #[arg(long, default_value = "psync")]
    variant: String,
    /// Transactions per proposal.
    #[arg(long, default_value_t = 10)]
    batch_size: usize,
    /// Blocks to produce per run.
    #[arg(long, default_value_t = 1)]
    max_blocks: u64,
    /// Number of runs.
    #[arg(long, default_value_t = 1)]
    runs: usize,
    /// Shuffle role assignment across participant ids.
    #[arg(long, default_value_t = false)]
    shuffle: bool,
    /// Random delivery delay bound in microseconds; 0 disables jitter.
    #[arg(long, default_value_t = 0)]
    jitter_us: u64,
    /// Base seed; 0 picks a random one.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Result file.
    #[arg(long, default_value = "results.csv")]
    out: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    register_metrics();

    let cli = Cli::parse();
    let role = Role::from_str(&cli.role).expect("unknown role");
    let variant = BcVariant::from_str(&cli.variant).expect("unknown variant");
    let base_seed = if cli.seed == 0 { rand::thread_rng().gen() } else { cli.seed };

    let mut writer = csv::Writer::from_path(&cli.out).expect("result file is writable");
    for run_id in 0..cli.runs {
        let config = SimulationConfig {
            scenario: cli.scenario.clone(),
            participants: cli.nodes,
            faulty: cli.fail,
            fault_role: role,
            shuffle_roles: cli.shuffle,
            seed: base_seed.wrapping_add(run_id as u64),
            jitter: (cli.jitter_us > 0).then(|| Duration::from_micros(cli.jitter_us)),
            consensus: ConsensusConfig {
                batch_size: cli.batch_size,
                max_blocks: cli.max_blocks,
                variant,
                ..ConsensusConfig::default()
            },
        };

        let sim = Simulation::new(config.clone(), Arc::new(ExactDuplicate));
        let run = sim.run().await.expect("simulation run failed");
        write_results(&mut writer, &config, run_id, &run).expect("result row written");
        println!(
            "run {run_id}: n={} fail={} runtime={:.4}s rounds={} block_size={}",
            config.participants,
            config.faulty,
            run.average_runtime_secs(),
            run.max_rounds(),
            run.block_size(),
        );
    }
}
