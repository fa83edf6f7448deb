use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fsdrift_core::{load_config_file, HashPeriods, ProbabilityTable};
use fsdrift_sim::Engine;

mod setup;

/// Differential fuzzer: drives the filesystem under test and a trusted
/// kernel filesystem through the same randomized operation sequence and
/// fails on any observable divergence.
#[derive(Parser)]
#[command(name = "fsdrift", version, about)]
struct Cli {
    /// Probability configuration (JSON); relative paths resolve under the
    /// tool's config directory
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Randomize operation probabilities at startup
    #[arg(short = 'r', long = "randomize")]
    randomize: bool,

    /// Maximum number of operations
    #[arg(short = 'm', long = "max-ops", default_value_t = 100)]
    max_ops: u64,

    /// PRNG seed (defaults to the current time in nanoseconds)
    #[arg(long)]
    seed: Option<u64>,

    /// How often to compare tree digests, as <metadata>,<content>
    /// operation periods; the content period must be a multiple of the
    /// metadata period
    #[arg(long, default_value = "1,250")]
    periods: HashPeriods,

    /// Drop into an interactive shell in the test directory instead of
    /// running operations
    #[arg(long)]
    shell: bool,

    /// Server binary for the filesystem under test
    #[arg(long, default_value = "cardfs")]
    sut_bin: String,
}

fn resolve_config_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match dirs_next::config_dir() {
        Some(base) => base.join("fsdrift").join(path),
        None => path,
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut table = match cli.config {
        Some(path) => load_config_file(&resolve_config_path(path))?,
        None => ProbabilityTable::uniform(),
    };

    let seed = cli.seed.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
    });
    info!("seed={seed} periods={} max_ops={}", cli.periods, cli.max_ops);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    if cli.randomize {
        table.randomize(&mut rng);
        info!("{table}");
    }

    let bed = setup::set_up(&cli.sut_bin, &mut rng)?;
    info!("test directory: {}", bed.test_dir.display());

    if cli.shell {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
        let status = Command::new(shell).current_dir(&bed.test_dir).status();
        let mut suts = bed.suts;
        setup::tear_down(&mut suts);
        status?;
        return Ok(());
    }

    let mut engine = Engine::new(bed.suts, bed.ref_dir, &table, cli.periods, cli.max_ops, rng);
    let result = engine.run();
    setup::tear_down(&mut engine.suts);
    result?;
    info!("clean run: {} operations", engine.ops_done());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("fsdrift: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
