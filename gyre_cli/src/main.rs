mod targets;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gyre_core::config::{Engine, GyreConfig};
use gyre_core::corpus::read_signature;
use gyre_core::ei::IndexCapability;
use gyre_core::executor::{Executor, RunResult, replay};
use gyre_core::guidance::{Guidance, SessionSummary};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "gyre.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration; `gyre.toml` in the working directory is used when present.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing session. This is the default command.
    Fuzz(FuzzArgs),
    /// Run one saved input and report its result and coverage.
    Repro(ReproArgs),
    /// List the built-in harnesses.
    Targets,
}

#[derive(Args, Debug, Default)]
struct FuzzArgs {
    #[clap(long)]
    harness: Option<String>,
    /// `coverage` or `execution-index`.
    #[clap(short, long, value_parser = parse_engine)]
    engine: Option<Engine>,
    #[clap(short = 's', long)]
    random_seed: Option<u64>,
    /// Time budget, e.g. `1h30m` or `45s`.
    #[clap(short, long)]
    time: Option<String>,
    #[clap(short = 'n', long)]
    trials: Option<u64>,
    #[clap(long)]
    blind: bool,
    #[clap(long)]
    fixed_size: bool,
    #[clap(long)]
    exit_on_crash: bool,
    #[clap(long)]
    run_timeout_ms: Option<u64>,
    #[clap(short, long)]
    input_dir: Option<PathBuf>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    #[clap(long)]
    pre_round: bool,
}

#[derive(Args, Debug)]
struct ReproArgs {
    /// Saved input or crash artifact.
    path: PathBuf,
    #[clap(long)]
    harness: Option<String>,
    #[clap(long)]
    fixed_size: bool,
}

fn parse_engine(value: &str) -> Result<Engine, String> {
    match value {
        "coverage" => Ok(Engine::Coverage),
        "execution-index" | "ei" => Ok(Engine::ExecutionIndex),
        other => Err(format!(
            "unknown engine {other:?}, expected `coverage` or `execution-index`"
        )),
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("GYRE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(1),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether a bug was found (or reproduced).
fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = load_config(cli.config_file.as_deref())?;
    match cli.command.unwrap_or(Command::Fuzz(FuzzArgs::default())) {
        Command::Fuzz(args) => {
            apply_overrides(&mut config, args);
            fuzz(&config)
        }
        Command::Repro(args) => repro(&config, args),
        Command::Targets => {
            for key in targets::HARNESS_KEYS {
                println!("{key}");
            }
            Ok(false)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GyreConfig> {
    match path {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            GyreConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                GyreConfig::load_from_file(&default_config_path)
            } else {
                debug!("no configuration file found, using built-in defaults");
                Ok(GyreConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut GyreConfig, args: FuzzArgs) {
    let session = &mut config.session;
    if let Some(engine) = args.engine {
        session.engine = engine;
    }
    if args.random_seed.is_some() {
        session.random_seed = args.random_seed;
    }
    if args.time.is_some() {
        session.time = args.time;
    }
    if args.trials.is_some() {
        session.trials = args.trials;
    }
    if let Some(ms) = args.run_timeout_ms {
        session.run_timeout_ms = ms;
    }
    session.blind |= args.blind;
    session.fixed_size |= args.fixed_size;
    session.exit_on_crash |= args.exit_on_crash;
    config.pre_round.enabled |= args.pre_round;

    if args.input_dir.is_some() {
        config.corpus.input_dir = args.input_dir;
    }
    if let Some(output_dir) = args.output_dir {
        config.corpus.output_dir = output_dir;
    }
    if let Some(harness) = args.harness {
        config.harness.harness_key = harness;
    }
}

fn fuzz(config: &GyreConfig) -> anyhow::Result<bool> {
    let session = config
        .session_config()
        .context("Invalid session configuration")?;
    debug!(?session, "effective session configuration");
    let mut executor = targets::executor(&config.harness.harness_key, session.run_timeout)?;

    // Failures are reported through the archive; the default hook would print every panic.
    std::panic::set_hook(Box::new(|panic: &std::panic::PanicHookInfo<'_>| {
        debug!(%panic, "target panicked")
    }));

    let engine = session.engine;
    let summary = match engine {
        Engine::Coverage => drive(Guidance::coverage(session)?, executor.as_mut())?,
        Engine::ExecutionIndex => drive(Guidance::execution_index(session)?, executor.as_mut())?,
    };
    if !summary.touched_config.is_empty() {
        info!(keys = ?summary.touched_config.keys().collect::<Vec<_>>(), "configuration keys touched");
    }
    Ok(summary.bugs_found())
}

fn drive<X: IndexCapability>(
    mut guidance: Guidance<X>,
    executor: &mut dyn Executor,
) -> anyhow::Result<SessionSummary> {
    info!(seed = guidance.random_seed(), "pass --random-seed to reproduce this session");
    let summary = guidance.run(executor)?;
    for record in guidance.archive().records() {
        let path = guidance.archive().artifact_path(record.id);
        warn!(
            id = record.id,
            kind = ?record.kind,
            cause = %record.cause,
            artifact = ?path,
            "failure"
        );
    }
    Ok(summary)
}

fn repro(config: &GyreConfig, args: ReproArgs) -> anyhow::Result<bool> {
    let bytes = std::fs::read(&args.path)
        .with_context(|| format!("Failed to read input {:?}", args.path))?;
    let harness = args
        .harness
        .unwrap_or_else(|| config.harness.harness_key.clone());
    let fixed_size = args.fixed_size || config.session.fixed_size;
    let mut executor = targets::executor(&harness, None)?;

    let input_hash = format!("{:x}", md5::compute(&bytes));
    let (result, signature) = replay(executor.as_mut(), bytes, fixed_size);
    println!("input md5: {input_hash}");
    println!("result: {result:?}");
    println!("covered probes: {}", signature.len());

    if let Some(saved) = read_signature(&args.path)? {
        if signature.dominates(&saved) {
            println!("coverage matches the saved signature");
        } else {
            warn!(
                saved = saved.len(),
                replayed = signature.len(),
                "replay did not reach the saved coverage"
            );
        }
    }
    Ok(matches!(result, RunResult::Failure(_) | RunResult::Timeout))
}
