//! CLI entrypoint for stigmergic migration runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;

use colony::io::config::{Config, load_config};
use colony::io::detector::TextualDetector;
use colony::io::git::{GitVcs, NoopVcs, Vcs};
use colony::io::llm::{LlmClient, OpenRouterTransport};
use colony::io::store::{PheromoneStore, StoreCorrupted};
use colony::io::testing::CommandTestRunner;
use colony::looping::{LoopEnv, run_loop};
use colony::start::{StartOptions, prepare_run};
use colony::{exit_codes, logging, review};

#[derive(Parser)]
#[command(name = "colony", version, about = "Stigmergic multi-agent code migration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the migration loop against a working tree.
    Run {
        /// Working tree under migration.
        #[arg(long)]
        target: PathBuf,
        /// Configuration file (TOML); defaults apply when missing.
        #[arg(long, default_value = "colony.toml")]
        config: PathBuf,
        /// Override loop.max_ticks.
        #[arg(long)]
        max_ticks: Option<u64>,
        /// Override budgets.max_tokens_total.
        #[arg(long)]
        max_tokens_total: Option<u64>,
        /// Override budgets.max_budget_usd.
        #[arg(long)]
        max_budget_usd: Option<f64>,
        /// Seed for reproducible tie-breaking and backoff jitter.
        #[arg(long)]
        seed: Option<u64>,
        /// Disable VCS side effects; state transitions still occur.
        #[arg(long)]
        dry_run: bool,
        /// Initialize from existing store state instead of clearing it.
        #[arg(long)]
        resume: bool,
        /// Elevated logging.
        #[arg(long)]
        verbose: bool,
    },
    /// Present files parked in needs_review for an external decision.
    Review {
        /// Working tree under migration.
        #[arg(long)]
        target: PathBuf,
        /// Configuration file (TOML); defaults apply when missing.
        #[arg(long, default_value = "colony.toml")]
        config: PathBuf,
        /// Elevated logging.
        #[arg(long)]
        verbose: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<StoreCorrupted>().is_some() {
                exit_codes::CORRUPT
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            target,
            config,
            max_ticks,
            max_tokens_total,
            max_budget_usd,
            seed,
            dry_run,
            resume,
            verbose,
        } => {
            logging::init(verbose);
            let mut config = load_config(&config)?;
            if let Some(max_ticks) = max_ticks {
                config.r#loop.max_ticks = max_ticks;
            }
            if let Some(max_tokens_total) = max_tokens_total {
                config.budgets.max_tokens_total = max_tokens_total;
            }
            if let Some(max_budget_usd) = max_budget_usd {
                config.budgets.max_budget_usd = max_budget_usd;
            }
            config.validate()?;
            cmd_run(&target, &config, StartOptions { resume, dry_run, seed })
        }
        Command::Review { target, config, verbose } => {
            logging::init(verbose);
            let config = load_config(&config)?;
            cmd_review(&target, &config)
        }
    }
}

fn cmd_run(target: &PathBuf, config: &Config, options: StartOptions) -> Result<()> {
    // Effector credentials come from the environment; a missing key is a
    // fatal initialization error, checked before any state is touched.
    let transport =
        OpenRouterTransport::from_env(&config.llm).context("initialize language-model effector")?;

    let setup = prepare_run(target, config, options)?;
    let store = PheromoneStore::open(&setup.paths.pheromones, config)?;

    let llm = LlmClient::new(
        Box::new(transport),
        &config.llm,
        &config.budgets,
        StdRng::seed_from_u64(options.seed.unwrap_or(0)),
    );
    let detector = TextualDetector::new(&config.discover.legacy_tokens);
    let tests = CommandTestRunner::new(config.tester.clone());
    let vcs: Box<dyn Vcs> = if options.dry_run {
        Box::new(NoopVcs)
    } else {
        Box::new(GitVcs::new(target))
    };

    let env = LoopEnv {
        store: &store,
        config,
        target,
        llm: &llm,
        detector: &detector,
        tests: &tests,
        vcs: vcs.as_ref(),
        dry_run: options.dry_run,
        seed: options.seed,
    };
    let outcome = run_loop(&env, &setup.run_id, &setup.paths.metrics)?;

    let rendered =
        serde_json::to_string_pretty(&outcome.summary).context("serialize summary")?;
    println!("{rendered}");
    Ok(())
}

fn cmd_review(target: &PathBuf, config: &Config) -> Result<()> {
    let paths = colony::io::init::ColonyPaths::new(target);
    let store = PheromoneStore::open(&paths.pheromones, config)?;
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    review::run_review(&store, config, &mut input, &mut output)?;
    Ok(())
}
