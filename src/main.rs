//! shardrun CLI - resource-sharded test stage runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardrun::config::{self, Config, CpuPin, Debugger, FeatureKind, Launcher};
use shardrun::launcher::LocalLauncher;
use shardrun::plan::TestPlan;
use shardrun::report::ConsoleReporter;
use shardrun::runner::Runner;
use shardrun::system::System;

#[derive(Parser)]
#[command(name = "shardrun")]
#[command(about = "Run test stages over sharded CPU and GPU resources", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shardrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every selected stage
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Run a single test under gdb
        #[arg(long, conflicts_with = "cuda_gdb")]
        gdb: bool,

        /// Run a single test under cuda-gdb
        #[arg(long)]
        cuda_gdb: bool,
    },

    /// Show each stage's workers, shards, and tests without running them
    Plan {
        #[command(flatten)]
        overrides: Overrides,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Discover tests without running them
    List {
        /// Test files, replacing the configured ones
        files: Vec<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

/// Command-line settings layered over the configuration file.
#[derive(Args)]
struct Overrides {
    /// Features to test, comma separated (cpus, openmp, cuda, eager)
    #[arg(long = "use", value_delimiter = ',')]
    features: Option<Vec<FeatureKind>>,

    /// Worker count for every stage
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Per-test timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// CPU pinning policy
    #[arg(long, value_enum)]
    cpu_pin: Option<CpuPin>,

    /// Multi-rank launcher
    #[arg(long, value_enum)]
    launcher: Option<Launcher>,

    /// Ranks per node
    #[arg(long)]
    ranks_per_node: Option<usize>,

    /// Node count
    #[arg(long)]
    nodes: Option<usize>,

    /// CPUs per rank
    #[arg(long)]
    cpus: Option<usize>,

    /// GPUs per rank
    #[arg(long)]
    gpus: Option<usize>,

    /// OpenMP groups per rank
    #[arg(long)]
    omps: Option<usize>,

    /// Threads per OpenMP group
    #[arg(long)]
    ompthreads: Option<usize>,

    /// Framebuffer memory per GPU, in MiB
    #[arg(long)]
    fbmem: Option<u64>,

    /// System memory per rank, in MiB
    #[arg(long)]
    sysmem: Option<u64>,

    /// Utility processors per rank
    #[arg(long)]
    utility: Option<usize>,

    /// Test files, replacing the configured ones
    files: Vec<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(features) = self.features {
            config.features = features;
        }
        if self.workers.is_some() {
            config.execution.workers = self.workers;
        }
        if self.timeout.is_some() {
            config.execution.timeout_secs = self.timeout;
        }
        if let Some(pin) = self.cpu_pin {
            config.execution.cpu_pin = pin;
        }
        if let Some(launcher) = self.launcher {
            config.multi_node.launcher = launcher;
        }
        if let Some(rpn) = self.ranks_per_node {
            config.multi_node.ranks_per_node = rpn;
        }
        if let Some(nodes) = self.nodes {
            config.multi_node.nodes = nodes;
        }

        let core = &mut config.core;
        if let Some(cpus) = self.cpus {
            core.cpus = cpus;
        }
        if let Some(gpus) = self.gpus {
            core.gpus = gpus;
        }
        if let Some(omps) = self.omps {
            core.omps = omps;
        }
        if let Some(ompthreads) = self.ompthreads {
            core.ompthreads = ompthreads;
        }
        if let Some(fbmem) = self.fbmem {
            core.fbmem = fbmem;
        }
        if let Some(sysmem) = self.sysmem {
            core.sysmem = sysmem;
        }
        if let Some(utility) = self.utility {
            core.utility = utility;
        }

        if !self.files.is_empty() {
            config.tests.files = self.files;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            overrides,
            gdb,
            cuda_gdb,
        } => {
            let debugger = if gdb {
                Some(Debugger::Gdb)
            } else if cuda_gdb {
                Some(Debugger::CudaGdb)
            } else {
                None
            };
            run_tests(&cli.config, overrides, debugger, cli.verbose).await
        }
        Commands::Plan { overrides, format } => show_plan(&cli.config, overrides, &format).await,
        Commands::List { files, format } => list_tests(&cli.config, files, &format).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

fn load(config_path: &Path, overrides: Overrides) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);
    config.validate().context("Invalid command-line overrides")?;

    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

async fn run_tests(
    config_path: &Path,
    overrides: Overrides,
    debugger: Option<Debugger>,
    verbose: bool,
) -> Result<()> {
    let mut config = load(config_path, overrides)?;
    if debugger.is_some() {
        config.execution.debugger = debugger;
    }
    let verbose = verbose || config.info.verbose;

    let system = System::detect(&config.system).await;
    let mut plan = TestPlan::new(config, system).await?;

    let summary = plan
        .execute(&LocalLauncher::new(), &ConsoleReporter::new(verbose))
        .await?;

    std::process::exit(summary.exit_code());
}

async fn show_plan(config_path: &Path, overrides: Overrides, format: &str) -> Result<()> {
    let config = load(config_path, overrides)?;
    let system = System::detect(&config.system).await;
    let plan = TestPlan::new(config, system).await?;
    let stages = plan.describe();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&stages)?;
            println!("{}", json);
        }
        _ => {
            for stage in &stages {
                println!(
                    "{} ({}): {} workers, {} tests, {} custom",
                    stage.name,
                    stage.kind,
                    stage.workers,
                    stage.tests.len(),
                    stage.custom.len()
                );
                for shard in &stage.shards {
                    println!("  shard {}", shard);
                }
            }
        }
    }

    Ok(())
}

async fn list_tests(config_path: &Path, files: Vec<PathBuf>, format: &str) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if !files.is_empty() {
        config.tests.files = files;
    }

    let runner = Runner::from_config(&config)?;
    let tests = runner.test_specs(&config).await?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", tests.len());
            for test in &tests {
                let custom = match &test.custom {
                    Some(_) => " [custom]",
                    None => "",
                };
                println!("  {}{}", test.display, custom);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            let features: Vec<&str> = config.features.iter().map(FeatureKind::as_str).collect();
            println!("  Features: {}", features.join(", "));
            match config.execution.workers {
                Some(workers) => println!("  Workers: {}", workers),
                None => println!("  Workers: auto"),
            }
            match config.execution.timeout_secs {
                Some(secs) => println!("  Test timeout: {}s", secs),
                None => println!("  Test timeout: none"),
            }
            println!("  Launcher: {}", config.multi_node.launcher);
            println!("  Ranks per node: {}", config.multi_node.ranks_per_node);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
