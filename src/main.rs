// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, info, warn};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use threadrelay::app_config::{self, Config};
use threadrelay::database::{DatabaseConnection, Repository};
use threadrelay::platform::{DryRunPublisher, SpoolFeed};
use threadrelay::providers::build_provider;
use threadrelay::store::PipelineStore;
use threadrelay::{Collaborators, Pipeline, Stage, Status};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

/// CLI Wrapper for Stage to implement ValueEnum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStage {
    Ingest,
    Analyze,
    Translate,
    Publish,
}

impl From<CliStage> for Stage {
    fn from(stage: CliStage) -> Self {
        match stage {
            CliStage::Ingest => Stage::Ingest,
            CliStage::Analyze => Stage::Analyze,
            CliStage::Translate => Stage::Translate,
            CliStage::Publish => Stage::Publish,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline until interrupted (default command)
    Run,

    /// Run one scan of a stage and wait for the queued work to finish
    Scan {
        /// Stage to scan
        #[arg(value_enum)]
        stage: CliStage,

        /// Only scan this account
        #[arg(short, long)]
        account: Option<String>,
    },

    /// Print post and thread counts per status
    Status,

    /// Generate shell completions for threadrelay
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// threadrelay - ingest, translate and republish social post threads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    threadrelay                         # Run with conf.json
    threadrelay -c prod.json run        # Run with another config file
    threadrelay scan translate -a news  # Queue analyzed threads of one account
    threadrelay status                  # Show pipeline counts

    Configuration is stored in conf.json by default. If the config file doesn't
    exist, a default one is created.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = "conf.json", global = true)]
    config_path: String,

    /// Set logging level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<CliLogLevel>,
}

/// Colored, timestamped logger on stderr
struct CustomLogger;

impl CustomLogger {
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger))?;
        log::set_max_level(level);
        Ok(())
    }

    fn color_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "1;31",
            Level::Warn => "1;33",
            Level::Info => "1;32",
            Level::Debug => "1;36",
            Level::Trace => "1;35",
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {:<5} {}\x1B[0m",
                Self::color_for_level(record.level()),
                now,
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Some(Commands::Completions { shell }) = cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(shell, &mut cmd, "threadrelay", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config_path, cli.log_level.clone())?;
    log::set_max_level(config.log_level.to_level_filter());

    let repository = open_repository(&config)?;

    match cli.command {
        None | Some(Commands::Run) => run(config, repository).await,
        Some(Commands::Scan { stage, account }) => {
            scan(config, repository, stage.into(), account.as_deref()).await
        }
        Some(Commands::Status) => print_status(&repository).await,
        Some(Commands::Completions { .. }) => Ok(()),
    }
}

/// Load the configuration, creating a default one when the file is missing
fn load_config(config_path: &str, log_level: Option<CliLogLevel>) -> Result<Config> {
    let mut config = if Path::new(config_path).exists() {
        Config::from_file(config_path)?
    } else {
        warn!(
            "Config file not found at '{}', creating default config.",
            config_path
        );
        let config = Config::default();
        config.save(config_path)?;
        config
    };

    if let Some(level) = log_level {
        config.log_level = level.into();
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

fn open_repository(config: &Config) -> Result<Repository> {
    match &config.database_path {
        Some(path) => Ok(Repository::new(DatabaseConnection::new(path)?)),
        None => Repository::new_default(),
    }
}

fn build_pipeline(config: Config, repository: Repository) -> Result<Pipeline> {
    if !config.publish.dry_run {
        return Err(anyhow!(
            "publish.dry_run is false but no live platform client is available; \
             set it to true to run with the dry-run publisher"
        ));
    }

    let collaborators = Collaborators {
        store: Arc::new(repository),
        feed: Arc::new(SpoolFeed::new(&config.ingest.spool_dir)),
        publisher: Arc::new(DryRunPublisher::new()),
        translator: build_provider(&config.translation)?,
    };
    Pipeline::build(config, collaborators)
}

async fn run(config: Config, repository: Repository) -> Result<()> {
    let pipeline = build_pipeline(config, repository)?;
    pipeline.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, stopping timers");

    pipeline.shutdown().await;
    for (name, stats) in pipeline.queue_stats() {
        info!("{}: {}", name, stats);
    }
    Ok(())
}

async fn scan(
    config: Config,
    repository: Repository,
    stage: Stage,
    account: Option<&str>,
) -> Result<()> {
    let pipeline = build_pipeline(config, repository)?;
    pipeline.scan(stage, account).await?;
    pipeline.wait_idle(Duration::from_millis(100)).await;

    for (name, stats) in pipeline.queue_stats() {
        println!("{}: {}", name, stats);
    }
    Ok(())
}

async fn print_status(repository: &Repository) -> Result<()> {
    let counts = repository.status_counts().await?;
    println!("{:<12} {:>8} {:>8}", "status", "posts", "threads");
    for status in Status::ALL {
        println!(
            "{:<12} {:>8} {:>8}",
            status.to_string(),
            counts.posts_in(status),
            counts.threads_in(status)
        );
    }
    Ok(())
}
