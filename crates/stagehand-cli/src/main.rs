//! Stagehand CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod output;

use commands::{CacheCommands, Commands, ConfigCommands, LogFormat};
use config::CliConfig;
use handlers::RunOptions;

/// Exit code for invalid pipelines and unresolvable includes.
const EXIT_CONFIGURATION: u8 = 2;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), err);
            match err.downcast_ref::<stagehand_core::Error>() {
                Some(e) if e.is_configuration() || e.is_resolution() => {
                    ExitCode::from(EXIT_CONFIGURATION)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => CliConfig::load_from(path)?,
        None => CliConfig::load()?,
    };

    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate { pipeline } => handlers::validate(&config, &pipeline).await?,
        Commands::Plan { pipeline } => handlers::plan(&config, &pipeline).await?,
        Commands::Run {
            pipeline,
            shared,
            keep_sandboxes,
            docker,
            continue_on_failure,
            timeout,
            no_cache,
            json,
        } => {
            let options = RunOptions {
                shared,
                keep_sandboxes,
                docker,
                continue_on_failure,
                timeout,
                no_cache,
                json,
            };
            return handlers::run_pipeline(&config, &pipeline, &options).await;
        }
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix, project } => {
                handlers::list_cache(&config, &project, &prefix).await?
            }
            CacheCommands::Clear { project } => handlers::clear_cache(&config, &project).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => {
                handlers::set_config(cli.config.as_deref(), &key, &value)?
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
