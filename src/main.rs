mod demo;
mod doctor;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floe_core::config::AppConfig;

#[derive(Parser)]
#[command(name = "floe", version, about = "Typed async agent pipelines with an autonomous planner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "floe.toml", env = "FLOE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and report what it enables
    Check,
    /// Run the demo pipeline and a planner run over the same nodes
    Demo {
        /// Topic fed to the pipeline
        #[arg(long, default_value = "metrics")]
        topic: String,
        /// Only run the pipeline
        #[arg(long)]
        skip_planner: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("floe=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            println!("floe configuration: {}", cli.config.display());
            println!();
            let failures = doctor::run_checks(&config);
            if failures > 0 {
                anyhow::bail!("{} configuration check(s) failed", failures);
            }
        }
        Commands::Demo { topic, skip_planner } => {
            let out = demo::run_pipeline(&config, &topic).await?;
            println!("pipeline: {}", serde_json::to_string_pretty(&out)?);

            if !skip_planner {
                let answer = demo::run_planner(&config, &topic).await?;
                println!("planner: {}", serde_json::to_string_pretty(&answer)?);
            }
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(AppConfig::default())
    }
}
