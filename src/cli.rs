use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use crate::bootstrap::{run_supervisor, run_worker};
use crate::config::AppConfig;
use crate::logging::{init_logging, LogTarget};

#[derive(Parser, Debug)]
#[command(name = "dexsup")]
#[command(version)]
#[command(about = "Worker pool supervisor with health monitoring and graceful shutdown", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise the worker pool until SIGTERM/SIGINT
    Run {
        /// Config directory (default.toml, $DEXSUP_ENV.toml)
        #[arg(short, long, default_value = "config", env = "DEXSUP_CONFIG_DIR")]
        config: PathBuf,
        /// Override pool.desired_workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Serve the worker side of the health channel on stdin/stdout
    Worker {
        /// Config directory (default.toml, $DEXSUP_ENV.toml)
        #[arg(short, long, default_value = "config", env = "DEXSUP_CONFIG_DIR")]
        config: PathBuf,
    },
    /// Validate and print the effective configuration
    Config {
        /// Config directory (default.toml, $DEXSUP_ENV.toml)
        #[arg(short, long, default_value = "config", env = "DEXSUP_CONFIG_DIR")]
        config: PathBuf,
    },
}

/// Run a parsed command line; returns the process exit code
pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Commands::Run { config, workers } => {
            let mut app = match AppConfig::load_from(&config) {
                Ok(app) => app,
                Err(e) => {
                    eprintln!("Configuration error: {e}");
                    return 1;
                }
            };
            if let Some(workers) = workers {
                app.pool.desired_workers = workers;
            }

            let _guard = init_logging(&app.logging, LogTarget::Supervisor);
            match run_supervisor(app).await {
                Ok(code) => code,
                Err(e) => {
                    error!(error = %e, "Supervisor failed");
                    1
                }
            }
        }
        Commands::Worker { config } => {
            let app = AppConfig::load_from(&config).unwrap_or_else(|e| {
                eprintln!("Configuration error, using defaults: {e}");
                AppConfig::default()
            });
            let _guard = init_logging(&app.logging, LogTarget::Worker);
            run_worker(&app.worker).await
        }
        Commands::Config { config } => print_config(&config),
    }
}

fn print_config(dir: &std::path::Path) -> i32 {
    let app = match AppConfig::load_from(dir) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return 1;
        }
    };

    match app.to_toml() {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            return 1;
        }
    }

    match app.validate() {
        Ok(()) => 0,
        Err(errors) => {
            eprintln!("Configuration is invalid:");
            for e in errors {
                eprintln!("  - {e}");
            }
            1
        }
    }
}
