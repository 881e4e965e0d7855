mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use aetherflow_engine::{Engine, RunOptions};
use aetherflow_types::FlowError;

#[derive(Parser)]
#[command(name = "aetherflow", version, about = "YAML-first run-once workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate then execute a flow
    Run {
        /// Path to the flow YAML/JSON file
        flow: PathBuf,
        /// Run identifier; reusing one resumes the prior run
        #[arg(long)]
        run_id: Option<String>,
        /// Execute only the named job
        #[arg(long)]
        job: Option<String>,
        /// Bundle manifest to apply before loading the flow
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Validate a flow without executing anything
    Validate {
        /// Path to the flow YAML/JSON file
        flow: PathBuf,
        /// Bundle manifest to apply before loading the flow
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

fn exit_code_for(err: &FlowError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let engine = Engine::builder().build();

    match cli.command {
        Commands::Run {
            flow,
            run_id,
            job,
            manifest,
        } => {
            let opts = RunOptions {
                run_id,
                only_job: job,
                manifest,
                settings: None,
            };
            match engine.run_flow(&flow, opts) {
                Ok(summary) => {
                    match serde_json::to_string_pretty(&summary) {
                        Ok(json) => println!("{json}"),
                        Err(err) => tracing::warn!(error = %err, "summary not serializable"),
                    }
                    if summary.ok() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(1)
                    }
                }
                Err(err) => {
                    tracing::error!("{err}");
                    exit_code_for(&err)
                }
            }
        }
        Commands::Validate { flow, manifest } => {
            match engine.validate(&flow, manifest.as_deref()) {
                Ok(report) => {
                    match serde_json::to_string_pretty(&report) {
                        Ok(json) => println!("{json}"),
                        Err(err) => tracing::warn!(error = %err, "report not serializable"),
                    }
                    if report.ok {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(err) => {
                    tracing::error!("{err}");
                    exit_code_for(&err)
                }
            }
        }
    }
}
