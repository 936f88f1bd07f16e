mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "algobox")]
#[command(about = "Run an algorithm image against input files in an isolated container", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one job and print its report as JSON
    Run {
        /// Saved image archive of the algorithm (docker save output)
        #[arg(short, long)]
        image: PathBuf,

        /// Content digest the archive loads as (sha256:...)
        #[arg(short, long)]
        digest: String,

        /// Input file, staged under /input/ by base name (repeatable)
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Result file inside the container, e.g. /output/result.json
        #[arg(short, long)]
        result: PathBuf,

        /// Job id; a fresh one is generated when omitted
        #[arg(long)]
        job_id: Option<Uuid>,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// Remove every container and volume left behind by a job
    Reap {
        #[arg(long)]
        job_id: Uuid,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // stdout carries the report
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            digest,
            inputs,
            result,
            job_id,
            pretty,
        } => {
            commands::run_job(commands::RunArgs {
                image,
                digest,
                inputs,
                result,
                job_id,
                pretty,
            })
            .await
        }
        Commands::Reap { job_id } => commands::reap_job(job_id).await,
    }
}
