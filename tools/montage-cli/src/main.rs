//! Montage CLI: render, play back and inspect timelines.
//!
//! Usage:
//!   montage render <EDL> -o <BASE>   Render to files, split into packages
//!   montage play <EDL>               Play back headlessly in real time
//!   montage info <EDL>               Show timeline information
//!   montage check                    Show plugins and configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use montage_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "montage",
    about = "Multitrack timeline renderer and player",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/montage/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a timeline to raw audio and video files
    Render {
        /// Path to the timeline JSON
        path: PathBuf,

        /// Output base path; packages are written as <stem>_<index>.<ext>
        #[arg(short, long)]
        output: PathBuf,

        /// Number of packages to split the range into
        #[arg(long, default_value = "1")]
        packages: usize,

        /// Packages rendered at the same time (defaults to the processor count)
        #[arg(long)]
        jobs: Option<usize>,

        /// Range start (seconds)
        #[arg(long, default_value = "0.0")]
        start: f64,

        /// Range end (seconds, defaults to the timeline length)
        #[arg(long)]
        end: Option<f64>,

        /// Warm-up rendered and discarded before each package (seconds)
        #[arg(long)]
        preroll: Option<f64>,
    },

    /// Play a timeline in real time through null devices
    Play {
        /// Path to the timeline JSON
        path: PathBuf,

        /// Range start (seconds)
        #[arg(long, default_value = "0.0")]
        start: f64,

        /// Range end (seconds, defaults to the timeline length)
        #[arg(long)]
        end: Option<f64>,

        /// Play from the end of the range toward the start
        #[arg(long)]
        reverse: bool,

        /// Playback speed
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },

    /// Show timeline information
    Info {
        /// Path to the timeline JSON
        path: PathBuf,
    },

    /// Show plugins and configuration
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    montage_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Render {
            path,
            output,
            packages,
            jobs,
            start,
            end,
            preroll,
        } => {
            let code =
                commands::render::run(config, path, output, packages, start, end, preroll, jobs)
                    .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Play {
            path,
            start,
            end,
            reverse,
            speed,
        } => commands::play::run(config, path, start, end, reverse, speed).await,
        Commands::Info { path } => commands::info::run(path),
        Commands::Check => commands::check::run(&config),
    }
}
