//! CLI entry point for the memesense pipeline.
//!
//! Subcommands:
//!   train     -- Prepare data, train the fusion model, then evaluate on the test split
//!   evaluate  -- Re-evaluate a saved checkpoint on the same test split
//!   predict   -- Classify one image + caption pair

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use memesense_core::config::resolve_config;
use memesense_experiment::evaluation::{predict_single, report_test_set, run_evaluation};
use memesense_experiment::training::trainer;

#[derive(Parser)]
#[command(name = "memesense", version, about = "Multimodal meme sentiment classifier")]
struct Cli {
    /// YAML experiment configuration. Falls back to $MEMESENSE_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on the configured dataset and report on the held-out split.
    Train,

    /// Evaluate a checkpoint on the held-out split.
    Evaluate {
        /// Checkpoint to evaluate instead of `output.checkpoint_path`.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Predict the sentiment of one meme.
    Predict {
        /// Image file.
        #[arg(long)]
        image: PathBuf,

        /// Caption text.
        #[arg(long)]
        caption: String,

        /// Checkpoint to use instead of `output.checkpoint_path`.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli.config.as_deref()).context("invalid configuration")?;

    match cli.command {
        Command::Train => {
            let run = trainer::train(&config).context("training failed")?;
            if let Some(last) = run.outcome.history.last() {
                println!("Final {last}");
            }
            println!(
                "Stopped: {:?}; best epoch {:?} (val_loss={:.4})",
                run.outcome.stop_reason,
                run.outcome.best_epoch.map(|e| e + 1),
                run.outcome.best_val_loss
            );
            let report = report_test_set(&run.model, &run.data, &run.vocabulary, &config)
                .context("evaluation failed")?;
            println!("{report}");
        }
        Command::Evaluate { checkpoint } => {
            let report =
                run_evaluation(&config, checkpoint.as_deref()).context("evaluation failed")?;
            println!("{report}");
        }
        Command::Predict {
            image,
            caption,
            checkpoint,
        } => {
            let prediction = predict_single(&config, checkpoint.as_deref(), &image, &caption)
                .context("prediction failed")?;
            print!("{prediction}");
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
