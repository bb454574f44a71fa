//! stagewise-node — offline tooling for pipeline topology files.
//!
//! ```bash
//! # Check a topology file and print its stages
//! RUST_LOG=info cargo run --bin stagewise-node -- validate pipeline.json
//!
//! # Show names, axes and cache pairs, plus the visit order for 3 steps
//! cargo run --bin stagewise-node -- inspect pipeline.json --steps 3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use stagewise_pipeline::{RequestProgress, Transition};
use stagewise_types::{PipelineConfig, StageConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "stagewise-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Stagewise pipeline topology tooling"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a topology file, then print a one-line summary per stage.
    Validate {
        /// Path to the pipeline JSON file.
        config: PathBuf,
    },

    /// Print every stage in detail and the order a request visits stages.
    Inspect {
        /// Path to the pipeline JSON file.
        config: PathBuf,

        /// Decoding steps to lay out.
        #[arg(long, default_value_t = 2)]
        steps: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=stagewise_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config }        => run_validate(&config),
        Command::Inspect { config, steps }  => run_inspect(&config, steps),
    }
}

fn load(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), stages = config.num_stages(), "config valid");
    Ok(config)
}

// ── Validate ──────────────────────────────────────────────────────────────────

fn run_validate(path: &Path) -> Result<()> {
    let config = load(path)?;
    for (index, stage) in config.stages.iter().enumerate() {
        println!(
            "stage {index}  {:<16} {:<8} inputs={} outputs={} caches={}",
            stage.name,
            stage.device.to_string(),
            stage.input_names.len(),
            stage.output_names.len(),
            stage.state_pairs.len()
        );
    }
    println!(
        "max_seq_len={}  eos_token_id={}  logits=`{}`",
        config.max_seq_len, config.eos_token_id, config.logits_name
    );
    Ok(())
}

// ── Inspect ───────────────────────────────────────────────────────────────────

fn run_inspect(path: &Path, steps: usize) -> Result<()> {
    let config = load(path)?;
    for (index, stage) in config.stages.iter().enumerate() {
        print_stage(index, stage);
    }

    if steps == 0 {
        return Ok(());
    }
    println!("visit order for {steps} step(s):");
    for (step, stage) in visit_order(config.num_stages(), steps)? {
        println!("  step {step}  stage {stage} ({})", config.stages[stage].name);
    }
    Ok(())
}

fn print_stage(index: usize, stage: &StageConfig) {
    println!("stage {index}: {} on {}", stage.name, stage.device);
    println!("  inputs:  {}", stage.input_names.join(", "));
    println!("  outputs: {}", stage.output_names.join(", "));
    println!("  length from `{}`", stage.seq_len_input);
    for pair in &stage.state_pairs {
        println!("  cache    {} -> {}", pair.past, pair.present);
    }
    for (output, input) in &stage.inter_stage_outputs {
        println!("  forward  {output} => {input}");
    }
    let axes = stage.axes;
    println!(
        "  axes     state={}/{} input={}/{} inter-stage={}/{} (batch/seq)",
        axes.state.batch,
        axes.state.seq,
        axes.input.batch,
        axes.input.seq,
        axes.inter_stage.batch,
        axes.inter_stage.seq
    );
}

/// `(step, stage)` pairs in the order one request visits them.
fn visit_order(num_stages: usize, steps: usize) -> Result<Vec<(usize, usize)>> {
    let mut progress = RequestProgress::new(0, num_stages, steps);
    progress.start()?;
    let mut order = vec![(0, 0)];
    loop {
        let transition = progress.on_stage_complete(progress.stage)?;
        debug!(?transition, "visit");
        match transition {
            Transition::NextStage { stage } => order.push((progress.step, stage)),
            Transition::NextStep { step }   => order.push((step, 0)),
            Transition::Finished { .. }     => return Ok(order),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
