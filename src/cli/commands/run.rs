use anyhow::{Context, Result};
use clap::Args;
use ndarray::{ArrayD, ArrayViewD};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cli::Reducer;
use crate::config::{BlockprocConfig, Settings, StrategyKind};
use crate::process::process_blocks;

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Input array as ndarray JSON (`{"v":1,"dim":[..],"data":[..]}`)
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Block shape, one length per axis (e.g. 8,8)
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub block: Vec<usize>,

    /// Elements shared by neighbouring blocks
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Reduction applied to each block
    #[arg(short, long, value_enum, default_value_t = Reducer::Sum)]
    pub reduce: Reducer,

    /// Execution strategy (overrides config)
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Pool size for parallel strategies (0 = derive from CPU count)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Bound on each wait for a block result, in milliseconds (0 = none)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Run sequentially when the grid has fewer blocks than this
    #[arg(long, value_name = "BLOCKS")]
    pub min_blocks_for_parallel: Option<usize>,

    /// Write the result grid here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,
}

impl RunArgs {
    /// CLI flags take precedence over every config layer
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(strategy) = self.strategy {
            settings.executor.strategy = strategy;
        }
        if let Some(workers) = self.workers {
            settings.executor.workers = workers;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.executor.timeout_ms = timeout_ms;
        }
        if let Some(min_blocks) = self.min_blocks_for_parallel {
            settings.executor.min_blocks_for_parallel = min_blocks;
        }
        if let Some(overlap) = self.overlap {
            settings.blocks.overlap = overlap;
        }
    }
}

pub fn execute(args: RunArgs, custom_config: Option<&Path>) -> Result<()> {
    let mut settings = BlockprocConfig::load_with_custom_config(custom_config)?.settings()?;
    args.apply_overrides(&mut settings);
    let options = settings.process_options();

    let input = fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read input array {}", args.input.display()))?;
    let array: ArrayD<f64> = serde_json::from_str(&input)
        .with_context(|| format!("{} is not a valid array document", args.input.display()))?;

    tracing::info!(
        "Reducing {:?} array in blocks of {:?} ({:?}, overlap {}, parallel from {} blocks)",
        array.shape(),
        args.block,
        options.strategy,
        settings.blocks.overlap,
        options.min_blocks_for_parallel
    );

    let start = Instant::now();
    let output = process_blocks(
        &array,
        &args.block,
        |block: ArrayViewD<'_, f64>, reducer: &Reducer| reducer.apply(block),
        args.reduce,
        settings.blocks.overlap,
        &options,
    )
    .context("Block processing failed")?;
    tracing::info!("Processed {} blocks in {:?}", output.len(), start.elapsed());

    let json = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };

    match &args.output {
        Some(path) => {
            fs::write(path, format!("{json}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote result grid to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
