use ndarray::ArrayViewD;

/// Per-block reductions offered by `blockproc run`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Reducer {
    #[default]
    Sum,
    Mean,
    Min,
    Max,
}

impl Reducer {
    pub fn apply(&self, block: ArrayViewD<'_, f64>) -> f64 {
        match self {
            Reducer::Sum => block.sum(),
            Reducer::Mean => block.mean().unwrap_or(f64::NAN),
            Reducer::Min => block.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Max => block.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}
