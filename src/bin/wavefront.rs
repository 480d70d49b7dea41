//! Benchmark entry point: `wavefront SCALE [EDGEFACTOR]`.
//!
//! The grid defaults to the squarest power-of-two layout for the rank
//! count in `WAVEFRONT_RANKS` (default 4). `LOGFILE` enables the
//! resumable run log, `TMPFILE` spills the generated edge list, and
//! `RUST_LOG` controls verbosity.

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use wavefront::grid::GridShape;
use wavefront::harness::{run_benchmark, BenchmarkConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(scale_arg) = args.next() else {
        bail!("usage: wavefront SCALE [EDGEFACTOR]");
    };
    let scale: u32 = scale_arg.parse().context("SCALE must be an integer")?;
    let edge_factor: u32 = match args.next() {
        Some(a) => a.parse().context("EDGEFACTOR must be an integer")?,
        None => 16,
    };

    let ranks: usize = match std::env::var("WAVEFRONT_RANKS") {
        Ok(v) => v.parse().context("WAVEFRONT_RANKS must be an integer")?,
        Err(_) => 4,
    };
    let shape = GridShape::from_total(ranks)?;

    let mut cfg = BenchmarkConfig::new(scale, shape);
    cfg.edge_factor = edge_factor;
    let summary = run_benchmark(&cfg)?;

    println!(
        "completed {} roots ({} resumed), mean TEPS {:.6e}",
        summary.results.len(),
        summary.resumed,
        summary.mean_teps
    );
    Ok(())
}
