use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result, bail};
use cover_palette_wasm::{
    ClusterConfig, ClusterCoordinator, ClusterRequest, Submission, decode_rgba,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Extract dominant colors from images with the background k-means worker.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// One or more input image paths
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Number of palette colors
    #[arg(short = 'k', long, default_value_t = cover_palette_wasm::config::DEFAULT_K)]
    n_colors: usize,

    /// Number of k-means iterations
    #[arg(short, long, default_value_t = cover_palette_wasm::config::DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Shrink images so the longest side is at most this many pixels before clustering
    #[arg(short, long)]
    downscale: Option<u32>,

    /// Print the centroids as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Cancel a run that has not finished after this many milliseconds
    #[arg(long)]
    cancel_after: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ClusterConfig::new(args.n_colors)
        .with_iterations(args.iterations)
        .with_downscale(args.downscale);

    // One worker for every input; each run starts from fresh state.
    let mut coordinator = ClusterCoordinator::new().context("starting cluster worker")?;

    for input in &args.inputs {
        let bytes = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
        let (buffer, width, height) = decode_rgba(&bytes, config.downscale)
            .with_context(|| format!("decoding {}", input.display()))?;

        let request = ClusterRequest::new(buffer, width, height, &config);
        if let Submission::Busy(_) = coordinator.submit(request).context("submitting palette run")? {
            bail!("cluster worker still busy");
        }

        let result = match args.cancel_after {
            Some(ms) => coordinator
                .wait_or_cancel(Duration::from_millis(ms))?
                .context("palette run did not resolve")?,
            None => coordinator.wait()?.context("palette run did not resolve")?,
        };

        if let Some(e) = &result.error {
            bail!("palette extraction failed for {}: {e}", input.display());
        }

        let Some(clusters) = result.clusters else {
            warn!(path = %input.display(), "palette run cancelled");
            println!("{}: cancelled", input.display());
            continue;
        };

        info!(path = %input.display(), execution_time_ms = result.execution_time_ms, "palette ready");

        if args.json {
            println!("{}", serde_json::to_string_pretty(&clusters)?);
        } else {
            let total = (width as usize * height as usize).max(1) as f64;
            println!("{} ({:.1} ms)", input.display(), result.execution_time_ms);
            for c in &clusters {
                println!("  #{}  {:>8}  {:5.1}%", c.hex(), c.count, c.count as f64 * 100.0 / total);
            }
        }
    }

    Ok(())
}
