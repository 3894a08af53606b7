//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use arrakis_core::FailurePolicy;
use clap::Parser;

/// Download model artifacts listed in a JSON manifest into a ComfyUI models tree.
///
/// HuggingFace files go through the hf CLI (hf_xet) with an HTTP fallback,
/// Civitai files are resolved through their authenticated redirect, and
/// everything else is fetched with aria2c, falling back to wget.
#[derive(Parser, Debug)]
#[command(name = "arrakis-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// Manifest: a JSON list of {url, dir, filename} items, or a preset with a `models` list
    pub manifest: PathBuf,

    /// Models root (default: $COMFY_BASE/ComfyUI/models)
    #[arg(short = 'm', long)]
    pub models_dir: Option<PathBuf>,

    /// Kill aria2c after this many seconds without progress (0 disables)
    #[arg(long, value_name = "SECONDS")]
    pub stall_timeout: Option<u64>,

    /// Whether failed items fail the run: lenient (only configuration errors) or strict
    #[arg(long, value_name = "POLICY")]
    pub failure_policy: Option<FailurePolicy>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
