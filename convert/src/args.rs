use std::fmt;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the conversion orchestrator daemon
    Run(RunArgs),

    /// Convert a single slide and exit
    Convert(ConvertArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,

    #[command(flatten)]
    pub vips: VipsArgs,

    #[command(flatten)]
    pub watcher: WatcherArgs,

    #[command(flatten)]
    pub scheduler: SchedulerArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ConvertArgs {
    /// Path to the slide file to convert
    pub input: PathBuf,

    #[command(flatten)]
    pub layout: LayoutArgs,

    #[command(flatten)]
    pub vips: VipsArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct LayoutArgs {
    /// Directory watched for arriving slide files
    #[arg(long, env = "SLIDES_ROOT", default_value = "/data/slides")]
    pub slides_root: PathBuf,

    /// Directory holding DZI artifact sets
    #[arg(long, env = "DZI_ROOT", default_value = "/data/dzi")]
    pub dzi_root: PathBuf,

    /// Interval between sweeper passes over orphaned directories
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value_t = 300_000)]
    pub sweep_interval_ms: u64,

    /// Age after which an unreferenced staging directory is swept
    #[arg(long, env = "ORPHAN_STAGING_MAX_AGE_MS", default_value_t = 3_600_000)]
    pub orphan_staging_max_age_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct VipsArgs {
    /// Path to the vips binary
    #[arg(long, env = "VIPS_BIN", default_value = "vips")]
    pub vips_bin: String,

    /// Total tool threads shared across concurrent jobs (0 = host cores)
    #[arg(long, env = "CONCURRENCY_TOTAL", default_value_t = 0)]
    pub concurrency_total: usize,

    /// Operation cache ceiling passed to the tool, in bytes
    #[arg(long, env = "CACHE_MEMORY_BYTES", default_value_t = 2_147_483_648)]
    pub cache_memory_bytes: u64,

    /// Threshold above which the tool spills intermediates to disk, in
    /// bytes. Set high to keep pipelines in RAM.
    #[arg(
        long,
        env = "SCRATCH_DISK_THRESHOLD_BYTES",
        default_value_t = 107_374_182_400
    )]
    pub scratch_disk_threshold_bytes: u64,

    /// DZI tile edge length in pixels
    #[arg(long, env = "TILE_SIZE", default_value_t = 256)]
    pub tile_size: u32,

    /// Pixel overlap between adjacent tiles
    #[arg(long, env = "TILE_OVERLAP", default_value_t = 1)]
    pub tile_overlap: u32,

    /// JPEG quality for emitted tiles
    #[arg(long, env = "JPEG_QUALITY", default_value_t = 92)]
    pub jpeg_quality: u32,

    /// Whether to run the ICC colour transform phase
    #[arg(
        long,
        env = "ICC_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub icc_enabled: bool,

    /// Intermediate written by the ICC phase
    #[arg(long, env = "ICC_INTERMEDIATE_FORMAT", value_enum, default_value_t = IccIntermediateFormat::Native)]
    pub icc_intermediate_format: IccIntermediateFormat,

    /// TIFF codec for compressed intermediates
    #[arg(long, env = "ICC_COMPRESSION", default_value = "lzw")]
    pub icc_compression: String,

    /// Quality for lossy intermediate codecs
    #[arg(long, env = "ICC_QUALITY", default_value_t = 85)]
    pub icc_quality: u32,

    /// Minimum interval between forwarded progress updates
    #[arg(long, env = "PROGRESS_DEBOUNCE_MS", default_value_t = 500)]
    pub progress_debounce_ms: u64,

    /// Kill a tool invocation after this long without progress or exit
    #[arg(long, env = "PROGRESS_STALL_TIMEOUT_MS", default_value_t = 3_600_000)]
    pub progress_stall_timeout_ms: u64,

    /// Wall-clock budget per metadata probe command
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value_t = 60_000)]
    pub probe_timeout_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct WatcherArgs {
    /// Interval between file-size stability samples
    #[arg(long, env = "STABILITY_SAMPLE_INTERVAL_MS", default_value_t = 3_000)]
    pub stability_sample_interval_ms: u64,

    /// Cooldown before a previously admitted path may be admitted again
    #[arg(long, env = "READMIT_COOLDOWN_MS", default_value_t = 2_000)]
    pub readmit_cooldown_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    /// Maximum jobs converting in parallel (0 = min(host cores, 8))
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value_t = 0)]
    pub max_concurrent_jobs: usize,

    /// Hard cap on the pending queue; submissions past it are rejected
    #[arg(long, env = "MAX_PENDING_JOBS", default_value_t = 4_096)]
    pub max_pending_jobs: usize,

    /// Delete the source slide file after a successful conversion
    #[arg(long, env = "AUTO_DELETE_SOURCE_ON_SUCCESS", default_value_t = false)]
    pub auto_delete_source_on_success: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum IccIntermediateFormat {
    /// Uncompressed native format: large but cheap to write and read back
    Native,
    /// Compressed TIFF: smaller at the cost of codec CPU
    CompressedTiff,
}

impl fmt::Display for IccIntermediateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IccIntermediateFormat::Native => f.write_str("native"),
            IccIntermediateFormat::CompressedTiff => f.write_str("compressed_tiff"),
        }
    }
}

fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl VipsArgs {
    /// Tool threads shared across all concurrent invocations.
    pub fn resolved_concurrency_total(&self) -> usize {
        if self.concurrency_total > 0 {
            self.concurrency_total
        } else {
            host_cores()
        }
    }
}

impl SchedulerArgs {
    pub fn resolved_max_concurrent_jobs(&self) -> usize {
        if self.max_concurrent_jobs > 0 {
            self.max_concurrent_jobs
        } else {
            host_cores().min(8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let args = RunArgs::parse_from(["run"]);
        assert!(args.vips.resolved_concurrency_total() >= 1);
        let jobs = args.scheduler.resolved_max_concurrent_jobs();
        assert!(jobs >= 1 && jobs <= 8);
        assert_eq!(args.vips.tile_size, 256);
        assert_eq!(args.vips.tile_overlap, 1);
        assert_eq!(args.vips.jpeg_quality, 92);
        assert!(args.vips.icc_enabled);
    }
}
