use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lamina_common::types::JobKind;
use lamina_convert::args::{Cli, Commands, ConvertArgs, RunArgs};
use lamina_convert::error::SubmitError;
use lamina_convert::layout::SlideLayout;
use lamina_convert::orchestrator::Orchestrator;
use lamina_convert::pipeline::{ConversionPipeline, JobRunner, JobSpec};
use lamina_convert::probe::MetadataExtractor;
use lamina_convert::vips::VipsDriver;

#[tokio::main]
async fn main() -> Result<()> {
    lamina_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_daemon(args).await,
        Commands::Convert(args) => convert_once(args).await,
    }
}

async fn run_daemon(args: RunArgs) -> Result<()> {
    tracing::info!(
        slides_root = %args.layout.slides_root.display(),
        dzi_root = %args.layout.dzi_root.display(),
        vips_bin = %args.vips.vips_bin,
        max_concurrent_jobs = args.scheduler.resolved_max_concurrent_jobs(),
        concurrency_total = args.vips.resolved_concurrency_total(),
        "starting conversion orchestrator"
    );

    let orchestrator = Orchestrator::start(&args).await?;

    lamina_common::shutdown::shutdown_signal().await;
    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    Ok(())
}

/// Run the full pipeline for one slide without the daemon.
async fn convert_once(args: ConvertArgs) -> Result<()> {
    let input = args.input.clone();
    let base = lamina_common::types::base_name(&input)
        .ok_or_else(|| SubmitError::UnsupportedFormat(input.display().to_string()))?;
    let slides_root = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let layout = SlideLayout::new(slides_root, &args.layout.dzi_root);
    layout.ensure_roots().await?;

    let driver = VipsDriver::new(&args.vips);
    let extractor = MetadataExtractor::new(driver.clone());
    let pipeline =
        ConversionPipeline::new(layout.clone(), driver, extractor, args.vips.icc_enabled);

    let kind = if layout.artifact_exists(&base).await {
        JobKind::Reconversion
    } else {
        JobKind::Initial
    };
    tracing::info!(base_name = %base, input = %input.display(), kind = %kind, "converting slide");

    let (progress_tx, mut progress_rx) = mpsc::channel::<lamina_convert::pipeline::ProgressUpdate>(64);
    let printer = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            tracing::info!(
                phase = %update.phase,
                percent = update.percent,
                "progress"
            );
        }
    });

    let spec = JobSpec {
        id: Uuid::new_v4(),
        base_name: base.clone(),
        input,
        kind,
        adopt_pid: None,
    };
    let cancel = CancellationToken::new();
    let result = pipeline
        .run(
            &spec,
            args.vips.resolved_concurrency_total(),
            progress_tx,
            &cancel,
        )
        .await;
    let _ = printer.await;

    result.with_context(|| format!("conversion failed for {base}"))?;
    tracing::info!(base_name = %base, dzi = %layout.dzi_descriptor(&base).display(), "conversion complete");
    Ok(())
}
