use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lamina_common::types::{JobKind, JobPhase};

use crate::error::PipelineError;
use crate::layout::SlideLayout;
use crate::probe::MetadataExtractor;
use crate::recovery;
use crate::vips::VipsDriver;

/// Everything a runner needs to execute one conversion job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Uuid,
    pub base_name: String,
    pub input: PathBuf,
    pub kind: JobKind,
    /// A live tool process inherited from a previous orchestrator run.
    /// When set, the runner adopts it instead of starting from scratch.
    pub adopt_pid: Option<u32>,
}

/// Progress notification flowing from a running job to the scheduler.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub base_name: String,
    pub phase: JobPhase,
    pub percent: u8,
}

/// Seam between the scheduler and the conversion work itself, so the
/// scheduler's queueing semantics are testable without the external tool.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(
        &self,
        spec: &JobSpec,
        threads: usize,
        progress: mpsc::Sender<ProgressUpdate>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

/// The production pipeline: ICC transform, DZI generation, sidecar
/// extraction, then atomic promotion.
///
/// Overall progress bands: 5–45 tracks the ICC phase, 50–90 the DZI phase,
/// then discrete steps at 90/95/100 for metadata and promotion.
pub struct ConversionPipeline {
    layout: SlideLayout,
    driver: VipsDriver,
    extractor: MetadataExtractor,
    icc_enabled: bool,
}

impl ConversionPipeline {
    pub fn new(
        layout: SlideLayout,
        driver: VipsDriver,
        extractor: MetadataExtractor,
        icc_enabled: bool,
    ) -> Self {
        Self {
            layout,
            driver,
            extractor,
            icc_enabled,
        }
    }

    async fn run_inner(
        &self,
        spec: &JobSpec,
        threads: usize,
        progress: &mpsc::Sender<ProgressUpdate>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let base = spec.base_name.as_str();
        let kind = spec.kind;

        // Inherited process: let it finish (or die) before touching its
        // staging directory.
        if let Some(pid) = spec.adopt_pid {
            tracing::info!(base_name = base, pid, "adopting inherited tool process");
            recovery::wait_for_pid_exit(pid, cancel).await;
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        self.layout
            .create_staging(base, kind)
            .await
            .map_err(PipelineError::StagingSetup)?;
        let first_phase = if self.icc_enabled {
            JobPhase::Icc
        } else {
            JobPhase::Dzi
        };
        emit(progress, spec, first_phase, 5);

        // An adopted job whose staged output is already complete skips
        // straight to the metadata phase.
        let staged_output_ready = spec.adopt_pid.is_some()
            && path_exists(&self.layout.staged_descriptor(base, kind)).await
            && path_exists(&self.layout.staged_tiles_dir(base, kind)).await;

        if !staged_output_ready {
            let dzi_input = if self.icc_enabled {
                let intermediate = self.layout.icc_intermediate(
                    base,
                    kind,
                    self.driver.icc_intermediate_extension(),
                );
                let tool_tx = phase_progress(progress.clone(), spec, JobPhase::Icc, 5, 40);
                self.driver
                    .run_icc(&spec.input, &intermediate, threads, tool_tx, cancel.clone())
                    .await?;
                intermediate
            } else {
                spec.input.clone()
            };

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            emit(progress, spec, JobPhase::Dzi, 50);

            let out_base = self.layout.staged_out_base(base, kind);
            let tool_tx = phase_progress(progress.clone(), spec, JobPhase::Dzi, 50, 40);
            self.driver
                .run_dzi(&dzi_input, &out_base, threads, tool_tx, cancel.clone())
                .await?;

            // The intermediate is scratch; drop it before promotion.
            if self.icc_enabled {
                let _ = tokio::fs::remove_file(&dzi_input).await;
            }
        } else {
            tracing::info!(base_name = base, "staged output already complete, skipping tool phases");
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        emit(progress, spec, JobPhase::Metadata, 90);

        let metadata_dir = self.layout.staged_metadata_dir(base, kind);
        self.extractor
            .extract_all(&spec.input, base, &metadata_dir, cancel)
            .await
            .map_err(PipelineError::Metadata)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        emit(progress, spec, JobPhase::Metadata, 95);
        emit(progress, spec, JobPhase::Promoting, 95);

        match kind {
            JobKind::Initial => self
                .layout
                .promote(base)
                .await
                .map_err(PipelineError::Promotion)?,
            JobKind::Reconversion => self
                .layout
                .backup_and_promote(base)
                .await
                .map_err(PipelineError::Promotion)?,
        }
        emit(progress, spec, JobPhase::Promoting, 100);
        Ok(())
    }
}

#[async_trait]
impl JobRunner for ConversionPipeline {
    async fn run(
        &self,
        spec: &JobSpec,
        threads: usize,
        progress: mpsc::Sender<ProgressUpdate>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let result = self.run_inner(spec, threads, &progress, cancel).await;
        if let Err(e) = &result {
            if e.is_cancelled() {
                tracing::info!(base_name = %spec.base_name, "job cancelled, removing staging");
            } else {
                tracing::error!(base_name = %spec.base_name, error = %e, "job failed, removing staging");
            }
            self.layout.remove_staging(&spec.base_name, spec.kind).await;
        }
        result
    }
}

fn emit(progress: &mpsc::Sender<ProgressUpdate>, spec: &JobSpec, phase: JobPhase, percent: u8) {
    let _ = progress.try_send(ProgressUpdate {
        job_id: spec.id,
        base_name: spec.base_name.clone(),
        phase,
        percent,
    });
}

/// Bridge a tool invocation's 0–100 progress into a band of the overall
/// job progress.
fn phase_progress(
    progress: mpsc::Sender<ProgressUpdate>,
    spec: &JobSpec,
    phase: JobPhase,
    lo: u8,
    span: u8,
) -> mpsc::Sender<u8> {
    let (tx, mut rx) = mpsc::channel::<u8>(16);
    let job_id = spec.id;
    let base_name = spec.base_name.clone();
    tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            let mapped = lo + ((u32::from(p.min(100)) * u32::from(span)) / 100) as u8;
            let _ = progress.try_send(ProgressUpdate {
                job_id,
                base_name: base_name.clone(),
                phase,
                percent: mapped,
            });
        }
    });
    tx
}

async fn path_exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
