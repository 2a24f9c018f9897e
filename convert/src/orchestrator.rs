use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lamina_common::events::SlideEvent;
use lamina_common::types::{JobKind, base_name};

use crate::args::RunArgs;
use crate::bus::{BusHandle, Subscription, spawn_bus};
use crate::error::SubmitError;
use crate::layout::{BACKUP_PREFIX, DELETE_PREFIX, DELETED_PREFIX, SlideLayout};
use crate::pipeline::ConversionPipeline;
use crate::probe::MetadataExtractor;
use crate::recovery;
use crate::scheduler::{
    JobSnapshot, SchedulerConfig, SchedulerHandle, SubmitAck, spawn_scheduler,
};
use crate::vips::VipsDriver;
use crate::watcher::{DetectedSlide, WatcherConfig, run_watcher};

/// One row of the slide listing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlideDescriptor {
    pub base_name: String,
    pub source_present: bool,
    pub artifact_present: bool,
    pub label_available: bool,
    pub macro_available: bool,
}

/// The conversion orchestrator: owns every component task and exposes the
/// control-plane operations the transport layer needs.
pub struct Orchestrator {
    layout: SlideLayout,
    scheduler: SchedulerHandle,
    bus: BusHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Wire up and start all components: bus, scheduler, startup
    /// reconciliation, watcher, and sweeper.
    pub async fn start(args: &RunArgs) -> Result<Self> {
        let layout = SlideLayout::new(&args.layout.slides_root, &args.layout.dzi_root);
        layout.ensure_roots().await?;

        let cancel = CancellationToken::new();
        let (bus, bus_task) = spawn_bus(cancel.clone());

        let driver = VipsDriver::new(&args.vips);
        let extractor = MetadataExtractor::new(driver.clone());
        let pipeline = Arc::new(ConversionPipeline::new(
            layout.clone(),
            driver,
            extractor,
            args.vips.icc_enabled,
        ));

        let cfg = SchedulerConfig {
            max_concurrent_jobs: args.scheduler.resolved_max_concurrent_jobs(),
            max_pending_jobs: args.scheduler.max_pending_jobs,
            concurrency_total: args.vips.resolved_concurrency_total(),
            auto_delete_source_on_success: args.scheduler.auto_delete_source_on_success,
        };
        let (scheduler, scheduler_task) =
            spawn_scheduler(cfg, pipeline, layout.clone(), bus.clone(), cancel.clone());

        // Rebuild job state from disk before the watcher feeds new work.
        let orphan_max_age = Duration::from_millis(args.layout.orphan_staging_max_age_ms);
        match recovery::reconcile(&layout, &scheduler, &args.vips.vips_bin, orphan_max_age).await {
            Ok(report) => {
                if report.restored + report.resubmitted + report.backups_restored > 0 {
                    tracing::info!(
                        restored = report.restored,
                        resubmitted = report.resubmitted,
                        backups_restored = report.backups_restored,
                        "startup reconciliation finished"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "startup reconciliation failed");
            }
        }

        let (detected_tx, detected_rx) = mpsc::channel(64);
        let watcher_cfg = WatcherConfig {
            sample_interval: Duration::from_millis(args.watcher.stability_sample_interval_ms),
            readmit_cooldown: Duration::from_millis(args.watcher.readmit_cooldown_ms),
        };
        let watcher_task = tokio::spawn({
            let layout = layout.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(e) = run_watcher(layout, watcher_cfg, detected_tx, cancel).await {
                    tracing::error!(error = %e, "watcher task failed");
                }
            }
        });
        let forward_task = tokio::spawn(forward_detected(
            detected_rx,
            scheduler.clone(),
            bus.clone(),
            cancel.clone(),
        ));
        let sweeper_task = tokio::spawn(run_sweeper(
            layout.clone(),
            scheduler.clone(),
            Duration::from_millis(args.layout.sweep_interval_ms),
            orphan_max_age,
            cancel.clone(),
        ));

        Ok(Self {
            layout,
            scheduler,
            bus,
            cancel,
            tasks: vec![
                bus_task,
                scheduler_task,
                watcher_task,
                forward_task,
                sweeper_task,
            ],
        })
    }

    /// Submit a conversion job for a slide that exists on disk.
    pub async fn submit(&self, base: &str, kind: JobKind) -> Result<SubmitAck, SubmitError> {
        let Some(source) = self.layout.find_source(base).await else {
            return Err(SubmitError::NotFound(base.to_string()));
        };
        if kind == JobKind::Reconversion {
            // An explicit reconvert overrides an earlier cancellation.
            self.layout.clear_cancel_flag(base).await;
        }
        self.scheduler.submit(base.to_string(), source, kind).await
    }

    /// Cancel the queued or active job for a slide.
    pub async fn cancel(&self, base: &str) -> Result<()> {
        if self.scheduler.cancel(base.to_string()).await {
            Ok(())
        } else {
            Err(SubmitError::NotFound(base.to_string()).into())
        }
    }

    /// Remove a slide's source and artifact set. The slide disappears from
    /// listings immediately; data removal happens asynchronously.
    pub async fn delete(&self, base: &str) -> Result<Vec<String>> {
        let source = self.layout.find_source(base).await;
        let has_artifact = tokio::fs::try_exists(self.layout.artifact_dir(base))
            .await
            .unwrap_or(false);
        if source.is_none() && !has_artifact {
            return Err(SubmitError::NotFound(base.to_string()).into());
        }

        // Stop in-flight work before touching its target directories.
        let _ = self.scheduler.cancel(base.to_string()).await;

        let removed = self
            .layout
            .delete_slide(base)
            .await
            .context("failed to delete slide")?;
        self.bus.publish(SlideEvent::Deleted {
            base_name: base.to_string(),
        });
        Ok(removed)
    }

    /// Snapshot of the slide's job, or `None` when nothing is queued or
    /// active.
    pub async fn status(&self, base: &str) -> Option<JobSnapshot> {
        self.scheduler.status(base.to_string()).await
    }

    /// Enumerate known slides: sources awaiting conversion, converted
    /// artifact sets, and which thumbnails each has.
    pub async fn list_slides(&self) -> Result<Vec<SlideDescriptor>> {
        let mut slides: BTreeMap<String, SlideDescriptor> = BTreeMap::new();

        let mut entries = tokio::fs::read_dir(self.layout.slides_root())
            .await
            .context("failed to read slides root")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || name.starts_with(DELETE_PREFIX) {
                continue;
            }
            if let Some(base) = base_name(&path) {
                slides
                    .entry(base.clone())
                    .or_insert_with(|| SlideDescriptor {
                        base_name: base,
                        ..Default::default()
                    })
                    .source_present = true;
            }
        }

        let mut entries = tokio::fs::read_dir(self.layout.dzi_root())
            .await
            .context("failed to read dzi root")?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(DELETE_PREFIX)
                || name.starts_with(DELETED_PREFIX)
                || name.starts_with(BACKUP_PREFIX)
                || name.ends_with("_convert")
                || name.ends_with("_reconvert")
            {
                continue;
            }
            if !self.layout.artifact_exists(&name).await {
                continue;
            }
            let descriptor = slides
                .entry(name.clone())
                .or_insert_with(|| SlideDescriptor {
                    base_name: name.clone(),
                    ..Default::default()
                });
            descriptor.artifact_present = true;
            let metadata_dir = self.layout.metadata_dir(&name);
            descriptor.label_available =
                tokio::fs::try_exists(metadata_dir.join(format!("{name}_label.jpg")))
                    .await
                    .unwrap_or(false);
            descriptor.macro_available =
                tokio::fs::try_exists(metadata_dir.join(format!("{name}_macro.jpg")))
                    .await
                    .unwrap_or(false);
        }

        Ok(slides.into_values().collect())
    }

    /// Open a live event-stream subscription.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.bus.subscribe().await
    }

    /// Stop every component task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("orchestrator stopped");
    }
}

/// Bridge watcher detections into submissions and `file_detected` events.
async fn forward_detected(
    mut rx: mpsc::Receiver<DetectedSlide>,
    scheduler: SchedulerHandle,
    bus: BusHandle,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            detected = rx.recv() => {
                let Some(detected) = detected else { break };
                bus.publish(SlideEvent::FileDetected {
                    base_name: detected.base_name.clone(),
                });
                match scheduler
                    .submit(detected.base_name.clone(), detected.path, JobKind::Initial)
                    .await
                {
                    Ok(_) => {}
                    Err(SubmitError::InProgress(_)) | Err(SubmitError::ArtifactExists(_)) => {
                        tracing::debug!(base_name = %detected.base_name, "detected slide already handled");
                    }
                    Err(e) => {
                        tracing::warn!(base_name = %detected.base_name, error = %e, "failed to submit detected slide");
                    }
                }
            }
        }
    }
}

/// Periodic cleanup of orphan markers and stale staging, skipping anything
/// owned by an active job.
async fn run_sweeper(
    layout: SlideLayout,
    scheduler: SchedulerHandle,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would race startup reconciliation.
    tick.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                let active = scheduler.active_base_names().await;
                match layout.sweep(&active, max_age).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(removed = n, "sweep pass finished"),
                    Err(e) => tracing::warn!(error = %e, "sweep pass failed"),
                }
            }
        }
    }
}
