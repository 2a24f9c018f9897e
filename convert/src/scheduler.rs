use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lamina_common::events::SlideEvent;
use lamina_common::types::{JobKind, JobPhase};

use crate::bus::BusHandle;
use crate::error::{PipelineError, SubmitError};
use crate::layout::SlideLayout;
use crate::pipeline::{JobRunner, JobSpec, ProgressUpdate};
use crate::vips;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub max_pending_jobs: usize,
    pub concurrency_total: usize,
    pub auto_delete_source_on_success: bool,
}

/// Point-in-time view of one job, as returned by status queries.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub base_name: String,
    pub kind: JobKind,
    pub phase: JobPhase,
    pub percent: u8,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub queue_position: Option<usize>,
    pub restored_from_sync: bool,
}

#[derive(Clone, Debug)]
pub struct SubmitAck {
    pub job_id: Uuid,
    pub queue_position: usize,
}

enum SchedulerMsg {
    Submit {
        base_name: String,
        input: PathBuf,
        kind: JobKind,
        reply: oneshot::Sender<Result<SubmitAck, SubmitError>>,
    },
    /// Re-register a job rebuilt from filesystem state. Bypasses admission;
    /// the work it represents is already underway on this machine.
    Restore {
        base_name: String,
        input: PathBuf,
        kind: JobKind,
        pid: Option<u32>,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        base_name: String,
        reply: oneshot::Sender<bool>,
    },
    Status {
        base_name: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    ActiveJobs {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    ActiveBaseNames {
        reply: oneshot::Sender<HashSet<String>>,
    },
}

/// Handle used by the façade, watcher and recovery to talk to the
/// scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    pub async fn submit(
        &self,
        base_name: String,
        input: PathBuf,
        kind: JobKind,
    ) -> Result<SubmitAck, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::Submit {
                base_name,
                input,
                kind,
                reply,
            })
            .await
            .map_err(|_| SubmitError::Unavailable)?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    pub async fn restore(
        &self,
        base_name: String,
        input: PathBuf,
        kind: JobKind,
        pid: Option<u32>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerMsg::Restore {
                base_name,
                input,
                kind,
                pid,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// True when a queued or active job was cancelled.
    pub async fn cancel(&self, base_name: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerMsg::Cancel { base_name, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn status(&self, base_name: String) -> Option<JobSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::Status { base_name, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn active_jobs(&self) -> Vec<JobSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerMsg::ActiveJobs { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Base names with a queued or active job, for the sweeper.
    pub async fn active_base_names(&self) -> HashSet<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerMsg::ActiveBaseNames { reply })
            .await
            .is_err()
        {
            return HashSet::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct QueuedJob {
    spec: JobSpec,
    queued_at: DateTime<Utc>,
}

struct ActiveJob {
    snapshot: JobSnapshot,
    input: PathBuf,
    cancel: CancellationToken,
}

struct JobDone {
    base_name: String,
    id: Uuid,
    result: Result<(), PipelineError>,
}

struct Scheduler {
    cfg: SchedulerConfig,
    runner: Arc<dyn JobRunner>,
    layout: SlideLayout,
    bus: BusHandle,
    queue: VecDeque<QueuedJob>,
    active: HashMap<String, ActiveJob>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    done_tx: mpsc::Sender<JobDone>,
    cancel: CancellationToken,
}

/// Spawn the scheduler task: the single owner of the pending queue and the
/// active-job table.
pub fn spawn_scheduler(
    cfg: SchedulerConfig,
    runner: Arc<dyn JobRunner>,
    layout: SlideLayout,
    bus: BusHandle,
    cancel: CancellationToken,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(256);
    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(1024);
    let (done_tx, mut done_rx) = mpsc::channel::<JobDone>(64);

    let handle = SchedulerHandle { tx };
    let task = tokio::spawn(async move {
        let mut sched = Scheduler {
            cfg,
            runner,
            layout,
            bus,
            queue: VecDeque::new(),
            active: HashMap::new(),
            progress_tx,
            done_tx,
            cancel: cancel.clone(),
        };
        tracing::info!(
            max_concurrent_jobs = sched.cfg.max_concurrent_jobs,
            max_pending_jobs = sched.cfg.max_pending_jobs,
            concurrency_total = sched.cfg.concurrency_total,
            "scheduler started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    for job in sched.active.values() {
                        job.cancel.cancel();
                    }
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => sched.handle_msg(msg).await,
                    None => break,
                },
                Some(update) = progress_rx.recv() => sched.handle_progress(update),
                Some(done) = done_rx.recv() => sched.handle_done(done).await,
            }
        }
        tracing::info!("scheduler stopped");
    });
    (handle, task)
}

impl Scheduler {
    async fn handle_msg(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Submit {
                base_name,
                input,
                kind,
                reply,
            } => {
                let result = self.admit(base_name, input, kind).await;
                let _ = reply.send(result);
            }
            SchedulerMsg::Restore {
                base_name,
                input,
                kind,
                pid,
                reply,
            } => {
                let accepted = !self.is_tracked(&base_name);
                if accepted {
                    let spec = JobSpec {
                        id: Uuid::new_v4(),
                        base_name,
                        input,
                        kind,
                        adopt_pid: pid,
                    };
                    self.start_job(spec, Utc::now(), true);
                }
                let _ = reply.send(accepted);
            }
            SchedulerMsg::Cancel { base_name, reply } => {
                let _ = reply.send(self.cancel_job(&base_name).await);
            }
            SchedulerMsg::Status { base_name, reply } => {
                let _ = reply.send(self.snapshot_of(&base_name));
            }
            SchedulerMsg::ActiveJobs { reply } => {
                let jobs = self
                    .active
                    .values()
                    .map(|j| j.snapshot.clone())
                    .collect::<Vec<_>>();
                let _ = reply.send(jobs);
            }
            SchedulerMsg::ActiveBaseNames { reply } => {
                let mut names: HashSet<String> =
                    self.active.keys().cloned().collect();
                names.extend(self.queue.iter().map(|j| j.spec.base_name.clone()));
                let _ = reply.send(names);
            }
        }
    }

    fn is_tracked(&self, base: &str) -> bool {
        self.active.contains_key(base) || self.queue.iter().any(|j| j.spec.base_name == base)
    }

    async fn admit(
        &mut self,
        base_name: String,
        input: PathBuf,
        kind: JobKind,
    ) -> Result<SubmitAck, SubmitError> {
        if self.is_tracked(&base_name) {
            return Err(SubmitError::InProgress(base_name));
        }
        let artifact_exists = self.layout.artifact_exists(&base_name).await;
        match kind {
            JobKind::Initial if artifact_exists => {
                return Err(SubmitError::ArtifactExists(base_name));
            }
            JobKind::Reconversion if !artifact_exists => {
                return Err(SubmitError::ArtifactMissing(base_name));
            }
            _ => {}
        }
        if self.queue.len() >= self.cfg.max_pending_jobs {
            return Err(SubmitError::QueueFull(self.cfg.max_pending_jobs));
        }

        let spec = JobSpec {
            id: Uuid::new_v4(),
            base_name: base_name.clone(),
            input,
            kind,
            adopt_pid: None,
        };
        let ack = SubmitAck {
            job_id: spec.id,
            queue_position: self.queue.len(),
        };
        self.queue.push_back(QueuedJob {
            spec,
            queued_at: Utc::now(),
        });
        tracing::info!(base_name = %base_name, kind = %kind, queue_position = ack.queue_position, "job queued");
        self.bus.publish(SlideEvent::Queued { base_name });
        self.dispatch();
        Ok(ack)
    }

    /// Fill free worker slots from the front of the queue.
    fn dispatch(&mut self) {
        while self.active.len() < self.cfg.max_concurrent_jobs {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.start_job(job.spec, job.queued_at, false);
        }
    }

    fn start_job(&mut self, spec: JobSpec, queued_at: DateTime<Utc>, restored: bool) {
        let token = self.cancel.child_token();
        let threads = vips::threads_for(self.cfg.concurrency_total, self.active.len() + 1);
        let base_name = spec.base_name.clone();

        let snapshot = JobSnapshot {
            id: spec.id,
            base_name: base_name.clone(),
            kind: spec.kind,
            // Restored jobs get a conservative guess; their true progress
            // is unknown.
            phase: if restored { JobPhase::Dzi } else { JobPhase::Icc },
            percent: if restored { 50 } else { 5 },
            queued_at,
            started_at: Some(Utc::now()),
            queue_position: None,
            restored_from_sync: restored,
        };
        self.active.insert(
            base_name.clone(),
            ActiveJob {
                snapshot,
                input: spec.input.clone(),
                cancel: token.clone(),
            },
        );

        tracing::info!(base_name = %base_name, kind = %spec.kind, threads, restored, "job started");
        self.bus.publish(if restored {
            SlideEvent::Restored {
                base_name: base_name.clone(),
            }
        } else {
            SlideEvent::Started {
                base_name: base_name.clone(),
            }
        });

        let runner = self.runner.clone();
        let progress_tx = self.progress_tx.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = runner.run(&spec, threads, progress_tx, &token).await;
            let _ = done_tx
                .send(JobDone {
                    base_name: spec.base_name,
                    id: spec.id,
                    result,
                })
                .await;
        });
    }

    fn handle_progress(&mut self, update: ProgressUpdate) {
        let Some(job) = self.active.get_mut(&update.base_name) else {
            return;
        };
        if job.snapshot.id != update.job_id {
            return;
        }
        // Progress is monotonically non-decreasing within a job.
        if update.percent < job.snapshot.percent {
            return;
        }
        job.snapshot.percent = update.percent;
        job.snapshot.phase = update.phase;
        self.bus.publish(SlideEvent::Progress {
            base_name: update.base_name,
            phase: update.phase,
            percent: update.percent,
        });
    }

    async fn handle_done(&mut self, done: JobDone) {
        match self.active.get(&done.base_name) {
            Some(job) if job.snapshot.id == done.id => {}
            _ => return,
        }
        let Some(job) = self.active.remove(&done.base_name) else {
            return;
        };

        match &done.result {
            Ok(()) => {
                tracing::info!(base_name = %done.base_name, "job complete");
                self.bus.publish(SlideEvent::Complete {
                    base_name: done.base_name.clone(),
                });
                if self.cfg.auto_delete_source_on_success {
                    match tokio::fs::remove_file(&job.input).await {
                        Ok(()) => {
                            tracing::info!(base_name = %done.base_name, "source removed after conversion");
                            self.bus.publish(SlideEvent::AutoDelete {
                                base_name: done.base_name.clone(),
                            });
                        }
                        Err(e) => {
                            tracing::warn!(base_name = %done.base_name, error = %e, "failed to auto-delete source");
                        }
                    }
                }
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(base_name = %done.base_name, "job cancelled");
                self.bus.publish(SlideEvent::Cancelled {
                    base_name: done.base_name.clone(),
                });
            }
            Err(e) => {
                tracing::error!(base_name = %done.base_name, error = %e, "job failed");
                self.bus.publish(SlideEvent::Failed {
                    base_name: done.base_name.clone(),
                    error: e.to_string(),
                });
            }
        }

        // The freed slot is refilled in the same pass.
        self.dispatch();
    }

    async fn cancel_job(&mut self, base: &str) -> bool {
        if let Some(pos) = self.queue.iter().position(|j| j.spec.base_name == base) {
            self.queue.remove(pos);
            self.layout.write_cancel_flag(base).await;
            tracing::info!(base_name = base, "queued job cancelled");
            self.bus.publish(SlideEvent::Cancelled {
                base_name: base.to_string(),
            });
            return true;
        }
        if let Some(job) = self.active.get(base) {
            self.layout.write_cancel_flag(base).await;
            tracing::info!(base_name = base, "cancelling active job");
            job.cancel.cancel();
            // The cancelled event follows once the pipeline unwinds.
            return true;
        }
        false
    }

    fn snapshot_of(&self, base: &str) -> Option<JobSnapshot> {
        if let Some(job) = self.active.get(base) {
            return Some(job.snapshot.clone());
        }
        self.queue
            .iter()
            .position(|j| j.spec.base_name == base)
            .map(|pos| {
                let job = &self.queue[pos];
                JobSnapshot {
                    id: job.spec.id,
                    base_name: job.spec.base_name.clone(),
                    kind: job.spec.kind,
                    phase: JobPhase::Queued,
                    percent: 0,
                    queued_at: job.queued_at,
                    started_at: None,
                    queue_position: Some(pos),
                    restored_from_sync: false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::spawn_bus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Runner that records start order and finishes after a short delay,
    /// honouring cancellation.
    struct StubRunner {
        delay: Duration,
        started: Arc<Mutex<Vec<String>>>,
        running: Arc<std::sync::atomic::AtomicUsize>,
        peak: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl StubRunner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                started: Arc::new(Mutex::new(Vec::new())),
                running: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                peak: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl JobRunner for StubRunner {
        async fn run(
            &self,
            spec: &JobSpec,
            _threads: usize,
            progress: mpsc::Sender<ProgressUpdate>,
            cancel: &CancellationToken,
        ) -> Result<(), PipelineError> {
            use std::sync::atomic::Ordering;

            self.started.lock().unwrap().push(spec.base_name.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let _ = progress.try_send(ProgressUpdate {
                job_id: spec.id,
                base_name: spec.base_name.clone(),
                phase: JobPhase::Icc,
                percent: 5,
            });
            let result = tokio::select! {
                () = cancel.cancelled() => Err(PipelineError::Cancelled),
                () = tokio::time::sleep(self.delay) => Ok(()),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Fixture {
        _tmp: TempDir,
        layout: SlideLayout,
        handle: SchedulerHandle,
        cancel: CancellationToken,
    }

    async fn fixture(runner: Arc<dyn JobRunner>, max_concurrent: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = SlideLayout::new(tmp.path().join("slides"), tmp.path().join("dzi"));
        layout.ensure_roots().await.unwrap();
        let cancel = CancellationToken::new();
        let (bus, _bus_task) = spawn_bus(cancel.clone());
        let cfg = SchedulerConfig {
            max_concurrent_jobs: max_concurrent,
            max_pending_jobs: 64,
            concurrency_total: 4,
            auto_delete_source_on_success: false,
        };
        let (handle, _task) = spawn_scheduler(cfg, runner, layout.clone(), bus, cancel.clone());
        Fixture {
            _tmp: tmp,
            layout,
            handle,
            cancel,
        }
    }

    async fn seed_source(layout: &SlideLayout, base: &str) -> PathBuf {
        let path = layout.slides_root().join(format!("{base}.svs"));
        tokio::fs::write(&path, "slide").await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_fifo() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(100)));
        let fx = fixture(runner.clone(), 2).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let base = format!("slide_{i}");
            let input = seed_source(&fx.layout, &base).await;
            let ack = fx
                .handle
                .submit(base, input, JobKind::Initial)
                .await
                .unwrap();
            ids.push(ack.job_id);
        }

        // Two running, three queued.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fx.handle.active_jobs().await.len(), 2);

        // Everything drains, never more than two at once, in FIFO order.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fx.handle.active_jobs().await.is_empty());
        assert_eq!(
            runner.peak.load(std::sync::atomic::Ordering::SeqCst),
            2,
            "concurrency cap exceeded"
        );
        let started = runner.started.lock().unwrap().clone();
        assert_eq!(
            started,
            (0..5).map(|i| format!("slide_{i}")).collect::<Vec<_>>()
        );
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_singleton_per_base_name() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(200)));
        let fx = fixture(runner, 2).await;
        let input = seed_source(&fx.layout, "slide_A").await;

        fx.handle
            .submit("slide_A".into(), input.clone(), JobKind::Initial)
            .await
            .unwrap();
        let err = fx
            .handle
            .submit("slide_A".into(), input, JobKind::Initial)
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::InProgress("slide_A".into()));
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_initial_rejected_when_artifact_exists() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(10)));
        let fx = fixture(runner, 1).await;
        let input = seed_source(&fx.layout, "slide_B").await;

        // Fake a promoted artifact set.
        tokio::fs::create_dir_all(fx.layout.artifact_dir("slide_B"))
            .await
            .unwrap();
        tokio::fs::write(fx.layout.dzi_descriptor("slide_B"), "dzi")
            .await
            .unwrap();

        let err = fx
            .handle
            .submit("slide_B".into(), input.clone(), JobKind::Initial)
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::ArtifactExists("slide_B".into()));

        // Reconversion is the valid path for an existing artifact.
        fx.handle
            .submit("slide_B".into(), input, JobKind::Reconversion)
            .await
            .unwrap();
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reconversion_rejected_without_artifact() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(10)));
        let fx = fixture(runner, 1).await;
        let input = seed_source(&fx.layout, "slide_C").await;

        let err = fx
            .handle
            .submit("slide_C".into(), input, JobKind::Reconversion)
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::ArtifactMissing("slide_C".into()));
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(300)));
        let fx = fixture(runner.clone(), 1).await;

        let input_a = seed_source(&fx.layout, "slide_D").await;
        let input_b = seed_source(&fx.layout, "slide_E").await;
        fx.handle
            .submit("slide_D".into(), input_a, JobKind::Initial)
            .await
            .unwrap();
        fx.handle
            .submit("slide_E".into(), input_b, JobKind::Initial)
            .await
            .unwrap();

        // slide_E is still queued; cancelling removes it without running.
        assert!(fx.handle.cancel("slide_E".into()).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let started = runner.started.lock().unwrap().clone();
        assert_eq!(started, vec!["slide_D".to_string()]);

        // The cancel flag suppresses watcher re-admission.
        assert!(fx.layout.cancel_flag_exists("slide_E").await);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_active_job() {
        let runner = Arc::new(StubRunner::new(Duration::from_secs(10)));
        let fx = fixture(runner, 1).await;
        let input = seed_source(&fx.layout, "slide_F").await;
        fx.handle
            .submit("slide_F".into(), input, JobKind::Initial)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(fx.handle.cancel("slide_F".into()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.handle.active_jobs().await.is_empty());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(10)));
        let fx = fixture(runner, 1).await;
        assert!(!fx.handle.cancel("ghost".into()).await);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_status_reports_queue_position() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(300)));
        let fx = fixture(runner, 1).await;

        let input_a = seed_source(&fx.layout, "slide_G").await;
        let input_b = seed_source(&fx.layout, "slide_H").await;
        fx.handle
            .submit("slide_G".into(), input_a, JobKind::Initial)
            .await
            .unwrap();
        fx.handle
            .submit("slide_H".into(), input_b, JobKind::Initial)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let active = fx.handle.status("slide_G".into()).await.unwrap();
        assert!(active.started_at.is_some());

        let queued = fx.handle.status("slide_H".into()).await.unwrap();
        assert_eq!(queued.phase, JobPhase::Queued);
        assert_eq!(queued.queue_position, Some(0));

        assert!(fx.handle.status("ghost".into()).await.is_none());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_restore_registers_active_job() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(500)));
        let fx = fixture(runner, 1).await;
        let input = seed_source(&fx.layout, "slide_I").await;

        assert!(
            fx.handle
                .restore("slide_I".into(), input, JobKind::Initial, None)
                .await
        );
        let snapshot = fx.handle.status("slide_I".into()).await.unwrap();
        assert!(snapshot.restored_from_sync);
        assert_eq!(snapshot.phase, JobPhase::Dzi);
        assert_eq!(snapshot.percent, 50);
        fx.cancel.cancel();
    }
}
