use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use lamina_common::types::JobKind;

use crate::layout::SlideLayout;
use crate::scheduler::SchedulerHandle;

/// Polling cadence while waiting for an inherited tool process to exit.
const PID_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What startup reconciliation found and did.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    /// Jobs re-registered against a live tool process.
    pub restored: usize,
    /// Orphaned staging resubmitted as fresh jobs.
    pub resubmitted: usize,
    /// Interrupted swaps rolled back from their backup directory.
    pub backups_restored: usize,
}

/// A process-table entry, decoupled from sysinfo for matching logic.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
}

/// Rebuild in-memory job state from the filesystem after a restart.
///
/// Staging directories are matched against live tool processes by command
/// line; matches are re-registered as restored jobs, young unmatched
/// staging with a surviving source is resubmitted, and anything else is
/// left for the sweeper.
pub async fn reconcile(
    layout: &SlideLayout,
    scheduler: &SchedulerHandle,
    tool_name: &str,
    orphan_max_age: Duration,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    // A backup directory with no promoted artifact set means a swap was
    // interrupted; put the old set back before accepting any work.
    for (base, backup) in layout.list_backups().await? {
        if layout.artifact_exists(&base).await {
            continue;
        }
        tracing::warn!(base_name = %base, backup = %backup.display(), "found interrupted swap, restoring backup");
        match layout.restore_backup(&base, &backup).await {
            Ok(()) => report.backups_restored += 1,
            Err(e) => {
                tracing::error!(base_name = %base, error = %e, "failed to restore backup");
            }
        }
    }

    let staging = layout.list_staging().await?;
    if staging.is_empty() {
        return Ok(report);
    }

    let processes = scan_processes(tool_name)
        .await
        .context("failed to scan process table")?;
    tracing::info!(
        staging = staging.len(),
        tool_processes = processes.len(),
        "reconciling staging directories"
    );

    for (base, kind, path) in staging {
        let Some(source) = layout.find_source(&base).await else {
            tracing::warn!(base_name = %base, "staging has no source file, leaving to sweeper");
            continue;
        };

        if let Some(proc_info) = match_process(&path, &source, &processes) {
            tracing::info!(
                base_name = %base,
                pid = proc_info.pid,
                kind = %kind,
                "matched staging to live tool process"
            );
            if scheduler
                .restore(base.clone(), source, kind, Some(proc_info.pid))
                .await
            {
                report.restored += 1;
            }
            continue;
        }

        // No live process. Young staging with a valid precondition is
        // retried from the top; the stale rest ages out via the sweeper.
        if staging_age(&path).await >= orphan_max_age {
            tracing::info!(base_name = %base, "stale orphaned staging, leaving to sweeper");
            continue;
        }
        let artifact = layout.artifact_exists(&base).await;
        let precondition_ok = match kind {
            JobKind::Initial => !artifact,
            JobKind::Reconversion => artifact,
        };
        if !precondition_ok {
            tracing::warn!(base_name = %base, kind = %kind, "orphaned staging no longer applicable, leaving to sweeper");
            continue;
        }
        match scheduler.submit(base.clone(), source, kind).await {
            Ok(_) => {
                tracing::info!(base_name = %base, kind = %kind, "resubmitted orphaned staging");
                report.resubmitted += 1;
            }
            Err(e) => {
                tracing::warn!(base_name = %base, error = %e, "failed to resubmit orphaned staging");
            }
        }
    }

    Ok(report)
}

/// Match a staging directory to a tool process by command line: the
/// invocation either writes into the staging directory or reads the
/// source file.
pub fn match_process<'a>(
    staging: &std::path::Path,
    source: &std::path::Path,
    processes: &'a [ProcessInfo],
) -> Option<&'a ProcessInfo> {
    let staging_str = staging.to_string_lossy();
    let source_str = source.to_string_lossy();
    processes.iter().find(|p| {
        p.cmd
            .iter()
            .any(|arg| arg.contains(staging_str.as_ref()) || arg.contains(source_str.as_ref()))
    })
}

/// Enumerate live processes whose name contains the tool binary name.
async fn scan_processes(tool_name: &str) -> Result<Vec<ProcessInfo>> {
    let tool_name = tool_name.to_string();
    tokio::task::spawn_blocking(move || {
        use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};

        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_processes(ProcessRefreshKind::new().with_cmd(UpdateKind::Always)),
        );
        let needle = std::path::Path::new(&tool_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(tool_name);
        sys.processes()
            .iter()
            .filter(|(_, p)| p.name().contains(&needle))
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string(),
                cmd: p.cmd().to_vec(),
            })
            .collect()
    })
    .await
    .context("process scan task panicked")
}

/// Block until the given pid is gone from the process table, polling.
pub async fn wait_for_pid_exit(pid: u32, cancel: &CancellationToken) {
    loop {
        let alive = pid_alive(pid).await;
        if !alive {
            return;
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(PID_POLL_INTERVAL) => {}
        }
    }
}

async fn pid_alive(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || {
        use sysinfo::{Pid, System};

        let mut sys = System::new();
        sys.refresh_process(Pid::from_u32(pid))
    })
    .await
    .unwrap_or(false)
}

async fn staging_age(path: &std::path::Path) -> Duration {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::ZERO),
        Err(_) => Duration::ZERO,
    }
}
