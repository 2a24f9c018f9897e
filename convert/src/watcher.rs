use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lamina_common::types::base_name;

use crate::layout::{DELETE_PREFIX, DELETED_PREFIX, SlideLayout};

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Interval between size samples; a file is admitted only after two
    /// consecutive samples agree.
    pub sample_interval: Duration,
    /// Cooldown before the same path may be considered again.
    pub readmit_cooldown: Duration,
}

/// A source file that passed the stability gate.
#[derive(Debug, Clone)]
pub struct DetectedSlide {
    pub base_name: String,
    pub path: PathBuf,
}

/// Watch the slides root and emit each arriving slide exactly once, after
/// its size has stabilised.
///
/// Filesystem notifications are a fast path only; every sampling tick also
/// rescans the directory, so a missed notification delays detection by at
/// most one interval.
pub async fn run_watcher(
    layout: SlideLayout,
    cfg: WatcherConfig,
    detected_tx: mpsc::Sender<DetectedSlide>,
    cancel: CancellationToken,
) -> Result<()> {
    let (fs_tx, mut fs_rx) = mpsc::channel::<PathBuf>(256);

    // The notify callback runs on its own thread; full buffers are fine to
    // drop since the rescan picks stragglers up.
    let _watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res
            && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        {
            for path in event.paths {
                let _ = fs_tx.try_send(path);
            }
        }
    }) {
        Ok(mut watcher) => match watcher.watch(layout.slides_root(), RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "failed to watch slides root, polling only");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to create filesystem watcher, polling only");
            None
        }
    };

    let mut state = WatchState {
        layout,
        cfg,
        pending: HashMap::new(),
        admitted: HashSet::new(),
        cooldown: HashMap::new(),
    };

    tracing::info!(
        path = %state.layout.slides_root().display(),
        sample_interval_ms = state.cfg.sample_interval.as_millis(),
        "watching for arriving slides"
    );

    let mut tick = tokio::time::interval(state.cfg.sample_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(path) = fs_rx.recv() => {
                state.consider(&path).await;
            }
            _ = tick.tick() => {
                state.rescan().await;
                state.sample_pass(&detected_tx).await;
            }
        }
    }

    tracing::info!("watcher stopped");
    Ok(())
}

struct WatchState {
    layout: SlideLayout,
    cfg: WatcherConfig,
    /// Candidate path -> last sampled size. `None` until the first sample,
    /// so admission always compares sizes one full interval apart.
    pending: HashMap<PathBuf, Option<u64>>,
    /// Paths already admitted and still present on disk.
    admitted: HashSet<PathBuf>,
    /// Paths recently considered, to debounce re-admission attempts.
    cooldown: HashMap<PathBuf, Instant>,
}

impl WatchState {
    fn is_candidate_name(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') || name.starts_with(DELETE_PREFIX) || name.starts_with(DELETED_PREFIX)
        {
            return false;
        }
        base_name(path).is_some()
    }

    async fn consider(&mut self, path: &Path) {
        if !Self::is_candidate_name(path) {
            return;
        }
        if self.admitted.contains(path) || self.pending.contains_key(path) {
            return;
        }
        if let Some(last) = self.cooldown.get(path)
            && last.elapsed() < self.cfg.readmit_cooldown
        {
            return;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                self.pending.insert(path.to_path_buf(), None);
            }
            _ => {}
        }
    }

    async fn rescan(&mut self) {
        let mut entries = match tokio::fs::read_dir(self.layout.slides_root()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to scan slides root");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            self.consider(&entry.path()).await;
        }

        // Forget admitted paths whose file is gone, so a later re-upload of
        // the same name is detected again.
        let mut gone = Vec::new();
        for path in &self.admitted {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                gone.push(path.clone());
            }
        }
        for path in gone {
            self.admitted.remove(&path);
        }

        self.cooldown
            .retain(|_, at| at.elapsed() < self.cfg.readmit_cooldown);
    }

    async fn sample_pass(&mut self, detected_tx: &mpsc::Sender<DetectedSlide>) {
        let candidates: Vec<(PathBuf, Option<u64>)> = self
            .pending
            .iter()
            .map(|(p, s)| (p.clone(), *s))
            .collect();

        for (path, last_size) in candidates {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => {
                    self.pending.remove(&path);
                    continue;
                }
            };
            let size = meta.len();
            if last_size != Some(size) || size == 0 {
                self.pending.insert(path.clone(), Some(size));
                continue;
            }

            // Size is stable; run the admission checks.
            let Some(base) = base_name(&path) else {
                self.pending.remove(&path);
                continue;
            };
            if self.layout.cancel_flag_exists(&base).await {
                tracing::debug!(base_name = %base, "cancel flag present, suppressing admission");
                self.pending.remove(&path);
                self.cooldown.insert(path, Instant::now());
                continue;
            }
            if self.layout.artifact_exists(&base).await {
                self.pending.remove(&path);
                self.admitted.insert(path);
                continue;
            }
            if !openable(&path).await {
                tracing::debug!(path = %path.display(), "file not yet readable, resampling");
                continue;
            }

            tracing::info!(base_name = %base, path = %path.display(), size, "stable slide detected");
            self.pending.remove(&path);
            self.admitted.insert(path.clone());
            self.cooldown.insert(path.clone(), Instant::now());
            if detected_tx
                .send(DetectedSlide {
                    base_name: base,
                    path,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Files still exclusively held by a writer are not admitted.
async fn openable(path: &Path) -> bool {
    tokio::fs::File::open(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_cfg() -> WatcherConfig {
        WatcherConfig {
            sample_interval: Duration::from_millis(50),
            readmit_cooldown: Duration::from_millis(100),
        }
    }

    struct Fixture {
        _tmp: TempDir,
        layout: SlideLayout,
        rx: mpsc::Receiver<DetectedSlide>,
        cancel: CancellationToken,
    }

    async fn start_watcher() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = SlideLayout::new(tmp.path().join("slides"), tmp.path().join("dzi"));
        layout.ensure_roots().await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_watcher(layout.clone(), fast_cfg(), tx, cancel.clone()));
        Fixture {
            _tmp: tmp,
            layout,
            rx,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_stable_file_admitted_once() {
        let mut fx = start_watcher().await;
        let path = fx.layout.slides_root().join("slide_A.svs");
        tokio::fs::write(&path, "stable contents").await.unwrap();

        let detected =
            tokio::time::timeout(Duration::from_secs(2), fx.rx.recv())
                .await
                .expect("detection timed out")
                .unwrap();
        assert_eq!(detected.base_name, "slide_A");
        assert_eq!(detected.path, path);

        // No duplicate admission while the file sits there.
        let dup = tokio::time::timeout(Duration::from_millis(400), fx.rx.recv()).await;
        assert!(dup.is_err(), "file admitted twice");
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_growing_file_waits_for_stability() {
        let mut fx = start_watcher().await;
        let path = fx.layout.slides_root().join("slide_B.svs");

        // Keep appending for a few sample intervals.
        let writer_path = path.clone();
        tokio::spawn(async move {
            for i in 0..4 {
                let contents = "x".repeat((i + 1) * 1000);
                tokio::fs::write(&writer_path, contents).await.unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        });

        let detected =
            tokio::time::timeout(Duration::from_secs(3), fx.rx.recv())
                .await
                .expect("detection timed out")
                .unwrap();
        assert_eq!(detected.base_name, "slide_B");
        // Admitted only after writing stopped: the final size is on disk.
        assert_eq!(
            tokio::fs::metadata(&path).await.unwrap().len(),
            4000
        );
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_flag_suppresses_admission() {
        let mut fx = start_watcher().await;
        fx.layout.write_cancel_flag("slide_C").await;
        tokio::fs::write(fx.layout.slides_root().join("slide_C.svs"), "contents")
            .await
            .unwrap();

        let detected = tokio::time::timeout(Duration::from_millis(500), fx.rx.recv()).await;
        assert!(detected.is_err(), "flagged slide was admitted");
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_converted_slide_not_readmitted() {
        let mut fx = start_watcher().await;
        // Artifact set already present for this base name.
        tokio::fs::create_dir_all(fx.layout.artifact_dir("slide_D"))
            .await
            .unwrap();
        tokio::fs::write(fx.layout.dzi_descriptor("slide_D"), "dzi")
            .await
            .unwrap();
        tokio::fs::write(fx.layout.slides_root().join("slide_D.svs"), "contents")
            .await
            .unwrap();

        let detected = tokio::time::timeout(Duration::from_millis(500), fx.rx.recv()).await;
        assert!(detected.is_err(), "converted slide was re-admitted");
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_extension_ignored() {
        let mut fx = start_watcher().await;
        tokio::fs::write(fx.layout.slides_root().join("notes.txt"), "not a slide")
            .await
            .unwrap();
        tokio::fs::write(fx.layout.slides_root().join(".hidden.svs"), "hidden")
            .await
            .unwrap();

        let detected = tokio::time::timeout(Duration::from_millis(500), fx.rx.recv()).await;
        assert!(detected.is_err());
        fx.cancel.cancel();
    }
}
