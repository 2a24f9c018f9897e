use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use lamina_common::types::{JobKind, SLIDE_EXTENSIONS};
use lamina_common::wait;

/// Reserved directory-name prefixes owned by the sweeper.
pub const DELETE_PREFIX: &str = "__delete_";
pub const DELETED_PREFIX: &str = "__deleted_";
pub const BACKUP_PREFIX: &str = "__backup_";

const CONVERT_SUFFIX: &str = "_convert";
const RECONVERT_SUFFIX: &str = "_reconvert";

/// Owner of every path the system reads or writes.
///
/// The filesystem layout is the persistent state: sources under
/// `slides_root`, artifact sets and transient staging/backup directories
/// under `dzi_root`. Per-base exclusivity is guaranteed by the scheduler's
/// singleton rule, so promotion never races with itself.
#[derive(Clone, Debug)]
pub struct SlideLayout {
    slides_root: PathBuf,
    dzi_root: PathBuf,
}

impl SlideLayout {
    pub fn new(slides_root: impl Into<PathBuf>, dzi_root: impl Into<PathBuf>) -> Self {
        Self {
            slides_root: slides_root.into(),
            dzi_root: dzi_root.into(),
        }
    }

    pub fn slides_root(&self) -> &Path {
        &self.slides_root
    }

    pub fn dzi_root(&self) -> &Path {
        &self.dzi_root
    }

    pub async fn ensure_roots(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.slides_root)
            .await
            .context("failed to create slides root")?;
        tokio::fs::create_dir_all(&self.dzi_root)
            .await
            .context("failed to create dzi root")?;
        Ok(())
    }

    pub fn artifact_dir(&self, base: &str) -> PathBuf {
        self.dzi_root.join(base)
    }

    pub fn dzi_descriptor(&self, base: &str) -> PathBuf {
        self.artifact_dir(base).join(format!("{base}.dzi"))
    }

    pub fn tiles_dir(&self, base: &str) -> PathBuf {
        self.artifact_dir(base).join(format!("{base}_files"))
    }

    pub fn metadata_dir(&self, base: &str) -> PathBuf {
        self.artifact_dir(base).join("metadata")
    }

    pub fn staging_dir(&self, base: &str, kind: JobKind) -> PathBuf {
        let suffix = match kind {
            JobKind::Initial => CONVERT_SUFFIX,
            JobKind::Reconversion => RECONVERT_SUFFIX,
        };
        self.dzi_root.join(format!("{base}{suffix}"))
    }

    /// Output base handed to the DZI phase; the tool appends `.dzi` and
    /// `_files/` to it.
    pub fn staged_out_base(&self, base: &str, kind: JobKind) -> PathBuf {
        self.staging_dir(base, kind).join(base)
    }

    pub fn staged_descriptor(&self, base: &str, kind: JobKind) -> PathBuf {
        self.staging_dir(base, kind).join(format!("{base}.dzi"))
    }

    pub fn staged_tiles_dir(&self, base: &str, kind: JobKind) -> PathBuf {
        self.staging_dir(base, kind).join(format!("{base}_files"))
    }

    pub fn staged_metadata_dir(&self, base: &str, kind: JobKind) -> PathBuf {
        self.staging_dir(base, kind).join("metadata")
    }

    pub fn icc_intermediate(&self, base: &str, kind: JobKind, ext: &str) -> PathBuf {
        self.staging_dir(base, kind).join(format!("{base}_icc.{ext}"))
    }

    pub fn cancel_flag(&self, base: &str) -> PathBuf {
        self.slides_root.join(format!(".{base}.cancelled"))
    }

    /// Locate the source slide file for a base name, if present.
    pub async fn find_source(&self, base: &str) -> Option<PathBuf> {
        for ext in SLIDE_EXTENSIONS {
            let candidate = self.slides_root.join(format!("{base}.{ext}"));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }

    /// Whether a promoted artifact set exists. The descriptor is renamed
    /// last during promotion, so its presence implies a complete set.
    pub async fn artifact_exists(&self, base: &str) -> bool {
        tokio::fs::try_exists(self.dzi_descriptor(base))
            .await
            .unwrap_or(false)
    }

    pub async fn write_cancel_flag(&self, base: &str) {
        if let Err(e) = tokio::fs::write(self.cancel_flag(base), b"").await {
            tracing::warn!(base_name = base, error = %e, "failed to write cancel flag");
        }
    }

    pub async fn clear_cancel_flag(&self, base: &str) {
        match tokio::fs::remove_file(self.cancel_flag(base)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(base_name = base, error = %e, "failed to clear cancel flag");
            }
        }
    }

    pub async fn cancel_flag_exists(&self, base: &str) -> bool {
        tokio::fs::try_exists(self.cancel_flag(base))
            .await
            .unwrap_or(false)
    }

    pub async fn create_staging(&self, base: &str, kind: JobKind) -> Result<PathBuf> {
        let staging = self.staging_dir(base, kind);
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create staging {}", staging.display()))?;
        tokio::fs::create_dir_all(staging.join("metadata"))
            .await
            .context("failed to create staging metadata dir")?;
        Ok(staging)
    }

    /// Remove a staging directory. Retries briefly; a directory that still
    /// cannot be removed (files held open) is renamed into an orphan marker
    /// for the sweeper.
    pub async fn remove_staging(&self, base: &str, kind: JobKind) {
        let staging = self.staging_dir(base, kind);
        self.remove_or_orphan(&staging).await;
    }

    async fn remove_or_orphan(&self, path: &Path) {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return;
        }
        let cancel = CancellationToken::new();
        for attempt in 0..3usize {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    tracing::warn!(path = %path.display(), attempt, error = %e, "failed to remove directory, retrying");
                    let _ = wait::wait(&cancel, attempt + 1).await;
                }
            }
        }
        // Deferred cleanup: hand the directory to the sweeper.
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let orphan = path.with_file_name(format!(
            "{DELETE_PREFIX}{name}_{}",
            chrono::Utc::now().timestamp_millis()
        ));
        match tokio::fs::rename(path, &orphan).await {
            Ok(()) => {
                tracing::warn!(path = %path.display(), orphan = %orphan.display(), "cleanup deferred to sweeper");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to orphan directory");
            }
        }
    }

    /// Make an initial job's staged artifact set visible under its final
    /// name. The descriptor is renamed last so a reader that sees it also
    /// sees the tile tree and metadata it belongs to.
    pub async fn promote(&self, base: &str) -> Result<()> {
        let kind = JobKind::Initial;
        let target = self.artifact_dir(base);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let moves = [
            (self.staged_tiles_dir(base, kind), self.tiles_dir(base)),
            (self.staged_metadata_dir(base, kind), self.metadata_dir(base)),
            (self.staged_descriptor(base, kind), self.dzi_descriptor(base)),
        ];
        for (staged, final_path) in &moves {
            // Stale targets can only come from an earlier failed promotion;
            // initial jobs are admitted only when no artifact set exists.
            remove_any(final_path).await;
            tokio::fs::rename(staged, final_path).await.with_context(|| {
                format!(
                    "failed to promote {} -> {}",
                    staged.display(),
                    final_path.display()
                )
            })?;
        }
        self.remove_staging(base, kind).await;
        Ok(())
    }

    /// Swap a reconversion's staged artifact set in place of the current
    /// one. The previous set is parked in a backup directory for the
    /// duration of the swap and restored if the swap fails.
    pub async fn backup_and_promote(&self, base: &str) -> Result<()> {
        let kind = JobKind::Reconversion;
        let backup = self.dzi_root.join(format!(
            "{BACKUP_PREFIX}{base}_{}",
            chrono::Utc::now().timestamp_millis()
        ));
        tokio::fs::create_dir_all(&backup)
            .await
            .with_context(|| format!("failed to create backup {}", backup.display()))?;

        // Park the current set. Descriptor first: readers lose the old
        // snapshot before any of its parts disappear.
        let outgoing = [
            (self.dzi_descriptor(base), backup.join(format!("{base}.dzi"))),
            (self.tiles_dir(base), backup.join(format!("{base}_files"))),
            (self.metadata_dir(base), backup.join("metadata")),
        ];
        for (i, (current, parked)) in outgoing.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(current, parked).await {
                // Undo what we parked so the old set stays whole.
                for (current, parked) in outgoing.iter().take(i).rev() {
                    if let Err(e) = tokio::fs::rename(parked, current).await {
                        tracing::error!(path = %current.display(), error = %e, "failed to restore backup entry");
                    }
                }
                let _ = tokio::fs::remove_dir_all(&backup).await;
                return Err(anyhow::Error::new(e).context(format!(
                    "failed to park current artifact {}",
                    current.display()
                )));
            }
        }

        // Bring the new set in, descriptor last.
        let incoming = [
            (self.staged_tiles_dir(base, kind), self.tiles_dir(base)),
            (self.staged_metadata_dir(base, kind), self.metadata_dir(base)),
            (self.staged_descriptor(base, kind), self.dzi_descriptor(base)),
        ];
        for (i, (staged, final_path)) in incoming.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(staged, final_path).await {
                // Roll the swap back: staged entries return to staging,
                // parked entries return to their final names.
                for (staged, final_path) in incoming.iter().take(i).rev() {
                    if let Err(e) = tokio::fs::rename(final_path, staged).await {
                        tracing::error!(path = %final_path.display(), error = %e, "failed to unwind staged entry");
                    }
                }
                for (current, parked) in outgoing.iter().rev() {
                    if let Err(e) = tokio::fs::rename(parked, current).await {
                        tracing::error!(path = %current.display(), error = %e, "failed to restore backup entry");
                    }
                }
                let _ = tokio::fs::remove_dir_all(&backup).await;
                return Err(anyhow::Error::new(e).context(format!(
                    "failed to promote staged entry {}",
                    staged.display()
                )));
            }
        }

        self.remove_staging(base, kind).await;

        // The swap is complete; the backup is now garbage.
        self.remove_or_orphan(&backup).await;
        Ok(())
    }

    /// Move a parked backup set back under its final names. Used by startup
    /// reconciliation when a crash interrupted a swap.
    pub async fn restore_backup(&self, base: &str, backup: &Path) -> Result<()> {
        let entries = [
            (backup.join(format!("{base}_files")), self.tiles_dir(base)),
            (backup.join("metadata"), self.metadata_dir(base)),
            (backup.join(format!("{base}.dzi")), self.dzi_descriptor(base)),
        ];
        tokio::fs::create_dir_all(self.artifact_dir(base))
            .await
            .context("failed to create artifact dir for restore")?;
        for (parked, final_path) in &entries {
            if !tokio::fs::try_exists(parked).await.unwrap_or(false) {
                continue;
            }
            if tokio::fs::try_exists(final_path).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::rename(parked, final_path)
                .await
                .with_context(|| format!("failed to restore {}", final_path.display()))?;
        }
        self.remove_or_orphan(backup).await;
        Ok(())
    }

    /// Two-phase removal of a slide: rename source and artifact directory
    /// with the delete prefix so they vanish from listings atomically, then
    /// remove the data in the background. If the artifact rename fails the
    /// source rename is rolled back and the slide stays visible.
    pub async fn delete_slide(&self, base: &str) -> Result<Vec<String>> {
        let source = self.find_source(base).await;
        let artifact = self.artifact_dir(base);
        let has_artifact = tokio::fs::try_exists(&artifact).await.unwrap_or(false);

        if source.is_none() && !has_artifact {
            bail!("nothing to delete for {base}");
        }

        let ms = chrono::Utc::now().timestamp_millis();
        let mut removed = Vec::new();
        let mut hidden_source: Option<PathBuf> = None;

        if let Some(src) = &source {
            let name = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| base.to_string());
            let hidden = self.slides_root.join(format!("{DELETE_PREFIX}{name}"));
            tokio::fs::rename(src, &hidden)
                .await
                .with_context(|| format!("failed to hide source {}", src.display()))?;
            hidden_source = Some(hidden);
            removed.push("source".to_string());
        }

        let mut hidden_artifact: Option<PathBuf> = None;
        if has_artifact {
            let hidden = self.dzi_root.join(format!("{DELETE_PREFIX}{base}_{ms}"));
            match tokio::fs::rename(&artifact, &hidden).await {
                Ok(()) => {
                    hidden_artifact = Some(hidden);
                    removed.push("artifacts".to_string());
                }
                Err(e) => {
                    // Revert the source rename so the slide stays listed
                    // rather than half-deleted.
                    if let (Some(hidden), Some(src)) = (&hidden_source, &source)
                        && let Err(revert) = tokio::fs::rename(hidden, src).await
                    {
                        tracing::error!(base_name = base, error = %revert, "failed to revert source rename");
                    }
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to hide artifact dir for {base}")));
                }
            }
        }

        self.clear_cancel_flag(base).await;

        // Actual data removal happens off the caller's path; anything that
        // survives keeps its delete prefix and falls to the sweeper.
        let layout = self.clone();
        tokio::spawn(async move {
            if let Some(path) = hidden_source
                && let Err(e) = tokio::fs::remove_file(&path).await
            {
                tracing::warn!(path = %path.display(), error = %e, "deferred source removal to sweeper");
            }
            if let Some(path) = hidden_artifact {
                layout.remove_or_orphan(&path).await;
            }
        });

        Ok(removed)
    }

    /// Remove orphan markers and stale, unreferenced staging directories.
    /// Returns how many entries were removed.
    pub async fn sweep(&self, active: &HashSet<String>, max_age: Duration) -> Result<usize> {
        let mut removed = 0usize;

        let mut entries = tokio::fs::read_dir(&self.dzi_root)
            .await
            .context("failed to read dzi root")?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            if name.starts_with(DELETE_PREFIX)
                || name.starts_with(DELETED_PREFIX)
                || name.starts_with(BACKUP_PREFIX)
            {
                // Backups belonging to an in-flight reconversion are owned
                // by that job, not the sweeper.
                if name.starts_with(BACKUP_PREFIX)
                    && active
                        .iter()
                        .any(|b| name.starts_with(&format!("{BACKUP_PREFIX}{b}_")))
                {
                    continue;
                }
                if remove_any(&path).await {
                    tracing::info!(path = %path.display(), "swept orphan");
                    removed += 1;
                }
                continue;
            }

            let staged_base = name
                .strip_suffix(RECONVERT_SUFFIX)
                .or_else(|| name.strip_suffix(CONVERT_SUFFIX));
            if let Some(base) = staged_base {
                if active.contains(base) {
                    continue;
                }
                if entry_older_than(&entry, max_age).await {
                    if remove_any(&path).await {
                        tracing::info!(path = %path.display(), base_name = base, "swept stale staging");
                        removed += 1;
                    }
                }
            }
        }

        let mut entries = tokio::fs::read_dir(&self.slides_root)
            .await
            .context("failed to read slides root")?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(DELETE_PREFIX) || name.starts_with(DELETED_PREFIX) {
                if remove_any(&entry.path()).await {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Enumerate staging directories present on disk, returning
    /// `(base_name, kind, path)` triples. Used by startup reconciliation.
    pub async fn list_staging(&self) -> Result<Vec<(String, JobKind, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dzi_root)
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
            {
                continue;
            }
            if let Some(base) = name.strip_suffix(RECONVERT_SUFFIX) {
                found.push((base.to_string(), JobKind::Reconversion, entry.path()));
            } else if let Some(base) = name.strip_suffix(CONVERT_SUFFIX) {
                found.push((base.to_string(), JobKind::Initial, entry.path()));
            }
        }
        Ok(found)
    }

    /// Enumerate backup directories, returning `(base_name, path)` pairs.
    pub async fn list_backups(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dzi_root)
            .await
            .context("failed to read dzi root")?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix(BACKUP_PREFIX) {
                // __backup_<base>_<epoch_ms>
                if let Some(idx) = rest.rfind('_') {
                    found.push((rest[..idx].to_string(), entry.path()));
                }
            }
        }
        Ok(found)
    }
}

/// Remove a file or directory, whichever it is. Returns true on success.
async fn remove_any(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => match tokio::fs::remove_dir_all(path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove directory");
                false
            }
        },
        Ok(_) => match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
                false
            }
        },
        Err(_) => false,
    }
}

async fn entry_older_than(entry: &tokio::fs::DirEntry, max_age: Duration) -> bool {
    match entry.metadata().await {
        Ok(meta) => match meta.modified() {
            Ok(modified) => modified
                .elapsed()
                .map(|elapsed| elapsed >= max_age)
                .unwrap_or(false),
            Err(_) => false,
        },
        Err(_) => false,
    }
}
