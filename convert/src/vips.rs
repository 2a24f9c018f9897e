use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::args::{IccIntermediateFormat, VipsArgs};
use crate::error::ToolError;

/// How much of the tail of stderr is kept for failure reports.
const STDERR_TAIL_BYTES: usize = 2048;

/// Grace period between asking a child to terminate and force-killing it.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Result of a completed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub exit_code: i32,
    pub stderr_tail: String,
    pub duration: Duration,
}

/// Split a thread budget across concurrently running jobs.
///
/// A lone job gets the whole budget; otherwise each job gets an equal share,
/// never less than one thread.
pub fn threads_for(concurrency_total: usize, active_jobs: usize) -> usize {
    if active_jobs <= 1 {
        concurrency_total.max(1)
    } else {
        (concurrency_total / active_jobs).max(1)
    }
}

/// Driver for the external image tool.
///
/// The orchestrator depends only on the tool's command-line contract: exit
/// code zero on success, stdout lines matching `<N>% complete` during long
/// operations, and the `VIPS_*` environment knobs being honoured.
#[derive(Clone)]
pub struct VipsDriver {
    bin: String,
    cache_memory_bytes: u64,
    scratch_disk_threshold_bytes: u64,
    icc_intermediate_format: IccIntermediateFormat,
    icc_compression: String,
    icc_quality: u32,
    tile_size: u32,
    tile_overlap: u32,
    jpeg_quality: u32,
    progress_debounce: Duration,
    stall_timeout: Duration,
    probe_timeout: Duration,
    progress_re: Regex,
}

impl VipsDriver {
    pub fn new(args: &VipsArgs) -> Self {
        Self {
            bin: args.vips_bin.clone(),
            cache_memory_bytes: args.cache_memory_bytes,
            scratch_disk_threshold_bytes: args.scratch_disk_threshold_bytes,
            icc_intermediate_format: args.icc_intermediate_format,
            icc_compression: args.icc_compression.clone(),
            icc_quality: args.icc_quality,
            tile_size: args.tile_size,
            tile_overlap: args.tile_overlap,
            jpeg_quality: args.jpeg_quality,
            progress_debounce: Duration::from_millis(args.progress_debounce_ms),
            stall_timeout: Duration::from_millis(args.progress_stall_timeout_ms),
            probe_timeout: Duration::from_millis(args.probe_timeout_ms),
            progress_re: Regex::new(r"(\d+)%\s+complete").expect("static progress pattern"),
        }
    }

    /// File extension the ICC phase writes its intermediate as.
    pub fn icc_intermediate_extension(&self) -> &'static str {
        match self.icc_intermediate_format {
            IccIntermediateFormat::Native => "v",
            IccIntermediateFormat::CompressedTiff => "tif",
        }
    }

    /// Transform the slide's embedded profile to sRGB, writing the
    /// intermediate into the staging area.
    pub async fn run_icc(
        &self,
        input: &Path,
        intermediate: &Path,
        threads: usize,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome, ToolError> {
        let input_spec = format!("{}[access=sequential]", input.display());
        let out_spec = match self.icc_intermediate_format {
            IccIntermediateFormat::Native => intermediate.display().to_string(),
            IccIntermediateFormat::CompressedTiff => format!(
                "{}[compression={},Q={}]",
                intermediate.display(),
                self.icc_compression,
                self.icc_quality
            ),
        };
        let args = [
            "icc_transform",
            input_spec.as_str(),
            out_spec.as_str(),
            "srgb",
            "--embedded",
            "--intent",
            "perceptual",
            "--vips-progress",
        ];
        self.run_streaming(&args, threads, progress, cancel).await
    }

    /// Generate the DZI pyramid. `out_base` is the path without extension;
    /// the tool appends `.dzi` and `_files/`.
    pub async fn run_dzi(
        &self,
        input: &Path,
        out_base: &Path,
        threads: usize,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome, ToolError> {
        let input_spec = input.display().to_string();
        let out_spec = out_base.display().to_string();
        let tile_size = self.tile_size.to_string();
        let overlap = self.tile_overlap.to_string();
        let suffix = format!(".jpg[Q={}]", self.jpeg_quality);
        let args = [
            "dzsave",
            input_spec.as_str(),
            out_spec.as_str(),
            "--layout",
            "dz",
            "--tile-size",
            tile_size.as_str(),
            "--overlap",
            overlap.as_str(),
            "--suffix",
            suffix.as_str(),
            "--vips-progress",
        ];
        self.run_streaming(&args, threads, progress, cancel).await
    }

    async fn run_streaming(
        &self,
        args: &[&str],
        threads: usize,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome, ToolError> {
        let start = Instant::now();
        let mut child = self
            .command(args, threads)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("child stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("child stderr was not captured"))
        })?;

        // Collect stderr off to the side; only its tail is kept.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            tail_of(&buf, STDERR_TAIL_BYTES)
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut last_activity = Instant::now();
        let mut last_emit: Option<Instant> = None;
        let mut last_percent: u8 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    terminate(&mut child).await;
                    let _ = stderr_task.await;
                    return Err(ToolError::Cancelled);
                }
                () = tokio::time::sleep_until(last_activity + self.stall_timeout) => {
                    terminate(&mut child).await;
                    let _ = stderr_task.await;
                    return Err(ToolError::Timeout { elapsed: start.elapsed() });
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        last_activity = Instant::now();
                        if let Some(percent) = self.parse_progress(&line) {
                            // Monotonic within an invocation; stale markers
                            // from the tool's eval hooks are ignored.
                            if percent > last_percent {
                                last_percent = percent;
                                let due = last_emit
                                    .is_none_or(|at| at.elapsed() >= self.progress_debounce);
                                if due || percent >= 100 {
                                    last_emit = Some(Instant::now());
                                    let _ = progress.try_send(percent);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed reading tool stdout");
                        break;
                    }
                }
            }
        }

        // Stdout closed; wait for the exit status under the same stall
        // budget and cancellation rules.
        let status = tokio::select! {
            () = cancel.cancelled() => {
                terminate(&mut child).await;
                let _ = stderr_task.await;
                return Err(ToolError::Cancelled);
            }
            () = tokio::time::sleep(self.stall_timeout) => {
                terminate(&mut child).await;
                let _ = stderr_task.await;
                return Err(ToolError::Timeout { elapsed: start.elapsed() });
            }
            status = child.wait() => status?,
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        let duration = start.elapsed();
        match status.code() {
            Some(0) => Ok(ToolOutcome {
                exit_code: 0,
                stderr_tail,
                duration,
            }),
            Some(code) => Err(ToolError::Failure {
                exit_code: code,
                stderr_tail,
            }),
            // Killed by signal
            None => Err(ToolError::Failure {
                exit_code: -1,
                stderr_tail,
            }),
        }
    }

    fn command(&self, args: &[&str], threads: usize) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .env("VIPS_CONCURRENCY", threads.to_string())
            .env("VIPS_CACHE_MAX_MEMORY", self.cache_memory_bytes.to_string())
            .env(
                "VIPS_DISC_THRESHOLD",
                self.scratch_disk_threshold_bytes.to_string(),
            );
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> ToolError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::Absent(self.bin.clone())
        } else {
            ToolError::Io(e)
        }
    }

    fn parse_progress(&self, line: &str) -> Option<u8> {
        let caps = self.progress_re.captures(line)?;
        let percent: u32 = caps.get(1)?.as_str().parse().ok()?;
        Some(percent.min(100) as u8)
    }

    /// Run a probe command to completion, capturing its output. Probes are
    /// short-lived; a wall-clock timeout replaces progress tracking, and a
    /// job cancellation kills the probe process just like the streaming
    /// phases.
    pub async fn run_capture(
        &self,
        program: &str,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<std::process::Output, ToolError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::Absent(program.to_string())
                } else {
                    ToolError::Io(e)
                }
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("probe stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("probe stderr was not captured"))
        })?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = stdout;
            let _ = reader.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = stderr;
            let _ = reader.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            () = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(ToolError::Cancelled);
            }
            () = tokio::time::sleep(self.probe_timeout) => {
                terminate(&mut child).await;
                return Err(ToolError::Timeout {
                    elapsed: self.probe_timeout,
                });
            }
            status = child.wait() => status?,
        };

        Ok(std::process::Output {
            status,
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
        })
    }

    /// Read one header field via `vipsheader -f`.
    pub async fn header_field(
        &self,
        input: &Path,
        field: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ToolError> {
        let header_bin = format!("{}header", self.bin);
        let input_spec = input.display().to_string();
        let output = self
            .run_capture(&header_bin, &["-f", field, input_spec.as_str()], cancel)
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    /// Dump all header fields via `vipsheader -a`.
    pub async fn header_dump(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ToolError> {
        let header_bin = format!("{}header", self.bin);
        let input_spec = input.display().to_string();
        let output = self
            .run_capture(&header_bin, &["-a", input_spec.as_str()], cancel)
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    /// Export the embedded ICC profile to a file. Returns false when the
    /// tool rejects the operation (no profile, unsupported loader).
    pub async fn icc_export(
        &self,
        input: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, ToolError> {
        let input_spec = input.display().to_string();
        let out_spec = out.display().to_string();
        let output = self
            .run_capture(
                &self.bin,
                &["icc_export", input_spec.as_str(), out_spec.as_str()],
                cancel,
            )
            .await?;
        Ok(output.status.success())
    }

    /// Extract a named associated image (label, macro, ...) to a file.
    pub async fn associated_image(
        &self,
        input: &Path,
        name: &str,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, ToolError> {
        let input_spec = input.display().to_string();
        let out_spec = out.display().to_string();
        let output = self
            .run_capture(
                &self.bin,
                &[
                    "openslideload",
                    input_spec.as_str(),
                    out_spec.as_str(),
                    "--associated",
                    name,
                ],
                cancel,
            )
            .await?;
        Ok(output.status.success())
    }

    /// Halve an image and re-encode it as a stripped JPEG.
    pub async fn shrink_to_jpeg(
        &self,
        input: &Path,
        out: &Path,
        quality: u32,
        cancel: &CancellationToken,
    ) -> Result<bool, ToolError> {
        let input_spec = input.display().to_string();
        let out_spec = format!("{}[Q={},strip]", out.display(), quality);
        let output = self
            .run_capture(
                &self.bin,
                &["resize", input_spec.as_str(), out_spec.as_str(), "0.5"],
                cancel,
            )
            .await?;
        Ok(output.status.success())
    }
}

/// Ask the child to stop, then force-kill after the grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn tail_of(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.trim_end().to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::VipsArgs;
    use clap::Parser;

    fn test_driver() -> VipsDriver {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.progress_debounce_ms = 0;
        args.progress_stall_timeout_ms = 10_000;
        VipsDriver::new(&args)
    }

    #[test]
    fn test_threads_for_partitioning() {
        assert_eq!(threads_for(8, 0), 8);
        assert_eq!(threads_for(8, 1), 8);
        assert_eq!(threads_for(8, 2), 4);
        assert_eq!(threads_for(8, 3), 2);
        assert_eq!(threads_for(2, 8), 1);
        assert_eq!(threads_for(0, 1), 1);
    }

    #[test]
    fn test_parse_progress_lines() {
        let driver = test_driver();
        assert_eq!(driver.parse_progress("temp-1: 58% complete"), Some(58));
        assert_eq!(driver.parse_progress("100% complete"), Some(100));
        assert_eq!(driver.parse_progress("done in 3s"), None);
        assert_eq!(driver.parse_progress("58 percent"), None);
    }

    #[test]
    fn test_tail_of_keeps_end() {
        let long = "x".repeat(5000);
        let tail = tail_of(&long, 100);
        assert_eq!(tail.len(), 100);
        assert_eq!(tail_of("short", 100), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_progress_and_exit() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.vips_bin = "sh".to_string();
        args.progress_debounce_ms = 0;
        args.progress_stall_timeout_ms = 10_000;
        let driver = VipsDriver::new(&args);

        let (tx, mut rx) = mpsc::channel(16);
        let script = "echo '10% complete'; echo '50% complete'; echo '100% complete'";
        let outcome = driver
            .run_streaming(&["-c", script], 1, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, vec![10, 50, 100]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_failure_captures_stderr() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.vips_bin = "sh".to_string();
        args.progress_stall_timeout_ms = 10_000;
        let driver = VipsDriver::new(&args);

        let (tx, _rx) = mpsc::channel(16);
        let script = "echo 'boom: bad tile' >&2; exit 3";
        let err = driver
            .run_streaming(&["-c", script], 1, tx, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolError::Failure {
                exit_code,
                stderr_tail,
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr_tail.contains("boom: bad tile"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_cancellation_kills_child() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.vips_bin = "sh".to_string();
        args.progress_stall_timeout_ms = 60_000;
        let driver = VipsDriver::new(&args);

        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let cancel_in = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_in.cancel();
        });
        let started = std::time::Instant::now();
        let err = driver
            .run_streaming(&["-c", "sleep 30"], 1, tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        // Graceful termination plus grace period, not the full sleep.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_cancellation_kills_probe() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.probe_timeout_ms = 60_000;
        let driver = VipsDriver::new(&args);

        let cancel = CancellationToken::new();
        let cancel_in = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_in.cancel();
        });
        let started = std::time::Instant::now();
        let err = driver
            .run_capture("sh", &["-c", "sleep 30"], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        // The stalled probe dies with the cancellation, not at its timeout.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_timeout_kills_probe() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.probe_timeout_ms = 200;
        let driver = VipsDriver::new(&args);

        let err = driver
            .run_capture("sh", &["-c", "sleep 30"], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_absent_binary() {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.vips_bin = "definitely-not-a-real-vips".to_string();
        let driver = VipsDriver::new(&args);
        let (tx, _rx) = mpsc::channel(1);
        let err = driver
            .run_streaming(&["--version"], 1, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Absent(_)));
    }
}
