use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::vips::VipsDriver;

/// Thumbnails above this size are treated as unoptimised prior extractions
/// and re-extracted.
const THUMB_REEXTRACT_BYTES: u64 = 100 * 1024;

/// JPEG quality for extracted thumbnails.
const THUMB_QUALITY: u32 = 85;

/// Size thumbnails should come in under after the halve-and-re-encode.
const THUMB_TARGET_BYTES: u64 = 150 * 1024;

/// Associated-image names probed for the label thumbnail, in order.
const LABEL_ALIASES: &[&str] = &["label", "slide label", "label image", "thumbnail"];

/// Associated-image names probed for the macro thumbnail, in order.
const MACRO_ALIASES: &[&str] = &["macro", "overview", "macro image", "thumbnail"];

/// Which sidecars ended up on disk after an extraction pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarReport {
    pub icc: bool,
    pub label: bool,
    pub macro_image: bool,
    pub property_count: usize,
}

/// Produces the optional sidecar artifacts for a slide: ICC profile, label
/// and macro thumbnails, and the properties document.
///
/// Every probe is best-effort. A sidecar that cannot be derived is simply
/// absent; only failing to write the properties document is an error, since
/// a complete artifact set always carries one. A job cancellation kills the
/// in-flight probe process and stops the pass.
#[derive(Clone)]
pub struct MetadataExtractor {
    driver: VipsDriver,
}

impl MetadataExtractor {
    pub fn new(driver: VipsDriver) -> Self {
        Self { driver }
    }

    /// Extract all sidecars for `base` into `metadata_dir`.
    pub async fn extract_all(
        &self,
        input: &Path,
        base: &str,
        metadata_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SidecarReport> {
        let mut report = SidecarReport::default();

        let icc_path = metadata_dir.join(format!("{base}.icc"));
        report.icc = self.extract_icc(input, &icc_path, cancel).await;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let label_path = metadata_dir.join(format!("{base}_label.jpg"));
        report.label = self
            .extract_thumbnail(input, LABEL_ALIASES, &label_path, cancel)
            .await;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let macro_path = metadata_dir.join(format!("{base}_macro.jpg"));
        report.macro_image = self
            .extract_thumbnail(input, MACRO_ALIASES, &macro_path, cancel)
            .await;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let properties = self.extract_properties(input, cancel).await;
        report.property_count = properties.len();
        if cancel.is_cancelled() {
            return Ok(report);
        }
        let json_path = metadata_dir.join(format!("{base}_metadata.json"));
        write_metadata_json(&json_path, base, &properties)
            .await
            .context("failed to write slide metadata document")?;

        tracing::info!(
            base_name = base,
            icc = report.icc,
            label = report.label,
            macro_image = report.macro_image,
            properties = report.property_count,
            "sidecar extraction finished"
        );
        Ok(report)
    }

    /// Derive the embedded ICC profile. Strategies, in order: base64 header
    /// field, the tool's profile-export command, an external metadata tool.
    async fn extract_icc(&self, input: &Path, out: &Path, cancel: &CancellationToken) -> bool {
        if sidecar_present(out, None).await {
            tracing::debug!(path = %out.display(), "icc sidecar already present, skipping");
            return true;
        }

        match self
            .driver
            .header_field(input, "icc-profile-data", cancel)
            .await
        {
            Ok(Some(encoded)) => {
                let compact: String = encoded.split_whitespace().collect();
                match base64::engine::general_purpose::STANDARD.decode(compact) {
                    Ok(bytes) if !bytes.is_empty() => {
                        if let Err(e) = tokio::fs::write(out, &bytes).await {
                            tracing::warn!(path = %out.display(), error = %e, "failed to write icc sidecar");
                        } else {
                            return true;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "icc header field was not valid base64");
                    }
                }
            }
            Ok(None) => {}
            Err(ToolError::Cancelled) => return false,
            Err(e) => log_probe_miss("icc header", &e),
        }

        match self.driver.icc_export(input, out, cancel).await {
            Ok(true) if sidecar_present(out, None).await => return true,
            Ok(_) => {}
            Err(ToolError::Cancelled) => return false,
            Err(e) => log_probe_miss("icc export", &e),
        }

        // Last resort: an external metadata tool, if installed.
        let input_spec = input.display().to_string();
        match self
            .driver
            .run_capture(
                "exiftool",
                &["-icc_profile", "-b", input_spec.as_str()],
                cancel,
            )
            .await
        {
            Ok(output) if output.status.success() && !output.stdout.is_empty() => {
                if let Err(e) = tokio::fs::write(out, &output.stdout).await {
                    tracing::warn!(path = %out.display(), error = %e, "failed to write icc sidecar");
                } else {
                    return true;
                }
            }
            Ok(_) => {}
            Err(ToolError::Cancelled) => return false,
            Err(e) => log_probe_miss("exiftool icc", &e),
        }

        false
    }

    /// Extract an associated image under any of its aliases, halved and
    /// re-encoded as a stripped JPEG.
    async fn extract_thumbnail(
        &self,
        input: &Path,
        aliases: &[&str],
        out: &Path,
        cancel: &CancellationToken,
    ) -> bool {
        if sidecar_present(out, Some(THUMB_REEXTRACT_BYTES)).await {
            tracing::debug!(path = %out.display(), "thumbnail already present, skipping");
            return true;
        }

        let raw = out.with_extension("extract.v");
        for alias in aliases {
            if cancel.is_cancelled() {
                break;
            }
            match self.driver.associated_image(input, alias, &raw, cancel).await {
                Ok(true) => {
                    let shrunk = match self
                        .driver
                        .shrink_to_jpeg(&raw, out, THUMB_QUALITY, cancel)
                        .await
                    {
                        Ok(ok) => ok,
                        Err(ToolError::Cancelled) => false,
                        Err(e) => {
                            log_probe_miss("thumbnail shrink", &e);
                            false
                        }
                    };
                    let _ = tokio::fs::remove_file(&raw).await;
                    if shrunk && sidecar_present(out, None).await {
                        if let Ok(meta) = tokio::fs::metadata(out).await
                            && meta.len() > THUMB_TARGET_BYTES
                        {
                            tracing::debug!(
                                path = %out.display(),
                                bytes = meta.len(),
                                "thumbnail larger than target size"
                            );
                        }
                        return true;
                    }
                }
                Ok(false) => {}
                Err(ToolError::Cancelled) => break,
                Err(e) => {
                    log_probe_miss("associated image", &e);
                    // The tool is missing or timing out; further aliases
                    // will not fare better.
                    break;
                }
            }
        }
        let _ = tokio::fs::remove_file(&raw).await;

        // A failed re-extraction keeps whatever was there before.
        tokio::fs::try_exists(out).await.unwrap_or(false)
    }

    /// Dump slide properties as `key: value` lines and parse them into an
    /// ordered map. An empty map on probe failure.
    async fn extract_properties(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, String> {
        match self.driver.header_dump(input, cancel).await {
            Ok(Some(text)) => parse_properties(&text),
            Ok(None) => BTreeMap::new(),
            Err(ToolError::Cancelled) => BTreeMap::new(),
            Err(e) => {
                log_probe_miss("properties", &e);
                BTreeMap::new()
            }
        }
    }
}

fn log_probe_miss(what: &str, err: &ToolError) {
    match err {
        ToolError::Absent(bin) => {
            tracing::debug!(probe = what, bin = %bin, "probe tool not installed");
        }
        other => {
            tracing::debug!(probe = what, error = %other, "probe failed");
        }
    }
}

/// True when the sidecar exists, is non-empty, and (when a ceiling is
/// given) does not exceed it.
async fn sidecar_present(path: &Path, max_bytes: Option<u64>) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => max_bytes.is_none_or(|cap| meta.len() <= cap),
        _ => false,
    }
}

#[derive(Serialize)]
struct MetadataDocument<'a> {
    base_name: &'a str,
    extracted_at: String,
    properties: &'a BTreeMap<String, String>,
}

async fn write_metadata_json(
    path: &Path,
    base: &str,
    properties: &BTreeMap<String, String>,
) -> Result<()> {
    let doc = MetadataDocument {
        base_name: base,
        extracted_at: chrono::Utc::now().to_rfc3339(),
        properties,
    };
    let contents =
        serde_json::to_string_pretty(&doc).context("failed to serialize metadata document")?;
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Parse `key: value` lines. Lines without a colon are skipped.
fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::VipsArgs;
    use clap::Parser;
    use tempfile::TempDir;

    fn absent_tool_extractor() -> MetadataExtractor {
        let mut args = VipsArgs::parse_from(["vips"]);
        args.vips_bin = "definitely-not-a-real-vips".to_string();
        args.probe_timeout_ms = 2_000;
        MetadataExtractor::new(VipsDriver::new(&args))
    }

    #[test]
    fn test_parse_properties() {
        let text = "width: 98304\nheight: 81920\nopenslide.vendor: aperio\nnot a property line\n: empty key\n";
        let props = parse_properties(text);
        assert_eq!(props.get("width").map(String::as_str), Some("98304"));
        assert_eq!(
            props.get("openslide.vendor").map(String::as_str),
            Some("aperio")
        );
        assert_eq!(props.len(), 3);
    }

    #[tokio::test]
    async fn test_existing_sidecar_is_kept_without_tool() {
        let tmp = TempDir::new().unwrap();
        let icc = tmp.path().join("slide.icc");
        tokio::fs::write(&icc, b"existing-profile").await.unwrap();

        let extractor = absent_tool_extractor();
        let kept = extractor
            .extract_icc(
                &tmp.path().join("slide.svs"),
                &icc,
                &CancellationToken::new(),
            )
            .await;
        assert!(kept);
        assert_eq!(
            tokio::fs::read(&icc).await.unwrap(),
            b"existing-profile".to_vec()
        );
    }

    #[tokio::test]
    async fn test_oversized_thumbnail_triggers_reextract_attempt() {
        let tmp = TempDir::new().unwrap();
        let thumb = tmp.path().join("slide_label.jpg");
        tokio::fs::write(&thumb, vec![0u8; 200 * 1024]).await.unwrap();

        let extractor = absent_tool_extractor();
        // Re-extraction fails (no tool) but the old sidecar survives.
        let present = extractor
            .extract_thumbnail(
                &tmp.path().join("slide.svs"),
                LABEL_ALIASES,
                &thumb,
                &CancellationToken::new(),
            )
            .await;
        assert!(present);
        assert_eq!(
            tokio::fs::metadata(&thumb).await.unwrap().len(),
            200 * 1024
        );
    }

    #[tokio::test]
    async fn test_metadata_document_written_without_tool() {
        let tmp = TempDir::new().unwrap();
        let extractor = absent_tool_extractor();
        let report = extractor
            .extract_all(
                &tmp.path().join("slide.svs"),
                "slide",
                tmp.path(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!report.icc);
        assert_eq!(report.property_count, 0);

        let doc = tokio::fs::read_to_string(tmp.path().join("slide_metadata.json"))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["base_name"], "slide");
        assert!(parsed["properties"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_pass_skips_remaining_probes() {
        let tmp = TempDir::new().unwrap();
        let extractor = absent_tool_extractor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = extractor
            .extract_all(&tmp.path().join("slide.svs"), "slide", tmp.path(), &cancel)
            .await
            .unwrap();
        assert!(!report.icc);
        // The metadata document is not written for a cancelled job.
        assert!(
            !tokio::fs::try_exists(tmp.path().join("slide_metadata.json"))
                .await
                .unwrap()
        );
    }
}
