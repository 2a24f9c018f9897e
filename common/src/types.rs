use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Slide container formats the pipeline accepts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlideFormat {
    Svs,
    Ndpi,
    Tiff,
    Jp2,
    Vms,
    Vmu,
    Scn,
}

/// Extensions considered slide sources, lowercase.
pub const SLIDE_EXTENSIONS: &[&str] = &["svs", "ndpi", "tif", "tiff", "jp2", "vms", "vmu", "scn"];

impl SlideFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "svs" => Some(SlideFormat::Svs),
            "ndpi" => Some(SlideFormat::Ndpi),
            "tif" | "tiff" => Some(SlideFormat::Tiff),
            "jp2" => Some(SlideFormat::Jp2),
            "vms" => Some(SlideFormat::Vms),
            "vmu" => Some(SlideFormat::Vmu),
            "scn" => Some(SlideFormat::Scn),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            SlideFormat::Svs => "svs",
            SlideFormat::Ndpi => "ndpi",
            SlideFormat::Tiff => "tiff",
            SlideFormat::Jp2 => "jp2",
            SlideFormat::Vms => "vms",
            SlideFormat::Vmu => "vmu",
            SlideFormat::Scn => "scn",
        }
    }
}

impl FromStr for SlideFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| anyhow::anyhow!("unknown slide format: {}", s))
    }
}

impl fmt::Display for SlideFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// A slide's identity: its filename minus the extension.
///
/// Returns `None` when the path has no supported slide extension, so callers
/// can use this both to derive the name and to filter candidates.
pub fn base_name(path: &Path) -> Option<String> {
    SlideFormat::from_path(path)?;
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Initial,
    Reconversion,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Initial => f.write_str("initial"),
            JobKind::Reconversion => f.write_str("reconversion"),
        }
    }
}

/// Phases a conversion job moves through.
///
/// `Complete`, `Cancelled` and `Failed` are terminal; a base name may have at
/// most one job in a non-terminal phase at any time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Icc,
    Dzi,
    Metadata,
    Promoting,
    Complete,
    Cancelled,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Complete | JobPhase::Cancelled | JobPhase::Failed
        )
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::Icc => "icc",
            JobPhase::Dzi => "dzi",
            JobPhase::Metadata => "metadata",
            JobPhase::Promoting => "promoting",
            JobPhase::Complete => "complete",
            JobPhase::Cancelled => "cancelled",
            JobPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SlideFormat::from_extension("SVS"), Some(SlideFormat::Svs));
        assert_eq!(SlideFormat::from_extension("tif"), Some(SlideFormat::Tiff));
        assert_eq!(SlideFormat::from_extension("tiff"), Some(SlideFormat::Tiff));
        assert_eq!(SlideFormat::from_extension("png"), None);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(
            base_name(&PathBuf::from("/slides/slide_A.svs")),
            Some("slide_A".to_string())
        );
        assert_eq!(base_name(&PathBuf::from("/slides/notes.txt")), None);
        assert_eq!(base_name(&PathBuf::from("/slides/noext")), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(JobPhase::Complete.is_terminal());
        assert!(JobPhase::Cancelled.is_terminal());
        assert!(JobPhase::Failed.is_terminal());
        assert!(!JobPhase::Queued.is_terminal());
        assert!(!JobPhase::Promoting.is_terminal());
    }
}
