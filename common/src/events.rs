use serde::{Deserialize, Serialize};

use crate::types::JobPhase;

/// Lifecycle events published for every slide as it moves through the
/// system. Serialized as JSON with a `type` tag so transport adapters can
/// forward them to subscribers verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlideEvent {
    /// A new source file passed the stability gate.
    FileDetected { base_name: String },
    /// A job was accepted into the pending queue.
    Queued { base_name: String },
    /// A job left the queue and entered its first phase.
    Started { base_name: String },
    Progress {
        base_name: String,
        phase: JobPhase,
        percent: u8,
    },
    Complete { base_name: String },
    Cancelled { base_name: String },
    Failed { base_name: String, error: String },
    Retry {
        base_name: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// The slide (source and artifacts) was removed by user action.
    Deleted { base_name: String },
    /// The source file was removed after a successful conversion.
    AutoDelete { base_name: String },
    /// A job was rebuilt from filesystem state after a restart.
    Restored { base_name: String },
}

impl SlideEvent {
    pub fn base_name(&self) -> &str {
        match self {
            SlideEvent::FileDetected { base_name }
            | SlideEvent::Queued { base_name }
            | SlideEvent::Started { base_name }
            | SlideEvent::Progress { base_name, .. }
            | SlideEvent::Complete { base_name }
            | SlideEvent::Cancelled { base_name }
            | SlideEvent::Failed { base_name, .. }
            | SlideEvent::Retry { base_name, .. }
            | SlideEvent::Deleted { base_name }
            | SlideEvent::AutoDelete { base_name }
            | SlideEvent::Restored { base_name } => base_name,
        }
    }

    /// True for `complete`, `cancelled` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlideEvent::Complete { .. }
                | SlideEvent::Cancelled { .. }
                | SlideEvent::Failed { .. }
        )
    }
}
