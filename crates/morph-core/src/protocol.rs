//! Messages exchanged between a build initiator and a controller.
//!
//! The initiator submits a build request and either stays connected
//! to stream status and log events, or detaches and queries the build
//! id later. Messages are tagged JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol revision; bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lifecycle of a build request on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Resolving,
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Resolving => "RESOLVING",
            Self::Building => "BUILDING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RESOLVING" => Some(Self::Resolving),
            "BUILDING" => Some(Self::Building),
            "COMPLETE" => Some(Self::Complete),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// True once the controller will emit no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// A request to build one morphology at a pinned commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub protocol_version: u32,
    /// Repository holding the definitions, as the user wrote it.
    pub repo: String,
    /// Resolved commit to build from.
    pub commit: String,
    /// Morphology filename within the repository.
    pub morphology: String,
    /// The symbolic ref the commit came from, for cache keying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_ref: Option<String>,
    /// Restrict the build to these components of the target system.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_names: Vec<String>,
}

/// One build request as the controller's ledger records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: String,
    pub repo: String,
    pub commit: String,
    pub morphology: String,
    pub original_ref: Option<String>,
    pub component_names: Vec<String>,
    pub status: BuildStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the initiator and controller say to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    BuildRequest(BuildRequest),
    BuildStarted {
        id: String,
    },
    StatusEvent {
        id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    LogChunk {
        id: String,
        artifact: String,
        chunk: String,
    },
    BuildComplete {
        id: String,
    },
    BuildFailed {
        id: String,
        reason: String,
    },
    CancelRequest {
        id: String,
    },
}

impl Message {
    /// The build id a message refers to, if any.
    pub fn build_id(&self) -> Option<&str> {
        match self {
            Self::BuildRequest(_) => None,
            Self::BuildStarted { id }
            | Self::StatusEvent { id, .. }
            | Self::LogChunk { id, .. }
            | Self::BuildComplete { id }
            | Self::BuildFailed { id, .. }
            | Self::CancelRequest { id } => Some(id),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_round_trips() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Resolving,
            BuildStatus::Building,
            BuildStatus::Complete,
            BuildStatus::Failed,
            BuildStatus::Cancelled,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Complete.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
    }

    #[test]
    fn messages_tag_on_type() {
        let message = Message::BuildRequest(BuildRequest {
            protocol_version: PROTOCOL_VERSION,
            repo: "baserock:baserock/definitions".to_string(),
            commit: "a".repeat(40),
            morphology: "systems/devel-system-x86_64.morph".to_string(),
            original_ref: Some("master".to_string()),
            component_names: Vec::new(),
        });
        let json: serde_json::Value =
            serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "build-request");
        assert_eq!(json["repo"], "baserock:baserock/definitions");
        // Empty component lists stay off the wire.
        assert!(json.get("component_names").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Message::BuildRequest(_)));
    }

    #[test]
    fn log_chunks_carry_build_id() {
        let message = Message::LogChunk {
            id: "build-17".to_string(),
            artifact: "busybox".to_string(),
            chunk: "make[1]: Entering directory".to_string(),
        };
        assert_eq!(message.build_id(), Some("build-17"));

        let json: serde_json::Value =
            serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "log-chunk");
        assert_eq!(json["artifact"], "busybox");
    }

    #[test]
    fn build_failed_round_trips() {
        let message = Message::BuildFailed {
            id: "b1".to_string(),
            reason: "configure exited with status 1".to_string(),
        };
        let text = message.to_json().unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        match back {
            Message::BuildFailed { id, reason } => {
                assert_eq!(id, "b1");
                assert!(reason.contains("configure"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
