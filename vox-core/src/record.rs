//! Outbound status record, one per closed session.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::labels::{Command, Label};

/// Serialized as `{"status": ..., "info": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "info")]
pub enum ClassificationResult {
    #[serde(rename = "SUCCESS")]
    Success { command: Command, result: Label },
    #[serde(rename = "DEBUG", rename_all = "camelCase")]
    Debug {
        receive_time: u64,
        inference_time: u64,
        send_time: u64,
    },
    #[serde(rename = "FAILED")]
    Failed(FailureReason),
}

impl ClassificationResult {
    /// Debug timing record; `inference_time = send - receive`, all in epoch milliseconds.
    pub fn debug(received_at: SystemTime, sent_at: SystemTime) -> Self {
        let receive_time = epoch_millis(received_at);
        let send_time = epoch_millis(sent_at);
        ClassificationResult::Debug {
            receive_time,
            inference_time: send_time.saturating_sub(receive_time),
            send_time,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ClassificationResult::Success { .. } => "SUCCESS",
            ClassificationResult::Debug { .. } => "DEBUG",
            ClassificationResult::Failed(_) => "FAILED",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why a session produced no classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Deadline passed with a single fragment.
    Incomplete,
    /// First fragment carried no samples.
    MissingCommand,
    /// Command code outside the table.
    UnknownCommand(i16),
    /// Feature extraction or the hardware transaction failed.
    Inference,
    /// The hardware did not complete in time.
    InferenceTimeout,
}

impl FailureReason {
    pub fn message(&self) -> &'static str {
        match self {
            FailureReason::Incomplete => "Did not receive all packets!",
            FailureReason::MissingCommand => "Missing command code!",
            FailureReason::UnknownCommand(_) => "Unknown command code!",
            FailureReason::Inference => "Inference failed!",
            FailureReason::InferenceTimeout => "Inference timed out!",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl Serialize for FailureReason {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.message())
    }
}

/// Milliseconds since the Unix epoch (0 for times before it).
pub fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
