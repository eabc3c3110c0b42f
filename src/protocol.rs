//! Messages exchanged between the coordinator and the cluster worker.
//!
//! The JSON shape matches what the wallpaper's JS host posts to and receives
//! from its worker: an `action` tag plus camelCase fields.

use serde::{Deserialize, Serialize};

use crate::buffer::{PixelBuffer, validate_dimensions};
use crate::cancel::CancellationToken;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::kmeans::Centroid;

/// `executionTime` reported for a run cancelled on the coordinator side.
pub const CANCELLED_EXECUTION_TIME: f64 = -1.0;

#[derive(Debug, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum WorkerMessage {
    /// Caller → worker. Moves `data_buffer` to the worker.
    Run {
        data_buffer: PixelBuffer,
        data_width: u32,
        data_height: u32,
        k: usize,
        iterations: u32,
        /// Shared with the issuer; never serialized. A deserialized `run`
        /// gets a fresh token.
        #[serde(skip)]
        token: CancellationToken,
    },

    /// Caller → worker.
    Cancel,

    /// Worker → caller. Moves `data_buffer` back.
    WorkerResult {
        result: Option<Vec<Centroid>>,
        execution_time: f64,
        data_buffer: PixelBuffer,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkerMessage {
    pub fn action(&self) -> &'static str {
        match self {
            WorkerMessage::Run { .. } => "run",
            WorkerMessage::Cancel => "cancel",
            WorkerMessage::WorkerResult { .. } => "worker-result",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A clustering job. Owns its pixels until submitted.
#[derive(Debug)]
pub struct ClusterRequest {
    pub buffer: PixelBuffer,
    pub width: u32,
    pub height: u32,
    pub k: usize,
    pub iterations: u32,
}

impl ClusterRequest {
    pub fn new(buffer: PixelBuffer, width: u32, height: u32, config: &ClusterConfig) -> Self {
        Self {
            buffer,
            width,
            height,
            k: config.k,
            iterations: config.iterations,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(ClusterError::InvalidK(self.k));
        }
        validate_dimensions(self.buffer.len(), self.width, self.height)?;
        Ok(())
    }

    pub(crate) fn into_message(self, token: CancellationToken) -> WorkerMessage {
        WorkerMessage::Run {
            data_buffer: self.buffer,
            data_width: self.width,
            data_height: self.height,
            k: self.k,
            iterations: self.iterations,
            token,
        }
    }
}

/// Outcome of one run as seen by the caller.
#[derive(Debug)]
pub struct ClusterResult {
    /// Sorted centroids, or `None` if the run was cancelled or failed.
    pub clusters: Option<Vec<Centroid>>,
    /// Wall time of the algorithm, or [`CANCELLED_EXECUTION_TIME`].
    pub execution_time_ms: f64,
    /// The request's pixels. `None` on the immediate cancellation result;
    /// the worker returns the buffer later.
    pub buffer: Option<PixelBuffer>,
    /// Worker-side failure, if any.
    pub error: Option<String>,
}

impl ClusterResult {
    pub(crate) fn cancelled() -> Self {
        Self {
            clusters: None,
            execution_time_ms: CANCELLED_EXECUTION_TIME,
            buffer: None,
            error: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.clusters.is_none() && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_message_uses_host_field_names() {
        let request = ClusterRequest::new(
            PixelBuffer::new(vec![1, 2, 3, 4]),
            1,
            1,
            &ClusterConfig::new(3).with_iterations(7),
        );
        let json = request.into_message(CancellationToken::new()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "run");
        assert_eq!(value["dataBuffer"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(value["dataWidth"], 1);
        assert_eq!(value["dataHeight"], 1);
        assert_eq!(value["k"], 3);
        assert_eq!(value["iterations"], 7);
        assert!(value.get("token").is_none());
    }

    #[test]
    fn cancel_message_has_no_payload() {
        assert_eq!(WorkerMessage::Cancel.to_json().unwrap(), r#"{"action":"cancel"}"#);
    }

    #[test]
    fn cancelled_worker_result_serializes_null() {
        let msg = WorkerMessage::WorkerResult {
            result: None,
            execution_time: CANCELLED_EXECUTION_TIME,
            data_buffer: PixelBuffer::new(vec![]),
            error: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["action"], "worker-result");
        assert!(value["result"].is_null());
        assert_eq!(value["executionTime"], -1.0);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn parses_worker_result_from_host_json() {
        let json = r#"{
            "action": "worker-result",
            "result": [{"count": 2, "value": [1, 2, 3, 255]}],
            "executionTime": 1.5,
            "dataBuffer": [1, 2, 3, 255, 1, 2, 3, 255]
        }"#;
        match WorkerMessage::from_json(json).unwrap() {
            WorkerMessage::WorkerResult {
                result,
                execution_time,
                data_buffer,
                error,
            } => {
                assert_eq!(
                    result,
                    Some(vec![Centroid { count: 2, value: [1, 2, 3, 255] }])
                );
                assert_eq!(execution_time, 1.5);
                assert_eq!(data_buffer.len(), 8);
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {}", other.action()),
        }
    }

    #[test]
    fn rejects_unknown_action() {
        let err = WorkerMessage::from_json(r#"{"action":"pause"}"#).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidMessage(_)));
    }

    #[test]
    fn request_validation() {
        let ok = ClusterRequest::new(PixelBuffer::new(vec![0; 8]), 2, 1, &ClusterConfig::new(1));
        assert!(ok.validate().is_ok());

        let zero_k = ClusterRequest::new(PixelBuffer::new(vec![0; 8]), 2, 1, &ClusterConfig::new(0));
        assert!(matches!(zero_k.validate(), Err(ClusterError::InvalidK(0))));

        let short = ClusterRequest::new(PixelBuffer::new(vec![0; 4]), 2, 1, &ClusterConfig::new(1));
        assert!(matches!(
            short.validate(),
            Err(ClusterError::DimensionMismatch { .. })
        ));
    }
}
