//! Analysis parameters
//!
//! Three numeric knobs forwarded verbatim to the analysis program.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tuning knobs for one analysis run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParameters {
    /// Overlap-suppression (NMS IoU) threshold, 0.0 - 1.0 (default: 0.1)
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f64,

    /// Detection confidence threshold, 0.0 - 1.0 (default: 0.2)
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    /// Inference batch size, 1 - 128 (default: 32)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_nms_iou() -> f64 {
    0.1
}

fn default_confidence() -> f64 {
    0.2
}

fn default_batch_size() -> u32 {
    32
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            nms_iou: default_nms_iou(),
            confidence: default_confidence(),
            batch_size: default_batch_size(),
        }
    }
}

impl AnalysisParameters {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.nms_iou) {
            return Err(Error::InvalidInput(
                "NMS IoU must be between 0 and 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidInput(
                "confidence must be between 0 and 1".to_string(),
            ));
        }
        if !(1..=128).contains(&self.batch_size) {
            return Err(Error::InvalidInput(
                "batch size must be between 1 and 128".to_string(),
            ));
        }
        Ok(())
    }

    /// Command-line flags understood by the analysis program
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--nms_iou".to_string(),
            self.nms_iou.to_string(),
            "--conf".to_string(),
            self.confidence.to_string(),
            "--batch_size".to_string(),
            self.batch_size.to_string(),
        ]
    }
}
