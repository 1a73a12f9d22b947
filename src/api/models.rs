//! API request and response models

use crate::session::{ModelMetadata, TensorInfo};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Declared tensor of the model signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorSignature {
    pub name: String,
    /// Wire data type tag (0 for runtime-only types)
    pub data_type: i32,
    /// Negative entries are symbolic
    pub dims: Vec<i64>,
}

impl From<&TensorInfo> for TensorSignature {
    fn from(info: &TensorInfo) -> Self {
        Self {
            name: info.name.clone(),
            data_type: info.element_type.to_wire(),
            dims: info.dims.clone(),
        }
    }
}

/// Model signature response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadataResponse {
    pub model_name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub version: String,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

impl ModelMetadataResponse {
    pub fn new(metadata: &ModelMetadata, version: String) -> Self {
        Self {
            model_name: metadata.name.clone(),
            version,
            inputs: metadata.inputs.iter().map(TensorSignature::from).collect(),
            outputs: metadata.outputs.iter().map(TensorSignature::from).collect(),
        }
    }
}
