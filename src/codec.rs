//! Encoding of a config snapshot into a rollout annotation.

use thiserror::Error;

use crate::models::DeploymentConfig;

#[derive(Debug, Error)]
#[error("config codec: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// Turns a config into an annotation string and back.
pub trait ConfigCodec: Send + Sync {
    fn encode(&self, config: &DeploymentConfig) -> Result<String, CodecError>;
    fn decode(&self, data: &str) -> Result<DeploymentConfig, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ConfigCodec for JsonCodec {
    fn encode(&self, config: &DeploymentConfig) -> Result<String, CodecError> {
        Ok(serde_json::to_string(config)?)
    }

    fn decode(&self, data: &str) -> Result<DeploymentConfig, CodecError> {
        Ok(serde_json::from_str(data)?)
    }
}
