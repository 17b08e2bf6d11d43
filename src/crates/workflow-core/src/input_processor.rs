//! The input-processor contract: audio/video/telephony capture for
//! workflows that declare non-API input sources. The capture pipeline itself
//! lives outside this crate; the engine only needs its result shape.

use crate::error::Result;
use crate::request::RequestSnapshot;
use async_trait::async_trait;
use serde_json::Value;

/// What a capture pass hands back to populate the context's `InputTranscript`
/// and `InputMediaFile` artifacts.
#[derive(Clone, Debug, Default)]
pub struct InputArtifacts {
    pub transcript: Option<String>,
    pub media: Option<Value>,
}

#[async_trait]
pub trait InputProcessor: Send + Sync {
    async fn process(&self, request: Option<&RequestSnapshot>) -> Result<InputArtifacts>;
}
