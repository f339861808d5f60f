//! Image stream tag resolution.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::Lister;
use crate::error::StoreError;
use crate::models::{DeploymentConfig, ImageStream, Object, Selector};
use crate::storage::ObjectClient;

#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Latest image recorded for `stream:tag`. `Ok(None)` when the stream
    /// exists but the tag has no image; `NotFound` when the stream is missing.
    async fn resolve(&self, namespace: &str, stream: &str, tag: &str)
        -> Result<Option<String>, StoreError>;
}

/// Resolves against stored image streams.
pub struct StreamResolver {
    streams: Arc<dyn ObjectClient<ImageStream>>,
}

impl StreamResolver {
    pub fn new(streams: Arc<dyn ObjectClient<ImageStream>>) -> Self {
        Self { streams }
    }
}

#[async_trait]
impl ImageResolver for StreamResolver {
    async fn resolve(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<Option<String>, StoreError> {
        let stream = self.streams.get(namespace, stream).await?;
        Ok(stream.latest_tagged_image(tag).map(str::to_string))
    }
}

/// Configs with an image change trigger pointing at `stream`.
pub fn configs_for_image_stream(
    configs: &dyn Lister<DeploymentConfig>,
    stream: &ImageStream,
) -> Vec<DeploymentConfig> {
    configs
        .list(None, &Selector::new())
        .into_iter()
        .filter(|config| {
            config.image_change_params().any(|params| {
                let stream_name = params
                    .from
                    .name
                    .rsplit_once(':')
                    .map_or(params.from.name.as_str(), |(name, _)| name);
                params.from.namespace_or(config.namespace()) == stream.namespace()
                    && stream_name == stream.name()
            })
        })
        .collect()
}
