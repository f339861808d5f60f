use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::Object;

/// Image metadata: a named stream of tags, each with a history of the
/// concrete images it pointed at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ImageStreamStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageStreamStatus {
    pub docker_image_repository: String,
    pub tags: Vec<NamedTagEventList>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamedTagEventList {
    pub tag: String,
    /// Newest first.
    pub items: Vec<TagEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagEvent {
    pub created: Option<DateTime<Utc>>,
    pub docker_image_reference: String,
    pub image: String,
}

impl ImageStream {
    /// Latest concrete image reference recorded for `tag`.
    pub fn latest_tagged_image(&self, tag: &str) -> Option<&str> {
        self.status
            .tags
            .iter()
            .find(|history| history.tag == tag)
            .and_then(|history| history.items.first())
            .map(|event| event.docker_image_reference.as_str())
            .filter(|reference| !reference.is_empty())
    }

    /// Records a new image for `tag`, making it the latest.
    pub fn push_tag(&mut self, tag: &str, reference: &str, image: &str) {
        let event = TagEvent {
            created: Some(Utc::now()),
            docker_image_reference: reference.to_string(),
            image: image.to_string(),
        };
        match self.status.tags.iter_mut().find(|history| history.tag == tag) {
            Some(history) => history.items.insert(0, event),
            None => self.status.tags.push(NamedTagEventList {
                tag: tag.to_string(),
                items: vec![event],
            }),
        }
    }
}

/// Splits `stream:tag`. Returns `None` when there is no tag separator.
pub fn split_image_stream_tag(name: &str) -> Option<(&str, &str)> {
    let (stream, tag) = name.rsplit_once(':')?;
    if stream.is_empty() || tag.is_empty() {
        return None;
    }
    Some((stream, tag))
}

impl Object for ImageStream {
    const KIND: &'static str = "ImageStream";
    const TABLE: &'static str = "image_streams";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
