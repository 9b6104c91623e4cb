//! Outbound message assembly and alias resolution.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::MessageConfig;
use crate::error::EventError;
use crate::event::{FileEvent, Metadata};

/// The message handed to the publisher adapter.
///
/// Serializes with the descriptive fields inside `data`; metadata carrying
/// the nested shape contributes its siblings as additional top-level fields.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub subject: String,
    #[serde(rename = "type")]
    pub atype: String,
    pub data: Metadata,
    #[serde(flatten)]
    pub extra: Metadata,
}

/// Assemble the outbound message for one event.
///
/// The data fields are, in override order: the static fields from the
/// message configuration, the event's metadata, and finally the locator
/// truth (`uid`, `uri`, plus `filesystem` and `path` when the event carries
/// a descriptor). The locator fields always win so the published access
/// coordinates can never be spoofed by metadata.
pub fn assemble(event: &FileEvent, config: &MessageConfig) -> Result<OutboundMessage, EventError> {
    let mut data = config.data.clone();
    let mut extra = Metadata::new();

    if let Some(Value::Object(payload)) = event.metadata.get("data") {
        for (field, value) in payload {
            data.insert(field.clone(), value.clone());
        }
        for (field, value) in &event.metadata {
            if field == "data" || field == "subject" || field == "type" {
                continue;
            }
            extra.insert(field.clone(), value.clone());
        }
    } else {
        for (field, value) in &event.metadata {
            data.insert(field.clone(), value.clone());
        }
    }

    data.insert("uid".into(), Value::String(event.uid()));
    data.insert("uri".into(), Value::String(event.locator.uri()));
    if let Some(descriptor) = event.locator.filesystem() {
        let serialized = serde_json::to_value(descriptor)
            .map_err(|e| EventError::Assemble(format!("filesystem descriptor: {e}")))?;
        data.insert("filesystem".into(), serialized);
        data.insert("path".into(), Value::String(event.locator.path().to_string()));
    }

    Ok(OutboundMessage {
        message_id: Uuid::new_v4(),
        subject: config.subject.clone(),
        atype: config.atype.clone(),
        data,
        extra,
    })
}

/// Substitute configured aliases into metadata fields, exact match only.
/// Fields without an alias map, and values without an entry, pass unchanged.
pub fn apply_aliases(metadata: &mut Metadata, aliases: &HashMap<String, HashMap<String, String>>) {
    for (field, substitutions) in aliases {
        let replacement = match metadata.get(field.as_str()) {
            Some(Value::String(current)) => substitutions.get(current).cloned(),
            _ => None,
        };
        if let Some(replacement) = replacement {
            metadata.insert(field.clone(), Value::String(replacement));
        }
    }
}

/// Apply aliases to an event's metadata, covering both the flat shape and
/// the nested shape's `data` payload. Runs once, directly after detection,
/// so every downstream consumer sees resolved values.
pub fn apply_event_aliases(
    event: &mut FileEvent,
    aliases: &HashMap<String, HashMap<String, String>>,
) {
    apply_aliases(&mut event.metadata, aliases);
    if let Some(Value::Object(payload)) = event.metadata.get_mut("data") {
        apply_aliases(payload, aliases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{FsDescriptor, ResourceLocator};
    use serde_json::json;

    fn message_config() -> MessageConfig {
        MessageConfig {
            subject: "/segment/viirs/l1b/".into(),
            atype: "file".into(),
            data: json!({"sensor": "viirs"}).as_object().unwrap().clone(),
            aliases: HashMap::new(),
        }
    }

    fn aliases() -> HashMap<String, HashMap<String, String>> {
        HashMap::from([(
            "platform_name".to_string(),
            HashMap::from([("npp".to_string(), "Suomi-NPP".to_string())]),
        )])
    }

    #[test]
    fn known_alias_is_substituted_unknown_passes_through() {
        let mut metadata = json!({"platform_name": "npp"}).as_object().unwrap().clone();
        apply_aliases(&mut metadata, &aliases());
        assert_eq!(metadata["platform_name"], json!("Suomi-NPP"));

        let mut metadata = json!({"platform_name": "noaa21"}).as_object().unwrap().clone();
        apply_aliases(&mut metadata, &aliases());
        assert_eq!(metadata["platform_name"], json!("noaa21"));
    }

    #[test]
    fn aliasing_twice_equals_aliasing_once() {
        let mut once = json!({"platform_name": "npp"}).as_object().unwrap().clone();
        apply_aliases(&mut once, &aliases());
        let mut twice = once.clone();
        apply_aliases(&mut twice, &aliases());
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_payload_is_aliased_too() {
        let metadata = json!({"data": {"platform_name": "npp"}})
            .as_object()
            .unwrap()
            .clone();
        let mut event = FileEvent::new(ResourceLocator::local("/data/a.h5"), metadata);
        apply_event_aliases(&mut event, &aliases());
        assert_eq!(event.metadata["data"]["platform_name"], json!("Suomi-NPP"));
    }

    #[test]
    fn flat_metadata_lands_in_message_data() {
        let metadata = json!({"platform_name": "Suomi-NPP"})
            .as_object()
            .unwrap()
            .clone();
        let event = FileEvent::new(ResourceLocator::local("/data/granule.h5"), metadata);

        let message = assemble(&event, &message_config()).unwrap();
        assert_eq!(message.subject, "/segment/viirs/l1b/");
        assert_eq!(message.atype, "file");
        assert_eq!(message.data["sensor"], json!("viirs"));
        assert_eq!(message.data["platform_name"], json!("Suomi-NPP"));
        assert_eq!(message.data["uid"], json!("granule.h5"));
        assert_eq!(message.data["uri"], json!("/data/granule.h5"));
        assert!(!message.data.contains_key("filesystem"));
    }

    #[test]
    fn remote_event_publishes_descriptor_and_path() {
        let fs = FsDescriptor::checked(
            "s3",
            json!({"profile": "default"}).as_object().unwrap().clone(),
        )
        .unwrap();
        let event = FileEvent::new(
            ResourceLocator::remote(fs, "viirs-data/granule.h5"),
            Metadata::new(),
        );

        let message = assemble(&event, &message_config()).unwrap();
        assert_eq!(message.data["uri"], json!("s3://viirs-data/granule.h5"));
        assert_eq!(message.data["path"], json!("viirs-data/granule.h5"));
        assert_eq!(
            message.data["filesystem"],
            json!({"protocol": "s3", "profile": "default"})
        );
    }

    #[test]
    fn locator_truth_overrides_metadata() {
        let metadata = json!({"uri": "file:///spoofed", "uid": "spoofed"})
            .as_object()
            .unwrap()
            .clone();
        let event = FileEvent::new(ResourceLocator::local("/data/real.h5"), metadata);
        let message = assemble(&event, &message_config()).unwrap();
        assert_eq!(message.data["uri"], json!("/data/real.h5"));
        assert_eq!(message.data["uid"], json!("real.h5"));
    }

    #[test]
    fn nested_shape_splits_payload_from_siblings() {
        let metadata = json!({
            "dataset_name": "pass42",
            "data": {"platform_name": "Suomi-NPP"}
        })
        .as_object()
        .unwrap()
        .clone();
        let event = FileEvent::new(ResourceLocator::local("/data/granule.h5"), metadata);

        let message = assemble(&event, &message_config()).unwrap();
        assert_eq!(message.data["platform_name"], json!("Suomi-NPP"));
        assert_eq!(message.extra["dataset_name"], json!("pass42"));
        assert!(!message.data.contains_key("dataset_name"));

        let serialized = serde_json::to_value(&message).unwrap();
        assert_eq!(serialized["dataset_name"], json!("pass42"));
        assert_eq!(serialized["type"], json!("file"));
    }
}
