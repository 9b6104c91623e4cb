//! The pipeline's unit of work: one detected resource plus its metadata.

use regex::Regex;
use serde_json::{Map, Value};

use crate::locator::ResourceLocator;

/// Descriptive attributes of a resource: identifier, timestamps,
/// platform/sensor/product descriptors, geometry, checksum, and so on.
///
/// Two shapes are supported by convention: a flat map (all fields become
/// message data fields) and a nested map with a distinguished `data` key
/// (siblings become top-level message fields, everything under `data`
/// becomes payload fields).
pub type Metadata = Map<String, Value>;

/// One detected resource flowing through the pipeline.
///
/// Created by a backend source at detection time. A fetch transform replaces
/// it with a new event pointing at the local copy; an unpack transform fans
/// it into child events, one per container member.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEvent {
    pub locator: ResourceLocator,
    pub metadata: Metadata,
    uid: Option<String>,
}

impl FileEvent {
    pub fn new(locator: ResourceLocator, metadata: Metadata) -> Self {
        Self {
            locator,
            metadata,
            uid: None,
        }
    }

    /// Override the default identifier (used by unpack to qualify member
    /// identifiers with the containing event's identifier).
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// The event identifier: explicit override if set, otherwise the
    /// locator's basename.
    pub fn uid(&self) -> String {
        match &self.uid {
            Some(uid) => uid.clone(),
            None => self.locator.basename().to_string(),
        }
    }
}

/// Match a resource name against the configured file pattern, extracting
/// named capture groups as metadata fields.
///
/// Returns `None` when the name does not match; sources skip such resources
/// entirely.
pub fn metadata_from_pattern(pattern: &Regex, name: &str) -> Option<Metadata> {
    let captures = pattern.captures(name)?;
    let mut metadata = Metadata::new();
    for group in pattern.capture_names().flatten() {
        if let Some(matched) = captures.name(group) {
            metadata.insert(group.to_string(), Value::String(matched.as_str().to_string()));
        }
    }
    Some(metadata)
}
