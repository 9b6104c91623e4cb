//! Resource locators: where a resource lives and how to reach it.
//!
//! A [`ResourceLocator`] is the (uri, filesystem descriptor, path) triple
//! flowing through the pipeline. The [`FsDescriptor`] is the declarative,
//! serializable description of a storage backend: protocol plus connection
//! parameters, excluding secrets. Credentials are referenced indirectly
//! (e.g. an aws profile name) and resolved by the backend SDK at access
//! time, never at serialization time.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;
use crate::secrets::{self, SecretClassifier};

/// Declarative description of a storage backend.
///
/// Serializes to the JSON form published in the `filesystem` message field,
/// e.g. `{"protocol": "s3", "bucket": "x", "profile": "default"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsDescriptor {
    protocol: String,
    #[serde(flatten)]
    storage_options: Map<String, Value>,
    #[serde(skip)]
    classifier: Option<SecretClassifier>,
}

// Identity is the declarative form; the classifier is a fn pointer and
// comparing those is not meaningful.
impl PartialEq for FsDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.storage_options == other.storage_options
    }
}

impl FsDescriptor {
    /// Build a descriptor, refusing any storage option classified as
    /// credential-bearing. A descriptor holding a plaintext secret must not
    /// be constructible at all, rather than caught later down the pipeline.
    pub fn checked(
        protocol: impl Into<String>,
        storage_options: Map<String, Value>,
    ) -> Result<Self, EventError> {
        let protocol = protocol.into();
        if let Some(field) = secrets::find_credential_field(&storage_options) {
            return Err(EventError::SecretLeak { protocol, field });
        }
        Ok(Self {
            protocol,
            storage_options,
            classifier: None,
        })
    }

    /// Attach a backend-specific secret classifier, consulted by the secret
    /// filter in addition to the fixed denylist.
    pub fn with_classifier(mut self, classifier: SecretClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn storage_options(&self) -> &Map<String, Value> {
        &self.storage_options
    }

    pub(crate) fn classifier(&self) -> Option<SecretClassifier> {
        self.classifier
    }
}

/// Opaque handle identifying where a resource lives.
///
/// The trivial case is a bare local path with no descriptor; remote
/// resources carry the descriptor of the filesystem they live on.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLocator {
    path: String,
    filesystem: Option<FsDescriptor>,
}

impl ResourceLocator {
    /// A bare local path, the trivial case. No descriptor is published.
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_string_lossy().into_owned(),
            filesystem: None,
        }
    }

    /// A resource on the filesystem described by `filesystem`.
    pub fn remote(filesystem: FsDescriptor, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filesystem: Some(filesystem),
        }
    }

    /// Locator addressing one member of an archive in-place, without
    /// extraction. The member is reachable through the archive format's
    /// protocol, chained onto the container's own location (`fo`); a remote
    /// container additionally contributes its connection parameters as
    /// `target_options`.
    pub fn archive_member(
        container: &ResourceLocator,
        format: &str,
        member_path: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut options = Map::new();
        options.insert("fo".into(), Value::String(container.uri()));
        options.insert(
            "target_protocol".into(),
            Value::String(container.protocol().unwrap_or("file").to_string()),
        );
        if let Some(fs) = container.filesystem() {
            if !fs.storage_options().is_empty() {
                options.insert(
                    "target_options".into(),
                    Value::Object(fs.storage_options().clone()),
                );
            }
        }
        let descriptor = FsDescriptor::checked(format, options)?;
        Ok(Self::remote(descriptor, member_path))
    }

    /// Path of the resource within its filesystem.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filesystem(&self) -> Option<&FsDescriptor> {
        self.filesystem.as_ref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.filesystem.as_ref().map(|fs| fs.protocol())
    }

    /// Render the access uri. Bare local paths render as-is; everything else
    /// as `protocol://path`. Connection parameters are never part of the uri.
    pub fn uri(&self) -> String {
        match &self.filesystem {
            Some(fs) => format!("{}://{}", fs.protocol(), self.path),
            None => self.path.clone(),
        }
    }

    /// Final path component, the default event identifier.
    pub fn basename(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn bare_local_locator_has_no_descriptor() {
        let locator = ResourceLocator::local("/data/file.h5");
        assert_eq!(locator.uri(), "/data/file.h5");
        assert_eq!(locator.basename(), "file.h5");
        assert!(locator.filesystem().is_none());
    }

    #[test]
    fn remote_locator_renders_protocol_uri() {
        let fs = FsDescriptor::checked("s3", options(json!({"profile": "default"}))).unwrap();
        let locator = ResourceLocator::remote(fs, "viirs-data/granule.h5");
        assert_eq!(locator.uri(), "s3://viirs-data/granule.h5");
        assert_eq!(locator.basename(), "granule.h5");
    }

    #[test]
    fn descriptor_with_inline_secret_is_not_constructible() {
        let err = FsDescriptor::checked("s3", options(json!({"secret_key": "AKIA..."})))
            .unwrap_err();
        match err {
            EventError::SecretLeak { protocol, field } => {
                assert_eq!(protocol, "s3");
                assert_eq!(field, "secret_key");
            }
            other => panic!("expected SecretLeak, got {other:?}"),
        }
    }

    #[test]
    fn descriptor_serializes_to_flat_declarative_form() {
        let fs = FsDescriptor::checked("ssh", options(json!({"host": "granule-host"}))).unwrap();
        let value = serde_json::to_value(&fs).unwrap();
        assert_eq!(value, json!({"protocol": "ssh", "host": "granule-host"}));
    }

    #[test]
    fn archive_member_locator_chains_onto_container() {
        let container = ResourceLocator::local("/data/archive.zip");
        let member = ResourceLocator::archive_member(&container, "zip", "a.h5").unwrap();
        assert_eq!(member.uri(), "zip://a.h5");
        let fs = member.filesystem().unwrap();
        assert_eq!(fs.storage_options()["fo"], json!("/data/archive.zip"));
        assert_eq!(fs.storage_options()["target_protocol"], json!("file"));
        assert!(!fs.storage_options().contains_key("target_options"));
    }

    #[test]
    fn remote_container_contributes_target_options() {
        let container_fs =
            FsDescriptor::checked("s3", options(json!({"profile": "default"}))).unwrap();
        let container = ResourceLocator::remote(container_fs, "viirs-data/archive.zip");
        let member = ResourceLocator::archive_member(&container, "zip", "a.h5").unwrap();
        let fs = member.filesystem().unwrap();
        assert_eq!(fs.storage_options()["fo"], json!("s3://viirs-data/archive.zip"));
        assert_eq!(fs.storage_options()["target_protocol"], json!("s3"));
        assert_eq!(
            fs.storage_options()["target_options"],
            json!({"profile": "default"})
        );
    }
}
