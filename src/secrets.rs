//! Credential filtering for filesystem descriptors.
//!
//! The denylist of credential-bearing field names is explicit, named data so
//! that it can be reviewed and tested in one place. A backend may additionally
//! plug in its own [`SecretClassifier`] for fields the fixed list cannot know
//! about.
//!
//! Backends that need authentication to operate must exchange their
//! credentials for a derived, short-lived token *before* events reach this
//! filter; the filter does not perform any such exchange itself.

use serde_json::{Map, Value};

use crate::error::EventError;
use crate::locator::ResourceLocator;

/// Field names that always classify as credential-bearing, regardless of
/// backend. Matching is case-insensitive on the exact field name.
pub const CREDENTIAL_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "secret_key",
    "secret_access_key",
    "aws_secret_access_key",
    "access_key_secret",
    "api_key",
    "client_secret",
    "private_key",
    "private_key_pem",
    "bearer_token",
    "auth_token",
    "cookie",
    "session_cookie",
];

/// Backend-specific classifier: returns true when the named field holds
/// credential material. Consulted in addition to [`CREDENTIAL_FIELDS`].
pub type SecretClassifier = fn(field: &str, value: &Value) -> bool;

/// Scan a descriptor's declarative form for credential-bearing fields,
/// recursing into nested maps and arrays. Returns the first offending field
/// name, if any. Fields with empty or null values do not count as leaks.
pub fn find_credential_field(options: &Map<String, Value>) -> Option<String> {
    find_with_classifier(options, None)
}

/// Same as [`find_credential_field`], with an extra backend-specific
/// classifier consulted for every field.
pub fn find_with_classifier(
    options: &Map<String, Value>,
    classifier: Option<SecretClassifier>,
) -> Option<String> {
    for (field, value) in options {
        if non_empty(value) && is_credential_field(field) {
            return Some(field.clone());
        }
        if let Some(classify) = classifier {
            if non_empty(value) && classify(field, value) {
                return Some(field.clone());
            }
        }
        match value {
            Value::Object(nested) => {
                if let Some(found) = find_with_classifier(nested, classifier) {
                    return Some(found);
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(nested) = item {
                        if let Some(found) = find_with_classifier(nested, classifier) {
                            return Some(found);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate a locator right before it is allowed onto the wire.
///
/// Bare local locators carry no descriptor and always pass. Failure reports
/// the backend protocol and field name, never the value.
pub fn filter_locator(locator: &ResourceLocator) -> Result<(), EventError> {
    let Some(descriptor) = locator.filesystem() else {
        return Ok(());
    };
    if let Some(field) = find_with_classifier(descriptor.storage_options(), descriptor.classifier())
    {
        return Err(EventError::SecretLeak {
            protocol: descriptor.protocol().to_string(),
            field,
        });
    }
    Ok(())
}

fn is_credential_field(field: &str) -> bool {
    CREDENTIAL_FIELDS
        .iter()
        .any(|known| field.eq_ignore_ascii_case(known))
}

fn non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
