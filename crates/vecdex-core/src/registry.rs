//! The record-type registry: an external collaborator (§6) consumed through
//! this trait rather than embedded in run configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::SignatureField;

/// One field of a record type's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl FieldSpec {
    fn as_signature_field(&self) -> SignatureField {
        SignatureField {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            alias: self.alias.clone(),
            required: self.required,
            default: self.default.clone(),
        }
    }
}

/// The ordered field set of one record type, keyed by field name for
/// validation lookups.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordTypeSchema {
    pub fields: Vec<FieldSpec>,
}

impl RecordTypeSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Signature fields in the shape [`crate::digest::schema_signature`]
    /// expects. Sorting happens inside that call, not here.
    pub fn signature_fields(&self) -> Vec<SignatureField> {
        self.fields.iter().map(FieldSpec::as_signature_field).collect()
    }
}

/// A materialised record: field name → raw string value, as produced by the
/// CSV reader after stitching and column projection.
pub type Record = BTreeMap<String, Option<String>>;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record type '{record_type}' missing required field '{field}'")]
    MissingRequiredField { record_type: String, field: String },
    #[error("record type '{record_type}' field '{field}' failed validation: {reason}")]
    FieldInvalid {
        record_type: String,
        field: String,
        reason: String,
    },
}

/// One entry in the registry: the schema plus the semantic/keyword field
/// lists the document builder (§3 Document) consults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub schema: RecordTypeSchema,
    /// Ordered; at least one semantic field is allowed to be empty per row.
    #[serde(default)]
    pub semantic_fields: Vec<String>,
    #[serde(default)]
    pub keyword_fields: Vec<String>,
}

impl RecordType {
    pub fn validate(&self, record: &Record) -> Result<(), ValidationError> {
        for field in &self.schema.fields {
            let required = field.required.unwrap_or(false);
            if !required {
                continue;
            }
            match record.get(&field.name) {
                Some(Some(value)) if !value.is_empty() => {}
                Some(Some(_)) | Some(None) | None => {
                    return Err(ValidationError::MissingRequiredField {
                        record_type: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The registry interface (§6): a mapping from logical record-type name to
/// its schema plus semantic/keyword field lists. Implementations may back
/// this with a JSON/YAML file (see `JsonRegistry`) or a longer-lived
/// external service.
pub trait Registry: Send + Sync {
    fn record_type(&self, name: &str) -> Option<&RecordType>;
    fn record_type_names(&self) -> Vec<&str>;
}

/// A registry loaded once from a JSON document on disk: `{name: RecordType}`.
/// Mirrors the original system's model-registry loader.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonRegistry {
    record_types: BTreeMap<String, RecordType>,
}

impl JsonRegistry {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let record_types: BTreeMap<String, RecordType> = serde_json::from_str(data)?;
        Ok(Self { record_types })
    }

    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        let record_types: BTreeMap<String, RecordType> = serde_yaml::from_str(data)?;
        Ok(Self { record_types })
    }
}

impl Registry for JsonRegistry {
    fn record_type(&self, name: &str) -> Option<&RecordType> {
        self.record_types.get(name)
    }

    fn record_type_names(&self) -> Vec<&str> {
        self.record_types.keys().map(String::as_str).collect()
    }
}
