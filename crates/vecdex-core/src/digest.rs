//! Row digests and schema signatures: the two stable fingerprints the
//! partitioning engine de-duplicates and versions against.

use serde::Serialize;
use sha1::{Digest, Sha1};

/// `U+241F` SYMBOL FOR UNIT SEPARATOR — the join delimiter for row cells.
/// Chosen because it cannot occur in any CSV cell emitted by the reader.
pub const ROW_DELIMITER: char = '\u{241F}';

/// SHA-1 over the cells of a row, joined by [`ROW_DELIMITER`], with missing
/// cells serialised as the empty string. Returns a 40-character lowercase hex
/// string.
///
/// Callers are responsible for padding/stitching a row to the header width
/// before calling this — the digest itself has no notion of a header.
pub fn row_digest<'a, I, S>(cells: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str> + 'a,
{
    let mut joined = String::new();
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            joined.push(ROW_DELIMITER);
        }
        if let Some(value) = cell {
            joined.push_str(value.as_ref());
        }
    }
    hex_sha1(joined.as_bytes())
}

/// A single field in a record type's schema, as hashed into the schema
/// signature. Field order in the wire struct does not matter — signature
/// computation always sorts by `name` first.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// SHA-1 over the canonical JSON array of a record type's fields, sorted by
/// name. Two schemas with the same fields in a different declaration order
/// hash identically.
pub fn schema_signature(fields: &[SignatureField]) -> String {
    let mut sorted: Vec<&SignatureField> = fields.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    // serde_json::to_vec is deterministic for a Vec of structs with a fixed
    // field order, so this is reproducible across runs and platforms.
    let payload = serde_json::to_vec(&sorted).expect("signature fields are always serialisable");
    hex_sha1(&payload)
}

/// Document id (§3 Document): `<record_type>:<40-hex>`, where the hex part
/// is a SHA-1 over the canonical JSON of the record's full field map. A
/// `BTreeMap` is already canonical (keys sorted), so this is stable under
/// field reordering without any extra normalisation step.
pub fn document_id(record_type: &str, record: &std::collections::BTreeMap<String, Option<String>>) -> String {
    let payload = serde_json::to_vec(record).expect("record is always serialisable");
    format!("{record_type}:{}", hex_sha1(&payload))
}

fn hex_sha1(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let row: Vec<Option<&str>> = vec![Some("a"), Some("b"), None];
        assert_eq!(row_digest(row.clone()), row_digest(row));
    }

    #[test]
    fn digest_distinguishes_missing_from_empty_string() {
        // Both serialise identically by design: nil and "" are the same cell.
        let with_nil: Vec<Option<&str>> = vec![Some("a"), None];
        let with_empty: Vec<Option<&str>> = vec![Some("a"), Some("")];
        assert_eq!(row_digest(with_nil), row_digest(with_empty));
    }

    #[test]
    fn digest_is_sensitive_to_cell_order() {
        let row_a: Vec<Option<&str>> = vec![Some("a"), Some("b")];
        let row_b: Vec<Option<&str>> = vec![Some("b"), Some("a")];
        assert_ne!(row_digest(row_a), row_digest(row_b));
    }

    #[test]
    fn digest_is_forty_hex_chars() {
        let row: Vec<Option<&str>> = vec![Some("x")];
        let d = row_digest(row);
        assert_eq!(d.len(), 40);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn field(name: &str) -> SignatureField {
        SignatureField {
            name: name.to_string(),
            type_name: "string".to_string(),
            alias: None,
            required: None,
            default: None,
        }
    }

    #[test]
    fn schema_signature_is_order_independent() {
        let a = vec![field("id"), field("name")];
        let b = vec![field("name"), field("id")];
        assert_eq!(schema_signature(&a), schema_signature(&b));
    }

    #[test]
    fn schema_signature_changes_with_field_set() {
        let a = vec![field("id")];
        let b = vec![field("id"), field("name")];
        assert_ne!(schema_signature(&a), schema_signature(&b));
    }

    #[test]
    fn document_id_is_stable_under_field_reordering() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("id".to_string(), Some("1".to_string()));
        a.insert("name".to_string(), Some("alice".to_string()));
        let mut b = std::collections::BTreeMap::new();
        b.insert("name".to_string(), Some("alice".to_string()));
        b.insert("id".to_string(), Some("1".to_string()));
        assert_eq!(document_id("Table", &a), document_id("Table", &b));
    }

    #[test]
    fn document_id_is_prefixed_by_record_type() {
        let record = std::collections::BTreeMap::new();
        assert!(document_id("Table", &record).starts_with("Table:"));
    }
}
