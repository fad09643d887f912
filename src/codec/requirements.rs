//! Codec metadata requirements.
//!
//! A codec that needs per-category metadata (e.g. a waveform codec that must
//! know sample width and channel count) declares a JSON-shaped schema with
//! exactly two operators:
//!
//! ```text
//! { "endianness":      ["set", ["big", "little"]],
//!   "bytes_per_sample": ["range", 1, 2] }
//! ```
//!
//! Requirements are checked against the per-fragment metadata *before*
//! compression; mismatches fail early with a diagnostic naming the field,
//! the offending value, and the allowed values.  Requirements may also
//! constrain `granularity`, the minimum atomic write size for the category
//! (16-bit stereo PCM has granularity 4).

use std::collections::BTreeMap;

use serde_json::Value;

use super::CodecError;

// ── Requirement ──────────────────────────────────────────────────────────────

/// One field constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    /// Value must be one of the listed alternatives.
    Set(Vec<Value>),
    /// Value must be an integer within `[min, max]`.
    Range { min: i64, max: i64 },
}

impl Requirement {
    fn parse(field: &str, v: &Value) -> Result<Self, CodecError> {
        let arr = v.as_array().ok_or_else(|| {
            CodecError::BadRequirements(format!("'{field}': expected array, got {v}"))
        })?;
        let op = arr.first().and_then(Value::as_str).ok_or_else(|| {
            CodecError::BadRequirements(format!("'{field}': missing operator"))
        })?;
        match op {
            "set" => {
                let values = arr.get(1).and_then(Value::as_array).ok_or_else(|| {
                    CodecError::BadRequirements(format!("'{field}': 'set' needs a value list"))
                })?;
                if values.is_empty() {
                    return Err(CodecError::BadRequirements(format!(
                        "'{field}': empty 'set'"
                    )));
                }
                Ok(Requirement::Set(values.clone()))
            }
            "range" => {
                let min = arr.get(1).and_then(Value::as_i64);
                let max = arr.get(2).and_then(Value::as_i64);
                match (min, max) {
                    (Some(min), Some(max)) if min <= max => Ok(Requirement::Range { min, max }),
                    _ => Err(CodecError::BadRequirements(format!(
                        "'{field}': 'range' needs min <= max integers"
                    ))),
                }
            }
            other => Err(CodecError::BadRequirements(format!(
                "'{field}': unknown operator '{other}'"
            ))),
        }
    }

    fn check(&self, field: &str, v: &Value) -> Result<(), CodecError> {
        match self {
            Requirement::Set(allowed) => {
                if allowed.contains(v) {
                    Ok(())
                } else {
                    let list: Vec<String> = allowed.iter().map(Value::to_string).collect();
                    Err(CodecError::MetadataMismatch(format!(
                        "{v} does not meet requirements [{}] for '{field}'",
                        list.join(", ")
                    )))
                }
            }
            Requirement::Range { min, max } => {
                let n = v.as_i64().ok_or_else(|| {
                    CodecError::MetadataMismatch(format!(
                        "'{field}': expected integer, got {v}"
                    ))
                })?;
                if n < *min || n > *max {
                    return Err(CodecError::MetadataMismatch(format!(
                        "{n} is out of range [{min}, {max}] for '{field}'"
                    )));
                }
                Ok(())
            }
        }
    }
}

// ── Requirements ─────────────────────────────────────────────────────────────

/// A codec's full requirement schema: field name → [`Requirement`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    fields: BTreeMap<String, Requirement>,
}

impl Requirements {
    /// Parse a schema from its JSON representation.
    pub fn parse(schema: &Value) -> Result<Self, CodecError> {
        let obj = schema.as_object().ok_or_else(|| {
            CodecError::BadRequirements(format!("expected object, got {schema}"))
        })?;
        let mut fields = BTreeMap::new();
        for (k, v) in obj {
            fields.insert(k.clone(), Requirement::parse(k, v)?);
        }
        Ok(Requirements { fields })
    }

    pub fn parse_str(schema: &str) -> Result<Self, CodecError> {
        let v: Value = serde_json::from_str(schema)
            .map_err(|e| CodecError::BadRequirements(e.to_string()))?;
        Self::parse(&v)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check `metadata` against this schema.
    ///
    /// Every declared field must be present and satisfy its requirement;
    /// extra metadata fields are ignored.
    pub fn check(&self, metadata: Option<&Value>) -> Result<(), CodecError> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let obj = metadata.and_then(Value::as_object).ok_or_else(|| {
            CodecError::MetadataMismatch(format!(
                "metadata required but missing (need: {})",
                self.field_names().join(", ")
            ))
        })?;
        for (field, req) in &self.fields {
            let v = obj.get(field).ok_or_else(|| {
                CodecError::MetadataMismatch(format!("missing metadata field '{field}'"))
            })?;
            req.check(field, v)?;
        }
        Ok(())
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }
}

// ── Compression constraints ──────────────────────────────────────────────────

/// Constraints a codec derives from category metadata, consumed by the
/// writer's block filler and by the rewriter when re-splitting blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionConstraints {
    /// Minimum atomic write size in bytes.  Block boundaries must fall on a
    /// multiple of this; `None` means byte granularity.
    pub granularity: Option<usize>,
}

impl CompressionConstraints {
    /// Largest usable block size not exceeding `block_size`.
    pub fn clamp_block_size(&self, block_size: usize) -> usize {
        match self.granularity {
            Some(g) if g > 1 => g * (block_size / g).max(1),
            _ => block_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_and_check() {
        let req = Requirements::parse(&json!({
            "endianness": ["set", ["big", "little"]],
            "bytes_per_sample": ["range", 1, 2],
        }))
        .unwrap();

        req.check(Some(&json!({"endianness": "big", "bytes_per_sample": 2})))
            .unwrap();

        let err = req
            .check(Some(&json!({"endianness": "mixed", "bytes_per_sample": 2})))
            .unwrap_err();
        assert!(err.to_string().contains("endianness"));

        let err = req
            .check(Some(&json!({"endianness": "big", "bytes_per_sample": 3})))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = req.check(None).unwrap_err();
        assert!(err.to_string().contains("metadata required"));
    }

    #[test]
    fn missing_field_diagnosed() {
        let req = Requirements::parse_str(r#"{"channels": ["range", 1, 8]}"#).unwrap();
        let err = req.check(Some(&json!({"other": 1}))).unwrap_err();
        assert!(err.to_string().contains("channels"));
    }

    #[test]
    fn bad_schemas_rejected() {
        assert!(Requirements::parse(&json!({"f": ["maybe", 1]})).is_err());
        assert!(Requirements::parse(&json!({"f": ["set", []]})).is_err());
        assert!(Requirements::parse(&json!({"f": ["range", 5, 1]})).is_err());
        assert!(Requirements::parse(&json!("not an object")).is_err());
    }

    #[test]
    fn empty_requirements_accept_anything() {
        let req = Requirements::default();
        req.check(None).unwrap();
        req.check(Some(&json!({"whatever": 1}))).unwrap();
    }

    #[test]
    fn granularity_clamps_block_size() {
        let c = CompressionConstraints { granularity: Some(4) };
        assert_eq!(c.clamp_block_size(1024), 1024);
        assert_eq!(c.clamp_block_size(1023), 1020);
        let none = CompressionConstraints::default();
        assert_eq!(none.clamp_block_size(1023), 1023);
    }
}
