//! # Payload Types
//!
//! Bucket configuration and batch request types sent as RPC arguments.
//!
//! ## Design Principles
//!
//! 1. **Typed Operations**: A batch entry's operation is an enum, so the
//!    fields each operation needs are present by construction.
//! 2. **Validate Before Dispatch**: Shape checks that the type system cannot
//!    express (object-valued JSON, header maps) run in `prepare`.
//! 3. **Legacy Compatibility**: Puts carry a stringified `_value` alongside
//!    the structured value because older servers only read `_value`.
//!
//! ## Wire Example
//!
//! ```text
//! { "bucket": "users", "operation": "put", "key": "u1",
//!   "value": {"name": "x"}, "_value": "{\"name\":\"x\"}" }
//! { "bucket": "users", "operation": "deleteMany", "filter": "(age<=10)" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationResult};

/// Bucket schema: indexes plus pre/post trigger sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Index definitions keyed by field name, e.g. `{"email": {"type": "string"}}`.
    pub index: Map<String, Value>,
    /// Pre-write trigger sources.
    pub pre: Vec<String>,
    /// Post-write trigger sources.
    pub post: Vec<String>,
    /// Bucket options such as `version`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl BucketConfig {
    /// Adds an index of the given type.
    pub fn with_index(mut self, field: impl Into<String>, kind: &str) -> Self {
        let mut def = Map::new();
        def.insert("type".to_string(), Value::String(kind.to_string()));
        self.index.insert(field.into(), Value::Object(def));
        self
    }
}

/// Operation carried by one batch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum BatchOperation {
    /// Create or replace an object.
    Put {
        key: String,
        value: Value,
        #[serde(rename = "_value", default, skip_serializing_if = "Option::is_none")]
        raw_value: Option<String>,
    },
    /// Update indexed fields on every object matching `filter`.
    Update { fields: Value, filter: String },
    /// Delete one object.
    Delete { key: String },
    /// Delete every object matching `filter`.
    DeleteMany { filter: String },
}

/// One entry of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub bucket: String,
    #[serde(flatten)]
    pub operation: BatchOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl BatchRequest {
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        BatchRequest {
            bucket: bucket.into(),
            operation: BatchOperation::Put {
                key: key.into(),
                value,
                raw_value: None,
            },
            options: None,
        }
    }

    pub fn update(bucket: impl Into<String>, fields: Value, filter: impl Into<String>) -> Self {
        BatchRequest {
            bucket: bucket.into(),
            operation: BatchOperation::Update {
                fields,
                filter: filter.into(),
            },
            options: None,
        }
    }

    pub fn delete(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        BatchRequest {
            bucket: bucket.into(),
            operation: BatchOperation::Delete { key: key.into() },
            options: None,
        }
    }

    pub fn delete_many(bucket: impl Into<String>, filter: impl Into<String>) -> Self {
        BatchRequest {
            bucket: bucket.into(),
            operation: BatchOperation::DeleteMany {
                filter: filter.into(),
            },
            options: None,
        }
    }

    /// Attaches per-entry options (headers, etag).
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Validates the entry at position `index` and fills in `_value` for puts.
    ///
    /// A caller-supplied `_value` is kept as-is; it must be a string by
    /// construction.
    pub fn prepare(&mut self, index: usize) -> ValidationResult<()> {
        let at = |field: &str| format!("requests[{}].{}", index, field);

        if let Some(options) = &self.options {
            if !options.is_object() {
                return Err(ValidationError::InvalidField {
                    field: at("options"),
                    expected: "an object",
                });
            }
            if let Some(headers) = options.get("headers") {
                if !headers.is_object() {
                    return Err(ValidationError::InvalidField {
                        field: at("options.headers"),
                        expected: "an object",
                    });
                }
            }
        }

        match &mut self.operation {
            BatchOperation::Put { value, raw_value, .. } => {
                if !value.is_object() {
                    return Err(ValidationError::InvalidField {
                        field: at("value"),
                        expected: "an object",
                    });
                }
                if raw_value.is_none() {
                    *raw_value = Some(value.to_string());
                }
            }
            BatchOperation::Update { fields, .. } => {
                if !fields.is_object() {
                    return Err(ValidationError::InvalidField {
                        field: at("fields"),
                        expected: "an object",
                    });
                }
            }
            BatchOperation::Delete { .. } | BatchOperation::DeleteMany { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_serializes_with_operation_tag_and_raw_value() {
        let mut req = BatchRequest::put("b", "k", json!({"a": 1}));
        req.prepare(0).unwrap();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire,
            json!({"bucket": "b", "operation": "put", "key": "k",
                   "value": {"a": 1}, "_value": "{\"a\":1}"})
        );
    }

    #[test]
    fn delete_many_uses_camel_case_tag() {
        let req = BatchRequest::delete_many("b", "(x=1)");
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["operation"], json!("deleteMany"));
        assert_eq!(wire["filter"], json!("(x=1)"));
    }

    #[test]
    fn rejects_non_object_put_value() {
        let mut req = BatchRequest::put("b", "k", json!("scalar"));
        let err = req.prepare(3).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidField {
                field: "requests[3].value".to_string(),
                expected: "an object",
            }
        );
    }

    #[test]
    fn rejects_bad_headers_and_non_object_fields() {
        let mut req = BatchRequest::delete("b", "k").with_options(json!({"headers": 1}));
        assert!(matches!(
            req.prepare(0),
            Err(ValidationError::InvalidField { .. })
        ));

        let mut req = BatchRequest::update("b", json!([1]), "(x=1)");
        assert_eq!(
            req.prepare(1),
            Err(ValidationError::InvalidField {
                field: "requests[1].fields".to_string(),
                expected: "an object",
            })
        );
    }

    #[test]
    fn empty_names_are_left_to_the_server() {
        let mut req = BatchRequest::delete_many("", "");
        assert_eq!(req.prepare(0), Ok(()));
    }

    #[test]
    fn keeps_caller_raw_value() {
        let mut req = BatchRequest::put("b", "k", json!({"a": 1}));
        if let BatchOperation::Put { raw_value, .. } = &mut req.operation {
            *raw_value = Some("{\"a\":1}".to_string());
        }
        req.prepare(0).unwrap();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["_value"], json!("{\"a\":1}"));
    }

    #[test]
    fn bucket_config_index_builder() {
        let cfg = BucketConfig::default().with_index("email", "string");
        let wire = serde_json::to_value(&cfg).unwrap();
        assert_eq!(wire["index"], json!({"email": {"type": "string"}}));
        assert_eq!(wire["pre"], json!([]));
    }
}
