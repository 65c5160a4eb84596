use serde::Serialize;

use crate::error::ModelError;

/// A single model document, as loaded from one YAML document.
///
/// Every document carries a `kind` and a `name`; the remaining mapping is kept
/// verbatim in [`Entity::data`] so schema validation and typed decoding can
/// both work from the same representation. `src_ref` records where the
/// document came from, for error messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub kind: String,
    pub name: String,
    /// Optional version, coerced to a string when the document used a bare
    /// numeric scalar like `5.7`.
    pub version: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub src_ref: String,
}

impl Entity {
    /// Builds an entity from a parsed YAML document.
    pub fn from_document(value: serde_json::Value, src_ref: &str) -> Result<Self, ModelError> {
        let data = match value {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(ModelError::NotAMapping {
                    src_ref: src_ref.to_string(),
                })
            }
        };
        let kind = required_string(&data, "kind", src_ref)?;
        let name = required_string(&data, "name", src_ref)?;
        let version = data.get("version").and_then(scalar_to_string);
        Ok(Entity {
            kind,
            name,
            version,
            data,
            src_ref: src_ref.to_string(),
        })
    }

    /// Qualified name in `kind:name` form, e.g. `Component:mysql`.
    pub fn qual_name(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// Looks up a value inside the document data by dotted path.
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// The document data as a JSON value, for schema validation.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone())
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qual_name())
    }
}

fn required_string(
    data: &serde_json::Map<String, serde_json::Value>,
    field: &'static str,
    src_ref: &str,
) -> Result<String, ModelError> {
    match data.get(field).and_then(serde_json::Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ModelError::MissingField {
            src_ref: src_ref.to_string(),
            field,
        }),
    }
}

/// Coerces a scalar document value to its string form.
///
/// YAML authors write versions as `"5.7"` and as `5.7`; both forms must name
/// the same entity.
pub(crate) fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_document_extracts_identity() {
        let entity = Entity::from_document(
            json!({"kind": "Component", "name": "mysql", "version": 5.7, "image": "mysql"}),
            "model/mysql.yaml",
        )
        .unwrap();
        assert_eq!(entity.qual_name(), "Component:mysql");
        assert_eq!(entity.version.as_deref(), Some("5.7"));
        assert_eq!(entity.src_ref, "model/mysql.yaml");
    }

    #[test]
    fn test_from_document_rejects_non_mapping() {
        let err = Entity::from_document(json!(["not", "a", "mapping"]), "bad.yaml").unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_NOT_A_MAPPING");
    }

    #[test]
    fn test_from_document_requires_kind_and_name() {
        let err = Entity::from_document(json!({"name": "mysql"}), "bad.yaml").unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_MISSING_FIELD");
        assert!(err.to_string().contains("`kind`"), "got: {}", err);

        let err = Entity::from_document(json!({"kind": "Component"}), "bad.yaml").unwrap_err();
        assert!(err.to_string().contains("`name`"), "got: {}", err);
    }

    #[test]
    fn test_dotted_get() {
        let entity = Entity::from_document(
            json!({
                "kind": "Component",
                "name": "mysql",
                "config": {"port": 3306},
                "endpoints": [{"name": "db"}]
            }),
            "model/mysql.yaml",
        )
        .unwrap();
        assert_eq!(entity.get("config.port"), Some(&json!(3306)));
        assert_eq!(entity.get("endpoints.0.name"), Some(&json!("db")));
        assert_eq!(entity.get("endpoints.1.name"), None);
        assert_eq!(entity.get("missing"), None);
    }
}
