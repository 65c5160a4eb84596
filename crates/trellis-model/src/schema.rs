use std::collections::BTreeMap;

use jsonschema::JSONSchema;
use serde_json::json;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{ModelError, SchemaViolation};

/// Registry of JSON Schemas keyed by document kind.
///
/// Validation serves two purposes: rejecting malformed documents with every
/// violation reported at once, and normalizing documents by filling schema
/// defaults in, so later stages can rely on fields like `replicas` being
/// present.
pub struct SchemaRegistry {
    schemas: BTreeMap<String, CompiledSchema>,
}

struct CompiledSchema {
    raw: serde_json::Value,
    compiled: JSONSchema,
}

impl SchemaRegistry {
    /// An empty registry; documents of unknown kinds pass through untouched.
    pub fn new() -> Self {
        SchemaRegistry {
            schemas: BTreeMap::new(),
        }
    }

    /// A registry pre-loaded with the schemas for the built-in document
    /// kinds: `Component`, `Interface`, `Graph`, and `Environment`.
    pub fn with_builtins() -> Self {
        let mut registry = SchemaRegistry::new();
        // The built-in schemas are known-good, so registration cannot fail.
        let builtins = [
            ("Component", component_schema()),
            ("Interface", interface_schema()),
            ("Graph", graph_schema()),
            ("Environment", environment_schema()),
        ];
        for (kind, schema) in builtins {
            if let Err(error) = registry.register(kind, schema) {
                unreachable!("built-in schema for {} failed to compile: {}", kind, error);
            }
        }
        registry
    }

    /// Registers (or replaces) the schema for a kind.
    pub fn register(&mut self, kind: &str, schema: serde_json::Value) -> Result<(), ModelError> {
        // The compile error borrows the schema, so turn it into a string
        // before the schema value moves into the registry.
        let compiled = JSONSchema::compile(&schema).map_err(|error| ModelError::InvalidSchema {
            kind: kind.to_string(),
            message: error.to_string(),
        })?;
        debug!(kind = kind, "registered schema");
        self.schemas.insert(
            kind.to_string(),
            CompiledSchema {
                raw: schema,
                compiled,
            },
        );
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Validates an entity against the schema for its kind.
    ///
    /// On success the returned entity is the normalized form with schema
    /// defaults filled in. Entities of unregistered kinds pass through
    /// unchanged.
    pub fn validate(&self, entity: &Entity) -> Result<Entity, ModelError> {
        let (data, violations) = self.check(entity);
        if violations.is_empty() {
            Ok(Entity {
                data,
                ..entity.clone()
            })
        } else {
            Err(ModelError::from_violations(violations))
        }
    }

    /// Default-fills and checks an entity, returning the normalized data
    /// along with every violation found.
    pub(crate) fn check(
        &self,
        entity: &Entity,
    ) -> (
        serde_json::Map<String, serde_json::Value>,
        Vec<SchemaViolation>,
    ) {
        let schema = match self.schemas.get(&entity.kind) {
            Some(schema) => schema,
            None => return (entity.data.clone(), Vec::new()),
        };

        let mut data = entity.data.clone();
        fill_defaults(&schema.raw, &mut data);

        let instance = serde_json::Value::Object(data);
        let mut violations = Vec::new();
        if let Err(errors) = schema.compiled.validate(&instance) {
            for error in errors {
                let path = error.instance_path.to_string();
                violations.push(SchemaViolation {
                    qual_name: entity.qual_name(),
                    message: error.to_string(),
                    path: if path.is_empty() { None } else { Some(path) },
                });
            }
        }

        let data = match instance {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        (data, violations)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        SchemaRegistry::with_builtins()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Inserts schema `default` values for missing properties, recursing into
/// object-typed properties.
fn fill_defaults(
    schema: &serde_json::Value,
    data: &mut serde_json::Map<String, serde_json::Value>,
) {
    let properties = match schema.get("properties").and_then(|p| p.as_object()) {
        Some(properties) => properties,
        None => return,
    };
    for (key, prop_schema) in properties {
        if let Some(default) = prop_schema.get("default") {
            data.entry(key.clone()).or_insert_with(|| default.clone());
        }
        let is_object = prop_schema.get("type").and_then(|t| t.as_str()) == Some("object");
        if is_object && prop_schema.get("properties").is_some() {
            match data.get_mut(key) {
                Some(serde_json::Value::Object(existing)) => {
                    fill_defaults(prop_schema, existing);
                }
                Some(_) => {}
                None => {
                    let mut nested = serde_json::Map::new();
                    fill_defaults(prop_schema, &mut nested);
                    if !nested.is_empty() {
                        data.insert(key.clone(), serde_json::Value::Object(nested));
                    }
                }
            }
        }
    }
}

fn environment_entries_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string", "minLength": 1}
            }
        }
    })
}

fn component_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["kind", "name", "image"],
        "properties": {
            "kind": {"type": "string"},
            "name": {"type": "string", "minLength": 1},
            "version": {"type": ["string", "number"]},
            "image": {"type": "string", "minLength": 1},
            "replicas": {"type": "integer", "minimum": 0, "default": 1},
            "config": {"type": "object"},
            "environment": environment_entries_schema(),
            "endpoints": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "interface", "role"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "interface": {"type": "string", "minLength": 1},
                        "interface_version": {"type": ["string", "number"]},
                        "role": {"type": "string", "minLength": 1},
                        "addresses": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "host": {"type": "string"},
                                    "ports": {
                                        "type": "array",
                                        "items": {
                                            "type": "object",
                                            "required": ["port"],
                                            "properties": {
                                                "name": {"type": "string"},
                                                "port": {
                                                    "type": "integer",
                                                    "minimum": 1,
                                                    "maximum": 65535
                                                },
                                                "protocol": {
                                                    "type": "string",
                                                    "enum": ["TCP", "UDP"]
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        },
                        "environment": environment_entries_schema()
                    }
                }
            },
            "files": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["template", "container_path"],
                    "properties": {
                        "template": {"type": "string", "minLength": 1},
                        "container_path": {"type": "string", "minLength": 1}
                    }
                }
            },
            "storage": {},
            "probes": {}
        }
    })
}

fn interface_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["kind", "name", "roles"],
        "properties": {
            "kind": {"type": "string"},
            "name": {"type": "string", "minLength": 1},
            "version": {"type": ["string", "number"]},
            "roles": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {
                        "cardinality": {"type": "string", "enum": ["one", "many"]},
                        "provides": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["name"],
                                "properties": {
                                    "name": {"type": "string", "minLength": 1},
                                    "secret": {"type": "boolean"},
                                    "default": {}
                                }
                            }
                        },
                        "uses": {
                            "type": "array",
                            "items": {"type": "string", "minLength": 1}
                        }
                    }
                }
            }
        }
    })
}

fn graph_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["kind", "name", "services"],
        "properties": {
            "kind": {"type": "string"},
            "name": {"type": "string", "minLength": 1},
            "version": {"type": ["string", "number"]},
            "services": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "component": {"type": "string", "minLength": 1},
                        "version": {"type": ["string", "number"]},
                        "replicas": {"type": "integer", "minimum": 0},
                        "config": {"type": "object"},
                        "environment": environment_entries_schema(),
                        "expose": {
                            "type": "array",
                            "items": {"type": "string", "minLength": 1}
                        }
                    }
                }
            },
            "relations": {
                "type": "array",
                "items": {
                    "type": "array",
                    "minItems": 2,
                    "items": {"type": "string", "pattern": "^[^:]+:[^:]+$"}
                }
            },
            "expose": {
                "type": "array",
                "items": {
                    "oneOf": [
                        {"type": "string", "pattern": "^[^:]+:[^:]+$"},
                        {
                            "type": "object",
                            "required": ["target"],
                            "properties": {
                                "name": {"type": "string", "minLength": 1},
                                "target": {"type": "string", "pattern": "^[^:]+:[^:]+$"}
                            }
                        }
                    ]
                }
            }
        }
    })
}

fn environment_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["kind", "name"],
        "properties": {
            "kind": {"type": "string"},
            "name": {"type": "string", "minLength": 1},
            "version": {"type": ["string", "number"]},
            "config": {"type": "object", "default": {}}
        }
    })
}
