use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{de_opt_scalar_string, decode};
use crate::entity::Entity;
use crate::error::ModelError;
use crate::store::Store;

/// A contract between services: named roles, what each role publishes, and
/// what it consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleDefinition>,
}

impl InterfaceDefinition {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        decode("Interface", entity)
    }

    pub fn role(&self, name: &str) -> Option<&RoleDefinition> {
        self.roles.get(name)
    }

    /// Role names in deterministic order.
    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

/// One side of an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// How many endpoints may fill this role within a single relation.
    #[serde(default)]
    pub cardinality: RoleCardinality,
    /// Variables this role publishes to its peers.
    #[serde(default)]
    pub provides: Vec<ProvidedVariable>,
    /// Variables this role needs a peer (or the configuration) to supply.
    #[serde(default)]
    pub uses: Vec<String>,
}

impl RoleDefinition {
    pub fn provided(&self, name: &str) -> Option<&ProvidedVariable> {
        self.provides.iter().find(|variable| variable.name == name)
    }

    pub fn provides_var(&self, name: &str) -> bool {
        self.provided(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCardinality {
    One,
    Many,
}

impl Default for RoleCardinality {
    fn default() -> Self {
        RoleCardinality::Many
    }
}

/// A variable a role publishes, optionally with a fallback default and a
/// secrecy marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidedVariable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub secret: bool,
}

/// All interface definitions from a store, indexed by name and version.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: BTreeMap<String, Vec<Arc<InterfaceDefinition>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry::default()
    }

    /// Decodes every `Interface` document in the store.
    pub fn from_store(store: &Store) -> Result<Self, ModelError> {
        let mut registry = InterfaceRegistry::new();
        for entity in store.by_kind("Interface") {
            registry.add(InterfaceDefinition::from_entity(&entity)?);
        }
        Ok(registry)
    }

    pub fn add(&mut self, definition: InterfaceDefinition) {
        self.interfaces
            .entry(definition.name.clone())
            .or_default()
            .push(Arc::new(definition));
    }

    /// Resolves an interface by name, and version when pinned.
    ///
    /// As with store lookups, an unpinned reference is only valid while a
    /// single version is registered.
    pub fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<InterfaceDefinition>, ModelError> {
        let candidates = match self.interfaces.get(name) {
            Some(candidates) if !candidates.is_empty() => candidates,
            _ => {
                return Err(ModelError::EntityNotFound {
                    kind: "Interface".to_string(),
                    name: name.to_string(),
                    version: version.map(String::from),
                })
            }
        };
        match version {
            Some(wanted) => candidates
                .iter()
                .find(|definition| definition.version.as_deref() == Some(wanted))
                .cloned()
                .ok_or_else(|| ModelError::EntityNotFound {
                    kind: "Interface".to_string(),
                    name: name.to_string(),
                    version: Some(wanted.to_string()),
                }),
            None if candidates.len() == 1 => Ok(candidates[0].clone()),
            None => Err(ModelError::AmbiguousVersion {
                kind: "Interface".to_string(),
                name: name.to_string(),
                versions: candidates
                    .iter()
                    .map(|definition| {
                        definition
                            .version
                            .clone()
                            .unwrap_or_else(|| "unversioned".to_string())
                    })
                    .collect(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.interfaces.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mysql_interface() -> InterfaceDefinition {
        let entity = Entity::from_document(
            json!({
                "kind": "Interface",
                "name": "mysql-database",
                "roles": {
                    "server": {
                        "cardinality": "one",
                        "provides": [
                            {"name": "port", "default": 3306},
                            {"name": "admin_user", "default": "root"},
                            {"name": "admin_password", "secret": true}
                        ]
                    },
                    "client": {
                        "uses": ["port", "admin_user", "admin_password"]
                    }
                }
            }),
            "interface.yaml",
        )
        .expect("valid doc");
        InterfaceDefinition::from_entity(&entity).expect("decodes")
    }

    #[test]
    fn test_decode_roles() {
        let interface = mysql_interface();
        let server = interface.role("server").expect("server role");
        assert_eq!(server.cardinality, RoleCardinality::One);
        assert_eq!(server.provides.len(), 3);
        assert!(server.provided("admin_password").map(|v| v.secret) == Some(true));
        assert_eq!(server.provided("port").and_then(|v| v.default.clone()), Some(json!(3306)));

        let client = interface.role("client").expect("client role");
        assert_eq!(client.cardinality, RoleCardinality::Many);
        assert_eq!(client.uses, vec!["port", "admin_user", "admin_password"]);
        assert!(interface.role("admin").is_none());
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = InterfaceRegistry::new();
        registry.add(mysql_interface());

        let resolved = registry.resolve("mysql-database", None).expect("resolves");
        assert_eq!(resolved.name, "mysql-database");

        let err = registry.resolve("postgres-database", None).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_ENTITY_NOT_FOUND");
    }

    #[test]
    fn test_registry_version_pinning() {
        let mut registry = InterfaceRegistry::new();
        let mut v1 = mysql_interface();
        v1.version = Some("1".to_string());
        let mut v2 = mysql_interface();
        v2.version = Some("2".to_string());
        registry.add(v1);
        registry.add(v2);

        let resolved = registry
            .resolve("mysql-database", Some("2"))
            .expect("pinned resolves");
        assert_eq!(resolved.version.as_deref(), Some("2"));

        let err = registry.resolve("mysql-database", None).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_AMBIGUOUS_VERSION");
    }

    #[test]
    fn test_from_store_decodes_every_interface() {
        let mut store = Store::new();
        store
            .add_documents(
                "interfaces.yaml",
                r#"
kind: Interface
name: http
roles:
  server:
    provides:
      - name: port
        default: 80
  client: {}
---
kind: Interface
name: mysql-database
roles: {}
"#,
            )
            .expect("loads");
        let registry = InterfaceRegistry::from_store(&store).expect("decodes");
        assert_eq!(registry.len(), 2);
    }
}
