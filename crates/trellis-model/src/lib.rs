#![recursion_limit = "256"]
//! Loading, validation, and typed decoding of trellis model documents.
//!
//! A model is a set of loosely coupled YAML documents describing components,
//! the interfaces they speak, graphs composing them into deployments, and
//! environments specializing those deployments. This crate turns files into a
//! validated [`Store`] of [`Entity`] values and decodes them into the typed
//! definitions the planner consumes.
//!
//! # Example
//!
//! ```
//! use trellis_model::{SchemaRegistry, Store};
//!
//! let mut store = Store::new();
//! store.add_documents(
//!     "example.yaml",
//!     r#"
//! kind: Component
//! name: mysql
//! image: mysql:5.7
//! "#,
//! )?;
//! store.validate(&SchemaRegistry::with_builtins())?;
//! assert!(store.contains("Component", "mysql"));
//! # Ok::<(), trellis_model::ModelError>(())
//! ```

pub mod definition;
pub mod entity;
pub mod error;
pub mod schema;
pub mod store;
pub mod value;

pub use definition::{
    AddressDefinition, ComponentDefinition, EndpointDefinition, EnvEntry, EnvironmentDefinition,
    ExposedEndpoint, FileDirective, GraphDefinition, InterfaceDefinition, InterfaceRegistry,
    PortDefinition, ProvidedVariable, RoleCardinality, RoleDefinition, ServiceSpec,
};
pub use entity::Entity;
pub use error::{ModelError, SchemaViolation};
pub use schema::SchemaRegistry;
pub use store::Store;
pub use value::{merge_maps, ConfigMap, ConfigValue};

use std::path::Path;

/// Loads every model document under the given paths and validates the
/// documents of built-in kinds, replacing them with their normalized forms.
pub fn load_and_validate<P: AsRef<Path>>(paths: &[P]) -> Result<Store, ModelError> {
    let mut store = Store::load(paths)?;
    store.validate(&SchemaRegistry::with_builtins())?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_load_and_validate_normalizes_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("model.yaml"),
            r#"
kind: Component
name: mysql
image: mysql:5.7
---
kind: Interface
name: mysql-database
roles:
  server:
    provides:
      - name: port
        default: 3306
"#,
        )
        .expect("write");

        let store = load_and_validate(&[dir.path()]).expect("model is valid");
        assert_eq!(store.len(), 2);
        let mysql = store.resolve("Component", "mysql", None).expect("loaded");
        assert_eq!(mysql.get("replicas"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_load_and_validate_reports_violations() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("model.yaml"),
            "kind: Component\nname: broken\n",
        )
        .expect("write");

        let err = load_and_validate(&[dir.path()]).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_VALIDATION");
        assert!(err.to_string().contains("Component:broken"), "got: {}", err);
    }
}
