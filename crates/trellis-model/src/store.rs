use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::entity::Entity;
use crate::error::ModelError;
use crate::schema::SchemaRegistry;

/// An indexed collection of model documents.
///
/// The store keeps every loaded [`Entity`] and indexes them by kind and name.
/// A `(kind, name)` pair may be loaded in several versions; an exact
/// `(kind, name, version)` triple must be unique. Iteration order follows the
/// load order, which in turn follows sorted file paths, so two loads of the
/// same tree produce identical stores.
#[derive(Debug, Default)]
pub struct Store {
    entities: Vec<Arc<Entity>>,
    by_kind: BTreeMap<String, BTreeMap<String, Vec<usize>>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Loads every YAML document found under the given paths.
    ///
    /// Directories are walked recursively in sorted order, picking up `*.yaml`
    /// and `*.yml` files. Paths naming a file directly are loaded regardless
    /// of extension.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ModelError> {
        let mut files = Vec::new();
        for path in paths {
            collect_model_files(path.as_ref(), &mut files)?;
        }

        let mut store = Store::new();
        for file in &files {
            let source = fs::read_to_string(file).map_err(|source| ModelError::Io {
                path: file.display().to_string(),
                source,
            })?;
            store.add_documents(&file.display().to_string(), &source)?;
        }
        debug!(
            files = files.len(),
            entities = store.len(),
            "loaded model documents"
        );
        Ok(store)
    }

    /// Parses a YAML source (possibly multi-document) and adds every document.
    pub fn add_documents(&mut self, src_ref: &str, source: &str) -> Result<(), ModelError> {
        for document in yaml_documents(src_ref, source)? {
            let entity = Entity::from_document(document, src_ref)?;
            self.add(entity)?;
        }
        Ok(())
    }

    /// Adds a single entity, rejecting exact duplicates.
    pub fn add(&mut self, entity: Entity) -> Result<(), ModelError> {
        if let Some(existing) = self.find_exact(&entity.kind, &entity.name, entity.version.as_deref())
        {
            return Err(ModelError::DuplicateEntity {
                qual_name: entity.qual_name(),
                version: entity
                    .version
                    .clone()
                    .unwrap_or_else(|| "unversioned".to_string()),
                src_ref: entity.src_ref.clone(),
                previous: existing.src_ref.clone(),
            });
        }

        trace!(entity = %entity.qual_name(), src_ref = %entity.src_ref, "adding entity");
        let index = self.entities.len();
        self.by_kind
            .entry(entity.kind.clone())
            .or_default()
            .entry(entity.name.clone())
            .or_default()
            .push(index);
        self.entities.push(Arc::new(entity));
        Ok(())
    }

    /// All loaded versions of `(kind, name)`, in load order.
    pub fn get(&self, kind: &str, name: &str) -> Vec<Arc<Entity>> {
        self.by_kind
            .get(kind)
            .and_then(|names| names.get(name))
            .map(|indices| indices.iter().map(|i| self.entities[*i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        !self.get(kind, name).is_empty()
    }

    /// Resolves `(kind, name, version)` to exactly one entity.
    ///
    /// Omitting the version is only allowed when a single version is loaded;
    /// otherwise the reference is ambiguous and refused.
    pub fn resolve(
        &self,
        kind: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<Entity>, ModelError> {
        let candidates = self.get(kind, name);
        if candidates.is_empty() {
            return Err(ModelError::EntityNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                version: version.map(String::from),
            });
        }
        match version {
            Some(wanted) => candidates
                .iter()
                .find(|entity| entity.version.as_deref() == Some(wanted))
                .cloned()
                .ok_or_else(|| ModelError::EntityNotFound {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    version: Some(wanted.to_string()),
                }),
            None if candidates.len() == 1 => Ok(candidates[0].clone()),
            None => Err(ModelError::AmbiguousVersion {
                kind: kind.to_string(),
                name: name.to_string(),
                versions: candidates
                    .iter()
                    .map(|entity| {
                        entity
                            .version
                            .clone()
                            .unwrap_or_else(|| "unversioned".to_string())
                    })
                    .collect(),
            }),
        }
    }

    /// All entities of a kind, ordered by name and then load order.
    pub fn by_kind(&self, kind: &str) -> Vec<Arc<Entity>> {
        self.by_kind
            .get(kind)
            .map(|names| {
                names
                    .values()
                    .flatten()
                    .map(|i| self.entities[*i].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Validates every entity whose kind has a registered schema, replacing
    /// it with its normalized (default-filled) form.
    ///
    /// All violations across the whole store are aggregated into one error.
    pub fn validate(&mut self, registry: &SchemaRegistry) -> Result<(), ModelError> {
        let mut violations = Vec::new();
        for index in 0..self.entities.len() {
            let entity = self.entities[index].clone();
            if !registry.contains(&entity.kind) {
                continue;
            }
            let (data, mut found) = registry.check(&entity);
            if found.is_empty() {
                let normalized = Entity {
                    data,
                    ..(*entity).clone()
                };
                self.entities[index] = Arc::new(normalized);
            } else {
                violations.append(&mut found);
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ModelError::from_violations(violations))
        }
    }

    fn find_exact(&self, kind: &str, name: &str, version: Option<&str>) -> Option<Arc<Entity>> {
        self.get(kind, name)
            .into_iter()
            .find(|entity| entity.version.as_deref() == version)
    }
}

/// Parses a YAML source into its JSON documents, skipping empty documents.
fn yaml_documents(src_ref: &str, source: &str) -> Result<Vec<serde_json::Value>, ModelError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(source) {
        let value =
            serde_yaml::Value::deserialize(document).map_err(|source| ModelError::Yaml {
                src_ref: src_ref.to_string(),
                source,
            })?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value).map_err(|source| ModelError::Json {
            src_ref: src_ref.to_string(),
            source,
        })?;
        documents.push(json);
    }
    Ok(documents)
}

fn collect_model_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<(), ModelError> {
    let metadata = fs::metadata(path).map_err(|source| ModelError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if !metadata.is_dir() {
        files.push(path.to_path_buf());
        return Ok(());
    }

    let mut entries = Vec::new();
    let listing = fs::read_dir(path).map_err(|source| ModelError::Io {
        path: path.display().to_string(),
        source,
    })?;
    for entry in listing {
        let entry = entry.map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        entries.push(entry.path());
    }
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            collect_model_files(&entry, files)?;
        } else if is_yaml_file(&entry) {
            files.push(entry);
        }
    }
    Ok(())
}

fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_from(source: &str) -> Store {
        let mut store = Store::new();
        store
            .add_documents("test.yaml", source)
            .expect("documents should load");
        store
    }

    #[test]
    fn test_multi_document_source() {
        let store = store_from(
            r#"
kind: Component
name: mysql
image: mysql
---
kind: Interface
name: mysql-database
roles: {}
---
"#,
        );
        assert_eq!(store.len(), 2);
        assert!(store.contains("Component", "mysql"));
        assert!(store.contains("Interface", "mysql-database"));
    }

    #[test]
    fn test_duplicate_triple_rejected() {
        let mut store = store_from("kind: Component\nname: mysql\nversion: '5.7'\nimage: mysql\n");
        let err = store
            .add_documents(
                "other.yaml",
                "kind: Component\nname: mysql\nversion: '5.7'\nimage: mysql\n",
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_DUPLICATE_ENTITY");
        assert!(
            err.to_string().contains("test.yaml"),
            "error should point at the first definition: {}",
            err
        );
    }

    #[test]
    fn test_same_name_different_versions_coexist() {
        let store = store_from(
            r#"
kind: Component
name: mysql
version: '5.7'
image: mysql:5.7
---
kind: Component
name: mysql
version: '8.0'
image: mysql:8.0
"#,
        );
        assert_eq!(store.get("Component", "mysql").len(), 2);

        let resolved = store.resolve("Component", "mysql", Some("8.0")).unwrap();
        assert_eq!(resolved.get("image"), Some(&serde_json::json!("mysql:8.0")));

        let err = store.resolve("Component", "mysql", None).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_AMBIGUOUS_VERSION");
    }

    #[test]
    fn test_resolve_single_version_without_pin() {
        let store = store_from("kind: Component\nname: ghost\nimage: ghost\n");
        let resolved = store.resolve("Component", "ghost", None).unwrap();
        assert_eq!(resolved.name, "ghost");

        let err = store.resolve("Component", "missing", None).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_ENTITY_NOT_FOUND");
    }

    #[test]
    fn test_numeric_version_matches_string_pin() {
        let store = store_from("kind: Component\nname: mysql\nversion: 5.7\nimage: mysql\n");
        assert!(store.resolve("Component", "mysql", Some("5.7")).is_ok());
    }

    #[test]
    fn test_directory_loading_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("nested")).expect("mkdir");
        fs::write(
            dir.path().join("b.yaml"),
            "kind: Component\nname: beta\nimage: beta\n",
        )
        .expect("write");
        fs::write(
            dir.path().join("a.yaml"),
            "kind: Component\nname: alpha\nimage: alpha\n",
        )
        .expect("write");
        fs::write(
            dir.path().join("nested/c.yml"),
            "kind: Component\nname: gamma\nimage: gamma\n",
        )
        .expect("write");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let store = Store::load(&[dir.path()]).expect("load should succeed");
        let names: Vec<String> = store.iter().map(|entity| entity.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_yaml_error_carries_src_ref() {
        let mut store = Store::new();
        let err = store
            .add_documents("broken.yaml", "kind: [unclosed")
            .unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_YAML");
        assert!(err.to_string().contains("broken.yaml"), "got: {}", err);
    }

    #[test]
    fn test_by_kind_is_ordered_by_name() {
        let store = store_from(
            r#"
kind: Component
name: zeta
image: zeta
---
kind: Component
name: alpha
image: alpha
---
kind: Interface
name: middle
roles: {}
"#,
        );
        let names: Vec<String> = store
            .by_kind("Component")
            .iter()
            .map(|entity| entity.name.clone())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(store.by_kind("Environment").is_empty());
    }
}
