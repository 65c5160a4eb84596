use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Map type used for all configuration mappings.
///
/// Keys are ordered so every traversal and serialization of a value tree is
/// deterministic.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// A configuration value as it flows through loading, merging, and planning.
///
/// The tree mirrors JSON with one addition: a value can be wrapped in
/// [`ConfigValue::Secret`], which marks it as sensitive. Merging, path lookup,
/// and serialization all preserve the marker so emitters can route secret
/// material separately from plain configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(ConfigMap),
    /// A sensitive value. The wrapped value carries the actual data.
    Secret(Box<ConfigValue>),
}

impl Default for ConfigValue {
    fn default() -> Self {
        ConfigValue::Null
    }
}

impl ConfigValue {
    /// Builds a value from its plain JSON representation.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::Null,
            serde_json::Value::Bool(b) => ConfigValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ConfigValue::Integer(i)
                } else {
                    ConfigValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => ConfigValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ConfigValue::List(items.iter().map(ConfigValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ConfigValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ConfigValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts a JSON object into a [`ConfigMap`].
    pub fn map_from_json(map: &serde_json::Map<String, serde_json::Value>) -> ConfigMap {
        map.iter()
            .map(|(k, v)| (k.clone(), ConfigValue::from_json(v)))
            .collect()
    }

    /// Converts the value to JSON, revealing secret values in place.
    ///
    /// Only call this on a path that is allowed to see secret material, such
    /// as a secrets document or a template input.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Integer(i) => serde_json::Value::from(*i),
            ConfigValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ConfigValue::String(s) => serde_json::Value::String(s.clone()),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json).collect())
            }
            ConfigValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            ConfigValue::Secret(inner) => inner.to_json(),
        }
    }

    /// Converts the value to JSON with every secret replaced by a placeholder.
    pub fn to_json_redacted(&self) -> serde_json::Value {
        match self {
            ConfigValue::Secret(_) => serde_json::Value::String("<secret>".to_string()),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json_redacted).collect())
            }
            ConfigValue::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_redacted()))
                    .collect(),
            ),
            other => other.to_json(),
        }
    }

    /// Marks the value as secret. Already-secret values are left untouched.
    pub fn into_secret(self) -> Self {
        match self {
            ConfigValue::Secret(_) => self,
            other => ConfigValue::Secret(Box::new(other)),
        }
    }

    /// Returns true if the value itself is a secret.
    pub fn is_secret(&self) -> bool {
        matches!(self, ConfigValue::Secret(_))
    }

    /// Returns true if the value or anything nested inside it is a secret.
    pub fn contains_secret(&self) -> bool {
        match self {
            ConfigValue::Secret(_) => true,
            ConfigValue::List(items) => items.iter().any(ConfigValue::contains_secret),
            ConfigValue::Map(map) => map.values().any(ConfigValue::contains_secret),
            _ => false,
        }
    }

    /// Strips one secret wrapper, if present, and returns the inner value.
    pub fn reveal(&self) -> &ConfigValue {
        match self {
            ConfigValue::Secret(inner) => inner.reveal(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.reveal() {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.reveal() {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.reveal() {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up a value by dotted path, e.g. `db_remote.provided.port`.
    ///
    /// Path segments traverse maps by key and lists by zero-based index.
    /// Secret wrappers on intermediate nodes are traversed transparently; the
    /// returned node keeps its own wrapper.
    pub fn get_path(&self, path: &str) -> Option<&ConfigValue> {
        self.resolve_path(path).map(|(value, _)| value)
    }

    /// Like [`ConfigValue::get_path`], also reporting whether the traversal
    /// passed through a secret wrapper on the way to the target.
    pub fn resolve_path(&self, path: &str) -> Option<(&ConfigValue, bool)> {
        let mut current = self;
        let mut crossed_secret = false;
        for segment in path.split('.') {
            while let ConfigValue::Secret(inner) = current {
                crossed_secret = true;
                current = inner;
            }
            current = match current {
                ConfigValue::Map(map) => map.get(segment)?,
                ConfigValue::List(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some((current, crossed_secret))
    }

    /// Deep-merges `overlay` into this value. The overlay wins on conflicts.
    ///
    /// Maps merge key by key. Lists whose elements are all mappings carrying a
    /// string `name` key merge element-wise by that name, appending entries
    /// the base list does not have. Any other combination replaces the base
    /// value with a clone of the overlay.
    pub fn merge_from(&mut self, overlay: &ConfigValue) {
        match (&mut *self, overlay) {
            (ConfigValue::Map(base), ConfigValue::Map(over)) => {
                for (key, value) in over {
                    match base.get_mut(key) {
                        Some(existing) => existing.merge_from(value),
                        None => {
                            base.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            (ConfigValue::List(base), ConfigValue::List(over))
                if lists_merge_by_name(base, over) =>
            {
                for item in over {
                    let name = item_name(item);
                    let existing = base
                        .iter_mut()
                        .find(|candidate| item_name(candidate) == name);
                    match existing {
                        Some(entry) => entry.merge_from(item),
                        None => base.push(item.clone()),
                    }
                }
            }
            (base, over) => *base = over.clone(),
        }
    }
}

/// Deep-merges the `overlay` map into `base`, element rules as in
/// [`ConfigValue::merge_from`].
pub fn merge_maps(base: &mut ConfigMap, overlay: &ConfigMap) {
    for (key, value) in overlay {
        match base.get_mut(key) {
            Some(existing) => existing.merge_from(value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// True when both lists consist solely of mappings with a string `name` key,
/// which switches list merging from replacement to name-keyed merging.
fn lists_merge_by_name(base: &[ConfigValue], overlay: &[ConfigValue]) -> bool {
    !base.is_empty()
        && !overlay.is_empty()
        && base.iter().chain(overlay.iter()).all(|item| item_name(item).is_some())
}

fn item_name(item: &ConfigValue) -> Option<&str> {
    item.as_map()?.get("name")?.as_str()
}

impl Serialize for ConfigValue {
    /// Secrets serialize as a single-key `{"$secret": ...}` mapping so they
    /// stay distinguishable in serialized plans.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigValue::Null => serializer.serialize_unit(),
            ConfigValue::Bool(b) => serializer.serialize_bool(*b),
            ConfigValue::Integer(i) => serializer.serialize_i64(*i),
            ConfigValue::Float(f) => serializer.serialize_f64(*f),
            ConfigValue::String(s) => serializer.serialize_str(s),
            ConfigValue::List(items) => serializer.collect_seq(items),
            ConfigValue::Map(map) => serializer.collect_map(map),
            ConfigValue::Secret(inner) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$secret", inner.as_ref())?;
                map.end()
            }
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        ConfigValue::from_json(&value)
    }
}
