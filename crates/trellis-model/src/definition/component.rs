use serde::{Deserialize, Serialize};

use super::{de_opt_scalar_string, decode, EnvEntry};
use crate::entity::Entity;
use crate::error::ModelError;

/// A deployable unit: a container image plus the configuration, endpoints,
/// and runtime requirements it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub version: Option<String>,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
    /// Component-level configuration defaults.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Environment variables the component requires or presets.
    #[serde(default)]
    pub environment: Vec<EnvEntry>,
    /// Configuration files to render into the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDirective>,
    /// Passed through to the runtime untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<serde_json::Value>,
}

fn default_replicas() -> u32 {
    1
}

impl ComponentDefinition {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        decode("Component", entity)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointDefinition> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    /// All ports across all endpoints, deduplicated and sorted.
    pub fn ports(&self) -> Vec<PortDefinition> {
        let mut ports: Vec<PortDefinition> = Vec::new();
        for endpoint in &self.endpoints {
            for address in &endpoint.addresses {
                for port in &address.ports {
                    if !ports
                        .iter()
                        .any(|seen| seen.port == port.port && seen.protocol == port.protocol)
                    {
                        ports.push(port.clone());
                    }
                }
            }
        }
        ports.sort_by(|a, b| (a.port, &a.protocol).cmp(&(b.port, &b.protocol)));
        ports
    }
}

/// A named connection point implementing one role of an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub name: String,
    pub interface: String,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub interface_version: Option<String>,
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<AddressDefinition>,
    /// Variables only required when this endpoint takes part in a relation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvEntry>,
}

/// A network address an endpoint listens on or connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// A template to render and mount into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDirective {
    /// Template reference, e.g. `file://mysql.cnf.tmpl`.
    pub template: String,
    pub container_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn component(data: serde_json::Value) -> ComponentDefinition {
        let entity = Entity::from_document(data, "component.yaml").expect("valid doc");
        ComponentDefinition::from_entity(&entity).expect("decodes")
    }

    #[test]
    fn test_decode_applies_defaults() {
        let definition = component(json!({
            "kind": "Component",
            "name": "mysql",
            "image": "mysql:5.7"
        }));
        assert_eq!(definition.replicas, 1);
        assert!(definition.endpoints.is_empty());
        assert!(definition.config.is_empty());
    }

    #[test]
    fn test_decode_full_component() {
        let definition = component(json!({
            "kind": "Component",
            "name": "mysql",
            "version": 5.7,
            "image": "mysql:5.7",
            "replicas": 2,
            "config": {"database": "mysql"},
            "environment": [
                {"name": "MYSQL_ROOT_PASSWORD"},
                {"name": "MYSQL_DATABASE", "value": "mysql"}
            ],
            "endpoints": [{
                "name": "db",
                "interface": "mysql-database",
                "role": "server",
                "addresses": [{"ports": [{"port": 3306}]}]
            }],
            "files": [{"template": "file://my.cnf.tmpl", "container_path": "/etc/mysql/my.cnf"}]
        }));
        assert_eq!(definition.version.as_deref(), Some("5.7"));
        assert_eq!(definition.environment[0].value, None);
        assert_eq!(definition.environment[1].value, Some(json!("mysql")));

        let endpoint = definition.endpoint("db").expect("endpoint exists");
        assert_eq!(endpoint.role, "server");
        assert_eq!(endpoint.addresses[0].ports[0].port, 3306);
        assert_eq!(endpoint.addresses[0].ports[0].protocol, "TCP");
        assert!(definition.endpoint("missing").is_none());
    }

    #[test]
    fn test_ports_are_deduplicated_and_sorted() {
        let definition = component(json!({
            "kind": "Component",
            "name": "web",
            "image": "web",
            "endpoints": [
                {
                    "name": "https",
                    "interface": "http",
                    "role": "server",
                    "addresses": [{"ports": [{"port": 443}]}]
                },
                {
                    "name": "http",
                    "interface": "http",
                    "role": "server",
                    "addresses": [{"ports": [{"port": 80}, {"port": 443}]}]
                }
            ]
        }));
        let ports: Vec<u16> = definition.ports().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![80, 443]);
    }

    #[test]
    fn test_missing_image_fails_decode() {
        let entity = Entity::from_document(
            json!({"kind": "Component", "name": "broken"}),
            "component.yaml",
        )
        .expect("valid doc");
        let err = ComponentDefinition::from_entity(&entity).unwrap_err();
        assert_eq!(err.error_code(), "ERR_MODEL_DEFINITION");
        assert!(err.to_string().contains("broken"), "got: {}", err);
    }
}
