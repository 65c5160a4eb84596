use serde::{Deserialize, Serialize};

use super::{de_opt_scalar_string, decode, EnvEntry};
use crate::entity::Entity;
use crate::error::ModelError;

/// A composition of services plus the relations wiring them together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Each relation lists the qualified endpoints (`service:endpoint`)
    /// taking part in it.
    #[serde(default)]
    pub relations: Vec<Vec<String>>,
    /// Endpoints this graph promotes when it is embedded in another graph.
    #[serde(default)]
    pub expose: Vec<ExposedEndpoint>,
}

impl GraphDefinition {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        decode("Graph", entity)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.name == name)
    }
}

/// One service instance within a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Referenced component (or graph). Defaults to the instance name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Instance-level configuration overrides.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub environment: Vec<EnvEntry>,
    /// Endpoints to expose outside the deployment, by endpoint name.
    #[serde(default)]
    pub expose: Vec<String>,
}

impl ServiceSpec {
    pub fn component_name(&self) -> &str {
        self.component.as_deref().unwrap_or(&self.name)
    }
}

/// An endpoint a graph makes addressable from an enclosing graph, either as
/// a bare `service:endpoint` reference or with an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposedEndpoint {
    Reference(String),
    Aliased {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        target: String,
    },
}

impl ExposedEndpoint {
    pub fn target(&self) -> &str {
        match self {
            ExposedEndpoint::Reference(target) => target,
            ExposedEndpoint::Aliased { target, .. } => target,
        }
    }

    /// Promoted endpoint name: the alias when given, the target's endpoint
    /// part otherwise.
    pub fn promoted_name(&self) -> &str {
        let alias = match self {
            ExposedEndpoint::Aliased {
                name: Some(name), ..
            } => Some(name.as_str()),
            _ => None,
        };
        alias.unwrap_or_else(|| {
            split_endpoint_ref(self.target())
                .map(|(_, endpoint)| endpoint)
                .unwrap_or_else(|| self.target())
        })
    }
}

/// Splits a `service:endpoint` reference into its parts.
pub fn split_endpoint_ref(reference: &str) -> Option<(&str, &str)> {
    let (service, endpoint) = reference.split_once(':')?;
    if service.is_empty() || endpoint.is_empty() || endpoint.contains(':') {
        return None;
    }
    Some((service, endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph(data: serde_json::Value) -> GraphDefinition {
        let entity = Entity::from_document(data, "graph.yaml").expect("valid doc");
        GraphDefinition::from_entity(&entity).expect("decodes")
    }

    #[test]
    fn test_decode_graph() {
        let definition = graph(json!({
            "kind": "Graph",
            "name": "blog",
            "services": [
                {"name": "db", "component": "mysql", "version": "5.7"},
                {"name": "ghost", "config": {"url": "http://blog"}}
            ],
            "relations": [["db:db", "ghost:db"]]
        }));
        assert_eq!(definition.services.len(), 2);
        assert_eq!(definition.services[0].component_name(), "mysql");
        // Component reference falls back to the instance name.
        assert_eq!(definition.services[1].component_name(), "ghost");
        assert_eq!(definition.relations, vec![vec!["db:db", "ghost:db"]]);
        assert!(definition.service("db").is_some());
        assert!(definition.service("cache").is_none());
    }

    #[test]
    fn test_decode_expose_forms() {
        let definition = graph(json!({
            "kind": "Graph",
            "name": "blog",
            "services": [{"name": "ghost"}],
            "expose": [
                "ghost:www",
                {"name": "web", "target": "ghost:admin"},
                {"target": "ghost:metrics"}
            ]
        }));
        let promoted: Vec<(&str, &str)> = definition
            .expose
            .iter()
            .map(|exposed| (exposed.promoted_name(), exposed.target()))
            .collect();
        assert_eq!(
            promoted,
            vec![
                ("www", "ghost:www"),
                ("web", "ghost:admin"),
                ("metrics", "ghost:metrics")
            ]
        );
    }

    #[test]
    fn test_split_endpoint_ref() {
        assert_eq!(split_endpoint_ref("db:db"), Some(("db", "db")));
        assert_eq!(split_endpoint_ref("ghost:www"), Some(("ghost", "www")));
        assert_eq!(split_endpoint_ref("no-colon"), None);
        assert_eq!(split_endpoint_ref(":endpoint"), None);
        assert_eq!(split_endpoint_ref("service:"), None);
        assert_eq!(split_endpoint_ref("a:b:c"), None);
    }
}
