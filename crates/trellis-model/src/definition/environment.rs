use serde::{Deserialize, Serialize};

use super::{de_opt_scalar_string, decode};
use crate::entity::Entity;
use crate::error::ModelError;

/// Deployment-target configuration: settings that apply to every service
/// plus per-service override blocks under `config.services`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl EnvironmentDefinition {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        decode("Environment", entity)
    }

    /// Environment-wide settings, the per-service block stripped.
    pub fn global_config(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut config = self.config.clone();
        config.remove("services");
        config
    }

    /// The override block for one service, when present.
    pub fn service_config(&self, service: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.config
            .get("services")?
            .as_object()?
            .get(service)?
            .as_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn environment() -> EnvironmentDefinition {
        let entity = Entity::from_document(
            json!({
                "kind": "Environment",
                "name": "production",
                "config": {
                    "public_dns": "blog.example.com",
                    "services": {
                        "ghost": {
                            "environment": [{"name": "url", "value": "https://blog.example.com"}]
                        }
                    }
                }
            }),
            "environment.yaml",
        )
        .expect("valid doc");
        EnvironmentDefinition::from_entity(&entity).expect("decodes")
    }

    #[test]
    fn test_global_config_strips_service_block() {
        let definition = environment();
        let global = definition.global_config();
        assert_eq!(global.get("public_dns"), Some(&json!("blog.example.com")));
        assert!(!global.contains_key("services"));
    }

    #[test]
    fn test_service_config_lookup() {
        let definition = environment();
        let ghost = definition.service_config("ghost").expect("ghost block");
        assert!(ghost.contains_key("environment"));
        assert!(definition.service_config("db").is_none());
    }
}
