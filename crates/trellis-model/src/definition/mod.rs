//! Typed views over model documents.
//!
//! Documents live in the [`Store`](crate::Store) as raw data so schema
//! validation and error reporting can see every field. The types in this
//! module decode that data into the structured form the planner works with.

mod component;
mod environment;
mod graph;
mod interface;

pub use component::{
    AddressDefinition, ComponentDefinition, EndpointDefinition, FileDirective, PortDefinition,
};
pub use environment::EnvironmentDefinition;
pub use graph::{split_endpoint_ref, ExposedEndpoint, GraphDefinition, ServiceSpec};
pub use interface::{
    InterfaceDefinition, InterfaceRegistry, ProvidedVariable, RoleCardinality, RoleDefinition,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::entity::{scalar_to_string, Entity};
use crate::error::ModelError;

/// An environment variable requirement or assignment.
///
/// Entries without a value declare a variable that some later layer must
/// supply; entries with a value assign it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Decodes an entity into its typed definition.
pub(crate) fn decode<T: DeserializeOwned>(
    kind: &'static str,
    entity: &Entity,
) -> Result<T, ModelError> {
    serde_json::from_value(entity.to_value()).map_err(|error| ModelError::Definition {
        kind,
        name: entity.name.clone(),
        message: error.to_string(),
    })
}

/// Accepts `version: "5.7"` and `version: 5.7` alike.
pub(crate) fn de_opt_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => scalar_to_string(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected a string or numeric scalar")),
    }
}
