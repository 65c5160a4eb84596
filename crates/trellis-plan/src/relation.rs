use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use trellis_model::{ConfigMap, ConfigValue, InterfaceRegistry, RoleCardinality};

use crate::error::{issue_codes, PlanIssue};
use crate::graph::{Endpoint, EndpointRef, Graph};

/// A relation with its interface resolved, roles checked, and every variable
/// exchanged between the endpoints pinned to a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRelation {
    pub name: String,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_version: Option<String>,
    pub endpoints: Vec<ResolvedEndpoint>,
}

impl ResolvedRelation {
    pub fn involves(&self, service: &str) -> bool {
        self.endpoints
            .iter()
            .any(|endpoint| endpoint.service == service)
    }

    pub fn endpoints_of(&self, service: &str) -> Vec<&ResolvedEndpoint> {
        self.endpoints
            .iter()
            .filter(|endpoint| endpoint.service == service)
            .collect()
    }
}

/// One side of a resolved relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedEndpoint {
    pub service: String,
    pub endpoint: String,
    pub role: String,
    /// Values this endpoint publishes to its peers
    pub provided: ConfigMap,
    /// Values this endpoint consumes, bound to their sources
    pub uses: ConfigMap,
}

impl ResolvedEndpoint {
    pub fn qual_name(&self) -> String {
        format!("{}:{}", self.service, self.endpoint)
    }
}

/// Resolves every relation of the graph against the interface registry and
/// the services' base configuration.
///
/// The provider snapshot of an endpoint is computed once and shared by every
/// consumer. A provided variable takes its value from the owning service's
/// configuration first (a top-level key, or one nested under the endpoint's
/// name), then from the endpoint's carried defaults, then from the interface
/// default.
pub(crate) fn resolve_relations(
    graph: &Graph,
    interfaces: &InterfaceRegistry,
    bases: &BTreeMap<String, ConfigMap>,
) -> (Vec<ResolvedRelation>, Vec<PlanIssue>) {
    let mut resolved = Vec::new();
    let mut issues = Vec::new();

    for relation in &graph.relations {
        let name = relation.name();

        let mut participants: Vec<(&EndpointRef, &Endpoint)> = Vec::new();
        for reference in &relation.endpoints {
            match graph.endpoint(reference) {
                Some(endpoint) => participants.push((reference, endpoint)),
                None => issues.push(PlanIssue::for_subject(
                    issue_codes::INVALID_REFERENCE,
                    &name,
                    format!("endpoint {} is missing from the graph", reference),
                )),
            }
        }
        if participants.len() != relation.endpoints.len() {
            continue;
        }

        // Pinned interface versions must agree across the relation.
        let versions: BTreeSet<&str> = participants
            .iter()
            .filter_map(|(_, endpoint)| endpoint.interface_version.as_deref())
            .collect();
        if versions.len() > 1 {
            issues.push(PlanIssue::for_subject(
                issue_codes::ROLE_MISMATCH,
                &name,
                format!(
                    "endpoints pin different versions of interface '{}': [{}]",
                    relation.interface,
                    versions.into_iter().collect::<Vec<_>>().join(", ")
                ),
            ));
            continue;
        }
        let version = versions.into_iter().next();

        let interface = match interfaces.resolve(&relation.interface, version) {
            Ok(interface) => interface,
            Err(error) => {
                issues.push(PlanIssue::for_subject(
                    issue_codes::UNKNOWN_INTERFACE,
                    &name,
                    error.to_string(),
                ));
                continue;
            }
        };

        // Every endpoint must fill a declared role.
        let mut role_issues = Vec::new();
        let mut roles = Vec::new();
        for (reference, endpoint) in &participants {
            match interface.role(&endpoint.role) {
                Some(role) => roles.push(role),
                None => role_issues.push(PlanIssue::for_subject(
                    issue_codes::ROLE_MISMATCH,
                    &name,
                    format!(
                        "endpoint {} fills role '{}' which interface '{}' does not declare",
                        reference, endpoint.role, interface.name
                    ),
                )),
            }
        }
        if !role_issues.is_empty() {
            issues.append(&mut role_issues);
            continue;
        }

        // Every declared role must be represented, respecting cardinality.
        let mut shape_issues = Vec::new();
        for (role_name, role) in &interface.roles {
            let count = participants
                .iter()
                .filter(|(_, endpoint)| &endpoint.role == role_name)
                .count();
            if count == 0 {
                shape_issues.push(PlanIssue::for_subject(
                    issue_codes::ROLE_MISMATCH,
                    &name,
                    format!(
                        "role '{}' of interface '{}' is not filled by any endpoint",
                        role_name, interface.name
                    ),
                ));
            } else if role.cardinality == RoleCardinality::One && count > 1 {
                shape_issues.push(PlanIssue::for_subject(
                    issue_codes::ROLE_MISMATCH,
                    &name,
                    format!(
                        "role '{}' of interface '{}' admits a single endpoint, {} given",
                        role_name, interface.name, count
                    ),
                ));
            }
        }
        if !shape_issues.is_empty() {
            issues.append(&mut shape_issues);
            continue;
        }

        // Provider snapshots, one per endpoint.
        let mut value_issues = Vec::new();
        let mut snapshots: Vec<ConfigMap> = Vec::with_capacity(participants.len());
        for ((reference, endpoint), role) in participants.iter().zip(&roles) {
            let base = bases.get(&reference.service);
            let block = base
                .and_then(|base| base.get(endpoint.name.as_str()))
                .and_then(ConfigValue::as_map);
            let mut provided = ConfigMap::new();
            for variable in &role.provides {
                let value = base
                    .and_then(|base| base.get(&variable.name))
                    .or_else(|| block.and_then(|block| block.get(&variable.name)))
                    .cloned()
                    .or_else(|| endpoint.defaults.get(&variable.name).cloned())
                    .or_else(|| variable.default.as_ref().map(ConfigValue::from_json));
                match value {
                    Some(value) => {
                        let value = if variable.secret {
                            value.into_secret()
                        } else {
                            value
                        };
                        provided.insert(variable.name.clone(), value);
                    }
                    None => value_issues.push(PlanIssue::for_subject(
                        issue_codes::RELATION_UNSATISFIED,
                        &name,
                        format!(
                            "provided variable '{}' of role '{}' at {} has no value and no default",
                            variable.name, endpoint.role, reference
                        ),
                    )),
                }
            }
            snapshots.push(provided);
        }

        // Bind each endpoint's uses list against the other sides.
        let mut uses_maps: Vec<ConfigMap> = Vec::with_capacity(participants.len());
        for (i, ((reference, endpoint), role)) in participants.iter().zip(&roles).enumerate() {
            let mut uses = ConfigMap::new();
            for variable in &role.uses {
                let providers: Vec<usize> = (0..participants.len())
                    .filter(|j| *j != i && roles[*j].provides_var(variable))
                    .collect();
                match providers.len() {
                    1 => {
                        // A missing snapshot value was already reported above.
                        if let Some(value) = snapshots[providers[0]].get(variable) {
                            uses.insert(variable.clone(), value.clone());
                        }
                    }
                    0 => {
                        let base = bases.get(&reference.service);
                        let fallback = base
                            .and_then(|base| base.get(variable))
                            .or_else(|| {
                                base.and_then(|base| base.get(endpoint.name.as_str()))
                                    .and_then(ConfigValue::as_map)
                                    .and_then(|block| block.get(variable))
                            })
                            .cloned()
                            .or_else(|| endpoint.defaults.get(variable).cloned());
                        match fallback {
                            Some(value) => {
                                uses.insert(variable.clone(), value);
                            }
                            None => value_issues.push(PlanIssue::for_subject(
                                issue_codes::RELATION_UNSATISFIED,
                                &name,
                                format!(
                                    "variable '{}' used by {} has no provider in the relation and no configured value",
                                    variable, reference
                                ),
                            )),
                        }
                    }
                    _ => value_issues.push(PlanIssue::for_subject(
                        issue_codes::ROLE_MISMATCH,
                        &name,
                        format!(
                            "variable '{}' used by {} is provided by {} endpoints; the pairing is ambiguous",
                            variable,
                            reference,
                            providers.len()
                        ),
                    )),
                }
            }
            uses_maps.push(uses);
        }

        if !value_issues.is_empty() {
            issues.append(&mut value_issues);
            continue;
        }

        let mut endpoints = Vec::with_capacity(participants.len());
        for (i, (reference, endpoint)) in participants.iter().enumerate() {
            endpoints.push(ResolvedEndpoint {
                service: reference.service.clone(),
                endpoint: reference.endpoint.clone(),
                role: endpoint.role.clone(),
                provided: std::mem::take(&mut snapshots[i]),
                uses: std::mem::take(&mut uses_maps[i]),
            });
        }
        debug!(relation = %name, interface = %interface.name, "relation resolved");
        resolved.push(ResolvedRelation {
            name,
            interface: interface.name.clone(),
            interface_version: interface.version.clone(),
            endpoints,
        });
    }

    (resolved, issues)
}
