use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use trellis_model::definition::split_endpoint_ref;
use trellis_model::{
    merge_maps, AddressDefinition, ComponentDefinition, ConfigMap, ConfigValue,
    EndpointDefinition, Entity, EnvEntry, ExposedEndpoint, FileDirective, GraphDefinition,
    ModelError, PortDefinition, ServiceSpec, Store,
};

use crate::error::{issue_codes, PlanError, PlanIssue};

/// A connection point of a built service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub name: String,
    /// Owning service instance
    #[serde(skip)]
    pub service: String,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_version: Option<String>,
    pub role: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<AddressDefinition>,
    /// Variables required once this endpoint takes part in a relation
    #[serde(skip)]
    pub environment: Vec<EnvEntry>,
    /// Fallback values for provided variables. For promoted endpoints this
    /// carries the embedded graph's own configuration layers.
    #[serde(skip)]
    pub defaults: ConfigMap,
}

impl Endpoint {
    pub fn qual_name(&self) -> String {
        format!("{}:{}", self.service, self.name)
    }
}

/// A service instance with its component (or embedded graph) resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub name: String,
    /// Name of the backing component or graph
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Absent for services backed by an embedded graph
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub replicas: u32,
    pub endpoints: Vec<Endpoint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<String>,
    #[serde(skip)]
    pub files: Vec<FileDirective>,
    #[serde(skip)]
    pub storage: Option<serde_json::Value>,
    #[serde(skip)]
    pub probes: Option<serde_json::Value>,
    #[serde(skip)]
    pub component_config: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub component_environment: Vec<EnvEntry>,
    #[serde(skip)]
    pub spec_config: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub spec_environment: Vec<EnvEntry>,
    /// True when the service embeds another graph
    pub embedded: bool,
}

impl Service {
    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    /// All ports across the service's endpoints, deduplicated and sorted.
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

/// A qualified reference to one endpoint of one service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EndpointRef {
    pub service: String,
    pub endpoint: String,
}

impl EndpointRef {
    pub fn qual_name(&self) -> String {
        format!("{}:{}", self.service, self.endpoint)
    }
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.endpoint)
    }
}

/// A declared connection between endpoints speaking the same interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relation {
    pub interface: String,
    pub endpoints: Vec<EndpointRef>,
}

impl Relation {
    /// Relation name: the endpoint references joined with `=`, in
    /// declaration order.
    pub fn name(&self) -> String {
        relation_name(&self.endpoints)
    }
}

fn relation_name(endpoints: &[EndpointRef]) -> String {
    endpoints
        .iter()
        .map(EndpointRef::qual_name)
        .collect::<Vec<_>>()
        .join("=")
}

/// A built deployment graph: services resolved against the store and
/// relations checked against the services' endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Graph {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub services: BTreeMap<String, Service>,
    pub relations: Vec<Relation>,
}

impl Graph {
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn endpoint(&self, reference: &EndpointRef) -> Option<&Endpoint> {
        self.services
            .get(&reference.service)?
            .endpoint(&reference.endpoint)
    }

    /// Relations a service takes part in, in declaration order.
    pub fn relations_of(&self, service: &str) -> Vec<&Relation> {
        self.relations
            .iter()
            .filter(|relation| {
                relation
                    .endpoints
                    .iter()
                    .any(|endpoint| endpoint.service == service)
            })
            .collect()
    }
}

/// Builds the graph for a definition, resolving every service against the
/// store. All structural problems are collected before failing.
pub(crate) fn build(definition: &GraphDefinition, store: &Store) -> Result<Graph, PlanError> {
    let mut issues = Vec::new();
    let mut services = BTreeMap::new();

    for spec in &definition.services {
        if services.contains_key(&spec.name) {
            issues.push(PlanIssue::for_subject(
                issue_codes::DUPLICATE_SERVICE,
                &definition.name,
                format!("service '{}' is declared more than once", spec.name),
            ));
            continue;
        }
        match build_service(definition, spec, store) {
            Ok(service) => {
                debug!(
                    service = %service.name,
                    component = %service.component,
                    embedded = service.embedded,
                    "service materialized"
                );
                services.insert(spec.name.clone(), service);
            }
            Err(mut found) => issues.append(&mut found),
        }
    }

    let mut relations = Vec::new();
    for entry in &definition.relations {
        match build_relation(entry, &services) {
            Ok(relation) => {
                debug!(relation = %relation.name(), interface = %relation.interface, "relation wired");
                relations.push(relation);
            }
            Err(mut found) => issues.append(&mut found),
        }
    }

    if !issues.is_empty() {
        return Err(PlanError::from_issues(issues));
    }

    debug!(
        graph = %definition.name,
        services = services.len(),
        relations = relations.len(),
        "graph built"
    );
    Ok(Graph {
        name: definition.name.clone(),
        version: definition.version.clone(),
        services,
        relations,
    })
}

fn build_service(
    definition: &GraphDefinition,
    spec: &ServiceSpec,
    store: &Store,
) -> Result<Service, Vec<PlanIssue>> {
    let component_name = spec.component_name();
    match store.resolve("Component", component_name, spec.version.as_deref()) {
        Ok(entity) => build_component_service(spec, &entity),
        Err(ModelError::EntityNotFound { .. }) => {
            // No component of that name; an embedded graph may satisfy it.
            match store.resolve("Graph", component_name, spec.version.as_deref()) {
                Ok(graph_entity) => {
                    let mut chain = vec![definition.name.clone()];
                    build_embedded_service(spec, &graph_entity, store, &mut chain)
                }
                Err(ModelError::EntityNotFound { .. }) => {
                    Err(vec![PlanIssue::for_subject(
                        issue_codes::COMPONENT_RESOLUTION,
                        &spec.name,
                        format!(
                            "no Component or Graph named '{}' satisfies service '{}'",
                            component_name, spec.name
                        ),
                    )])
                }
                Err(other) => Err(vec![PlanIssue::for_subject(
                    issue_codes::COMPONENT_RESOLUTION,
                    &spec.name,
                    other.to_string(),
                )]),
            }
        }
        Err(other) => Err(vec![PlanIssue::for_subject(
            issue_codes::COMPONENT_RESOLUTION,
            &spec.name,
            other.to_string(),
        )]),
    }
}

fn build_component_service(spec: &ServiceSpec, entity: &Entity) -> Result<Service, Vec<PlanIssue>> {
    let component = ComponentDefinition::from_entity(entity).map_err(|error| {
        vec![PlanIssue::for_subject(
            issue_codes::COMPONENT_RESOLUTION,
            &spec.name,
            error.to_string(),
        )]
    })?;

    let endpoints: Vec<Endpoint> = component
        .endpoints
        .iter()
        .map(|endpoint| build_endpoint(&spec.name, None, endpoint, ConfigMap::new()))
        .collect();

    let mut issues = check_duplicate_endpoints(&spec.name, &endpoints);
    issues.extend(check_expose(&spec.name, &spec.expose, &endpoints));
    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(Service {
        name: spec.name.clone(),
        component: component.name.clone(),
        version: entity.version.clone(),
        image: Some(component.image.clone()),
        replicas: spec.replicas.unwrap_or(component.replicas),
        endpoints,
        expose: spec.expose.clone(),
        files: component.files.clone(),
        storage: component.storage.clone(),
        probes: component.probes.clone(),
        component_config: component.config.clone(),
        component_environment: component.environment.clone(),
        spec_config: spec.config.clone(),
        spec_environment: spec.environment.clone(),
        embedded: false,
    })
}

fn build_embedded_service(
    spec: &ServiceSpec,
    graph_entity: &Entity,
    store: &Store,
    chain: &mut Vec<String>,
) -> Result<Service, Vec<PlanIssue>> {
    let inner = GraphDefinition::from_entity(graph_entity).map_err(|error| {
        vec![PlanIssue::for_subject(
            issue_codes::COMPONENT_RESOLUTION,
            &spec.name,
            error.to_string(),
        )]
    })?;

    if chain.contains(&inner.name) {
        let mut cycle = chain.clone();
        cycle.push(inner.name.clone());
        return Err(vec![PlanIssue::for_subject(
            issue_codes::CYCLIC_REFERENCE,
            &spec.name,
            format!("graph embedding cycle: {}", cycle.join(" -> ")),
        )]);
    }
    chain.push(inner.name.clone());

    let mut issues = Vec::new();
    let mut endpoints = Vec::new();
    for exposed in &inner.expose {
        match resolve_promoted_endpoint(&inner, exposed, store, chain) {
            Ok((definition, defaults)) => {
                let mut endpoint =
                    build_endpoint(&spec.name, Some(exposed.promoted_name()), &definition, defaults);
                // A promoted endpoint is addressed by its promoted name.
                endpoint.name = exposed.promoted_name().to_string();
                endpoints.push(endpoint);
            }
            Err(issue) => issues.push(issue),
        }
    }
    chain.pop();

    issues.extend(check_duplicate_endpoints(&spec.name, &endpoints));
    issues.extend(check_expose(&spec.name, &spec.expose, &endpoints));
    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(Service {
        name: spec.name.clone(),
        component: inner.name.clone(),
        version: graph_entity.version.clone(),
        image: None,
        replicas: spec.replicas.unwrap_or(1),
        endpoints,
        expose: spec.expose.clone(),
        files: Vec::new(),
        storage: None,
        probes: None,
        component_config: serde_json::Map::new(),
        component_environment: Vec::new(),
        spec_config: spec.config.clone(),
        spec_environment: spec.environment.clone(),
        embedded: true,
    })
}

/// Follows an exposed endpoint down to the component endpoint backing it,
/// accumulating the configuration defaults of every traversed layer. The
/// nearest layer wins.
fn resolve_promoted_endpoint(
    graph_def: &GraphDefinition,
    exposed: &ExposedEndpoint,
    store: &Store,
    chain: &mut Vec<String>,
) -> Result<(EndpointDefinition, ConfigMap), PlanIssue> {
    let target = exposed.target();
    let (service_name, endpoint_name) = split_endpoint_ref(target).ok_or_else(|| {
        PlanIssue::for_subject(
            issue_codes::INVALID_REFERENCE,
            &graph_def.name,
            format!(
                "exposed endpoint '{}' is not of the form service:endpoint",
                target
            ),
        )
    })?;
    let inner_spec = graph_def.service(service_name).ok_or_else(|| {
        PlanIssue::for_subject(
            issue_codes::INVALID_REFERENCE,
            &graph_def.name,
            format!(
                "exposed endpoint '{}' names unknown service '{}'",
                target, service_name
            ),
        )
    })?;

    let component_name = inner_spec.component_name();
    match store.resolve("Component", component_name, inner_spec.version.as_deref()) {
        Ok(entity) => {
            let component = ComponentDefinition::from_entity(&entity).map_err(|error| {
                PlanIssue::for_subject(
                    issue_codes::COMPONENT_RESOLUTION,
                    &graph_def.name,
                    error.to_string(),
                )
            })?;
            let definition = component.endpoint(endpoint_name).cloned().ok_or_else(|| {
                PlanIssue::for_subject(
                    issue_codes::INVALID_REFERENCE,
                    &graph_def.name,
                    format!(
                        "component '{}' has no endpoint '{}' to expose",
                        component_name, endpoint_name
                    ),
                )
            })?;
            let mut defaults = ConfigValue::map_from_json(&component.config);
            merge_maps(&mut defaults, &ConfigValue::map_from_json(&inner_spec.config));
            Ok((definition, defaults))
        }
        Err(ModelError::EntityNotFound { .. }) => {
            let nested_entity = store
                .resolve("Graph", component_name, inner_spec.version.as_deref())
                .map_err(|_| {
                    PlanIssue::for_subject(
                        issue_codes::COMPONENT_RESOLUTION,
                        &graph_def.name,
                        format!(
                            "no Component or Graph named '{}' backs exposed endpoint '{}'",
                            component_name, target
                        ),
                    )
                })?;
            let nested = GraphDefinition::from_entity(&nested_entity).map_err(|error| {
                PlanIssue::for_subject(
                    issue_codes::COMPONENT_RESOLUTION,
                    &graph_def.name,
                    error.to_string(),
                )
            })?;
            if chain.contains(&nested.name) {
                let mut cycle = chain.clone();
                cycle.push(nested.name.clone());
                return Err(PlanIssue::for_subject(
                    issue_codes::CYCLIC_REFERENCE,
                    &graph_def.name,
                    format!("graph embedding cycle: {}", cycle.join(" -> ")),
                ));
            }
            let nested_exposed = nested
                .expose
                .iter()
                .find(|candidate| candidate.promoted_name() == endpoint_name)
                .ok_or_else(|| {
                    PlanIssue::for_subject(
                        issue_codes::INVALID_REFERENCE,
                        &graph_def.name,
                        format!(
                            "graph '{}' promotes no endpoint named '{}'",
                            nested.name, endpoint_name
                        ),
                    )
                })?;
            chain.push(nested.name.clone());
            let resolved = resolve_promoted_endpoint(&nested, nested_exposed, store, chain);
            chain.pop();
            let (definition, mut defaults) = resolved?;
            merge_maps(&mut defaults, &ConfigValue::map_from_json(&inner_spec.config));
            Ok((definition, defaults))
        }
        Err(other) => Err(PlanIssue::for_subject(
            issue_codes::COMPONENT_RESOLUTION,
            &graph_def.name,
            other.to_string(),
        )),
    }
}

fn build_endpoint(
    service: &str,
    promoted_name: Option<&str>,
    definition: &EndpointDefinition,
    defaults: ConfigMap,
) -> Endpoint {
    Endpoint {
        name: promoted_name.unwrap_or(&definition.name).to_string(),
        service: service.to_string(),
        interface: definition.interface.clone(),
        interface_version: definition.interface_version.clone(),
        role: definition.role.clone(),
        addresses: definition.addresses.clone(),
        environment: definition.environment.clone(),
        defaults,
    }
}

fn check_duplicate_endpoints(service: &str, endpoints: &[Endpoint]) -> Vec<PlanIssue> {
    let mut seen = BTreeSet::new();
    let mut issues = Vec::new();
    for endpoint in endpoints {
        if !seen.insert(endpoint.name.as_str()) {
            issues.push(PlanIssue::for_subject(
                issue_codes::INVALID_REFERENCE,
                service,
                format!(
                    "service '{}' carries endpoint '{}' more than once",
                    service, endpoint.name
                ),
            ));
        }
    }
    issues
}

fn check_expose(service: &str, expose: &[String], endpoints: &[Endpoint]) -> Vec<PlanIssue> {
    expose
        .iter()
        .filter(|name| !endpoints.iter().any(|endpoint| &endpoint.name == *name))
        .map(|name| {
            PlanIssue::for_subject(
                issue_codes::INVALID_REFERENCE,
                service,
                format!("cannot expose unknown endpoint '{}' of service '{}'", name, service),
            )
        })
        .collect()
}

fn build_relation(
    entry: &[String],
    services: &BTreeMap<String, Service>,
) -> Result<Relation, Vec<PlanIssue>> {
    let mut issues = Vec::new();
    let mut refs = Vec::new();
    let mut interfaces = BTreeSet::new();

    for reference in entry {
        let (service_name, endpoint_name) = match split_endpoint_ref(reference) {
            Some(parts) => parts,
            None => {
                issues.push(PlanIssue::new(
                    issue_codes::INVALID_REFERENCE,
                    format!(
                        "relation endpoint '{}' is not of the form service:endpoint",
                        reference
                    ),
                ));
                continue;
            }
        };
        let service = match services.get(service_name) {
            Some(service) => service,
            None => {
                issues.push(PlanIssue::new(
                    issue_codes::INVALID_REFERENCE,
                    format!("relation references unknown service '{}'", service_name),
                ));
                continue;
            }
        };
        match service.endpoint(endpoint_name) {
            Some(endpoint) => {
                interfaces.insert(endpoint.interface.clone());
                refs.push(EndpointRef {
                    service: service_name.to_string(),
                    endpoint: endpoint_name.to_string(),
                });
            }
            None => {
                let message = if service.embedded {
                    let promoted: Vec<&str> = service
                        .endpoints
                        .iter()
                        .map(|endpoint| endpoint.name.as_str())
                        .collect();
                    format!(
                        "service '{}' promotes no endpoint '{}' (promoted endpoints: [{}])",
                        service_name,
                        endpoint_name,
                        promoted.join(", ")
                    )
                } else {
                    format!(
                        "service '{}' has no endpoint '{}'",
                        service_name, endpoint_name
                    )
                };
                issues.push(PlanIssue::new(issue_codes::INVALID_REFERENCE, message));
            }
        }
    }

    if issues.is_empty() && refs.len() < 2 {
        issues.push(PlanIssue::for_subject(
            issue_codes::INVALID_REFERENCE,
            relation_name(&refs),
            "a relation needs at least two endpoints",
        ));
    }
    if interfaces.len() > 1 {
        issues.push(PlanIssue::for_subject(
            issue_codes::ROLE_MISMATCH,
            relation_name(&refs),
            format!(
                "relation endpoints speak different interfaces: [{}]",
                interfaces.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        ));
    }
    if !issues.is_empty() {
        return Err(issues);
    }

    let interface = interfaces
        .into_iter()
        .next()
        .unwrap_or_else(|| "unknown".to_string());
    Ok(Relation {
        interface,
        endpoints: refs,
    })
}
