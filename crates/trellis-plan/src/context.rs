use std::collections::BTreeMap;

use serde::ser::{Serialize, Serializer};
use tracing::trace;

use trellis_model::{
    merge_maps, ConfigMap, ConfigValue, EnvEntry, EnvironmentDefinition, InterfaceRegistry,
};

use crate::error::{issue_codes, PlanIssue};
use crate::graph::{Graph, Service};
use crate::interpolate;
use crate::relation::{ResolvedEndpoint, ResolvedRelation};

/// Facts the runtime contributes at planning time, such as allocated
/// hostnames or node labels. Global facts apply to every service; facts
/// recorded for a service apply to it alone and win over global ones.
#[derive(Debug, Clone, Default)]
pub struct RuntimeFacts {
    global: serde_json::Map<String, serde_json::Value>,
    services: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl RuntimeFacts {
    pub fn new() -> Self {
        RuntimeFacts::default()
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.global.insert(key.into(), value);
    }

    pub fn set_service(&mut self, service: &str, key: impl Into<String>, value: serde_json::Value) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn global(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.global
    }

    pub fn for_service(&self, service: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.services.get(service)
    }
}

/// The fully merged configuration of one service: every layer stacked, every
/// relation view injected, every expression resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    service: String,
    data: ConfigMap,
}

impl Context {
    pub(crate) fn new(service: String, data: ConfigMap) -> Self {
        Context { service, data }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn data(&self) -> &ConfigMap {
        &self.data
    }

    /// Looks a value up by dotted path, e.g. `db_remote.provided.port`.
    pub fn get(&self, path: &str) -> Option<&ConfigValue> {
        match path.split_once('.') {
            Some((head, rest)) => self.data.get(head)?.get_path(rest),
            None => self.data.get(path),
        }
    }

    /// The value assigned to an environment variable, if any.
    pub fn env_value(&self, name: &str) -> Option<&ConfigValue> {
        let items = self.data.get("environment")?.as_list()?;
        items
            .iter()
            .filter_map(ConfigValue::as_map)
            .find(|entry| entry.get("name").and_then(ConfigValue::as_str) == Some(name))?
            .get("value")
    }

    /// All assigned environment variables in declaration order.
    pub fn environment(&self) -> Vec<(String, &ConfigValue)> {
        let mut entries = Vec::new();
        if let Some(items) = self.data.get("environment").and_then(ConfigValue::as_list) {
            for entry in items.iter().filter_map(ConfigValue::as_map) {
                if let (Some(name), Some(value)) = (
                    entry.get("name").and_then(ConfigValue::as_str),
                    entry.get("value"),
                ) {
                    entries.push((name.to_string(), value));
                }
            }
        }
        entries
    }

    /// The context as plain JSON with every secret replaced by a placeholder.
    pub fn redacted_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json_redacted()))
                .collect(),
        )
    }

    /// Every secret in the context, revealed, keyed by its dotted path.
    pub fn secrets(&self) -> BTreeMap<String, serde_json::Value> {
        let mut secrets = BTreeMap::new();
        for (key, value) in &self.data {
            collect_secrets(value, key, &mut secrets);
        }
        secrets
    }

    /// Dotted paths of every secret in the context.
    pub fn secret_paths(&self) -> Vec<String> {
        self.secrets().into_keys().collect()
    }

    /// The redacted configuration next to the revealed secrets, for
    /// emitters that route the two to different stores.
    pub fn split_secrets(&self) -> (serde_json::Value, BTreeMap<String, serde_json::Value>) {
        (self.redacted_json(), self.secrets())
    }
}

impl Serialize for Context {
    /// Serializes as the bare configuration mapping; secrets keep their
    /// `{"$secret": ...}` tagging.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(&self.data)
    }
}

fn collect_secrets(
    value: &ConfigValue,
    path: &str,
    out: &mut BTreeMap<String, serde_json::Value>,
) {
    match value {
        ConfigValue::Secret(inner) => {
            out.insert(path.to_string(), inner.to_json());
        }
        ConfigValue::Map(map) => {
            for (key, nested) in map {
                collect_secrets(nested, &format!("{}.{}", path, key), out);
            }
        }
        ConfigValue::List(items) => {
            for (index, nested) in items.iter().enumerate() {
                collect_secrets(nested, &format!("{}.{}", path, index), out);
            }
        }
        _ => {}
    }
}

/// Builds the pre-relation configuration of every service by stacking its
/// layers, lowest first:
///
/// 1. identity facts (`service` and `graph` blocks)
/// 2. component configuration and environment entries
/// 3. interface-role defaults, nested under each endpoint's name
/// 4. graph service-spec overrides
/// 5. environment configuration (global, then the per-service block)
/// 6. runtime facts (global, then per-service)
pub(crate) fn base_contexts(
    graph: &Graph,
    environment: Option<&EnvironmentDefinition>,
    facts: &RuntimeFacts,
    interfaces: &InterfaceRegistry,
) -> BTreeMap<String, ConfigMap> {
    let mut bases = BTreeMap::new();
    for (name, service) in &graph.services {
        let mut data = identity_layer(service, graph);
        merge_maps(
            &mut data,
            &config_layer(&service.component_config, &service.component_environment),
        );
        merge_maps(&mut data, &role_default_layer(service, interfaces));
        merge_maps(
            &mut data,
            &config_layer(&service.spec_config, &service.spec_environment),
        );
        if let Some(environment) = environment {
            merge_maps(&mut data, &ConfigValue::map_from_json(&environment.global_config()));
            if let Some(block) = environment.service_config(name) {
                merge_maps(&mut data, &ConfigValue::map_from_json(block));
            }
        }
        merge_maps(&mut data, &ConfigValue::map_from_json(facts.global()));
        if let Some(block) = facts.for_service(name) {
            merge_maps(&mut data, &ConfigValue::map_from_json(block));
        }
        trace!(service = %name, keys = data.len(), "base context assembled");
        bases.insert(name.clone(), data);
    }
    bases
}

fn identity_layer(service: &Service, graph: &Graph) -> ConfigMap {
    let mut meta = ConfigMap::new();
    meta.insert("name".to_string(), ConfigValue::from(service.name.clone()));
    meta.insert(
        "component".to_string(),
        ConfigValue::from(service.component.clone()),
    );
    if let Some(version) = &service.version {
        meta.insert("version".to_string(), ConfigValue::from(version.clone()));
    }
    if let Some(image) = &service.image {
        meta.insert("image".to_string(), ConfigValue::from(image.clone()));
    }
    meta.insert(
        "replicas".to_string(),
        ConfigValue::Integer(i64::from(service.replicas)),
    );

    let mut graph_meta = ConfigMap::new();
    graph_meta.insert("name".to_string(), ConfigValue::from(graph.name.clone()));
    if let Some(version) = &graph.version {
        graph_meta.insert("version".to_string(), ConfigValue::from(version.clone()));
    }

    let mut layer = ConfigMap::new();
    layer.insert("service".to_string(), ConfigValue::Map(meta));
    layer.insert("graph".to_string(), ConfigValue::Map(graph_meta));
    layer
}

fn config_layer(
    config: &serde_json::Map<String, serde_json::Value>,
    environment: &[EnvEntry],
) -> ConfigMap {
    let mut layer = ConfigValue::map_from_json(config);
    if !environment.is_empty() {
        let mut entries = ConfigMap::new();
        entries.insert("environment".to_string(), env_entries_value(environment));
        merge_maps(&mut layer, &entries);
    }
    layer
}

fn env_entries_value(entries: &[EnvEntry]) -> ConfigValue {
    ConfigValue::List(entries.iter().map(env_entry_value).collect())
}

fn env_entry_value(entry: &EnvEntry) -> ConfigValue {
    let mut map = ConfigMap::new();
    map.insert("name".to_string(), ConfigValue::from(entry.name.clone()));
    if let Some(value) = &entry.value {
        map.insert("value".to_string(), ConfigValue::from_json(value));
    }
    ConfigValue::Map(map)
}

/// Defaults that provided variables of an endpoint's role declare, nested
/// under the endpoint's name. Interfaces that cannot be resolved are skipped
/// here; relation resolution reports them when they are actually used.
fn role_default_layer(service: &Service, interfaces: &InterfaceRegistry) -> ConfigMap {
    let mut layer = ConfigMap::new();
    for endpoint in &service.endpoints {
        let interface =
            match interfaces.resolve(&endpoint.interface, endpoint.interface_version.as_deref()) {
                Ok(interface) => interface,
                Err(_) => continue,
            };
        let role = match interface.role(&endpoint.role) {
            Some(role) => role,
            None => continue,
        };
        let mut defaults = ConfigMap::new();
        for variable in &role.provides {
            if let Some(default) = &variable.default {
                let value = ConfigValue::from_json(default);
                let value = if variable.secret {
                    value.into_secret()
                } else {
                    value
                };
                defaults.insert(variable.name.clone(), value);
            }
        }
        if !defaults.is_empty() {
            layer.insert(endpoint.name.clone(), ConfigValue::Map(defaults));
        }
    }
    layer
}

#[derive(Default)]
struct EndpointViews {
    interface: String,
    role: String,
    provided: ConfigMap,
    uses: ConfigMap,
    peers: Vec<ConfigValue>,
}

/// Injects relation views, checks environment completeness, and resolves
/// expressions, turning base configurations into final contexts.
pub(crate) fn finalize_contexts(
    graph: &Graph,
    resolved: &[ResolvedRelation],
    mut bases: BTreeMap<String, ConfigMap>,
) -> (BTreeMap<String, Context>, Vec<PlanIssue>) {
    // Gather a service-endpoint's published values and peers across every
    // relation it participates in.
    let mut views: BTreeMap<(String, String), EndpointViews> = BTreeMap::new();
    for relation in resolved {
        for (i, endpoint) in relation.endpoints.iter().enumerate() {
            let entry = views
                .entry((endpoint.service.clone(), endpoint.endpoint.clone()))
                .or_default();
            entry.interface = relation.interface.clone();
            entry.role = endpoint.role.clone();
            merge_maps(&mut entry.provided, &endpoint.provided);
            merge_maps(&mut entry.uses, &endpoint.uses);
            for (j, peer) in relation.endpoints.iter().enumerate() {
                if i != j {
                    entry.peers.push(peer_view(peer, &relation.interface));
                }
            }
        }
    }

    let mut contexts = BTreeMap::new();
    let mut issues = Vec::new();
    for (name, service) in &graph.services {
        let mut data = bases.remove(name).unwrap_or_default();

        for ((view_service, endpoint_name), view) in &views {
            if view_service != name {
                continue;
            }
            // The endpoint's published values live under its bare name,
            // merged over the role defaults already present.
            let mut own = ConfigMap::new();
            own.insert(
                endpoint_name.clone(),
                ConfigValue::Map(view.provided.clone()),
            );
            merge_maps(&mut data, &own);
            data.insert(format!("{}_local", endpoint_name), local_view(endpoint_name, name, view));
            data.insert(format!("{}_remote", endpoint_name), remote_view(view));
        }

        for endpoint in &service.endpoints {
            let participates =
                views.contains_key(&(name.clone(), endpoint.name.clone()));
            if participates && !endpoint.environment.is_empty() {
                apply_env_requirements(&mut data, &endpoint.environment);
            }
        }

        issues.extend(check_required_environment(name, &data));
        issues.extend(interpolate::resolve(name, &mut data));
        contexts.insert(name.clone(), Context::new(name.clone(), data));
    }
    (contexts, issues)
}

fn peer_view(peer: &ResolvedEndpoint, interface: &str) -> ConfigValue {
    let mut view = ConfigMap::new();
    view.insert("name".to_string(), ConfigValue::from(peer.endpoint.clone()));
    view.insert(
        "service".to_string(),
        ConfigValue::from(peer.service.clone()),
    );
    view.insert("interface".to_string(), ConfigValue::from(interface));
    view.insert("role".to_string(), ConfigValue::from(peer.role.clone()));
    view.insert(
        "provided".to_string(),
        ConfigValue::Map(peer.provided.clone()),
    );
    ConfigValue::Map(view)
}

fn local_view(endpoint_name: &str, service: &str, view: &EndpointViews) -> ConfigValue {
    let mut local = ConfigMap::new();
    local.insert("name".to_string(), ConfigValue::from(endpoint_name));
    local.insert("service".to_string(), ConfigValue::from(service));
    local.insert(
        "interface".to_string(),
        ConfigValue::from(view.interface.clone()),
    );
    local.insert("role".to_string(), ConfigValue::from(view.role.clone()));
    local.insert("provided".to_string(), ConfigValue::Map(view.provided.clone()));
    local.insert("uses".to_string(), ConfigValue::Map(view.uses.clone()));
    ConfigValue::Map(local)
}

/// The remote view of an endpoint: `all` lists every peer, `by_name` keys
/// them by service, and with exactly one peer its fields are flattened into
/// the view itself so `{ep_remote.provided.port}` works for the common case.
fn remote_view(view: &EndpointViews) -> ConfigValue {
    let mut remote = ConfigMap::new();
    if view.peers.len() == 1 {
        if let Some(fields) = view.peers[0].as_map() {
            for (key, value) in fields {
                remote.insert(key.clone(), value.clone());
            }
        }
    }
    remote.insert("all".to_string(), ConfigValue::List(view.peers.clone()));

    let mut by_name = ConfigMap::new();
    for peer in &view.peers {
        let fields = match peer.as_map() {
            Some(fields) => fields,
            None => continue,
        };
        let service = fields
            .get("service")
            .and_then(ConfigValue::as_str)
            .unwrap_or_default();
        let occurrences = view
            .peers
            .iter()
            .filter(|candidate| {
                candidate
                    .as_map()
                    .and_then(|map| map.get("service"))
                    .and_then(ConfigValue::as_str)
                    == Some(service)
            })
            .count();
        let key = if occurrences > 1 {
            let endpoint = fields
                .get("name")
                .and_then(ConfigValue::as_str)
                .unwrap_or_default();
            format!("{}:{}", service, endpoint)
        } else {
            service.to_string()
        };
        by_name.insert(key, peer.clone());
    }
    remote.insert("by_name".to_string(), ConfigValue::Map(by_name));
    ConfigValue::Map(remote)
}

/// Folds an endpoint's environment requirements into the merged environment
/// list: unknown variables are appended as requirements, and declared
/// defaults fill entries that no layer assigned.
fn apply_env_requirements(data: &mut ConfigMap, entries: &[EnvEntry]) {
    let list = data
        .entry("environment".to_string())
        .or_insert_with(|| ConfigValue::List(Vec::new()));
    let items = match list {
        ConfigValue::List(items) => items,
        _ => return,
    };
    for entry in entries {
        let existing = items.iter_mut().find(|item| {
            item.as_map()
                .and_then(|map| map.get("name"))
                .and_then(ConfigValue::as_str)
                == Some(entry.name.as_str())
        });
        match existing {
            Some(ConfigValue::Map(map)) => {
                if let Some(value) = &entry.value {
                    if !map.contains_key("value") {
                        map.insert("value".to_string(), ConfigValue::from_json(value));
                    }
                }
            }
            Some(_) => {}
            None => items.push(env_entry_value(entry)),
        }
    }
}

fn check_required_environment(service: &str, data: &ConfigMap) -> Vec<PlanIssue> {
    let mut issues = Vec::new();
    if let Some(items) = data.get("environment").and_then(ConfigValue::as_list) {
        for entry in items.iter().filter_map(ConfigValue::as_map) {
            if entry.contains_key("value") {
                continue;
            }
            if let Some(name) = entry.get("name").and_then(ConfigValue::as_str) {
                issues.push(PlanIssue::for_subject(
                    issue_codes::UNRESOLVED_REFERENCE,
                    service,
                    format!(
                        "required environment variable '{}' of service '{}' was not assigned a value by any layer",
                        name, service
                    ),
                ));
            }
        }
    }
    issues
}
