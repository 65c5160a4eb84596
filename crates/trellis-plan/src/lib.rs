//! Compilation of deployment graphs into fully resolved plans.
//!
//! A [`Planner`] takes validated entities from a [`trellis_model::Store`],
//! materializes the requested graph (services, embedded graphs, relations),
//! resolves every relation against its interface contract, stacks the
//! configuration layers of each service, and resolves the expressions the
//! merged configuration contains. The outcome is a [`PlanResult`]: per
//! service, one [`Context`] holding everything the runtime needs to start it.
//!
//! Plans are deterministic. Planning the same store, graph, environment and
//! runtime facts twice yields identical results, including iteration and
//! serialization order.
//!
//! ```no_run
//! use trellis_model::{InterfaceRegistry, Store};
//! use trellis_plan::{ConfigExporter, OutputTarget, Planner, RuntimeFacts};
//!
//! let store = trellis_model::load_and_validate(&["./model"])?;
//! let interfaces = InterfaceRegistry::from_store(&store)?;
//! let planner = Planner::new(&store, &interfaces);
//! let plan = planner.plan_named("blog", None, Some("production"), &RuntimeFacts::new())?;
//! trellis_plan::apply(&plan, &ConfigExporter::new(), &OutputTarget::Directory("./out".into()))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod context;
pub mod error;
pub mod graph;
mod interpolate;
pub mod relation;
pub mod runtime;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use trellis_model::{Entity, EnvironmentDefinition, GraphDefinition, InterfaceRegistry, Store};

pub use crate::context::{Context, RuntimeFacts};
pub use crate::error::{issue_codes, PlanError, PlanIssue};
pub use crate::graph::{Endpoint, EndpointRef, Graph, Relation, Service};
pub use crate::relation::{ResolvedEndpoint, ResolvedRelation};
pub use crate::runtime::{
    ConfigExporter, OutputFormat, RenderedDoc, Rendering, RuntimeAdapter, TemplateEngine,
};

/// Knobs for a planning run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Abort with [`PlanError::Timeout`] once this instant passes. Checked
    /// between planning stages, so a plan may finish slightly after it.
    pub deadline: Option<Instant>,
}

/// Compiles deployment graphs against a validated store.
pub struct Planner<'a> {
    store: &'a Store,
    interfaces: &'a InterfaceRegistry,
    options: PlanOptions,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a Store, interfaces: &'a InterfaceRegistry) -> Self {
        Planner {
            store,
            interfaces,
            options: PlanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    /// Resolves the named graph and environment in the store, then plans.
    pub fn plan_named(
        &self,
        graph: &str,
        graph_version: Option<&str>,
        environment: Option<&str>,
        facts: &RuntimeFacts,
    ) -> Result<PlanResult, PlanError> {
        let graph_entity = self.store.resolve("Graph", graph, graph_version)?;
        let environment_entity = match environment {
            Some(name) => Some(self.store.resolve("Environment", name, None)?),
            None => None,
        };
        self.plan(&graph_entity, environment_entity.as_deref(), facts)
    }

    /// Compiles one graph entity into a plan.
    ///
    /// Planning never stops at the first problem: every issue the graph has
    /// is collected, and the error carries all of them.
    pub fn plan(
        &self,
        graph_entity: &Entity,
        environment: Option<&Entity>,
        facts: &RuntimeFacts,
    ) -> Result<PlanResult, PlanError> {
        self.checkpoint()?;
        let definition = GraphDefinition::from_entity(graph_entity)?;
        let environment = environment
            .map(EnvironmentDefinition::from_entity)
            .transpose()?;
        info!(
            graph = %definition.name,
            environment = environment.as_ref().map(|e| e.name.as_str()).unwrap_or("<none>"),
            "planning deployment graph"
        );

        self.checkpoint()?;
        let graph = graph::build(&definition, self.store)?;
        debug!(services = graph.services.len(), relations = graph.relations.len(), "graph materialized");

        self.checkpoint()?;
        let bases = context::base_contexts(&graph, environment.as_ref(), facts, self.interfaces);

        self.checkpoint()?;
        let (relations, mut issues) =
            relation::resolve_relations(&graph, self.interfaces, &bases);

        self.checkpoint()?;
        let (contexts, context_issues) = context::finalize_contexts(&graph, &relations, bases);
        issues.extend(context_issues);

        if !issues.is_empty() {
            for issue in &issues {
                warn!(
                    code = issue.code,
                    subject = issue.subject.as_deref().unwrap_or("-"),
                    "{}",
                    issue.message
                );
            }
            return Err(PlanError::from_issues(issues));
        }
        info!(
            graph = %graph.name,
            services = contexts.len(),
            relations = relations.len(),
            "plan complete"
        );
        Ok(PlanResult {
            graph,
            environment: environment.map(|e| e.name),
            relations,
            contexts,
        })
    }

    fn checkpoint(&self) -> Result<(), PlanError> {
        match self.options.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(PlanError::Timeout),
            _ => Ok(()),
        }
    }
}

/// A fully compiled plan: the materialized graph, its resolved relations,
/// and one final context per service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanResult {
    pub graph: Graph,
    pub environment: Option<String>,
    pub relations: Vec<ResolvedRelation>,
    pub contexts: BTreeMap<String, Context>,
}

impl PlanResult {
    pub fn context(&self, service: &str) -> Option<&Context> {
        self.contexts.get(service)
    }

    pub fn relations_of(&self, service: &str) -> Vec<&ResolvedRelation> {
        self.relations
            .iter()
            .filter(|relation| relation.involves(service))
            .collect()
    }
}

/// Where [`apply`] leaves the rendered documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Keep the rendering in memory only.
    Memory,
    /// Additionally write every document below this directory.
    Directory(PathBuf),
}

/// Feeds a plan through a runtime adapter and optionally persists the
/// rendered documents.
pub fn apply(
    plan: &PlanResult,
    runtime: &dyn RuntimeAdapter,
    target: &OutputTarget,
) -> Result<Rendering, PlanError> {
    info!(adapter = %runtime.name(), graph = %plan.graph.name, "applying plan");
    let mut rendering = Rendering::new();
    runtime.render(plan, &mut rendering)?;
    if let OutputTarget::Directory(dir) = target {
        rendering.write_to_dir(dir)?;
    }
    Ok(rendering)
}
