//! Turning plans into runtime artifacts.
//!
//! A [`RuntimeAdapter`] walks a finished plan and emits documents into a
//! [`Rendering`]; what the documents mean is up to the adapter. The built-in
//! [`ConfigExporter`] writes one configuration document per service plus the
//! rendered template files, which is enough to drive most launchers.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::PlanError;
use crate::PlanResult;

/// Renders file templates referenced by component file directives. The
/// planner ships no engine of its own; callers plug one in when their
/// components carry templates.
pub trait TemplateEngine {
    fn render(&self, template: &str, context: &Context) -> Result<String, PlanError>;
}

/// Translates a plan into runtime-specific documents.
pub trait RuntimeAdapter {
    fn name(&self) -> &str;

    fn render(&self, plan: &PlanResult, output: &mut Rendering) -> Result<(), PlanError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Yaml,
    Json,
    Raw,
}

/// One document produced by an adapter. The name doubles as the relative
/// file path when the rendering is written to a directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedDoc {
    pub name: String,
    pub format: OutputFormat,
    pub data: serde_json::Value,
    pub annotations: BTreeMap<String, String>,
}

/// An ordered collection of rendered documents with unique names.
#[derive(Debug, Default)]
pub struct Rendering {
    docs: Vec<RenderedDoc>,
    index: HashMap<String, usize>,
}

impl Rendering {
    pub fn new() -> Self {
        Rendering::default()
    }

    /// Adds a document, keeping the first one on a name collision.
    pub fn add(&mut self, doc: RenderedDoc) -> bool {
        if self.index.contains_key(&doc.name) {
            warn!(name = %doc.name, "dropping rendered document with duplicate name");
            return false;
        }
        self.index.insert(doc.name.clone(), self.docs.len());
        self.docs.push(doc);
        true
    }

    pub fn get(&self, name: &str) -> Option<&RenderedDoc> {
        self.index.get(name).map(|&at| &self.docs[at])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderedDoc> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Writes every document below `dir`, creating directories as needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), PlanError> {
        for doc in &self.docs {
            let path = dir.join(&doc.name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| PlanError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            let contents = match doc.format {
                OutputFormat::Yaml => format!("---\n{}", serde_yaml::to_string(&doc.data)?),
                OutputFormat::Json => {
                    let mut text = serde_json::to_string_pretty(&doc.data)?;
                    text.push('\n');
                    text
                }
                OutputFormat::Raw => doc
                    .data
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| doc.data.to_string()),
            };
            std::fs::write(&path, contents).map_err(|source| PlanError::Io {
                path: path.display().to_string(),
                source,
            })?;
            info!(file = %path.display(), "wrote rendered document");
        }
        Ok(())
    }

    /// Writes the rendering as one YAML stream, one document per entry.
    pub fn write_stream(&self, out: &mut dyn Write) -> Result<(), PlanError> {
        for doc in &self.docs {
            let text = serde_yaml::to_string(&doc.data)?;
            write!(out, "---\n# {}\n{}", doc.name, text).map_err(|source| PlanError::Io {
                path: "<stream>".into(),
                source,
            })?;
        }
        Ok(())
    }
}

/// The default adapter: per-service configuration documents, a secrets
/// document where the context holds any, rendered file templates when a
/// [`TemplateEngine`] is attached, and a graph-wide relation summary.
#[derive(Default)]
pub struct ConfigExporter {
    engine: Option<Box<dyn TemplateEngine>>,
}

impl ConfigExporter {
    pub fn new() -> Self {
        ConfigExporter { engine: None }
    }

    pub fn with_engine(engine: Box<dyn TemplateEngine>) -> Self {
        ConfigExporter {
            engine: Some(engine),
        }
    }
}

impl RuntimeAdapter for ConfigExporter {
    fn name(&self) -> &str {
        "config-export"
    }

    fn render(&self, plan: &PlanResult, output: &mut Rendering) -> Result<(), PlanError> {
        let graph_name = &plan.graph.name;
        for (service_name, service) in &plan.graph.services {
            let context = match plan.context(service_name) {
                Some(context) => context,
                None => continue,
            };
            let relations: Vec<serde_json::Value> = plan
                .relations_of(service_name)
                .into_iter()
                .flat_map(|relation| {
                    relation
                        .endpoints_of(service_name)
                        .into_iter()
                        .map(move |endpoint| {
                            json!({
                                "relation": relation.name,
                                "interface": relation.interface,
                                "endpoint": endpoint.endpoint,
                                "role": endpoint.role,
                                "peers": relation
                                    .endpoints
                                    .iter()
                                    .filter(|peer| peer.service != *service_name)
                                    .map(|peer| peer.qual_name())
                                    .collect::<Vec<_>>(),
                            })
                        })
                })
                .collect();

            let mut annotations = BTreeMap::new();
            annotations.insert("graph".to_string(), graph_name.clone());
            annotations.insert("service".to_string(), service_name.clone());

            let (config, secrets) = context.split_secrets();
            output.add(RenderedDoc {
                name: format!("configs/{}-{}-config.json", graph_name, service_name),
                format: OutputFormat::Json,
                data: json!({
                    "service": service_name,
                    "component": service.component,
                    "image": service.image,
                    "replicas": service.replicas,
                    "ports": service.ports(),
                    "config": config,
                    "relations": relations,
                }),
                annotations: annotations.clone(),
            });

            if !secrets.is_empty() {
                debug!(service = %service_name, count = secrets.len(), "exporting secrets document");
                output.add(RenderedDoc {
                    name: format!("configs/{}-{}-secrets.json", graph_name, service_name),
                    format: OutputFormat::Json,
                    data: json!(secrets),
                    annotations: annotations.clone(),
                });
            }

            if let Some(engine) = &self.engine {
                for directive in &service.files {
                    let rendered = engine.render(&directive.template, context)?;
                    let mut file_annotations = annotations.clone();
                    file_annotations.insert(
                        "container_path".to_string(),
                        directive.container_path.clone(),
                    );
                    output.add(RenderedDoc {
                        name: format!(
                            "resources/{}-{}-{}",
                            graph_name,
                            service_name,
                            filename_to_label(&directive.template)
                        ),
                        format: OutputFormat::Raw,
                        data: serde_json::Value::String(rendered),
                        annotations: file_annotations,
                    });
                }
            }
        }

        let relations: Vec<serde_json::Value> = plan
            .relations
            .iter()
            .map(|relation| {
                json!({
                    "name": relation.name,
                    "interface": relation.interface,
                    "endpoints": relation
                        .endpoints
                        .iter()
                        .map(|endpoint| endpoint.qual_name())
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let mut annotations = BTreeMap::new();
        annotations.insert("graph".to_string(), graph_name.clone());
        output.add(RenderedDoc {
            name: format!("{}-relations.yaml", graph_name),
            format: OutputFormat::Yaml,
            data: json!({
                "graph": graph_name,
                "environment": plan.environment,
                "relations": relations,
            }),
            annotations,
        });
        Ok(())
    }
}

/// Reduces a template reference to a label usable inside a file name:
/// `file://conf/my.cnf.tmpl` becomes `my-cnf-tmpl`.
fn filename_to_label(reference: &str) -> String {
    let stripped = match reference.find("://") {
        Some(at) => &reference[at + 3..],
        None => reference,
    };
    let base = stripped.rsplit('/').next().unwrap_or(stripped);
    base.replace(['.', '_'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filename_to_label() {
        assert_eq!(filename_to_label("file://conf/my.cnf.tmpl"), "my-cnf-tmpl");
        assert_eq!(filename_to_label("plain_name"), "plain-name");
        assert_eq!(filename_to_label("dir/nested/app.conf"), "app-conf");
    }

    #[test]
    fn test_rendering_rejects_duplicate_names() {
        let mut rendering = Rendering::new();
        let doc = RenderedDoc {
            name: "a.json".to_string(),
            format: OutputFormat::Json,
            data: json!({"x": 1}),
            annotations: BTreeMap::new(),
        };
        assert!(rendering.add(doc.clone()));
        assert!(!rendering.add(RenderedDoc {
            data: json!({"x": 2}),
            ..doc
        }));
        assert_eq!(rendering.len(), 1);
        let kept = rendering.get("a.json").expect("document present");
        assert_eq!(kept.data, json!({"x": 1}), "first document wins");
    }

    #[test]
    fn test_write_to_dir_creates_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rendering = Rendering::new();
        rendering.add(RenderedDoc {
            name: "configs/app-config.json".to_string(),
            format: OutputFormat::Json,
            data: json!({"replicas": 2}),
            annotations: BTreeMap::new(),
        });
        rendering.add(RenderedDoc {
            name: "notes.txt".to_string(),
            format: OutputFormat::Raw,
            data: serde_json::Value::String("hello\n".to_string()),
            annotations: BTreeMap::new(),
        });
        rendering.write_to_dir(dir.path()).expect("writes");

        let config =
            std::fs::read_to_string(dir.path().join("configs/app-config.json")).expect("config");
        assert!(config.contains("\"replicas\": 2"), "got: {}", config);
        let notes = std::fs::read_to_string(dir.path().join("notes.txt")).expect("notes");
        assert_eq!(notes, "hello\n");
    }

    #[test]
    fn test_write_stream_separates_documents() {
        let mut rendering = Rendering::new();
        rendering.add(RenderedDoc {
            name: "one.yaml".to_string(),
            format: OutputFormat::Yaml,
            data: json!({"a": 1}),
            annotations: BTreeMap::new(),
        });
        rendering.add(RenderedDoc {
            name: "two.yaml".to_string(),
            format: OutputFormat::Yaml,
            data: json!({"b": 2}),
            annotations: BTreeMap::new(),
        });
        let mut buffer = Vec::new();
        rendering.write_stream(&mut buffer).expect("writes");
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text.matches("---").count(), 2);
        assert!(text.contains("# one.yaml"));
        assert!(text.contains("# two.yaml"));
    }
}
