//! Expression resolution inside merged configurations.
//!
//! Strings may embed `{dotted.path}` references to other values of the same
//! context. References are resolved in dependency order, so an expression may
//! refer to a value that is itself an expression. `{{` and `}}` escape
//! literal braces.

use lazy_static::lazy_static;
use regex::Regex;

use trellis_model::{ConfigMap, ConfigValue};

use crate::error::{issue_codes, PlanIssue};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|\{|\}").unwrap();
    static ref PATH_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Reference(String),
}

struct Leaf {
    /// Dotted location of the string inside the context.
    path: String,
    template: String,
    segments: Vec<Segment>,
    /// The original value sat inside a secret wrapper.
    secret: bool,
    failed: bool,
}

/// Resolves every expression in `data` in place. Issues are reported for
/// unbalanced or malformed expressions, references that never resolve, and
/// reference cycles; expressions depending on a failed one are left alone
/// without piling on further issues.
pub(crate) fn resolve(service: &str, data: &mut ConfigMap) -> Vec<PlanIssue> {
    let mut root = ConfigValue::Map(std::mem::take(data));
    let mut issues = Vec::new();

    let mut leaves = Vec::new();
    collect_leaves(&root, &mut Vec::new(), false, &mut leaves);
    for leaf in &mut leaves {
        match parse_template(&leaf.template) {
            Ok(segments) => leaf.segments = segments,
            Err(message) => {
                leaf.failed = true;
                issues.push(PlanIssue::for_subject(
                    issue_codes::INVALID_REFERENCE,
                    service,
                    format!(
                        "expression '{}' at '{}': {}",
                        leaf.template, leaf.path, message
                    ),
                ));
            }
        }
    }

    let edges = dependency_edges(&leaves);
    let (order, cyclic) = topological_order(&leaves, &edges, service, &mut issues);
    let mut failed: Vec<bool> = leaves
        .iter()
        .zip(&cyclic)
        .map(|(leaf, &in_cycle)| leaf.failed || in_cycle)
        .collect();

    for index in order {
        if failed[index] {
            continue;
        }
        if edges[index].iter().any(|&dep| failed[dep]) {
            failed[index] = true;
            continue;
        }
        match evaluate(&leaves[index], &root, service) {
            Ok(mut value) => {
                if leaves[index].secret {
                    value = value.into_secret();
                }
                let parts: Vec<&str> = leaves[index].path.split('.').collect();
                write_path(&mut root, &parts, value);
            }
            Err(issue) => {
                failed[index] = true;
                issues.push(issue);
            }
        }
    }

    if let ConfigValue::Map(map) = root {
        *data = map;
    }
    issues
}

fn collect_leaves(
    value: &ConfigValue,
    path: &mut Vec<String>,
    secret: bool,
    leaves: &mut Vec<Leaf>,
) {
    match value {
        ConfigValue::String(text) if text.contains('{') || text.contains('}') => {
            leaves.push(Leaf {
                path: path.join("."),
                template: text.clone(),
                segments: Vec::new(),
                secret,
                failed: false,
            });
        }
        ConfigValue::Map(map) => {
            for (key, nested) in map {
                path.push(key.clone());
                collect_leaves(nested, path, secret, leaves);
                path.pop();
            }
        }
        ConfigValue::List(items) => {
            for (index, nested) in items.iter().enumerate() {
                path.push(index.to_string());
                collect_leaves(nested, path, secret, leaves);
                path.pop();
            }
        }
        ConfigValue::Secret(inner) => collect_leaves(inner, path, true, leaves),
        _ => {}
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    for token in TOKEN_RE.find_iter(template) {
        if token.start() > cursor {
            push_literal(&mut segments, &template[cursor..token.start()]);
        }
        cursor = token.end();
        match token.as_str() {
            "{{" => push_literal(&mut segments, "{"),
            "}}" => push_literal(&mut segments, "}"),
            "{" | "}" => return Err("unbalanced brace".to_string()),
            matched => {
                let reference = &matched[1..matched.len() - 1];
                if !PATH_RE.is_match(reference) {
                    return Err(format!("invalid reference '{{{}}}'", reference));
                }
                segments.push(Segment::Reference(reference.to_string()));
            }
        }
    }
    if cursor < template.len() {
        push_literal(&mut segments, &template[cursor..]);
    }
    Ok(segments)
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Literal(existing)) = segments.last_mut() {
        existing.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}

/// Leaf `i` depends on leaf `j` when one of `i`'s references targets `j`
/// itself, a subtree containing `j`, or a path below `j`.
fn dependency_edges(leaves: &[Leaf]) -> Vec<Vec<usize>> {
    let mut edges = vec![Vec::new(); leaves.len()];
    for (i, leaf) in leaves.iter().enumerate() {
        for segment in &leaf.segments {
            let reference = match segment {
                Segment::Reference(reference) => reference,
                Segment::Literal(_) => continue,
            };
            let subtree = format!("{}.", reference);
            for (j, other) in leaves.iter().enumerate() {
                let below = format!("{}.", other.path);
                if other.path == *reference
                    || other.path.starts_with(&subtree)
                    || reference.starts_with(&below)
                {
                    if !edges[i].contains(&j) {
                        edges[i].push(j);
                    }
                }
            }
        }
    }
    edges
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// Post-order over the dependency graph, so dependencies come first. Cycles
/// are reported once per cycle and their members marked failed.
fn topological_order(
    leaves: &[Leaf],
    edges: &[Vec<usize>],
    service: &str,
    issues: &mut Vec<PlanIssue>,
) -> (Vec<usize>, Vec<bool>) {
    let mut state = vec![VisitState::Unvisited; leaves.len()];
    let mut order = Vec::with_capacity(leaves.len());
    let mut chain = Vec::new();
    let mut cyclic = vec![false; leaves.len()];
    for start in 0..leaves.len() {
        visit(
            start, leaves, edges, service, &mut state, &mut chain, &mut cyclic, &mut order, issues,
        );
    }
    (order, cyclic)
}

#[allow(clippy::too_many_arguments)]
fn visit(
    index: usize,
    leaves: &[Leaf],
    edges: &[Vec<usize>],
    service: &str,
    state: &mut Vec<VisitState>,
    chain: &mut Vec<usize>,
    cyclic: &mut Vec<bool>,
    order: &mut Vec<usize>,
    issues: &mut Vec<PlanIssue>,
) {
    match state[index] {
        VisitState::Done => return,
        VisitState::InProgress => {
            let from = chain.iter().position(|&member| member == index).unwrap_or(0);
            let mut described: Vec<&str> =
                chain[from..].iter().map(|&member| leaves[member].path.as_str()).collect();
            described.push(leaves[index].path.as_str());
            issues.push(PlanIssue::for_subject(
                issue_codes::CYCLIC_REFERENCE,
                service,
                format!("expression cycle: {}", described.join(" -> ")),
            ));
            for &member in &chain[from..] {
                cyclic[member] = true;
            }
            return;
        }
        VisitState::Unvisited => {}
    }
    state[index] = VisitState::InProgress;
    chain.push(index);
    for &dep in &edges[index] {
        visit(dep, leaves, edges, service, state, chain, cyclic, order, issues);
    }
    chain.pop();
    state[index] = VisitState::Done;
    order.push(index);
}

fn evaluate(leaf: &Leaf, root: &ConfigValue, service: &str) -> Result<ConfigValue, PlanIssue> {
    // A template that is a single reference keeps the target's structure
    // and type instead of flattening it to a string.
    if let [Segment::Reference(reference)] = leaf.segments.as_slice() {
        let (target, crossed) = lookup(leaf, root, reference, service)?;
        let value = target.clone();
        return Ok(if crossed { value.into_secret() } else { value });
    }

    let mut rendered = String::new();
    let mut tainted = false;
    for segment in &leaf.segments {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Reference(reference) => {
                let (target, crossed) = lookup(leaf, root, reference, service)?;
                tainted = tainted || crossed || target.contains_secret();
                rendered.push_str(&scalar_text(target));
            }
        }
    }
    let value = ConfigValue::String(rendered);
    Ok(if tainted { value.into_secret() } else { value })
}

fn lookup<'a>(
    leaf: &Leaf,
    root: &'a ConfigValue,
    reference: &str,
    service: &str,
) -> Result<(&'a ConfigValue, bool), PlanIssue> {
    root.resolve_path(reference).ok_or_else(|| {
        PlanIssue::for_subject(
            issue_codes::UNRESOLVED_REFERENCE,
            service,
            format!(
                "expression '{}' at '{}' references '{}', which is not defined",
                leaf.template, leaf.path, reference
            ),
        )
    })
}

fn scalar_text(value: &ConfigValue) -> String {
    match value.reveal() {
        ConfigValue::String(text) => text.clone(),
        ConfigValue::Integer(number) => number.to_string(),
        ConfigValue::Float(number) => number.to_string(),
        ConfigValue::Bool(flag) => flag.to_string(),
        other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
    }
}

fn write_path(current: &mut ConfigValue, parts: &[&str], value: ConfigValue) {
    match current {
        ConfigValue::Secret(inner) => write_path(inner, parts, value),
        ConfigValue::Map(map) => {
            let (head, rest) = match parts.split_first() {
                Some(split) => split,
                None => return,
            };
            match map.get_mut(*head) {
                Some(slot) if rest.is_empty() => *slot = value,
                Some(slot) => write_path(slot, rest, value),
                None => {}
            }
        }
        ConfigValue::List(items) => {
            let (head, rest) = match parts.split_first() {
                Some(split) => split,
                None => return,
            };
            if let Some(slot) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                if rest.is_empty() {
                    *slot = value;
                } else {
                    write_path(slot, rest, value);
                }
            }
        }
        _ => {}
    }
}
