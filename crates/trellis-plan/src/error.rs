use thiserror::Error;

use trellis_model::ModelError;

/// Stable issue codes for planning failures.
pub mod issue_codes {
    /// A service references a component or graph that cannot be resolved
    pub const COMPONENT_RESOLUTION: &str = "ERR_PLAN_COMPONENT_RESOLUTION";
    /// A relation endpoint names an interface with no definition
    pub const UNKNOWN_INTERFACE: &str = "ERR_PLAN_UNKNOWN_INTERFACE";
    /// Relation endpoints do not fill the interface roles correctly
    pub const ROLE_MISMATCH: &str = "ERR_PLAN_ROLE_MISMATCH";
    /// A variable requirement has no provider and no default
    pub const RELATION_UNSATISFIED: &str = "ERR_PLAN_RELATION_UNSATISFIED";
    /// An expression references a path that does not exist
    pub const UNRESOLVED_REFERENCE: &str = "ERR_PLAN_UNRESOLVED_REFERENCE";
    /// Expressions depend on each other in a cycle
    pub const CYCLIC_REFERENCE: &str = "ERR_PLAN_CYCLIC_REFERENCE";
    /// A syntactically invalid reference or endpoint designator
    pub const INVALID_REFERENCE: &str = "ERR_PLAN_INVALID_REFERENCE";
    /// The same service name is declared twice in one graph
    pub const DUPLICATE_SERVICE: &str = "ERR_PLAN_DUPLICATE_SERVICE";
    /// Planning ran past the configured deadline
    pub const TIMEOUT: &str = "ERR_PLAN_TIMEOUT";
}

/// A single planning failure, tied to the graph element it is about.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}{}", FormatSubject(.subject))]
pub struct PlanIssue {
    pub code: &'static str,
    pub message: String,
    /// The service, relation, or endpoint the issue concerns
    pub subject: Option<String>,
}

impl PlanIssue {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        PlanIssue {
            code,
            message: message.into(),
            subject: None,
        }
    }

    pub fn for_subject(
        code: &'static str,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        PlanIssue {
            code,
            message: message.into(),
            subject: Some(subject.into()),
        }
    }
}

struct FormatSubject<'a>(&'a Option<String>);

impl std::fmt::Display for FormatSubject<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(subject) => write!(f, " (in {})", subject),
            None => Ok(()),
        }
    }
}

/// Errors produced while planning or applying a deployment.
#[derive(Error, Debug)]
pub enum PlanError {
    /// A single planning issue
    #[error(transparent)]
    Issue(#[from] PlanIssue),

    /// Several planning issues reported together
    #[error("planning failed with {} issues: [{}]", .0.len(), IssueListFormat(.0))]
    Multiple(Vec<PlanIssue>),

    /// The configured deadline passed before planning finished
    #[error("planning exceeded its deadline")]
    Timeout,

    /// A model-level error surfaced during planning
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Error writing rendered output
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error encoding a rendered document as JSON
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error encoding a rendered document as YAML
    #[error("YAML encoding error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A template engine failed to render a file directive
    #[error("template rendering failed for {template}: {message}")]
    Template { template: String, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlanError {
    /// Collapses collected issues into a single error value.
    pub fn from_issues(mut issues: Vec<PlanIssue>) -> Self {
        match issues.len() {
            0 => PlanError::Internal("from_issues called with an empty issue list".to_string()),
            1 => PlanError::Issue(issues.remove(0)),
            _ => PlanError::Multiple(issues),
        }
    }

    /// The issues carried by this error, empty for non-issue variants.
    pub fn issues(&self) -> &[PlanIssue] {
        match self {
            PlanError::Issue(issue) => std::slice::from_ref(issue),
            PlanError::Multiple(issues) => issues,
            _ => &[],
        }
    }

    /// True when this error carries an issue with the given code, or is the
    /// timeout error and the timeout code was asked for.
    pub fn has_code(&self, code: &str) -> bool {
        if matches!(self, PlanError::Timeout) {
            return code == issue_codes::TIMEOUT;
        }
        self.issues().iter().any(|issue| issue.code == code)
    }

    /// Returns the stable error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            PlanError::Issue(issue) => issue.code,
            PlanError::Multiple(_) => "ERR_PLAN_MULTIPLE",
            PlanError::Timeout => issue_codes::TIMEOUT,
            PlanError::Model(error) => error.error_code(),
            PlanError::Io { .. } => "ERR_PLAN_IO",
            PlanError::Json(_) => "ERR_PLAN_ENCODING",
            PlanError::Yaml(_) => "ERR_PLAN_ENCODING",
            PlanError::Template { .. } => "ERR_PLAN_TEMPLATE",
            PlanError::Internal(_) => "ERR_PLAN_INTERNAL",
        }
    }
}

/// Helper struct for formatting lists of issues.
struct IssueListFormat<'a>(&'a Vec<PlanIssue>);

impl std::fmt::Display for IssueListFormat<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_issue_display() {
        let issue = PlanIssue::for_subject(
            issue_codes::ROLE_MISMATCH,
            "db:db=ghost:db",
            "role 'admin' is not declared by interface 'mysql-database'",
        );
        assert_eq!(
            issue.to_string(),
            "ERR_PLAN_ROLE_MISMATCH: role 'admin' is not declared by interface 'mysql-database' (in db:db=ghost:db)"
        );
    }

    #[test]
    fn test_from_issues_single_keeps_code() {
        let err = PlanError::from_issues(vec![PlanIssue::new(
            issue_codes::UNKNOWN_INTERFACE,
            "no interface",
        )]);
        assert_eq!(err.error_code(), issue_codes::UNKNOWN_INTERFACE);
        assert!(err.has_code(issue_codes::UNKNOWN_INTERFACE));
        assert!(!err.has_code(issue_codes::ROLE_MISMATCH));
    }

    #[test]
    fn test_from_issues_multiple_aggregates() {
        let err = PlanError::from_issues(vec![
            PlanIssue::new(issue_codes::COMPONENT_RESOLUTION, "first"),
            PlanIssue::new(issue_codes::RELATION_UNSATISFIED, "second"),
        ]);
        assert_eq!(err.error_code(), "ERR_PLAN_MULTIPLE");
        assert_eq!(err.issues().len(), 2);
        assert!(err.has_code(issue_codes::COMPONENT_RESOLUTION));
        assert!(err.has_code(issue_codes::RELATION_UNSATISFIED));
        assert!(err.to_string().contains("2 issues"), "got: {}", err);
    }

    #[test]
    fn test_timeout_code() {
        let err = PlanError::Timeout;
        assert_eq!(err.error_code(), issue_codes::TIMEOUT);
        assert!(err.has_code(issue_codes::TIMEOUT));
        assert!(err.issues().is_empty());
    }
}
