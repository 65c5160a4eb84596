use thiserror::Error;

/// A single schema violation found while checking a document against the
/// registered schema for its kind.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{qual_name}: {message}{}", FormatPath(.path))]
pub struct SchemaViolation {
    /// Qualified name (`kind:name`) of the offending document
    pub qual_name: String,
    /// Human-readable description of the violation
    pub message: String,
    /// JSON pointer into the document data, when available
    pub path: Option<String>,
}

/// Helper for formatting the optional violation path.
struct FormatPath<'a>(&'a Option<String>);

impl std::fmt::Display for FormatPath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(path) if !path.is_empty() => write!(f, " (at {})", path),
            _ => Ok(()),
        }
    }
}

/// Errors that can occur while loading or validating model documents.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Error reading a model file from disk
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML
    #[error("YAML parsing error in {src_ref}: {source}")]
    Yaml {
        src_ref: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Error converting a parsed document into its JSON representation
    #[error("document in {src_ref} is not representable as JSON: {source}")]
    Json {
        src_ref: String,
        #[source]
        source: serde_json::Error,
    },

    /// A document that is not a key/value mapping at the top level
    #[error("document in {src_ref} is not a mapping")]
    NotAMapping { src_ref: String },

    /// A document missing one of the fields every model document must carry
    #[error("document in {src_ref} is missing required field `{field}`")]
    MissingField {
        src_ref: String,
        field: &'static str,
    },

    /// Two documents with the same kind, name, and version
    #[error("duplicate entity {qual_name} (version {version}) in {src_ref}, already loaded from {previous}")]
    DuplicateEntity {
        qual_name: String,
        version: String,
        src_ref: String,
        previous: String,
    },

    /// Lookup for an entity that is not in the store
    #[error("no {kind} named '{name}'{} in the store", FormatVersion(.version))]
    EntityNotFound {
        kind: String,
        name: String,
        version: Option<String>,
    },

    /// Lookup without a version where several versions are loaded
    #[error("ambiguous reference to {kind} '{name}': loaded versions are [{}]", .versions.join(", "))]
    AmbiguousVersion {
        kind: String,
        name: String,
        versions: Vec<String>,
    },

    /// A registered schema that is itself invalid
    #[error("invalid schema registered for kind '{kind}': {message}")]
    InvalidSchema { kind: String, message: String },

    /// A document that violates the schema for its kind
    #[error(transparent)]
    Validation(#[from] SchemaViolation),

    /// Multiple schema violations reported together
    #[error("multiple schema violations: [{}]", ViolationListFormat(.0))]
    MultipleViolations(Vec<SchemaViolation>),

    /// A document that parsed as YAML but does not decode into its typed form
    #[error("malformed {kind} '{name}': {message}")]
    Definition {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Helper for formatting an optional version qualifier in messages.
struct FormatVersion<'a>(&'a Option<String>);

impl std::fmt::Display for FormatVersion<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(version) => write!(f, " (version {})", version),
            None => Ok(()),
        }
    }
}

/// Helper struct for formatting lists of violations.
struct ViolationListFormat<'a>(&'a Vec<SchemaViolation>);

impl std::fmt::Display for ViolationListFormat<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl ModelError {
    /// Collapses a list of violations into a single error value.
    ///
    /// One violation maps to [`ModelError::Validation`], several to
    /// [`ModelError::MultipleViolations`]. Calling this with an empty list is
    /// a bug in the caller and reported as an internal error.
    pub fn from_violations(mut violations: Vec<SchemaViolation>) -> Self {
        match violations.len() {
            0 => ModelError::Internal(
                "from_violations called with an empty violation list".to_string(),
            ),
            1 => ModelError::Validation(violations.remove(0)),
            _ => ModelError::MultipleViolations(violations),
        }
    }

    /// Returns the stable error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::Io { .. } => "ERR_MODEL_IO",
            ModelError::Yaml { .. } => "ERR_MODEL_YAML",
            ModelError::Json { .. } => "ERR_MODEL_JSON",
            ModelError::NotAMapping { .. } => "ERR_MODEL_NOT_A_MAPPING",
            ModelError::MissingField { .. } => "ERR_MODEL_MISSING_FIELD",
            ModelError::DuplicateEntity { .. } => "ERR_MODEL_DUPLICATE_ENTITY",
            ModelError::EntityNotFound { .. } => "ERR_MODEL_ENTITY_NOT_FOUND",
            ModelError::AmbiguousVersion { .. } => "ERR_MODEL_AMBIGUOUS_VERSION",
            ModelError::InvalidSchema { .. } => "ERR_MODEL_INVALID_SCHEMA",
            ModelError::Validation(_) => "ERR_MODEL_VALIDATION",
            ModelError::MultipleViolations(_) => "ERR_MODEL_VALIDATION",
            ModelError::Definition { .. } => "ERR_MODEL_DEFINITION",
            ModelError::Internal(_) => "ERR_MODEL_INTERNAL",
        }
    }
}
