//! Crate-wide error types.
//!
//! Each pipeline stage owns a `thiserror`-derived error enum; `TplbuildError`
//! unifies them for library entry points. `ParseError` and `ConfigError`
//! additionally implement `miette::Diagnostic` so the CLI can render a
//! source span into the offending text.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown profile '{profile}'")]
    #[diagnostic(code(tplbuild::unknown_profile))]
    UnknownProfile { profile: String },

    #[error("base_image_repo is required because stage '{stage}' is a base stage")]
    #[diagnostic(code(tplbuild::missing_base_image_repo))]
    MissingBaseImageRepo { stage: String },

    #[error("context '{0}' is not defined")]
    UnknownContext(String),

    #[error("template render error: {0}")]
    Render(String),
}

/// A parse error with a byte-offset span into the rendered template text.
#[derive(Debug, Error, Diagnostic)]
#[error("{kind} at line {line}, column {col}")]
#[diagnostic(code(tplbuild::parse_error))]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub kind: ParseErrorKind,
    #[source_code]
    pub src: String,
    #[label("{kind}")]
    pub span: SourceSpan,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("unterminated line continuation")]
    UnterminatedContinuation,
    #[error("instruction before any FROM")]
    InstructionBeforeFrom,
    #[error("duplicate explicit stage name '{0}'")]
    DuplicateStageName(String),
    #[error("unknown instruction verb '{0}'")]
    UnknownVerb(String),
    #[error("malformed flag '{0}'")]
    MalformedFlag(String),
    #[error("instruction after END without a new FROM")]
    InstructionAfterEnd,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("stage '{0}' references undefined stage or context '{1}'")]
    UnresolvedFrom(String, String),
    #[error("COPY --from='{0}' in stage '{1}' does not match any stage, context, or external image")]
    UnresolvedCopyFrom(String, String),
    #[error("base stage '{base}' depends on anon stage '{anon}'")]
    BaseDependsOnAnon { base: String, anon: String },
    #[error("cycle detected in image graph involving node {0:?}")]
    Cycle(String),
    #[error("duplicate stage name '{0}'")]
    DuplicateStageName(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context '{name}' base_dir '{base_dir}' does not exist")]
    MissingBaseDir { name: String, base_dir: String },
    #[error("failed to read path {path} while hashing context '{context}'")]
    Unreadable {
        context: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ignore pattern '{pattern}' in context '{context}': {reason}")]
    BadIgnorePattern {
        context: String,
        pattern: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {status}")]
    Http {
        status: String,
        transient: bool,
    },
    #[error("registry auth failed for {repo}")]
    Auth { repo: String },
    #[error("manifest for {repo}:{tag} is malformed: {reason}")]
    MalformedManifest { repo: String, tag: String, reason: String },
    #[error("network error talking to registry: {0}")]
    Network(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http { transient, .. } => *transient,
            RegistryError::Network(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("builder exited with non-zero status for tag '{tag}'\n--- last {tail_lines} lines of stderr ---\n{stderr_tail}")]
pub struct BuildError {
    pub tag: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub tail_lines: usize,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is corrupted")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write state file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TplbuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("operation cancelled")]
    Cancelled,
}

impl TplbuildError {
    /// Maps an error to its CLI exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            TplbuildError::Config(_) | TplbuildError::Parse(_) | TplbuildError::Graph(_) | TplbuildError::Context(_) => 1,
            TplbuildError::Build(_) => 2,
            TplbuildError::Registry(_) => 3,
            TplbuildError::State(_) => 1,
            TplbuildError::Cancelled => 130,
        }
    }

    /// One-line summary plus error "kind" name, for terse top-level
    /// error reporting in `main.rs`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TplbuildError::Config(_) => "ConfigError",
            TplbuildError::Parse(_) => "ParseError",
            TplbuildError::Graph(_) => "GraphError",
            TplbuildError::Context(_) => "ContextError",
            TplbuildError::Registry(_) => "RegistryError",
            TplbuildError::Build(_) => "BuildError",
            TplbuildError::State(_) => "StateError",
            TplbuildError::Cancelled => "Cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, TplbuildError>;
