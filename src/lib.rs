use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Namespace {0} does not exist")]
    NamespaceNotFound(String),

    #[error("Protected label conflict: {conflicts}")]
    ProtectedLabelConflict {
        /// All conflicts found in the pass, joined with "; "
        conflicts: String,
        /// The conflicting keys, sorted
        skipped: Vec<String>,
    },

    #[error("Recording applied labels on namespace {namespace} failed: {message}")]
    AnnotationWriteFailed { namespace: String, message: String },

    #[error("NamespaceLabel objects must be named '{required}'")]
    InvalidName {
        required: String,
        /// Whether an object with the required name already exists alongside
        standard_exists: bool,
    },

    #[error("Only one NamespaceLabel is allowed per namespace, found {}", .names.len())]
    MultipleInstances { names: Vec<String> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::NamespaceNotFound(_) => "NamespaceNotFound",
            Error::ProtectedLabelConflict { .. } => "ProtectedLabelConflict",
            Error::AnnotationWriteFailed { .. } => "AnnotationWriteFailed",
            Error::InvalidName { .. } => "InvalidName",
            Error::MultipleInstances { .. } => "MultipleInstances",
        }
    }

    /// The reconciler error underneath any finalizer wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::FinalizerError(err) => match err.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(err)
                | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
                _ => self,
            },
            _ => self,
        }
    }
}

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRD definitions
pub mod resources;

pub use controllers::namespacelabel::run;
pub use controllers::State;
