use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::resources::namespacelabels::{
    APPLIED_ANNOTATION, NAMESPACE_LABEL_FINALIZER, REQUIRED_NAME,
};

pub mod namespacelabel;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Reconciler configuration, fixed at startup
#[derive(Clone, Debug)]
pub struct Settings {
    /// Annotation on the namespace recording which labels this operator applied
    pub applied_annotation: String,
    /// Finalizer attached to every NamespaceLabel object
    pub finalizer: String,
    /// The one object name allowed per namespace in single-owner mode
    pub required_name: String,
    /// Allow several NamespaceLabel objects per namespace and merge them
    pub multi_owner: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            applied_annotation: APPLIED_ANNOTATION.to_string(),
            finalizer: NAMESPACE_LABEL_FINALIZER.to_string(),
            required_name: REQUIRED_NAME.to_string(),
            multi_owner: false,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,

    settings: Settings,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn with_multi_owner(mut self, multi_owner: bool) -> Self {
        self.settings.multi_owner = multi_owner;
        self
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
