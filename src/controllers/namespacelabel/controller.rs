use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, Settings, State};
use crate::resources::namespacelabels::{NamespaceLabel, NamespaceLabelStatus};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::{labels, ownership, protection, status};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Reconciler configuration, fixed at startup
    pub settings: Settings,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "namespace-label-operator".into()),
            settings: state.settings().clone(),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, nsl), fields(trace_id))]
async fn reconcile(nsl: Arc<NamespaceLabel>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = nsl.namespace().unwrap_or_default();
    let api: Api<NamespaceLabel> = Api::namespaced(ctx.client.clone(), &namespace);

    info!("Reconciling NamespaceLabel \"{}\" in {}", nsl.name_any(), namespace);
    match finalizer(&api, &ctx.settings.finalizer, nsl.clone(), |event| async {
        match event {
            Finalizer::Apply(nsl) => nsl.reconcile_status(ctx.clone()).await,
            Finalizer::Cleanup(nsl) => nsl.cleanup(ctx.clone()).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &nsl.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(nsl.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_nsl: Arc<NamespaceLabel>, error: &Error, _ctx: Arc<Context>) -> Action {
    // Conflicts only clear once a user fixes the clashing label or pattern,
    // so they poll at a slower cadence than infrastructure errors.
    let delay = match error.root() {
        Error::ProtectedLabelConflict { .. } => Duration::from_secs(5 * 60),
        Error::AnnotationWriteFailed { .. } => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    };
    Action::requeue(delay)
}

/// What a successful pass did, for status reporting.
struct ApplyOutcome {
    requested: usize,
    applied: Vec<String>,
    skipped: Vec<String>,
}

impl NamespaceLabel {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<ApplyOutcome> {
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();
        let api: Api<NamespaceLabel> = Api::namespaced(ctx.client.clone(), &namespace);

        // The CRD schema cannot express "one object per namespace with a
        // fixed name", so strays are rejected here instead of silently
        // racing the real one.
        if !ctx.settings.multi_owner && name != ctx.settings.required_name {
            let standard_exists = api.get_opt(&ctx.settings.required_name).await?.is_some();
            return Err(Error::InvalidName {
                required: ctx.settings.required_name.clone(),
                standard_exists,
            });
        }

        let active: Vec<NamespaceLabel> = api
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|item| item.metadata.deletion_timestamp.is_none())
            .collect();

        if !ctx.settings.multi_owner && active.len() > 1 {
            return Err(Error::MultipleInstances {
                names: active.iter().map(|item| item.name_any()).collect(),
            });
        }

        let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
        let Some(mut ns) = ns_api.get_opt(&namespace).await? else {
            return Err(Error::NamespaceNotFound(namespace));
        };

        let prev_applied = ownership::read(&ns, &ctx.settings.applied_annotation);

        let (desired, patterns, mode, ignore_existing) = if ctx.settings.multi_owner {
            let (patterns, mode, ignore_existing) = labels::merge_policy(&active);
            (labels::merge_desired(&active), patterns, mode, ignore_existing)
        } else {
            (
                self.spec.labels.clone(),
                self.spec.protected_label_patterns.clone(),
                self.spec.protection_mode,
                self.spec.ignore_existing_protected_labels,
            )
        };

        let verdict = protection::evaluate(
            &desired,
            ns.labels(),
            &prev_applied,
            &patterns,
            mode,
            ignore_existing,
        );
        for warning in &verdict.warnings {
            warn!("label protection: {warning}");
        }
        if verdict.failed {
            return Err(Error::ProtectedLabelConflict {
                conflicts: verdict.warnings.join("; "),
                skipped: verdict.skipped,
            });
        }

        if labels::apply(ns.labels_mut(), &verdict.allowed, &prev_applied) {
            debug!("updating labels on namespace {namespace}");
            ns_api.replace(&namespace, &PostParams::default(), &ns).await?;
        }

        if let Err(err) =
            ownership::write(&ns_api, &namespace, &ctx.settings.applied_annotation, &verdict.allowed)
                .await
        {
            warn!("failed to record applied labels on namespace {namespace}: {err}");
            return Err(Error::AnnotationWriteFailed {
                namespace,
                message: err.to_string(),
            });
        }

        Ok(ApplyOutcome {
            requested: desired.len(),
            applied: verdict.allowed.into_keys().collect(),
            skipped: verdict.skipped,
        })
    }

    async fn reconcile_status(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();
        let api: Api<NamespaceLabel> = Api::namespaced(ctx.client.clone(), &namespace);

        let (result, message, reason, cond_status, skipped, applied) =
            match self.reconcile(ctx.clone()).await {
                Ok(outcome) => {
                    let message = status::success_message(
                        &namespace,
                        outcome.requested,
                        outcome.applied.len(),
                        &outcome.skipped,
                    );
                    (
                        Ok(Action::await_change()),
                        message,
                        "Synced",
                        "True",
                        outcome.skipped,
                        outcome.applied,
                    )
                }
                Err(Error::NamespaceNotFound(namespace)) => (
                    Ok(Action::requeue(Duration::from_secs(60))),
                    format!(
                        "Namespace '{namespace}' does not exist; labels will be applied once it is created"
                    ),
                    "NamespaceNotFound",
                    "False",
                    Vec::new(),
                    Vec::new(),
                ),
                Err(Error::AnnotationWriteFailed { namespace, message }) => (
                    Ok(Action::requeue(Duration::from_secs(60))),
                    format!(
                        "Labels were applied to namespace '{namespace}' but recording them failed, removal on delete may miss them: {message}"
                    ),
                    "AnnotationError",
                    "False",
                    Vec::new(),
                    Vec::new(),
                ),
                Err(Error::InvalidName {
                    required,
                    standard_exists,
                }) => {
                    let message = if standard_exists {
                        format!(
                            "NamespaceLabel objects must be named '{required}'. A '{required}' object already exists in this namespace; delete '{name}' and update '{required}' instead."
                        )
                    } else {
                        format!(
                            "NamespaceLabel objects must be named '{required}'. Delete '{name}' and recreate it as '{required}'."
                        )
                    };
                    // no requeue: a rename only arrives as a new object event
                    (Ok(Action::await_change()), message, "InvalidName", "False", Vec::new(), Vec::new())
                }
                Err(Error::MultipleInstances { names }) => (
                    Ok(Action::await_change()),
                    format!(
                        "{} NamespaceLabel objects are active in this namespace ({}); only one named '{}' is allowed. Delete the extra objects.",
                        names.len(),
                        names.join(", "),
                        ctx.settings.required_name,
                    ),
                    "MultipleInstances",
                    "False",
                    Vec::new(),
                    Vec::new(),
                ),
                Err(Error::ProtectedLabelConflict { conflicts, skipped }) => (
                    Err(Error::ProtectedLabelConflict {
                        conflicts: conflicts.clone(),
                        skipped: skipped.clone(),
                    }),
                    format!("Reconciliation failed due to protected label conflicts: {conflicts}"),
                    "ProtectedLabelConflict",
                    "False",
                    skipped,
                    Vec::new(),
                ),
                Err(err) => {
                    let message = err.to_string();
                    (Err(err), message, "FailedReconcile", "Unknown", Vec::new(), Vec::new())
                }
            };

        let conditions = status::upsert_ready(
            self.status.as_ref().and_then(|s| s.conditions.as_ref()),
            self.metadata.generation,
            cond_status,
            reason,
            &message,
            Time(Utc::now()),
        );

        // always overwrite status with what this pass saw
        let new_status = Patch::Apply(json!({
            "apiVersion": "nslabels.dev/v1alpha1",
            "kind": "NamespaceLabel",
            "status": NamespaceLabelStatus {
                applied: cond_status == "True",
                message,
                conditions: Some(conditions),
                protected_labels_skipped: Some(skipped),
                labels_applied: Some(applied),
            }
        }));
        let ps = PatchParams::apply("namespace-label-operator").force();
        let _o = api.patch_status(&name, &ps, &new_status).await?;

        result
    }

    // Finalizer cleanup (the object was deleted, roll back its contribution)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let namespace = self.namespace().unwrap_or_default();

        // A stray never owned anything in single-owner mode; touching the
        // namespace here would strip the real owner's work.
        if !ctx.settings.multi_owner && self.name_any() != ctx.settings.required_name {
            return Ok(Action::await_change());
        }

        let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
        let Some(mut ns) = ns_api.get_opt(&namespace).await? else {
            // namespace already gone, nothing to roll back
            return Ok(Action::await_change());
        };

        let remaining = if ctx.settings.multi_owner {
            let api: Api<NamespaceLabel> = Api::namespaced(ctx.client.clone(), &namespace);
            let name = self.name_any();
            let others: Vec<NamespaceLabel> = api
                .list(&ListParams::default())
                .await?
                .items
                .into_iter()
                .filter(|item| {
                    item.name_any() != name && item.metadata.deletion_timestamp.is_none()
                })
                .collect();
            labels::merge_desired(&others)
        } else {
            BTreeMap::new()
        };

        let prev_applied = ownership::read(&ns, &ctx.settings.applied_annotation);
        if labels::remove_stale(ns.labels_mut(), &remaining, &prev_applied) {
            ns_api.replace(&namespace, &PostParams::default(), &ns).await?;
        }

        if let Err(err) =
            ownership::write(&ns_api, &namespace, &ctx.settings.applied_annotation, &remaining)
                .await
        {
            warn!("failed to clear the applied-labels record on namespace {namespace}: {err}");
            return Err(Error::AnnotationWriteFailed {
                namespace,
                message: err.to_string(),
            });
        }

        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "Cleanup".into(),
                    note: Some(format!("Rolled back labels applied by `{}`", self.name_any())),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;
        Ok(Action::await_change())
    }
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let api = Api::<NamespaceLabel>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("NamespaceLabel is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let metrics = Metrics::default()
        .register(&state.registry)
        .expect("collectors registered at startup");

    Controller::new(api, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Context::new(client, metrics, &state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use kube::client::Body;

    use super::*;
    use crate::resources::namespacelabels::{
        NamespaceLabelSpec, ProtectionMode, APPLIED_ANNOTATION, NAMESPACE_LABEL_FINALIZER,
    };

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    struct ApiServer(ApiServerHandle);

    fn testing_context(settings: Settings) -> (Arc<Context>, ApiServer) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ctx = Context {
            client: client.clone(),
            recorder: Recorder::new(client, "namespace-label-operator".into()),
            settings,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
        };
        (Arc::new(ctx), ApiServer(handle))
    }

    impl ApiServer {
        /// Serve one request, asserting method and path, and return its body.
        async fn serve(
            &mut self,
            method: &str,
            path: &str,
            code: u16,
            respond: serde_json::Value,
        ) -> serde_json::Value {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method().as_str(), method, "method for {path}");
            assert_eq!(request.uri().path(), path);
            let body = request.into_body().collect_bytes().await.unwrap();
            let body = if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            };
            send.send_response(
                Response::builder()
                    .status(code)
                    .body(Body::from(serde_json::to_vec(&respond).unwrap()))
                    .unwrap(),
            );
            body
        }

        /// Serve one request by echoing its body back, asserting method and path.
        async fn echo(&mut self, method: &str, path: &str) {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method().as_str(), method, "method for {path}");
            assert_eq!(request.uri().path(), path);
            send.send_response(Response::builder().body(request.into_body()).unwrap());
        }
    }

    fn labels_object(labels: &[(&str, &str)]) -> NamespaceLabel {
        let mut nsl = NamespaceLabel::new(
            "labels",
            NamespaceLabelSpec {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
        );
        nsl.metadata.namespace = Some("team-a".into());
        nsl.metadata.generation = Some(1);
        nsl.metadata.finalizers = Some(vec![NAMESPACE_LABEL_FINALIZER.to_string()]);
        nsl
    }

    fn list_of(items: Vec<NamespaceLabel>) -> serde_json::Value {
        json!({
            "apiVersion": "nslabels.dev/v1alpha1",
            "kind": "NamespaceLabelList",
            "metadata": {"resourceVersion": "1"},
            "items": items,
        })
    }

    fn namespace_json(
        labels: serde_json::Value,
        annotations: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": "team-a",
                "resourceVersion": "10",
                "labels": labels,
                "annotations": annotations,
            }
        })
    }

    fn not_found() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "reason": "NotFound",
            "code": 404,
        })
    }

    static CR_PATH: &str = "/apis/nslabels.dev/v1alpha1/namespaces/team-a/namespacelabels";
    static NS_PATH: &str = "/api/v1/namespaces/team-a";

    #[tokio::test]
    async fn reconcile_attaches_the_finalizer_before_anything_else() {
        let (ctx, mut server) = testing_context(Settings::default());
        let mut nsl = labels_object(&[("env", "prod")]);
        nsl.metadata.finalizers = None;

        let scenario = tokio::spawn(async move {
            let patch = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
            // a json patch against the finalizers array, nothing else
            assert!(patch
                .as_array()
                .unwrap()
                .iter()
                .any(|op| op["op"] == "add"
                    && op["path"].as_str().unwrap().starts_with("/metadata/finalizers")));
        });

        reconcile(Arc::new(nsl), ctx).await.expect("finalizer attach succeeded");
        scenario.await.expect("apiserver saw the finalizer patch");
    }

    #[tokio::test]
    async fn apply_pass_updates_labels_and_ownership_and_status() {
        let (ctx, mut server) = testing_context(Settings::default());
        let nsl = Arc::new(labels_object(&[("env", "prod"), ("team", "platform")]));

        let scenario = tokio::spawn(async move {
            server
                .serve("GET", CR_PATH, 200, list_of(vec![labels_object(&[("env", "prod"), ("team", "platform")])]))
                .await;
            server
                .serve("GET", NS_PATH, 200, namespace_json(json!({"pre": "existing"}), json!(null)))
                .await;

            let put = server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"pre": "existing", "env": "prod", "team": "platform"}),
                        json!(null),
                    ),
                )
                .await;
            assert_json_include!(
                actual: put,
                expected: json!({"metadata": {"labels": {
                    "pre": "existing", "env": "prod", "team": "platform"
                }}})
            );

            // ownership record is written against a fresh read
            server
                .serve(
                    "GET",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"pre": "existing", "env": "prod", "team": "platform"}),
                        json!(null),
                    ),
                )
                .await;
            let put = server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"pre": "existing", "env": "prod", "team": "platform"}),
                        json!({APPLIED_ANNOTATION: "{\"env\":\"prod\",\"team\":\"platform\"}"}),
                    ),
                )
                .await;
            let record: BTreeMap<String, String> = serde_json::from_str(
                put["metadata"]["annotations"][APPLIED_ANNOTATION].as_str().unwrap(),
            )
            .unwrap();
            assert_eq!(record.get("env").map(String::as_str), Some("prod"));
            assert_eq!(record.get("team").map(String::as_str), Some("platform"));

            let status = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod"), ("team", "platform")]))
                        .unwrap(),
                )
                .await;
            assert_json_include!(
                actual: status,
                expected: json!({"status": {
                    "applied": true,
                    "message": "Applied 2 labels to namespace 'team-a'",
                    "labelsApplied": ["env", "team"],
                    "protectedLabelsSkipped": [],
                }})
            );
        });

        nsl.reconcile_status(ctx).await.expect("apply pass succeeded");
        scenario.await.expect("full apply scenario ran");
    }

    #[tokio::test]
    async fn steady_state_pass_only_refreshes_status() {
        let (ctx, mut server) = testing_context(Settings::default());
        let nsl = Arc::new(labels_object(&[("env", "prod")]));

        let scenario = tokio::spawn(async move {
            server
                .serve("GET", CR_PATH, 200, list_of(vec![labels_object(&[("env", "prod")])]))
                .await;
            let in_sync = namespace_json(
                json!({"env": "prod"}),
                json!({APPLIED_ANNOTATION: "{\"env\":\"prod\"}"}),
            );
            server.serve("GET", NS_PATH, 200, in_sync.clone()).await;
            // no label write; the record check re-reads and also skips its write
            server.serve("GET", NS_PATH, 200, in_sync).await;
            server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
        });

        nsl.reconcile_status(ctx).await.expect("steady state pass succeeded");
        scenario.await.expect("no namespace writes happened");
    }

    #[tokio::test]
    async fn fail_mode_conflict_reports_status_and_errors_without_writing() {
        let (ctx, mut server) = testing_context(Settings::default());
        let mut inner = labels_object(&[("env", "prod")]);
        inner.spec.protected_label_patterns = vec!["env".into()];
        inner.spec.protection_mode = ProtectionMode::Fail;
        let nsl = Arc::new(inner.clone());

        let scenario = tokio::spawn(async move {
            server.serve("GET", CR_PATH, 200, list_of(vec![inner])).await;
            server
                .serve("GET", NS_PATH, 200, namespace_json(json!({"env": "staging"}), json!(null)))
                .await;
            // straight to status: the namespace is never mutated
            let status = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
            assert_json_include!(
                actual: status,
                expected: json!({"status": {
                    "applied": false,
                    "protectedLabelsSkipped": ["env"],
                }})
            );
            let message = status["status"]["message"].as_str().unwrap();
            assert!(message.contains("'env'"));
            assert!(message.contains("'staging'"));
            assert!(message.contains("'prod'"));
        });

        let err = nsl
            .reconcile_status(ctx)
            .await
            .expect_err("conflicts fail the pass");
        assert!(matches!(err, Error::ProtectedLabelConflict { .. }));
        scenario.await.expect("conflict scenario ran");
    }

    #[tokio::test]
    async fn missing_namespace_sets_condition_and_requeues() {
        let (ctx, mut server) = testing_context(Settings::default());
        let nsl = Arc::new(labels_object(&[("env", "prod")]));

        let scenario = tokio::spawn(async move {
            server
                .serve("GET", CR_PATH, 200, list_of(vec![labels_object(&[("env", "prod")])]))
                .await;
            server.serve("GET", NS_PATH, 404, not_found()).await;
            let status = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
            assert_json_include!(
                actual: status,
                expected: json!({"status": {"applied": false}})
            );
            assert_eq!(
                status["status"]["conditions"][0]["reason"],
                "NamespaceNotFound"
            );
        });

        let action = nsl
            .reconcile_status(ctx)
            .await
            .expect("a missing namespace is not an error");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        scenario.await.expect("missing namespace scenario ran");
    }

    #[tokio::test]
    async fn misnamed_object_is_rejected_without_requeue() {
        let (ctx, mut server) = testing_context(Settings::default());
        let mut inner = labels_object(&[("env", "prod")]);
        inner.metadata.name = Some("custom".into());
        let nsl = Arc::new(inner);

        let scenario = tokio::spawn(async move {
            server
                .serve("GET", &format!("{CR_PATH}/labels"), 404, not_found())
                .await;
            let status = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/custom/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
            assert_eq!(status["status"]["conditions"][0]["reason"], "InvalidName");
            let message = status["status"]["message"].as_str().unwrap();
            assert!(message.contains("recreate it as 'labels'"));
        });

        let action = nsl
            .reconcile_status(ctx)
            .await
            .expect("a misnamed object is terminal, not an error");
        assert_eq!(action, Action::await_change());
        scenario.await.expect("misnamed scenario ran");
    }

    #[tokio::test]
    async fn competing_objects_are_rejected_without_requeue() {
        let (ctx, mut server) = testing_context(Settings::default());
        let nsl = Arc::new(labels_object(&[("env", "prod")]));

        let scenario = tokio::spawn(async move {
            let mut rival = labels_object(&[("env", "other")]);
            rival.metadata.name = Some("labels-two".into());
            server
                .serve(
                    "GET",
                    CR_PATH,
                    200,
                    list_of(vec![labels_object(&[("env", "prod")]), rival]),
                )
                .await;
            let status = server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/labels/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "prod")])).unwrap(),
                )
                .await;
            assert_eq!(
                status["status"]["conditions"][0]["reason"],
                "MultipleInstances"
            );
            let message = status["status"]["message"].as_str().unwrap();
            assert!(message.contains("labels-two"));
        });

        let action = nsl
            .reconcile_status(ctx)
            .await
            .expect("competing objects are terminal, not an error");
        assert_eq!(action, Action::await_change());
        scenario.await.expect("competing objects scenario ran");
    }

    #[tokio::test]
    async fn cleanup_rolls_back_owned_labels_and_clears_the_record() {
        let (ctx, mut server) = testing_context(Settings::default());
        let nsl = Arc::new(labels_object(&[("a", "1"), ("b", "2")]));

        let scenario = tokio::spawn(async move {
            server
                .serve(
                    "GET",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"a": "1", "b": "2", "c": "keep"}),
                        json!({APPLIED_ANNOTATION: "{\"a\":\"1\",\"b\":\"2\"}"}),
                    ),
                )
                .await;
            let put = server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"c": "keep"}),
                        json!({APPLIED_ANNOTATION: "{\"a\":\"1\",\"b\":\"2\"}"}),
                    ),
                )
                .await;
            assert_eq!(put["metadata"]["labels"], json!({"c": "keep"}));

            server
                .serve(
                    "GET",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"c": "keep"}),
                        json!({APPLIED_ANNOTATION: "{\"a\":\"1\",\"b\":\"2\"}"}),
                    ),
                )
                .await;
            let put = server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(json!({"c": "keep"}), json!({APPLIED_ANNOTATION: "{}"})),
                )
                .await;
            assert_eq!(
                put["metadata"]["annotations"][APPLIED_ANNOTATION],
                json!("{}")
            );

            server
                .echo("POST", "/apis/events.k8s.io/v1/namespaces/team-a/events")
                .await;
        });

        nsl.cleanup(ctx).await.expect("cleanup succeeded");
        scenario.await.expect("cleanup scenario ran");
    }

    #[tokio::test]
    async fn cleanup_for_a_stray_touches_nothing() {
        let (ctx, _server) = testing_context(Settings::default());
        let mut inner = labels_object(&[("a", "1")]);
        inner.metadata.name = Some("custom".into());

        let action = Arc::new(inner)
            .cleanup(ctx)
            .await
            .expect("stray cleanup is a no-op");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn multi_owner_merges_across_objects() {
        let settings = Settings {
            multi_owner: true,
            ..Settings::default()
        };
        let (ctx, mut server) = testing_context(settings);

        let mut beta = labels_object(&[("env", "beta-says"), ("tier", "backend")]);
        beta.metadata.name = Some("beta".into());
        let mut alpha = labels_object(&[("env", "alpha-says")]);
        alpha.metadata.name = Some("alpha".into());

        let nsl = Arc::new(beta.clone());
        let scenario = tokio::spawn(async move {
            server
                .serve("GET", CR_PATH, 200, list_of(vec![alpha, beta]))
                .await;
            server
                .serve("GET", NS_PATH, 200, namespace_json(json!(null), json!(null)))
                .await;
            let put = server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"env": "alpha-says", "tier": "backend"}),
                        json!(null),
                    ),
                )
                .await;
            // the lexicographically smallest owner wins the contested key
            assert_json_include!(
                actual: put,
                expected: json!({"metadata": {"labels": {
                    "env": "alpha-says", "tier": "backend"
                }}})
            );

            server
                .serve(
                    "GET",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"env": "alpha-says", "tier": "backend"}),
                        json!(null),
                    ),
                )
                .await;
            server
                .serve(
                    "PUT",
                    NS_PATH,
                    200,
                    namespace_json(
                        json!({"env": "alpha-says", "tier": "backend"}),
                        json!({APPLIED_ANNOTATION: "{\"env\":\"alpha-says\",\"tier\":\"backend\"}"}),
                    ),
                )
                .await;

            server
                .serve(
                    "PATCH",
                    &format!("{CR_PATH}/beta/status"),
                    200,
                    serde_json::to_value(labels_object(&[("env", "alpha-says")])).unwrap(),
                )
                .await;
        });

        nsl.reconcile_status(ctx).await.expect("multi-owner pass succeeded");
        scenario.await.expect("multi-owner scenario ran");
    }
}
