//! Main reconciler for Elasticsearch resources
//!
//! Implements the controller pattern using kube-rs runtime. One pass runs, in
//! order, the keystore reconciliation, the convergence check and the
//! remote-cluster pass, then records the outcome in the status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{
    remove_condition, set_condition, set_condition_bool, set_observed_generation,
    CONDITION_STATUS_FALSE, CONDITION_TYPE_KEYSTORE_CONVERGED, CONDITION_TYPE_KEYSTORE_READY,
    CONDITION_TYPE_REMOTE_CLUSTERS_READY, REASON_CONVERGED, REASON_DISABLED, REASON_PUBLISHED,
    REASON_RECONCILED, REASON_RECONCILE_FAILED, REASON_RELOADING, REASON_WAITING_FOR_CERTIFICATES,
};
use super::convergence::{reload_secure_settings_if_needed, ConvergenceState};
use super::es_client::{EsClientProvider, HttpEsClientProvider};
use super::finalizers::{self, ES_KEYSTORE_FINALIZER};
use super::keystore::{self, KeystoreResources};
use super::publisher::Metadata;
use super::remotecluster::{
    reconcile_remote_clusters, PendingChangesRegistry, RemoteClusterContext, RemoteClustersSummary,
};
use super::secret_store::{KubeSecretStore, SecretStore};
use crate::crd::{Elasticsearch, ElasticsearchStatus};
use crate::error::{Error, Result};
use crate::keystore::{KeystoreConfig, CONFIG};

const FIELD_MANAGER: &str = "keystore-operator";

/// Delay between convergence checks while nodes reload the keystore
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before a follower checks again whether it became leader
pub const FOLLOWER_REQUEUE: Duration = Duration::from_secs(15);

/// Upper bound of a single pass, Elasticsearch calls included
pub const PASS_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime settings of the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Only watch this namespace, all namespaces when unset
    pub namespace: Option<String>,
    /// Periodic resync once a cluster is converged
    pub requeue_interval: Duration,
    pub es_request_timeout: Duration,
    pub insecure_skip_tls_verify: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: Duration::from_secs(300),
            es_request_timeout: Duration::from_secs(30),
            insecure_skip_tls_verify: false,
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub store: Arc<dyn SecretStore>,
    pub registry: Arc<PendingChangesRegistry>,
    pub es_clients: Arc<dyn EsClientProvider>,
    pub config: OperatorConfig,
    /// Set by leader election, followers do not reconcile
    pub is_leader: Arc<AtomicBool>,
    /// Cancelled on shutdown, parent of every pass token
    pub shutdown: CancellationToken,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig, is_leader: Arc<AtomicBool>) -> Self {
        let store: Arc<dyn SecretStore> = Arc::new(KubeSecretStore::new(client.clone()));
        let es_clients = Arc::new(HttpEsClientProvider::new(
            store.clone(),
            config.es_request_timeout,
            config.insecure_skip_tls_verify,
        ));
        Self {
            client,
            store,
            registry: Arc::new(PendingChangesRegistry::new()),
            es_clients,
            config,
            is_leader,
            shutdown: CancellationToken::new(),
        }
    }

    fn elasticsearch_api(&self) -> Api<Elasticsearch> {
        match &self.config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let elasticsearches = state.elasticsearch_api();
    let secrets: Api<Secret> = match &state.config.namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };

    info!("Starting Elasticsearch keystore controller");

    match elasticsearches.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Elasticsearch CRD is available"),
        Err(e) => {
            error!(
                "Elasticsearch CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "Elasticsearch CRD not installed".to_string(),
            ));
        }
    }

    let shutdown = state.shutdown.clone();
    Controller::new(elasticsearches, Config::default())
        // keystore and catalog Secrets carry an owner reference
        .owns::<Secret>(secrets, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    shutdown.cancel();
    Ok(())
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Elasticsearch>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconciliation");
        return Ok(Action::requeue(FOLLOWER_REQUEUE));
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &namespace);
    let started = Instant::now();

    let result = finalizer(&api, ES_KEYSTORE_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(es) => apply_elasticsearch(&ctx, &es).await,
            FinalizerEvent::Cleanup(es) => cleanup_elasticsearch(&ctx, &es).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        "keystore",
        started.elapsed().as_secs_f64(),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

/// Run one pass and publish its outcome in the status
async fn apply_elasticsearch(ctx: &ControllerState, es: &Elasticsearch) -> Result<Action> {
    let all = ctx
        .elasticsearch_api()
        .list(&ListParams::default())
        .await?
        .items;

    let cancel = ctx.shutdown.child_token();
    let pass_ctx = PassContext {
        store: ctx.store.as_ref(),
        registry: &ctx.registry,
        es_clients: ctx.es_clients.as_ref(),
        cancel: &cancel,
        keystore_config: &CONFIG,
    };
    let outcome = match tokio::time::timeout(PASS_TIMEOUT, reconcile_pass(&pass_ctx, es, &all)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            cancel.cancel();
            return Err(Error::Cancelled);
        }
    };

    #[cfg(feature = "metrics")]
    record_convergence(es, outcome.converged);

    patch_status(&ctx.client, es, &outcome.status).await?;

    let action = outcome.next_action(&ctx.config);
    Error::aggregate(outcome.errors)?;
    Ok(action)
}

#[cfg(feature = "metrics")]
fn record_convergence(es: &Elasticsearch, converged: Option<bool>) {
    if let Some(converged) = converged {
        let key = es.key();
        super::metrics::set_keystore_converged(&key.namespace, &key.name, converged);
    }
}

#[instrument(skip(ctx, es), fields(name = %es.name_any(), namespace = es.namespace()))]
async fn cleanup_elasticsearch(ctx: &ControllerState, es: &Elasticsearch) -> Result<Action> {
    finalizers::cleanup(ctx.store.as_ref(), &ctx.registry, es).await?;
    info!("Cleanup complete for Elasticsearch {}", es.key());
    Ok(Action::await_change())
}

/// Dependencies of a single pass
pub struct PassContext<'a> {
    pub store: &'a dyn SecretStore,
    pub registry: &'a PendingChangesRegistry,
    pub es_clients: &'a dyn EsClientProvider,
    pub cancel: &'a CancellationToken,
    pub keystore_config: &'a KeystoreConfig,
}

/// Result of a pass: the status to record and what went wrong
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub status: ElasticsearchStatus,
    pub keystore: Option<KeystoreResources>,
    /// `None` when convergence was not checked
    pub converged: Option<bool>,
    pub remote_clusters: Option<RemoteClustersSummary>,
    pub errors: Vec<Error>,
}

impl PassOutcome {
    /// Poll quickly while nodes are reloading, resync slowly otherwise
    pub fn next_action(&self, config: &OperatorConfig) -> Action {
        let waiting_for_ca = self
            .remote_clusters
            .as_ref()
            .map(|s| !s.is_ready())
            .unwrap_or(false);
        if self.converged == Some(false) || waiting_for_ca {
            Action::requeue(RELOAD_POLL_INTERVAL)
        } else {
            Action::requeue(config.requeue_interval)
        }
    }
}

/// One reconciliation of `es` against the current list of clusters.
///
/// Steps do not short-circuit each other: a failing keystore does not prevent
/// the remote-cluster pass. Every failure ends up in the outcome's errors and
/// in the matching condition.
pub async fn reconcile_pass(
    ctx: &PassContext<'_>,
    es: &Elasticsearch,
    all: &[Elasticsearch],
) -> PassOutcome {
    let mut outcome = PassOutcome {
        status: ElasticsearchStatus {
            observed_keystore_digest: es.observed_keystore_digest().map(str::to_string),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut conditions = es.conditions().to_vec();

    match keystore::reconcile_if_enabled_with(
        ctx.store,
        es,
        &Metadata::default(),
        &[],
        ctx.keystore_config,
    )
    .await
    {
        Ok(Some(resources)) => {
            set_condition_bool(
                &mut conditions,
                CONDITION_TYPE_KEYSTORE_READY,
                true,
                REASON_PUBLISHED,
                &format!("keystore published in {}", resources.secret_name),
            );
            outcome.keystore = Some(resources);
        }
        Ok(None) => {
            set_condition_bool(
                &mut conditions,
                CONDITION_TYPE_KEYSTORE_READY,
                false,
                REASON_DISABLED,
                "reloadable keystore is not enabled for this cluster",
            );
            remove_condition(&mut conditions, CONDITION_TYPE_KEYSTORE_CONVERGED);
            outcome.status.observed_keystore_digest = None;
        }
        Err(e) => {
            warn!("Keystore reconciliation failed: {}", e);
            set_condition_bool(
                &mut conditions,
                CONDITION_TYPE_KEYSTORE_READY,
                false,
                REASON_RECONCILE_FAILED,
                &e.to_string(),
            );
            outcome.errors.push(e);
        }
    }

    if outcome.keystore.is_some() {
        match check_convergence(ctx, es).await {
            Ok(state) => {
                let reason = if state.converged {
                    REASON_CONVERGED
                } else {
                    REASON_RELOADING
                };
                set_condition_bool(
                    &mut conditions,
                    CONDITION_TYPE_KEYSTORE_CONVERGED,
                    state.converged,
                    reason,
                    &state.message,
                );
                if let Some(digest) = state.digest {
                    outcome.status.observed_keystore_digest = Some(digest);
                }
                outcome.converged = Some(state.converged);
            }
            Err(e) => {
                debug!("Keystore convergence check failed: {}", e);
                set_condition(
                    &mut conditions,
                    CONDITION_TYPE_KEYSTORE_CONVERGED,
                    CONDITION_STATUS_FALSE,
                    REASON_RECONCILE_FAILED,
                    &e.to_string(),
                );
                outcome.converged = Some(false);
                outcome.errors.push(e);
            }
        }
    }

    let remote_ctx = RemoteClusterContext {
        store: ctx.store,
        registry: ctx.registry,
        es_clients: ctx.es_clients,
        cancel: ctx.cancel,
    };
    match reconcile_remote_clusters(&remote_ctx, es, all).await {
        Ok(summary) => {
            let (reason, message) = if summary.is_ready() {
                (
                    REASON_RECONCILED,
                    format!("{} remote cluster association(s) reconciled", summary.associations),
                )
            } else {
                (
                    REASON_WAITING_FOR_CERTIFICATES,
                    format!(
                        "waiting for transport CA of {} cluster(s)",
                        summary.waiting_for_ca.len()
                    ),
                )
            };
            set_condition_bool(
                &mut conditions,
                CONDITION_TYPE_REMOTE_CLUSTERS_READY,
                summary.is_ready(),
                reason,
                &message,
            );
            outcome.remote_clusters = Some(summary);
        }
        Err(e) => {
            warn!("Remote cluster reconciliation failed: {}", e);
            set_condition_bool(
                &mut conditions,
                CONDITION_TYPE_REMOTE_CLUSTERS_READY,
                false,
                REASON_RECONCILE_FAILED,
                &e.to_string(),
            );
            outcome.errors.push(e);
        }
    }

    set_observed_generation(&mut conditions, es.metadata.generation);
    outcome.status.conditions = conditions;
    outcome.status.observed_generation = es.metadata.generation;
    outcome
}

async fn check_convergence(ctx: &PassContext<'_>, es: &Elasticsearch) -> Result<ConvergenceState> {
    let client = ctx.es_clients.client_for(es).await?;
    reload_secure_settings_if_needed(ctx.store, client.as_ref(), es, ctx.cancel).await
}

/// Patch the fields this operator owns in the status subresource
async fn patch_status(client: &Client, es: &Elasticsearch, status: &ElasticsearchStatus) -> Result<()> {
    let namespace = es.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({
        "status": {
            "observedKeystoreDigest": status.observed_keystore_digest,
            "observedGeneration": status.observed_generation,
            "conditions": status.conditions,
        }
    });
    api.patch_status(
        &es.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// How long to wait before retrying after `error`
pub fn requeue_after(error: &Error) -> Duration {
    if error.is_conflict() {
        Duration::from_secs(1)
    } else if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(es: Arc<Elasticsearch>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", es.key(), error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(error.kind());

    Action::requeue(requeue_after(error))
}
