//! Controller module for Elasticsearch keystore reconciliation
//! This module contains the main controller loop, the keystore publisher and
//! convergence check, and the remote-cluster API key reconciliation.

pub mod conditions;
pub mod convergence;
pub mod es_client;
mod finalizers;
pub mod keystore;
pub mod leader;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod publisher;
mod reconciler;
pub mod remotecluster;
pub mod resources;
pub mod secret_store;
pub mod secure_settings;

pub use convergence::{reload_secure_settings_if_needed, ConvergenceState};
pub use es_client::{EsClient, EsClientProvider, HttpEsClient, HttpEsClientProvider};
pub use finalizers::ES_KEYSTORE_FINALIZER;
pub use keystore::{reconcile_if_enabled, KeystoreResources};
pub use leader::run_leader_election;
pub use reconciler::{
    reconcile_pass, requeue_after, run_controller, ControllerState, OperatorConfig, PassContext,
    PassOutcome,
};
pub use secret_store::{InMemorySecretStore, KubeSecretStore, SecretStore};
pub use secure_settings::NamespacedSecretSource;
