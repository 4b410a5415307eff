//! Keystore convergence across Elasticsearch nodes
//!
//! After the keystore Secret is updated, kubelet eventually refreshes the file
//! mounted in every pod. Calling the reload API makes each node load the file
//! it currently sees and report its digest. The cluster has converged once
//! every expected node reports the digest annotated on the Secret.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::es_client::EsClient;
use super::publisher::published_digest;
use super::resources::keystore_secret_name;
use super::secret_store::SecretStore;
use crate::crd::Elasticsearch;
use crate::error::Result;

pub const MSG_SECRET_NOT_CREATED: &str = "keystore secret not yet created";
pub const MSG_MISSING_DIGEST: &str = "keystore secret missing digest annotation";
pub const MSG_CACHED: &str = "keystore already converged (cached)";
pub const MSG_NOT_ALL_RESPONDED: &str = "not all expected nodes responded to reload";
pub const MSG_CONVERGED: &str = "all nodes have expected keystore digest";

/// Outcome of one convergence check
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergenceState {
    pub converged: bool,
    pub message: String,
    /// Digest every node confirmed, set when converged
    pub digest: Option<String>,
}

impl ConvergenceState {
    fn pending(message: impl Into<String>) -> Self {
        Self {
            converged: false,
            message: message.into(),
            digest: None,
        }
    }

    fn converged(message: &str, digest: &str) -> Self {
        Self {
            converged: true,
            message: message.to_string(),
            digest: Some(digest.to_string()),
        }
    }
}

/// Ask the cluster to reload its keystore unless it already reported the
/// published digest, and tell whether every expected node loaded it.
///
/// Not converging is not an error; the caller polls on its next pass.
#[instrument(skip(store, client, es, cancel), fields(name = %es.name_any(), namespace = es.namespace()))]
pub async fn reload_secure_settings_if_needed(
    store: &dyn SecretStore,
    client: &dyn EsClient,
    es: &Elasticsearch,
    cancel: &CancellationToken,
) -> Result<ConvergenceState> {
    let key = es.key();
    let Some(secret) = store
        .get(&key.namespace, &keystore_secret_name(&key.name))
        .await?
    else {
        return Ok(ConvergenceState::pending(MSG_SECRET_NOT_CREATED));
    };

    let Some(expected) = published_digest(&secret) else {
        return Ok(ConvergenceState::pending(MSG_MISSING_DIGEST));
    };

    if es.observed_keystore_digest() == Some(expected) {
        debug!("Keystore digest {} already observed on all nodes", expected);
        return Ok(ConvergenceState::converged(MSG_CACHED, expected));
    }

    let response = client.reload_secure_settings(cancel).await?;
    let expected_nodes = es.expected_node_count();

    if response.nodes.len() < expected_nodes {
        debug!(
            "{} of {} nodes responded to reload",
            response.nodes.len(),
            expected_nodes
        );
        return Ok(ConvergenceState::pending(MSG_NOT_ALL_RESPONDED));
    }

    let matching = response
        .nodes
        .values()
        .filter(|n| n.keystore_digest.as_deref() == Some(expected))
        .count();

    if matching < expected_nodes {
        return Ok(ConvergenceState::pending(format!(
            "waiting for all nodes to reload keystore ({matching}/{expected_nodes})"
        )));
    }

    info!("All {} nodes loaded keystore {}", matching, expected);
    Ok(ConvergenceState::converged(MSG_CONVERGED, expected))
}
