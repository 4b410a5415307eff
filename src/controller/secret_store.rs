//! Secret storage used by the keystore and remote-cluster controllers
//!
//! Controllers only talk to storage through [`SecretStore`]. The kube-backed
//! implementation is used at runtime, the in-memory one backs unit and
//! integration tests and enforces the same optimistic concurrency rules as the
//! API server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Conditions a delete must satisfy to go through
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletePreconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl DeletePreconditions {
    fn is_empty(&self) -> bool {
        self.uid.is_none() && self.resource_version.is_none()
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a Secret, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// List Secrets matching all the given labels, in one namespace or cluster-wide
    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>>;

    /// Create a Secret, failing with a conflict if it already exists
    async fn create(&self, secret: &Secret) -> Result<Secret>;

    /// Replace a Secret. A resource version set on `secret` acts as a precondition.
    async fn replace(&self, secret: &Secret) -> Result<Secret>;

    /// Delete a Secret. Deleting a missing Secret succeeds.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: DeletePreconditions,
    ) -> Result<()>;
}

fn secret_namespace(secret: &Secret) -> Result<String> {
    secret
        .namespace()
        .ok_or_else(|| Error::ValidationError(format!("Secret {} has no namespace", secret.name_any())))
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`SecretStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>> {
        let api: Api<Secret> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret_namespace(secret)?;
        Ok(self
            .api(&namespace)
            .create(&PostParams::default(), secret)
            .await?)
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret_namespace(secret)?;
        Ok(self
            .api(&namespace)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: DeletePreconditions,
    ) -> Result<()> {
        let params = DeleteParams {
            preconditions: (!preconditions.is_empty()).then(|| Preconditions {
                uid: preconditions.uid,
                resource_version: preconditions.resource_version,
            }),
            ..Default::default()
        };
        match self.api(namespace).delete(name, &params).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Secret {}/{} already deleted", namespace, name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory [`SecretStore`] with API-server-like resource versions
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<(String, String), Secret>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a Secret as-is, bypassing concurrency checks
    pub fn insert(&self, secret: Secret) {
        let mut secret = secret;
        self.stamp(&mut secret, true);
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.secrets.write().insert(key, secret);
    }

    /// Number of create, replace and delete calls that changed the store
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    fn stamp(&self, secret: &mut Secret, new_uid: bool) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        secret.metadata.resource_version = Some(version.to_string());
        if new_uid || secret.metadata.uid.is_none() {
            secret.metadata.uid = Some(format!("uid-{version}"));
        }
    }
}

fn matches_labels(secret: &Secret, labels: &BTreeMap<String, String>) -> bool {
    let actual = secret.labels();
    labels.iter().all(|(k, v)| actual.get(k) == Some(v))
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>> {
        Ok(self
            .secrets
            .read()
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .filter(|(_, s)| matches_labels(s, labels))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn create(&self, secret: &Secret) -> Result<Secret> {
        let key = (secret_namespace(secret)?, secret.name_any());
        let mut secrets = self.secrets.write();
        if secrets.contains_key(&key) {
            return Err(Error::ConflictError(format!(
                "secrets \"{}\" already exists",
                key.1
            )));
        }
        let mut created = secret.clone();
        self.stamp(&mut created, true);
        secrets.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret> {
        let key = (secret_namespace(secret)?, secret.name_any());
        let mut secrets = self.secrets.write();
        let existing = secrets
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("secrets \"{}\" not found", key.1)))?;
        if let Some(rv) = &secret.metadata.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::ConflictError(format!(
                    "the object has been modified: secrets \"{}\"",
                    key.1
                )));
            }
        }
        let mut replaced = secret.clone();
        replaced.metadata.uid = existing.metadata.uid.clone();
        self.stamp(&mut replaced, false);
        secrets.insert(key, replaced.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: DeletePreconditions,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut secrets = self.secrets.write();
        let Some(existing) = secrets.get(&key) else {
            return Ok(());
        };
        if let Some(uid) = &preconditions.uid {
            if existing.metadata.uid.as_ref() != Some(uid) {
                return Err(Error::ConflictError(format!(
                    "precondition failed: UID in precondition: {uid}"
                )));
            }
        }
        if let Some(rv) = &preconditions.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::ConflictError(format!(
                    "precondition failed: ResourceVersion in precondition: {rv}"
                )));
            }
        }
        secrets.remove(&key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create or update a Secret so that its data, labels and annotations match
/// `expected`. Labels and annotations set by others are preserved. Returns the
/// stored Secret, unchanged when nothing differs.
pub async fn reconcile_secret(
    store: &dyn SecretStore,
    expected: Secret,
    owner: Option<OwnerReference>,
) -> Result<Secret> {
    let namespace = secret_namespace(&expected)?;
    let name = expected.name_any();

    let mut expected = expected;
    if let Some(owner) = &owner {
        expected.metadata.owner_references = Some(vec![owner.clone()]);
    }

    let Some(existing) = store.get(&namespace, &name).await? else {
        debug!("Creating Secret {}/{}", namespace, name);
        return store.create(&expected).await;
    };

    if secret_up_to_date(&existing, &expected) {
        return Ok(existing);
    }

    let mut updated = existing.clone();
    updated
        .labels_mut()
        .extend(expected.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    updated.annotations_mut().extend(
        expected
            .annotations()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    if owner.is_some() {
        updated.metadata.owner_references = expected.metadata.owner_references.clone();
    }
    updated.data = expected.data.clone();
    updated.string_data = None;

    debug!("Updating Secret {}/{}", namespace, name);
    store.replace(&updated).await
}

fn secret_up_to_date(existing: &Secret, expected: &Secret) -> bool {
    let subset = |actual: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>| {
        wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
    };
    let owners_match = expected.metadata.owner_references.is_none()
        || existing.metadata.owner_references == expected.metadata.owner_references;
    existing.data.clone().unwrap_or_default() == expected.data.clone().unwrap_or_default()
        && subset(existing.labels(), expected.labels())
        && subset(existing.annotations(), expected.annotations())
        && owners_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let store = InMemorySecretStore::new();
        let created = store.create(&secret("s", &[("a", "1")])).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert!(created.metadata.uid.is_some());

        let err = store.create(&secret("s", &[])).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_replace_with_stale_resource_version_conflicts() {
        let store = InMemorySecretStore::new();
        let created = store.create(&secret("s", &[("a", "1")])).await.unwrap();

        let mut first = created.clone();
        first.data = secret("s", &[("a", "2")]).data;
        store.replace(&first).await.unwrap();

        let mut stale = created;
        stale.data = secret("s", &[("a", "3")]).data;
        assert!(store.replace(&stale).await.unwrap_err().is_conflict());
    }

    #[test]
    fn test_delete_preconditions() {
        let store = InMemorySecretStore::new();
        let created = assert_ok!(block_on(store.create(&secret("s", &[]))));

        let wrong = DeletePreconditions {
            uid: Some("other".to_string()),
            resource_version: None,
        };
        let err = assert_err!(block_on(store.delete("ns", "s", wrong)));
        assert!(err.is_conflict());

        let right = DeletePreconditions {
            uid: created.metadata.uid.clone(),
            resource_version: created.metadata.resource_version.clone(),
        };
        assert_ok!(block_on(store.delete("ns", "s", right)));
        assert!(store.is_empty());

        // missing secrets are not an error
        assert_ok!(block_on(store.delete("ns", "s", DeletePreconditions::default())));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let store = InMemorySecretStore::new();
        let mut labelled = secret("a", &[]);
        labelled
            .labels_mut()
            .insert("type".to_string(), "remote-ca".to_string());
        store.insert(labelled);
        store.insert(secret("b", &[]));

        let selector = BTreeMap::from([("type".to_string(), "remote-ca".to_string())]);
        let found = store.list(Some("ns"), &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
        assert!(store.list(Some("other"), &selector).await.unwrap().is_empty());
        assert_eq!(store.list(None, &BTreeMap::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_secret_is_idempotent() {
        let store = InMemorySecretStore::new();
        let mut expected = secret("s", &[("ca.crt", "pem")]);
        expected
            .labels_mut()
            .insert("k".to_string(), "v".to_string());

        reconcile_secret(&store, expected.clone(), None).await.unwrap();
        reconcile_secret(&store, expected.clone(), None).await.unwrap();
        assert_eq!(store.write_count(), 1);

        expected.data = secret("s", &[("ca.crt", "rotated")]).data;
        let updated = reconcile_secret(&store, expected, None).await.unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(
            updated.data.clone().unwrap()["ca.crt"],
            ByteString(b"rotated".to_vec())
        );
        assert_eq!(updated.labels()["k"], "v");
    }
}
