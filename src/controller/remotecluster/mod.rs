//! Remote clusters: CA exchange, cross-cluster API keys and their catalog

pub mod apikey;
pub mod catalog;
pub mod controller;
pub mod pending;
pub mod remote_ca;

pub use catalog::{alias_from_credentials_key, credentials_key, ApiKeyCatalog};
pub use controller::{
    get_expected_remote_clusters, reconcile_remote_clusters, RemoteClusterContext,
    RemoteClustersSummary,
};
pub use pending::{PendingChange, PendingChanges, PendingChangesRegistry};
pub use remote_ca::delete_all_remote_cas;
