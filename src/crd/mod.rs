//! Custom Resource Definitions read by the keystore operator

mod elasticsearch;
pub mod types;


pub use elasticsearch::{
    Elasticsearch, ElasticsearchSpec, ElasticsearchStatus, DISABLE_RELOADABLE_KEYSTORE_ANNOTATION,
    REMOTE_CLUSTER_API_KEYS_MIN_VERSION,
};
pub use types::*;
