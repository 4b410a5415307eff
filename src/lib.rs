//! es-keystore-k8s: reloadable Elasticsearch keystore for Kubernetes
//!
//! This crate builds the Elasticsearch keystore file from secure settings
//! Secrets, publishes it for the pods to mount, checks that every node
//! reloaded it, and manages the cross-cluster API keys remote clusters
//! authenticate with.

pub mod controller;
pub mod crd;
pub mod error;
pub mod keystore;

pub use crate::error::{Error, Result};
