//! runway - idempotent provisioning for an n8n deployment on Cloud Run
//!
//! This crate turns deployment parameters into a dependency-ordered plan of
//! managed resources (database, secrets, identity, storage, the service
//! itself) and reconciles remote state towards it: create what is missing,
//! update what diverged, touch nothing that already matches. Teardown runs
//! the same graph in reverse.

pub mod config;
pub mod destroy;
pub mod graph;
pub mod labels;
pub mod model;
pub mod plan;
pub mod provider;
pub mod reconcile;
pub mod secrets;
pub mod wait;
