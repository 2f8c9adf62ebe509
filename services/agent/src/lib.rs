//! stratus reconciliation agent library.
//!
//! The agent reads a desired-state manifest and periodically converges the
//! declared servers and network domains against the control plane.
//!
//! ## Modules
//!
//! - `config`: environment configuration
//! - `client`: HTTP implementation of the control plane traits
//! - `manifest`: desired-state manifest parsing
//! - `reconciler`: the reconciliation loop

pub mod client;
pub mod config;
pub mod manifest;
pub mod reconciler;

pub use client::HttpControlPlane;
pub use config::Config;
pub use manifest::Manifest;
pub use reconciler::{Reconciler, RoundSummary};
