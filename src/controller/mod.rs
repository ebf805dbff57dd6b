//! Controller module for the Vertica operator.
//!
//! Contains the reconciliation loop, the fact cache, the image change and
//! restart orchestrators, error handling and status management.
//!
//! A pass runs these actors in order (see `reconciler`):
//! - `status_counts`: pod counts in the VerticaDB status
//! - `restart`: restart of down nodes and re-IP
//! - `version`: server version annotations
//! - `offline_image_change` / `online_image_change`: image changes

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod events;
pub mod finder;
pub mod names;
pub mod pipeline;
pub mod pod_facts;
pub mod status;
pub mod tristate;

// Actors
pub mod image_change;
pub mod offline_image_change;
pub mod online_image_change;
pub mod reconciler;
pub mod restart;
pub mod status_counts;
pub mod transient;
pub mod version;
