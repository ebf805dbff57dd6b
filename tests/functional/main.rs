// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the VerticaDB reconcilers.
//!
//! These tests drive the real reconcilers against an in-memory cluster
//! WITHOUT requiring a live Kubernetes cluster or Vertica. The mock answers
//! the probes, admintools and vsql calls the reconcilers make and applies
//! their effects, so whole image changes and restarts can be run end to end.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_offline_image_change_end_to_end
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Image change tests**: offline and online image changes, including
//!   passes that stop part way and resume
//! - **Restart tests**: cluster start, node restart and re-IP
//! - **Scenario tests**: full reconcile passes through every actor

mod mock_state;
mod restart_tests;

// Re-export for use in tests
pub use mock_state::*;
