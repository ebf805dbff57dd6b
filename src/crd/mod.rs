//! Custom Resource Definitions (CRDs) for vertica-operator.
//!
//! - `VerticaDB`: desired state of a Vertica database and its subclusters

mod vertica_db;

pub use vertica_db::*;
