//! Access to the managed cluster.
//!
//! The operator never talks to Vertica over the network. It runs admintools,
//! vsql and shell commands inside the server container of each pod, and it
//! reads and writes Kubernetes objects through the API server.
//!
//! ## Architecture
//!
//! - `pod_runner`: `PodRunner` trait and the kube exec implementation
//! - `cluster_api`: `ClusterApi` trait and the kube client implementation
//! - `parsing`: pure parsers for admintools, vsql and vertica output
//! - `paths`: fixed locations inside the server container
//!
//! ## Example
//!
//! ```rust,ignore
//! use vertica_operator::client::{KubePodRunner, PodRunner, command};
//!
//! let runner = KubePodRunner::new(client, "vertica", None);
//! let out = runner.exec_admintools("vertdb-main-0", &command(&["-t", "list_allnodes"])).await?;
//! let states = parse_cluster_node_status(&out.stdout);
//! ```

pub mod cluster_api;
pub mod parsing;
pub mod paths;
pub mod pod_runner;

pub use cluster_api::{ClusterApi, KubeClusterApi};
pub use parsing::{ParseError, VersionOutput, parse_cluster_node_status};
pub use pod_runner::{
    ExecError, ExecOutput, KubePodRunner, PodRunner, command, debug_dump_admintools_conf,
};
