//! Parsing of admintools, vsql and vertica command output.
//!
//! All parsing functions are pure: they take the stdout captured from a pod
//! exec and return structured data, so they can be tested without a cluster.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

/// Errors that can occur during parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Node state reported for nodes accepting connections.
pub const STATE_UP: &str = "UP";

/// Parse the table printed by `admintools -t list_allnodes`.
///
/// The first two lines are the column header and its separator:
/// ```text
///  Node          | Host       | State | Version                 | DB
/// ---------------+------------+-------+-------------------------+----
///  v_db_node0001 | 10.244.1.6 | UP    | vertica-11.0.0.20210309 | db
/// ```
/// Returns a map of vnode name to state. Lines with fewer than four columns
/// are ignored.
pub fn parse_cluster_node_status(stdout: &str) -> BTreeMap<String, String> {
    const HEADER_LINES: usize = 2;
    const MIN_COLUMNS: usize = 4;

    stdout
        .split('\n')
        .skip(HEADER_LINES)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('|').collect();
            if cols.len() < MIN_COLUMNS {
                return None;
            }
            let vnode = cols.first()?.trim();
            let state = cols.get(2)?.trim();
            Some((vnode.to_string(), state.to_string()))
        })
        .collect()
}

/// Parse the compat21 node lines grepped out of admintools.conf.
///
/// Each line looks like `node0001 = 10.244.1.95,/data,/data`. Returns a
/// lookup of compat21 node name to the IP recorded for it. Badly formed
/// lines are skipped.
pub fn parse_admintools_conf_ips(node_text: &str) -> Result<BTreeMap<String, String>, ParseError> {
    let re = Regex::new(r"^(node\d{4}) = ([\d.:a-fA-F]+),")
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    let mut ips = BTreeMap::new();
    for line in node_text.split('\n') {
        if let Some(caps) = re.captures(line)
            && let (Some(node), Some(ip)) = (caps.get(1), caps.get(2))
        {
            ips.insert(node.as_str().to_string(), ip.as_str().to_string());
        }
    }
    Ok(ips)
}

/// Extract the compat21 node name from a single admintools.conf line.
pub fn parse_compat21_node_name(line: &str) -> Result<Option<String>, ParseError> {
    let re =
        Regex::new(r"^(node\d{4}) = .*").map_err(|e| ParseError::RegexCompilation(e.to_string()))?;
    Ok(re
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string()))
}

/// Extract the vnode name from the data directory listing.
///
/// `ls -d /data/vertdb/v_vertdb_node0001_data` yields `v_vertdb_node0001`.
/// Returns an empty string when nothing matches.
pub fn parse_vnode_name(stdout: &str) -> Result<String, ParseError> {
    let re = Regex::new(r"(v_.+_node\d+)_data")
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;
    Ok(re
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

/// Fields parsed out of `vertica --version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionOutput {
    /// Version, e.g. `v11.1.0-0`.
    pub version: Option<String>,
    /// Build reference, e.g. `releng@5d6d1e1d`.
    pub build_ref: Option<String>,
    /// Build date, e.g. `Thu Jan 13 21:29:58 UTC 2022`.
    pub build_date: Option<String>,
}

impl VersionOutput {
    /// Parse from the stdout of `/opt/vertica/bin/vertica --version`.
    ///
    /// ```text
    /// Vertica Analytic Database v11.1.0-0
    /// vertica(v11.1.0-0) built by @re-docker5 from master@ae6ac4d on 'Thu Jan 13 21:29:58 UTC 2022' $BuildId$
    /// ```
    pub fn parse(stdout: &str) -> Result<Self, ParseError> {
        let capture = |pattern: &str| -> Result<Option<String>, ParseError> {
            let re =
                Regex::new(pattern).map_err(|e| ParseError::RegexCompilation(e.to_string()))?;
            Ok(re
                .captures(stdout)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()))
        };

        Ok(VersionOutput {
            version: capture(r"(v[0-9a-zA-Z.-]+)\n")?,
            build_ref: capture(r"built by .* from .*@([^ ]+) ")?,
            build_date: capture(r"on '([A-Za-z0-9: ]+)'")?,
        })
    }
}

/// Whether the active-session count query reports any sessions.
///
/// The query is run with `-tA`, so the first line is the bare count.
pub fn has_active_sessions(stdout: &str) -> bool {
    let first = stdout.split('\n').next().unwrap_or("");
    first.trim() != "0"
}
