//! Fixed paths and binaries inside the Vertica server container.

/// Container that runs the vertica process.
pub const SERVER_CONTAINER: &str = "server";

pub const ADMINTOOLS_BIN: &str = "/opt/vertica/bin/admintools";
pub const VERTICA_BIN: &str = "/opt/vertica/bin/vertica";
pub const UPDATE_VERTICA_BIN: &str = "/opt/vertica/sbin/update_vertica";
pub const PYTHON3_BIN: &str = "/opt/vertica/oss/python3/bin/python3";

pub const CONFIG_DIR: &str = "/opt/vertica/config";
pub const ADMINTOOLS_CONF: &str = "/opt/vertica/config/admintools.conf";
pub const EULA_ACCEPTANCE_FILE: &str = "/opt/vertica/config/d5415f948449e9d4c421b568f2411140.dat";
pub const EULA_ACCEPTANCE_SCRIPT: &str = "/opt/vertica/config/accept_eula.py";
pub const LOGROTATE_DIR: &str = "/opt/vertica/config/logrotate";
pub const CONFIG_SHARE_DIR: &str = "/opt/vertica/config/share";
pub const IP_MAP_FILE: &str = "/opt/vertica/config/ipMap.txt";

/// Installer indicator for one life of a VerticaDB. The uid changes when the
/// resource is recreated, so stale indicators from a prior instance are
/// ignored.
pub fn installer_indicator_file(vdb_uid: &str) -> String {
    format!("{CONFIG_DIR}/install-indicator-{vdb_uid}")
}
