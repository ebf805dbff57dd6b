//! Command execution inside Vertica pods.
//!
//! Everything the operator learns about the database, and every change it
//! makes to it, goes through a [`PodRunner`]. The trait keeps the orchestration
//! code independent of the kube exec transport so it can be driven by an
//! in-memory runner in tests.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use super::paths::{ADMINTOOLS_BIN, ADMINTOOLS_CONF, SERVER_CONTAINER};

/// Replacement shown in logs for a vsql password.
const OBFUSCATED_PASSWORD: &str = "*******";

/// Captured output of a command that ran in a pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// A command in a pod could not be run or exited unsuccessfully.
///
/// The captured output is kept because callers match on it: a missing file
/// shows up in stderr, and admintools reports most failures on stdout.
#[derive(Error, Debug, Clone)]
#[error("command in pod {pod} failed: {reason}")]
pub struct ExecError {
    pub pod: String,
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
}

impl ExecError {
    pub fn new(pod: &str, reason: impl Into<String>) -> Self {
        Self {
            pod: pod.to_string(),
            reason: reason.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Attach the captured output to the error.
    pub fn with_output(mut self, output: ExecOutput) -> Self {
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self
    }
}

/// Build an argv from string slices.
pub fn command<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|p| p.as_ref().to_string()).collect()
}

/// Runs commands inside the pods of one namespace.
#[async_trait]
pub trait PodRunner: Send + Sync {
    /// Run `command` in `container` of `pod`.
    async fn exec_in_pod(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError>;

    /// Copy a local file into the container at `remote_path`.
    async fn copy_to_pod(
        &self,
        pod: &str,
        container: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<ExecOutput, ExecError>;

    /// Superuser password handed to vsql, if one is configured.
    fn password(&self) -> Option<&str>;

    /// Run vsql in the server container, adding the password when set.
    async fn exec_vsql(&self, pod: &str, args: &[String]) -> Result<ExecOutput, ExecError> {
        let mut cmd = vec!["vsql".to_string()];
        if let Some(pw) = self.password() {
            cmd.push("--password".to_string());
            cmd.push(pw.to_string());
        }
        cmd.extend_from_slice(args);
        self.exec_in_pod(pod, SERVER_CONTAINER, &cmd).await
    }

    /// Run admintools in the server container.
    async fn exec_admintools(&self, pod: &str, args: &[String]) -> Result<ExecOutput, ExecError> {
        let mut cmd = vec![ADMINTOOLS_BIN.to_string()];
        cmd.extend_from_slice(args);
        self.exec_in_pod(pod, SERVER_CONTAINER, &cmd).await
    }
}

/// Replace any password argument with a fixed mask for logging.
pub fn obfuscate_password(command: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(command.len());
    let mut hide_next = false;
    for arg in command {
        if hide_next {
            masked.push(OBFUSCATED_PASSWORD.to_string());
            hide_next = false;
            continue;
        }
        if arg == "--password" {
            hide_next = true;
        }
        masked.push(arg.clone());
    }
    masked
}

/// Log the node lines of admintools.conf so re-IP and restart failures can be
/// diagnosed from the operator log. Failures are only logged.
pub async fn debug_dump_admintools_conf(runner: &dyn PodRunner, pod: &str) {
    let cmd = command(&[
        "bash",
        "-c",
        &format!("ls -l {ADMINTOOLS_CONF} && grep '^node\\|^v_\\|^host' {ADMINTOOLS_CONF}"),
    ]);
    match runner.exec_in_pod(pod, SERVER_CONTAINER, &cmd).await {
        Ok(out) => debug!(pod = %pod, contents = %out.stdout, "admintools.conf"),
        Err(e) => debug!(pod = %pod, error = %e, "Failed to dump admintools.conf"),
    }
}

/// [`PodRunner`] backed by the Kubernetes exec subresource.
#[derive(Clone)]
pub struct KubePodRunner {
    client: Client,
    namespace: String,
    password: Option<String>,
}

impl KubePodRunner {
    pub fn new(client: Client, namespace: &str, password: Option<String>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            password,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn run(
        &self,
        pod: &str,
        command: &[String],
        params: AttachParams,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, ExecError> {
        let mut attached = self
            .pods()
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| ExecError::new(pod, e.to_string()))?;

        if let Some(data) = stdin
            && let Some(mut writer) = attached.stdin()
        {
            writer
                .write_all(&data)
                .await
                .map_err(|e| ExecError::new(pod, format!("writing stdin: {e}")))?;
            writer
                .shutdown()
                .await
                .map_err(|e| ExecError::new(pod, format!("closing stdin: {e}")))?;
        }

        let status = attached.take_status();
        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(r) = stdout_reader.as_mut() {
                r.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(r) = stderr_reader.as_mut() {
                r.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)
            .map_err(|e| ExecError::new(pod, format!("reading output: {e}")))?;
        let output = ExecOutput::new(
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
        );

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ExecError::new(pod, e.to_string()).with_output(output.clone()))?;

        match status {
            Some(s) if s.status.as_deref() != Some("Success") => {
                let reason = s
                    .message
                    .or(s.reason)
                    .unwrap_or_else(|| "command exited with failure".to_string());
                debug!(pod = %pod, reason = %reason, stderr = %output.stderr, "Command failed");
                Err(ExecError::new(pod, reason).with_output(output))
            }
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl PodRunner for KubePodRunner {
    #[instrument(skip(self, command), fields(namespace = %self.namespace))]
    async fn exec_in_pod(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        debug!(command = %obfuscate_password(command).join(" "), "Exec in pod");
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        self.run(pod, command, params, None).await
    }

    #[instrument(skip(self, local_path), fields(namespace = %self.namespace))]
    async fn copy_to_pod(
        &self,
        pod: &str,
        container: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<ExecOutput, ExecError> {
        debug!(local = %local_path.display(), "Copy file to pod");
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| ExecError::new(pod, format!("reading {}: {e}", local_path.display())))?;
        let cmd = command(&["sh", "-c", &format!("cat > {remote_path}")]);
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(true);
        self.run(pod, &cmd, params, Some(data)).await
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}
