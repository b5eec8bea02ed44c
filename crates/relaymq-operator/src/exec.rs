//! Remote command execution inside cluster members.
//!
//! Post-deploy administration (feature flags, plugin activation, queue
//! rebalancing) runs `relayctl` inside member pods over the Kubernetes exec
//! subprotocol. The boundary is a trait so the sequencer can be exercised
//! without a live cluster.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Captured output of a completed command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Synchronous command execution into a specific running cluster member.
///
/// No streaming contract: callers get the full captured stdout/stderr after
/// the command exits. A non-zero exit surfaces as
/// [`OperatorError::CommandFailed`] with both streams attached.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;
}

/// Production implementation over the Kubernetes exec subresource
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        debug!(namespace, pod, ?command, "Executing command in member");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams {
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            container: Some(container.to_string()),
            ..Default::default()
        };

        let mut attached = pods.exec(pod, command.iter().cloned(), &params).await?;

        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let status_future = attached.take_status();

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(ref mut reader) = stdout_reader {
            reader.read_to_end(&mut stdout_buf).await.ok();
        }
        if let Some(ref mut reader) = stderr_reader {
            reader.read_to_end(&mut stderr_buf).await.ok();
        }

        let status = match status_future {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.ok();

        let output = ExecOutput {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };

        let succeeded = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            // No status on the error channel means the session closed
            // cleanly without reporting failure.
            .unwrap_or(true);

        if succeeded {
            Ok(output)
        } else {
            Err(OperatorError::CommandFailed {
                pod: pod.to_string(),
                command: command.to_vec(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

/// Scripted executor for tests: records every call and replays queued
/// responses in order; an exhausted script returns empty success output.
#[cfg(test)]
pub struct RecordingPodExecutor {
    pub calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
    pub responses: std::sync::Mutex<std::collections::VecDeque<Result<ExecOutput>>>,
}

#[cfg(test)]
impl RecordingPodExecutor {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn queue_stdout(&self, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            }));
    }

    pub fn queue_failure(&self, pod: &str, stderr: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(OperatorError::CommandFailed {
                pod: pod.to_string(),
                command: vec![],
                stdout: String::new(),
                stderr: stderr.to_string(),
            }));
    }

    pub fn pods_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(pod, _)| pod.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl PodExecutor for RecordingPodExecutor {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((pod.to_string(), command.to_vec()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecOutput::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_executor_replays_script() {
        let executor = RecordingPodExecutor::new();
        executor.queue_stdout("ok");
        executor.queue_failure("broker-server-1", "boom");

        let first = executor
            .exec("default", "broker-server-0", "relaymq", &["relayctl".to_string()])
            .await
            .unwrap();
        assert_eq!(first.stdout, "ok");

        let second = executor
            .exec("default", "broker-server-1", "relaymq", &["relayctl".to_string()])
            .await;
        assert!(second.is_err());
        assert_eq!(
            executor.pods_called(),
            vec!["broker-server-0", "broker-server-1"]
        );
    }
}
