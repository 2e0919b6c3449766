use std::time::Duration;

use async_trait::async_trait;
use duct::cmd;
use tracing::debug;

use super::{ClusterApi, ClusterError, ObjectSpec};
use crate::config::OrchestratorConfig;
use crate::instance::{ResourceKind, ResourceRef};

/// Substrings of kubectl/apiserver errors worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "unable to connect to the server",
    "i/o timeout",
    "tls handshake timeout",
    "serviceunavailable",
    "service unavailable",
    "toomanyrequests",
    "too many requests",
    "the server is currently unable",
    "etcdserver",
    "internal error occurred",
];

/// Drives `kubectl` against one namespace.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    kubectl: String,
    namespace: String,
    request_timeout: Duration,
}

impl KubectlCluster {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            kubectl: config.kubectl_bin.clone(),
            namespace: config.namespace.clone(),
            request_timeout: config.cluster_call_timeout(),
        }
    }

    /// Run kubectl on a blocking thread and return its stdout.
    async fn kubectl(
        &self,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<String, ClusterError> {
        let program = self.kubectl.clone();
        let mut full_args = vec![
            "--namespace".to_string(),
            self.namespace.clone(),
            format!("--request-timeout={}s", self.request_timeout.as_secs().max(1)),
        ];
        full_args.extend(args);

        tokio::task::spawn_blocking(move || {
            debug!(program = %program, args = ?full_args, "running kubectl");
            let mut expression = cmd(program.as_str(), &full_args)
                .stdout_capture()
                .stderr_capture()
                .unchecked();
            if let Some(input) = stdin {
                expression = expression.stdin_bytes(input);
            }

            let output = expression.run().map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClusterError::Rejected(format!("{program} is not installed"))
                }
                _ => ClusterError::Transient(format!("failed to run {program}: {e}")),
            })?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
            }
        })
        .await
        .map_err(|e| ClusterError::Transient(format!("kubectl task failed: {e}")))?
    }
}

/// kubectl resource types backing each object kind.
fn resource_types(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::SharedVolume | ResourceKind::WorkspaceVolume => "persistentvolumeclaim",
        ResourceKind::Workload => "deployment",
        ResourceKind::Route => "service,ingress",
    }
}

fn classify_failure(stderr: &str) -> ClusterError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("alreadyexists") || lower.contains("already exists") {
        ClusterError::Conflict(message)
    } else if lower.contains("(forbidden)") {
        ClusterError::Forbidden(message)
    } else if lower.contains("(notfound)") || lower.contains("not found") {
        ClusterError::NotFound(message)
    } else if lower.contains("timed out waiting") || lower.contains("progress deadline") {
        ClusterError::Timeout(message)
    } else if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ClusterError::Transient(message)
    } else {
        ClusterError::Rejected(message)
    }
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    async fn create(&self, spec: &ObjectSpec) -> Result<ResourceRef, ClusterError> {
        let body = serde_json::to_vec(&spec.manifest)
            .map_err(|e| ClusterError::Rejected(format!("unserializable manifest: {e}")))?;

        // A route is a service plus an ingress; apply completes a half-created pair
        let verb = match spec.kind {
            ResourceKind::Route => "apply",
            _ => "create",
        };
        self.kubectl(
            vec![verb.to_string(), "-f".to_string(), "-".to_string()],
            Some(body),
        )
        .await?;
        Ok(spec.reference())
    }

    async fn delete(&self, object: &ResourceRef) -> Result<(), ClusterError> {
        self.kubectl(
            vec![
                "delete".to_string(),
                resource_types(object.kind).to_string(),
                object.name.clone(),
                "--wait=false".to_string(),
            ],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn exists(&self, object: &ResourceRef) -> Result<bool, ClusterError> {
        let result = self
            .kubectl(
                vec![
                    "get".to_string(),
                    resource_types(object.kind).to_string(),
                    object.name.clone(),
                    "-o".to_string(),
                    "name".to_string(),
                ],
                None,
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn wait_ready(
        &self,
        object: &ResourceRef,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        match object.kind {
            ResourceKind::Workload => self
                .kubectl(
                    vec![
                        "rollout".to_string(),
                        "status".to_string(),
                        format!("deployment/{}", object.name),
                        format!("--timeout={}s", timeout.as_secs().max(1)),
                    ],
                    None,
                )
                .await
                .map(|_| ()),
            // Volumes bind on first use and routes have no readiness of their own
            _ => {
                if self.exists(object).await? {
                    Ok(())
                } else {
                    Err(ClusterError::NotFound(object.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(
                r#"Error from server (AlreadyExists): persistentvolumeclaims "alice-shared" already exists"#
            ),
            ClusterError::Conflict(_)
        ));
        assert!(matches!(
            classify_failure(r#"Error from server (NotFound): deployments.apps "alice-1" not found"#),
            ClusterError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure(
                r#"Error from server (Forbidden): deployments.apps is forbidden: User "x" cannot create"#
            ),
            ClusterError::Forbidden(_)
        ));
        assert!(matches!(
            classify_failure("The connection to the server 10.0.0.1:6443 was refused - did you specify the right host or port?\nconnection refused"),
            ClusterError::Transient(_)
        ));
        assert!(matches!(
            classify_failure("error: timed out waiting for the condition"),
            ClusterError::Timeout(_)
        ));
        assert!(matches!(
            classify_failure("error: error validating data: unknown field \"spek\""),
            ClusterError::Rejected(_)
        ));
    }

    #[test]
    fn test_resource_types() {
        assert_eq!(resource_types(ResourceKind::SharedVolume), "persistentvolumeclaim");
        assert_eq!(resource_types(ResourceKind::Workload), "deployment");
        assert_eq!(resource_types(ResourceKind::Route), "service,ingress");
    }
}
