//! Helm-backed chart operations.

use std::process::Stdio;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Helm release states that count as settled; anything else is a pending
/// operation left behind by an interrupted install or upgrade.
const SETTLED: [&str; 2] = ["deployed", "superseded"];

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("helm {op} failed: {stderr}")]
    Helm { op: &'static str, stderr: String },
    #[error("running helm: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("decoding helm output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("encoding values: {0}")]
    Values(#[from] serde_yaml::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// What a chart-backed component needs from the cluster.
#[async_trait::async_trait]
pub trait ChartBackend: Send + Sync {
    /// Release status string (`deployed`, `pending-install`, ...), `None` when absent.
    async fn release_status(&self, release: &str, namespace: &str) -> Result<Option<String>, ChartError>;
    async fn upgrade_install(
        &self,
        release: &str,
        chart: &str,
        version: &str,
        namespace: &str,
        values: &serde_json::Value,
    ) -> Result<(), ChartError>;
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<(), ChartError>;
    /// True when every named deployment has rolled out.
    async fn deployments_ready(&self, namespace: &str, names: &[String]) -> bool;
    /// Remove release records stuck in a pending state; returns how many.
    async fn clear_pending(&self, release: &str, namespace: &str) -> Result<usize, ChartError>;
}

#[derive(Deserialize)]
struct StatusDoc {
    info: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    status: String,
}

/// Extract the release status from `helm status -o json` output.
pub fn parse_release_status(raw: &[u8]) -> Result<String, serde_json::Error> {
    let doc: StatusDoc = serde_json::from_slice(raw)?;
    Ok(doc.info.status)
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found")
}

/// A deployment is rolled out once the controller observed its latest spec
/// and the desired replicas are ready.
pub fn deployment_rolled_out(d: &Deployment) -> bool {
    let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(st) = d.status.as_ref() else { return want == 0 };
    let observed = st.observed_generation.unwrap_or(0) >= d.metadata.generation.unwrap_or(0);
    observed && st.ready_replicas.unwrap_or(0) >= want && st.updated_replicas.unwrap_or(0) >= want
}

/// Runs the helm binary and reads deployments and release secrets through kube.
pub struct HelmBackend {
    helm: String,
    client: Client,
}

impl HelmBackend {
    pub fn new(helm: impl Into<String>, client: Client) -> Self {
        Self { helm: helm.into(), client }
    }

    async fn run(&self, op: &'static str, args: &[&str], stdin: Option<Vec<u8>>) -> Result<std::process::Output, ChartError> {
        debug!(op, ?args, "helm");
        let mut cmd = Command::new(&self.helm);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await?;
            drop(pipe);
        }
        let out = child.wait_with_output().await?;
        metrics::counter!("keel_helm_invocations_total", 1u64, "op" => op, "ok" => out.status.success().to_string());
        Ok(out)
    }
}

fn stderr_of(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

#[async_trait::async_trait]
impl ChartBackend for HelmBackend {
    async fn release_status(&self, release: &str, namespace: &str) -> Result<Option<String>, ChartError> {
        let out = self.run("status", &["status", release, "-n", namespace, "-o", "json"], None).await?;
        if !out.status.success() {
            let stderr = stderr_of(&out);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(ChartError::Helm { op: "status", stderr });
        }
        Ok(Some(parse_release_status(&out.stdout)?))
    }

    async fn upgrade_install(
        &self,
        release: &str,
        chart: &str,
        version: &str,
        namespace: &str,
        values: &serde_json::Value,
    ) -> Result<(), ChartError> {
        let values = serde_yaml::to_string(values)?;
        let args = [
            "upgrade", "--install", release, chart, "--version", version, "-n", namespace, "--create-namespace", "-f", "-",
        ];
        let out = self.run("upgrade", &args, Some(values.into_bytes())).await?;
        if !out.status.success() {
            return Err(ChartError::Helm { op: "upgrade", stderr: stderr_of(&out) });
        }
        info!(release, chart, version, namespace, "release applied");
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<(), ChartError> {
        let out = self.run("uninstall", &["uninstall", release, "-n", namespace], None).await?;
        if !out.status.success() {
            let stderr = stderr_of(&out);
            if is_not_found(&stderr) {
                return Ok(());
            }
            return Err(ChartError::Helm { op: "uninstall", stderr });
        }
        info!(release, namespace, "release removed");
        Ok(())
    }

    async fn deployments_ready(&self, namespace: &str, names: &[String]) -> bool {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let checks = names.iter().map(|n| {
            let api = api.clone();
            async move {
                match api.get_opt(n).await {
                    Ok(Some(d)) => deployment_rolled_out(&d),
                    Ok(None) => false,
                    Err(e) => {
                        debug!(deployment = %n, error = %e, "deployment lookup failed");
                        false
                    }
                }
            }
        });
        join_all(checks).await.into_iter().all(|ok| ok)
    }

    async fn clear_pending(&self, release: &str, namespace: &str) -> Result<usize, ChartError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("owner=helm,name={release}"));
        let mut cleared = 0;
        for s in api.list(&lp).await?.items {
            let status = s.labels().get("status").cloned().unwrap_or_default();
            if SETTLED.contains(&status.as_str()) {
                continue;
            }
            api.delete(&s.name_any(), &DeleteParams::default()).await?;
            info!(secret = %s.name_any(), %status, "pending release record removed");
            cleared += 1;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    #[test]
    fn parses_helm_status_json() {
        let raw = br#"{"name":"x","info":{"status":"pending-upgrade","description":"Upgrade"},"version":3}"#;
        assert_eq!(parse_release_status(raw).unwrap(), "pending-upgrade");
        assert!(parse_release_status(b"not json").is_err());
    }

    fn deployment(gen: i64, replicas: i32, observed: i64, ready: i32, updated: i32) -> Deployment {
        let mut d = Deployment {
            spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..Default::default()
            }),
            ..Default::default()
        };
        d.metadata.generation = Some(gen);
        d
    }

    #[test]
    fn rollout_needs_observed_spec_and_ready_replicas() {
        assert!(deployment_rolled_out(&deployment(2, 2, 2, 2, 2)));
        assert!(!deployment_rolled_out(&deployment(3, 2, 2, 2, 2)));
        assert!(!deployment_rolled_out(&deployment(2, 2, 2, 1, 2)));
        assert!(!deployment_rolled_out(&deployment(2, 2, 2, 2, 1)));
        assert!(!deployment_rolled_out(&Deployment::default()));
    }
}
