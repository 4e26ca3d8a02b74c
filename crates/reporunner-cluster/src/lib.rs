//! Wrappers around the cluster CLI and the image-build/image-load CLIs —
//! the three command-execution interfaces of §6 that the Builder and
//! Deployer drive as sub-processes. Exit codes and stdout/stderr are
//! parsed here; the exact CLI binary names are configuration, not part of
//! the contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reporunner_process::{run_captured, run_streaming, spawn_long_running, StreamKind};
use serde::{Deserialize, Serialize};
use tokio::process::Child;

/// Readiness-relevant subset of a pod's reported state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodCondition {
    Ready,
    /// Still starting, not yet in a recognized failure state.
    Pending,
    /// One of `CrashLoopBackOff`, `ImagePullBackOff`, `ErrImagePull` — the
    /// readiness gate treats these as "degraded", not "must still wait".
    Degraded { reason: String },
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub condition: PodCondition,
}

const DEGRADED_REASONS: [&str; 3] = ["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull"];

/// Client for the cluster CLI (default binary `kubectl`), scoped to a
/// `KUBECONFIG` path. Cheap to clone — holds only the binary name and an
/// optional path — so background tasks (log-tailing) can own their copy.
#[derive(Clone)]
pub struct ClusterClient {
    binary: String,
    kubeconfig: Option<PathBuf>,
}

impl ClusterClient {
    pub fn new(binary: impl Into<String>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig,
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        match &self.kubeconfig {
            Some(path) => vec![("KUBECONFIG".to_string(), path.to_string_lossy().into_owned())],
            None => Vec::new(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<reporunner_process::CommandResult> {
        run_captured(&self.binary, args, Path::new("."), &self.env(), Some(Duration::from_secs(30)))
            .await
    }

    pub async fn apply(&self, manifest_yaml: &str) -> Result<()> {
        // kubectl apply -f - reads the manifest from stdin; since
        // `run_captured` doesn't wire stdin, write to a temp file instead.
        let tmp = tempfile_path();
        tokio::fs::write(&tmp, manifest_yaml).await.context("writing manifest to temp file")?;
        let path_str = tmp.to_string_lossy().into_owned();
        let result = self.run(&["apply", "-f", path_str.as_str()]).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        result?.ok().map(|_| ())
    }

    pub async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let label_pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}: \"{v}\"")).collect();
        let annotation_pairs: Vec<String> =
            annotations.iter().map(|(k, v)| format!("{k}: \"{v}\"")).collect();
        let manifest = format!(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {name}\n  labels:\n    {}\n  annotations:\n    {}\n",
            label_pairs.join("\n    "),
            annotation_pairs.join("\n    "),
        );
        self.apply(&manifest).await
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let result = self.run(&["delete", "namespace", name, "--ignore-not-found"]).await?;
        result.ok().map(|_| ())
    }

    /// List namespaces carrying `label=value`, for the Deployer's
    /// one-tenant-at-a-time sweep and the TTL reaper.
    pub async fn list_namespaces_by_label(&self, label: &str, value: &str) -> Result<Vec<String>> {
        let selector = format!("{label}={value}");
        let result = self
            .run(&["get", "namespaces", "-l", selector.as_str(), "-o", "jsonpath={.items[*].metadata.name}"])
            .await?;
        result.ok()?;
        Ok(result
            .stdout
            .split_whitespace()
            .map(|s| s.to_string())
            .collect())
    }

    pub async fn get_namespace_annotation(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let jsonpath = format!("jsonpath={{.metadata.annotations.{key}}}");
        let result = self
            .run(&["get", "namespace", namespace, "-o", jsonpath.as_str()])
            .await?;
        if !result.success {
            return Ok(None);
        }
        let value = result.stdout.trim();
        Ok(if value.is_empty() { None } else { Some(value.to_string()) })
    }

    /// List pods in `namespace` matching `run-id=<run_id>`, parsed from
    /// `kubectl get pods -o json`.
    pub async fn get_pods_by_run_id(&self, namespace: &str, run_id: &str) -> Result<Vec<Pod>> {
        let selector = format!("run-id={run_id}");
        let result = self
            .run(&["get", "pods", "-n", namespace, "-l", selector.as_str(), "-o", "json"])
            .await?;
        result.ok()?;
        parse_pod_list(&result.stdout)
    }

    /// Follow a pod's logs, emitting each line to `on_line` as it arrives.
    /// Returns once the log stream ends (pod terminates) or the cluster CLI
    /// exits.
    pub async fn follow_logs<F>(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        on_line: F,
    ) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut args = vec!["logs", "-f", "-n", namespace, pod];
        if let Some(c) = container {
            args.push("-c");
            args.push(c);
        }
        run_streaming(&self.binary, &args, Path::new("."), &self.env(), None, move |kind, line| {
            if kind == StreamKind::Stdout {
                on_line(line);
            }
        })
        .await?;
        Ok(())
    }

    pub async fn exec(&self, namespace: &str, pod: &str, cmd: &[&str]) -> Result<reporunner_process::CommandResult> {
        let mut args = vec!["exec", "-n", namespace, pod, "--"];
        args.extend_from_slice(cmd);
        self.run(&args).await
    }

    /// Start a port-forward as a long-running child process. The caller
    /// owns the handle's lifecycle.
    pub fn port_forward(&self, namespace: &str, pod: &str, local_port: u16, target_port: u16) -> Result<Child> {
        let mapping = format!("{local_port}:{target_port}");
        let args = ["port-forward", "-n", namespace, pod, mapping.as_str()];
        spawn_long_running(&self.binary, &args, Path::new("."), &self.env())
    }

    /// Load a locally built image tag into the named local cluster (e.g.
    /// `kind load docker-image` / `k3d image import`).
    pub async fn load_image(&self, loader_binary: &str, cluster_name: &str, tag: &str) -> Result<()> {
        let result = run_captured(
            loader_binary,
            &["load", "docker-image", tag, "--name", cluster_name],
            Path::new("."),
            &[],
            Some(Duration::from_secs(60)),
        )
        .await?;
        result.ok().map(|_| ())
    }
}

fn parse_pod_list(json: &str) -> Result<Vec<Pod>> {
    let value: serde_json::Value = serde_json::from_str(json).context("parsing pod list JSON")?;
    let items = value["items"].as_array().cloned().unwrap_or_default();
    let mut pods = Vec::with_capacity(items.len());
    for item in items {
        let name = item["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let labels: BTreeMap<String, String> = item["metadata"]["labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let condition = pod_condition_from_status(&item["status"]);
        pods.push(Pod { name, labels, condition });
    }
    Ok(pods)
}

fn pod_condition_from_status(status: &serde_json::Value) -> PodCondition {
    if let Some(statuses) = status["containerStatuses"].as_array() {
        for cs in statuses {
            if let Some(reason) = cs["state"]["waiting"]["reason"].as_str() {
                if DEGRADED_REASONS.contains(&reason) {
                    return PodCondition::Degraded {
                        reason: reason.to_string(),
                    };
                }
            }
            let ready = cs["ready"].as_bool().unwrap_or(false);
            if !ready {
                return PodCondition::Pending;
            }
        }
        return PodCondition::Ready;
    }
    PodCondition::Pending
}

fn tempfile_path() -> PathBuf {
    std::env::temp_dir().join(format!("reporunner-manifest-{}.yaml", std::process::id()))
}

/// Wrapper around the image-build CLI (§6: build with tag, file, and
/// context; environment carries the CPU budget and log-size knobs).
pub struct ImageBuilder {
    binary: String,
}

impl ImageBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Build an image, streaming build output line-by-line to `on_line`.
    pub async fn build<F>(
        &self,
        tag: &str,
        dockerfile: &Path,
        context: &Path,
        cpu_budget: u32,
        on_line: F,
    ) -> Result<reporunner_process::CommandOutput>
    where
        F: Fn(StreamKind, &str) + Send + Sync + 'static,
    {
        let dockerfile_str = dockerfile.to_string_lossy().into_owned();
        let context_str = context.to_string_lossy().into_owned();
        let args = vec!["build", "-t", tag, "-f", dockerfile_str.as_str(), context_str.as_str()];
        let env = vec![
            ("BUILDER_CPU_BUDGET".to_string(), cpu_budget.to_string()),
            ("BUILDKIT_STEP_LOG_MAX_SIZE".to_string(), "10485760".to_string()),
        ];
        run_streaming(&self.binary, &args, context, &env, None, on_line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_condition_detects_degraded_reason() {
        let status = serde_json::json!({
            "containerStatuses": [
                {"ready": false, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
            ]
        });
        assert_eq!(
            pod_condition_from_status(&status),
            PodCondition::Degraded { reason: "CrashLoopBackOff".to_string() }
        );
    }

    #[test]
    fn pod_condition_ready_when_all_containers_ready() {
        let status = serde_json::json!({
            "containerStatuses": [{"ready": true, "state": {"running": {}}}]
        });
        assert_eq!(pod_condition_from_status(&status), PodCondition::Ready);
    }

    #[test]
    fn pod_condition_pending_when_not_ready_and_not_degraded() {
        let status = serde_json::json!({
            "containerStatuses": [{"ready": false, "state": {"waiting": {"reason": "ContainerCreating"}}}]
        });
        assert_eq!(pod_condition_from_status(&status), PodCondition::Pending);
    }

    #[test]
    fn parse_pod_list_extracts_names_and_labels() {
        let json = serde_json::json!({
            "items": [
                {
                    "metadata": {"name": "app-abc123", "labels": {"run-id": "r1", "app": "web"}},
                    "status": {"containerStatuses": [{"ready": true, "state": {"running": {}}}]}
                }
            ]
        })
        .to_string();

        let pods = parse_pod_list(&json).expect("parse");
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "app-abc123");
        assert_eq!(pods[0].labels.get("app"), Some(&"web".to_string()));
        assert_eq!(pods[0].condition, PodCondition::Ready);
    }
}
