//! Clones a run's source, builds its image(s), and reports progress
//! (§4.3). Consumes only `RunRequested`; produces `BuildProgress`,
//! `BuildSucceeded`, `BuildFailed`, and `LogLine`/`BuildLog` rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use reporunner_cluster::{ClusterClient, ImageBuilder};
use reporunner_eventlog::{EventHandler, HandlerOutcome, Producer};
use reporunner_process::StreamKind;
use reporunner_store::DocumentStore;
use reporunner_types::{Error, Event, ImageSource, LogLine, LogSource, Mode, Result, RunPayload, ServiceImage};
use tokio::sync::Mutex as AsyncMutex;

const DOCKERFILE_CANDIDATES: [&str; 4] =
    ["Dockerfile", "docker/Dockerfile", "build/Dockerfile", ".docker/Dockerfile"];

const WEB_SERVICE_DEFAULT_PORT: u16 = 8080;

pub struct Builder {
    store: Arc<dyn DocumentStore>,
    producer: AsyncMutex<Producer>,
    work_root: PathBuf,
    image_builder: ImageBuilder,
    cluster: ClusterClient,
    image_loader_binary: String,
    cluster_name: String,
    cpu_budget: u32,
}

impl Builder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        producer: Producer,
        work_root: PathBuf,
        image_build_binary: impl Into<String>,
        cluster: ClusterClient,
        image_loader_binary: impl Into<String>,
        cluster_name: impl Into<String>,
        cpu_budget: u32,
    ) -> Self {
        Self {
            store,
            producer: AsyncMutex::new(producer),
            work_root,
            image_builder: ImageBuilder::new(image_build_binary),
            cluster,
            image_loader_binary: image_loader_binary.into(),
            cluster_name: cluster_name.into(),
            cpu_budget,
        }
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.producer.lock().await.publish(&event).await?;
        Ok(())
    }

    async fn append_build_log(&self, run_id: &str, chunk: &str) -> Result<()> {
        let store = self.store.clone();
        let run_id = run_id.to_string();
        let chunk = chunk.to_string();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || store.append_build_log(&run_id, &chunk, now))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        Ok(())
    }

    async fn append_log_line(&self, line: LogLine) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.append_log_line(&line))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        Ok(())
    }

    async fn run_build(
        &self,
        run_id: &str,
        repo: &str,
        branch: &str,
        mode: Mode,
        compose_path: Option<&str>,
        primary_service: Option<&str>,
    ) -> std::result::Result<(RunPayload, Option<String>), String> {
        let target_dir = self.work_root.join(run_id);

        let actual_branch = reporunner_vcs::shallow_clone_with_fallback(repo, branch, &target_dir)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(run_id, branch = actual_branch, "clone complete");

        let build_result = match mode {
            Mode::SingleImage => self.build_single_image(run_id, &target_dir).await,
            Mode::MultiService => {
                self.build_multi_service(run_id, &target_dir, compose_path, primary_service).await
            }
        };

        if let Err(e) = reporunner_vcs::cleanup_clone(&target_dir).await {
            tracing::warn!(run_id, error = %e, "clone cleanup failed, ignoring");
        }

        build_result.map_err(|e| e.to_string())
    }

    async fn build_single_image(&self, run_id: &str, repo_dir: &Path) -> anyhow::Result<(RunPayload, Option<String>)> {
        let dockerfile = find_dockerfile(repo_dir)
            .await
            .ok_or_else(|| anyhow::anyhow!("no Dockerfile found at any of {DOCKERFILE_CANDIDATES:?}"))?;

        let tag = format!("{run_id}:latest");
        let run_id_owned = run_id.to_string();

        let log_lines: Arc<std::sync::Mutex<Vec<(StreamKind, String)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collector = log_lines.clone();
        let output = self
            .image_builder
            .build(&tag, &dockerfile, repo_dir, self.cpu_budget, move |kind, line| {
                collector.lock().unwrap().push((kind, line.to_string()));
            })
            .await?;

        let mut aggregated = String::new();
        for (_, line) in log_lines.lock().unwrap().iter() {
            aggregated.push_str(line);
            aggregated.push('\n');
            self.append_log_line(LogLine {
                run_id: run_id_owned.clone(),
                source: LogSource::Build,
                service_name: None,
                line: line.clone(),
                timestamp: Utc::now(),
            })
            .await
            .ok();
        }
        self.append_build_log(run_id, &aggregated).await.ok();

        if !output.success() {
            anyhow::bail!("image build failed for {tag} (exit {}, timed_out={})", output.exit_code, output.timed_out);
        }

        let ports = scan_exposed_ports(&dockerfile).await;
        let ports = if ports.is_empty() { vec![WEB_SERVICE_DEFAULT_PORT] } else { ports };

        Ok((
            RunPayload::SingleImage { image_ref: tag, ports, source: ImageSource::Built },
            Some(format!("build_logs:{run_id}")),
        ))
    }

    async fn build_multi_service(
        &self,
        run_id: &str,
        repo_dir: &Path,
        compose_path: Option<&str>,
        _primary_service: Option<&str>,
    ) -> anyhow::Result<(RunPayload, Option<String>)> {
        let compose_file = repo_dir.join(compose_path.unwrap_or("docker-compose.yml"));
        let yaml = tokio::fs::read_to_string(&compose_file)
            .await
            .map_err(|e| anyhow::anyhow!("reading compose manifest {}: {e}", compose_file.display()))?;
        let manifest = reporunner_compose::parse(&yaml)?;
        let vars: HashMap<String, String> = std::env::vars().collect();
        let resolved = reporunner_compose::resolve_services(&manifest, run_id, &vars);

        let build_total = resolved.len() as u32;
        let mut services = Vec::with_capacity(resolved.len());
        let mut to_load = Vec::new();
        let mut aggregated = String::new();

        for (idx, service) in resolved.iter().enumerate() {
            let current = idx as u32 + 1;
            let (image_ref, source) = match &service.source {
                reporunner_compose::ServiceSource::External { image } => (image.clone(), ImageSource::External),
                reporunner_compose::ServiceSource::Build { context, dockerfile, tag } => {
                    let context_dir = repo_dir.join(context);
                    let dockerfile_path = context_dir.join(dockerfile.as_deref().unwrap_or("Dockerfile"));

                    let log_lines: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
                    let collector = log_lines.clone();
                    let output = self
                        .image_builder
                        .build(tag, &dockerfile_path, &context_dir, self.cpu_budget, move |_, line| {
                            collector.lock().unwrap().push(line.to_string());
                        })
                        .await?;

                    for line in log_lines.lock().unwrap().iter() {
                        aggregated.push_str(line);
                        aggregated.push('\n');
                        self.append_log_line(LogLine {
                            run_id: run_id.to_string(),
                            source: LogSource::Build,
                            service_name: Some(service.name.clone()),
                            line: line.clone(),
                            timestamp: Utc::now(),
                        })
                        .await
                        .ok();
                    }

                    if !output.success() {
                        anyhow::bail!("image build failed for service '{}' (tag {tag})", service.name);
                    }

                    to_load.push((service.name.clone(), tag.clone()));
                    (tag.clone(), ImageSource::Built)
                }
            };

            services.push(ServiceImage {
                name: service.name.clone(),
                image_ref,
                source,
                ports: service.ports.clone(),
                environment: service.environment.clone(),
            });

            self.publish(Event::BuildProgress {
                run_id: run_id.to_string(),
                current,
                total: build_total,
                service_name: service.name.clone(),
                ts: Utc::now(),
            })
            .await
            .ok();
        }

        let load_total = to_load.len() as u32;
        for (idx, (name, tag)) in to_load.iter().enumerate() {
            self.cluster.load_image(&self.image_loader_binary, &self.cluster_name, tag).await?;
            self.publish(Event::BuildProgress {
                run_id: run_id.to_string(),
                current: build_total + idx as u32 + 1,
                total: build_total + load_total,
                service_name: format!("Loading {name} into cluster"),
                ts: Utc::now(),
            })
            .await
            .ok();
        }

        self.append_build_log(run_id, &aggregated).await.ok();

        Ok((RunPayload::MultiService { services }, Some(format!("build_logs:{run_id}"))))
    }

    async fn handle_run_requested(
        &self,
        run_id: String,
        repo: String,
        branch: String,
        mode: Mode,
        compose_path: Option<String>,
        primary_service: Option<String>,
    ) -> Result<()> {
        let result = self
            .run_build(&run_id, &repo, &branch, mode, compose_path.as_deref(), primary_service.as_deref())
            .await;

        let completed_at = Utc::now();
        let event = match result {
            Ok((payload, logs_ref)) => Event::BuildSucceeded {
                run_id,
                mode,
                payload,
                completed_at,
                logs_ref,
            },
            Err(error) => Event::BuildFailed {
                run_id,
                suggested_fixes: suggested_fixes(&error),
                error,
                failed_at: completed_at,
                logs_ref: None,
            },
        };

        // Build failures are deterministic for the same source: always emit
        // the completion event and acknowledge, never retry (§4.3 step 5).
        self.publish(event).await
    }
}

/// First matching path wins; none found is a `BuildFailure`.
async fn find_dockerfile(repo_dir: &Path) -> Option<PathBuf> {
    for candidate in DOCKERFILE_CANDIDATES {
        let path = repo_dir.join(candidate);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Some(path);
        }
    }
    None
}

/// Scan a Dockerfile for `EXPOSE <n>` directives, in file order.
async fn scan_exposed_ports(dockerfile: &Path) -> Vec<u16> {
    let Ok(content) = tokio::fs::read_to_string(dockerfile).await else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("EXPOSE ") else { continue };
        for token in rest.split_whitespace() {
            let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(port) = digits.parse::<u16>() {
                ports.push(port);
            }
        }
    }
    ports
}

/// Keyword-matched suggested fixes (§4.3 step 5), capped at 3 per §7.
fn suggested_fixes(error: &str) -> Vec<String> {
    let lower = error.to_lowercase();
    let mut fixes = Vec::new();

    if lower.contains("permission denied") {
        fixes.push("Check file permissions".to_string());
    }
    if lower.contains("network") || lower.contains("timeout") || lower.contains("timed out") {
        fixes.push("Check network connectivity".to_string());
    }
    if lower.contains("no dockerfile") || lower.contains("no such file") {
        fixes.push("Verify the Dockerfile or compose path exists at the expected location".to_string());
    }
    if lower.contains("not found") && fixes.is_empty() {
        fixes.push("Verify the referenced resource exists".to_string());
    }

    fixes.truncate(3);
    fixes
}

impl EventHandler for Builder {
    fn handle<'a>(
        &'a self,
        event: Event,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerOutcome> + Send + 'a>> {
        Box::pin(async move {
            let Event::RunRequested {
                run_id,
                repo,
                branch,
                mode,
                compose_path,
                primary_service,
            } = event
            else {
                return HandlerOutcome::Ack;
            };

            match self.handle_run_requested(run_id, repo, branch, mode, compose_path, primary_service).await {
                Ok(()) => HandlerOutcome::Ack,
                Err(Error::TransientDependency(msg)) => {
                    tracing::warn!(error = %msg, "builder retry");
                    HandlerOutcome::Retry
                }
                Err(e) => {
                    tracing::error!(error = %e, "builder handler error, acknowledging");
                    HandlerOutcome::Ack
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_dockerfile_checks_candidates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("docker")).await.unwrap();
        tokio::fs::write(dir.path().join("docker/Dockerfile"), "FROM scratch\n").await.unwrap();
        let found = find_dockerfile(dir.path()).await;
        assert_eq!(found, Some(dir.path().join("docker/Dockerfile")));
    }

    #[tokio::test]
    async fn find_dockerfile_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_dockerfile(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn scan_exposed_ports_reads_expose_directives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");
        tokio::fs::write(&path, "FROM node:20\nEXPOSE 3000\nEXPOSE 9229\n").await.unwrap();
        assert_eq!(scan_exposed_ports(&path).await, vec![3000, 9229]);
    }

    #[tokio::test]
    async fn scan_exposed_ports_empty_without_expose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");
        tokio::fs::write(&path, "FROM node:20\nCMD [\"node\", \"index.js\"]\n").await.unwrap();
        assert!(scan_exposed_ports(&path).await.is_empty());
    }

    #[test]
    fn suggested_fixes_matches_permission_keyword() {
        let fixes = suggested_fixes("clone failed: permission denied (publickey)");
        assert_eq!(fixes, vec!["Check file permissions".to_string()]);
    }

    #[test]
    fn suggested_fixes_matches_network_keyword() {
        let fixes = suggested_fixes("dial tcp: i/o timeout");
        assert_eq!(fixes, vec!["Check network connectivity".to_string()]);
    }

    #[test]
    fn suggested_fixes_caps_at_three() {
        let fixes = suggested_fixes(
            "permission denied; network unreachable, timeout; no dockerfile found; resource not found",
        );
        assert!(fixes.len() <= 3);
    }
}
