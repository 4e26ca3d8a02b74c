//! Provisions a tenant for a successfully built run, gates on pod
//! readiness, multiplexes port-forwards, tails logs, and tears tenants
//! down on stop or TTL expiry (§4.4).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reporunner_cache::Cache;
use reporunner_cluster::{ClusterClient, Pod, PodCondition};
use reporunner_eventlog::{EventHandler, HandlerOutcome, Producer};
use reporunner_retry::{calculate_delay, RetryStrategyConfig};
use reporunner_store::DocumentStore;
use reporunner_types::{
    DeploymentDescriptor, EndpointDescriptor, Error, Event, ImagePullPolicy, ImageSource, LogLine, LogSource, Mode,
    NamespaceDescriptor, PortForward, Result, RunPayload, TenantResources,
};
use tokio::sync::Mutex as AsyncMutex;

const TENANT_NAMESPACE_PREFIX: &str = "run-";
const READINESS_HARD_CEILING: Duration = Duration::from_secs(45);
const READINESS_FLOOR: Duration = Duration::from_secs(20);
const PORT_BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
const FALLBACK_PORT_RANGE: std::ops::Range<u16> = 3000..10000;
/// Infrastructure ports excluded from the "tear down every forward" sweep
/// (§9: by construction, not by tenant label) — Redis and MongoDB.
const INFRA_PORTS: [u16; 2] = [6379, 27017];

/// One live port-forward's process handle, held separately from the
/// serializable [`PortForward`] record.
struct ForwardHandle {
    record: PortForward,
    child: tokio::process::Child,
}

pub struct DeployerConfig {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub namespace_ttl_hours: u32,
    pub fallback_node_port: u16,
}

pub struct Deployer {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn Cache>,
    producer: AsyncMutex<Producer>,
    cluster: ClusterClient,
    config: DeployerConfig,
    forwards: AsyncMutex<Vec<ForwardHandle>>,
}

impl Deployer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn Cache>,
        producer: Producer,
        cluster: ClusterClient,
        config: DeployerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            producer: AsyncMutex::new(producer),
            cluster,
            config,
            forwards: AsyncMutex::new(Vec::new()),
        }
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.producer.lock().await.publish(&event).await?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<reporunner_types::Run> {
        let store = self.store.clone();
        let id = run_id.to_string();
        let run = tokio::task::spawn_blocking(move || store.get_run(&id))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        run.ok_or_else(|| Error::TransientDependency("run not yet visible".to_string()))
    }

    async fn save_run(&self, run: reporunner_types::Run) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.put_run(&run))
            .await
            .map_err(|e| Error::TransientDependency(e.to_string()))??;
        Ok(())
    }

    async fn cache_stopped(&self, run_id: &str) {
        if let Ok(Some(mut projection)) = self.cache.get_status(&run_id.to_string()).await {
            projection.status = reporunner_types::Status::Stopped;
            let _ = self.cache.put_status(&projection).await;
        }
    }

    /// Sweeps every existing `run-*` namespace and its port-forwards before
    /// provisioning a new tenant (§4.4: one active tenant at a time).
    async fn evict_existing_tenants(&self) -> anyhow::Result<()> {
        let namespaces = self
            .cluster
            .list_namespaces_by_label("managed-by", "reporunner")
            .await
            .unwrap_or_default();
        let stale: Vec<&String> = namespaces.iter().filter(|n| n.starts_with(TENANT_NAMESPACE_PREFIX)).collect();
        for ns in stale {
            tracing::info!(namespace = ns, "evicting existing tenant before provisioning a new one");
            let _ = self.cluster.delete_namespace(ns).await;
        }

        let mut forwards = self.forwards.lock().await;
        let mut remaining = Vec::new();
        for mut handle in forwards.drain(..) {
            if INFRA_PORTS.contains(&handle.record.target_port) {
                remaining.push(handle);
            } else {
                let _ = handle.child.start_kill();
            }
        }
        *forwards = remaining;
        Ok(())
    }

    async fn provision(
        &self,
        run_id: String,
        mode: Mode,
        payload: RunPayload,
        repo: String,
        primary_service: Option<&str>,
    ) -> std::result::Result<(String, String), String> {
        self.evict_existing_tenants().await.map_err(|e| e.to_string())?;

        let resources = synthesize_resources(&run_id, mode, &payload, &repo, primary_service, &self.config);

        self.cluster
            .create_namespace(&resources.namespace.name, &resources.namespace.labels, &resources.namespace.annotations)
            .await
            .map_err(|e| e.to_string())?;

        for deployment in &resources.deployments {
            let manifest = deployment_manifest(&resources.namespace.name, &run_id, deployment);
            self.cluster.apply(&manifest).await.map_err(|e| {
                format!("creating deployment '{}': {e}", deployment.service_name)
            })?;
        }
        for endpoint in &resources.endpoints {
            let manifest = endpoint_manifest(&resources.namespace.name, &run_id, endpoint);
            self.cluster.apply(&manifest).await.map_err(|e| {
                format!("creating endpoint '{}': {e}", endpoint.service_name)
            })?;
        }

        let pods = match self.readiness_gate(&resources.namespace.name, &run_id).await {
            Ok(pods) => pods,
            Err(e) => {
                let _ = self.cluster.delete_namespace(&resources.namespace.name).await;
                return Err(e);
            }
        };

        self.run_post_deploy_hooks(&resources, &pods).await;

        let preview_url = self.port_forward_multiplex(&resources, &pods).await.map_err(|e| e.to_string())?;

        self.tail_logs(&resources.namespace.name, &pods);

        Ok((resources.tenant, preview_url))
    }

    async fn readiness_gate(&self, namespace: &str, run_id: &str) -> std::result::Result<Vec<Pod>, String> {
        let start = Instant::now();
        let poll_config = RetryStrategyConfig::readiness_poll();

        loop {
            let pods = self
                .cluster
                .get_pods_by_run_id(namespace, run_id)
                .await
                .map_err(|e| e.to_string())?;

            let degraded: Vec<&Pod> = pods.iter().filter(|p| matches!(p.condition, PodCondition::Degraded { .. })).collect();
            let ready_count = pods.iter().filter(|p| p.condition == PodCondition::Ready).count();
            let must_be_ready = pods.len() - degraded.len();
            let elapsed = start.elapsed();

            if must_be_ready > 0 && ready_count == must_be_ready {
                return Ok(pods);
            }

            if ready_count > 0 && elapsed >= READINESS_FLOOR {
                tracing::warn!(
                    namespace,
                    degraded = degraded.len(),
                    "readiness gate proceeding on partial success"
                );
                return Ok(pods);
            }

            if elapsed >= READINESS_HARD_CEILING {
                return Err(format!(
                    "readiness gate timed out after {:?} with zero ready pods ({} degraded)",
                    READINESS_HARD_CEILING,
                    degraded.len()
                ));
            }

            tokio::time::sleep(calculate_delay(&poll_config, 1)).await;
        }
    }

    async fn run_post_deploy_hooks(&self, resources: &TenantResources, pods: &[Pod]) {
        for deployment in &resources.deployments {
            if !deployment.service_name.contains("api") {
                continue;
            }
            let Some(pod) = pods.iter().find(|p| p.labels.get("app") == Some(&deployment.service_name)) else {
                continue;
            };
            let cmd = ["sh", "-c", "if [ -x ./migrate.sh ]; then ./migrate.sh; fi"];
            if let Err(e) = self.cluster.exec(&resources.namespace.name, &pod.name, &cmd).await {
                tracing::warn!(service = deployment.service_name, error = %e, "schema-migration hook failed, continuing");
            }
        }
    }

    async fn port_forward_multiplex(&self, resources: &TenantResources, pods: &[Pod]) -> anyhow::Result<String> {
        let mut preview_url = None;

        for endpoint in &resources.endpoints {
            let Some(&target_port) = endpoint.container_ports.first() else { continue };
            let Some(pod) = pods.iter().find(|p| p.labels.get("app") == Some(&endpoint.service_name)) else {
                continue;
            };

            let preferred = if target_port < 1024 { target_port + 8000 } else { target_port };
            let local_port = self.acquire_local_port(preferred).await;

            let child = self.cluster.port_forward(&resources.namespace.name, &pod.name, local_port, target_port)?;
            let url = format!("http://localhost:{local_port}");

            if target_port == resources.primary_port {
                preview_url = Some(url.clone());
            }

            self.forwards.lock().await.push(ForwardHandle {
                record: PortForward {
                    tenant: resources.tenant.clone(),
                    service: endpoint.service_name.clone(),
                    pod_name: pod.name.clone(),
                    local_port,
                    target_port,
                    url,
                    process_handle: None,
                    created_at: Utc::now(),
                },
                child,
            });
        }

        preview_url.or_else(|| resources.endpoints.first().map(|_| format!("http://localhost:{}", resources.primary_port)))
            .ok_or_else(|| anyhow::anyhow!("no endpoints to forward"))
    }

    /// Bind-check the preferred port; on contention, kill the owning process
    /// and retry once after 500ms; failing that, fall back to the next free
    /// port in the 3000-9999 range.
    async fn acquire_local_port(&self, preferred: u16) -> u16 {
        if is_port_free(preferred).await {
            return preferred;
        }

        tracing::warn!(port = preferred, "preferred local port busy, terminating owning process");
        let _ = kill_port_owner(preferred).await;
        tokio::time::sleep(PORT_BIND_RETRY_DELAY).await;

        if is_port_free(preferred).await {
            return preferred;
        }

        for candidate in FALLBACK_PORT_RANGE {
            if is_port_free(candidate).await {
                tracing::warn!(preferred, fallback = candidate, "falling back to next available local port");
                return candidate;
            }
        }

        tracing::warn!(preferred, "no fallback port available, using node port fallback");
        self.config.fallback_node_port
    }

    fn tail_logs(&self, namespace: &str, pods: &[Pod]) {
        for pod in pods {
            let cluster_binary_namespace = namespace.to_string();
            let pod_name = pod.name.clone();
            let service_name = pod.labels.get("app").cloned();
            let run_id = pod.labels.get("run-id").cloned().unwrap_or_default();
            let store = self.store.clone();

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let line_sink = tx;
            let cluster = self.cluster.clone();

            tokio::spawn(async move {
                let _ = cluster
                    .follow_logs(&cluster_binary_namespace, &pod_name, None, move |line: &str| {
                        let _ = line_sink.send(line.to_string());
                    })
                    .await;
            });

            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let log_line = LogLine {
                        run_id: run_id.clone(),
                        source: LogSource::Run,
                        service_name: service_name.clone(),
                        line,
                        timestamp: Utc::now(),
                    };
                    let store = store.clone();
                    let _ = tokio::task::spawn_blocking(move || store.append_log_line(&log_line)).await;
                }
            });
        }
    }

    async fn handle_build_succeeded(&self, run_id: String, mode: Mode, payload: RunPayload) -> Result<()> {
        let run = self.load_run(&run_id).await?;

        // Stop wins over a post-hoc failure: the Coordinator is the single
        // writer of terminal status, so if a RunStopRequested already landed
        // there's nothing to provision — don't race a deploy into a tenant
        // the operator already asked to tear down.
        if run.status == reporunner_types::Status::Stopped {
            return self
                .publish(Event::RunFailed {
                    run_id,
                    error: "stopped before deploy".to_string(),
                    failed_at: Utc::now(),
                })
                .await;
        }

        let repo = run.repo.clone();
        let primary_service = run.primary_service.clone();

        match self.provision(run_id.clone(), mode, payload, repo, primary_service.as_deref()).await {
            Ok((tenant, preview_url)) => {
                let started_at = Utc::now();
                self.publish(Event::RunSucceeded {
                    run_id,
                    preview_url,
                    tenant,
                    started_at,
                })
                .await
            }
            Err(error) => {
                self.publish(Event::RunFailed {
                    run_id,
                    error,
                    failed_at: Utc::now(),
                })
                .await
            }
        }
    }

    async fn handle_stop_requested(&self, run_id: String) -> Result<()> {
        let run = self.load_run(&run_id).await;

        let tenant = format!("{TENANT_NAMESPACE_PREFIX}{run_id}");
        {
            let mut forwards = self.forwards.lock().await;
            let mut remaining = Vec::new();
            for mut handle in forwards.drain(..) {
                if handle.record.tenant == tenant {
                    let _ = handle.child.start_kill();
                } else {
                    remaining.push(handle);
                }
            }
            *forwards = remaining;
        }

        // Idempotent: deleting an already-gone namespace is a no-op success.
        let _ = self.cluster.delete_namespace(&tenant).await;
        self.cache_stopped(&run_id).await;

        if let Ok(mut run) = run {
            run.advance_status(reporunner_types::Status::Stopped);
            run.completed_at = Some(Utc::now());
            self.save_run(run).await?;
        }

        Ok(())
    }

    /// Periodic sweep (default 15 min): delete any `managed-by=reporunner`
    /// namespace whose `delete-after` annotation has passed.
    pub async fn run_ttl_reaper(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reap_expired_namespaces().await {
                tracing::warn!(error = %e, "TTL reaper sweep failed");
            }
        }
    }

    async fn reap_expired_namespaces(&self) -> anyhow::Result<()> {
        let namespaces = self.cluster.list_namespaces_by_label("managed-by", "reporunner").await?;
        let now = Utc::now();
        for ns in namespaces {
            let Some(deadline_raw) = self.cluster.get_namespace_annotation(&ns, "delete-after").await? else {
                continue;
            };
            let Ok(deadline) = chrono::DateTime::parse_from_rfc3339(&deadline_raw) else {
                continue;
            };
            if now >= deadline {
                tracing::info!(namespace = ns, "TTL expired, deleting namespace");
                let _ = self.cluster.delete_namespace(&ns).await;
            }
        }
        Ok(())
    }
}

fn synthesize_resources(
    run_id: &str,
    mode: Mode,
    payload: &RunPayload,
    repo: &str,
    primary_service: Option<&str>,
    config: &DeployerConfig,
) -> TenantResources {
    let tenant = format!("{TENANT_NAMESPACE_PREFIX}{run_id}");
    let created_at = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let delete_after = (Utc::now() + chrono::Duration::hours(config.namespace_ttl_hours as i64)).to_rfc3339();

    let mode_label = match mode {
        Mode::SingleImage => "single",
        Mode::MultiService => "multi",
    };

    let mut labels = BTreeMap::new();
    labels.insert("managed-by".to_string(), "reporunner".to_string());
    labels.insert("run-id".to_string(), run_id.to_string());
    labels.insert("mode".to_string(), mode_label.to_string());
    labels.insert("created-at".to_string(), created_at);

    let mut annotations = BTreeMap::new();
    annotations.insert("repo-url".to_string(), repo.to_string());
    annotations.insert("delete-after".to_string(), delete_after);

    let namespace = NamespaceDescriptor { name: tenant.clone(), labels, annotations };

    let services: Vec<(String, String, ImageSource, Vec<u16>, BTreeMap<String, String>)> = match payload {
        RunPayload::SingleImage { image_ref, ports, source } => {
            vec![("app".to_string(), image_ref.clone(), *source, ports.clone(), BTreeMap::new())]
        }
        RunPayload::MultiService { services } => services
            .iter()
            .map(|svc| (svc.name.clone(), svc.image_ref.clone(), svc.source, svc.ports.clone(), svc.environment.clone()))
            .collect(),
    };

    let mut deployments = Vec::with_capacity(services.len());
    let mut endpoints = Vec::with_capacity(services.len());
    let mut service_ports = BTreeMap::new();
    let mut resolved_by_name: BTreeMap<String, Vec<u16>> = BTreeMap::new();

    for (name, image, source, ports, raw_env) in &services {
        let sanitized = sanitize_service_name(name);
        let env = resolve_env_two_pass(raw_env);
        let pull_policy = match source {
            ImageSource::Built => ImagePullPolicy::Never,
            ImageSource::External => ImagePullPolicy::IfNotPresent,
        };
        let volumes = if pull_policy == ImagePullPolicy::Never {
            vec!["/tmp".to_string(), "/app/config".to_string(), "/app/data".to_string()]
        } else {
            Vec::new()
        };

        let resolved_ports = if ports.is_empty() {
            vec![default_port_for(image, &sanitized)]
        } else {
            ports.clone()
        };

        deployments.push(DeploymentDescriptor {
            service_name: sanitized.clone(),
            image: image.clone(),
            image_pull_policy: pull_policy,
            replicas: 1,
            env,
            cpu_limit: config.cpu_limit.clone(),
            memory_limit: config.memory_limit.clone(),
            cpu_request: config.cpu_request.clone(),
            memory_request: config.memory_request.clone(),
            volumes,
        });

        endpoints.push(EndpointDescriptor {
            service_name: sanitized.clone(),
            container_ports: resolved_ports.clone(),
        });

        resolved_by_name.insert(name.clone(), resolved_ports.clone());
        service_ports.insert(sanitized, resolved_ports);
    }

    let primary_port = primary_port_for(&services, &resolved_by_name, primary_service);

    TenantResources {
        tenant,
        namespace,
        deployments,
        endpoints,
        primary_port,
        service_ports,
    }
}

/// Picks the primary external port (§4.4/§8): the declared
/// `Run.primary_service` wins if it names a resolved service; failing that,
/// the first resolved service whose name is a well-known web-facing name
/// (`web`, `app`, `frontend`, ...); failing that, the first resolved service.
fn primary_port_for(
    services: &[(String, String, ImageSource, Vec<u16>, BTreeMap<String, String>)],
    resolved_by_name: &BTreeMap<String, Vec<u16>>,
    primary_service: Option<&str>,
) -> u16 {
    let first_port = |name: &str| resolved_by_name.get(name).and_then(|p| p.first()).copied();

    if let Some(declared) = primary_service {
        if let Some(port) = first_port(declared) {
            return port;
        }
    }

    if let Some((name, ..)) = services.iter().find(|(name, ..)| reporunner_compose::WEB_SERVICE_NAMES.contains(&name.as_str())) {
        if let Some(port) = first_port(name) {
            return port;
        }
    }

    services.first().and_then(|(name, ..)| first_port(name)).unwrap_or(8080)
}

fn sanitize_service_name(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let hyphenated: String = lower
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    hyphenated.trim_matches('-').to_string()
}

const WELL_KNOWN_PORTS: &[(&str, u16)] = &[
    ("mongo", 27017),
    ("postgres", 5432),
    ("mysql", 3306),
    ("mariadb", 3306),
    ("redis", 6379),
    ("elasticsearch", 9200),
    ("kibana", 5601),
    ("rabbitmq", 5672),
    ("kafka", 9092),
    ("cassandra", 9042),
    ("influxdb", 8086),
    ("grafana", 3000),
    ("prometheus", 9090),
    ("nginx", 80),
    ("apache", 80),
];

fn default_port_for(image: &str, service_name: &str) -> u16 {
    let lower_image = image.to_lowercase();
    let lower_name = service_name.to_lowercase();
    for (needle, port) in WELL_KNOWN_PORTS {
        if lower_image.contains(needle) || lower_name.contains(needle) {
            return *port;
        }
    }
    80
}

fn resolve_env_two_pass(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let vars: HashMap<String, String> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let mut resolved = env.clone();
    for value in resolved.values_mut() {
        if let Some(r) = reporunner_compose::resolve_placeholders(value, &vars) {
            *value = r;
        }
    }
    let snapshot: HashMap<String, String> = resolved.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for value in resolved.values_mut() {
        *value = reporunner_compose::resolve_placeholders(value, &snapshot).unwrap_or_default();
    }
    resolved
}

async fn is_port_free(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Best-effort: enumerate the process bound to `port` via `lsof` and kill
/// it. Scoped to user-run ports, which per the operational model only our
/// own previous-run processes hold.
async fn kill_port_owner(port: u16) -> anyhow::Result<()> {
    let selector = format!("tcp:{port}");
    let result = reporunner_process::run_captured("lsof", &["-ti", selector.as_str()], std::path::Path::new("."), &[], Some(Duration::from_secs(5))).await?;
    for pid in result.stdout.split_whitespace() {
        let _ = reporunner_process::run_captured("kill", &["-9", pid], std::path::Path::new("."), &[], Some(Duration::from_secs(5))).await;
    }
    Ok(())
}

fn deployment_manifest(namespace: &str, run_id: &str, deployment: &DeploymentDescriptor) -> String {
    let env_entries: String = deployment
        .env
        .iter()
        .map(|(k, v)| format!("            - name: {k}\n              value: \"{v}\"\n"))
        .collect();
    let volume_mounts: String = deployment
        .volumes
        .iter()
        .enumerate()
        .map(|(i, path)| format!("            - name: scratch-{i}\n              mountPath: {path}\n"))
        .collect();
    let volumes: String = deployment
        .volumes
        .iter()
        .enumerate()
        .map(|(i, _)| format!("        - name: scratch-{i}\n          emptyDir: {{}}\n"))
        .collect();
    let pull_policy = match deployment.image_pull_policy {
        ImagePullPolicy::Never => "Never",
        ImagePullPolicy::IfNotPresent => "IfNotPresent",
    };

    format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: {namespace}\n  labels:\n    app: {name}\n    run-id: {run_id}\nspec:\n  replicas: {replicas}\n  selector:\n    matchLabels:\n      app: {name}\n  template:\n    metadata:\n      labels:\n        app: {name}\n        run-id: {run_id}\n    spec:\n      containers:\n        - name: {name}\n          image: {image}\n          imagePullPolicy: {pull_policy}\n          env:\n{env_entries}          resources:\n            limits:\n              cpu: {cpu_limit}\n              memory: {memory_limit}\n            requests:\n              cpu: {cpu_request}\n              memory: {memory_request}\n          volumeMounts:\n{volume_mounts}      volumes:\n{volumes}",
        name = deployment.service_name,
        replicas = deployment.replicas,
        image = deployment.image,
        cpu_limit = deployment.cpu_limit,
        memory_limit = deployment.memory_limit,
        cpu_request = deployment.cpu_request,
        memory_request = deployment.memory_request,
    )
}

fn endpoint_manifest(namespace: &str, run_id: &str, endpoint: &EndpointDescriptor) -> String {
    let ports: String = endpoint
        .container_ports
        .iter()
        .enumerate()
        .map(|(i, port)| format!("    - name: port-{i}\n      port: {port}\n      targetPort: {port}\n"))
        .collect();

    format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\n  namespace: {namespace}\n  labels:\n    app: {name}\n    run-id: {run_id}\nspec:\n  type: NodePort\n  selector:\n    app: {name}\n  ports:\n{ports}",
        name = endpoint.service_name,
    )
}

impl EventHandler for Deployer {
    fn handle<'a>(
        &'a self,
        event: Event,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerOutcome> + Send + 'a>> {
        Box::pin(async move {
            let outcome = match event {
                Event::BuildSucceeded { run_id, mode, payload, .. } => {
                    self.handle_build_succeeded(run_id, mode, payload).await
                }
                Event::RunStopRequested { run_id, .. } => self.handle_stop_requested(run_id).await,
                _ => Ok(()),
            };

            match outcome {
                Ok(()) => HandlerOutcome::Ack,
                Err(Error::TransientDependency(msg)) => {
                    tracing::warn!(error = %msg, "deployer retry");
                    HandlerOutcome::Retry
                }
                Err(e) => {
                    tracing::error!(error = %e, "deployer handler error, acknowledging");
                    HandlerOutcome::Ack
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_service_name_strips_and_hyphenates() {
        assert_eq!(sanitize_service_name("My_Service!!"), "my-service");
        assert_eq!(sanitize_service_name("-leading-"), "leading");
    }

    #[test]
    fn default_port_matches_well_known_image() {
        assert_eq!(default_port_for("postgres:16", "db"), 5432);
        assert_eq!(default_port_for("myorg/custom:1.0", "web"), 80);
    }

    fn demo_services() -> Vec<reporunner_types::ServiceImage> {
        vec![
            reporunner_types::ServiceImage {
                name: "api".to_string(),
                image_ref: "a1b2c3d4-api:latest".to_string(),
                source: ImageSource::Built,
                ports: vec![3000],
                environment: BTreeMap::new(),
            },
            reporunner_types::ServiceImage {
                name: "db".to_string(),
                image_ref: "postgres:16".to_string(),
                source: ImageSource::External,
                ports: vec![],
                environment: BTreeMap::new(),
            },
            reporunner_types::ServiceImage {
                name: "web".to_string(),
                image_ref: "a1b2c3d4-web:latest".to_string(),
                source: ImageSource::Built,
                ports: vec![3100],
                environment: BTreeMap::new(),
            },
        ]
    }

    #[test]
    fn synthesize_resources_uses_declared_source_not_a_heuristic() {
        let payload = RunPayload::MultiService { services: demo_services() };
        let config = deployer_config_for_test();
        let resources = synthesize_resources("run1", Mode::MultiService, &payload, "https://example.invalid/x.git", None, &config);
        let api = resources.deployments.iter().find(|d| d.service_name == "api").unwrap();
        assert_eq!(api.image_pull_policy, ImagePullPolicy::Never);
        let db = resources.deployments.iter().find(|d| d.service_name == "db").unwrap();
        assert_eq!(db.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert!(db.volumes.is_empty());
        assert_eq!(resources.service_ports.get("db"), Some(&vec![5432]));
    }

    #[test]
    fn synthesize_resources_picks_web_named_service_as_primary_by_default() {
        let payload = RunPayload::MultiService { services: demo_services() };
        let config = deployer_config_for_test();
        let resources = synthesize_resources("run1", Mode::MultiService, &payload, "https://example.invalid/x.git", None, &config);
        assert_eq!(resources.primary_port, 3100);
    }

    #[test]
    fn synthesize_resources_honors_declared_primary_service() {
        let payload = RunPayload::MultiService { services: demo_services() };
        let config = deployer_config_for_test();
        let resources =
            synthesize_resources("run1", Mode::MultiService, &payload, "https://example.invalid/x.git", Some("api"), &config);
        assert_eq!(resources.primary_port, 3000);
    }

    fn deployer_config_for_test() -> DeployerConfig {
        DeployerConfig {
            cpu_limit: "200m".to_string(),
            memory_limit: "256Mi".to_string(),
            cpu_request: "50m".to_string(),
            memory_request: "64Mi".to_string(),
            namespace_ttl_hours: 4,
            fallback_node_port: 30080,
        }
    }

    #[test]
    fn resolve_env_two_pass_fills_defaults_then_plain_refs() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "${PORT:-3000}".to_string());
        env.insert("URL".to_string(), "http://localhost:${PORT}".to_string());
        env.insert("MISSING".to_string(), "${NOPE}".to_string());
        let resolved = resolve_env_two_pass(&env);
        assert_eq!(resolved.get("PORT"), Some(&"3000".to_string()));
        assert_eq!(resolved.get("MISSING"), Some(&"".to_string()));
    }
}
