//! Core data model and error taxonomy shared by every worker in the
//! repo-preview pipeline: the [`Run`] record and its [`Status`] machine, the
//! [`StatusProjection`] cache payload, build/run log lines, the Deployer's
//! in-memory [`TenantResources`]/[`PortForward`] descriptors, the event
//! envelope and its payload kinds, and the [`Error`] taxonomy.
//!
//! ## Serialization
//!
//! Everything here round-trips through `serde_json` for document-store and
//! cache storage; event payloads additionally round-trip as the event-log
//! wire encoding (see `reporunner-eventlog`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, globally unique, client-facing identifier for a [`Run`].
pub type RunId = String;

/// How a run's source is built and exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    SingleImage,
    MultiService,
}

/// Run status. Ordered per §4.2: `Queued < Building < Deploying < Running <
/// {Succeeded, Failed, Stopped}`. `Succeeded`, `Failed`, and `Stopped` are
/// mutually terminal and not ordered against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Building,
    Deploying,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl Status {
    /// Rank in the monotonic order. Terminal statuses share the top rank —
    /// they're mutually unordered, just all "after" `Running`.
    fn rank(self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::Building => 1,
            Status::Deploying => 2,
            Status::Running => 3,
            Status::Succeeded | Status::Failed | Status::Stopped => 4,
        }
    }

    /// True once a record is frozen except for `completedAt`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Stopped)
    }

    /// Whether transitioning from `self` to `next` is a legal, non-regressing
    /// move per §4.2's monotonic-status rule. A transition out of a terminal
    /// status is always illegal, even to another terminal status.
    pub fn can_advance_to(self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// Where an image came from. Set by the Builder, which is the only worker
/// that actually knows whether it ran `docker build` or resolved a
/// ready-made registry reference — the Deployer must not re-derive this by
/// pattern-matching the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Built,
    External,
}

/// One resolved service out of a compose manifest, carried end to end from
/// the Builder to the Deployer without losing its name or port association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceImage {
    pub name: String,
    pub image_ref: String,
    pub source: ImageSource,
    pub ports: Vec<u16>,
    pub environment: BTreeMap<String, String>,
}

/// The tagged payload variant from the design notes: rather than one struct
/// with nullable single-image/multi-service siblings, the two shapes are
/// distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunPayload {
    SingleImage {
        image_ref: String,
        ports: Vec<u16>,
        source: ImageSource,
    },
    MultiService {
        services: Vec<ServiceImage>,
    },
}

/// Canonical record of one requested execution. Created by the Coordinator
/// on `RunRequested`; mutated by the Coordinator (status/projection fields)
/// and the Deployer (tenant/preview/startedAt); never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub repo: String,
    pub branch: String,
    pub mode: Mode,
    pub compose_path: Option<String>,
    pub primary_service: Option<String>,
    pub status: Status,
    pub tenant: Option<String>,
    pub preview_url: Option<String>,
    pub payload: Option<RunPayload>,
    pub error: Option<String>,
    pub logs_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new_queued(
        run_id: RunId,
        repo: String,
        branch: String,
        mode: Mode,
        compose_path: Option<String>,
        primary_service: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Run {
            run_id,
            repo,
            branch,
            mode,
            compose_path,
            primary_service,
            status: Status::Queued,
            tenant: None,
            preview_url: None,
            payload: None,
            error: None,
            logs_ref: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply the monotonic-status rule. Returns `false` (no-op) on a
    /// regressive or post-terminal transition rather than erroring — callers
    /// (the Coordinator) translate a rejected transition into "silently
    /// dropped", per §4.2.
    pub fn advance_status(&mut self, next: Status) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

/// Fast-read mirror of a [`Run`], keyed by `RunId` in the projection cache.
/// Authoritative only for reads — writes always land in the document store
/// first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusProjection {
    pub run_id: RunId,
    pub status: Status,
    pub preview_url: Option<String>,
    pub mode: Mode,
    pub primary_service: Option<String>,
    pub error: Option<String>,
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which pipeline phase a [`LogLine`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Build,
    Run,
}

/// One aggregated blob per run, produced by the Builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    pub run_id: RunId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One append-only line document. Ordered per `(run_id, source,
/// service_name)` by ascending `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: RunId,
    pub source: LogSource,
    pub service_name: Option<String>,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Namespace descriptor synthesised by the Deployer before provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceDescriptor {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// One service's deployment descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub service_name: String,
    pub image: String,
    pub image_pull_policy: ImagePullPolicy,
    pub replicas: u32,
    pub env: BTreeMap<String, String>,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ImagePullPolicy {
    Never,
    IfNotPresent,
}

/// Network-endpoint descriptor, one per service, always `NodePort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub service_name: String,
    pub container_ports: Vec<u16>,
}

/// In-memory bundle built by the Deployer before provisioning (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantResources {
    pub tenant: String,
    pub namespace: NamespaceDescriptor,
    pub deployments: Vec<DeploymentDescriptor>,
    pub endpoints: Vec<EndpointDescriptor>,
    pub primary_port: u16,
    pub service_ports: BTreeMap<String, Vec<u16>>,
}

/// Process-level port-forward descriptor. Keyed by `(tenant, service)`; at
/// most one live handle per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForward {
    pub tenant: String,
    pub service: String,
    pub pod_name: String,
    pub local_port: u16,
    pub target_port: u16,
    pub url: String,
    #[serde(skip)]
    pub process_handle: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Event envelope: every stream entry carries a type tag, serialized
/// payload bytes, and a broker-assigned monotonic id within its stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub type_name: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
}

/// Event payload kinds (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunRequested {
        run_id: RunId,
        repo: String,
        branch: String,
        mode: Mode,
        compose_path: Option<String>,
        primary_service: Option<String>,
    },
    RunStopRequested {
        run_id: RunId,
        tenant: Option<String>,
        requested_at: DateTime<Utc>,
    },
    BuildProgress {
        run_id: RunId,
        current: u32,
        total: u32,
        service_name: String,
        ts: DateTime<Utc>,
    },
    BuildSucceeded {
        run_id: RunId,
        mode: Mode,
        payload: RunPayload,
        completed_at: DateTime<Utc>,
        logs_ref: Option<String>,
    },
    BuildFailed {
        run_id: RunId,
        error: String,
        failed_at: DateTime<Utc>,
        logs_ref: Option<String>,
        suggested_fixes: Vec<String>,
    },
    RunSucceeded {
        run_id: RunId,
        preview_url: String,
        tenant: String,
        started_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl Event {
    /// The `type` envelope field (§4.1/§6): the stream is multiplexed by
    /// this name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::RunRequested { .. } => "run_requested",
            Event::RunStopRequested { .. } => "run_stop_requested",
            Event::BuildProgress { .. } => "build_progress",
            Event::BuildSucceeded { .. } => "build_succeeded",
            Event::BuildFailed { .. } => "build_failed",
            Event::RunSucceeded { .. } => "run_succeeded",
            Event::RunFailed { .. } => "run_failed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Event::RunRequested { run_id, .. }
            | Event::RunStopRequested { run_id, .. }
            | Event::BuildProgress { run_id, .. }
            | Event::BuildSucceeded { run_id, .. }
            | Event::BuildFailed { run_id, .. }
            | Event::RunSucceeded { run_id, .. }
            | Event::RunFailed { run_id, .. } => run_id,
        }
    }
}

/// Error taxonomy (§7), spanning every worker. Libraries return this type;
/// binaries wrap it in `anyhow` at the outermost loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stream broker unreachable, document-store timeout, cluster API 5xx.
    /// Handlers return this to signal "do not acknowledge, retry".
    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    /// Envelope payload failed to decode. Acknowledged immediately — never
    /// retried, never counted against `MaxRetries`.
    #[error("poison message: {0}")]
    PoisonMessage(String),

    /// Deterministic failure cloning, parsing, or building an image.
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// Readiness gate expired with zero ready pods, resource synthesis
    /// error, or cluster API refusal.
    #[error("deployment failed: {0}")]
    DeploymentFailure(String),

    /// A stop arrived during a still-in-flight deploy.
    #[error("stop race: {0}")]
    StopRace(String),

    /// Preferred local port busy and the fallback also failed.
    #[error("port contention: {0}")]
    PortContention(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "redis-errors")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::TransientDependency(e.to_string())
    }
}

#[cfg(feature = "sqlite-errors")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::TransientDependency(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_rejects_regression() {
        assert!(Status::Queued.can_advance_to(Status::Building));
        assert!(!Status::Building.can_advance_to(Status::Queued));
        assert!(Status::Queued.can_advance_to(Status::Queued));
    }

    #[test]
    fn terminal_status_is_frozen() {
        assert!(!Status::Succeeded.can_advance_to(Status::Failed));
        assert!(!Status::Failed.can_advance_to(Status::Running));
        assert!(Status::Succeeded.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn run_advance_status_drops_regression_silently() {
        let mut run = Run::new_queued(
            "r1".into(),
            "https://example.invalid/x.git".into(),
            "main".into(),
            Mode::SingleImage,
            None,
            None,
            Utc::now(),
        );
        assert!(run.advance_status(Status::Building));
        assert!(run.advance_status(Status::Running));
        assert!(!run.advance_status(Status::Deploying));
        assert_eq!(run.status, Status::Running);
    }

    #[test]
    fn event_round_trips_through_json() {
        let ev = Event::RunRequested {
            run_id: "r1".into(),
            repo: "https://example.invalid/x.git".into(),
            branch: "main".into(),
            mode: Mode::SingleImage,
            compose_path: None,
            primary_service: None,
        };
        let bytes = serde_json::to_vec(&ev).unwrap();
        let back: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.type_name(), "run_requested");
        assert_eq!(back.run_id(), "r1");
    }

    proptest! {
        #[test]
        fn monotonic_rank_never_decreases_on_same_variant(a in 0u8..4, b in 0u8..4) {
            let statuses = [Status::Queued, Status::Building, Status::Deploying, Status::Running];
            let s1 = statuses[a as usize];
            let s2 = statuses[b as usize];
            if s1.can_advance_to(s2) {
                prop_assert!(s2.rank() >= s1.rank());
            }
        }
    }
}
