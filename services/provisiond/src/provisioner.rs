//! Dispatch from workload kind to the handler that applies it.
//!
//! The dispatcher is pure routing: it holds exactly one handler per workload
//! kind and turns the handler outcome into a signed [`WorkloadResult`]. The
//! handlers themselves own every host side effect (container runtime calls,
//! disk formatting, wireguard keys) and live behind the [`Handler`]
//! contract.

use async_trait::async_trait;
use chrono::Utc;
use plfm_gridtypes::{ResultState, Workload, WorkloadResult, WorkloadType};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One workload kind's provision/decommission side effects.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Apply the workload to the host. The returned value is the
    /// kind-specific payload of the result reported upstream.
    async fn provision(&self, workload: &Workload) -> anyhow::Result<serde_json::Value>;

    /// Tear the workload's side effects down.
    async fn decommission(&self, workload: &Workload) -> anyhow::Result<()>;
}

/// Signs result payloads on behalf of the node identity.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> String;
}

/// Node-key signer: hex sha256 over the node secret and the signable bytes.
pub struct KeySigner {
    secret: Vec<u8>,
}

impl KeySigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Signer for KeySigner {
    fn sign(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

/// The provisioning contract the engine drives.
#[async_trait]
pub trait Provision: Send + Sync {
    /// Route the workload to its handler and wrap the outcome. Handler
    /// failures come back as a result in the `error` state, not as an `Err`.
    async fn provision(&self, workload: &Workload) -> WorkloadResult;

    /// Route a teardown to the matching handler.
    async fn decommission(&self, workload: &Workload) -> anyhow::Result<()>;

    /// Build a signed error result outside a handler invocation (timeouts,
    /// engine-side failures).
    fn error_result(&self, workload: &Workload, error: String) -> WorkloadResult;

    /// Build a signed result acknowledging a completed decommission.
    fn deleted_result(&self, workload: &Workload) -> WorkloadResult;
}

/// The closed handler set, one per workload kind.
///
/// A struct rather than a map: a new kind means a new field, and the
/// compiler finds every construction and dispatch site that must learn
/// about it.
pub struct Primitives {
    pub container: Box<dyn Handler>,
    pub volume: Box<dyn Handler>,
    pub network: Box<dyn Handler>,
    pub zdb: Box<dyn Handler>,
    pub kubernetes: Box<dyn Handler>,
    pub public_ip: Box<dyn Handler>,
    pub signer: Box<dyn Signer>,
}

impl Primitives {
    fn handler(&self, kind: WorkloadType) -> &dyn Handler {
        match kind {
            WorkloadType::Container => self.container.as_ref(),
            WorkloadType::Volume => self.volume.as_ref(),
            WorkloadType::Network => self.network.as_ref(),
            WorkloadType::Zdb => self.zdb.as_ref(),
            WorkloadType::Kubernetes => self.kubernetes.as_ref(),
            WorkloadType::PublicIp => self.public_ip.as_ref(),
        }
    }

    fn build_result(
        &self,
        workload: &Workload,
        outcome: anyhow::Result<serde_json::Value>,
    ) -> WorkloadResult {
        let (state, error, data) = match outcome {
            Ok(data) => (ResultState::Ok, String::new(), data),
            Err(e) => (ResultState::Error, format!("{e:#}"), serde_json::Value::Null),
        };

        let mut result = WorkloadResult {
            id: workload.id.clone(),
            kind: workload.kind,
            created: Utc::now(),
            state,
            error,
            data,
            signature: String::new(),
        };
        result.signature = self.signer.sign(&result.signable_bytes());
        result
    }
}

#[async_trait]
impl Provision for Primitives {
    async fn provision(&self, workload: &Workload) -> WorkloadResult {
        debug!(id = %workload.id, kind = %workload.kind, "dispatching provision");
        let outcome = self.handler(workload.kind).provision(workload).await;
        self.build_result(workload, outcome)
    }

    async fn decommission(&self, workload: &Workload) -> anyhow::Result<()> {
        debug!(id = %workload.id, kind = %workload.kind, "dispatching decommission");
        self.handler(workload.kind).decommission(workload).await
    }

    fn error_result(&self, workload: &Workload, error: String) -> WorkloadResult {
        self.build_result(workload, Err(anyhow::anyhow!(error)))
    }

    fn deleted_result(&self, workload: &Workload) -> WorkloadResult {
        let mut result = self.build_result(workload, Ok(serde_json::Value::Null));
        result.state = ResultState::Deleted;
        result.signature = self.signer.sign(&result.signable_bytes());
        result
    }
}

/// Handler that records invocations and returns canned outcomes. Used by the
/// engine and integration tests in place of real host side effects.
#[derive(Default)]
pub struct MockHandler {
    pub provisioned: std::sync::Mutex<Vec<Workload>>,
    pub decommissioned: std::sync::Mutex<Vec<Workload>>,
    pub fail_provision: bool,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_provision: true,
            ..Self::default()
        }
    }

    pub fn provision_count(&self) -> usize {
        self.provisioned.lock().expect("mock lock poisoned").len()
    }

    pub fn decommission_count(&self) -> usize {
        self.decommissioned.lock().expect("mock lock poisoned").len()
    }
}

#[async_trait]
impl Handler for MockHandler {
    async fn provision(&self, workload: &Workload) -> anyhow::Result<serde_json::Value> {
        self.provisioned
            .lock()
            .expect("mock lock poisoned")
            .push(workload.clone());
        if self.fail_provision {
            anyhow::bail!("mock handler failure");
        }
        Ok(serde_json::json!({"id": workload.id.as_str()}))
    }

    async fn decommission(&self, workload: &Workload) -> anyhow::Result<()> {
        self.decommissioned
            .lock()
            .expect("mock lock poisoned")
            .push(workload.clone());
        Ok(())
    }
}

/// A dispatcher whose six handlers all share one [`MockHandler`].
pub fn mock_primitives(handler: std::sync::Arc<MockHandler>) -> Primitives {
    struct Shared(std::sync::Arc<MockHandler>);

    #[async_trait]
    impl Handler for Shared {
        async fn provision(&self, workload: &Workload) -> anyhow::Result<serde_json::Value> {
            self.0.provision(workload).await
        }

        async fn decommission(&self, workload: &Workload) -> anyhow::Result<()> {
            self.0.decommission(workload).await
        }
    }

    Primitives {
        container: Box::new(Shared(handler.clone())),
        volume: Box::new(Shared(handler.clone())),
        network: Box::new(Shared(handler.clone())),
        zdb: Box::new(Shared(handler.clone())),
        kubernetes: Box::new(Shared(handler.clone())),
        public_ip: Box::new(Shared(handler)),
        signer: Box::new(KeySigner::new("test-secret")),
    }
}
