//! Shared pieces for the integration tests: tempdir-backed stores, canned
//! workloads, and a slow handler for deadline tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plfm_gridtypes::{Tag, Workload, WorkloadId, WorkloadType};
use plfm_provisiond::provisioner::{Handler, KeySigner, MockHandler, Primitives};
use plfm_provisiond::storage::FsStore;
use tempfile::TempDir;

pub fn temp_store() -> (TempDir, Arc<FsStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::open(dir.path().join("cache")).unwrap());
    (dir, store)
}

pub fn volume(id: &str) -> Workload {
    Workload {
        id: WorkloadId::parse(id).unwrap(),
        user: "user-1".to_string(),
        kind: WorkloadType::Volume,
        data: serde_json::json!({"size": 1, "type": "ssd"}),
        created: Utc::now(),
        duration: Duration::from_secs(3600),
        to_delete: false,
        signature: String::new(),
        tag: Tag::default(),
    }
}

pub fn container(id: &str) -> Workload {
    Workload {
        id: WorkloadId::parse(id).unwrap(),
        user: "user-1".to_string(),
        kind: WorkloadType::Container,
        data: serde_json::json!({
            "flist": "https://hub/app.flist",
            "network": {"network_id": "mynet"},
            "capacity": {"cpu": 1, "memory": 512, "disk_type": "ssd", "disk_size": 256},
        }),
        created: Utc::now(),
        duration: Duration::from_secs(3600),
        to_delete: false,
        signature: String::new(),
        tag: Tag::default(),
    }
}

/// Dispatcher whose six kinds share `handler`, plus a test signer.
pub fn primitives_with(handler: Arc<MockHandler>) -> Arc<Primitives> {
    Arc::new(plfm_provisiond::provisioner::mock_primitives(handler))
}

/// Handler that sleeps long enough to trip any short deadline.
pub struct SlowHandler {
    pub delay: Duration,
}

#[async_trait]
impl Handler for SlowHandler {
    async fn provision(&self, workload: &Workload) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({"id": workload.id.as_str()}))
    }

    async fn decommission(&self, _workload: &Workload) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Six slow handlers behind one dispatcher.
pub fn slow_primitives(delay: Duration) -> Arc<Primitives> {
    Arc::new(Primitives {
        container: Box::new(SlowHandler { delay }),
        volume: Box::new(SlowHandler { delay }),
        network: Box::new(SlowHandler { delay }),
        zdb: Box::new(SlowHandler { delay }),
        kubernetes: Box::new(SlowHandler { delay }),
        public_ip: Box::new(SlowHandler { delay }),
        signer: Box::new(KeySigner::new("test-secret")),
    })
}

/// Cleanup stub counting invocations.
#[derive(Default)]
pub struct CountingJanitor {
    runs: std::sync::Mutex<usize>,
}

impl CountingJanitor {
    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl plfm_provisiond::janitor::Cleanup for CountingJanitor {
    async fn cleanup(&self) -> anyhow::Result<()> {
        *self.runs.lock().unwrap() += 1;
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
