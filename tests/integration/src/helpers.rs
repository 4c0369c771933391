//! Test harness: simulated replicas sharing one in-process store and clock,
//! and a flowpool-server subprocess for end-to-end checks.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Output};
use std::sync::Arc;
use std::time::Duration;

use flowpool_lease::{
    leader_lease_name, member_lease_name, Controller, DeploymentTopology, EventBus,
    LeaderController, Lease, LeaseService, LeaseServiceConfig, ManualClock, MemberController,
    MemberLeaseEvent, MemberLeaseListener, MembershipCoordinator, MemoryStore, ProcessIdentity,
};
use tokio::sync::broadcast;

pub const NS: &str = "payments";
pub const POOL: &str = "orders";
pub const DEPLOYMENT: &str = "web";

pub const MEMBER_TTL_SECS: i32 = 30;
pub const LEADER_TTL_SECS: i32 = 15;

/// A deployment and the store its replicas coordinate through.
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Cluster {
    /// Seeds a deployment wanting `replicas` pods. No replica runs yet.
    pub fn new(replicas: i32) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.seed_deployment(NS, DEPLOYMENT, replicas, &pod(0));
        Self {
            store,
            clock: Arc::new(ManualClock::starting_now()),
        }
    }

    /// Starts a replica for pod `name`, registering the pod if needed.
    pub fn replica(&self, name: &str) -> Replica {
        self.store.add_pod(NS, DEPLOYMENT, name);
        let identity = ProcessIdentity {
            namespace: NS.into(),
            pod_name: name.into(),
        };
        let topology = Arc::new(DeploymentTopology::new(self.store.clone(), identity));
        let service = Arc::new(LeaseService::new(
            self.store.clone(),
            topology,
            self.clock.clone(),
            LeaseServiceConfig {
                namespace: NS.into(),
                pool_name: POOL.into(),
                member_duration_secs: MEMBER_TTL_SECS,
                leader_duration_secs: LEADER_TTL_SECS,
            },
        ));

        let coordinator = Arc::new(MembershipCoordinator::new());
        let bus = EventBus::new(16);
        let listeners: Vec<Arc<dyn MemberLeaseListener>> = vec![
            Arc::clone(&coordinator) as Arc<dyn MemberLeaseListener>,
            Arc::new(bus.clone()),
        ];

        Replica {
            pod: name.to_string(),
            leader: Arc::new(LeaderController::new(Arc::clone(&service), name, true)),
            member: Arc::new(MemberController::new(service, name, true, listeners)),
            coordinator,
            bus,
        }
    }

    /// Starts replicas for pods `web-0` .. `web-{n-1}`.
    pub fn replicas(&self, n: u32) -> Vec<Replica> {
        (0..n).map(|i| self.replica(&pod(i))).collect()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub fn set_replicas(&self, replicas: i32) {
        self.store.set_replicas(NS, DEPLOYMENT, replicas);
    }

    pub fn lease(&self, name: &str) -> Lease {
        self.store
            .lease(NS, name)
            .unwrap_or_else(|| panic!("lease {name} does not exist"))
    }

    pub fn leader(&self) -> Option<String> {
        self.store
            .lease(NS, &leader_lease_name(POOL))
            .and_then(|l| l.holder().map(str::to_string))
    }

    /// Member lease name → current holder, in name order.
    pub fn member_holders(&self) -> BTreeMap<String, Option<String>> {
        let prefix = format!("flow-pool-member-{POOL}-");
        self.store
            .leases(NS)
            .into_iter()
            .filter(|l| l.name().starts_with(&prefix))
            .map(|l| (l.name().to_string(), l.holder().map(str::to_string)))
            .collect()
    }
}

/// One simulated process: both controllers plus its membership state.
pub struct Replica {
    pub pod: String,
    pub leader: Arc<LeaderController>,
    pub member: Arc<MemberController>,
    pub coordinator: Arc<MembershipCoordinator>,
    pub bus: EventBus,
}

impl Replica {
    /// Runs one leader cycle then one member cycle, in the order a fresh
    /// replica with no initial delay would.
    pub async fn tick(&self) {
        self.leader.run_cycle().await;
        self.member.run_cycle().await;
    }

    /// Graceful shutdown: both leases are handed back.
    pub async fn stop(&self) {
        self.member.release().await;
        self.leader.release().await;
    }

    pub fn lease(&self) -> Option<String> {
        self.coordinator.current_lease()
    }

    pub fn events(&self) -> broadcast::Receiver<MemberLeaseEvent> {
        self.bus.subscribe()
    }
}

pub async fn tick_all(replicas: &[Replica]) {
    for r in replicas {
        r.tick().await;
    }
}

pub fn pod(ordinal: u32) -> String {
    format!("{DEPLOYMENT}-{ordinal}")
}

pub fn member(ordinal: u32) -> String {
    member_lease_name(POOL, ordinal)
}

/// A flowpool-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub health_port: u16,
    _config_dir: tempfile::TempDir,
}

impl TestServer {
    /// Starts flowpool-server on the memory store with `config` (TOML)
    /// written to a temp file. The health endpoint gets a free port.
    pub fn start(config: &str) -> Self {
        let health_port = find_free_port();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowpool.toml");
        std::fs::write(&path, config).unwrap();

        let binary = server_binary();
        let child = Command::new(&binary)
            .arg("--config")
            .arg(&path)
            .arg("--store")
            .arg("memory")
            .arg("--identity")
            .arg("local")
            .arg("--bind")
            .arg("127.0.0.1")
            .arg("--health-port")
            .arg(health_port.to_string())
            .env("POD_NAME", "itest-0")
            .env("POD_NAMESPACE", "itest")
            // suppress tracing output in tests
            .env("RUST_LOG", "error")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| {
                panic!("failed to spawn flowpool-server at {}: {e}", binary.display())
            });

        Self {
            child,
            health_port,
            _config_dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.health_port)
    }

    /// Polls `path` until it answers `status`, returning the JSON body.
    pub async fn wait_for_status(&self, path: &str, status: u16) -> serde_json::Value {
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if tokio::time::Instant::now() > deadline {
                panic!("{path} did not answer {status} within 10 seconds");
            }
            if let Ok(resp) = client.get(self.url(path)).send().await {
                if resp.status().as_u16() == status {
                    return resp.json().await.unwrap();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Runs flowpool-server to completion with the given args.
pub fn run_server(args: &[&str]) -> Output {
    Command::new(server_binary())
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to run flowpool-server")
}

fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates the flowpool-server binary next to the test binary.
fn server_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    // test binary is in target/<profile>/deps/
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("flowpool-server");
    if !path.exists() {
        panic!(
            "flowpool-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
