mod config;
mod health;
mod kube;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flowpool_lease::{
    spawn_controller, spawn_primed, ClusterIdentityResolver, ControllerHandle, DeploymentTopology,
    EventBus, FixedTopology, IdentityResolver, LeaderController, LeaseService, LeaseServiceConfig,
    LocalIdentityResolver, MemberController, MemberLeaseEventKind, MemberLeaseListener,
    MembershipCoordinator, MemoryStore, PoolTopology, ProcessIdentity, ReadinessCheck,
    ResourceStore, Schedule, SchedulerConfig, SystemClock,
};
use tracing::{debug, info, warn};

use crate::config::{IdentityMode, ServerConfig, StoreMode};
use crate::health::HealthState;
use crate::kube::KubeStore;

#[derive(Parser)]
#[command(
    name = "flowpool-server",
    about = "lease-based pool coordination for one replica"
)]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "FLOWPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// pool name. pools sharing a namespace must use distinct names
    #[arg(long, env = "FLOWPOOL_POOL_NAME")]
    pool_name: Option<String>,

    /// resource store: kubernetes or memory
    #[arg(long, env = "FLOWPOOL_STORE")]
    store: Option<String>,

    /// identity source: cluster or local
    #[arg(long, env = "FLOWPOOL_IDENTITY")]
    identity: Option<String>,

    /// namespace to use when none is injected or mounted
    #[arg(long, env = "FLOWPOOL_NAMESPACE")]
    namespace: Option<String>,

    /// address to bind the health endpoint to
    #[arg(long, env = "FLOWPOOL_BIND")]
    bind: Option<String>,

    /// port for the health endpoint (0 = disabled)
    #[arg(long, env = "FLOWPOOL_HEALTH_PORT")]
    health_port: Option<u16>,

    /// how long startup waits for a member lease (e.g. "30s")
    #[arg(long, env = "FLOWPOOL_AWAIT_LEASE_TIMEOUT")]
    await_lease_timeout: Option<String>,

    /// pool size assumed by the memory store
    #[arg(long, env = "FLOWPOOL_REPLICAS")]
    replicas: Option<i32>,

    /// do not compete for the leader lease
    #[arg(long, env = "FLOWPOOL_NO_LEADER")]
    no_leader: bool,

    /// do not claim a member lease
    #[arg(long, env = "FLOWPOOL_NO_MEMBER")]
    no_member: bool,

    /// kubernetes API server URL. default: in-cluster configuration
    #[arg(long, env = "FLOWPOOL_KUBE_API_SERVER")]
    kube_api_server: Option<String>,

    /// file holding the bearer token for --kube-api-server
    #[arg(long, env = "FLOWPOOL_KUBE_TOKEN_FILE")]
    kube_token_file: Option<String>,

    /// CA bundle used to verify --kube-api-server
    #[arg(long, env = "FLOWPOOL_KUBE_CA_FILE")]
    kube_ca_file: Option<String>,
}

/// Applies CLI overrides to a `ServerConfig`. Only `Some` values from the
/// CLI args take effect, which keeps the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref name) = args.pool_name {
        cfg.pool.name = name.clone();
    }
    if let Some(ref store) = args.store {
        cfg.store = store.clone();
    }
    if let Some(ref identity) = args.identity {
        cfg.identity = identity.clone();
    }
    if let Some(ref ns) = args.namespace {
        cfg.namespace = ns.clone();
    }
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.health_port {
        cfg.health_port = port;
    }
    if let Some(ref timeout) = args.await_lease_timeout {
        cfg.await_lease_timeout = timeout.clone();
    }
    if let Some(n) = args.replicas {
        cfg.replicas = n;
    }
    if args.no_leader {
        cfg.lease.leader.enabled = false;
    }
    if args.no_member {
        cfg.lease.member.enabled = false;
    }
    if let Some(ref v) = args.kube_api_server {
        cfg.kubernetes.api_server = v.clone();
    }
    if let Some(ref v) = args.kube_token_file {
        cfg.kubernetes.token_file = v.clone();
    }
    if let Some(ref v) = args.kube_ca_file {
        cfg.kubernetes.ca_file = v.clone();
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Parses a `host:port` pair into a `SocketAddr`. Exits with a message on failure.
fn parse_bind_addr(host: &str, port: u16) -> SocketAddr {
    match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => exit_err(format!("invalid bind address '{host}:{port}': {e}")),
    }
}

/// Resolves pod name and namespace once. Exits if the cluster resolver
/// cannot determine them.
fn resolve_identity(cfg: &ServerConfig, mode: IdentityMode) -> ProcessIdentity {
    let resolver: Box<dyn IdentityResolver> = match mode {
        IdentityMode::Cluster => Box::new(ClusterIdentityResolver::new(cfg.fallback_namespace())),
        IdentityMode::Local => Box::new(LocalIdentityResolver::new()),
    };
    resolver
        .resolve()
        .unwrap_or_else(|e| exit_err(format!("failed to resolve process identity: {e}")))
}

/// Builds the store and the topology resolver that reads it.
fn build_store(
    cfg: &ServerConfig,
    mode: StoreMode,
    identity: &ProcessIdentity,
) -> (Arc<dyn ResourceStore>, Arc<dyn PoolTopology>) {
    match mode {
        StoreMode::Kubernetes => {
            let store: Arc<dyn ResourceStore> = Arc::new(
                KubeStore::from_config(&cfg.kubernetes)
                    .unwrap_or_else(|e| exit_err(format!("failed to set up kubernetes store: {e}"))),
            );
            let topology = Arc::new(DeploymentTopology::new(
                Arc::clone(&store),
                identity.clone(),
            ));
            (store, topology)
        }
        StoreMode::Memory => {
            warn!("using in-memory store: leases are not shared with other processes");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(FixedTopology::new(cfg.replicas)),
            )
        }
    }
}

fn schedule_or_exit(cfg: &SchedulerConfig, role: &str) -> Schedule {
    cfg.schedule()
        .unwrap_or_else(|e| exit_err(format!("invalid {role} scheduler config: {e}")))
}

/// Logs member lease transitions published on the event bus.
fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == MemberLeaseEventKind::Lost => {
                    warn!(
                        lease = %event.lease_name,
                        pod = %event.pod_name,
                        "member lease lost, instance identity no longer held"
                    );
                }
                Ok(event) => {
                    debug!(lease = %event.lease_name, "member lease event: {}", event.kind);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event logger lagged, skipped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_all(handles: Vec<ControllerHandle>, grace: Duration) {
    for handle in handles {
        handle.shutdown(grace).await;
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowpool=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build ServerConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);
    cfg.validate()
        .unwrap_or_else(|e| exit_err(format!("invalid configuration: {e}")));

    let store_mode = cfg.store_mode().unwrap_or_else(|e| exit_err(e));
    let identity_mode = cfg.identity_mode().unwrap_or_else(|e| exit_err(e));
    let await_timeout = cfg.await_lease_timeout().unwrap_or_else(|e| exit_err(e));
    let grace = cfg.shutdown_grace().unwrap_or_else(|e| exit_err(e));
    let settings = cfg.pool_settings();

    let identity = resolve_identity(&cfg, identity_mode);
    info!(
        pool = %settings.pool.name,
        pod = %identity.pod_name,
        namespace = %identity.namespace,
        "flowpool server starting..."
    );

    let (store, topology) = build_store(&cfg, store_mode, &identity);
    let service = Arc::new(LeaseService::new(
        store,
        topology,
        Arc::new(SystemClock),
        LeaseServiceConfig::from_settings(identity.namespace.clone(), &settings),
    ));

    let coordinator = Arc::new(MembershipCoordinator::new());
    let bus = EventBus::default();
    spawn_event_logger(&bus);

    let mut handles = Vec::new();

    if settings.lease.leader.enabled {
        let leader = Arc::new(LeaderController::new(
            Arc::clone(&service),
            identity.pod_name.clone(),
            true,
        ));
        // create member leases before the first member cycle so binding
        // doesn't wait a full interval on a fresh pool
        let schedule = schedule_or_exit(&settings.schedulers.leader, "leader");
        handles.push(spawn_primed(leader, schedule).await);
    } else {
        info!("leader lease disabled, not competing for leadership");
    }

    let member_enabled = settings.lease.member.enabled;
    if member_enabled {
        let listeners: Vec<Arc<dyn MemberLeaseListener>> = vec![
            Arc::clone(&coordinator) as Arc<dyn MemberLeaseListener>,
            Arc::new(bus.clone()),
        ];
        let member = Arc::new(MemberController::new(
            Arc::clone(&service),
            identity.pod_name.clone(),
            true,
            listeners,
        ));
        let schedule = schedule_or_exit(&settings.schedulers.member, "member");
        handles.push(spawn_controller(member, schedule));
    } else {
        info!("member lease disabled, this replica takes no pool identity");
    }

    if let Some(port) = cfg.health_port() {
        let addr = parse_bind_addr(&cfg.bind, port);
        let state = Arc::new(HealthState {
            check: ReadinessCheck {
                lease_enabled: member_enabled,
                require_lease: settings.readiness.require_lease,
                pool_name: settings.pool.name.clone(),
                identity: identity.clone(),
            },
            coordinator: Arc::clone(&coordinator),
        });
        health::spawn_http_server(addr, state);
    }

    if member_enabled {
        info!(timeout = ?await_timeout, "waiting for a member lease to bind instance identity");
        match coordinator.await_lease(await_timeout).await {
            Ok(lease) => info!(instance_id = %lease, "instance identity bound to member lease"),
            Err(e) => {
                shutdown_all(handles, grace).await;
                exit_err(format!("failed to bind instance identity: {e}"));
            }
        }
    }

    shutdown_signal().await;
    info!("shutdown signal received, releasing leases...");
    shutdown_all(handles, grace).await;
    info!("shut down cleanly");
}
