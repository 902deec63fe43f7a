use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bbr::coap::handlers::{
    AddressErrorHandler, AddressQueryHandler, BackboneAnswerHandler, BackboneQueryHandler,
    DuaRegistrationHandler, MlrRegistrationHandler, ProactiveNotificationHandler,
};
use bbr::coap::{CoapClient, CoapServer};
use bbr::dad::DadScheduler;
use bbr::events::{run_notification_sender, EventBus};
use bbr::mcast_router::{handle_upcall, McastRouter, MifAssignment};
use bbr::nd_proxy::NdProxy;
use bbr::ncp::{NullNcpCommander, SyslogReceiver};
use bbr::ncp::syslog::apply_event;
use bbr::packet_filter::IpTablesFilter;
use bbr::state::{BbrState, DadRequest};
use bbr::supervisor::{SupervisedTask, Supervisor};
use bbr_core::config::{ConfigSchema, ConfigStore, ConfigValue, SchemaEntry};
use bbr_core::role::BbrRole;
use bbr_core::time::SystemClock;
use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing_subscriber::EnvFilter;

const DEFAULT_SYSLOG_PORT: u16 = 10514;
const DUA_DAD_QUERY_TIMEOUT: Duration = Duration::from_millis(1100);

#[derive(Parser, Debug)]
#[command(name = "bbrd", about = "Thread 1.2 Backbone Border Router daemon")]
struct Cli {
    /// Path to the persisted configuration snapshot.
    #[arg(long, default_value = "/var/lib/bbrd/bbrd.json")]
    config: PathBuf,

    /// Print the effective configuration and exit without starting any task.
    #[arg(long)]
    form: bool,

    /// Delete the persisted configuration snapshot and exit.
    #[arg(long)]
    clear: bool,

    /// Repeat for more verbose logging (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Backbone-facing network interface.
    #[arg(long, default_value = "eth0")]
    backbone_interface: String,

    /// Thread mesh-facing network interface.
    #[arg(long, default_value = "wpan0")]
    mesh_interface: String,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "bbr=info,bbr_core=info",
        1 => "bbr=debug,bbr_core=debug",
        _ => "bbr=trace,bbr_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_schema() -> ConfigSchema {
    ConfigSchema::new()
        .declare("mesh_local_prefix", SchemaEntry::new(None).persistent())
        .declare("domain_prefix", SchemaEntry::new(None).persistent())
        .declare(
            "bbr_sequence_number",
            SchemaEntry::new(Some(ConfigValue::Int(0))).writable().persistent(),
        )
        .declare(
            "default_mlr_timeout",
            SchemaEntry::new(Some(ConfigValue::Int(3600)))
                .with_validator(|v| matches!(v.as_int(), Some(n) if n >= 300))
                .writable()
                .persistent(),
        )
        .declare(
            "reregistration_delay",
            SchemaEntry::new(Some(ConfigValue::Int(5))).writable().persistent(),
        )
        .declare(
            "permanent_multicast_set",
            SchemaEntry::new(Some(ConfigValue::StringList(Vec::new()))).persistent(),
        )
        .declare(
            "notification_peers",
            SchemaEntry::new(Some(ConfigValue::StringList(Vec::new()))).writable().persistent(),
        )
        .declare("dua_enabled", SchemaEntry::new(Some(ConfigValue::Bool(true))).writable().persistent())
        .declare("dua_next_status", SchemaEntry::new(None).writable())
        .declare("dua_next_status_eid", SchemaEntry::new(None).writable())
}

/// Resolve an interface name to its kernel index, needed for the MRT6
/// `MIF` table and for binding the ND-Proxy raw socket.
fn interface_index(name: &str) -> anyhow::Result<u32> {
    nix::net::if_::if_nametoindex(name).with_context(|| format!("resolving interface index for {name}"))
}

struct CoapServerTask {
    server: Arc<CoapServer>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl SupervisedTask for CoapServerTask {
    fn name(&self) -> &str {
        "coap_server"
    }

    fn gate_keys(&self) -> &[&str] {
        &["mesh_local_prefix", "domain_prefix"]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let server = self.server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "CoAP server loop exited");
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

struct DadTask {
    scheduler: Arc<DadScheduler>,
    requests: Mutex<Option<mpsc::Receiver<DadRequest>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl SupervisedTask for DadTask {
    fn name(&self) -> &str {
        "dad_scheduler"
    }

    fn gate_keys(&self) -> &[&str] {
        &["domain_prefix"]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let Some(requests) = self.requests.lock().await.take() else {
            anyhow::bail!("DAD scheduler already started once, its receiver was consumed");
        };
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run(requests).await });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

struct McastRouterTask {
    state: Arc<BbrState>,
    router: Arc<McastRouter>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl SupervisedTask for McastRouterTask {
    fn name(&self) -> &str {
        "mcast_router"
    }

    fn gate_keys(&self) -> &[&str] {
        &["mesh_local_prefix"]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut upcalls = self.router.clone().spawn_upcall_loop();
        let state = self.state.clone();
        let router = self.router.clone();
        let handle = tokio::spawn(async move {
            while let Some((origin, group)) = upcalls.recv().await {
                handle_upcall(&state, &router, origin, group).await;
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

struct SyslogTask {
    state: Arc<BbrState>,
    bind_addr: SocketAddr,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl SupervisedTask for SyslogTask {
    fn name(&self) -> &str {
        "ncp_syslog"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let receiver = SyslogReceiver::bind(self.bind_addr, events_tx).await?;
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let consumer_state = state.clone();
            let consumer = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    apply_event(&consumer_state, event).await;
                }
            });
            if let Err(e) = receiver.run().await {
                tracing::error!(error = %e, "NCP syslog receiver exited");
            }
            consumer.abort();
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

struct NotificationSenderTask {
    state: Arc<BbrState>,
    events: EventBus,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl SupervisedTask for NotificationSenderTask {
    fn name(&self) -> &str {
        "pro_bb_notification_sender"
    }

    fn gate_keys(&self) -> &[&str] {
        &["domain_prefix"]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let state = self.state.clone();
        let rx = self.events.subscribe();
        let peers = self
            .state
            .config
            .get("notification_peers")
            .await
            .and_then(|v| v.as_string_list().map(|l| l.to_vec()))
            .unwrap_or_default()
            .iter()
            .filter_map(|s| s.parse::<SocketAddr>().ok())
            .collect::<Vec<_>>();
        let handle = tokio::spawn(run_notification_sender(state, rx, peers));
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let schema = build_schema();
    let config = Arc::new(ConfigStore::new(schema, Some(cli.config.clone())));
    config.load_snapshot().await.context("loading configuration snapshot")?;

    if cli.clear {
        let _ = tokio::fs::remove_file(&cli.config).await;
        tracing::info!(path = %cli.config.display(), "cleared persisted configuration");
        return Ok(());
    }

    if cli.form {
        println!("mesh_local_prefix = {:?}", config.get_str("mesh_local_prefix").await);
        println!("domain_prefix = {:?}", config.get_str("domain_prefix").await);
        println!("bbr_sequence_number = {:?}", config.get_int("bbr_sequence_number").await);
        return Ok(());
    }

    let mesh_local_prefix: Ipv6Addr = config
        .get_str("mesh_local_prefix")
        .await
        .unwrap_or_else(|| "fd00::".to_string())
        .parse()
        .context("parsing mesh_local_prefix")?;
    let domain_prefix: Ipv6Addr = config
        .get_str("domain_prefix")
        .await
        .unwrap_or_else(|| "fd00:dead:beef::".to_string())
        .parse()
        .context("parsing domain_prefix")?;

    let (dad_tx, dad_rx) = mpsc::channel(64);
    let coap_client = Arc::new(CoapClient::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)).await?);
    let events = EventBus::new(64);

    let nd_proxy = NdProxy::spawn(&cli.mesh_interface, interface_index(&cli.mesh_interface)?, mesh_local_prefix)
        .context("spawning ND-Proxy")?;

    let state = Arc::new(BbrState {
        config: config.clone(),
        clock: Arc::new(SystemClock),
        packet_filter: Arc::new(IpTablesFilter::new("BBR_FORWARD", cli.backbone_interface.clone())),
        ncp: Arc::new(NullNcpCommander),
        coap_client: coap_client.clone(),
        dua_registry: Mutex::new(Default::default()),
        mlr_registry: Mutex::new(Default::default()),
        remote_dua_cache: Mutex::new(Default::default()),
        role: RwLock::new(BbrRole::Off),
        mesh_local_prefix,
        domain_prefix: RwLock::new(domain_prefix),
        own_rloc16: RwLock::new(0),
        dad_tx,
        events: Arc::new(events.clone()),
        dua_neighbors: Arc::new(nd_proxy),
    });

    let mut coap_server =
        CoapServer::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), bbr::nd_proxy::COAP_PORT)).await?;
    coap_server.register("/n/dr", Arc::new(DuaRegistrationHandler::new(state.clone())));
    coap_server.register("/n/mr", Arc::new(MlrRegistrationHandler::new(state.clone())));
    coap_server.register("/b/bq", Arc::new(BackboneQueryHandler::new(state.clone())));
    coap_server.register("/b/ba", Arc::new(BackboneAnswerHandler::new(state.clone())));
    coap_server.register("/b/bmr", Arc::new(ProactiveNotificationHandler::new(state.clone())));
    coap_server.register("/a/ae", Arc::new(AddressErrorHandler::new(state.clone())));
    coap_server.register("/a/aq", Arc::new(AddressQueryHandler::new(state.clone())));
    let coap_server = Arc::new(coap_server);
    let shutdown = coap_server.shutdown_handle();

    let mut supervisor = Supervisor::new(config.clone());
    supervisor.register(Arc::new(CoapServerTask {
        server: coap_server.clone(),
        shutdown,
        handle: Mutex::new(None),
    }));

    let dad_scheduler = Arc::new(DadScheduler::new(state.clone(), DUA_DAD_QUERY_TIMEOUT));
    supervisor.register(Arc::new(DadTask {
        scheduler: dad_scheduler,
        requests: Mutex::new(Some(dad_rx)),
        handle: Mutex::new(None),
    }));

    if let (Ok(mesh_ifindex), Ok(backbone_ifindex)) =
        (interface_index(&cli.mesh_interface), interface_index(&cli.backbone_interface))
    {
        let mifs = MifAssignment { mesh_mif: 0, mesh_ifindex, backbone_mif: 1, backbone_ifindex };
        match McastRouter::new(mifs) {
            Ok(router) => supervisor.register(Arc::new(McastRouterTask {
                state: state.clone(),
                router: Arc::new(router),
                handle: Mutex::new(None),
            })),
            Err(e) => tracing::warn!(error = %e, "multicast router unavailable, running without kernel-assisted forwarding"),
        }
    }

    supervisor.register(Arc::new(SyslogTask {
        state: state.clone(),
        bind_addr: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), DEFAULT_SYSLOG_PORT),
        handle: Mutex::new(None),
    }));

    supervisor.register(Arc::new(NotificationSenderTask {
        state: state.clone(),
        events,
        handle: Mutex::new(None),
    }));

    supervisor.start_all().await;

    tracing::info!("bbrd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;

    supervisor.stop_all().await;
    Ok(())
}
