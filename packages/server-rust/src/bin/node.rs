//! Shoal node daemon.
//!
//! Wires a cluster engine to the in-process loopback driver, which is
//! enough to run and inspect a single-node cluster; multi-node deployments
//! plug a distributed group driver and the peer transport behind the same
//! seams.

use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shoal_core::request::{flags, op};
use shoal_core::RequestHeader;
use shoal_server::driver::Delivery;
use shoal_server::{
    EngineSeams, FileEpochStore, GroupEngine, InMemoryVdiEngine, LoopbackHub, NoPeers,
    NullStoreGateway, NullWorkers, ServerConfig, TcpConnectivity,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Feeds pending driver deliveries into the engine.
fn dispatch(hub: &LoopbackHub, engine: &Mutex<GroupEngine>) {
    while let Some(delivery) = hub.next_delivery() {
        let mut engine = engine.lock();
        match delivery {
            Delivery::Join { joined, members, .. } => engine.handle_join(joined, members),
            Delivery::Leave { left, members, .. } => engine.handle_leave(left, members),
            Delivery::Notify { sender, payload, .. } => engine.handle_notify(sender, &payload),
        }
    }
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.json_logs);

    let epochs = FileEpochStore::open(config.dir.join("epoch"))?;
    let hub = LoopbackHub::new();
    let id = config.node_id();

    let engine = Mutex::new(GroupEngine::new(
        id,
        config.node_entry(),
        EngineSeams {
            epochs: Box::new(epochs),
            vdi: Box::new(InMemoryVdiEngine::new()),
            store: Box::new(NullStoreGateway),
            peers: Box::new(NoPeers),
            connectivity: Box::new(TcpConnectivity::new(config.probe_timeout())),
            workers: Box::new(NullWorkers),
            driver: Box::new(hub.port(id)),
        },
    ));

    let view = engine.lock().view_handle();

    engine.lock().start()?;
    dispatch(&hub, &engine);

    if config.format {
        let mut hdr = RequestHeader::new(op::MAKE_FS, flags::CMD_WRITE, 0);
        hdr.vdi.copies = config.copies;
        hdr.vdi.ctime = unix_time();
        let mut rx = engine.lock().queue_request(hdr, Vec::new());
        dispatch(&hub, &engine);
        match rx.try_recv() {
            Ok(reply) => info!(result = ?reply.result, "format finished"),
            Err(err) => error!(%err, "format did not complete"),
        }
    }

    {
        let v = view.load();
        info!(
            status = ?v.status,
            epoch = v.epoch,
            nr_members = v.members.len(),
            "node is up"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupted; leaving the cluster");
    if let Err(err) = engine.lock().leave_cluster() {
        error!(%err, "graceful leave failed");
    }
    dispatch(&hub, &engine);

    let fault = engine.lock().fault();
    if let Some(fault) = fault {
        error!(%fault, "node stopped on fault");
        if fault == shoal_server::Fault::PartitionSuspected {
            std::process::abort();
        }
        std::process::exit(1);
    }
    Ok(())
}
