mod config;
mod protocol;
mod server;

use std::time::Duration;

use anyhow::Error;
use clap::Parser;
use common::SystemCommandRunner;
use config::Config;
use garten::{spawn_grace_time_sweep, Gardener, LocalPathVolumeCreator};
use netzwerk::Networker;
use server::AppState;
use storage::{Connection, Storage};
use werft::{Containerizer, Depot};

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_logging();

    let config = Config::parse();

    if config.tag.len() > 2 {
        tracing::warn!(tag = %config.tag, "tag is longer than the recommended 2 characters (spec §6)");
    }

    tracing::info!(
        depot = %config.depot.display(),
        network_pool = %config.network_pool,
        allow_host_access = config.allow_host_access,
        deny_networks = config.deny_networks.len(),
        allow_networks = config.allow_networks.len(),
        tag = %config.tag,
        "starting with configuration"
    );
    let state = build_state(&config)?;
    let gardener = state.gardener();

    spawn_grace_time_sweep(gardener, Duration::from_secs(config.sweep_interval_secs));

    server::serve(&config, std::sync::Arc::new(state)).await
}

fn build_state(config: &Config) -> Result<AppState, Error> {
    std::fs::create_dir_all(&config.depot)?;
    // `graph` names the image/layer graph directory (spec §6); this
    // workspace's `VolumeCreator` treats rootfs refs as already-mounted
    // local paths (spec §1's "image/layer graph... out of scope"), so the
    // option is recognized and created but otherwise untouched here.
    std::fs::create_dir_all(&config.graph)?;
    let state_dir = config.depot.join("state");
    std::fs::create_dir_all(&state_dir)?;
    let io_dir = state_dir.join("io");
    std::fs::create_dir_all(&io_dir)?;

    let storage = Storage::<Connection>::new(&state_dir)?;

    let networker = Networker::new(
        config.hook_binary.clone(),
        config.network_pool,
        config.subnet_prefix,
        config.port_pool_start,
        config.port_pool_size,
        SystemCommandRunner,
        config.tag.clone(),
        config.external_ip,
        config.dns_server.clone(),
        config.mtu,
    );

    let containerizer = Containerizer::new(
        Depot::new(config.depot.clone()),
        SystemCommandRunner,
        config.runtime_binary.clone(),
        config.supervisor_binary.clone(),
        config.nstar_binary.clone(),
    );

    let gardener: Gardener<Connection, SystemCommandRunner, LocalPathVolumeCreator> =
        Gardener::new(storage, networker, containerizer, LocalPathVolumeCreator, config.max_containers);

    Ok(AppState::new(
        gardener,
        config.allow_networks.clone(),
        io_dir,
        config.default_rootfs.clone(),
        Duration::from_secs(config.default_grace_time),
    ))
}

fn setup_logging() {
    tracing_subscriber::fmt().init();
}
