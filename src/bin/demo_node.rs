use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use peervault_sync::config::{DemoArgs, PeerManagerConfig};
use peervault_sync::demo_support::{DemoTransport, FileStorageAdapter, InMemoryBlobStore, InMemoryDocumentStore};
use peervault_sync::events::HostEvent;
use peervault_sync::PeerManager;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("PEERVAULT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("peervault_sync=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = DemoArgs::parse();
    std::fs::create_dir_all(&args.data_dir)?;

    let node_id = format!("{:016x}", rand::random::<u64>());
    tracing::info!(%node_id, vault_id = %args.vault_id, "starting demo node");

    let transport = DemoTransport::bind(node_id.clone(), args.listen_addr).await?;
    let document: Arc<dyn peervault_sync::traits::DocumentStore> =
        Arc::new(InMemoryDocumentStore::new(args.vault_id.clone()));
    let blobs: Arc<dyn peervault_sync::traits::BlobStore> = Arc::new(InMemoryBlobStore::new());
    let storage: Arc<dyn peervault_sync::traits::StorageAdapter> =
        Arc::new(FileStorageAdapter::new(args.data_dir.clone()));

    let mut config = PeerManagerConfig::default().with_allow_vault_adoption(args.allow_vault_adoption);
    if let Some(hostname) = args.hostname.clone() {
        config = config.with_hostname(hostname);
    }

    let (manager, mut vault_adoption_rx) =
        PeerManager::new(transport.clone(), document, Some(blobs), storage, config);
    let manager = Arc::new(manager);

    manager.initialize().await?;
    manager.spawn_background_tasks().await;

    let ticket = transport.generate_ticket().await?;
    tracing::info!(%ticket, "listening; share this ticket with a peer");

    let mut host_events = manager.subscribe_host_events();
    tokio::spawn(async move {
        while let Ok(event) = host_events.recv().await {
            log_host_event(&event);
        }
    });

    // Demo policy: auto-approve vault adoption prompts when the CLI flag
    // was passed, deny otherwise. A real host would surface this to a user.
    tokio::spawn(async move {
        while let Some(request) = vault_adoption_rx.recv().await {
            tracing::info!(
                node_id = %request.node_id,
                peer_vault_id = %request.peer_vault_id,
                our_vault_id = %request.our_vault_id,
                "vault adoption requested"
            );
            let _ = request.respond.send(false);
        }
    });

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.run_inbound_loop().await;
        });
    }

    if let Some(ticket) = args.connect_ticket.clone() {
        tracing::info!(%ticket, "connecting to peer");
        if let Err(e) = manager.add_peer(ticket).await {
            tracing::warn!(error = %e, "failed to add peer");
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    manager.shutdown().await?;
    Ok(())
}

fn log_host_event(event: &HostEvent) {
    match event {
        HostEvent::PeerConnected { node_id } => tracing::info!(%node_id, "peer connected"),
        HostEvent::PeerDisconnected { node_id, reason } => {
            tracing::info!(%node_id, ?reason, "peer disconnected")
        }
        HostEvent::PeerSynced { node_id } => tracing::info!(%node_id, "peer synced"),
        HostEvent::PeerError { node_id, error } => tracing::warn!(%node_id, %error, "peer error"),
        HostEvent::PeerPairingRequest { node_id } => {
            tracing::info!(%node_id, "pairing request")
        }
        HostEvent::PeerPairingAccepted { node_id } => {
            tracing::info!(%node_id, "pairing accepted")
        }
        HostEvent::PeerPairingDenied { node_id } => tracing::info!(%node_id, "pairing denied"),
        HostEvent::PeerDiscovered(info) => tracing::info!(node_id = %info.node_id, "peer discovered"),
        HostEvent::PeerHealthChange { node_id, quality, previous_quality } => {
            tracing::info!(%node_id, ?quality, ?previous_quality, "peer health changed")
        }
        HostEvent::VaultAdoptionRequest { node_id, peer_vault_id, our_vault_id } => {
            tracing::info!(%node_id, %peer_vault_id, %our_vault_id, "vault adoption requested")
        }
        HostEvent::StatusChange(status) => tracing::info!(?status, "status changed"),
        HostEvent::BlobReceived { hash } => tracing::info!(%hash, "blob received"),
        HostEvent::LiveUpdates => tracing::debug!("live updates flushed"),
        HostEvent::PeerStateChange { node_id, state } => {
            tracing::debug!(%node_id, ?state, "peer state changed")
        }
    }
}
