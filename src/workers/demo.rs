//! Two-peer demo: both users on one in-process relay, the first sends a
//! file to the second.

use super::args::{Args, TransportKind};
use anyhow::{bail, Result};
use bytes::Bytes;
use peerlink::core::connection::memory::{MemoryNetwork, MemoryTransportFactory};
use peerlink::core::connection::webrtc::WebRtcTransportFactory;
use peerlink::core::connection::TransportFactory;
use peerlink::core::node::{AppEvent, NodeConfig, NodeHandle, PeerNode};
use peerlink::core::relay::hub::RelayHub;
use peerlink::core::relay::RelayChannel;
use peerlink::core::transfer::sender::{guess_mime_type, OutgoingFile};
use peerlink::utils::sos::SignalOfStop;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct DemoPeer {
    user_id: String,
    handle: NodeHandle,
    events: mpsc::UnboundedReceiver<AppEvent>,
    task: JoinHandle<()>,
}

fn spawn_peer(
    hub: &Arc<RelayHub>,
    factory: Arc<dyn TransportFactory>,
    config: NodeConfig,
    sos: &SignalOfStop,
) -> DemoPeer {
    let user_id = config.user_id.clone();
    let (client, relay_rx) = hub.connect(&user_id);
    let (handle, events, task) = PeerNode::spawn(
        config,
        client as Arc<dyn RelayChannel>,
        relay_rx,
        factory,
        sos.clone(),
    );
    DemoPeer {
        user_id,
        handle,
        events,
        task,
    }
}

fn transport_factory(args: &Args, network: &Arc<MemoryNetwork>) -> Arc<dyn TransportFactory> {
    match args.transport {
        TransportKind::Memory => MemoryTransportFactory::new(network) as Arc<dyn TransportFactory>,
        TransportKind::Webrtc => WebRtcTransportFactory::new(args.ice_config()) as Arc<dyn TransportFactory>,
    }
}

async fn load_file(args: &Args) -> Result<OutgoingFile> {
    if let Some(path) = &args.file {
        return Ok(OutgoingFile::from_path(path).await?);
    }
    let name = "peerlink-demo.bin";
    let data: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();
    Ok(OutgoingFile::from_bytes(name, guess_mime_type(name), Bytes::from(data)))
}

fn print_event(user: &str, ev: &AppEvent) {
    match ev {
        AppEvent::Notice(n) => println!("[{user}] {n}"),
        AppEvent::SendProgress { percent, .. } if percent % 25 == 0 => {
            println!("[{user}] sent {percent}%")
        }
        AppEvent::ReceiveProgress { percent, .. } if percent % 25 == 0 => {
            println!("[{user}] received {percent}%")
        }
        other => debug!(event = "app_event", user, ?other, "Node event"),
    }
}

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let file = load_file(&args).await?;
    let hub = RelayHub::new();
    let network = MemoryNetwork::new();

    let mut sender = spawn_peer(
        &hub,
        transport_factory(&args, &network),
        args.node_config(&args.from, args.display_name.clone())?,
        &sos,
    );
    let mut receiver = spawn_peer(
        &hub,
        transport_factory(&args, &network),
        args.node_config(&args.to, None)?,
        &sos,
    );
    info!(
        event = "demo_started",
        from = %sender.user_id,
        to = %receiver.user_id,
        transport = %args.transport,
        file = %file.name,
        size = file.size(),
        "Demo peers up"
    );

    sender.handle.connect(&receiver.user_id).await?;
    let outcome = sos
        .select(drive(&args, &mut sender, &mut receiver, file))
        .await;

    sender.handle.shutdown();
    receiver.handle.shutdown();
    let _ = tokio::join!(sender.task, receiver.task);

    match outcome {
        Some(result) => result,
        None => {
            info!(event = "demo_interrupted", "Interrupted");
            Ok(())
        }
    }
}

/// Answer the request on the receiving side and send the file once the
/// channel opens. Returns when the file arrives or the attempt ends.
async fn drive(
    args: &Args,
    sender: &mut DemoPeer,
    receiver: &mut DemoPeer,
    file: OutgoingFile,
) -> Result<()> {
    let mut file = Some(file);
    loop {
        tokio::select! {
            Some(ev) = receiver.events.recv() => {
                print_event(&receiver.user_id, &ev);
                match ev {
                    AppEvent::ConnectionRequested { peer_id, .. } if args.reject => {
                        receiver.handle.reject(&peer_id).await?;
                    }
                    AppEvent::ConnectionRequested { peer_id, .. } => {
                        receiver.handle.accept(&peer_id).await?;
                    }
                    AppEvent::FileReceived { file, .. } => {
                        println!(
                            "[{}] got {} ({} bytes, {}) at {}",
                            receiver.user_id,
                            file.name,
                            file.size(),
                            file.mime_type,
                            file.object_url
                        );
                        return Ok(());
                    }
                    AppEvent::ReceiveFailed { error, .. } => bail!("receive failed: {error}"),
                    AppEvent::Disconnected { reason, .. } => bail!("receiver disconnected: {reason}"),
                    _ => {}
                }
            }
            Some(ev) = sender.events.recv() => {
                print_event(&sender.user_id, &ev);
                match ev {
                    AppEvent::ChannelOpen { peer_id } => {
                        if let Some(f) = file.take() {
                            sender.handle.send_file(&peer_id, f).await?;
                        }
                    }
                    AppEvent::RequestRejected { .. } => return Ok(()),
                    AppEvent::RequestExpired { .. } => bail!("request expired"),
                    AppEvent::SendFailed { error, .. } => bail!("send failed: {error}"),
                    AppEvent::Disconnected { reason, .. } => bail!("sender disconnected: {reason}"),
                    _ => {}
                }
            }
            else => bail!("both nodes stopped"),
        }
    }
}
