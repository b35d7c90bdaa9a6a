use super::rooms::Rooms;
use crate::constants::{TRACKER_STALE_AFTER, TRACKER_SWEEP_PERIOD};
use crate::protocol::Envelope;
use crate::shutdown;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

type SharedRooms = Arc<Mutex<Rooms>>;
/// Outbound envelope queue per connected participant.
type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

/// Accept participants on `listen`, serve the read-only observer endpoint
/// on `observer`, sweep stale memberships in the background. Runs until
/// shutdown fires.
pub async fn serve(listen: &str, observer: &str, shutdown_rx: shutdown::Watcher) -> Result<()> {
    let rooms: SharedRooms = Arc::new(Mutex::new(Rooms::new()));
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

    let listener = TcpListener::bind(listen).await?;
    info!("tracker listening on {}", listen);

    tokio::spawn(observe(
        observer.to_string(),
        rooms.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(sweeper(rooms.clone(), registry.clone(), shutdown_rx.clone()));

    let mut shutdown_rx = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            accepted = listener.accept() => {
                let Ok((stream, addr)) = accepted else { continue };
                debug!("connection from {}", addr);
                tokio::spawn(handle_connection(
                    stream,
                    rooms.clone(),
                    registry.clone(),
                    shutdown_rx.clone(),
                ));
            }
        }
    }
}

fn fresh_peer_id() -> String {
    format!("peer-{:08x}", rand::random::<u32>())
}

#[instrument(skip_all, fields(peer))]
async fn handle_connection(
    stream: TcpStream,
    rooms: SharedRooms,
    registry: Registry,
    mut shutdown_rx: shutdown::Watcher,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed: {:?}", e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let peer_id = fresh_peer_id();
    tracing::Span::current().record("peer", peer_id.as_str());

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.lock().await.insert(peer_id.clone(), tx.clone());

    let _ = tx.send(Envelope::Welcome {
        peer_id: peer_id.clone(),
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            outbound = rx.recv() => {
                let Some(envelope) = outbound else { break };
                if sink.send(Message::Text(envelope.encode())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        handle_raw(&peer_id, &raw, &rooms, &registry).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => (), // pings and binary noise
                }
            }
        }
    }

    registry.lock().await.remove(&peer_id);
    disconnect(&peer_id, &rooms, &registry).await;
    debug!("connection closed");
}

async fn handle_raw(peer_id: &str, raw: &str, rooms: &SharedRooms, registry: &Registry) {
    match Envelope::decode(raw) {
        Ok(envelope) => handle_envelope(peer_id, envelope, rooms, registry).await,
        Err(e) => warn!("dropping envelope from {}: {:?}", peer_id, e),
    }
}

async fn handle_envelope(
    peer_id: &str,
    envelope: Envelope,
    rooms: &SharedRooms,
    registry: &Registry,
) {
    match envelope {
        Envelope::Announce { content, complete } => {
            let outcome =
                rooms
                    .lock()
                    .await
                    .announce(&content, peer_id, complete, Instant::now());
            if outcome.refreshed {
                debug!("{} refreshed {}", peer_id, content);
            }

            send_to(
                registry,
                peer_id,
                Envelope::AnnounceResponse {
                    content: content.clone(),
                    peers: outcome.others,
                },
            )
            .await;

            for member in &outcome.notify {
                send_to(
                    registry,
                    member,
                    Envelope::PeerJoinedSwarm {
                        content: content.clone(),
                        peer_id: peer_id.to_string(),
                        complete,
                        peers: outcome.everyone.clone(),
                    },
                )
                .await;
            }
        }
        Envelope::Leave { content } => {
            let remaining = rooms.lock().await.leave(&content, peer_id);

            for member in remaining.unwrap_or_default() {
                send_to(
                    registry,
                    &member,
                    Envelope::PeerLeftSwarm {
                        content: content.clone(),
                        peer_id: peer_id.to_string(),
                    },
                )
                .await;
            }
        }
        Envelope::RequestConnection { .. } => {
            let members: Vec<String> = registry
                .lock()
                .await
                .keys()
                .filter(|id| id.as_str() != peer_id)
                .cloned()
                .collect();

            for member in members {
                send_to(
                    registry,
                    &member,
                    Envelope::RequestConnection {
                        from: peer_id.to_string(),
                    },
                )
                .await;
            }
        }
        // session descriptions and candidates are opaque; route on `to`
        Envelope::Offer { ref to, .. }
        | Envelope::Answer { ref to, .. }
        | Envelope::IceCandidate { ref to, .. } => {
            let target = to.clone();
            if !send_to(registry, &target, envelope).await {
                debug!("dropping relay to unknown peer {}", target);
            }
        }
        unexpected => {
            warn!("unexpected envelope from {}: {:?}", peer_id, unexpected);
        }
    }
}

/// Socket is gone; clear every membership and tell the rooms about it.
async fn disconnect(peer_id: &str, rooms: &SharedRooms, registry: &Registry) {
    let dropped = rooms.lock().await.drop_peer(peer_id);

    for (content, remaining) in dropped {
        for member in remaining {
            send_to(
                registry,
                &member,
                Envelope::PeerLeftSwarm {
                    content: content.clone(),
                    peer_id: peer_id.to_string(),
                },
            )
            .await;
        }
    }
}

async fn send_to(registry: &Registry, peer_id: &str, envelope: Envelope) -> bool {
    let registry = registry.lock().await;
    match registry.get(peer_id) {
        Some(tx) => tx.send(envelope).is_ok(),
        None => false,
    }
}

async fn sweeper(rooms: SharedRooms, registry: Registry, mut shutdown_rx: shutdown::Watcher) {
    let mut interval = interval(TRACKER_SWEEP_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = interval.tick() => (),
        }

        let swept = rooms
            .lock()
            .await
            .sweep(TRACKER_STALE_AFTER, Instant::now());

        for (content, stale_peer, remaining) in swept {
            debug!("swept {} out of {}", stale_peer, content);
            for member in remaining {
                send_to(
                    &registry,
                    &member,
                    Envelope::PeerLeftSwarm {
                        content: content.clone(),
                        peer_id: stale_peer.clone(),
                    },
                )
                .await;
            }
        }
    }
}

#[derive(Deserialize)]
struct PeersQuery {
    #[serde(rename = "infoHash")]
    info_hash: String,
}

/// `GET /peers?infoHash=<content>` for debugging and out-of-band observers.
async fn observe(listen: String, rooms: SharedRooms, mut shutdown_rx: shutdown::Watcher) {
    let app = Router::new()
        .route("/peers", get(peers_endpoint))
        .with_state(rooms);

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("observer endpoint unavailable on {}: {:?}", listen, e);
            return;
        }
    };
    info!("observer listening on {}", listen);

    tokio::select! {
        _ = shutdown_rx.recv() => (),
        result = async { axum::serve(listener, app).await } => {
            if let Err(e) = result {
                warn!("observer endpoint failed: {:?}", e);
            }
        }
    }
}

async fn peers_endpoint(
    State(rooms): State<SharedRooms>,
    Query(query): Query<PeersQuery>,
) -> Json<Value> {
    let members: Vec<Value> = rooms
        .lock()
        .await
        .snapshot(&query.info_hash)
        .into_iter()
        .map(|member| {
            json!({
                "peerId": member.peer_id,
                "lastSeen": member.last_seen_ms,
                "complete": member.complete,
            })
        })
        .collect();

    Json(json!({ "infoHash": query.info_hash, "peers": members }))
}
