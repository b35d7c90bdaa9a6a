use crate::constants::TRACKER_RECONNECT_DELAY;
use crate::protocol::Envelope;
use crate::shutdown;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

/// What the coordinator hears about its tracker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerLine {
    Up,
    Down,
    Inbound(Envelope),
}

pub fn spawn_tracker_client(
    url: String,
    line_tx: mpsc::Sender<TrackerLine>,
    out_rx: mpsc::Receiver<Envelope>,
    shutdown_rx: shutdown::Watcher,
) {
    tokio::spawn(async move {
        run_tracker_client(url, line_tx, out_rx, shutdown_rx).await;
    });
}

/// Connect, pump both directions, reconnect after a fixed delay forever.
/// Swarm and peer-transport state live with the coordinator and survive
/// every hop of this loop.
#[instrument(skip_all, fields(url = %url))]
async fn run_tracker_client(
    url: String,
    line_tx: mpsc::Sender<TrackerLine>,
    mut out_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: shutdown::Watcher,
) {
    loop {
        let ws = tokio::select! {
            _ = shutdown_rx.recv() => return,
            connected = connect_async(url.as_str()) => match connected {
                Ok((ws, _)) => ws,
                Err(e) => {
                    debug!("tracker unreachable: {:?}", e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = sleep(TRACKER_RECONNECT_DELAY) => continue,
                    }
                }
            },
        };

        if line_tx.send(TrackerLine::Up).await.is_err() {
            return;
        }

        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = sink.close().await;
                    return;
                }
                outbound = out_rx.recv() => {
                    let Some(envelope) = outbound else { return };
                    if sink.send(Message::Text(envelope.encode())).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(raw))) => match Envelope::decode(&raw) {
                            Ok(envelope) => {
                                if line_tx.send(TrackerLine::Inbound(envelope)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("dropping tracker envelope: {:?}", e),
                        },
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => (),
                    }
                }
            }
        }

        if line_tx.send(TrackerLine::Down).await.is_err() {
            return;
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = sleep(TRACKER_RECONNECT_DELAY) => (),
        }
    }
}
