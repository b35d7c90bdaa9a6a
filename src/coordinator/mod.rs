mod events;
mod tracker_client;

pub use events::EngineEvent;

use crate::chunker::{self, Piece, Placement};
use crate::data_structures::Bitmap;
use crate::protocol::{Envelope, Frame};
use crate::shutdown;
use crate::swarm::{Action, SwarmManager};
use crate::transport::{LinkEvent, LinkFactory, Transport, TransportEvent};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use tracker_client::{spawn_tracker_client, TrackerLine};

const COMMAND_BUFFER: usize = 1 << 3;
const CHANNEL_BUFFER: usize = 1 << 6;
const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Command {
    Share {
        data: Bytes,
        placement: Placement,
        producer: String,
        prompt: Option<String>,
    },
    Shutdown,
}

/// The producer-side doorway into the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn share_model(
        &self,
        data: Bytes,
        placement: Placement,
        producer: String,
        prompt: Option<String>,
    ) -> Result<()> {
        self.commands
            .send(Command::Share {
                data,
                placement,
                producer,
                prompt,
            })
            .await
            .context("engine is gone")
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Start a participant: tracker client plus the single event loop that owns
/// every swarm, peer record and transport link. Returns the command handle
/// and the scene-facing event stream.
pub fn spawn(
    tracker_url: &str,
    factory: Box<dyn LinkFactory>,
) -> (EngineHandle, mpsc::Receiver<EngineEvent>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (line_tx, line_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (tracker_tx, tracker_out_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (events_tx, events_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (shutdown_trigger, shutdown_watcher) = shutdown::channel();

    spawn_tracker_client(
        tracker_url.to_string(),
        line_tx,
        tracker_out_rx,
        shutdown_watcher,
    );

    let (coordinator, link_events_rx) = Coordinator::new(factory, tracker_tx, events_tx);

    tokio::spawn(async move {
        coordinator
            .run(command_rx, line_rx, link_events_rx, shutdown_trigger)
            .await;
    });

    (
        EngineHandle {
            commands: command_tx,
        },
        events_rx,
    )
}

/// Binds tracker, transport, chunker and swarm policy together. All state
/// lives on this one task; the subsystems talk to it through channels and
/// returned action/event values, never back-pointers.
struct Coordinator {
    own_id: Option<String>,
    swarms: SwarmManager,
    transport: Transport,
    /// content → peer → bitfield; ordered so selection scans peers
    /// deterministically.
    remote_bits: HashMap<String, BTreeMap<String, Bitmap>>,
    /// content → peers already sent metadata + bitfield.
    informed: HashMap<String, HashSet<String>>,
    tracker_tx: mpsc::Sender<Envelope>,
    events_tx: mpsc::Sender<EngineEvent>,
}

impl Coordinator {
    fn new(
        factory: Box<dyn LinkFactory>,
        tracker_tx: mpsc::Sender<Envelope>,
        events_tx: mpsc::Sender<EngineEvent>,
    ) -> (Self, mpsc::Receiver<(String, LinkEvent)>) {
        let (transport, link_events_rx) = Transport::new(factory);

        (
            Self {
                own_id: None,
                swarms: SwarmManager::new(),
                transport,
                remote_bits: HashMap::new(),
                informed: HashMap::new(),
                tracker_tx,
                events_tx,
            },
            link_events_rx,
        )
    }

    #[instrument(skip_all)]
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut line_rx: mpsc::Receiver<TrackerLine>,
        mut link_events_rx: mpsc::Receiver<(String, LinkEvent)>,
        shutdown_trigger: shutdown::Trigger,
    ) {
        let mut tick = interval(TICK_PERIOD);
        tick.tick().await;

        loop {
            select! {
                line = line_rx.recv() => match line {
                    Some(line) => self.handle_tracker_line(line).await,
                    None => break,
                },
                link_event = link_events_rx.recv() => match link_event {
                    Some((peer, event)) => self.handle_link_event(&peer, event).await,
                    None => break,
                },
                command = command_rx.recv() => match command {
                    Some(Command::Share { data, placement, producer, prompt }) => {
                        self.share(data, placement, producer, prompt).await;
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = tick.tick() => self.handle_tick().await,
            }
        }

        self.transport.close_all().await;
        self.swarms.clear();
        shutdown_trigger.fire().await;
    }

    async fn handle_tracker_line(&mut self, line: TrackerLine) {
        match line {
            // membership re-sync happens on the welcome that follows
            TrackerLine::Up => debug!("tracker connected"),
            TrackerLine::Down => debug!("tracker lost, peer links stay up"),
            TrackerLine::Inbound(envelope) => self.handle_envelope(envelope).await,
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Welcome { peer_id } => {
                info!("tracker assigned id {}", peer_id);
                self.transport.set_local_id(&peer_id);
                self.own_id = Some(peer_id.clone());

                // ask everyone already in the mesh to initiate toward us,
                // then (re-)announce whatever we hold
                self.send_tracker(Envelope::RequestConnection { from: peer_id })
                    .await;
                self.announce_all().await;
            }
            Envelope::AnnounceResponse { content, peers } => {
                debug!("{} has {} other members", content, peers.len());
            }
            Envelope::PeerJoinedSwarm { peer_id, content, .. } => {
                debug!("{} joined {}", peer_id, content);
                if self.own_id.as_deref() != Some(peer_id.as_str()) {
                    self.initiate(&peer_id).await;
                }
            }
            Envelope::PeerLeftSwarm { content, peer_id } => {
                debug!("{} left {}", peer_id, content);
                if let Some(bits) = self.remote_bits.get_mut(&content) {
                    bits.remove(&peer_id);
                }
            }
            Envelope::RequestConnection { from } => {
                if !from.is_empty() && self.own_id.as_deref() != Some(from.as_str()) {
                    self.initiate(&from).await;
                }
            }
            Envelope::Offer { from, payload, .. } => {
                let transport_events = self
                    .transport
                    .handle_offer(&from, &payload, Instant::now())
                    .await;
                self.dispatch_transport(transport_events).await;
            }
            Envelope::Answer { from, payload, .. } => {
                self.transport.handle_answer(&from, &payload).await;
            }
            Envelope::IceCandidate { from, payload, .. } => {
                self.transport.handle_candidate(&from, &payload).await;
            }
            unexpected => debug!("ignoring envelope {:?}", unexpected),
        }
    }

    async fn initiate(&mut self, peer: &str) {
        let transport_events = self.transport.open_to(peer, Instant::now()).await;
        self.dispatch_transport(transport_events).await;
    }

    async fn handle_link_event(&mut self, peer: &str, event: LinkEvent) {
        let transport_events = self
            .transport
            .handle_link_event(peer, event, Instant::now())
            .await;
        self.dispatch_transport(transport_events).await;
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();

        let transport_events = self.transport.tick(now).await;
        self.dispatch_transport(transport_events).await;

        // reap aged-out requests and put the freed pieces back in play
        for content in self.swarms.leeching_contents() {
            self.swarms.release_timed_out(&content, now);

            let empty = BTreeMap::new();
            let bits = self.remote_bits.get(&content).unwrap_or(&empty);
            let actions = self.swarms.request_more(&content, bits, now);
            self.dispatch_actions(actions).await;
        }
    }

    async fn dispatch_transport(&mut self, transport_events: Vec<TransportEvent>) {
        for event in transport_events {
            match event {
                TransportEvent::Signal(envelope) => self.send_tracker(envelope).await,
                TransportEvent::PeerConnected(peer) => {
                    self.emit(EngineEvent::PeerConnected { peer_id: peer });
                }
                TransportEvent::ChannelOpen(peer) => self.handle_channel_open(&peer).await,
                TransportEvent::Frame(peer, bytes) => self.handle_frame(&peer, &bytes).await,
                TransportEvent::PeerDisconnected(peer) => self.handle_peer_disconnected(&peer),
            }
        }
    }

    /// Push metadata + bitfield for everything we hold pieces of, each
    /// content at most once per peer.
    async fn handle_channel_open(&mut self, peer: &str) {
        for content in self.swarms.sharable() {
            self.offer_content(peer, &content).await;
        }
    }

    async fn offer_content(&mut self, peer: &str, content: &str) {
        let informed = self
            .informed
            .get(content)
            .map(|peers| peers.contains(peer))
            .unwrap_or(false);
        if informed {
            return;
        }

        let Some(swarm) = self.swarms.get(content) else {
            return;
        };
        let metadata = Frame::Metadata {
            package: swarm.package.clone(),
        };
        let bitfield = Frame::Bitfield {
            content: content.to_string(),
            bits: Bytes::copy_from_slice(swarm.owned.as_bytes()),
        };

        // metadata first, bitfield second, always on the same channel
        if let Err(e) = self.transport.send(peer, metadata.encode()).await {
            warn!("metadata to {} failed: {:?}", peer, e);
            return;
        }
        if let Err(e) = self.transport.send(peer, bitfield.encode()).await {
            warn!("bitfield to {} failed: {:?}", peer, e);
            return;
        }

        self.informed
            .entry(content.to_string())
            .or_default()
            .insert(peer.to_string());
    }

    fn handle_peer_disconnected(&mut self, peer: &str) {
        for bits in self.remote_bits.values_mut() {
            bits.remove(peer);
        }
        for informed in self.informed.values_mut() {
            informed.remove(peer);
        }
        self.swarms.release_peer(peer);

        self.emit(EngineEvent::PeerDisconnected {
            peer_id: peer.to_string(),
        });
    }

    async fn handle_frame(&mut self, peer: &str, raw: &[u8]) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame from {}: {:?}", peer, e);
                return;
            }
        };

        match frame {
            Frame::Metadata { package } => self.handle_metadata(package).await,
            Frame::Bitfield { content, bits } => self.handle_bitfield(peer, &content, &bits).await,
            Frame::Have { content, index } => self.handle_have(peer, &content, index).await,
            Frame::Request { content, index } => {
                let actions = self.swarms.handle_request(peer, &content, index);
                self.dispatch_actions(actions).await;
            }
            piece_frame @ Frame::Piece { .. } => self.handle_piece_frame(peer, piece_frame).await,
        }
    }

    async fn handle_metadata(&mut self, package: chunker::Package) {
        let content = package.content_id.clone();

        if !self.swarms.create_leecher(package, Instant::now()) {
            debug!("metadata for already-known {}", content);
            return;
        }

        info!("leeching {}", content);
        self.send_tracker(Envelope::Announce {
            content,
            complete: false,
        })
        .await;
    }

    async fn handle_bitfield(&mut self, peer: &str, content: &str, bits: &[u8]) {
        let Some(swarm) = self.swarms.get(content) else {
            warn!("bitfield for unknown content {} from {}", content, peer);
            return;
        };

        let bitfield = Bitmap::from_bytes(swarm.total, bits);
        self.remote_bits
            .entry(content.to_string())
            .or_default()
            .insert(peer.to_string(), bitfield.clone());

        if self.swarms.is_leeching(content) {
            let actions = self
                .swarms
                .request_from_peer(peer, content, &bitfield, Instant::now());
            self.dispatch_actions(actions).await;
        }
    }

    async fn handle_have(&mut self, peer: &str, content: &str, index: usize) {
        let Some(swarm) = self.swarms.get(content) else {
            debug!("have for unknown content {} from {}", content, peer);
            return;
        };
        let total = swarm.total;

        let bitfield = self
            .remote_bits
            .entry(content.to_string())
            .or_default()
            .entry(peer.to_string())
            .or_insert_with(|| Bitmap::new(total));
        bitfield.change(index, true);
        let bitfield = bitfield.clone();

        if self.swarms.is_leeching(content) {
            let actions = self
                .swarms
                .request_from_peer(peer, content, &bitfield, Instant::now());
            self.dispatch_actions(actions).await;
        }
    }

    async fn handle_piece_frame(&mut self, peer: &str, frame: Frame) {
        let piece: Option<Piece> = frame.into();
        let Some(piece) = piece else { return };

        let content = piece.content_id.clone();
        let now = Instant::now();

        self.swarms.release_timed_out(&content, now);

        let empty = BTreeMap::new();
        let bits = self.remote_bits.get(&content).unwrap_or(&empty);
        let actions = self.swarms.handle_piece(peer, piece, bits, now);
        self.dispatch_actions(actions).await;
    }

    async fn dispatch_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::RequestChunk {
                    peer,
                    content,
                    index,
                } => {
                    let frame = Frame::Request { content, index };
                    if let Err(e) = self.transport.send(&peer, frame.encode()).await {
                        warn!("request to {} failed: {:?}", peer, e);
                    }
                }
                Action::SendPiece { peer, piece } => {
                    if let Err(e) = self.transport.send(&peer, Frame::piece(piece).encode()).await
                    {
                        warn!("piece to {} failed: {:?}", peer, e);
                    }
                }
                Action::BroadcastHave { content, index } => {
                    let frame = Frame::Have { content, index }.encode();
                    for peer in self.transport.open_peers() {
                        if let Err(e) = self.transport.send(&peer, frame.clone()).await {
                            debug!("have to {} failed: {:?}", peer, e);
                        }
                    }
                }
                Action::Progress { content, percent } => {
                    self.emit(EngineEvent::DownloadProgress { content, percent });
                }
                Action::Complete { content } => self.complete(&content).await,
            }
        }
    }

    /// Every piece is in; rebuild the blob, hand it to the scene and flip
    /// our room record to complete.
    async fn complete(&mut self, content: &str) {
        let pieces = self.swarms.stored_pieces(content);
        let Some(swarm) = self.swarms.get(content) else {
            return;
        };
        let package = swarm.package.clone();

        match chunker::assemble(pieces) {
            Ok(data) => {
                info!("completed {} ({} bytes)", content, data.len());
                self.emit(EngineEvent::ModelReceived { package, data });
                self.send_tracker(Envelope::Announce {
                    content: content.to_string(),
                    complete: true,
                })
                .await;
            }
            Err(e) => error!("reassembly of {} failed: {:?}", content, e),
        }
    }

    async fn share(
        &mut self,
        data: Bytes,
        placement: Placement,
        producer: String,
        prompt: Option<String>,
    ) {
        let (package, pieces) = match chunker::prepare(data, placement, &producer, prompt) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("share rejected: {:?}", e);
                return;
            }
        };
        let content = package.content_id.clone();
        info!("seeding {} ({} pieces)", content, pieces.len());

        self.swarms.create_seeder(package, pieces);
        self.send_tracker(Envelope::Announce {
            content: content.clone(),
            complete: true,
        })
        .await;

        for peer in self.transport.open_peers() {
            self.offer_content(&peer, &content).await;
        }
    }

    async fn announce_all(&mut self) {
        for (content, complete) in self.swarms.announceable() {
            self.send_tracker(Envelope::Announce { content, complete })
                .await;
        }
    }

    async fn send_tracker(&self, envelope: Envelope) {
        if self.tracker_tx.send(envelope).await.is_err() {
            debug!("tracker channel closed");
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("scene event dropped: {}", e);
        }
    }
}
