use super::link::{LinkEvent, LinkFactory, SessionLink};
use crate::constants::{DISCONNECT_GRACE, ICE_RESTART_GRACE, PEER_CAP};
use crate::protocol::Envelope;
use anyhow::{bail, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const LINK_EVENT_BUFFER: usize = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq)]
enum LinkState {
    /// Offer sent, waiting for the answer.
    Offering,
    /// Descriptions exchanged, candidates converging.
    Connecting,
    Open,
    /// Transient loss; masked from the coordinator until the grace runs out.
    Disconnected { since: Instant },
    /// Failed and (for the initiator) re-offered; one attempt only.
    Restarting { since: Instant },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    ChannelOpen(String),
    Frame(String, Bytes),
    /// An envelope to relay through the tracker on our behalf.
    Signal(Envelope),
}

struct PeerLink {
    link: Box<dyn SessionLink>,
    state: LinkState,
    initiator: bool,
    channel_open: bool,
    /// Whether `PeerConnected` went upward, so eviction knows to mirror it.
    announced: bool,
    restarted: bool,
    last_activity: Instant,
}

/// One link per neighbor. Owns lifecycle only; all inbound/outbound frames
/// and signaling intents surface as events for the coordinator to route.
pub struct Transport {
    local_id: String,
    factory: Box<dyn LinkFactory>,
    peers: HashMap<String, PeerLink>,
    events_tx: mpsc::Sender<(String, LinkEvent)>,
}

impl Transport {
    pub fn new(factory: Box<dyn LinkFactory>) -> (Self, mpsc::Receiver<(String, LinkEvent)>) {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_BUFFER);

        (
            Self {
                local_id: String::new(),
                factory,
                peers: HashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// The tracker hands out our identity at connection time.
    pub fn set_local_id(&mut self, id: &str) {
        self.local_id = id.to_string();
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn is_open(&self, peer: &str) -> bool {
        self.peers
            .get(peer)
            .map(|link| link.channel_open)
            .unwrap_or(false)
    }

    /// Peers with an open frame channel, in stable order.
    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, link)| link.channel_open)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn last_activity(&self, peer: &str) -> Option<Instant> {
        self.peers.get(peer).map(|link| link.last_activity)
    }

    /// Initiate toward a peer. No-op when a link already exists; refused
    /// without side effects at the neighbor cap.
    pub async fn open_to(&mut self, peer: &str, now: Instant) -> Vec<TransportEvent> {
        if self.peers.contains_key(peer) {
            return Vec::new();
        }
        if !self.admit(peer) {
            return Vec::new();
        }

        let mut link = self.factory.open(peer, self.events_tx.clone());
        let offer = match link.create_offer(false).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("offer toward {} failed: {:?}", peer, e);
                return Vec::new();
            }
        };

        self.peers.insert(
            peer.to_string(),
            PeerLink {
                link,
                state: LinkState::Offering,
                initiator: true,
                channel_open: false,
                announced: false,
                restarted: false,
                last_activity: now,
            },
        );

        vec![TransportEvent::Signal(Envelope::Offer {
            from: self.local_id.clone(),
            to: peer.to_string(),
            payload: offer,
        })]
    }

    /// An offer relayed from a peer; either a fresh introduction (we
    /// respond) or an ICE restart on an existing link.
    pub async fn handle_offer(&mut self, from: &str, payload: &str, now: Instant) -> Vec<TransportEvent> {
        if self.peers.contains_key(from) {
            debug!("restart offer from {}", from);
        } else {
            if !self.admit(from) {
                return Vec::new();
            }

            let link = self.factory.open(from, self.events_tx.clone());
            self.peers.insert(
                from.to_string(),
                PeerLink {
                    link,
                    state: LinkState::Connecting,
                    initiator: false,
                    channel_open: false,
                    announced: false,
                    restarted: false,
                    last_activity: now,
                },
            );
        }

        let Some(peer_link) = self.peers.get_mut(from) else {
            return Vec::new();
        };
        peer_link.state = LinkState::Connecting;

        match peer_link.link.accept_offer(payload).await {
            Ok(answer) => vec![TransportEvent::Signal(Envelope::Answer {
                from: self.local_id.clone(),
                to: from.to_string(),
                payload: answer,
            })],
            Err(e) => {
                warn!("accepting offer from {} failed: {:?}", from, e);
                Vec::new()
            }
        }
    }

    pub async fn handle_answer(&mut self, from: &str, payload: &str) {
        let Some(peer_link) = self.peers.get_mut(from) else {
            warn!("answer from unknown peer {}", from);
            return;
        };
        if !peer_link.initiator {
            warn!("answer from {} but we never offered", from);
            return;
        }

        match peer_link.link.accept_answer(payload).await {
            Ok(()) => peer_link.state = LinkState::Connecting,
            Err(e) => warn!("accepting answer from {} failed: {:?}", from, e),
        }
    }

    pub async fn handle_candidate(&mut self, from: &str, payload: &str) {
        let Some(peer_link) = self.peers.get_mut(from) else {
            debug!("candidate from unknown peer {}", from);
            return;
        };

        if let Err(e) = peer_link.link.add_remote_candidate(payload).await {
            warn!("candidate from {} rejected: {:?}", from, e);
        }
    }

    /// Drive the state machine with one event reported by a link.
    pub async fn handle_link_event(
        &mut self,
        peer: &str,
        event: LinkEvent,
        now: Instant,
    ) -> Vec<TransportEvent> {
        let Some(peer_link) = self.peers.get_mut(peer) else {
            debug!("event {:?} for evicted peer {}", event, peer);
            return Vec::new();
        };

        match event {
            LinkEvent::Candidate(candidate) => {
                vec![TransportEvent::Signal(Envelope::IceCandidate {
                    from: self.local_id.clone(),
                    to: peer.to_string(),
                    payload: candidate,
                })]
            }
            LinkEvent::Connected => {
                peer_link.state = LinkState::Open;
                peer_link.restarted = false;

                if peer_link.announced {
                    // reconnect inside a grace window, invisible upward
                    Vec::new()
                } else {
                    peer_link.announced = true;
                    vec![TransportEvent::PeerConnected(peer.to_string())]
                }
            }
            LinkEvent::ChannelOpen => {
                peer_link.channel_open = true;
                vec![TransportEvent::ChannelOpen(peer.to_string())]
            }
            LinkEvent::Frame(bytes) => {
                peer_link.last_activity = now;
                vec![TransportEvent::Frame(peer.to_string(), bytes)]
            }
            LinkEvent::Disconnected => {
                if !matches!(peer_link.state, LinkState::Disconnected { .. }) {
                    peer_link.state = LinkState::Disconnected { since: now };
                }
                Vec::new()
            }
            LinkEvent::Failed => {
                if peer_link.initiator && !peer_link.restarted {
                    peer_link.restarted = true;
                    peer_link.state = LinkState::Restarting { since: now };

                    match peer_link.link.create_offer(true).await {
                        Ok(offer) => {
                            return vec![TransportEvent::Signal(Envelope::Offer {
                                from: self.local_id.clone(),
                                to: peer.to_string(),
                                payload: offer,
                            })]
                        }
                        Err(e) => {
                            warn!("restart offer toward {} failed: {:?}", peer, e);
                            return self.evict(peer).await;
                        }
                    }
                }

                if peer_link.restarted {
                    // the one restart already burned
                    self.evict(peer).await
                } else {
                    // responder: give the initiator's restart a window to land
                    peer_link.state = LinkState::Restarting { since: now };
                    Vec::new()
                }
            }
            LinkEvent::Closed => self.evict(peer).await,
        }
    }

    /// Expire disconnect and restart graces. Driven from the coordinator's
    /// periodic tick so deadlines stay testable.
    pub async fn tick(&mut self, now: Instant) -> Vec<TransportEvent> {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, link)| match link.state {
                LinkState::Disconnected { since } => now.duration_since(since) >= DISCONNECT_GRACE,
                LinkState::Restarting { since } => now.duration_since(since) >= ICE_RESTART_GRACE,
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for peer in expired {
            events.extend(self.evict(&peer).await);
        }
        events
    }

    /// Callers never send into a non-open channel; this enforces it.
    pub async fn send(&mut self, peer: &str, frame: Bytes) -> Result<()> {
        let Some(peer_link) = self.peers.get_mut(peer) else {
            bail!("peer {} is not connected", peer);
        };
        if !peer_link.channel_open {
            bail!("channel to {} is not open", peer);
        }

        peer_link.link.send(frame).await
    }

    pub async fn close_all(&mut self) {
        for (_, mut peer_link) in self.peers.drain() {
            peer_link.link.close().await;
        }
    }

    fn admit(&self, peer: &str) -> bool {
        if self.peers.len() >= PEER_CAP {
            warn!("refusing {}: neighbor cap {} reached", peer, PEER_CAP);
            return false;
        }
        true
    }

    async fn evict(&mut self, peer: &str) -> Vec<TransportEvent> {
        let Some(mut peer_link) = self.peers.remove(peer) else {
            return Vec::new();
        };

        peer_link.link.close().await;
        debug!("evicted {}", peer);

        if peer_link.announced {
            vec![TransportEvent::PeerDisconnected(peer.to_string())]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use std::time::Duration;

    struct Pair {
        a: Transport,
        a_events: mpsc::Receiver<(String, LinkEvent)>,
        b: Transport,
        b_events: mpsc::Receiver<(String, LinkEvent)>,
    }

    fn pair() -> Pair {
        let hub = MemoryHub::default();

        let (mut a, a_events) = Transport::new(Box::new(hub.factory()));
        a.set_local_id("peer-a");
        let (mut b, b_events) = Transport::new(Box::new(hub.factory()));
        b.set_local_id("peer-b");

        Pair {
            a,
            a_events,
            b,
            b_events,
        }
    }

    fn signal_payload(events: &[TransportEvent]) -> String {
        match &events[..] {
            [TransportEvent::Signal(Envelope::Offer { payload, .. })]
            | [TransportEvent::Signal(Envelope::Answer { payload, .. })] => payload.clone(),
            other => panic!("expected one signal, got {:?}", other),
        }
    }

    /// Drain pending link events through both state machines until quiet.
    async fn pump(pair: &mut Pair) -> Vec<TransportEvent> {
        let now = Instant::now();
        let mut out = Vec::new();

        loop {
            let mut progressed = false;
            while let Ok((peer, event)) = pair.a_events.try_recv() {
                out.extend(pair.a.handle_link_event(&peer, event, now).await);
                progressed = true;
            }
            while let Ok((peer, event)) = pair.b_events.try_recv() {
                out.extend(pair.b.handle_link_event(&peer, event, now).await);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        out
    }

    async fn establish(pair: &mut Pair) {
        let now = Instant::now();

        let offer = signal_payload(&pair.a.open_to("peer-b", now).await);
        let answer = signal_payload(&pair.b.handle_offer("peer-a", &offer, now).await);
        pair.a.handle_answer("peer-b", &answer).await;

        let events = pump(pair).await;

        assert!(events.contains(&TransportEvent::PeerConnected("peer-b".into())));
        assert!(events.contains(&TransportEvent::PeerConnected("peer-a".into())));
        assert!(pair.a.is_open("peer-b"));
        assert!(pair.b.is_open("peer-a"));
    }

    #[tokio::test]
    async fn offer_answer_opens_both_sides() {
        let mut pair = pair();
        establish(&mut pair).await;

        assert_eq!(vec!["peer-b".to_string()], pair.a.open_peers());
    }

    #[tokio::test]
    async fn frames_flow_in_order() {
        let mut pair = pair();
        establish(&mut pair).await;

        pair.a.send("peer-b", Bytes::from_static(b"one")).await.unwrap();
        pair.a.send("peer-b", Bytes::from_static(b"two")).await.unwrap();

        let frames: Vec<Bytes> = pump(&mut pair)
            .await
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Frame(peer, bytes) => {
                    assert_eq!("peer-a", peer);
                    Some(bytes)
                }
                _ => None,
            })
            .collect();

        assert_eq!(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")], frames);
    }

    #[tokio::test]
    async fn send_before_open_fails_fast() {
        let mut pair = pair();
        let now = Instant::now();

        pair.a.open_to("peer-b", now).await;

        assert!(pair.a.send("peer-b", Bytes::from_static(b"x")).await.is_err());
        assert!(pair.a.send("peer-nobody", Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_open_is_a_no_op() {
        let mut pair = pair();
        let now = Instant::now();

        assert_eq!(1, pair.a.open_to("peer-b", now).await.len());
        assert!(pair.a.open_to("peer-b", now).await.is_empty());
    }

    #[tokio::test]
    async fn neighbor_cap_refuses_new_introductions() {
        let hub = MemoryHub::default();
        let (mut transport, _events) = Transport::new(Box::new(hub.factory()));
        transport.set_local_id("peer-x");
        let now = Instant::now();

        for i in 0..PEER_CAP {
            assert_eq!(1, transport.open_to(&format!("peer-{:02}", i), now).await.len());
        }

        assert!(transport.open_to("peer-overflow", now).await.is_empty());
        assert!(!transport.contains("peer-overflow"));
        assert!(transport
            .handle_offer("peer-overflow", "offer", now)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_masked_within_grace() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        let events = pair
            .a
            .handle_link_event("peer-b", LinkEvent::Disconnected, now)
            .await;
        assert!(events.is_empty());

        // inside the grace nothing surfaces
        assert!(pair.a.tick(now + DISCONNECT_GRACE / 2).await.is_empty());

        // reconnect within grace stays invisible
        let events = pair
            .a
            .handle_link_event("peer-b", LinkEvent::Connected, now + Duration::from_secs(1))
            .await;
        assert!(events.is_empty());
        assert!(pair.a.tick(now + DISCONNECT_GRACE * 2).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_past_grace_evicts() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        pair.a
            .handle_link_event("peer-b", LinkEvent::Disconnected, now)
            .await;

        let events = pair.a.tick(now + DISCONNECT_GRACE).await;

        assert_eq!(vec![TransportEvent::PeerDisconnected("peer-b".into())], events);
        assert!(!pair.a.contains("peer-b"));
    }

    #[tokio::test]
    async fn failure_triggers_one_ice_restart() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        let events = pair
            .a
            .handle_link_event("peer-b", LinkEvent::Failed, now)
            .await;
        match &events[..] {
            [TransportEvent::Signal(Envelope::Offer { to, .. })] => assert_eq!("peer-b", to),
            other => panic!("expected a restart offer, got {:?}", other),
        }

        // restart that never lands expires into eviction
        let events = pair.a.tick(now + ICE_RESTART_GRACE).await;
        assert_eq!(vec![TransportEvent::PeerDisconnected("peer-b".into())], events);
    }

    #[tokio::test]
    async fn second_failure_evicts_immediately() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        pair.a
            .handle_link_event("peer-b", LinkEvent::Failed, now)
            .await;
        let events = pair
            .a
            .handle_link_event("peer-b", LinkEvent::Failed, now + Duration::from_secs(1))
            .await;

        assert_eq!(vec![TransportEvent::PeerDisconnected("peer-b".into())], events);
    }

    #[tokio::test]
    async fn responder_waits_out_the_restart_grace() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        let events = pair
            .b
            .handle_link_event("peer-a", LinkEvent::Failed, now)
            .await;
        assert!(events.is_empty());

        let events = pair.b.tick(now + ICE_RESTART_GRACE).await;
        assert_eq!(vec![TransportEvent::PeerDisconnected("peer-a".into())], events);
    }

    #[tokio::test]
    async fn remote_close_disconnects_the_counterpart() {
        let mut pair = pair();
        establish(&mut pair).await;
        let now = Instant::now();

        let events = pair
            .a
            .handle_link_event("peer-b", LinkEvent::Closed, now)
            .await;

        assert_eq!(vec![TransportEvent::PeerDisconnected("peer-b".into())], events);

        // the hub reports the close to the other side, which evicts too
        let events = pump(&mut pair).await;
        assert!(events.contains(&TransportEvent::PeerDisconnected("peer-a".into())));
    }
}
