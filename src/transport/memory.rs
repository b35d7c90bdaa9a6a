//! In-process session links, wired through a shared hub by the same
//! offer/answer/candidate dance the real stack uses. Backs the test suite
//! and single-machine runs; delivery is reliable and ordered, like the
//! channel primitive it stands in for.

use super::link::{LinkEvent, LinkFactory, SessionLink};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Where frames and lifecycle events for one side get delivered: its
/// transport's event channel, tagged with the peer id that side used.
#[derive(Clone)]
struct Endpoint {
    events: mpsc::Sender<(String, LinkEvent)>,
    reports_as: String,
}

#[derive(Default)]
struct HubState {
    /// offer token → the initiating side, waiting for an answer.
    offers: HashMap<String, PendingSide>,
    /// answer token → both sides, waiting for the initiator to accept.
    answers: HashMap<String, (PendingSide, PendingSide)>,
}

#[derive(Clone)]
struct PendingSide {
    endpoint: Endpoint,
    wire: Arc<Mutex<Option<Endpoint>>>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn factory(&self) -> MemoryLinkFactory {
        MemoryLinkFactory { hub: self.clone() }
    }
}

pub struct MemoryLinkFactory {
    hub: MemoryHub,
}

impl LinkFactory for MemoryLinkFactory {
    fn open(
        &mut self,
        peer_id: &str,
        events: mpsc::Sender<(String, LinkEvent)>,
    ) -> Box<dyn SessionLink> {
        Box::new(MemoryLink {
            hub: self.hub.clone(),
            endpoint: Endpoint {
                events,
                reports_as: peer_id.to_string(),
            },
            wire: Arc::new(Mutex::new(None)),
        })
    }
}

pub struct MemoryLink {
    hub: MemoryHub,
    endpoint: Endpoint,
    /// The counterpart, present once the handshake completed.
    wire: Arc<Mutex<Option<Endpoint>>>,
}

impl MemoryLink {
    fn pending_side(&self) -> PendingSide {
        PendingSide {
            endpoint: self.endpoint.clone(),
            wire: self.wire.clone(),
        }
    }

    fn counterpart(&self) -> Option<Endpoint> {
        self.wire.lock().ok().and_then(|wire| wire.clone())
    }
}

async fn notify(target: &Endpoint, event: LinkEvent) {
    let _ = target
        .events
        .send((target.reports_as.clone(), event))
        .await;
}

#[async_trait]
impl SessionLink for MemoryLink {
    async fn create_offer(&mut self, _ice_restart: bool) -> Result<String> {
        let token = format!("mem-offer-{:016x}", rand::random::<u64>());

        if let Ok(mut state) = self.hub.state.lock() {
            state.offers.insert(token.clone(), self.pending_side());
        }

        // one synthetic candidate so the relay path gets exercised
        notify(&self.endpoint, LinkEvent::Candidate(format!("cand:{}", token))).await;

        Ok(token)
    }

    async fn accept_offer(&mut self, offer: &str) -> Result<String> {
        let initiator = {
            let mut state = match self.hub.state.lock() {
                Ok(state) => state,
                Err(_) => bail!("hub poisoned"),
            };
            let Some(initiator) = state.offers.remove(offer) else {
                bail!("unknown offer {}", offer);
            };
            initiator
        };

        let token = format!("mem-answer-{:016x}", rand::random::<u64>());
        if let Ok(mut state) = self.hub.state.lock() {
            state
                .answers
                .insert(token.clone(), (initiator, self.pending_side()));
        }

        notify(&self.endpoint, LinkEvent::Candidate(format!("cand:{}", token))).await;

        Ok(token)
    }

    async fn accept_answer(&mut self, answer: &str) -> Result<()> {
        let (initiator, responder) = {
            let mut state = match self.hub.state.lock() {
                Ok(state) => state,
                Err(_) => bail!("hub poisoned"),
            };
            let Some(pair) = state.answers.remove(answer) else {
                bail!("unknown answer {}", answer);
            };
            pair
        };

        if let Ok(mut wire) = initiator.wire.lock() {
            *wire = Some(responder.endpoint.clone());
        }
        if let Ok(mut wire) = responder.wire.lock() {
            *wire = Some(initiator.endpoint.clone());
        }

        for side in [&initiator.endpoint, &responder.endpoint] {
            notify(side, LinkEvent::Connected).await;
            notify(side, LinkEvent::ChannelOpen).await;
        }

        Ok(())
    }

    async fn add_remote_candidate(&mut self, _candidate: &str) -> Result<()> {
        // loopback needs no path discovery
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let Some(remote) = self.counterpart() else {
            bail!("link is not wired");
        };

        remote
            .events
            .send((remote.reports_as.clone(), LinkEvent::Frame(frame)))
            .await
            .map_err(|_| anyhow::anyhow!("counterpart is gone"))
    }

    async fn close(&mut self) {
        let remote = self
            .wire
            .lock()
            .ok()
            .and_then(|mut wire| wire.take());

        if let Some(remote) = remote {
            notify(&remote, LinkEvent::Closed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wired_pair() -> (
        Box<dyn SessionLink>,
        mpsc::Receiver<(String, LinkEvent)>,
        Box<dyn SessionLink>,
        mpsc::Receiver<(String, LinkEvent)>,
    ) {
        let hub = MemoryHub::default();
        let mut factory = hub.factory();

        let (a_tx, a_rx) = mpsc::channel(16);
        let (b_tx, b_rx) = mpsc::channel(16);

        let mut a = factory.open("peer-b", a_tx);
        let mut b = factory.open("peer-a", b_tx);

        let offer = a.create_offer(false).await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();

        (a, a_rx, b, b_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<(String, LinkEvent)>) -> Vec<(String, LinkEvent)> {
        let mut out = Vec::new();
        while let Ok(pair) = rx.try_recv() {
            out.push(pair);
        }
        out
    }

    #[tokio::test]
    async fn handshake_connects_both_sides() {
        let (_a, mut a_rx, _b, mut b_rx) = wired_pair().await;

        let a_events: Vec<LinkEvent> = drain(&mut a_rx).into_iter().map(|(_, e)| e).collect();
        let b_events: Vec<LinkEvent> = drain(&mut b_rx).into_iter().map(|(_, e)| e).collect();

        assert!(a_events.contains(&LinkEvent::Connected));
        assert!(a_events.contains(&LinkEvent::ChannelOpen));
        assert!(b_events.contains(&LinkEvent::Connected));
        assert!(b_events.contains(&LinkEvent::ChannelOpen));
    }

    #[tokio::test]
    async fn frames_arrive_tagged_and_ordered() {
        let (mut a, _a_rx, _b, mut b_rx) = wired_pair().await;
        drain(&mut b_rx);

        a.send(Bytes::from_static(b"first")).await.unwrap();
        a.send(Bytes::from_static(b"second")).await.unwrap();

        let frames: Vec<(String, LinkEvent)> = drain(&mut b_rx);
        assert_eq!(
            vec![
                ("peer-a".to_string(), LinkEvent::Frame(Bytes::from_static(b"first"))),
                ("peer-a".to_string(), LinkEvent::Frame(Bytes::from_static(b"second"))),
            ],
            frames
        );
    }

    #[tokio::test]
    async fn send_before_wiring_fails() {
        let hub = MemoryHub::default();
        let mut factory = hub.factory();
        let (tx, _rx) = mpsc::channel(16);

        let mut link = factory.open("peer-b", tx);

        assert!(link.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tokens_are_rejected() {
        let hub = MemoryHub::default();
        let mut factory = hub.factory();
        let (tx, _rx) = mpsc::channel(16);

        let mut link = factory.open("peer-b", tx);

        assert!(link.accept_offer("mem-offer-bogus").await.is_err());
        assert!(link.accept_answer("mem-answer-bogus").await.is_err());
    }

    #[tokio::test]
    async fn close_notifies_the_counterpart() {
        let (mut a, _a_rx, _b, mut b_rx) = wired_pair().await;
        drain(&mut b_rx);

        a.close().await;

        let events: Vec<LinkEvent> = drain(&mut b_rx).into_iter().map(|(_, e)| e).collect();
        assert_eq!(vec![LinkEvent::Closed], events);
    }
}
