use crate::protocol::PeerSummary;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub complete: bool,
    pub last_seen: Instant,
    pub last_seen_ms: u64,
}

/// Membership list entry as the observer endpoint reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSnapshot {
    pub peer_id: String,
    pub complete: bool,
    pub last_seen_ms: u64,
}

pub struct AnnounceOutcome {
    /// Current members other than the announcer, for the direct response.
    pub others: Vec<PeerSummary>,
    /// Full membership, announcer included, for the joined broadcast.
    pub everyone: Vec<PeerSummary>,
    /// Who to notify; empty when the announce was only a refresh.
    pub notify: Vec<String>,
    pub refreshed: bool,
}

/// content id → participant id → record. The tracker's only state; every
/// mutation path (announce, leave, socket close, sweep) runs through here
/// so the connection layer stays a thin relay.
#[derive(Default)]
pub struct Rooms {
    rooms: HashMap<String, HashMap<String, MemberRecord>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert; a repeated announce refreshes the record instead of
    /// producing a second join.
    pub fn announce(
        &mut self,
        content: &str,
        peer: &str,
        complete: bool,
        now: Instant,
    ) -> AnnounceOutcome {
        let room = self.rooms.entry(content.to_string()).or_default();

        let refreshed = room.contains_key(peer);
        room.insert(
            peer.to_string(),
            MemberRecord {
                complete,
                last_seen: now,
                last_seen_ms: unix_ms(),
            },
        );

        let mut others = Vec::new();
        let mut everyone = Vec::new();
        let mut notify = Vec::new();
        for (id, record) in room.iter() {
            let summary = PeerSummary {
                peer_id: id.clone(),
                complete: record.complete,
            };
            everyone.push(summary.clone());
            if id != peer {
                others.push(summary);
                if !refreshed {
                    notify.push(id.clone());
                }
            }
        }
        others.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        everyone.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        notify.sort();

        AnnounceOutcome {
            others,
            everyone,
            notify,
            refreshed,
        }
    }

    /// Remove one membership; returns the remaining members to notify, or
    /// None when the peer wasn't in the room.
    pub fn leave(&mut self, content: &str, peer: &str) -> Option<Vec<String>> {
        let room = self.rooms.get_mut(content)?;
        room.remove(peer)?;

        let mut remaining: Vec<String> = room.keys().cloned().collect();
        remaining.sort();

        if room.is_empty() {
            self.rooms.remove(content);
        }

        Some(remaining)
    }

    /// Remove a participant from every room, e.g. on socket close.
    /// Returns (content, remaining members) per membership dropped.
    pub fn drop_peer(&mut self, peer: &str) -> Vec<(String, Vec<String>)> {
        let contents: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.contains_key(peer))
            .map(|(content, _)| content.clone())
            .collect();

        let mut dropped = Vec::new();
        for content in contents {
            if let Some(remaining) = self.leave(&content, peer) {
                dropped.push((content, remaining));
            }
        }
        dropped.sort();
        dropped
    }

    /// Evict records not refreshed within the threshold; abrupt
    /// disconnects don't always surface as socket closes.
    pub fn sweep(&mut self, older_than: Duration, now: Instant) -> Vec<(String, String, Vec<String>)> {
        let stale: Vec<(String, String)> = self
            .rooms
            .iter()
            .flat_map(|(content, room)| {
                room.iter()
                    .filter(|(_, record)| now.duration_since(record.last_seen) >= older_than)
                    .map(|(peer, _)| (content.clone(), peer.clone()))
            })
            .collect();

        let mut swept = Vec::new();
        for (content, peer) in stale {
            if let Some(remaining) = self.leave(&content, &peer) {
                swept.push((content, peer, remaining));
            }
        }
        swept.sort();
        swept
    }

    pub fn snapshot(&self, content: &str) -> Vec<MemberSnapshot> {
        let mut members: Vec<MemberSnapshot> = self
            .rooms
            .get(content)
            .map(|room| {
                room.iter()
                    .map(|(peer_id, record)| MemberSnapshot {
                        peer_id: peer_id.clone(),
                        complete: record.complete,
                        last_seen_ms: record.last_seen_ms,
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        members
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_announce_creates_the_room() {
        let mut rooms = Rooms::new();
        let now = Instant::now();

        let outcome = rooms.announce("c", "peer-a", true, now);

        assert!(!outcome.refreshed);
        assert!(outcome.others.is_empty());
        assert!(outcome.notify.is_empty());
        assert_eq!(1, outcome.everyone.len());
        assert_eq!(1, rooms.room_count());
    }

    #[test]
    fn joiner_sees_existing_members_and_they_get_notified() {
        let mut rooms = Rooms::new();
        let now = Instant::now();
        rooms.announce("c", "peer-a", true, now);

        let outcome = rooms.announce("c", "peer-b", false, now);

        assert_eq!(
            vec![PeerSummary {
                peer_id: "peer-a".into(),
                complete: true,
            }],
            outcome.others
        );
        assert_eq!(vec!["peer-a".to_string()], outcome.notify);
        assert_eq!(2, outcome.everyone.len());
    }

    #[test]
    fn re_announce_is_a_refresh_not_a_join() {
        let mut rooms = Rooms::new();
        let now = Instant::now();
        rooms.announce("c", "peer-a", false, now);
        rooms.announce("c", "peer-b", false, now);

        let again = rooms.announce("c", "peer-a", true, now);

        assert!(again.refreshed);
        assert!(again.notify.is_empty());
        // same membership as a single announce, with completeness updated
        assert_eq!(2, again.everyone.len());
        assert!(rooms
            .snapshot("c")
            .iter()
            .any(|member| member.peer_id == "peer-a" && member.complete));
    }

    #[test]
    fn leave_notifies_the_remaining_room() {
        let mut rooms = Rooms::new();
        let now = Instant::now();
        rooms.announce("c", "peer-a", false, now);
        rooms.announce("c", "peer-b", false, now);

        assert_eq!(Some(vec!["peer-b".to_string()]), rooms.leave("c", "peer-a"));
        assert_eq!(None, rooms.leave("c", "peer-a"));
        assert_eq!(None, rooms.leave("missing", "peer-a"));
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let mut rooms = Rooms::new();
        let now = Instant::now();
        rooms.announce("c", "peer-a", false, now);

        rooms.leave("c", "peer-a");

        assert_eq!(0, rooms.room_count());
        assert!(rooms.snapshot("c").is_empty());
    }

    #[test]
    fn drop_peer_spans_rooms() {
        let mut rooms = Rooms::new();
        let now = Instant::now();
        rooms.announce("c1", "peer-a", false, now);
        rooms.announce("c1", "peer-b", false, now);
        rooms.announce("c2", "peer-a", true, now);

        let dropped = rooms.drop_peer("peer-a");

        assert_eq!(
            vec![
                ("c1".to_string(), vec!["peer-b".to_string()]),
                ("c2".to_string(), Vec::new()),
            ],
            dropped
        );
        assert_eq!(1, rooms.room_count());
    }

    #[test]
    fn sweep_evicts_only_stale_records() {
        let mut rooms = Rooms::new();
        let start = Instant::now();
        rooms.announce("c", "peer-old", false, start);
        rooms.announce("c", "peer-fresh", false, start + Duration::from_secs(170));

        let swept = rooms.sweep(Duration::from_secs(180), start + Duration::from_secs(185));

        assert_eq!(
            vec![(
                "c".to_string(),
                "peer-old".to_string(),
                vec!["peer-fresh".to_string()],
            )],
            swept
        );
        assert_eq!(1, rooms.snapshot("c").len());
    }

    #[test]
    fn refresh_resets_the_stale_clock() {
        let mut rooms = Rooms::new();
        let start = Instant::now();
        rooms.announce("c", "peer-a", false, start);
        rooms.announce("c", "peer-a", false, start + Duration::from_secs(170));

        let swept = rooms.sweep(Duration::from_secs(180), start + Duration::from_secs(200));

        assert!(swept.is_empty());
    }
}
