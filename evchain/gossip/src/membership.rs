use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
}

/// Control-plane messages exchanged over UDP alongside data frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Join { member: Member },
    JoinAck { members: Vec<Member> },
    Ping { from: Member, seq: u64 },
    Ack { from: Member, seq: u64, members: Vec<Member> },
    Leave { name: String },
}

struct MemberState {
    member: Member,
    last_seen: Instant,
}

/// SWIM-style member table. Any packet from a member refreshes it; the
/// periodic sweep marks silent members suspect and eventually removes them.
pub struct Membership {
    local: Member,
    suspicion_timeout: Duration,
    members: RwLock<HashMap<String, MemberState>>,
}

impl Membership {
    pub fn new(local: Member, suspicion_timeout: Duration) -> Self {
        Membership {
            local,
            suspicion_timeout,
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    /// Records traffic from a member, inserting it if new.
    pub fn observe(&self, member: Member) {
        if member.name == self.local.name {
            return;
        }
        let mut members = self.members.write();
        match members.get_mut(&member.name) {
            Some(state) => {
                state.member = member;
                state.last_seen = Instant::now();
            }
            None => {
                debug!(name = %member.name, addr = %member.addr, "member joined");
                members.insert(
                    member.name.clone(),
                    MemberState {
                        member,
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    /// Merges a peer's member list. Only inserts unknown members; liveness
    /// of known ones is tracked by direct traffic.
    pub fn merge(&self, incoming: Vec<Member>) {
        let mut members = self.members.write();
        for member in incoming {
            if member.name == self.local.name || members.contains_key(&member.name) {
                continue;
            }
            debug!(name = %member.name, addr = %member.addr, "member learned via gossip");
            members.insert(
                member.name.clone(),
                MemberState {
                    member,
                    last_seen: Instant::now(),
                },
            );
        }
    }

    pub fn remove(&self, name: &str) {
        if self.members.write().remove(name).is_some() {
            debug!(name, "member left");
        }
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.members.read().get(name).map(|state| state.member.clone())
    }

    /// All known peers, self excluded.
    pub fn peers(&self) -> Vec<Member> {
        self.members
            .read()
            .values()
            .map(|state| state.member.clone())
            .collect()
    }

    /// Cluster size including self.
    pub fn member_count(&self) -> usize {
        self.members.read().len() + 1
    }

    pub fn random_neighbour(&self) -> Option<Member> {
        let peers = self.peers();
        peers.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn random_peers(&self, count: usize) -> Vec<Member> {
        let mut peers = self.peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(count);
        peers
    }

    /// Drops members that have been silent past twice the suspicion
    /// timeout; logs the merely suspect ones.
    pub fn sweep(&self) {
        let mut members = self.members.write();
        members.retain(|name, state| {
            let silent = state.last_seen.elapsed();
            if silent > self.suspicion_timeout * 2 {
                warn!(name = %name, ?silent, "member unresponsive, removing");
                false
            } else {
                if silent > self.suspicion_timeout {
                    debug!(name = %name, ?silent, "member suspect");
                }
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, port: u16) -> Member {
        Member {
            name: name.to_string(),
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
        }
    }

    fn membership() -> Membership {
        Membership::new(member("self", 1000), Duration::from_secs(5))
    }

    #[test]
    fn observe_ignores_self_and_tracks_peers() {
        let membership = membership();
        membership.observe(member("self", 1000));
        membership.observe(member("a", 1001));
        membership.observe(member("b", 1002));

        assert_eq!(membership.member_count(), 3);
        assert!(membership.get("a").is_some());
        assert!(membership.get("self").is_none());
    }

    #[test]
    fn random_neighbour_excludes_self() {
        let membership = membership();
        assert!(membership.random_neighbour().is_none());

        membership.observe(member("a", 1001));
        for _ in 0..16 {
            assert_eq!(membership.random_neighbour().unwrap().name, "a");
        }
    }

    #[test]
    fn merge_only_adds_unknown_members() {
        let membership = membership();
        membership.observe(member("a", 1001));
        membership.merge(vec![member("a", 9999), member("b", 1002), member("self", 1)]);

        // Existing member keeps its direct-traffic address.
        assert_eq!(membership.get("a").unwrap().addr, member("a", 1001).addr);
        assert!(membership.get("b").is_some());
        assert_eq!(membership.member_count(), 3);
    }

    #[test]
    fn control_messages_round_trip_as_json() {
        let message = ControlMessage::Ack {
            from: member("a", 1001),
            seq: 7,
            members: vec![member("b", 1002)],
        };
        let encoded = serde_json::to_vec(&message).unwrap();
        let decoded: ControlMessage = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            ControlMessage::Ack { from, seq, members } => {
                assert_eq!(from.name, "a");
                assert_eq!(seq, 7);
                assert_eq!(members.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
