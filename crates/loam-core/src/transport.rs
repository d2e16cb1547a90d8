//! Message routing between the peers of a replication group.
//!
//! Delivery is best-effort: consensus tolerates dropped messages, so a full
//! or missing peer queue drops the message rather than blocking the group
//! loop. Routes are keyed by (group, node) because one process hosts many
//! independent groups.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{GroupId, NodeId, RaftMessage};

/// Queue depth per subscribed peer.
const PEER_QUEUE_DEPTH: usize = 256;

/// A consensus message together with its sender.
#[derive(Debug, Clone)]
pub struct PeerMessage {
    /// Node that produced the message.
    pub from: NodeId,
    /// The message itself.
    pub msg: RaftMessage,
}

/// Routes consensus messages between group peers.
pub trait RaftTransport: Send + Sync {
    /// Registers a group member and returns the stream of messages addressed
    /// to it. Subscribing again replaces the previous registration.
    fn subscribe(&self, group: GroupId, node: NodeId) -> mpsc::Receiver<PeerMessage>;

    /// Delivers a message to a group member, dropping it when the member is
    /// unknown or its queue is full.
    fn send(&self, group: GroupId, to: NodeId, msg: PeerMessage);
}

/// In-process transport connecting peers through channels.
#[derive(Default)]
pub struct LoopbackTransport {
    routes: DashMap<(GroupId, NodeId), mpsc::Sender<PeerMessage>>,
}

impl LoopbackTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        LoopbackTransport {
            routes: DashMap::new(),
        }
    }

    /// Removes a member's route so nothing reaches it until it resubscribes.
    pub fn disconnect(&self, group: GroupId, node: NodeId) {
        self.routes.remove(&(group, node));
    }
}

impl RaftTransport for LoopbackTransport {
    fn subscribe(&self, group: GroupId, node: NodeId) -> mpsc::Receiver<PeerMessage> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.routes.insert((group, node), tx);
        rx
    }

    fn send(&self, group: GroupId, to: NodeId, msg: PeerMessage) {
        let Some(route) = self.routes.get(&(group, to)) else {
            debug!(group_id = %group, to = %to, "dropping message for unknown peer");
            return;
        };
        if let Err(e) = route.try_send(msg) {
            debug!(group_id = %group, to = %to, error = %e, "dropping message for slow peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogIndex, Term};

    fn heartbeat(from: u64) -> PeerMessage {
        PeerMessage {
            from: NodeId::new(from),
            msg: RaftMessage::AppendEntries {
                term: Term::new(1),
                leader_id: NodeId::new(from),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: Vec::new(),
                leader_commit: LogIndex::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn test_send_reaches_subscriber() {
        let t = LoopbackTransport::new();
        let g = GroupId::new(1);
        let mut rx = t.subscribe(g, NodeId::new(2));
        t.send(g, NodeId::new(2), heartbeat(1));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.from, NodeId::new(1));
    }

    #[test]
    fn test_send_to_unknown_peer_is_dropped() {
        let t = LoopbackTransport::new();
        t.send(GroupId::new(1), NodeId::new(9), heartbeat(1));
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let t = LoopbackTransport::new();
        let mut a = t.subscribe(GroupId::new(1), NodeId::new(2));
        let mut b = t.subscribe(GroupId::new(2), NodeId::new(2));
        t.send(GroupId::new(2), NodeId::new(2), heartbeat(1));

        assert_eq!(b.recv().await.unwrap().from, NodeId::new(1));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let t = LoopbackTransport::new();
        let g = GroupId::new(1);
        let mut rx = t.subscribe(g, NodeId::new(2));
        t.disconnect(g, NodeId::new(2));
        t.send(g, NodeId::new(2), heartbeat(1));

        // Sender side is gone, so the receiver sees end-of-stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_route() {
        let t = LoopbackTransport::new();
        let g = GroupId::new(1);
        let mut stale = t.subscribe(g, NodeId::new(2));
        let mut fresh = t.subscribe(g, NodeId::new(2));
        t.send(g, NodeId::new(2), heartbeat(1));

        assert!(stale.recv().await.is_none());
        assert_eq!(fresh.recv().await.unwrap().from, NodeId::new(1));
    }
}
