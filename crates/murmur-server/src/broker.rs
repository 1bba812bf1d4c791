//! Room-scoped fan-out.
//!
//! The outer map lock is a plain `std` lock held only long enough to find a
//! room's group; everything else happens under that room's own async mutex,
//! so rooms never contend with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use murmur_shared::{OutboundEvent, RoomId, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::CloseReason;

/// What the broker pushes into a connection's queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<OutboundEvent>),
    /// The connection must shut down; its membership is already gone.
    Close(CloseReason),
}

/// Sending half of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: UserId,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            connection_id: Uuid::new_v4(),
            user_id,
            tx,
        };
        (handle, rx)
    }

    /// Returns `false` once the receiving side is gone.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }

    /// Send an event to this connection only.
    pub fn send_event(&self, event: OutboundEvent) -> bool {
        self.deliver(Delivery::Event(Arc::new(event)))
    }
}

struct RoomGroup {
    room_id: RoomId,
    members: HashMap<Uuid, ConnectionHandle>,
    /// Set once the group is unlinked from the map. A joiner that finds this
    /// flag must look the room up again.
    dissolved: bool,
}

impl RoomGroup {
    fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: HashMap::new(),
            dissolved: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub broadcasts: AtomicU64,
    pub deliveries: AtomicU64,
    pub pruned: AtomicU64,
    pub dissolved_rooms: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub pruned: u64,
    pub dissolved_rooms: u64,
}

impl BrokerStats {
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            dissolved_rooms: self.dissolved_rooms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct RoomBroker {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomGroup>>>>,
    stats: BrokerStats,
}

impl RoomBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, room_id: RoomId) -> Option<Arc<Mutex<RoomGroup>>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&room_id)
            .cloned()
    }

    fn group_for(&self, room_id: RoomId) -> Arc<Mutex<RoomGroup>> {
        if let Some(group) = self.existing(room_id) {
            return group;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            rooms
                .entry(room_id)
                .or_insert_with(|| Arc::new(Mutex::new(RoomGroup::new(room_id)))),
        )
    }

    /// Unlink `group` from the map if the map still points at it.
    fn unlink(&self, room_id: RoomId, group: &Arc<Mutex<RoomGroup>>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms
            .get(&room_id)
            .is_some_and(|current| Arc::ptr_eq(current, group))
        {
            rooms.remove(&room_id);
        }
    }

    fn retire_if_empty(&self, group_arc: &Arc<Mutex<RoomGroup>>, group: &mut RoomGroup) {
        if group.members.is_empty() && !group.dissolved {
            group.dissolved = true;
            self.unlink(group.room_id, group_arc);
            debug!(group = %group.room_id.group_name(), "Removed empty room group");
        }
    }

    /// Subscribe a connection. Returns the member count after joining.
    pub async fn join(&self, room_id: RoomId, handle: ConnectionHandle) -> usize {
        loop {
            let group_arc = self.group_for(room_id);
            let mut group = group_arc.lock().await;
            if group.dissolved {
                continue;
            }

            group.members.insert(handle.connection_id, handle.clone());
            info!(
                group = %room_id.group_name(),
                user = %handle.user_id,
                connection = %handle.connection_id,
                members = group.members.len(),
                "Connection joined room"
            );
            return group.members.len();
        }
    }

    /// Unsubscribe a connection. Returns `false` if it was not a member.
    pub async fn leave(&self, room_id: RoomId, connection_id: Uuid) -> bool {
        let Some(group_arc) = self.existing(room_id) else {
            return false;
        };
        let mut group = group_arc.lock().await;
        let removed = group.members.remove(&connection_id).is_some();
        if removed {
            info!(
                group = %room_id.group_name(),
                connection = %connection_id,
                members = group.members.len(),
                "Connection left room"
            );
        }
        self.retire_if_empty(&group_arc, &mut group);
        removed
    }

    /// Deliver `event` to every current member, the originator included.
    /// Returns the number of connections it reached.
    pub async fn broadcast(&self, room_id: RoomId, event: OutboundEvent) -> usize {
        let Some(group_arc) = self.existing(room_id) else {
            debug!(room = %room_id, "Broadcast to room with no members");
            return 0;
        };
        let mut group = group_arc.lock().await;
        let event = Arc::new(event);

        let mut dead = Vec::new();
        for (id, handle) in &group.members {
            if !handle.deliver(Delivery::Event(Arc::clone(&event))) {
                dead.push(*id);
            }
        }
        for id in &dead {
            group.members.remove(id);
            debug!(room = %room_id, connection = %id, "Pruned closed subscriber");
        }

        let reached = group.members.len();
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(reached as u64, Ordering::Relaxed);
        self.stats
            .pruned
            .fetch_add(dead.len() as u64, Ordering::Relaxed);

        self.retire_if_empty(&group_arc, &mut group);
        reached
    }

    /// Force every member of a room to close and drop the room.
    pub async fn dissolve(&self, room_id: RoomId, reason: CloseReason) -> usize {
        let Some(group_arc) = self.existing(room_id) else {
            return 0;
        };
        let mut group = group_arc.lock().await;
        let closed = self.dissolve_locked(&group_arc, &mut group, &reason);
        warn!(room = %room_id, closed, code = reason.code(), "Room dissolved");
        closed
    }

    /// Dissolve every room. Returns the number of connections told to close.
    pub async fn dissolve_all(&self, reason: CloseReason) -> usize {
        let groups: Vec<Arc<Mutex<RoomGroup>>> = self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut closed = 0;
        for group_arc in groups {
            let mut group = group_arc.lock().await;
            closed += self.dissolve_locked(&group_arc, &mut group, &reason);
        }
        info!(closed, code = reason.code(), "All rooms dissolved");
        closed
    }

    fn dissolve_locked(
        &self,
        group_arc: &Arc<Mutex<RoomGroup>>,
        group: &mut RoomGroup,
        reason: &CloseReason,
    ) -> usize {
        let members = std::mem::take(&mut group.members);
        for handle in members.values() {
            handle.deliver(Delivery::Close(reason.clone()));
        }
        if !group.dissolved {
            group.dissolved = true;
            self.unlink(group.room_id, group_arc);
            self.stats.dissolved_rooms.fetch_add(1, Ordering::Relaxed);
        }
        members.len()
    }

    pub async fn member_count(&self, room_id: RoomId) -> usize {
        match self.existing(room_id) {
            Some(group) => group.lock().await.members.len(),
            None => 0,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(sender: i64) -> OutboundEvent {
        OutboundEvent::UserTyping {
            sender_id: UserId(sender),
        }
    }

    #[tokio::test]
    async fn join_leave_removes_empty_room() {
        let broker = RoomBroker::new();
        let room = RoomId(42);
        let (handle, _rx) = ConnectionHandle::new(UserId(1));

        assert_eq!(broker.join(room, handle.clone()).await, 1);
        assert_eq!(broker.member_count(room).await, 1);
        assert_eq!(broker.room_count(), 1);

        assert!(broker.leave(room, handle.connection_id).await);
        assert!(!broker.leave(room, handle.connection_id).await);
        assert_eq!(broker.room_count(), 0);

        assert_eq!(broker.join(room, handle).await, 1);
        assert_eq!(broker.room_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_including_origin() {
        let broker = RoomBroker::new();
        let room = RoomId(1);
        let (a, mut a_rx) = ConnectionHandle::new(UserId(1));
        let (b, mut b_rx) = ConnectionHandle::new(UserId(2));
        broker.join(room, a).await;
        broker.join(room, b).await;

        assert_eq!(broker.broadcast(room, typing(1)).await, 2);

        for rx in [&mut a_rx, &mut b_rx] {
            match rx.try_recv().unwrap() {
                Delivery::Event(ev) => assert_eq!(*ev, typing(1)),
                other => panic!("unexpected delivery {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let broker = RoomBroker::new();
        let (a, mut a_rx) = ConnectionHandle::new(UserId(1));
        let (b, mut b_rx) = ConnectionHandle::new(UserId(2));
        broker.join(RoomId(1), a).await;
        broker.join(RoomId(2), b).await;

        broker.broadcast(RoomId(1), typing(1)).await;
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_room_order_is_preserved() {
        let broker = RoomBroker::new();
        let room = RoomId(7);
        let (a, mut rx) = ConnectionHandle::new(UserId(1));
        broker.join(room, a).await;

        for i in 0..50 {
            broker.broadcast(room, typing(i)).await;
        }
        for i in 0..50 {
            match rx.recv().await.unwrap() {
                Delivery::Event(ev) => assert_eq!(*ev, typing(i)),
                other => panic!("unexpected delivery {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let broker = RoomBroker::new();
        let room = RoomId(3);
        let (alive, _alive_rx) = ConnectionHandle::new(UserId(1));
        let (gone, gone_rx) = ConnectionHandle::new(UserId(2));
        broker.join(room, alive).await;
        broker.join(room, gone).await;
        drop(gone_rx);

        assert_eq!(broker.broadcast(room, typing(1)).await, 1);
        assert_eq!(broker.member_count(room).await, 1);
        assert_eq!(broker.stats().pruned, 1);
    }

    #[tokio::test]
    async fn dissolve_closes_every_member() {
        let broker = RoomBroker::new();
        let room = RoomId(9);
        let (a, mut a_rx) = ConnectionHandle::new(UserId(1));
        let (b, mut b_rx) = ConnectionHandle::new(UserId(2));
        broker.join(room, a).await;
        broker.join(room, b).await;

        assert_eq!(broker.dissolve(room, CloseReason::RoomLost).await, 2);
        assert_eq!(broker.room_count(), 0);
        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Delivery::Close(CloseReason::RoomLost)
            ));
        }
        assert_eq!(broker.broadcast(room, typing(1)).await, 0);
    }

    #[tokio::test]
    async fn dissolve_all_covers_every_room() {
        let broker = RoomBroker::new();
        let (a, _a_rx) = ConnectionHandle::new(UserId(1));
        let (b, _b_rx) = ConnectionHandle::new(UserId(2));
        broker.join(RoomId(1), a).await;
        broker.join(RoomId(2), b).await;

        assert_eq!(broker.dissolve_all(CloseReason::ServerShutdown).await, 2);
        assert_eq!(broker.room_count(), 0);
        assert_eq!(broker.stats().dissolved_rooms, 2);
    }

    #[tokio::test]
    async fn concurrent_join_and_leave_never_lose_a_member() {
        let broker = Arc::new(RoomBroker::new());
        let room = RoomId(5);
        let (keeper, _keeper_rx) = ConnectionHandle::new(UserId(0));

        let mut tasks = Vec::new();
        for i in 1..=32 {
            let broker = Arc::clone(&broker);
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = ConnectionHandle::new(UserId(i));
                broker.join(room, handle.clone()).await;
                broker.leave(room, handle.connection_id).await;
            }));
        }
        broker.join(room, keeper).await;
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(broker.member_count(room).await, 1);
        assert_eq!(broker.room_count(), 1);
    }
}
