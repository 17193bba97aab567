//! Rooms: named broadcast domains
//!
//! A room only stores member ids; the client handles themselves live in the
//! registry and are passed in for every fan-out. Members are kept in join
//! order, which is also delivery order. Both the roster and the save-state
//! queue are insertion-ordered sets, so membership checks stay constant time
//! while fan-out order is preserved.

use crate::client::{ClientHandle, encode};
use anchor_core::{ClientId, ClientSnapshot, Packet, RoomId};
use indexmap::IndexSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Live clients keyed by id
pub type ClientMap = HashMap<ClientId, ClientHandle>;

/// A set of clients sharing an id, plus the save-state request queue
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: IndexSet<ClientId>,
    pending_save_state: IndexSet<ClientId>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: IndexSet::new(),
            pending_save_state: IndexSet::new(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Members in join order
    pub fn members(&self) -> &IndexSet<ClientId> {
        &self.members
    }

    /// Clients waiting for a `PUSH_SAVE_STATE`
    pub fn pending_save_state(&self) -> &IndexSet<ClientId> {
        &self.pending_save_state
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    /// Returns false if the client was already a member
    pub(crate) fn add_member(&mut self, id: ClientId) -> bool {
        self.members.insert(id)
    }

    /// Drop a member and any save-state request it left behind
    pub(crate) fn remove_member(&mut self, id: ClientId) -> bool {
        self.pending_save_state.shift_remove(&id);
        self.members.shift_remove(&id)
    }

    /// Deliver to every member except `exclude`, in join order
    pub fn broadcast(
        &self,
        clients: &mut ClientMap,
        frame: &Arc<str>,
        exclude: Option<ClientId>,
    ) -> Vec<ClientId> {
        let targets = self
            .members
            .iter()
            .copied()
            .filter(|id| Some(*id) != exclude);
        deliver_each(clients, targets, frame)
    }

    /// Deliver to one member. `None` if `target` is not in this room.
    pub fn unicast(
        &self,
        clients: &mut ClientMap,
        target: ClientId,
        frame: &Arc<str>,
    ) -> Option<ClientId> {
        if !self.contains(target) {
            return None;
        }
        deliver_each(clients, [target], frame).pop()
    }

    /// Send each member an `ALL_CLIENT_DATA` listing every *other* member
    pub fn broadcast_client_data(&self, clients: &mut ClientMap) -> Vec<ClientId> {
        let snapshots: Vec<ClientSnapshot> = self
            .members
            .iter()
            .filter_map(|id| clients.get(id))
            .map(|client| ClientSnapshot::new(client.id(), client.data()))
            .collect();

        let mut delivered = Vec::with_capacity(self.members.len());
        for &recipient in &self.members {
            let view: Vec<ClientSnapshot> = snapshots
                .iter()
                .filter(|snapshot| snapshot.client_id != recipient)
                .cloned()
                .collect();
            let frame = match encode(&Packet::all_client_data(view)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Room {}: failed to encode client data: {}", self.id, e);
                    continue;
                }
            };
            delivered.extend(deliver_each(clients, [recipient], &frame));
        }
        delivered
    }

    /// Queue `requester` for the next pushed save state and forward the
    /// request to everyone else. `None` when nobody else is here to answer.
    pub fn request_save_state(
        &mut self,
        clients: &mut ClientMap,
        requester: ClientId,
        frame: &Arc<str>,
    ) -> Option<Vec<ClientId>> {
        if self.members.len() < 2 {
            return None;
        }
        self.pending_save_state.insert(requester);
        Some(self.broadcast(clients, frame, Some(requester)))
    }

    /// Hand a pushed save state to every queued requester and clear the queue
    pub fn push_save_state(&mut self, clients: &mut ClientMap, frame: &Arc<str>) -> Vec<ClientId> {
        let pending = std::mem::take(&mut self.pending_save_state);
        deliver_each(clients, pending, frame)
    }
}

/// Deliver `frame` to each id still present in `clients`; returns who got it
fn deliver_each(
    clients: &mut ClientMap,
    targets: impl IntoIterator<Item = ClientId>,
    frame: &Arc<str>,
) -> Vec<ClientId> {
    let mut delivered = Vec::new();
    for id in targets {
        let Some(client) = clients.get_mut(&id) else {
            continue;
        };
        match client.deliver(frame) {
            Ok(()) => delivered.push(id),
            Err(e) => warn!("Delivery to client {} failed: {}", id, e),
        }
    }
    delivered
}
