//! Packet interpretation and room routing
//!
//! A client starts unassigned and joins a room with the first packet that
//! names one. Every packet is then routed within that room, in this order:
//!
//! 1. stamp `clientId` with the sender's id and strip `roomId`
//! 2. `UPDATE_CLIENT_DATA` replaces the sender's stored metadata
//! 3. an unassigned sender with a `roomId` joins (roster goes to everyone)
//! 4. still unassigned: drop
//! 5. `targetClientId`: unicast to that member only
//! 6. `REQUEST_SAVE_STATE`: queue the sender, forward to the others
//! 7. `PUSH_SAVE_STATE`: deliver to every queued requester, clear the queue
//! 8. anything else: broadcast to the others
//!
//! `HEARTBEAT` only refreshes the sender's activity time.

use crate::client::{Direction, encode, log_traffic};
use crate::registry::RelayState;
use anchor_core::{ClientId, Packet, PacketBody, RoomId};
use tracing::{debug, warn};

/// What happened to one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Delivered to a single room member
    Unicast(ClientId),
    /// Delivered to these members
    Broadcast(Vec<ClientId>),
    /// Sender queued; request forwarded to these members
    SaveStateRequested(Vec<ClientId>),
    /// Pushed state delivered to these queued requesters
    SaveStatePushed(Vec<ClientId>),
    /// Liveness only
    Heartbeat,
    /// Not delivered anywhere
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Sender is not (or no longer) registered
    UnknownSender,
    /// Sender's connection is being closed by the relay
    SenderClosing,
    /// Sender has no room and the packet named none
    NoRoom,
    /// `targetClientId` is not a member of the sender's room
    UnknownTarget(ClientId),
    /// Save state requested in a room with nobody else to answer
    NoSaveStateProvider,
    /// Packet could not be re-encoded
    Unencodable,
}

pub(crate) fn route(state: &mut RelayState, from: ClientId, mut packet: Packet) -> Routing {
    let quiet_mode = state.quiet();
    let Some(client) = state.clients.get_mut(&from) else {
        return Routing::Dropped(DropReason::UnknownSender);
    };
    if client.is_closing() {
        return Routing::Dropped(DropReason::SenderClosing);
    }
    client.touch();
    log_traffic(Direction::Inbound, from, packet.kind(), packet.quiet || quiet_mode);

    packet.client_id = Some(from);

    match &packet.body {
        PacketBody::Heartbeat => return Routing::Heartbeat,
        PacketBody::UpdateClientData { data } => client.set_data(data.clone()),
        _ => {}
    }

    let room_id: RoomId = match (client.room().cloned(), packet.room_id.take()) {
        (Some(current), _) => current,
        (None, Some(requested)) => {
            if let Err(e) = state.join_room(from, &requested) {
                warn!("Client {} could not join room {}: {}", from, requested, e);
                return Routing::Dropped(DropReason::NoRoom);
            }
            requested
        }
        (None, None) => {
            debug!(
                "Client {} sent {} before joining a room, dropped",
                from,
                packet.kind()
            );
            return Routing::Dropped(DropReason::NoRoom);
        }
    };

    let frame = match encode(&packet) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Client {}: could not re-encode {}: {}", from, packet.kind(), e);
            return Routing::Dropped(DropReason::Unencodable);
        }
    };

    let RelayState { clients, rooms, .. } = state;
    let Some(room) = rooms.get_mut(&room_id) else {
        return Routing::Dropped(DropReason::NoRoom);
    };

    if let Some(target) = packet.target_client_id {
        return match room.unicast(clients, target, &frame) {
            Some(delivered) => Routing::Unicast(delivered),
            None => {
                warn!(
                    "Client {} targeted client {}, not in room {}; dropped",
                    from, target, room_id
                );
                Routing::Dropped(DropReason::UnknownTarget(target))
            }
        };
    }

    match packet.body {
        PacketBody::RequestSaveState => match room.request_save_state(clients, from, &frame) {
            Some(forwarded) => Routing::SaveStateRequested(forwarded),
            None => {
                debug!(
                    "Client {} requested a save state alone in room {}; dropped",
                    from, room_id
                );
                Routing::Dropped(DropReason::NoSaveStateProvider)
            }
        },
        PacketBody::PushSaveState => Routing::SaveStatePushed(room.push_save_state(clients, &frame)),
        _ => Routing::Broadcast(room.broadcast(clients, &frame, Some(from))),
    }
}
