//! Relay-side view of one connected client

use anchor_core::{ClientData, ClientId, Packet, RelayError, Result, RoomId, encode_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Item on a client's outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded frame, delimiter included. Shared between broadcast recipients.
    Frame(Arc<str>),
    /// Flush what is queued so far, then shut the connection
    Close,
}

/// A connected client: mirrored metadata, room membership and the sending
/// end of its connection's outbound queue
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    peer: SocketAddr,
    data: ClientData,
    room: Option<RoomId>,
    outbound: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
    last_activity: Instant,
    closing: bool,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
        kick: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            peer,
            data: ClientData::new(),
            room: None,
            outbound,
            kick,
            last_activity: Instant::now(),
            closing: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Last metadata received in an `UPDATE_CLIENT_DATA`
    pub fn data(&self) -> &ClientData {
        &self.data
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Set once the relay has asked this client's connection to close
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn set_data(&mut self, data: ClientData) {
        self.data = data;
    }

    pub(crate) fn set_room(&mut self, room: Option<RoomId>) {
        self.room = room;
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Queue an already-encoded frame.
    ///
    /// Never waits. A full queue means the peer is not keeping up: the
    /// connection is told to drop the peer and `QueueFull` is returned.
    pub fn deliver(&mut self, frame: &Arc<str>) -> Result<()> {
        match self.outbound.try_send(Outbound::Frame(frame.clone())) {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.kick();
                Err(RelayError::QueueFull(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::ConnectionError(format!(
                "client {} connection already closed",
                self.id
            ))),
        }
    }

    /// Encode and queue a relay-originated packet
    pub fn send(&mut self, packet: &Packet, quiet_mode: bool) -> Result<()> {
        let frame = encode(packet)?;
        log_traffic(Direction::Outbound, self.id, packet.kind(), packet.quiet || quiet_mode);
        self.deliver(&frame)
    }

    /// Ask the connection to flush its queue and close. Packets from this
    /// client are ignored from now on.
    pub fn close(&mut self) {
        self.closing = true;
        if self.outbound.try_send(Outbound::Close).is_err() {
            self.kick();
        }
    }

    /// Tear the connection down without flushing
    pub fn kick(&self) {
        self.kick.notify_one();
    }
}

/// Encode a packet once so it can be shared by every recipient
pub fn encode(packet: &Packet) -> Result<Arc<str>> {
    Ok(Arc::from(encode_frame(packet)?))
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

/// Per-packet traffic line. Quiet traffic drops to `trace`.
pub(crate) fn log_traffic(direction: Direction, id: ClientId, kind: &str, quiet: bool) {
    let arrow = match direction {
        Direction::Inbound => "->",
        Direction::Outbound => "<-",
    };
    if quiet {
        trace!("Client {} {} Relay: {}", id, arrow, kind);
    } else {
        debug!("Client {} {} Relay: {}", id, arrow, kind);
    }
}
