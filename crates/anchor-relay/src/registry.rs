//! Registry of live clients and rooms
//!
//! [`RelayState`] holds everything mutable: the client map, the room map and
//! the id counter, plus the set of banned peer digests. It is plain synchronous code so a routing decision,
//! including every membership change and fan-out it causes, happens in one
//! step. [`Registry`] wraps it in a single async mutex shared by the accept
//! loop, every connection task, the console and the health tasks.

use crate::client::{ClientHandle, Outbound};
use crate::room::{ClientMap, Room};
use crate::routing::Routing;
use anchor_core::{ClientId, Packet, RelayError, Result, RoomId};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, Notify, mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sent to a peer as it is banned, and again on every later connection attempt
pub const BANNED_MESSAGE: &str = "You have been banned from this Anchor server. \
If you believe this has been wrongfully done contact whoever is hosting it.";

/// Client and room collections plus relay-wide flags
#[derive(Debug)]
pub struct RelayState {
    pub(crate) clients: ClientMap,
    pub(crate) rooms: HashMap<RoomId, Room>,
    next_client_id: u64,
    seen_peers: BTreeSet<String>,
    banned: BTreeSet<String>,
    quiet: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            clients: ClientMap::new(),
            rooms: HashMap::new(),
            next_client_id: 1,
            seen_peers: BTreeSet::new(),
            banned: BTreeSet::new(),
            quiet: false,
        }
    }

    /// Track a newly accepted connection and assign its id
    pub fn add_client(
        &mut self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
        kick: Arc<Notify>,
    ) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.seen_peers.insert(peer_digest(peer.ip()));
        self.clients
            .insert(id, ClientHandle::new(id, peer, outbound, kick));
        id
    }

    /// Forget a client, leaving its room first. Dropping the handle closes
    /// the client's outbound queue.
    pub fn remove_client(&mut self, id: ClientId) -> Option<ClientHandle> {
        self.leave_room(id);
        self.clients.remove(&id)
    }

    /// Existing room with this id, or a new empty one
    pub fn get_or_create_room(&mut self, id: &RoomId) -> &mut Room {
        self.rooms.entry(id.clone()).or_insert_with(|| {
            info!("Room {} created", id);
            Room::new(id.clone())
        })
    }

    pub fn remove_room(&mut self, id: &RoomId) -> Option<Room> {
        let room = self.rooms.remove(id);
        if room.is_some() {
            info!("Room {} removed", id);
        }
        room
    }

    /// Put an unassigned client into `room_id` (creating it) and send every
    /// member a fresh roster. Returns who received one.
    pub fn join_room(&mut self, client_id: ClientId, room_id: &RoomId) -> Result<Vec<ClientId>> {
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or(RelayError::ClientNotFound(client_id))?;
        if let Some(current) = client.room() {
            return Err(RelayError::ConnectionError(format!(
                "client {} is already in room {}",
                client_id, current
            )));
        }
        client.set_room(Some(room_id.clone()));

        let room = self.get_or_create_room(room_id);
        room.add_member(client_id);
        info!(
            "Client {} joined room {} ({} members)",
            client_id,
            room_id,
            room.len()
        );

        let room = &self.rooms[room_id];
        Ok(room.broadcast_client_data(&mut self.clients))
    }

    /// Take a client out of its room. The remaining members get a fresh
    /// roster; an emptied room is removed on the spot.
    pub fn leave_room(&mut self, client_id: ClientId) -> Option<RoomId> {
        let room_id = self.clients.get_mut(&client_id)?.room().cloned()?;
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.set_room(None);
        }

        let room = self.rooms.get_mut(&room_id)?;
        room.remove_member(client_id);
        debug!("Client {} left room {}", client_id, room_id);

        if room.is_empty() {
            self.remove_room(&room_id);
        } else {
            room.broadcast_client_data(&mut self.clients);
        }
        Some(room_id)
    }

    /// Route one inbound packet from `from`; see [`crate::routing`]
    pub fn handle_packet(&mut self, from: ClientId, packet: Packet) -> Routing {
        crate::routing::route(self, from, packet)
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientHandle> {
        self.clients.get(&id)
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Client ids in ascending order
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Rooms sorted by id
    pub fn rooms(&self) -> Vec<&Room> {
        let mut rooms: Vec<&Room> = self.rooms.values().collect();
        rooms.sort_by(|a, b| a.id().cmp(b.id()));
        rooms
    }

    /// SHA-256 digests of every distinct peer address seen since start
    pub fn seen_peers(&self) -> &BTreeSet<String> {
        &self.seen_peers
    }

    /// Digests of banned peer addresses
    pub fn banned(&self) -> &BTreeSet<String> {
        &self.banned
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.contains(&peer_digest(ip))
    }

    /// Reinstate bans carried over from a previous run
    pub fn restore_bans(&mut self, digests: impl IntoIterator<Item = String>) {
        self.banned.extend(digests);
    }

    /// Ban the client's address, tell the client, and close its connection
    pub fn ban(&mut self, id: ClientId) -> Result<()> {
        let peer = self
            .clients
            .get(&id)
            .ok_or(RelayError::ClientNotFound(id))?
            .peer();
        if self.banned.insert(peer_digest(peer.ip())) {
            warn!("Client {} banned ({})", id, peer.ip());
        }
        if let Err(e) = self.disable(id, BANNED_MESSAGE) {
            debug!("Ban notice to client {} failed: {}", id, e);
        }
        self.close_client(id)
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /// Send a relay-originated packet to one client
    pub fn send_to(&mut self, id: ClientId, packet: &Packet) -> Result<()> {
        let quiet = self.quiet;
        self.clients
            .get_mut(&id)
            .ok_or(RelayError::ClientNotFound(id))?
            .send(packet, quiet)
    }

    /// Send a relay-originated packet to every client; returns how many
    /// queued it
    pub fn send_all(&mut self, packet: &Packet) -> usize {
        let quiet = self.quiet;
        let mut sent = 0;
        for client in self.clients.values_mut() {
            if client.send(packet, quiet).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// `SERVER_MESSAGE` then `DISABLE_ANCHOR`. The second send is attempted
    /// even if the first fails.
    pub fn disable(&mut self, id: ClientId, message: &str) -> Result<()> {
        if !self.clients.contains_key(&id) {
            return Err(RelayError::ClientNotFound(id));
        }
        if let Err(e) = self.send_to(id, &Packet::server_message(message)) {
            debug!("Disable message to client {} failed: {}", id, e);
        }
        self.send_to(id, &Packet::disable_anchor())
    }

    /// Ask a client's connection to flush and close
    pub fn close_client(&mut self, id: ClientId) -> Result<()> {
        self.clients
            .get_mut(&id)
            .ok_or(RelayError::ClientNotFound(id))?
            .close();
        Ok(())
    }

    /// Disable and disconnect every member of a room, then drop the room
    pub fn delete_room(&mut self, id: &RoomId, message: &str) -> Result<Vec<ClientId>> {
        let members = self
            .rooms
            .get(id)
            .ok_or_else(|| RelayError::RoomNotFound(id.clone()))?
            .members()
            .iter()
            .copied()
            .collect::<Vec<_>>();
        for &member in &members {
            let _ = self.disable(member, message);
            if let Some(client) = self.clients.get_mut(&member) {
                client.close();
                client.set_room(None);
            }
        }
        self.remove_room(id);
        Ok(members)
    }

    /// Message every client and then disconnect it; returns how many clients
    /// were asked to close
    pub fn shut_down_clients(&mut self, message: &str) -> usize {
        let packet = Packet::server_message(message);
        let quiet = self.quiet;
        for client in self.clients.values_mut() {
            let _ = client.send(&packet, quiet);
            client.close();
        }
        self.clients.len()
    }

    /// Heartbeat every client with no traffic for at least `idle`; returns
    /// how many were sent
    pub fn send_heartbeats(&mut self, idle: Duration, now: Instant) -> usize {
        let packet = Packet::heartbeat();
        let quiet = self.quiet;
        let mut sent = 0;
        for client in self.clients.values_mut() {
            if client.is_closing()
                || now.saturating_duration_since(client.last_activity()) < idle
            {
                continue;
            }
            if client.send(&packet, quiet).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

/// Hex SHA-256 of a peer's IP, used to count unique peers without storing
/// addresses
pub fn peer_digest(ip: IpAddr) -> String {
    hex::encode(Sha256::digest(ip.to_string().as_bytes()))
}

/// Shared, lock-protected [`RelayState`]
#[derive(Debug)]
pub struct Registry {
    state: Mutex<RelayState>,
    client_count: watch::Sender<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (client_count, _) = watch::channel(0);
        Self {
            state: Mutex::new(RelayState::new()),
            client_count,
        }
    }

    /// Exclusive access to the relay state. Hold it only for synchronous work.
    pub async fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().await
    }

    pub async fn register_client(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
        kick: Arc<Notify>,
    ) -> ClientId {
        let mut state = self.state.lock().await;
        let id = state.add_client(peer, outbound, kick);
        self.client_count.send_replace(state.client_count());
        id
    }

    pub async fn remove_client(&self, id: ClientId) -> Option<ClientHandle> {
        let mut state = self.state.lock().await;
        let removed = state.remove_client(id);
        self.client_count.send_replace(state.client_count());
        removed
    }

    pub async fn handle_packet(&self, from: ClientId, packet: Packet) -> Routing {
        self.state.lock().await.handle_packet(from, packet)
    }

    /// Resolves once no clients are connected
    pub async fn wait_until_empty(&self) {
        let mut count = self.client_count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn add(state: &mut RelayState, port: u16) -> (ClientId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let peer: SocketAddr = format!("192.168.1.{}:{}", port % 200, port).parse().unwrap();
        (state.add_client(peer, tx, Arc::new(Notify::new())), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(frame) = item {
                out.push(serde_json::from_str(&frame).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_ids_are_sequential_and_not_reused() {
        let mut state = RelayState::new();
        let (a, _ra) = add(&mut state, 1);
        let (b, _rb) = add(&mut state, 2);
        state.remove_client(a);
        state.remove_client(b);
        let (c, _rc) = add(&mut state, 3);

        assert_eq!((a, b, c), (ClientId(1), ClientId(2), ClientId(3)));
        assert_eq!(state.client_count(), 1);
    }

    #[test]
    fn test_join_sends_roster_to_everyone() {
        let mut state = RelayState::new();
        let (a, mut ra) = add(&mut state, 1);
        let (b, mut rb) = add(&mut state, 2);
        let room = RoomId::from("r1");

        assert_eq!(state.join_room(a, &room).unwrap(), vec![a]);
        assert_eq!(drain(&mut ra), vec![json!({"type": "ALL_CLIENT_DATA", "clients": []})]);

        assert_eq!(state.join_room(b, &room).unwrap(), vec![a, b]);
        assert_eq!(
            drain(&mut ra),
            vec![json!({"type": "ALL_CLIENT_DATA", "clients": [{"clientId": 2}]})]
        );
        assert_eq!(
            drain(&mut rb),
            vec![json!({"type": "ALL_CLIENT_DATA", "clients": [{"clientId": 1}]})]
        );
        assert_eq!(state.client(b).unwrap().room(), Some(&room));
    }

    #[test]
    fn test_second_join_rejected() {
        let mut state = RelayState::new();
        let (a, _ra) = add(&mut state, 1);
        state.join_room(a, &RoomId::from("r1")).unwrap();

        assert!(state.join_room(a, &RoomId::from("r2")).is_err());
        assert!(state.room(&RoomId::from("r2")).is_none());
    }

    #[test]
    fn test_leave_rebroadcasts_and_removes_empty_room() {
        let mut state = RelayState::new();
        let (a, mut ra) = add(&mut state, 1);
        let (b, mut rb) = add(&mut state, 2);
        let room = RoomId::from("r1");
        state.join_room(a, &room).unwrap();
        state.join_room(b, &room).unwrap();
        drain(&mut ra);
        drain(&mut rb);

        state.remove_client(b);
        assert_eq!(drain(&mut ra), vec![json!({"type": "ALL_CLIENT_DATA", "clients": []})]);
        assert_eq!(state.room_count(), 1);

        state.remove_client(a);
        assert_eq!(state.room_count(), 0);

        let fresh = state.get_or_create_room(&room);
        assert!(fresh.is_empty());
        assert!(fresh.pending_save_state().is_empty());
    }

    #[test]
    fn test_disable_sends_message_then_disable() {
        let mut state = RelayState::new();
        let (a, mut ra) = add(&mut state, 1);

        state.disable(a, "bye").unwrap();
        let packets = drain(&mut ra);
        assert_eq!(packets[0], json!({"type": "SERVER_MESSAGE", "message": "bye"}));
        assert_eq!(packets[1], json!({"type": "DISABLE_ANCHOR"}));

        assert!(matches!(
            state.disable(ClientId(99), "bye"),
            Err(RelayError::ClientNotFound(ClientId(99)))
        ));
    }

    #[test]
    fn test_delete_room_closes_members() {
        let mut state = RelayState::new();
        let (a, mut ra) = add(&mut state, 1);
        let (b, _rb) = add(&mut state, 2);
        let room = RoomId::from("doomed");
        state.join_room(a, &room).unwrap();
        state.join_room(b, &room).unwrap();
        drain(&mut ra);

        let members = state.delete_room(&room, "Deleting your room. Goodbye!").unwrap();
        assert_eq!(members, vec![a, b]);
        assert!(state.room(&room).is_none());
        assert!(state.client(a).unwrap().is_closing());

        let mut kinds = Vec::new();
        while let Ok(item) = ra.try_recv() {
            kinds.push(match item {
                Outbound::Frame(frame) => serde_json::from_str::<Value>(&frame).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string(),
                Outbound::Close => "CLOSE".to_string(),
            });
        }
        assert_eq!(kinds, vec!["SERVER_MESSAGE", "DISABLE_ANCHOR", "CLOSE"]);

        // Teardown of a detached member does not resurrect the room
        state.remove_client(a);
        assert_eq!(state.room_count(), 0);
        assert!(matches!(
            state.delete_room(&room, "x"),
            Err(RelayError::RoomNotFound(_))
        ));
    }

    #[test]
    fn test_heartbeat_only_idle_clients() {
        let mut state = RelayState::new();
        let (_a, mut ra) = add(&mut state, 1);
        let now = Instant::now();

        assert_eq!(state.send_heartbeats(Duration::from_secs(30), now), 0);
        let later = now + Duration::from_secs(31);
        assert_eq!(state.send_heartbeats(Duration::from_secs(30), later), 1);
        assert_eq!(drain(&mut ra), vec![json!({"type": "HEARTBEAT", "quiet": true})]);
    }

    #[test]
    fn test_unique_peers_by_ip() {
        let mut state = RelayState::new();
        let (tx, _rx) = mpsc::channel(1);
        for port in [1000, 1001] {
            let peer: SocketAddr = format!("10.1.1.1:{}", port).parse().unwrap();
            state.add_client(peer, tx.clone(), Arc::new(Notify::new()));
        }
        assert_eq!(state.seen_peers().len(), 1);
        assert!(state
            .seen_peers()
            .contains(&peer_digest("10.1.1.1".parse().unwrap())));
        assert_eq!(peer_digest("10.1.1.1".parse().unwrap()).len(), 64);
    }

    #[test]
    fn test_ban_covers_the_whole_address() {
        let mut state = RelayState::new();
        let (a, mut ra) = add(&mut state, 7);
        let ip = state.client(a).unwrap().peer().ip();
        assert!(!state.is_banned(ip));

        state.ban(a).unwrap();
        assert!(state.is_banned(ip));
        assert!(state.banned().contains(&peer_digest(ip)));
        assert!(state.client(a).unwrap().is_closing());

        let mut kinds = Vec::new();
        while let Ok(item) = ra.try_recv() {
            kinds.push(match item {
                Outbound::Frame(frame) => serde_json::from_str::<Value>(&frame).unwrap(),
                Outbound::Close => json!("CLOSE"),
            });
        }
        assert_eq!(
            kinds,
            vec![
                json!({"type": "SERVER_MESSAGE", "message": BANNED_MESSAGE}),
                json!({"type": "DISABLE_ANCHOR"}),
                json!("CLOSE"),
            ]
        );
        assert!(matches!(state.ban(ClientId(99)), Err(RelayError::ClientNotFound(_))));
    }

    #[test]
    fn test_restored_bans() {
        let mut state = RelayState::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        state.restore_bans([peer_digest(ip)]);
        assert!(state.is_banned(ip));
        assert!(!state.is_banned("203.0.113.10".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(Registry::new());
        let (tx, _rx) = mpsc::channel(1);
        let id = registry
            .register_client("127.0.0.1:1".parse().unwrap(), tx, Arc::new(Notify::new()))
            .await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.remove_client(id).await;
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), waiter).await
        );
    }
}
