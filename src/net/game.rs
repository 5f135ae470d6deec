use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::crypto::stream::PayloadCipher;
use crate::entities::object::ObjectIdAllocator;
use crate::entities::player::{
    build_object_destroy, Directed, EventKind, OutboundMessage, PlayerObject,
};
use crate::net::framing::{build_game_datagram, parse_game_datagram};
use crate::net::messages::*;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::session_keys::SessionKeyTable;
use crate::persistence::autosave::{AutosaveConfig, AutosaveState};
use crate::persistence::store::Store;
use crate::telemetry::logging;
use crate::world::manager::WorldManager;

/// Ack/keepalive datagrams carry this type and are never dispatched.
const MSG_KEEPALIVE: u16 = 0x0000;

const HALF_SEQ_SPACE: u16 = 0x8000;

/// `a` is at or before `b` in modular sequence space.
fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < HALF_SEQ_SPACE
}

fn seq_lt(a: u16, b: u16) -> bool {
    a != b && seq_le(a, b)
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub ping_interval: Duration,
    pub resend_interval: Duration,
    pub max_retries: u32,
    pub window_size: u16,
    pub max_unacked: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            resend_interval: Duration::from_millis(500),
            max_retries: 8,
            window_size: 64,
            max_unacked: 256,
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    WireFormat,
    Crypto,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::WireFormat => write!(f, "malformed datagram"),
            TransportError::Crypto => write!(f, "datagram decrypt failed"),
        }
    }
}

#[derive(Debug)]
struct UnackedPacket {
    datagram: Vec<u8>,
    last_send: Instant,
    retries: u32,
}

/// Per-client reliable/encrypted datagram state: sequence numbering,
/// cumulative acks, retransmission, duplicate suppression and the payload
/// cipher. Outgoing datagrams pile up in `out` until the owner drains them
/// onto the socket.
pub struct GameTransport {
    config: TransportConfig,
    next_send_seq: u16,
    expected_recv_seq: u16,
    last_ack_in: u16,
    unacked: BTreeMap<u16, UnackedPacket>,
    recent_seen: VecDeque<u16>,
    recv_buffer: BTreeMap<u16, (u8, u16, Vec<u8>)>,
    cipher: Option<PayloadCipher>,
    last_activity: Instant,
    last_ping: Instant,
    out: Vec<Vec<u8>>,
    close_reason: Option<String>,
}

impl GameTransport {
    pub fn new(config: TransportConfig, now: Instant) -> Self {
        Self {
            config,
            next_send_seq: 0,
            expected_recv_seq: 0,
            last_ack_in: 0xffff,
            unacked: BTreeMap::new(),
            recent_seen: VecDeque::new(),
            recv_buffer: BTreeMap::new(),
            cipher: None,
            last_activity: now,
            last_ping: now,
            out: Vec::new(),
            close_reason: None,
        }
    }

    pub fn set_cipher(&mut self, cipher: PayloadCipher) {
        self.cipher = Some(cipher);
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Highest cumulative ack observed from the peer.
    pub fn last_ack_in(&self) -> u16 {
        self.last_ack_in
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.out)
    }

    #[cfg(test)]
    fn seed_sequences(&mut self, send: u16, recv: u16) {
        self.next_send_seq = send;
        self.expected_recv_seq = recv;
    }

    /// Builds, records (when reliable) and queues one datagram.
    pub fn queue_message(&mut self, msg_type: u16, payload: &[u8], reliable: bool, now: Instant) {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let mut flags = 0u8;
        let mut body = payload.to_vec();
        if let Some(cipher) = &self.cipher {
            if !body.is_empty() {
                cipher.apply(seq, &mut body);
                flags |= PACKET_FLAG_ENCRYPTED;
            }
        }
        if reliable {
            flags |= PACKET_FLAG_RELIABLE;
        }
        let ack = self.expected_recv_seq.wrapping_sub(1);
        let datagram = build_game_datagram(flags, seq, ack, msg_type, &body);
        if reliable {
            self.unacked.insert(
                seq,
                UnackedPacket {
                    datagram: datagram.clone(),
                    last_send: now,
                    retries: 0,
                },
            );
            if self.unacked.len() > self.config.max_unacked {
                self.close_reason = Some("send window overflow, peer unresponsive".to_string());
            }
        }
        self.out.push(datagram);
    }

    fn queue_ack(&mut self, now: Instant) {
        self.queue_message(MSG_KEEPALIVE, &[], false, now);
    }

    /// Full receive path: ack processing, duplicate suppression, in-order
    /// release with buffering of early arrivals, decryption. Returns the
    /// messages now deliverable to the RPC layer, in order.
    pub fn on_datagram(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<(u16, Vec<u8>)>, TransportError> {
        let (header, payload) = parse_game_datagram(data).ok_or(TransportError::WireFormat)?;
        self.last_activity = now;
        self.process_ack(header.ack);

        let mut deliveries = Vec::new();
        if header.is_reliable() {
            let seq = header.seq;
            if self.seen_recently(seq) || seq_lt(seq, self.expected_recv_seq) {
                // Duplicate: re-ack so the peer stops resending.
                self.queue_ack(now);
            } else if seq == self.expected_recv_seq {
                self.note_seen(seq);
                self.expected_recv_seq = self.expected_recv_seq.wrapping_add(1);
                self.push_delivery(&mut deliveries, header.flags, header.msg_type, seq, payload.to_vec())?;
                while let Some((flags, msg_type, body)) =
                    self.recv_buffer.remove(&self.expected_recv_seq)
                {
                    let buffered_seq = self.expected_recv_seq;
                    self.note_seen(buffered_seq);
                    self.expected_recv_seq = self.expected_recv_seq.wrapping_add(1);
                    self.push_delivery(&mut deliveries, flags, msg_type, buffered_seq, body)?;
                }
                self.queue_ack(now);
            } else {
                let ahead = seq.wrapping_sub(self.expected_recv_seq);
                if ahead < self.config.window_size {
                    self.recv_buffer
                        .insert(seq, (header.flags, header.msg_type, payload.to_vec()));
                    self.queue_ack(now);
                }
                // Outside the window: drop without buffering.
            }
        } else {
            if self.seen_recently(header.seq) {
                return Ok(deliveries);
            }
            self.note_seen(header.seq);
            if header.msg_type != MSG_KEEPALIVE {
                self.push_delivery(
                    &mut deliveries,
                    header.flags,
                    header.msg_type,
                    header.seq,
                    payload.to_vec(),
                )?;
            }
        }
        Ok(deliveries)
    }

    /// Retransmission, liveness ping and idle timeout.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_activity) >= self.config.timeout {
            self.close_reason = Some("session timed out".to_string());
            return;
        }
        let mut resends = Vec::new();
        let mut exhausted = false;
        for packet in self.unacked.values_mut() {
            if now.duration_since(packet.last_send) < self.config.resend_interval {
                continue;
            }
            if packet.retries >= self.config.max_retries {
                exhausted = true;
                break;
            }
            packet.retries += 1;
            packet.last_send = now;
            resends.push(packet.datagram.clone());
        }
        if exhausted {
            self.close_reason = Some("retransmit limit reached".to_string());
            return;
        }
        self.out.extend(resends);

        let idle = now.duration_since(self.last_activity) >= self.config.ping_interval;
        if idle && now.duration_since(self.last_ping) >= self.config.ping_interval {
            self.last_ping = now;
            self.queue_ack(now);
        }
    }

    fn process_ack(&mut self, ack: u16) {
        let acked: Vec<u16> = self
            .unacked
            .keys()
            .copied()
            .filter(|&seq| seq_le(seq, ack))
            .collect();
        if !acked.is_empty() {
            self.last_ack_in = ack;
        }
        for seq in acked {
            self.unacked.remove(&seq);
        }
    }

    fn push_delivery(
        &mut self,
        deliveries: &mut Vec<(u16, Vec<u8>)>,
        flags: u8,
        msg_type: u16,
        seq: u16,
        mut body: Vec<u8>,
    ) -> Result<(), TransportError> {
        if flags & PACKET_FLAG_ENCRYPTED != 0 {
            let cipher = self.cipher.as_ref().ok_or(TransportError::Crypto)?;
            cipher.apply(seq, &mut body);
        }
        if msg_type != MSG_KEEPALIVE {
            deliveries.push((msg_type, body));
        }
        Ok(())
    }

    fn seen_recently(&self, seq: u16) -> bool {
        self.recent_seen.contains(&seq)
    }

    fn note_seen(&mut self, seq: u16) {
        self.recent_seen.push_back(seq);
        while self.recent_seen.len() > self.config.window_size as usize {
            self.recent_seen.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GameSessionState {
    Initial,
    Handshake,
    Connected,
    WorldLoading,
    InWorld,
    Disconnecting,
    Closed,
}

/// Cross-session work a session cannot do alone; the server routes these.
#[derive(Debug)]
pub enum SessionEvent {
    Broadcast {
        district: u8,
        message: OutboundMessage,
    },
    Whisper {
        handle: String,
        message: OutboundMessage,
    },
    Closed {
        reason: String,
    },
}

/// Shared collaborators of every game session.
pub struct GameContext {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionKeyTable>,
    pub world: Arc<WorldManager>,
    pub allocator: Arc<ObjectIdAllocator>,
    pub transport: TransportConfig,
    pub autosave: AutosaveConfig,
    /// Characters with a live player object (invariant: one each).
    pub live_characters: Arc<Mutex<HashSet<u64>>>,
}

impl GameContext {
    fn mark_live(&self, character_id: u64) -> bool {
        match self.live_characters.lock() {
            Ok(mut live) => live.insert(character_id),
            Err(poisoned) => poisoned.into_inner().insert(character_id),
        }
    }

    fn clear_live(&self, character_id: u64) {
        match self.live_characters.lock() {
            Ok(mut live) => {
                live.remove(&character_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&character_id);
            }
        }
    }
}

/// One client on the game port: datagram transport plus the player state
/// machine driving it.
pub struct GameSession {
    pub addr: SocketAddr,
    state: GameSessionState,
    transport: GameTransport,
    player: Option<PlayerObject>,
    autosave: AutosaveState,
    session_key: String,
    character_id: u64,
    epoch: Instant,
}

impl GameSession {
    pub fn new(
        addr: SocketAddr,
        config: TransportConfig,
        autosave: AutosaveConfig,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            state: GameSessionState::Initial,
            transport: GameTransport::new(config, now),
            player: None,
            autosave: AutosaveState::new(autosave, now),
            session_key: String::new(),
            character_id: 0,
            epoch: now,
        }
    }

    pub fn state(&self) -> GameSessionState {
        self.state
    }

    pub fn player(&self) -> Option<&PlayerObject> {
        self.player.as_ref()
    }

    pub fn character_id(&self) -> u64 {
        self.character_id
    }

    pub fn district(&self) -> Option<u8> {
        self.player.as_ref().map(|player| player.district())
    }

    pub fn handle(&self) -> Option<&str> {
        self.player.as_ref().map(|player| player.handle())
    }

    pub fn is_in_world(&self) -> bool {
        self.state == GameSessionState::InWorld
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.transport.take_outgoing()
    }

    fn now_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_millis() as u64
    }

    /// Queues a message for this client, respecting the pre-spawn queue.
    pub fn send(&mut self, message: OutboundMessage, now: Instant) {
        let pass_through = match self.player.as_mut() {
            Some(player) if self.state < GameSessionState::InWorld => {
                player.queue_message(message)
            }
            _ => Some(message),
        };
        if let Some(message) = pass_through {
            self.transport
                .queue_message(message.msg_type, &message.payload, message.reliable, now);
        }
    }

    /// One inbound datagram: transport release, then RPC dispatch.
    pub fn on_datagram(
        &mut self,
        ctx: &GameContext,
        data: &[u8],
        now: Instant,
    ) -> Vec<SessionEvent> {
        let released = match self.transport.on_datagram(data, now) {
            Ok(released) => released,
            Err(err) => {
                // Wire/crypto trouble: close without a response.
                logging::log_warn(&format!("game session {}: {}", self.addr, err));
                return self.begin_close(ctx, err.to_string(), now);
            }
        };
        let mut events = Vec::new();
        for (msg_type, payload) in released {
            events.extend(self.dispatch(ctx, msg_type, &payload, now));
            if self.state == GameSessionState::Closed {
                break;
            }
        }
        events
    }

    fn dispatch(
        &mut self,
        ctx: &GameContext,
        msg_type: u16,
        payload: &[u8],
        now: Instant,
    ) -> Vec<SessionEvent> {
        match (msg_type, self.state) {
            (MSG_GAME_HANDSHAKE, GameSessionState::Initial | GameSessionState::Handshake) => {
                self.handle_handshake(ctx, payload, now)
            }
            (MSG_REGION_LOAD, GameSessionState::Connected) => self.spawn_flow(ctx, now),
            (MSG_PLAYER_MOVEMENT, GameSessionState::InWorld) => {
                let Some(player) = self.player.as_mut() else {
                    return Vec::new();
                };
                match player.handle_movement(&ctx.world, payload) {
                    Some(update) => {
                        let district = player.district();
                        self.send(update.clone(), now);
                        vec![SessionEvent::Broadcast {
                            district,
                            message: update,
                        }]
                    }
                    None => {
                        logging::log_warn("player movement truncated");
                        Vec::new()
                    }
                }
            }
            (MSG_PLAYER_STATE, GameSessionState::InWorld) => {
                let Some(player) = self.player.as_mut() else {
                    return Vec::new();
                };
                match player.handle_state_update(&ctx.world, payload) {
                    Some(update) => {
                        let district = player.district();
                        vec![SessionEvent::Broadcast {
                            district,
                            message: update,
                        }]
                    }
                    None => Vec::new(),
                }
            }
            (MSG_PLAYER_COMMAND, GameSessionState::Connected | GameSessionState::InWorld) => {
                // Region-loaded arrives as a player command during loading.
                if self.state == GameSessionState::Connected {
                    if payload.first() == Some(&CMD_REGION_LOADED) {
                        return self.spawn_flow(ctx, now);
                    }
                    logging::log_warn("player command before spawn ignored");
                    return Vec::new();
                }
                let now_ms = self.now_ms(now);
                let Some(player) = self.player.as_mut() else {
                    return Vec::new();
                };
                let outcome = player.handle_command(&ctx.world, payload, now_ms);
                let district = player.district();
                let mut events = Vec::new();
                for (directed, message) in outcome.messages {
                    match directed {
                        Directed::ToSelf => self.send(message, now),
                        Directed::ToDistrict => events.push(SessionEvent::Broadcast {
                            district,
                            message,
                        }),
                        Directed::ToHandle(handle) => events.push(SessionEvent::Whisper {
                            handle,
                            message,
                        }),
                    }
                }
                events
            }
            (MSG_JACKOUT_REQUEST, GameSessionState::InWorld) => {
                let now_ms = self.now_ms(now);
                if let Some(player) = self.player.as_mut() {
                    player.add_event(
                        EventKind::Jackout,
                        now_ms + crate::entities::player::JACKOUT_DELAY_MS,
                    );
                }
                Vec::new()
            }
            (other, state) => {
                logging::log_warn(&format!(
                    "game message 0x{:04x} unexpected in state {:?}",
                    other, state
                ));
                Vec::new()
            }
        }
    }

    fn handle_handshake(
        &mut self,
        ctx: &GameContext,
        payload: &[u8],
        now: Instant,
    ) -> Vec<SessionEvent> {
        self.state = GameSessionState::Handshake;
        let mut reader = PacketReader::new(payload);
        let parsed = (|| {
            let key = reader.read_cstring_lossy()?;
            let character_id = reader.read_u64_le()?;
            Some((key, character_id))
        })();
        let Some((key, character_id)) = parsed else {
            logging::log_warn("game handshake truncated");
            return self.begin_close(ctx, "handshake truncated".to_string(), now);
        };

        if ctx.sessions.validate_character(&key, character_id).is_none() {
            self.transport
                .queue_message(MSG_GAME_SESSION, &session_result(1), true, now);
            return self.begin_close(ctx, "handshake key rejected".to_string(), now);
        }

        // One live player object per character, ever.
        if !ctx.mark_live(character_id) {
            logging::log_critical(&format!(
                "second game session for character {}; terminating it",
                character_id
            ));
            self.transport
                .queue_message(MSG_GAME_SESSION, &session_result(1), true, now);
            return self.begin_close(ctx, "character already in world".to_string(), now);
        }

        let character = match ctx.store.lookup_character(character_id) {
            Ok(Some(character)) => character,
            Ok(None) => {
                ctx.clear_live(character_id);
                self.transport
                    .queue_message(MSG_GAME_SESSION, &session_result(1), true, now);
                return self.begin_close(ctx, "character row missing".to_string(), now);
            }
            Err(err) => {
                ctx.clear_live(character_id);
                logging::log_error(&format!("character load failed: {}", err));
                self.transport
                    .queue_message(MSG_GAME_SESSION, &session_result(1), true, now);
                return self.begin_close(ctx, "store unavailable".to_string(), now);
            }
        };

        let mut player = PlayerObject::new(character, ctx.allocator.allocate());
        player.set_online(true);
        self.character_id = character_id;
        self.session_key = key.clone();
        self.player = Some(player);
        self.state = GameSessionState::Connected;
        // The session acknowledgement goes out in the clear; everything after
        // it is encrypted under the session cipher.
        self.transport
            .queue_message(MSG_GAME_SESSION, &session_result(0), true, now);
        self.transport
            .set_cipher(PayloadCipher::from_session_key(&key));
        logging::log_info(&format!(
            "game session {} bound to character {}",
            self.addr, character_id
        ));
        Vec::new()
    }

    /// InitializeWorld → SpawnSelf → PopulateWorld.
    fn spawn_flow(&mut self, ctx: &GameContext, now: Instant) -> Vec<SessionEvent> {
        self.state = GameSessionState::WorldLoading;
        let Some(player) = self.player.as_mut() else {
            return self.begin_close(ctx, "no player for spawn".to_string(), now);
        };
        player.initialize_world(&ctx.world);
        let spawn_broadcast = match player.spawn_self(&ctx.world) {
            Ok(message) => message,
            Err(err) => {
                logging::log_critical(&format!("spawn failed for {}: {}", self.addr, err));
                return self.begin_close(ctx, err, now);
            }
        };
        let district = player.district();
        // The client sees its own create first, then the surroundings.
        let own_create = spawn_broadcast.clone();
        let populate = player.populate_world(&ctx.world);
        self.state = GameSessionState::InWorld;
        self.send(own_create, now);
        for message in populate {
            self.send(message, now);
        }
        vec![SessionEvent::Broadcast {
            district,
            message: spawn_broadcast,
        }]
    }

    /// Timed work: transport retransmits/pings, player events, autosave.
    pub fn tick(&mut self, ctx: &GameContext, now: Instant) -> Vec<SessionEvent> {
        if self.state == GameSessionState::Closed {
            return Vec::new();
        }
        self.transport.tick(now);
        if self.transport.is_closed() {
            let reason = self
                .transport
                .close_reason()
                .unwrap_or("transport closed")
                .to_string();
            return self.begin_close(ctx, reason, now);
        }

        let now_ms = self.now_ms(now);
        let mut events = Vec::new();
        let fired = match self.player.as_mut() {
            Some(player) => player.drain_due_events(now_ms),
            None => Vec::new(),
        };
        for event in fired {
            match event {
                EventKind::Jackout => {
                    self.transport
                        .queue_message(MSG_JACKOUT_RESPONSE, &session_result(0), true, now);
                    events.extend(self.begin_close(ctx, "jackout".to_string(), now));
                    return events;
                }
            }
        }

        if self.autosave.due(now) {
            self.autosave.mark_saved(now);
            if let Some(player) = self.player.as_mut() {
                if let Err(err) = player.store_if_dirty(&ctx.store) {
                    logging::log_error(&format!(
                        "autosave failed for '{}': {}",
                        player.handle(),
                        err
                    ));
                }
            }
        }
        events
    }

    /// Cooperative close: persist, drop the world object, release the
    /// character and the session key. Safe to call more than once.
    pub fn begin_close(
        &mut self,
        ctx: &GameContext,
        reason: String,
        _now: Instant,
    ) -> Vec<SessionEvent> {
        if self.state == GameSessionState::Closed {
            return Vec::new();
        }
        self.state = GameSessionState::Disconnecting;
        let mut events = Vec::new();
        if let Some(player) = self.player.as_mut() {
            let object_id = player.object_id();
            let district = player.district();
            let was_spawned = player.is_spawned();
            if let Err(err) = player.store_offline(&ctx.store) {
                logging::log_error(&format!(
                    "final store failed for '{}': {}",
                    player.handle(),
                    err
                ));
            }
            if was_spawned {
                ctx.world.remove_object(object_id);
                events.push(SessionEvent::Broadcast {
                    district,
                    message: OutboundMessage::reliable(
                        MSG_OBJECT_DESTROY,
                        build_object_destroy(object_id),
                    ),
                });
            }
        }
        if self.character_id != 0 {
            ctx.clear_live(self.character_id);
        }
        if !self.session_key.is_empty() {
            ctx.sessions.invalidate(&self.session_key);
        }
        logging::log_info(&format!("game session {} closed: {}", self.addr, reason));
        self.state = GameSessionState::Closed;
        events.push(SessionEvent::Closed { reason });
        events
    }
}

fn session_result(code: u16) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u16_le(code);
    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::persistence::store::CharacterRecord;
    use crate::world::manager::builtin_districts;
    use crate::world::navmesh::NavMeshService;

    fn cfg() -> TransportConfig {
        TransportConfig::default()
    }

    fn now() -> Instant {
        Instant::now()
    }

    // ---- transport ----

    #[test]
    fn seq_compare_handles_wrap() {
        assert!(seq_le(5, 10));
        assert!(!seq_le(10, 5));
        assert!(seq_le(0xfffe, 0x0001));
        assert!(!seq_le(0x0001, 0xfffe));
        assert!(seq_lt(0xffff, 0x0000));
    }

    #[test]
    fn reliable_messages_deliver_in_order() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);

        sender.queue_message(MSG_CHAT_MESSAGE, b"one", true, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"two", true, t0);
        let datagrams = sender.take_outgoing();
        assert_eq!(datagrams.len(), 2);

        let first = receiver.on_datagram(&datagrams[0], t0).expect("first");
        assert_eq!(first, vec![(MSG_CHAT_MESSAGE, b"one".to_vec())]);
        let second = receiver.on_datagram(&datagrams[1], t0).expect("second");
        assert_eq!(second, vec![(MSG_CHAT_MESSAGE, b"two".to_vec())]);
    }

    #[test]
    fn acks_clear_the_unacked_map() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);

        sender.queue_message(MSG_CHAT_MESSAGE, b"payload", true, t0);
        assert_eq!(sender.unacked_len(), 1);
        let datagrams = sender.take_outgoing();
        receiver.on_datagram(&datagrams[0], t0).expect("receive");

        // The receiver queued a cumulative ack; feeding it back clears.
        let acks = receiver.take_outgoing();
        assert!(!acks.is_empty());
        sender.on_datagram(&acks[0], t0).expect("ack");
        assert_eq!(sender.unacked_len(), 0);
        assert_eq!(sender.last_ack_in(), 0);
    }

    #[test]
    fn duplicates_are_suppressed_and_reacked() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);

        sender.queue_message(MSG_CHAT_MESSAGE, b"once", true, t0);
        let datagram = sender.take_outgoing().remove(0);

        let first = receiver.on_datagram(&datagram, t0).expect("first");
        assert_eq!(first.len(), 1);
        receiver.take_outgoing();

        let second = receiver.on_datagram(&datagram, t0).expect("dup");
        assert!(second.is_empty());
        // Still acked so the sender stops retrying.
        assert!(!receiver.take_outgoing().is_empty());
    }

    #[test]
    fn out_of_order_arrivals_are_buffered_until_the_gap_fills() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);

        sender.queue_message(MSG_CHAT_MESSAGE, b"zero", true, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"one", true, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"two", true, t0);
        let datagrams = sender.take_outgoing();

        let early = receiver.on_datagram(&datagrams[2], t0).expect("early");
        assert!(early.is_empty());
        let gap_start = receiver.on_datagram(&datagrams[0], t0).expect("start");
        assert_eq!(gap_start, vec![(MSG_CHAT_MESSAGE, b"zero".to_vec())]);
        let rest = receiver.on_datagram(&datagrams[1], t0).expect("rest");
        assert_eq!(
            rest,
            vec![
                (MSG_CHAT_MESSAGE, b"one".to_vec()),
                (MSG_CHAT_MESSAGE, b"two".to_vec()),
            ]
        );
    }

    #[test]
    fn seq_wrap_does_not_reorder() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);
        sender.seed_sequences(0xfffe, 0);
        receiver.seed_sequences(0, 0xfffe);

        sender.queue_message(MSG_CHAT_MESSAGE, b"a", true, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"b", true, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"c", true, t0);
        let datagrams = sender.take_outgoing();

        // Deliver across the 0xFFFF -> 0x0000 boundary, last first.
        let early = receiver.on_datagram(&datagrams[2], t0).expect("early");
        assert!(early.is_empty());
        let a = receiver.on_datagram(&datagrams[0], t0).expect("a");
        assert_eq!(a, vec![(MSG_CHAT_MESSAGE, b"a".to_vec())]);
        let bc = receiver.on_datagram(&datagrams[1], t0).expect("bc");
        assert_eq!(
            bc,
            vec![
                (MSG_CHAT_MESSAGE, b"b".to_vec()),
                (MSG_CHAT_MESSAGE, b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn arrivals_outside_the_window_are_dropped() {
        let t0 = now();
        let mut receiver = GameTransport::new(cfg(), t0);
        let far = build_game_datagram(
            PACKET_FLAG_RELIABLE,
            500, // way past the 64-seq window
            0xffff,
            MSG_CHAT_MESSAGE,
            b"future",
        );
        let released = receiver.on_datagram(&far, t0).expect("far");
        assert!(released.is_empty());
        // No ack for something we refused to buffer.
        assert!(receiver.take_outgoing().is_empty());
    }

    #[test]
    fn retransmits_fire_then_exhaust_into_close() {
        let t0 = now();
        let mut config = cfg();
        config.max_retries = 2;
        let mut sender = GameTransport::new(config, t0);
        sender.queue_message(MSG_CHAT_MESSAGE, b"lost", true, t0);
        let original = sender.take_outgoing().remove(0);

        let t1 = t0 + Duration::from_millis(600);
        sender.tick(t1);
        let resends = sender.take_outgoing();
        assert_eq!(resends, vec![original.clone()]);

        let t2 = t1 + Duration::from_millis(600);
        sender.tick(t2);
        assert_eq!(sender.take_outgoing().len(), 1);

        let t3 = t2 + Duration::from_millis(600);
        sender.tick(t3);
        assert!(sender.is_closed());
        assert_eq!(sender.close_reason(), Some("retransmit limit reached"));
    }

    #[test]
    fn simulated_loss_still_delivers_exactly_once() {
        let t0 = now();
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);

        sender.queue_message(MSG_CHAT_MESSAGE, b"through the wire", true, t0);
        let original = sender.take_outgoing().remove(0);
        // Drop the first three transmissions; the resends eventually land,
        // and a late duplicate of the original changes nothing.
        let mut tick_at = t0;
        for _ in 0..3 {
            tick_at += Duration::from_millis(600);
            sender.tick(tick_at);
            let _lost = sender.take_outgoing();
        }
        tick_at += Duration::from_millis(600);
        sender.tick(tick_at);
        let resend = sender.take_outgoing().remove(0);
        let delivered = receiver.on_datagram(&resend, tick_at).expect("resend");
        assert_eq!(delivered.len(), 1);
        let dup = receiver.on_datagram(&original, tick_at).expect("dup");
        assert!(dup.is_empty());
    }

    #[test]
    fn idle_timeout_closes_the_session() {
        let t0 = now();
        let mut transport = GameTransport::new(cfg(), t0);
        transport.tick(t0 + Duration::from_secs(29));
        assert!(!transport.is_closed());
        transport.tick(t0 + Duration::from_secs(30));
        assert!(transport.is_closed());
        assert_eq!(transport.close_reason(), Some("session timed out"));
    }

    #[test]
    fn idle_ping_keeps_rtt_fresh() {
        let t0 = now();
        let mut transport = GameTransport::new(cfg(), t0);
        transport.tick(t0 + Duration::from_secs(6));
        let pings = transport.take_outgoing();
        assert_eq!(pings.len(), 1);
        let (header, payload) = parse_game_datagram(&pings[0]).expect("ping");
        assert_eq!(header.msg_type, MSG_KEEPALIVE);
        assert!(payload.is_empty());
        // Within the same interval no second ping fires.
        transport.tick(t0 + Duration::from_secs(7));
        assert!(transport.take_outgoing().is_empty());
    }

    #[test]
    fn unacked_overflow_closes_as_unresponsive() {
        let t0 = now();
        let mut transport = GameTransport::new(cfg(), t0);
        for i in 0..=256u32 {
            transport.queue_message(MSG_CHAT_MESSAGE, &i.to_le_bytes(), true, t0);
        }
        assert!(transport.is_closed());
    }

    #[test]
    fn encrypted_payloads_roundtrip_between_peers() {
        let t0 = now();
        let key = "SHAREDSESSIONKEY";
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);
        sender.set_cipher(PayloadCipher::from_session_key(key));
        receiver.set_cipher(PayloadCipher::from_session_key(key));

        sender.queue_message(MSG_CHAT_MESSAGE, b"follow the white rabbit", true, t0);
        let datagram = sender.take_outgoing().remove(0);
        let (header, payload) = parse_game_datagram(&datagram).expect("parse");
        assert!(header.is_encrypted());
        assert_ne!(payload, b"follow the white rabbit");

        let released = receiver.on_datagram(&datagram, t0).expect("deliver");
        assert_eq!(
            released,
            vec![(MSG_CHAT_MESSAGE, b"follow the white rabbit".to_vec())]
        );
    }

    #[test]
    fn encrypted_datagram_without_cipher_is_fatal() {
        let t0 = now();
        let key = "SHAREDSESSIONKEY";
        let mut sender = GameTransport::new(cfg(), t0);
        let mut receiver = GameTransport::new(cfg(), t0);
        sender.set_cipher(PayloadCipher::from_session_key(key));
        sender.queue_message(MSG_CHAT_MESSAGE, b"secret", true, t0);
        let datagram = sender.take_outgoing().remove(0);
        assert!(matches!(
            receiver.on_datagram(&datagram, t0),
            Err(TransportError::Crypto)
        ));
    }

    // ---- session ----

    fn game_context(tag: &str) -> (GameContext, std::path::PathBuf, String, u64) {
        let root = std::env::temp_dir().join(format!(
            "reality-game-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        let store = Arc::new(Store::open(&root).expect("store"));
        let character = store
            .insert_character(CharacterRecord::new_character(
                1,
                1,
                "Neo".to_string(),
                "Thomas".to_string(),
                "Anderson".to_string(),
                PROFESSION_HACKER,
                DISTRICT_RICHLAND,
            ))
            .expect("character");
        let sessions = Arc::new(SessionKeyTable::new());
        let key = crypto::generate_session_key();
        sessions.insert(key.clone(), 1);
        sessions.bind_character(&key, character.character_id);
        let ctx = GameContext {
            store,
            sessions,
            world: Arc::new(WorldManager::new(builtin_districts(), NavMeshService::new())),
            allocator: Arc::new(ObjectIdAllocator::new()),
            transport: TransportConfig::default(),
            autosave: AutosaveConfig { interval_seconds: 30 },
            live_characters: Arc::new(Mutex::new(HashSet::new())),
        };
        (ctx, root, key, character.character_id)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("addr")
    }

    fn client_handshake(key: &str, character_id: u64) -> Vec<u8> {
        let mut payload = PacketWriter::new();
        payload.write_cstring_str(key);
        payload.write_u64_le(character_id);
        build_game_datagram(PACKET_FLAG_RELIABLE, 0, 0xffff, MSG_GAME_HANDSHAKE, payload.as_slice())
    }

    fn region_loaded(seq: u16) -> Vec<u8> {
        build_game_datagram(
            PACKET_FLAG_RELIABLE,
            seq,
            0xffff,
            MSG_PLAYER_COMMAND,
            &[CMD_REGION_LOADED],
        )
    }

    /// Outgoing datagrams interleave with transport acks; pick one by type.
    fn find_datagram(
        outgoing: &[Vec<u8>],
        msg_type: u16,
    ) -> (crate::net::framing::GameHeader, Vec<u8>) {
        outgoing
            .iter()
            .filter_map(|d| parse_game_datagram(d))
            .find(|(header, _)| header.msg_type == msg_type)
            .map(|(header, payload)| (header, payload.to_vec()))
            .unwrap_or_else(|| panic!("no datagram of type 0x{:04x}", msg_type))
    }

    #[test]
    fn handshake_and_spawn_reach_in_world() {
        let (ctx, root, key, character_id) = game_context("spawn");
        let t0 = now();
        let mut session = GameSession::new(addr(), ctx.transport, ctx.autosave, t0);

        let events = session.on_datagram(&ctx, &client_handshake(&key, character_id), t0);
        assert!(events.is_empty());
        assert_eq!(session.state(), GameSessionState::Connected);
        let outgoing = session.take_outgoing();
        // GAME_SESSION(OK) goes out in the clear.
        let (header, payload) = find_datagram(&outgoing, MSG_GAME_SESSION);
        assert!(!header.is_encrypted());
        let mut reader = PacketReader::new(&payload);
        assert_eq!(reader.read_u16_le(), Some(0));

        let events = session.on_datagram(&ctx, &region_loaded(1), t0);
        assert_eq!(session.state(), GameSessionState::InWorld);
        // District peers are told about the new player.
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Broadcast { district: DISTRICT_RICHLAND, .. }]
        ));
        // First assigned object id.
        let player = session.player().expect("player");
        assert_eq!(
            player.object_id(),
            crate::entities::object::ObjectId(crate::entities::object::FIRST_OBJECT_ID)
        );
        assert!(ctx.world.get_object(player.object_id()).is_some());
        // The self-create went to the client, encrypted now.
        let outgoing = session.take_outgoing();
        let (header, _) = find_datagram(&outgoing, MSG_OBJECT_CREATE);
        assert!(header.is_encrypted());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn handshake_with_bad_key_is_rejected() {
        let (ctx, root, _key, character_id) = game_context("badkey");
        let t0 = now();
        let mut session = GameSession::new(addr(), ctx.transport, ctx.autosave, t0);
        let events = session.on_datagram(&ctx, &client_handshake("WRONGKEY", character_id), t0);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Closed { .. })
        ));
        assert_eq!(session.state(), GameSessionState::Closed);
        let outgoing = session.take_outgoing();
        let (_, payload) = find_datagram(&outgoing, MSG_GAME_SESSION);
        let mut reader = PacketReader::new(&payload);
        assert_eq!(reader.read_u16_le(), Some(1));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn second_session_for_same_character_is_terminated() {
        let (ctx, root, key, character_id) = game_context("duplicate");
        let t0 = now();
        let mut first = GameSession::new(addr(), ctx.transport, ctx.autosave, t0);
        first.on_datagram(&ctx, &client_handshake(&key, character_id), t0);
        assert_eq!(first.state(), GameSessionState::Connected);

        let other_addr: SocketAddr = "127.0.0.1:40001".parse().expect("addr");
        let mut second = GameSession::new(other_addr, ctx.transport, ctx.autosave, t0);
        let events = second.on_datagram(&ctx, &client_handshake(&key, character_id), t0);
        assert!(matches!(events.last(), Some(SessionEvent::Closed { .. })));
        assert_eq!(second.state(), GameSessionState::Closed);
        // The first session is untouched.
        assert_eq!(first.state(), GameSessionState::Connected);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn jackout_fires_after_delay_and_marks_offline() {
        let (ctx, root, key, character_id) = game_context("jackout");
        let t0 = now();
        let mut session = GameSession::new(addr(), ctx.transport, ctx.autosave, t0);
        session.on_datagram(&ctx, &client_handshake(&key, character_id), t0);
        session.on_datagram(&ctx, &region_loaded(1), t0);
        session.take_outgoing();

        let cipher = PayloadCipher::from_session_key(&key);
        let mut payload = vec![CMD_JACKOUT_REQUEST];
        cipher.apply(2, &mut payload);
        let jackout = build_game_datagram(
            PACKET_FLAG_RELIABLE | PACKET_FLAG_ENCRYPTED,
            2,
            0xffff,
            MSG_PLAYER_COMMAND,
            &payload,
        );
        session.on_datagram(&ctx, &jackout, t0);

        // Before the delay: still in world.
        let events = session.tick(&ctx, t0 + Duration::from_secs(4));
        assert!(events.is_empty());
        assert_eq!(session.state(), GameSessionState::InWorld);

        // After the delay: response, object destroyed, row offline.
        let events = session.tick(&ctx, t0 + Duration::from_secs(6));
        assert_eq!(session.state(), GameSessionState::Closed);
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Broadcast { .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Closed { .. })));
        let outgoing = session.take_outgoing();
        let types: Vec<u16> = outgoing
            .iter()
            .filter_map(|d| parse_game_datagram(d).map(|(h, _)| h.msg_type))
            .collect();
        assert!(types.contains(&MSG_JACKOUT_RESPONSE));
        let row = ctx
            .store
            .lookup_character(character_id)
            .expect("lookup")
            .expect("row");
        assert!(!row.is_online);
        assert_eq!(ctx.world.object_count(), 0);
        // The session key died with the session.
        assert!(ctx.sessions.validate(&key).is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn chat_command_produces_district_broadcast() {
        let (ctx, root, key, character_id) = game_context("chat");
        let t0 = now();
        let mut session = GameSession::new(addr(), ctx.transport, ctx.autosave, t0);
        session.on_datagram(&ctx, &client_handshake(&key, character_id), t0);
        session.on_datagram(&ctx, &region_loaded(1), t0);
        session.take_outgoing();

        let cipher = PayloadCipher::from_session_key(&key);
        let mut inner = PacketWriter::new();
        inner.write_u8(CMD_CHAT);
        inner.write_cstring_str("there is no spoon");
        let mut body = inner.into_vec();
        cipher.apply(2, &mut body);
        let chat = build_game_datagram(
            PACKET_FLAG_RELIABLE | PACKET_FLAG_ENCRYPTED,
            2,
            0xffff,
            MSG_PLAYER_COMMAND,
            &body,
        );
        let events = session.on_datagram(&ctx, &chat, t0);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Broadcast { district: DISTRICT_RICHLAND, .. }]
        ));
        let _ = std::fs::remove_dir_all(&root);
    }
}
