use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use crate::entities::object::{GameObject, ObjectId};
use crate::net::messages::*;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::persistence::store::{CharacterRecord, Store, StoreError};
use crate::telemetry::logging;
use crate::world::location::LocationVector;
use crate::world::manager::{WorldManager, DEFAULT_INTEREST_RANGE};

pub const JACKOUT_DELAY_MS: u64 = 5_000;
const MOVEMENT_SNAP_DISTANCE: f64 = 5.0;
const RSI_BLOB_LEN: usize = 21;

/// A message the transport should carry to some audience.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub msg_type: u16,
    pub payload: Vec<u8>,
    pub reliable: bool,
}

impl OutboundMessage {
    pub fn reliable(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            payload,
            reliable: true,
        }
    }
}

/// Who an outbound message is for.
#[derive(Debug, Clone, PartialEq)]
pub enum Directed {
    ToSelf,
    /// Every other player in the sender's district.
    ToDistrict,
    /// A specific player by handle (whisper).
    ToHandle(String),
}

#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub messages: Vec<(Directed, OutboundMessage)>,
    /// Set when the player's world object changed and peers need an update.
    pub world_update: bool,
}

impl CommandOutcome {
    fn to_self(message: OutboundMessage) -> Self {
        Self {
            messages: vec![(Directed::ToSelf, message)],
            world_update: false,
        }
    }

    fn ignored() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Jackout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PlayerEvent {
    fire_at_ms: u64,
    kind: EventKind,
}

/// A live character in the world, bound to one game session. Owns the
/// in-memory character row, the post-spawn message queue, the timed-event
/// heap and the dirty flag the autosave sweep reads.
pub struct PlayerObject {
    character: CharacterRecord,
    object_id: ObjectId,
    rsi: Vec<u8>,
    background: String,
    spawned: bool,
    world_populated: bool,
    send_after_spawn: VecDeque<OutboundMessage>,
    events: BinaryHeap<Reverse<PlayerEvent>>,
    current_animation: u8,
    current_mood: u8,
    emote_counter: u8,
    is_admin: bool,
    dirty: bool,
}

impl PlayerObject {
    pub fn new(character: CharacterRecord, object_id: ObjectId) -> Self {
        Self {
            character,
            object_id,
            rsi: vec![0u8; RSI_BLOB_LEN],
            background: String::new(),
            spawned: false,
            world_populated: false,
            send_after_spawn: VecDeque::new(),
            events: BinaryHeap::new(),
            current_animation: ANIM_STAND,
            current_mood: MOOD_NEUTRAL,
            emote_counter: 0,
            is_admin: false,
            dirty: false,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn character(&self) -> &CharacterRecord {
        &self.character
    }

    pub fn handle(&self) -> &str {
        &self.character.handle
    }

    pub fn district(&self) -> u8 {
        self.character.district
    }

    pub fn position(&self) -> LocationVector {
        self.character.position
    }

    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_admin(&mut self, admin: bool) {
        self.is_admin = admin;
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Clamps the stored position onto the navmesh before the world sees it.
    pub fn initialize_world(&mut self, world: &WorldManager) {
        let valid = world.closest_valid_position(
            &self.character.position,
            self.character.district,
            MOVEMENT_SNAP_DISTANCE * 4.0,
        );
        if valid != self.character.position {
            self.character.position = valid;
            self.dirty = true;
        }
    }

    /// Registers the player's world object and hands back the create message
    /// peers in the district should receive.
    pub fn spawn_self(&mut self, world: &WorldManager) -> Result<OutboundMessage, String> {
        let mut object = GameObject::new(
            self.object_id,
            OBJECT_TYPE_PLAYER,
            self.character.district,
            self.character.position,
        )
        .with_name(self.character.handle.clone());
        object.set_property("handle", self.character.handle.clone());
        world.add_object(object)?;
        self.spawned = true;
        Ok(OutboundMessage::reliable(
            MSG_OBJECT_CREATE,
            self.build_self_create(),
        ))
    }

    /// One `ObjectCreate` per in-range object, then the queue that piled up
    /// before the spawn completed.
    pub fn populate_world(&mut self, world: &WorldManager) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        let interest = world.interest_set(
            &self.character.position,
            self.character.district,
            DEFAULT_INTEREST_RANGE,
            self.object_id,
        );
        for object in &interest {
            out.push(OutboundMessage::reliable(
                MSG_OBJECT_CREATE,
                build_object_create(object),
            ));
        }
        while let Some(queued) = self.send_after_spawn.pop_front() {
            out.push(queued);
        }
        self.world_populated = true;
        out
    }

    /// Before the spawn completes, messages wait in the post-spawn queue.
    pub fn queue_message(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        if self.world_populated {
            Some(message)
        } else {
            self.send_after_spawn.push_back(message);
            None
        }
    }

    /// `PLAYER_MOVEMENT`: position + orientation, navmesh-validated.
    pub fn handle_movement(
        &mut self,
        world: &WorldManager,
        payload: &[u8],
    ) -> Option<OutboundMessage> {
        let mut reader = PacketReader::new(payload);
        let x = reader.read_f64_le()?;
        let y = reader.read_f64_le()?;
        let z = reader.read_f64_le()?;
        let o = reader.read_f64_le()?;
        let requested = LocationVector::with_orientation(x, y, z, o);
        let district = self.character.district;
        let accepted = if world.is_position_valid(&requested, district) {
            requested
        } else {
            world.closest_valid_position(&requested, district, MOVEMENT_SNAP_DISTANCE)
        };
        self.character.position = accepted;
        self.dirty = true;
        world.update_object_position(self.object_id, accepted, district);
        Some(OutboundMessage::reliable(
            MSG_OBJECT_UPDATE,
            self.build_self_update(),
        ))
    }

    /// `PLAYER_STATE`: replaces the object's state flags.
    pub fn handle_state_update(
        &mut self,
        world: &WorldManager,
        payload: &[u8],
    ) -> Option<OutboundMessage> {
        let mut reader = PacketReader::new(payload);
        let flags = reader.read_u32_le()?;
        world.update_object(self.object_id, |object| object.state_flags = flags);
        Some(OutboundMessage::reliable(
            MSG_OBJECT_UPDATE,
            self.build_self_update(),
        ))
    }

    /// `PLAYER_COMMAND` dispatch. The first byte selects the byte-command
    /// table; a zero marker byte selects the short-command table. Handlers
    /// consume the rest of the buffer; unknown ids are logged and ignored.
    pub fn handle_command(
        &mut self,
        world: &WorldManager,
        payload: &[u8],
        now_ms: u64,
    ) -> CommandOutcome {
        let mut reader = PacketReader::new(payload);
        let Some(first) = reader.read_u8() else {
            logging::log_warn("player command empty");
            return CommandOutcome::ignored();
        };
        if first == CMD_SHORT_MARKER {
            let Some(command) = reader.read_u16_le() else {
                logging::log_warn("short command missing id");
                return CommandOutcome::ignored();
            };
            return self.dispatch_short(command, &mut reader);
        }
        self.dispatch_byte(world, first, &mut reader, now_ms)
    }

    fn dispatch_byte(
        &mut self,
        world: &WorldManager,
        command: u8,
        reader: &mut PacketReader<'_>,
        now_ms: u64,
    ) -> CommandOutcome {
        match command {
            CMD_READY_FOR_SPAWN | CMD_REGION_LOADED | CMD_READY_FOR_WORLD_CHANGE => {
                // Session-level transitions; nothing to answer here.
                CommandOutcome::ignored()
            }
            CMD_CHAT => self.cmd_chat(reader),
            CMD_WHISPER => self.cmd_whisper(reader),
            CMD_STOP_ANIMATION => {
                self.current_animation = ANIM_STAND;
                self.broadcast_update()
            }
            CMD_START_ANIMATION => match reader.read_u8() {
                Some(animation) => {
                    self.current_animation = animation;
                    self.broadcast_update()
                }
                None => self.malformed("start animation"),
            },
            CMD_CHANGE_MOOD => match reader.read_u8() {
                Some(mood) => {
                    self.current_mood = mood;
                    self.broadcast_update()
                }
                None => self.malformed("change mood"),
            },
            CMD_PERFORM_EMOTE => self.cmd_emote(reader),
            CMD_DYNAMIC_OBJ_INTERACTION | CMD_STATIC_OBJ_INTERACTION => {
                self.cmd_interaction(world, reader)
            }
            CMD_JUMP => {
                self.current_animation = ANIM_JUMP;
                self.broadcast_update()
            }
            CMD_WHO => self.cmd_who(world),
            CMD_WHERE_AM_I => self.cmd_where_am_i(world),
            CMD_GET_PLAYER_DETAILS => self.cmd_player_details(world, reader),
            CMD_GET_BACKGROUND => CommandOutcome::to_self(system_chat(&self.background)),
            CMD_SET_BACKGROUND => match reader.read_cstring_lossy() {
                Some(background) => {
                    self.background = background;
                    self.dirty = true;
                    CommandOutcome::ignored()
                }
                None => self.malformed("set background"),
            },
            CMD_HARDLINE_TELEPORT => self.cmd_hardline_teleport(world, reader),
            CMD_OBJECT_SELECTED => match reader.read_u32_le() {
                Some(_) => CommandOutcome::ignored(),
                None => self.malformed("object selected"),
            },
            CMD_JACKOUT_REQUEST => {
                self.add_event(EventKind::Jackout, now_ms + JACKOUT_DELAY_MS);
                CommandOutcome::to_self(system_chat("Jacking out..."))
            }
            CMD_JACKOUT_FINISHED => CommandOutcome::ignored(),
            other => {
                logging::log_warn(&format!("unknown byte command 0x{:02x}", other));
                CommandOutcome::ignored()
            }
        }
    }

    fn dispatch_short(&mut self, command: u16, reader: &mut PacketReader<'_>) -> CommandOutcome {
        match command {
            CMD_ABILITY_USE => {
                let Some(ability) = reader.read_u16_le() else {
                    return self.malformed("ability use");
                };
                let _target = reader.read_u32_le();
                self.current_animation = ANIM_COMBAT_IDLE;
                logging::log_debug(&format!(
                    "'{}' used ability 0x{:04x}",
                    self.character.handle, ability
                ));
                self.broadcast_update()
            }
            CMD_TRADE_REQUEST | CMD_TRADE_ACCEPT | CMD_TRADE_DECLINE | CMD_TRADE_CANCEL
            | CMD_TRADE_ADD_ITEM | CMD_TRADE_REMOVE_ITEM | CMD_TRADE_SET_INFO
            | CMD_TRADE_CONFIRM => {
                CommandOutcome::to_self(system_chat("Trading is not available here."))
            }
            CMD_GROUP_INVITE | CMD_GROUP_ACCEPT | CMD_GROUP_DECLINE | CMD_GROUP_LEAVE
            | CMD_GROUP_KICK | CMD_GROUP_PROMOTE | CMD_GROUP_DISBAND => {
                CommandOutcome::to_self(system_chat("Groups are not available here."))
            }
            other => {
                logging::log_warn(&format!("unknown short command 0x{:04x}", other));
                CommandOutcome::ignored()
            }
        }
    }

    fn cmd_chat(&mut self, reader: &mut PacketReader<'_>) -> CommandOutcome {
        let Some(message) = reader.read_cstring_lossy() else {
            return self.malformed("chat");
        };
        let chat = OutboundMessage::reliable(
            MSG_CHAT_MESSAGE,
            build_chat_message(CHAT_SAY, &self.character.handle, &message),
        );
        CommandOutcome {
            messages: vec![
                (Directed::ToDistrict, chat.clone()),
                (Directed::ToSelf, chat),
            ],
            world_update: false,
        }
    }

    fn cmd_whisper(&mut self, reader: &mut PacketReader<'_>) -> CommandOutcome {
        let parsed = (|| {
            let recipient = reader.read_cstring_lossy()?;
            let message = reader.read_cstring_lossy()?;
            Some((recipient, message))
        })();
        let Some((recipient, message)) = parsed else {
            return self.malformed("whisper");
        };
        CommandOutcome {
            messages: vec![(
                Directed::ToHandle(recipient),
                OutboundMessage::reliable(
                    MSG_CHAT_MESSAGE,
                    build_chat_message(CHAT_WHISPER, &self.character.handle, &message),
                ),
            )],
            world_update: false,
        }
    }

    fn cmd_emote(&mut self, reader: &mut PacketReader<'_>) -> CommandOutcome {
        let Some(emote) = reader.read_u8() else {
            return self.malformed("emote");
        };
        self.emote_counter = self.emote_counter.wrapping_add(1);
        logging::log_debug(&format!(
            "'{}' emote 0x{:02x} ({} this session)",
            self.character.handle, emote, self.emote_counter
        ));
        self.current_animation = emote;
        self.broadcast_update()
    }

    fn cmd_interaction(
        &mut self,
        world: &WorldManager,
        reader: &mut PacketReader<'_>,
    ) -> CommandOutcome {
        let parsed = (|| {
            let object_id = reader.read_u32_le()?;
            let interaction = reader.read_u16_le()?;
            Some((object_id, interaction))
        })();
        let Some((object_id, interaction)) = parsed else {
            return self.malformed("object interaction");
        };
        let Some(object) = world.get_object(ObjectId(object_id)) else {
            return CommandOutcome::to_self(system_chat("There is nothing to use there."));
        };
        if object.district != self.character.district
            || object.position.distance(&self.character.position) > DEFAULT_INTEREST_RANGE
        {
            return CommandOutcome::to_self(system_chat("That is too far away."));
        }
        logging::log_debug(&format!(
            "'{}' interaction 0x{:04x} with object {}",
            self.character.handle, interaction, object.id
        ));
        CommandOutcome::to_self(OutboundMessage::reliable(
            MSG_OBJECT_UPDATE,
            build_object_update(&object, ANIM_STAND, MOOD_NEUTRAL),
        ))
    }

    fn cmd_who(&mut self, world: &WorldManager) -> CommandOutcome {
        let mut handles: Vec<String> = world
            .objects_in_district(self.character.district)
            .iter()
            .filter(|object| object.object_type == OBJECT_TYPE_PLAYER)
            .map(|object| object.name.clone())
            .collect();
        handles.sort();
        let listing = format!("{} online here: {}", handles.len(), handles.join(", "));
        CommandOutcome::to_self(system_chat(&listing))
    }

    fn cmd_where_am_i(&mut self, world: &WorldManager) -> CommandOutcome {
        let district_name = world
            .district(self.character.district)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("district {}", self.character.district));
        let pos = self.character.position;
        CommandOutcome::to_self(system_chat(&format!(
            "{} ({:.1}, {:.1}, {:.1})",
            district_name, pos.x, pos.y, pos.z
        )))
    }

    fn cmd_player_details(
        &mut self,
        world: &WorldManager,
        reader: &mut PacketReader<'_>,
    ) -> CommandOutcome {
        let Some(object_id) = reader.read_u32_le() else {
            return self.malformed("player details");
        };
        let Some(object) = world.get_object(ObjectId(object_id)) else {
            return CommandOutcome::to_self(system_chat("No such player."));
        };
        CommandOutcome::to_self(OutboundMessage::reliable(
            MSG_OBJECT_UPDATE,
            build_object_update(&object, ANIM_STAND, MOOD_NEUTRAL),
        ))
    }

    fn cmd_hardline_teleport(
        &mut self,
        world: &WorldManager,
        reader: &mut PacketReader<'_>,
    ) -> CommandOutcome {
        let Some(district) = reader.read_u8() else {
            return self.malformed("hardline teleport");
        };
        if world.district(district).is_none() {
            return CommandOutcome::to_self(system_chat("That hardline is offline."));
        }
        let destination = world.random_spawn_position(district);
        self.character.district = district;
        self.character.position = destination;
        self.dirty = true;
        world.update_object_position(self.object_id, destination, district);
        let mut outcome = self.broadcast_update();
        outcome
            .messages
            .push((Directed::ToSelf, system_chat("Hardline transfer complete.")));
        outcome
    }

    fn broadcast_update(&mut self) -> CommandOutcome {
        let update = OutboundMessage::reliable(MSG_OBJECT_UPDATE, self.build_self_update());
        CommandOutcome {
            messages: vec![
                (Directed::ToDistrict, update.clone()),
                (Directed::ToSelf, update),
            ],
            world_update: true,
        }
    }

    fn malformed(&mut self, what: &str) -> CommandOutcome {
        logging::log_warn(&format!("player command malformed: {}", what));
        CommandOutcome::ignored()
    }

    // ---- events ----

    pub fn add_event(&mut self, kind: EventKind, fire_at_ms: u64) {
        self.events.push(Reverse(PlayerEvent { fire_at_ms, kind }));
    }

    pub fn cancel_events(&mut self, kind: EventKind) -> usize {
        let before = self.events.len();
        let kept: Vec<_> = self
            .events
            .drain()
            .filter(|Reverse(event)| event.kind != kind)
            .collect();
        self.events = kept.into_iter().collect();
        before - self.events.len()
    }

    /// Fires every event whose time has come, earliest first.
    pub fn drain_due_events(&mut self, now_ms: u64) -> Vec<EventKind> {
        let mut fired = Vec::new();
        while let Some(Reverse(event)) = self.events.peek() {
            if event.fire_at_ms > now_ms {
                break;
            }
            let Some(Reverse(event)) = self.events.pop() else {
                break;
            };
            fired.push(event.kind);
        }
        fired
    }

    pub fn has_pending_event(&self, kind: EventKind) -> bool {
        self.events.iter().any(|Reverse(event)| event.kind == kind)
    }

    // ---- persistence ----

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Autosave sweep: persists only when something changed since the last
    /// store.
    pub fn store_if_dirty(&mut self, store: &Store) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        store.update_character_state(&self.character)?;
        self.dirty = false;
        Ok(true)
    }

    /// Final store on the way out; clears the online flag.
    pub fn store_offline(&mut self, store: &Store) -> Result<(), StoreError> {
        self.character.is_online = false;
        store.update_character_state(&self.character)?;
        self.dirty = false;
        Ok(())
    }

    pub fn set_online(&mut self, online: bool) {
        self.character.is_online = online;
        self.dirty = true;
    }

    // ---- wire builders ----

    fn build_self_create(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        write_object_header(
            &mut writer,
            self.object_id.0,
            OBJECT_TYPE_PLAYER,
            &self.character.position,
            self.character.district,
            &self.character.handle,
            1.0,
            0,
        );
        writer.write_u8(self.character.level);
        writer.write_u8(self.character.profession);
        writer.write_u8(self.rsi.len() as u8);
        writer.write_bytes(&self.rsi);
        writer.into_vec()
    }

    fn build_self_update(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.write_u32_le(self.object_id.0);
        write_location(&mut writer, &self.character.position);
        writer.write_u8(self.current_animation);
        writer.write_u8(self.current_mood);
        writer.write_u32_le(0);
        writer.into_vec()
    }
}

fn write_location(writer: &mut PacketWriter, position: &LocationVector) {
    writer.write_f64_le(position.x);
    writer.write_f64_le(position.y);
    writer.write_f64_le(position.z);
    writer.write_f64_le(position.o);
}

#[allow(clippy::too_many_arguments)]
fn write_object_header(
    writer: &mut PacketWriter,
    object_id: u32,
    object_type: u16,
    position: &LocationVector,
    district: u8,
    name: &str,
    scale: f32,
    state_flags: u32,
) {
    writer.write_u32_le(object_id);
    writer.write_u16_le(object_type);
    write_location(writer, position);
    writer.write_u8(district);
    writer.write_cstring_str(name);
    writer.write_f32_le(scale);
    writer.write_u32_le(state_flags);
}

pub fn build_object_create(object: &GameObject) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    write_object_header(
        &mut writer,
        object.id.0,
        object.object_type,
        &object.position,
        object.district,
        &object.name,
        object.scale,
        object.state_flags,
    );
    writer.into_vec()
}

pub fn build_object_update(object: &GameObject, animation: u8, mood: u8) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(object.id.0);
    write_location(&mut writer, &object.position);
    writer.write_u8(animation);
    writer.write_u8(mood);
    writer.write_u32_le(object.state_flags);
    writer.into_vec()
}

pub fn build_object_destroy(object_id: ObjectId) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(object_id.0);
    writer.into_vec()
}

pub fn build_chat_message(chat_type: u8, sender: &str, message: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(chat_type);
    writer.write_cstring_str(sender);
    writer.write_cstring_str(message);
    writer.into_vec()
}

fn system_chat(message: &str) -> OutboundMessage {
    OutboundMessage::reliable(
        MSG_CHAT_MESSAGE,
        build_chat_message(CHAT_SYSTEM, "", message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::object::ObjectIdAllocator;
    use crate::world::manager::{builtin_districts, WorldManager};
    use crate::world::navmesh::NavMeshService;

    fn world() -> (WorldManager, ObjectIdAllocator) {
        (
            WorldManager::new(builtin_districts(), NavMeshService::new()),
            ObjectIdAllocator::new(),
        )
    }

    fn neo(allocator: &ObjectIdAllocator) -> PlayerObject {
        let mut character = CharacterRecord::new_character(
            1,
            1,
            "Neo".to_string(),
            "Thomas".to_string(),
            "Anderson".to_string(),
            PROFESSION_HACKER,
            DISTRICT_RICHLAND,
        );
        character.character_id = 7;
        PlayerObject::new(character, allocator.allocate())
    }

    #[test]
    fn spawn_and_populate_deliver_interest_set() {
        let (world, allocator) = world();
        // A bystander NPC nearby and one far away.
        let near = allocator.allocate();
        world
            .add_object(
                GameObject::new(
                    near,
                    OBJECT_TYPE_NPC,
                    DISTRICT_RICHLAND,
                    LocationVector::new(5.0, 0.0, 0.0),
                )
                .with_name("Oracle"),
            )
            .expect("near npc");
        let far = allocator.allocate();
        world
            .add_object(GameObject::new(
                far,
                OBJECT_TYPE_NPC,
                DISTRICT_RICHLAND,
                LocationVector::new(5000.0, 0.0, 0.0),
            ))
            .expect("far npc");

        let mut player = neo(&allocator);
        player.initialize_world(&world);
        let create = player.spawn_self(&world).expect("spawn");
        assert_eq!(create.msg_type, MSG_OBJECT_CREATE);
        assert!(player.is_spawned());
        assert!(world.get_object(player.object_id()).is_some());

        // A message arriving before populate waits in the queue.
        assert!(player
            .queue_message(OutboundMessage::reliable(MSG_CHAT_MESSAGE, vec![1]))
            .is_none());

        let messages = player.populate_world(&world);
        // Near NPC create + flushed queued message; far NPC filtered out.
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, MSG_OBJECT_CREATE);
        let mut reader = PacketReader::new(&messages[0].payload);
        assert_eq!(reader.read_u32_le(), Some(near.0));
        assert_eq!(messages[1].msg_type, MSG_CHAT_MESSAGE);

        // After populate, messages pass straight through.
        assert!(player
            .queue_message(OutboundMessage::reliable(MSG_CHAT_MESSAGE, vec![2]))
            .is_some());
    }

    #[test]
    fn movement_updates_world_and_marks_dirty() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        player.spawn_self(&world).expect("spawn");

        let mut payload = PacketWriter::new();
        payload.write_f64_le(10.0);
        payload.write_f64_le(20.0);
        payload.write_f64_le(0.0);
        payload.write_f64_le(1.5);
        let update = player
            .handle_movement(&world, payload.as_slice())
            .expect("movement");
        assert_eq!(update.msg_type, MSG_OBJECT_UPDATE);
        assert!(player.is_dirty());
        assert_eq!(player.position().x, 10.0);
        let in_world = world.get_object(player.object_id()).expect("object");
        assert_eq!(in_world.position.x, 10.0);
        assert_eq!(in_world.position.y, 20.0);
    }

    #[test]
    fn chat_command_goes_to_district_and_self() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        player.spawn_self(&world).expect("spawn");

        let mut payload = PacketWriter::new();
        payload.write_u8(CMD_CHAT);
        payload.write_cstring_str("there is no spoon");
        let outcome = player.handle_command(&world, payload.as_slice(), 0);
        assert_eq!(outcome.messages.len(), 2);
        assert!(matches!(outcome.messages[0].0, Directed::ToDistrict));
        assert!(matches!(outcome.messages[1].0, Directed::ToSelf));
        let mut reader = PacketReader::new(&outcome.messages[0].1.payload);
        assert_eq!(reader.read_u8(), Some(CHAT_SAY));
        assert_eq!(reader.read_cstring_lossy().as_deref(), Some("Neo"));
        assert_eq!(
            reader.read_cstring_lossy().as_deref(),
            Some("there is no spoon")
        );
    }

    #[test]
    fn whisper_routes_by_handle() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        let mut payload = PacketWriter::new();
        payload.write_u8(CMD_WHISPER);
        payload.write_cstring_str("Trinity");
        payload.write_cstring_str("follow the white rabbit");
        let outcome = player.handle_command(&world, payload.as_slice(), 0);
        assert_eq!(outcome.messages.len(), 1);
        match &outcome.messages[0].0 {
            Directed::ToHandle(handle) => assert_eq!(handle, "Trinity"),
            other => panic!("expected handle routing, got {:?}", other),
        }
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        let outcome = player.handle_command(&world, &[0xee], 0);
        assert!(outcome.messages.is_empty());
        // Short command table: unknown id likewise ignored.
        let mut payload = PacketWriter::new();
        payload.write_u8(CMD_SHORT_MARKER);
        payload.write_u16_le(0x7777);
        let outcome = player.handle_command(&world, payload.as_slice(), 0);
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn short_command_dispatch_reads_marker() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        player.spawn_self(&world).expect("spawn");
        let mut payload = PacketWriter::new();
        payload.write_u8(CMD_SHORT_MARKER);
        payload.write_u16_le(CMD_ABILITY_USE);
        payload.write_u16_le(0x0042);
        payload.write_u32_le(0);
        let outcome = player.handle_command(&world, payload.as_slice(), 0);
        assert!(outcome.world_update);
    }

    #[test]
    fn jackout_schedules_and_fires_event() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        let outcome = player.handle_command(&world, &[CMD_JACKOUT_REQUEST], 1_000);
        assert_eq!(outcome.messages.len(), 1);
        assert!(player.has_pending_event(EventKind::Jackout));

        assert!(player.drain_due_events(1_000 + JACKOUT_DELAY_MS - 1).is_empty());
        let fired = player.drain_due_events(1_000 + JACKOUT_DELAY_MS);
        assert_eq!(fired, vec![EventKind::Jackout]);
        assert!(!player.has_pending_event(EventKind::Jackout));
    }

    #[test]
    fn jackout_can_be_cancelled() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        player.handle_command(&world, &[CMD_JACKOUT_REQUEST], 0);
        assert_eq!(player.cancel_events(EventKind::Jackout), 1);
        assert!(player.drain_due_events(u64::MAX).is_empty());
    }

    #[test]
    fn hardline_teleport_moves_district() {
        let (world, allocator) = world();
        let mut player = neo(&allocator);
        player.spawn_self(&world).expect("spawn");
        let mut payload = PacketWriter::new();
        payload.write_u8(CMD_HARDLINE_TELEPORT);
        payload.write_u8(DISTRICT_DOWNTOWN);
        let outcome = player.handle_command(&world, payload.as_slice(), 0);
        assert!(outcome.world_update);
        assert_eq!(player.district(), DISTRICT_DOWNTOWN);
        let in_world = world.get_object(player.object_id()).expect("object");
        assert_eq!(in_world.district, DISTRICT_DOWNTOWN);
        assert!(world.partition_consistent());
    }

    #[test]
    fn autosave_persists_only_dirty_players() {
        let root = std::env::temp_dir().join(format!(
            "reality-player-save-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        let store = Store::open(&root).expect("store");
        let created = store
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
        let allocator = ObjectIdAllocator::new();
        let mut player = PlayerObject::new(created, allocator.allocate());

        // Clean player: nothing to do.
        assert!(!player.store_if_dirty(&store).expect("store"));

        player.set_online(true);
        assert!(player.store_if_dirty(&store).expect("store"));
        assert!(!player.is_dirty());
        let row = store
            .lookup_character(player.character().character_id)
            .expect("lookup")
            .expect("row");
        assert!(row.is_online);
        // No change since the last sweep: skipped again.
        assert!(!player.store_if_dirty(&store).expect("store"));

        player.store_offline(&store).expect("offline");
        let row = store
            .lookup_character(player.character().character_id)
            .expect("lookup")
            .expect("row");
        assert!(!row.is_online);
        let _ = std::fs::remove_dir_all(&root);
    }
}
