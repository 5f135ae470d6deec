use std::sync::Arc;

use crate::dialogue::{AppliedEffect, DialogueEngine, DialogueError};
use crate::missions::{MissionEngine, MissionError, MissionReward, PlayerProfile};
use crate::net::messages::*;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::session_keys::SessionKeyTable;
use crate::persistence::store::{CharacterRecord, Store};
use crate::telemetry::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MarginState {
    Initial,
    Connected,
    Authenticated,
    Closed,
}

/// Shared collaborators of every margin session.
pub struct MarginContext {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionKeyTable>,
    pub missions: Arc<MissionEngine>,
    pub dialogue: Arc<DialogueEngine>,
}

#[derive(Debug, Default)]
pub struct MarginReply {
    pub frames: Vec<(u16, Vec<u8>)>,
    pub close: bool,
}

impl MarginReply {
    fn send(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            frames: vec![(msg_type, payload)],
            close: false,
        }
    }

    fn close_silently() -> Self {
        Self {
            frames: Vec::new(),
            close: true,
        }
    }

    fn send_and_close(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            frames: vec![(msg_type, payload)],
            close: true,
        }
    }
}

/// Mission and dialogue RPCs for one client, joined mid-session with the key
/// Auth minted. The session carries the margin-side view of the player:
/// the character row plus the in-session item/skill grants gates read.
pub struct MarginSession {
    state: MarginState,
    account_id: u32,
    character_id: u64,
    character: Option<CharacterRecord>,
    profile: PlayerProfile,
    current_dialogue: u32,
}

impl Default for MarginSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MarginSession {
    pub fn new() -> Self {
        Self {
            state: MarginState::Initial,
            account_id: 0,
            character_id: 0,
            character: None,
            profile: PlayerProfile::default(),
            current_dialogue: 0,
        }
    }

    pub fn state(&self) -> MarginState {
        self.state
    }

    /// Socket accepted.
    pub fn on_connect(&mut self) {
        if self.state == MarginState::Initial {
            self.state = MarginState::Connected;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == MarginState::Authenticated
    }

    pub fn player_id(&self) -> u32 {
        self.profile.player_id
    }

    pub fn account_id(&self) -> u32 {
        self.account_id
    }

    pub fn character_id(&self) -> u64 {
        self.character_id
    }

    /// The entry the conversation currently sits on; 0 between conversations.
    pub fn current_dialogue(&self) -> u32 {
        self.current_dialogue
    }

    pub fn on_message(&mut self, ctx: &MarginContext, msg_type: u16, payload: &[u8]) -> MarginReply {
        match (msg_type, self.state) {
            (MSG_GAME_HANDSHAKE, MarginState::Connected) => self.handle_announce(ctx, payload),
            (MSG_MISSION_LIST_REQUEST, MarginState::Authenticated) => self.handle_mission_list(ctx),
            (MSG_MISSION_ACCEPT, MarginState::Authenticated) => {
                self.handle_mission_accept(ctx, payload)
            }
            (MSG_MISSION_UPDATE, MarginState::Authenticated) => {
                self.handle_mission_update(ctx, payload)
            }
            (MSG_MISSION_COMPLETE, MarginState::Authenticated) => {
                self.handle_mission_complete(ctx, payload)
            }
            (MSG_DIALOGUE_REQUEST, MarginState::Authenticated) => {
                self.handle_dialogue_request(ctx, payload)
            }
            (MSG_DIALOGUE_CHOICE, MarginState::Authenticated) => {
                self.handle_dialogue_choice(ctx, payload)
            }
            (other, state) => {
                logging::log_warn(&format!(
                    "margin message 0x{:04x} unexpected in state {:?}",
                    other, state
                ));
                self.state = MarginState::Closed;
                MarginReply::close_silently()
            }
        }
    }

    /// Session announce rides the handshake frame: key + character id,
    /// validated against the table Auth populated.
    fn handle_announce(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let parsed = (|| {
            let key = reader.read_cstring_lossy()?;
            let character_id = reader.read_u64_le()?;
            Some((key, character_id))
        })();
        let Some((key, character_id)) = parsed else {
            logging::log_warn("margin announce truncated");
            self.state = MarginState::Closed;
            return MarginReply::close_silently();
        };
        let Some(entry) = ctx.sessions.validate_character(&key, character_id) else {
            self.state = MarginState::Closed;
            return MarginReply::send_and_close(MSG_GAME_SESSION, result_payload(1));
        };
        let character = match ctx.store.lookup_character(character_id) {
            Ok(Some(character)) => character,
            Ok(None) => {
                self.state = MarginState::Closed;
                return MarginReply::send_and_close(MSG_GAME_SESSION, result_payload(1));
            }
            Err(err) => {
                logging::log_error(&format!("margin character load failed: {}", err));
                self.state = MarginState::Closed;
                return MarginReply::send_and_close(MSG_GAME_SESSION, result_payload(1));
            }
        };

        self.account_id = entry.account_id;
        self.character_id = character_id;
        self.profile = PlayerProfile {
            player_id: character_id as u32,
            level: character.level,
            profession: character.profession,
            faction: character.alignment,
            items: Vec::new(),
            skills: Default::default(),
            districts: crate::world::manager::builtin_districts()
                .iter()
                .map(|d| d.id)
                .collect(),
        };
        self.character = Some(character);
        self.state = MarginState::Authenticated;
        logging::log_info(&format!(
            "margin session bound to character {}",
            character_id
        ));
        MarginReply::send(MSG_GAME_SESSION, result_payload(0))
    }

    fn handle_mission_list(&mut self, ctx: &MarginContext) -> MarginReply {
        let available = ctx.missions.available_missions(&self.profile, unix_now());
        let active = ctx.missions.active_missions(self.profile.player_id);
        let mut writer = PacketWriter::new();
        writer.write_u16_le(available.len() as u16);
        for mission_id in &available {
            writer.write_u32_le(*mission_id);
        }
        writer.write_u16_le(active.len() as u16);
        for instance in &active {
            writer.write_u32_le(instance.mission_id);
            let mut objectives: Vec<(u32, u32)> = instance
                .objective_progress
                .iter()
                .map(|(id, progress)| (*id, *progress))
                .collect();
            objectives.sort_unstable();
            writer.write_u8(objectives.len() as u8);
            for (objective_id, progress) in objectives {
                let target = ctx
                    .missions
                    .definition(instance.mission_id)
                    .and_then(|def| def.objectives.iter().find(|o| o.id == objective_id))
                    .map(|o| o.target_value)
                    .unwrap_or(0);
                writer.write_u32_le(objective_id);
                writer.write_u32_le(progress);
                writer.write_u32_le(target);
            }
        }
        MarginReply::send(MSG_MISSION_LIST_RESPONSE, writer.into_vec())
    }

    fn handle_mission_accept(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let Some(mission_id) = reader.read_u32_le() else {
            return self.wire_error("mission accept truncated");
        };
        match ctx.missions.start_mission(&self.profile, mission_id, unix_now()) {
            Ok(()) => MarginReply::send(
                MSG_MISSION_UPDATE,
                mission_update_payload(ctx, self.profile.player_id, mission_id, 0),
            ),
            Err(err) => {
                logging::log_debug(&format!(
                    "mission {} accept rejected for {}: {}",
                    mission_id, self.profile.player_id, err
                ));
                MarginReply::send(
                    MSG_MISSION_UPDATE,
                    mission_update_payload(ctx, self.profile.player_id, mission_id, mission_error_code(&err)),
                )
            }
        }
    }

    fn handle_mission_update(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let parsed = (|| {
            let mission_id = reader.read_u32_le()?;
            let objective_id = reader.read_u32_le()?;
            let delta = reader.read_u32_le()?;
            Some((mission_id, objective_id, delta))
        })();
        let Some((mission_id, objective_id, delta)) = parsed else {
            return self.wire_error("mission update truncated");
        };
        match ctx.missions.update_objective_progress(
            self.profile.player_id,
            mission_id,
            objective_id,
            delta,
        ) {
            Ok(progress) => {
                if let Some(reward) = &progress.just_completed {
                    self.grant_reward(ctx, reward.clone());
                }
                MarginReply::send(
                    MSG_MISSION_UPDATE,
                    mission_update_payload(ctx, self.profile.player_id, mission_id, 0),
                )
            }
            Err(err) => MarginReply::send(
                MSG_MISSION_UPDATE,
                mission_update_payload(ctx, self.profile.player_id, mission_id, mission_error_code(&err)),
            ),
        }
    }

    fn handle_mission_complete(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let Some(mission_id) = reader.read_u32_le() else {
            return self.wire_error("mission complete truncated");
        };
        match ctx
            .missions
            .complete_mission(self.profile.player_id, mission_id, unix_now())
        {
            Ok(reward) => {
                self.grant_reward(ctx, reward.clone());
                let mut writer = PacketWriter::new();
                writer.write_u32_le(mission_id);
                writer.write_u16_le(0);
                writer.write_u64_le(reward.experience);
                writer.write_u64_le(reward.information);
                writer.write_u8(reward.items.len() as u8);
                for item in &reward.items {
                    writer.write_u32_le(*item);
                }
                MarginReply::send(MSG_MISSION_COMPLETE, writer.into_vec())
            }
            Err(err) => {
                let mut writer = PacketWriter::new();
                writer.write_u32_le(mission_id);
                writer.write_u16_le(mission_error_code(&err));
                writer.write_u64_le(0);
                writer.write_u64_le(0);
                writer.write_u8(0);
                MarginReply::send(MSG_MISSION_COMPLETE, writer.into_vec())
            }
        }
    }

    fn handle_dialogue_request(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let Some(npc_id) = reader.read_u32_le() else {
            return self.wire_error("dialogue request truncated");
        };
        match ctx
            .dialogue
            .request_dialogue(&self.profile, &ctx.missions, npc_id, unix_now())
        {
            Ok(Some(outcome)) => {
                self.apply_effects(ctx, &outcome.effects);
                self.current_dialogue = outcome.next_dialogue_id;
                MarginReply::send(
                    MSG_DIALOGUE_RESPONSE,
                    dialogue_payload(ctx, &self.profile, outcome.next_dialogue_id),
                )
            }
            Ok(None) => MarginReply::send(MSG_DIALOGUE_RESPONSE, dialogue_payload(ctx, &self.profile, 0)),
            Err(err) => {
                logging::log_warn(&format!("dialogue request failed: {}", err));
                MarginReply::send(MSG_DIALOGUE_RESPONSE, dialogue_payload(ctx, &self.profile, 0))
            }
        }
    }

    fn handle_dialogue_choice(&mut self, ctx: &MarginContext, payload: &[u8]) -> MarginReply {
        let mut reader = PacketReader::new(payload);
        let parsed = (|| {
            let dialogue_id = reader.read_u32_le()?;
            let option_id = reader.read_u32_le()?;
            Some((dialogue_id, option_id))
        })();
        let Some((dialogue_id, option_id)) = parsed else {
            return self.wire_error("dialogue choice truncated");
        };
        match ctx.dialogue.select_option(
            &self.profile,
            &ctx.missions,
            dialogue_id,
            option_id,
            unix_now(),
        ) {
            Ok(outcome) => {
                self.apply_effects(ctx, &outcome.effects);
                self.current_dialogue = outcome.next_dialogue_id;
                MarginReply::send(
                    MSG_DIALOGUE_RESPONSE,
                    dialogue_payload(ctx, &self.profile, outcome.next_dialogue_id),
                )
            }
            Err(DialogueError::Store(err)) => {
                logging::log_error(&format!("dialogue choice store failure: {}", err));
                self.state = MarginState::Closed;
                MarginReply::close_silently()
            }
            Err(err) => {
                logging::log_debug(&format!(
                    "dialogue choice rejected for {}: {}",
                    self.profile.player_id, err
                ));
                // Rejected choice re-presents the current entry.
                MarginReply::send(
                    MSG_DIALOGUE_RESPONSE,
                    dialogue_payload(ctx, &self.profile, dialogue_id),
                )
            }
        }
    }

    /// Mission rewards land on the character row immediately.
    fn grant_reward(&mut self, ctx: &MarginContext, reward: MissionReward) {
        let Some(character) = self.character.as_mut() else {
            return;
        };
        character.experience += reward.experience;
        character.information += reward.information;
        self.profile.items.extend_from_slice(&reward.items);
        if let Err(err) = ctx.store.update_character_state(character) {
            logging::log_error(&format!("reward store failed: {}", err));
        }
    }

    fn apply_effects(&mut self, ctx: &MarginContext, effects: &[AppliedEffect]) {
        let mut row_changed = false;
        for effect in effects {
            match effect {
                AppliedEffect::MissionStarted(_) => {}
                AppliedEffect::MissionCompleted { reward, .. } => {
                    if let Some(character) = self.character.as_mut() {
                        character.experience += reward.experience;
                        character.information += reward.information;
                        row_changed = true;
                    }
                    self.profile.items.extend_from_slice(&reward.items);
                }
                AppliedEffect::ItemGiven(item) => self.profile.items.push(*item),
                AppliedEffect::ItemTaken(item) => {
                    if let Some(idx) = self.profile.items.iter().position(|i| i == item) {
                        self.profile.items.swap_remove(idx);
                    }
                }
                AppliedEffect::Teleported { district, position } => {
                    if let Some(character) = self.character.as_mut() {
                        character.district = *district;
                        character.position = *position;
                        row_changed = true;
                    }
                }
                AppliedEffect::ShopOpened(shop) => {
                    logging::log_debug(&format!(
                        "player {} opened shop {}",
                        self.profile.player_id, shop
                    ));
                }
                AppliedEffect::SkillTrained { skill_id, level } => {
                    self.profile.skills.insert(*skill_id, *level);
                }
                AppliedEffect::FactionSet(faction) => {
                    self.profile.faction = *faction;
                    if let Some(character) = self.character.as_mut() {
                        character.alignment = *faction;
                        row_changed = true;
                    }
                }
            }
        }
        if row_changed {
            if let Some(character) = self.character.as_ref() {
                if let Err(err) = ctx.store.update_character_state(character) {
                    logging::log_error(&format!("effect store failed: {}", err));
                }
            }
        }
    }

    fn wire_error(&mut self, what: &str) -> MarginReply {
        logging::log_warn(&format!("margin session: {}", what));
        self.state = MarginState::Closed;
        MarginReply::close_silently()
    }
}

fn result_payload(code: u16) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u16_le(code);
    writer.into_vec()
}

fn mission_error_code(err: &MissionError) -> u16 {
    match err {
        MissionError::UnknownMission(_) => 1,
        MissionError::UnknownObjective(_) => 2,
        MissionError::AlreadyActive => 3,
        MissionError::PrerequisitesNotMet => 4,
        MissionError::CooldownActive => 5,
        MissionError::NotActive => 6,
        MissionError::AlreadyFailed => 7,
        MissionError::ObjectivesIncomplete => 8,
        MissionError::Store(_) => 9,
    }
}

fn mission_update_payload(
    ctx: &MarginContext,
    player_id: u32,
    mission_id: u32,
    result: u16,
) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(mission_id);
    writer.write_u16_le(result);
    match ctx.missions.mission_instance(player_id, mission_id) {
        Some(instance) => {
            let mut objectives: Vec<(u32, u32)> = instance
                .objective_progress
                .iter()
                .map(|(id, progress)| (*id, *progress))
                .collect();
            objectives.sort_unstable();
            writer.write_u8(objectives.len() as u8);
            for (objective_id, progress) in objectives {
                let target = ctx
                    .missions
                    .definition(mission_id)
                    .and_then(|def| def.objectives.iter().find(|o| o.id == objective_id))
                    .map(|o| o.target_value)
                    .unwrap_or(0);
                writer.write_u32_le(objective_id);
                writer.write_u32_le(progress);
                writer.write_u32_le(target);
            }
        }
        None => writer.write_u8(0),
    }
    writer.into_vec()
}

/// Entry text plus the options this player can currently take. Dialogue 0 is
/// the end-of-conversation marker.
fn dialogue_payload(ctx: &MarginContext, profile: &PlayerProfile, dialogue_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(dialogue_id);
    let Some(entry) = (dialogue_id != 0)
        .then(|| ctx.dialogue.entry(dialogue_id))
        .flatten()
    else {
        writer.write_u32_le(0);
        writer.write_cstring_str("");
        writer.write_u8(0);
        writer.write_u8(0);
        writer.write_u8(0);
        return writer.into_vec();
    };
    writer.write_u32_le(entry.npc_id);
    writer.write_cstring_str(&entry.text);
    writer.write_u8(entry.npc_emotion);
    writer.write_u8(entry.npc_animation);
    let options = ctx.dialogue.dialogue_options(profile, &ctx.missions, dialogue_id);
    writer.write_u8(options.len() as u8);
    for option in &options {
        writer.write_u32_le(option.id);
        writer.write_cstring_str(&option.text);
    }
    writer.into_vec()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::{DialogueAction, DialogueEntry, DialogueOption};
    use crate::missions::{MissionDefinition, MissionObjective};

    fn mission_7001() -> MissionDefinition {
        MissionDefinition {
            id: 7001,
            name: "Data Courier".to_string(),
            description: String::new(),
            min_level: 5,
            max_level: 0,
            faction: 0,
            giver_npc_id: 5000,
            turn_in_npc_id: 5000,
            repeatable: false,
            cooldown_secs: 0,
            start_dialogue: String::new(),
            completion_dialogue: String::new(),
            failure_dialogue: String::new(),
            reward_experience: 1000,
            reward_information: 250,
            reward_items: vec![9001],
            objectives: vec![MissionObjective {
                id: 1,
                description: "Deliver three packages".to_string(),
                target_value: 3,
                optional: false,
                completion_text: String::new(),
                reward_experience: 0,
                reward_information: 0,
                reward_items: vec![],
            }],
            prerequisites: vec![],
        }
    }

    fn oracle_entries() -> Vec<DialogueEntry> {
        vec![
            DialogueEntry {
                id: 500,
                npc_id: 5000,
                text: "You already know what I am going to say.".to_string(),
                npc_emotion: 1,
                npc_animation: 0,
                initial: true,
                options: vec![
                    DialogueOption {
                        id: 1,
                        text: "Who are you?".to_string(),
                        next_dialogue_id: 502,
                        end_conversation: false,
                        required_mission_id: 0,
                        required_mission_state: 0,
                        required_level: 0,
                        required_faction: 0,
                        required_skill_id: 0,
                        required_skill_level: 0,
                    },
                    DialogueOption {
                        id: 3,
                        text: "The package is delivered.".to_string(),
                        next_dialogue_id: 501,
                        end_conversation: false,
                        required_mission_id: 7001,
                        required_mission_state: 2,
                        required_level: 0,
                        required_faction: 0,
                        required_skill_id: 0,
                        required_skill_level: 0,
                    },
                ],
                actions: vec![],
            },
            DialogueEntry {
                id: 501,
                npc_id: 5000,
                text: "Then we are done here.".to_string(),
                npc_emotion: 0,
                npc_animation: 0,
                initial: false,
                options: vec![],
                actions: vec![DialogueAction::GiveItem(9100)],
            },
            DialogueEntry {
                id: 502,
                npc_id: 5000,
                text: "A friend.".to_string(),
                npc_emotion: 0,
                npc_animation: 0,
                initial: false,
                options: vec![],
                actions: vec![],
            },
        ]
    }

    fn margin_context(tag: &str) -> (MarginContext, std::path::PathBuf, String, u64) {
        let root = std::env::temp_dir().join(format!(
            "reality-margin-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        let store = Arc::new(Store::open(&root).expect("store"));
        let mut record = CharacterRecord::new_character(
            1,
            1,
            "Neo".to_string(),
            "Thomas".to_string(),
            "Anderson".to_string(),
            PROFESSION_HACKER,
            DISTRICT_RICHLAND,
        );
        record.level = 10;
        let character = store.insert_character(record).expect("character");
        let sessions = Arc::new(SessionKeyTable::new());
        let key = crate::crypto::generate_session_key();
        sessions.insert(key.clone(), 1);
        sessions.bind_character(&key, character.character_id);
        let ctx = MarginContext {
            store: Arc::clone(&store),
            sessions,
            missions: Arc::new(MissionEngine::new(vec![mission_7001()], Arc::clone(&store))),
            dialogue: Arc::new(DialogueEngine::new(oracle_entries(), store)),
        };
        (ctx, root, key, character.character_id)
    }

    fn announce(session: &mut MarginSession, ctx: &MarginContext, key: &str, character_id: u64) {
        let mut payload = PacketWriter::new();
        payload.write_cstring_str(key);
        payload.write_u64_le(character_id);
        let reply = session.on_message(ctx, MSG_GAME_HANDSHAKE, payload.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u16_le(), Some(0));
        assert!(session.is_authenticated());
    }

    #[test]
    fn announce_with_invalid_key_closes() {
        let (ctx, root, _key, character_id) = margin_context("badkey");
        let mut session = MarginSession::new();
        session.on_connect();
        let mut payload = PacketWriter::new();
        payload.write_cstring_str("WRONG");
        payload.write_u64_le(character_id);
        let reply = session.on_message(&ctx, MSG_GAME_HANDSHAKE, payload.as_slice());
        assert!(reply.close);
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u16_le(), Some(1));
        assert_eq!(session.state(), MarginState::Closed);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn request_before_announce_closes() {
        let (ctx, root, _key, _character_id) = margin_context("early");
        let mut session = MarginSession::new();
        session.on_connect();
        let reply = session.on_message(&ctx, MSG_MISSION_LIST_REQUEST, &[]);
        assert!(reply.close);
        assert!(reply.frames.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn mission_lifecycle_over_the_wire() {
        let (ctx, root, key, character_id) = margin_context("missions");
        let mut session = MarginSession::new();
        session.on_connect();
        announce(&mut session, &ctx, &key, character_id);
        let player_id = session.player_id();

        // List: 7001 available, nothing active.
        let reply = session.on_message(&ctx, MSG_MISSION_LIST_REQUEST, &[]);
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u16_le(), Some(1));
        assert_eq!(reader.read_u32_le(), Some(7001));
        assert_eq!(reader.read_u16_le(), Some(0));

        // Accept.
        let mut request = PacketWriter::new();
        request.write_u32_le(7001);
        let reply = session.on_message(&ctx, MSG_MISSION_ACCEPT, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(7001));
        assert_eq!(reader.read_u16_le(), Some(0));
        assert_eq!(reader.read_u8(), Some(1));

        // Three progress updates on objective 1.
        for expected in 1..=3u32 {
            let mut request = PacketWriter::new();
            request.write_u32_le(7001);
            request.write_u32_le(1);
            request.write_u32_le(1);
            let reply = session.on_message(&ctx, MSG_MISSION_UPDATE, request.as_slice());
            let mut reader = PacketReader::new(&reply.frames[0].1);
            assert_eq!(reader.read_u32_le(), Some(7001));
            assert_eq!(reader.read_u16_le(), Some(0));
            assert_eq!(reader.read_u8(), Some(1));
            assert_eq!(reader.read_u32_le(), Some(1));
            assert_eq!(reader.read_u32_le(), Some(expected));
            assert_eq!(reader.read_u32_le(), Some(3));
        }
        assert!(ctx.missions.are_all_objectives_complete(player_id, 7001));

        // Complete: row in the log, rewards on the character.
        let mut request = PacketWriter::new();
        request.write_u32_le(7001);
        let reply = session.on_message(&ctx, MSG_MISSION_COMPLETE, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(7001));
        assert_eq!(reader.read_u16_le(), Some(0));
        assert_eq!(reader.read_u64_le(), Some(1000));
        assert_eq!(reader.read_u64_le(), Some(250));
        assert_eq!(reader.read_u8(), Some(1));
        assert_eq!(reader.read_u32_le(), Some(9001));

        assert!(ctx.missions.has_completed(player_id, 7001));
        assert!(ctx.missions.active_missions(player_id).is_empty());
        let row = ctx
            .store
            .lookup_character(character_id)
            .expect("lookup")
            .expect("row");
        assert_eq!(row.experience, 1000);
        assert_eq!(row.information, 250);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn completing_without_progress_reports_error() {
        let (ctx, root, key, character_id) = margin_context("premature");
        let mut session = MarginSession::new();
        session.on_connect();
        announce(&mut session, &ctx, &key, character_id);

        let mut request = PacketWriter::new();
        request.write_u32_le(7001);
        session.on_message(&ctx, MSG_MISSION_ACCEPT, request.as_slice());

        let mut request = PacketWriter::new();
        request.write_u32_le(7001);
        let reply = session.on_message(&ctx, MSG_MISSION_COMPLETE, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(7001));
        assert_eq!(reader.read_u16_le(), Some(8));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn dialogue_gate_follows_mission_state() {
        let (ctx, root, key, character_id) = margin_context("dialogue");
        let mut session = MarginSession::new();
        session.on_connect();
        announce(&mut session, &ctx, &key, character_id);
        let player_id = session.player_id();

        // Initial dialogue for the NPC: option 3 hidden (mission not done).
        let mut request = PacketWriter::new();
        request.write_u32_le(5000);
        let reply = session.on_message(&ctx, MSG_DIALOGUE_REQUEST, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(500));
        assert_eq!(reader.read_u32_le(), Some(5000));
        let _text = reader.read_cstring_lossy().expect("text");
        let _emotion = reader.read_u8();
        let _animation = reader.read_u8();
        assert_eq!(reader.read_u8(), Some(1));
        assert_eq!(reader.read_u32_le(), Some(1));

        // Choosing the hidden option re-presents the entry.
        let mut request = PacketWriter::new();
        request.write_u32_le(500);
        request.write_u32_le(3);
        let reply = session.on_message(&ctx, MSG_DIALOGUE_CHOICE, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(500));

        // Complete the mission through the engine, then the gate opens.
        let profile = PlayerProfile {
            player_id,
            level: 10,
            profession: PROFESSION_HACKER,
            faction: 0,
            items: vec![],
            skills: Default::default(),
            districts: vec![],
        };
        ctx.missions.start_mission(&profile, 7001, 0).expect("start");
        ctx.missions
            .update_objective_progress(player_id, 7001, 1, 3)
            .expect("progress");
        ctx.missions
            .complete_mission(player_id, 7001, 10)
            .expect("complete");

        let mut request = PacketWriter::new();
        request.write_u32_le(5000);
        let reply = session.on_message(&ctx, MSG_DIALOGUE_REQUEST, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(500));
        reader.read_u32_le();
        reader.read_cstring_lossy();
        reader.read_u8();
        reader.read_u8();
        assert_eq!(reader.read_u8(), Some(2));

        // Option 3 advances to 501 and pays out its item action.
        let mut request = PacketWriter::new();
        request.write_u32_le(500);
        request.write_u32_le(3);
        let reply = session.on_message(&ctx, MSG_DIALOGUE_CHOICE, request.as_slice());
        let mut reader = PacketReader::new(&reply.frames[0].1);
        assert_eq!(reader.read_u32_le(), Some(501));
        assert!(session.profile.items.contains(&9100));
        let _ = std::fs::remove_dir_all(&root);
    }
}
