use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::missions::{MissionEngine, MissionError, MissionReward, MissionState, PlayerProfile};
use crate::persistence::store::{Store, StoreError};
use crate::world::location::LocationVector;

pub const MISSION_STATE_NOT_STARTED: u8 = 0;
pub const MISSION_STATE_IN_PROGRESS: u8 = 1;
pub const MISSION_STATE_COMPLETED: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueOption {
    pub id: u32,
    pub text: String,
    #[serde(default)]
    pub next_dialogue_id: u32,
    #[serde(default)]
    pub end_conversation: bool,
    /// 0 = no mission gate.
    #[serde(default)]
    pub required_mission_id: u32,
    /// 0 = not started, 1 = in progress, 2 = completed at least once.
    #[serde(default)]
    pub required_mission_state: u8,
    #[serde(default)]
    pub required_level: u8,
    #[serde(default)]
    pub required_faction: u8,
    #[serde(default)]
    pub required_skill_id: u32,
    #[serde(default)]
    pub required_skill_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DialogueAction {
    StartMission(u32),
    CompleteMission(u32),
    GiveItem(u32),
    TakeItem(u32),
    Teleport {
        district: u8,
        x: f64,
        y: f64,
        z: f64,
    },
    OpenShop(u32),
    TrainSkill {
        skill_id: u32,
        level: u8,
    },
    SetFaction(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub id: u32,
    pub npc_id: u32,
    pub text: String,
    #[serde(default)]
    pub npc_emotion: u8,
    #[serde(default)]
    pub npc_animation: u8,
    /// Marks the conversation opener for the NPC.
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub options: Vec<DialogueOption>,
    #[serde(default)]
    pub actions: Vec<DialogueAction>,
}

/// What selecting an option did. Effects describe player-state changes the
/// session applies to the character; the engines have already committed their
/// own state.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedEffect {
    MissionStarted(u32),
    MissionCompleted {
        mission_id: u32,
        reward: MissionReward,
    },
    ItemGiven(u32),
    ItemTaken(u32),
    Teleported {
        district: u8,
        position: LocationVector,
    },
    ShopOpened(u32),
    SkillTrained {
        skill_id: u32,
        level: u8,
    },
    FactionSet(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DialogueOutcome {
    /// 0 ends the conversation.
    pub next_dialogue_id: u32,
    pub effects: Vec<AppliedEffect>,
}

#[derive(Debug)]
pub enum DialogueError {
    UnknownDialogue(u32),
    UnknownOption(u32),
    OptionNotAvailable,
    ActionFailed(String),
    Store(StoreError),
}

impl std::fmt::Display for DialogueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogueError::UnknownDialogue(id) => write!(f, "unknown dialogue {}", id),
            DialogueError::UnknownOption(id) => write!(f, "unknown option {}", id),
            DialogueError::OptionNotAvailable => write!(f, "option gate not satisfied"),
            DialogueError::ActionFailed(err) => write!(f, "dialogue action failed: {}", err),
            DialogueError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl From<StoreError> for DialogueError {
    fn from(err: StoreError) -> Self {
        DialogueError::Store(err)
    }
}

#[derive(Debug, Default)]
struct HistoryBook {
    visited: HashMap<(u32, u32), Vec<u32>>,
    loaded_players: HashSet<u32>,
}

/// Dialogue graph plus per-player per-NPC visit history. Mission gates read
/// through the mission engine; action side-effects commit there too.
pub struct DialogueEngine {
    entries: HashMap<u32, DialogueEntry>,
    initial: HashMap<u32, u32>,
    store: Arc<Store>,
    history: Mutex<HistoryBook>,
}

impl DialogueEngine {
    pub fn new(entries: Vec<DialogueEntry>, store: Arc<Store>) -> Self {
        let mut initial = HashMap::new();
        for entry in &entries {
            if entry.initial {
                initial.entry(entry.npc_id).or_insert(entry.id);
            }
        }
        // NPCs without an explicit opener fall back to their lowest entry id.
        for entry in &entries {
            let slot = initial.entry(entry.npc_id).or_insert(entry.id);
            if !entries_has_initial(&entries, entry.npc_id) && entry.id < *slot {
                *slot = entry.id;
            }
        }
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
            initial,
            store,
            history: Mutex::new(HistoryBook::default()),
        }
    }

    pub fn entry(&self, dialogue_id: u32) -> Option<&DialogueEntry> {
        self.entries.get(&dialogue_id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// 0 when the NPC has no dialogue.
    pub fn initial_dialogue(&self, npc_id: u32) -> u32 {
        self.initial.get(&npc_id).copied().unwrap_or(0)
    }

    /// Opens a conversation: records the visit and fires the opener's
    /// actions.
    pub fn request_dialogue(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        npc_id: u32,
        now: u64,
    ) -> Result<Option<DialogueOutcome>, DialogueError> {
        let dialogue_id = self.initial_dialogue(npc_id);
        if dialogue_id == 0 {
            return Ok(None);
        }
        let entry = self
            .entries
            .get(&dialogue_id)
            .ok_or(DialogueError::UnknownDialogue(dialogue_id))?;
        let effects = self.run_actions(profile, missions, &entry.actions, now)?;
        self.record_history(profile.player_id, npc_id, dialogue_id)?;
        Ok(Some(DialogueOutcome {
            next_dialogue_id: dialogue_id,
            effects,
        }))
    }

    /// The subset of options whose gates hold for this player right now.
    pub fn dialogue_options(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        dialogue_id: u32,
    ) -> Vec<DialogueOption> {
        let Some(entry) = self.entries.get(&dialogue_id) else {
            return Vec::new();
        };
        entry
            .options
            .iter()
            .filter(|option| self.is_option_valid(profile, missions, option))
            .cloned()
            .collect()
    }

    pub fn is_option_valid(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        option: &DialogueOption,
    ) -> bool {
        if option.required_level != 0 && profile.level < option.required_level {
            return false;
        }
        if option.required_faction != 0 && profile.faction != option.required_faction {
            return false;
        }
        if option.required_skill_id != 0 {
            let level = profile
                .skills
                .get(&option.required_skill_id)
                .copied()
                .unwrap_or(0);
            if level < option.required_skill_level {
                return false;
            }
        }
        if option.required_mission_id != 0 {
            let state = missions.mission_state(profile.player_id, option.required_mission_id);
            let required = match option.required_mission_state {
                MISSION_STATE_NOT_STARTED => state == MissionState::NotStarted,
                MISSION_STATE_IN_PROGRESS => state == MissionState::Active,
                MISSION_STATE_COMPLETED => state == MissionState::Completed,
                _ => false,
            };
            if !required {
                return false;
            }
        }
        true
    }

    /// Re-checks the gate, advances the conversation, records history and
    /// runs the target entry's actions. Actions apply atomically: every
    /// action is validated before the first one commits.
    pub fn select_option(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        dialogue_id: u32,
        option_id: u32,
        now: u64,
    ) -> Result<DialogueOutcome, DialogueError> {
        let entry = self
            .entries
            .get(&dialogue_id)
            .ok_or(DialogueError::UnknownDialogue(dialogue_id))?;
        let option = entry
            .options
            .iter()
            .find(|option| option.id == option_id)
            .ok_or(DialogueError::UnknownOption(option_id))?;
        if !self.is_option_valid(profile, missions, option) {
            return Err(DialogueError::OptionNotAvailable);
        }

        let next_id = if option.end_conversation {
            0
        } else {
            option.next_dialogue_id
        };
        let mut effects = Vec::new();
        if next_id != 0 {
            let next = self
                .entries
                .get(&next_id)
                .ok_or(DialogueError::UnknownDialogue(next_id))?;
            effects = self.run_actions(profile, missions, &next.actions, now)?;
            self.record_history(profile.player_id, next.npc_id, next_id)?;
        }
        Ok(DialogueOutcome {
            next_dialogue_id: next_id,
            effects,
        })
    }

    pub fn history(&self, player_id: u32, npc_id: u32) -> Vec<u32> {
        let mut book = self.lock_history();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return Vec::new();
        }
        book.visited
            .get(&(player_id, npc_id))
            .cloned()
            .unwrap_or_default()
    }

    /// `npc_id` 0 clears across every NPC.
    pub fn clear_history(&self, player_id: u32, npc_id: u32) -> Result<(), DialogueError> {
        let mut book = self.lock_history();
        self.ensure_player_loaded(&mut book, player_id)?;
        if npc_id == 0 {
            book.visited.retain(|(player, _), _| *player != player_id);
        } else {
            book.visited.remove(&(player_id, npc_id));
        }
        self.persist_history(&book, player_id)?;
        Ok(())
    }

    fn record_history(
        &self,
        player_id: u32,
        npc_id: u32,
        dialogue_id: u32,
    ) -> Result<(), DialogueError> {
        let mut book = self.lock_history();
        self.ensure_player_loaded(&mut book, player_id)?;
        book.visited
            .entry((player_id, npc_id))
            .or_default()
            .push(dialogue_id);
        self.persist_history(&book, player_id)?;
        Ok(())
    }

    /// Validate-then-commit. The validation pass mirrors the engine rules so
    /// the commit pass only fails on store trouble; a started mission is
    /// abandoned again if a later action still fails.
    fn run_actions(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        actions: &[DialogueAction],
        now: u64,
    ) -> Result<Vec<AppliedEffect>, DialogueError> {
        for action in actions {
            match action {
                DialogueAction::StartMission(mission_id) => {
                    if missions.mission_state(profile.player_id, *mission_id)
                        == MissionState::Active
                    {
                        return Err(DialogueError::ActionFailed(format!(
                            "mission {} already active",
                            mission_id
                        )));
                    }
                }
                DialogueAction::CompleteMission(mission_id) => {
                    if missions.mission_state(profile.player_id, *mission_id)
                        != MissionState::Active
                        || !missions.are_all_objectives_complete(profile.player_id, *mission_id)
                    {
                        return Err(DialogueError::ActionFailed(format!(
                            "mission {} not ready to complete",
                            mission_id
                        )));
                    }
                }
                DialogueAction::TakeItem(item_id) => {
                    if !profile.items.contains(item_id) {
                        return Err(DialogueError::ActionFailed(format!(
                            "player lacks item {}",
                            item_id
                        )));
                    }
                }
                _ => {}
            }
        }

        let mut effects = Vec::new();
        let mut started = Vec::new();
        for action in actions {
            let result = self.apply_action(profile, missions, action, now);
            match result {
                Ok(effect) => {
                    if let AppliedEffect::MissionStarted(mission_id) = &effect {
                        started.push(*mission_id);
                    }
                    effects.push(effect);
                }
                Err(err) => {
                    for mission_id in started {
                        let _ = missions.abandon_mission(profile.player_id, mission_id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(effects)
    }

    fn apply_action(
        &self,
        profile: &PlayerProfile,
        missions: &MissionEngine,
        action: &DialogueAction,
        now: u64,
    ) -> Result<AppliedEffect, DialogueError> {
        match action {
            DialogueAction::StartMission(mission_id) => {
                missions
                    .start_mission(profile, *mission_id, now)
                    .map_err(|err| action_error(err))?;
                Ok(AppliedEffect::MissionStarted(*mission_id))
            }
            DialogueAction::CompleteMission(mission_id) => {
                let reward = missions
                    .complete_mission(profile.player_id, *mission_id, now)
                    .map_err(|err| action_error(err))?;
                Ok(AppliedEffect::MissionCompleted {
                    mission_id: *mission_id,
                    reward,
                })
            }
            DialogueAction::GiveItem(item_id) => Ok(AppliedEffect::ItemGiven(*item_id)),
            DialogueAction::TakeItem(item_id) => Ok(AppliedEffect::ItemTaken(*item_id)),
            DialogueAction::Teleport { district, x, y, z } => Ok(AppliedEffect::Teleported {
                district: *district,
                position: LocationVector::new(*x, *y, *z),
            }),
            DialogueAction::OpenShop(shop_id) => Ok(AppliedEffect::ShopOpened(*shop_id)),
            DialogueAction::TrainSkill { skill_id, level } => Ok(AppliedEffect::SkillTrained {
                skill_id: *skill_id,
                level: *level,
            }),
            DialogueAction::SetFaction(faction) => Ok(AppliedEffect::FactionSet(*faction)),
        }
    }

    fn ensure_player_loaded(
        &self,
        book: &mut HistoryBook,
        player_id: u32,
    ) -> Result<(), DialogueError> {
        if book.loaded_players.contains(&player_id) {
            return Ok(());
        }
        for (npc_id, visited) in self.store.load_dialogue_history(player_id)? {
            book.visited.insert((player_id, npc_id), visited);
        }
        book.loaded_players.insert(player_id);
        Ok(())
    }

    fn persist_history(&self, book: &HistoryBook, player_id: u32) -> Result<(), DialogueError> {
        let mut per_npc: HashMap<u32, Vec<u32>> = HashMap::new();
        for ((player, npc_id), visited) in &book.visited {
            if *player == player_id {
                per_npc.insert(*npc_id, visited.clone());
            }
        }
        self.store.save_dialogue_history(player_id, &per_npc)?;
        Ok(())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, HistoryBook> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn action_error(err: MissionError) -> DialogueError {
    DialogueError::ActionFailed(err.to_string())
}

fn entries_has_initial(entries: &[DialogueEntry], npc_id: u32) -> bool {
    entries
        .iter()
        .any(|entry| entry.npc_id == npc_id && entry.initial)
}
