use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::persistence::store::{
    CompletedMissionRecord, MissionInstanceRecord, Store, StoreError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionObjective {
    pub id: u32,
    pub description: String,
    pub target_value: u32,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub completion_text: String,
    #[serde(default)]
    pub reward_experience: u64,
    #[serde(default)]
    pub reward_information: u64,
    #[serde(default)]
    pub reward_items: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionPrerequisite {
    Level(u8),
    Faction(u8),
    Profession(u8),
    CompletedMission(u32),
    ItemPossession(u32),
    SkillLevel { skill_id: u32, level: u8 },
    DistrictAccess(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionDefinition {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub min_level: u8,
    /// 0 means no upper bound.
    #[serde(default)]
    pub max_level: u8,
    /// 0 means any faction.
    #[serde(default)]
    pub faction: u8,
    #[serde(default)]
    pub giver_npc_id: u32,
    #[serde(default)]
    pub turn_in_npc_id: u32,
    #[serde(default)]
    pub repeatable: bool,
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub start_dialogue: String,
    #[serde(default)]
    pub completion_dialogue: String,
    #[serde(default)]
    pub failure_dialogue: String,
    #[serde(default)]
    pub reward_experience: u64,
    #[serde(default)]
    pub reward_information: u64,
    #[serde(default)]
    pub reward_items: Vec<u32>,
    pub objectives: Vec<MissionObjective>,
    #[serde(default)]
    pub prerequisites: Vec<MissionPrerequisite>,
}

/// The slice of player state prerequisite and gate checks need. Assembled by
/// the session from the character row and live player object.
#[derive(Debug, Clone, Default)]
pub struct PlayerProfile {
    pub player_id: u32,
    pub level: u8,
    pub profession: u8,
    pub faction: u8,
    pub items: Vec<u32>,
    pub skills: HashMap<u32, u8>,
    pub districts: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    NotStarted,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionInstance {
    pub mission_id: u32,
    pub player_id: u32,
    pub started_at: u64,
    pub failed: bool,
    pub objective_progress: HashMap<u32, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionReward {
    pub experience: u64,
    pub information: u64,
    pub items: Vec<u32>,
}

impl MissionReward {
    fn add(&mut self, experience: u64, information: u64, items: &[u32]) {
        self.experience += experience;
        self.information += information;
        self.items.extend_from_slice(items);
    }

    pub fn is_empty(&self) -> bool {
        self.experience == 0 && self.information == 0 && self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveProgress {
    pub objective_id: u32,
    pub progress: u32,
    pub target_value: u32,
    /// Set when this update crossed the target; carries the objective reward.
    pub just_completed: Option<MissionReward>,
}

#[derive(Debug)]
pub enum MissionError {
    UnknownMission(u32),
    UnknownObjective(u32),
    AlreadyActive,
    PrerequisitesNotMet,
    CooldownActive,
    NotActive,
    AlreadyFailed,
    ObjectivesIncomplete,
    Store(StoreError),
}

impl std::fmt::Display for MissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissionError::UnknownMission(id) => write!(f, "unknown mission {}", id),
            MissionError::UnknownObjective(id) => write!(f, "unknown objective {}", id),
            MissionError::AlreadyActive => write!(f, "mission already active"),
            MissionError::PrerequisitesNotMet => write!(f, "prerequisites not met"),
            MissionError::CooldownActive => write!(f, "mission cooldown active"),
            MissionError::NotActive => write!(f, "mission not active"),
            MissionError::AlreadyFailed => write!(f, "mission already failed"),
            MissionError::ObjectivesIncomplete => write!(f, "objectives incomplete"),
            MissionError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl From<StoreError> for MissionError {
    fn from(err: StoreError) -> Self {
        MissionError::Store(err)
    }
}

#[derive(Debug, Default)]
struct MissionBook {
    instances: HashMap<(u32, u32), MissionInstance>,
    completed: HashMap<u32, Vec<CompletedMissionRecord>>,
    loaded_players: HashSet<u32>,
}

/// Definitions plus per-player instance state. Instances are keyed by
/// `(player_id, mission_id)`; mutations persist through the store before the
/// lock is released.
pub struct MissionEngine {
    definitions: HashMap<u32, MissionDefinition>,
    store: Arc<Store>,
    book: Mutex<MissionBook>,
}

impl MissionEngine {
    pub fn new(definitions: Vec<MissionDefinition>, store: Arc<Store>) -> Self {
        Self {
            definitions: definitions.into_iter().map(|d| (d.id, d)).collect(),
            store,
            book: Mutex::new(MissionBook::default()),
        }
    }

    pub fn definition(&self, mission_id: u32) -> Option<&MissionDefinition> {
        self.definitions.get(&mission_id)
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    /// Every definition whose prerequisites hold and that is not already
    /// active, completed-and-unrepeatable, or cooling down.
    pub fn available_missions(&self, profile: &PlayerProfile, now: u64) -> Vec<u32> {
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, profile.player_id).is_err() {
            return Vec::new();
        }
        let mut out: Vec<u32> = self
            .definitions
            .values()
            .filter(|def| self.check_prerequisites(&book, def, profile))
            .filter(|def| !book.instances.contains_key(&(profile.player_id, def.id)))
            .filter(|def| match last_completion(&book, profile.player_id, def.id) {
                None => true,
                Some(completed_at) => {
                    def.repeatable && now >= completed_at + def.cooldown_secs
                }
            })
            .map(|def| def.id)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn start_mission(
        &self,
        profile: &PlayerProfile,
        mission_id: u32,
        now: u64,
    ) -> Result<(), MissionError> {
        let def = self
            .definitions
            .get(&mission_id)
            .ok_or(MissionError::UnknownMission(mission_id))?;
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, profile.player_id)?;
        let key = (profile.player_id, mission_id);
        if book.instances.contains_key(&key) {
            return Err(MissionError::AlreadyActive);
        }
        if let Some(completed_at) = last_completion(&book, profile.player_id, mission_id) {
            if !def.repeatable {
                return Err(MissionError::PrerequisitesNotMet);
            }
            if now < completed_at + def.cooldown_secs {
                return Err(MissionError::CooldownActive);
            }
        }
        if !self.check_prerequisites(&book, def, profile) {
            return Err(MissionError::PrerequisitesNotMet);
        }
        let instance = MissionInstance {
            mission_id,
            player_id: profile.player_id,
            started_at: now,
            failed: false,
            objective_progress: def.objectives.iter().map(|o| (o.id, 0)).collect(),
        };
        book.instances.insert(key, instance);
        self.persist_player(&book, profile.player_id)?;
        Ok(())
    }

    /// Adds `delta` to the objective, clamped to the target. Progress on a
    /// failed instance is rejected.
    pub fn update_objective_progress(
        &self,
        player_id: u32,
        mission_id: u32,
        objective_id: u32,
        delta: u32,
    ) -> Result<ObjectiveProgress, MissionError> {
        let def = self
            .definitions
            .get(&mission_id)
            .ok_or(MissionError::UnknownMission(mission_id))?;
        let objective = def
            .objectives
            .iter()
            .find(|o| o.id == objective_id)
            .ok_or(MissionError::UnknownObjective(objective_id))?;
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, player_id)?;
        let instance = book
            .instances
            .get_mut(&(player_id, mission_id))
            .ok_or(MissionError::NotActive)?;
        if instance.failed {
            return Err(MissionError::AlreadyFailed);
        }
        let slot = instance
            .objective_progress
            .entry(objective_id)
            .or_insert(0);
        let before = *slot;
        *slot = slot.saturating_add(delta).min(objective.target_value);
        let after = *slot;
        let just_completed = if before < objective.target_value && after >= objective.target_value
        {
            let mut reward = MissionReward::default();
            reward.add(
                objective.reward_experience,
                objective.reward_information,
                &objective.reward_items,
            );
            Some(reward)
        } else {
            None
        };
        let progress = ObjectiveProgress {
            objective_id,
            progress: after,
            target_value: objective.target_value,
            just_completed,
        };
        self.persist_player(&book, player_id)?;
        Ok(progress)
    }

    /// Optional objectives never block completion.
    pub fn are_all_objectives_complete(&self, player_id: u32, mission_id: u32) -> bool {
        let Some(def) = self.definitions.get(&mission_id) else {
            return false;
        };
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return false;
        }
        let Some(instance) = book.instances.get(&(player_id, mission_id)) else {
            return false;
        };
        def.objectives
            .iter()
            .filter(|objective| !objective.optional)
            .all(|objective| {
                instance
                    .objective_progress
                    .get(&objective.id)
                    .copied()
                    .unwrap_or(0)
                    >= objective.target_value
            })
    }

    /// The only transition that writes history and grants rewards.
    pub fn complete_mission(
        &self,
        player_id: u32,
        mission_id: u32,
        now: u64,
    ) -> Result<MissionReward, MissionError> {
        let def = self
            .definitions
            .get(&mission_id)
            .ok_or(MissionError::UnknownMission(mission_id))?;
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, player_id)?;
        let key = (player_id, mission_id);
        let Some(instance) = book.instances.get(&key) else {
            return Err(MissionError::NotActive);
        };
        if instance.failed {
            return Err(MissionError::AlreadyFailed);
        }
        let required_done = def
            .objectives
            .iter()
            .filter(|objective| !objective.optional)
            .all(|objective| {
                instance
                    .objective_progress
                    .get(&objective.id)
                    .copied()
                    .unwrap_or(0)
                    >= objective.target_value
            });
        if !required_done {
            return Err(MissionError::ObjectivesIncomplete);
        }
        let mut reward = MissionReward::default();
        reward.add(def.reward_experience, def.reward_information, &def.reward_items);
        book.instances.remove(&key);
        book.completed.entry(player_id).or_default().push(
            CompletedMissionRecord {
                mission_id,
                completed_at: now,
            },
        );
        self.store
            .append_completed_mission(player_id, mission_id, now)?;
        self.persist_player(&book, player_id)?;
        Ok(reward)
    }

    /// Marks the instance failed; history is untouched.
    pub fn fail_mission(&self, player_id: u32, mission_id: u32) -> Result<(), MissionError> {
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, player_id)?;
        let instance = book
            .instances
            .get_mut(&(player_id, mission_id))
            .ok_or(MissionError::NotActive)?;
        instance.failed = true;
        self.persist_player(&book, player_id)?;
        Ok(())
    }

    /// Drops the instance; the mission reads as NotStarted again.
    pub fn abandon_mission(&self, player_id: u32, mission_id: u32) -> Result<(), MissionError> {
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, player_id)?;
        if book.instances.remove(&(player_id, mission_id)).is_none() {
            return Err(MissionError::NotActive);
        }
        self.persist_player(&book, player_id)?;
        Ok(())
    }

    pub fn active_missions(&self, player_id: u32) -> Vec<MissionInstance> {
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return Vec::new();
        }
        let mut out: Vec<MissionInstance> = book
            .instances
            .values()
            .filter(|instance| instance.player_id == player_id && !instance.failed)
            .cloned()
            .collect();
        out.sort_by_key(|instance| instance.mission_id);
        out
    }

    pub fn mission_instance(&self, player_id: u32, mission_id: u32) -> Option<MissionInstance> {
        let mut book = self.lock_book();
        self.ensure_player_loaded(&mut book, player_id).ok()?;
        book.instances.get(&(player_id, mission_id)).cloned()
    }

    pub fn objective_progress(&self, player_id: u32, mission_id: u32, objective_id: u32) -> u32 {
        self.mission_instance(player_id, mission_id)
            .and_then(|instance| instance.objective_progress.get(&objective_id).copied())
            .unwrap_or(0)
    }

    pub fn has_completed(&self, player_id: u32, mission_id: u32) -> bool {
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return false;
        }
        last_completion(&book, player_id, mission_id).is_some()
    }

    pub fn completed_missions(&self, player_id: u32) -> Vec<u32> {
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return Vec::new();
        }
        book.completed
            .get(&player_id)
            .map(|log| log.iter().map(|entry| entry.mission_id).collect())
            .unwrap_or_default()
    }

    /// Dialogue gating reads: completed means "completed at least once".
    pub fn mission_state(&self, player_id: u32, mission_id: u32) -> MissionState {
        let mut book = self.lock_book();
        if self.ensure_player_loaded(&mut book, player_id).is_err() {
            return MissionState::NotStarted;
        }
        if last_completion(&book, player_id, mission_id).is_some() {
            return MissionState::Completed;
        }
        match book.instances.get(&(player_id, mission_id)) {
            Some(instance) if instance.failed => MissionState::Failed,
            Some(_) => MissionState::Active,
            None => MissionState::NotStarted,
        }
    }

    fn check_prerequisites(
        &self,
        book: &MissionBook,
        def: &MissionDefinition,
        profile: &PlayerProfile,
    ) -> bool {
        if profile.level < def.min_level {
            return false;
        }
        if def.max_level != 0 && profile.level > def.max_level {
            return false;
        }
        if def.faction != 0 && profile.faction != def.faction {
            return false;
        }
        def.prerequisites.iter().all(|prereq| match prereq {
            MissionPrerequisite::Level(min) => profile.level >= *min,
            MissionPrerequisite::Faction(faction) => profile.faction == *faction,
            MissionPrerequisite::Profession(profession) => profile.profession == *profession,
            MissionPrerequisite::CompletedMission(id) => {
                last_completion(book, profile.player_id, *id).is_some()
            }
            MissionPrerequisite::ItemPossession(item) => profile.items.contains(item),
            MissionPrerequisite::SkillLevel { skill_id, level } => {
                profile.skills.get(skill_id).copied().unwrap_or(0) >= *level
            }
            MissionPrerequisite::DistrictAccess(district) => {
                profile.districts.contains(district)
            }
        })
    }

    fn ensure_player_loaded(
        &self,
        book: &mut MissionBook,
        player_id: u32,
    ) -> Result<(), MissionError> {
        if book.loaded_players.contains(&player_id) {
            return Ok(());
        }
        for record in self.store.load_mission_instances(player_id)? {
            book.instances.insert(
                (player_id, record.mission_id),
                MissionInstance {
                    mission_id: record.mission_id,
                    player_id,
                    started_at: record.started_at,
                    failed: record.failed,
                    objective_progress: record.objectives.iter().copied().collect(),
                },
            );
        }
        let completed = self.store.load_completed_missions(player_id)?;
        if !completed.is_empty() {
            book.completed.insert(player_id, completed);
        }
        book.loaded_players.insert(player_id);
        Ok(())
    }

    fn persist_player(&self, book: &MissionBook, player_id: u32) -> Result<(), MissionError> {
        let mut records: Vec<MissionInstanceRecord> = book
            .instances
            .values()
            .filter(|instance| instance.player_id == player_id)
            .map(|instance| {
                let mut objectives: Vec<(u32, u32)> =
                    instance.objective_progress.iter().map(|(k, v)| (*k, *v)).collect();
                objectives.sort_unstable();
                MissionInstanceRecord {
                    mission_id: instance.mission_id,
                    started_at: instance.started_at,
                    failed: instance.failed,
                    objectives,
                }
            })
            .collect();
        records.sort_by_key(|record| record.mission_id);
        self.store.save_mission_instances(player_id, &records)?;
        Ok(())
    }

    fn lock_book(&self) -> std::sync::MutexGuard<'_, MissionBook> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn last_completion(book: &MissionBook, player_id: u32, mission_id: u32) -> Option<u64> {
    book.completed.get(&player_id).and_then(|log| {
        log.iter()
            .filter(|entry| entry.mission_id == mission_id)
            .map(|entry| entry.completed_at)
            .max()
    })
}
