use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::world::location::LocationVector;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF_MS: u64 = 50;

const ACCOUNTS_FILE: &str = "accounts.txt";
const WORLDS_FILE: &str = "worlds.txt";
const CHARACTERS_FILE: &str = "characters.txt";

#[derive(Debug)]
pub enum StoreError {
    /// IO failure that survived the retry policy.
    Unavailable(String),
    Corrupt(String),
    /// Uniqueness violation (username, world name, handle).
    Conflict(String),
    NotFound,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(err) => write!(f, "store unavailable: {}", err),
            StoreError::Corrupt(err) => write!(f, "store corrupt: {}", err),
            StoreError::Conflict(err) => write!(f, "store conflict: {}", err),
            StoreError::NotFound => write!(f, "record not found"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub account_id: u32,
    pub username: String,
    pub password_hash: String,
    pub password_salt: String,
    pub last_login: u64,
}

#[derive(Debug, Clone)]
pub struct WorldRecord {
    pub world_id: u16,
    pub world_name: String,
    pub status: u8,
}

#[derive(Debug, Clone)]
pub struct CharacterRecord {
    pub character_id: u64,
    pub account_id: u32,
    pub world_id: u16,
    pub handle: String,
    pub first_name: String,
    pub last_name: String,
    pub experience: u64,
    pub information: u64,
    pub health_current: u16,
    pub health_max: u16,
    pub inner_str_current: u16,
    pub inner_str_max: u16,
    pub profession: u8,
    pub level: u8,
    pub alignment: u8,
    pub position: LocationVector,
    pub district: u8,
    pub is_online: bool,
}

impl CharacterRecord {
    /// Row defaults for a freshly created character.
    pub fn new_character(
        account_id: u32,
        world_id: u16,
        handle: String,
        first_name: String,
        last_name: String,
        profession: u8,
        district: u8,
    ) -> Self {
        Self {
            character_id: 0,
            account_id,
            world_id,
            handle,
            first_name,
            last_name,
            experience: 0,
            information: 0,
            health_current: 100,
            health_max: 100,
            inner_str_current: 100,
            inner_str_max: 100,
            profession,
            level: 1,
            alignment: 0,
            position: LocationVector::default(),
            district,
            is_online: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionInstanceRecord {
    pub mission_id: u32,
    pub started_at: u64,
    pub failed: bool,
    /// `(objective_id, progress)` pairs.
    pub objectives: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedMissionRecord {
    pub mission_id: u32,
    pub completed_at: u64,
}

/// File-backed store gateway. Each table is a flat file of key=value record
/// blocks; per-player mission and dialogue rows live in their own files so a
/// single player's churn never rewrites the shared tables. All writers funnel
/// through one guard and leave a `.bak` of the previous content behind.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    write_guard: Mutex<()>,
}

impl Store {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let root = root.join("store");
        for dir in ["missions", "completed", "dialogue"] {
            fs::create_dir_all(root.join(dir))
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        }
        Ok(Self {
            root,
            write_guard: Mutex::new(()),
        })
    }

    // ---- accounts ----

    pub fn lookup_account(&self, username: &str) -> Result<Option<AccountRecord>, StoreError> {
        let accounts = self.load_accounts()?;
        let key = username.trim().to_ascii_lowercase();
        Ok(accounts
            .into_iter()
            .find(|account| account.username.to_ascii_lowercase() == key))
    }

    pub fn insert_account(
        &self,
        username: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<AccountRecord, StoreError> {
        let _guard = self.lock_writes();
        let mut accounts = self.load_accounts()?;
        let key = username.trim().to_ascii_lowercase();
        if accounts
            .iter()
            .any(|account| account.username.to_ascii_lowercase() == key)
        {
            return Err(StoreError::Conflict(format!(
                "account '{}' already exists",
                username
            )));
        }
        let account_id = accounts
            .iter()
            .map(|account| account.account_id)
            .max()
            .unwrap_or(0)
            + 1;
        let record = AccountRecord {
            account_id,
            username: username.trim().to_string(),
            password_hash: password_hash.to_string(),
            password_salt: password_salt.to_string(),
            last_login: 0,
        };
        accounts.push(record.clone());
        self.write_accounts(&accounts)?;
        Ok(record)
    }

    pub fn update_password(
        &self,
        username: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let mut accounts = self.load_accounts()?;
        let key = username.trim().to_ascii_lowercase();
        let account = accounts
            .iter_mut()
            .find(|account| account.username.to_ascii_lowercase() == key)
            .ok_or(StoreError::NotFound)?;
        account.password_hash = password_hash.to_string();
        account.password_salt = password_salt.to_string();
        self.write_accounts(&accounts)
    }

    pub fn touch_last_login(&self, account_id: u32, timestamp: u64) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let mut accounts = self.load_accounts()?;
        let account = accounts
            .iter_mut()
            .find(|account| account.account_id == account_id)
            .ok_or(StoreError::NotFound)?;
        account.last_login = timestamp;
        self.write_accounts(&accounts)
    }

    // ---- worlds ----

    pub fn list_worlds(&self) -> Result<Vec<WorldRecord>, StoreError> {
        let blocks = self.load_blocks(WORLDS_FILE)?;
        blocks.iter().map(|b| world_from_block(b)).collect()
    }

    pub fn insert_world(&self, world_name: &str) -> Result<WorldRecord, StoreError> {
        let _guard = self.lock_writes();
        let mut worlds = self.list_worlds()?;
        if worlds
            .iter()
            .any(|world| world.world_name.eq_ignore_ascii_case(world_name))
        {
            return Err(StoreError::Conflict(format!(
                "world '{}' already exists",
                world_name
            )));
        }
        let world_id = worlds.iter().map(|world| world.world_id).max().unwrap_or(0) + 1;
        let record = WorldRecord {
            world_id,
            world_name: world_name.trim().to_string(),
            status: 1,
        };
        worlds.push(record.clone());
        let blocks: Vec<String> = worlds.iter().map(world_to_block).collect();
        self.write_blocks(WORLDS_FILE, &blocks)?;
        Ok(record)
    }

    // ---- characters ----

    pub fn list_characters(
        &self,
        account_id: u32,
        world_id: u16,
    ) -> Result<Vec<CharacterRecord>, StoreError> {
        let characters = self.load_characters()?;
        Ok(characters
            .into_iter()
            .filter(|ch| ch.account_id == account_id && ch.world_id == world_id)
            .collect())
    }

    pub fn lookup_character(
        &self,
        character_id: u64,
    ) -> Result<Option<CharacterRecord>, StoreError> {
        let characters = self.load_characters()?;
        Ok(characters
            .into_iter()
            .find(|ch| ch.character_id == character_id))
    }

    pub fn lookup_character_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<CharacterRecord>, StoreError> {
        let characters = self.load_characters()?;
        Ok(characters
            .into_iter()
            .find(|ch| ch.handle.eq_ignore_ascii_case(handle)))
    }

    pub fn insert_character(
        &self,
        mut record: CharacterRecord,
    ) -> Result<CharacterRecord, StoreError> {
        let _guard = self.lock_writes();
        let mut characters = self.load_characters()?;
        if characters
            .iter()
            .any(|ch| ch.handle.eq_ignore_ascii_case(&record.handle))
        {
            return Err(StoreError::Conflict(format!(
                "handle '{}' already exists",
                record.handle
            )));
        }
        record.character_id = characters
            .iter()
            .map(|ch| ch.character_id)
            .max()
            .unwrap_or(0)
            + 1;
        characters.push(record.clone());
        self.write_characters(&characters)?;
        Ok(record)
    }

    /// Only the owning account may delete.
    pub fn delete_character(
        &self,
        character_id: u64,
        account_id: u32,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_writes();
        let mut characters = self.load_characters()?;
        let before = characters.len();
        characters.retain(|ch| !(ch.character_id == character_id && ch.account_id == account_id));
        if characters.len() == before {
            return Ok(false);
        }
        self.write_characters(&characters)?;
        Ok(true)
    }

    pub fn update_character_state(&self, record: &CharacterRecord) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let mut characters = self.load_characters()?;
        let slot = characters
            .iter_mut()
            .find(|ch| ch.character_id == record.character_id)
            .ok_or(StoreError::NotFound)?;
        *slot = record.clone();
        self.write_characters(&characters)
    }

    // ---- missions ----

    pub fn load_mission_instances(
        &self,
        player_id: u32,
    ) -> Result<Vec<MissionInstanceRecord>, StoreError> {
        let path = format!("missions/{}.txt", player_id);
        let blocks = self.load_blocks(&path)?;
        blocks.iter().map(|b| mission_instance_from_block(b)).collect()
    }

    pub fn save_mission_instances(
        &self,
        player_id: u32,
        instances: &[MissionInstanceRecord],
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let path = format!("missions/{}.txt", player_id);
        let blocks: Vec<String> = instances.iter().map(mission_instance_to_block).collect();
        self.write_blocks(&path, &blocks)
    }

    pub fn load_completed_missions(
        &self,
        player_id: u32,
    ) -> Result<Vec<CompletedMissionRecord>, StoreError> {
        let path = format!("completed/{}.txt", player_id);
        let blocks = self.load_blocks(&path)?;
        blocks.iter().map(|b| completed_from_block(b)).collect()
    }

    pub fn append_completed_mission(
        &self,
        player_id: u32,
        mission_id: u32,
        completed_at: u64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let mut completed = self.load_completed_missions(player_id)?;
        completed.push(CompletedMissionRecord {
            mission_id,
            completed_at,
        });
        let path = format!("completed/{}.txt", player_id);
        let blocks: Vec<String> = completed.iter().map(completed_to_block).collect();
        self.write_blocks(&path, &blocks)
    }

    // ---- dialogue ----

    pub fn load_dialogue_history(
        &self,
        player_id: u32,
    ) -> Result<HashMap<u32, Vec<u32>>, StoreError> {
        let path = format!("dialogue/{}.txt", player_id);
        let blocks = self.load_blocks(&path)?;
        let mut history = HashMap::new();
        for block in &blocks {
            let (npc_id, visited) = dialogue_from_block(block)?;
            history.insert(npc_id, visited);
        }
        Ok(history)
    }

    pub fn save_dialogue_history(
        &self,
        player_id: u32,
        history: &HashMap<u32, Vec<u32>>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let path = format!("dialogue/{}.txt", player_id);
        let mut npc_ids: Vec<_> = history.keys().copied().collect();
        npc_ids.sort_unstable();
        let blocks: Vec<String> = npc_ids
            .iter()
            .map(|npc_id| dialogue_to_block(*npc_id, &history[npc_id]))
            .collect();
        self.write_blocks(&path, &blocks)
    }

    // ---- file plumbing ----

    fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let blocks = self.load_blocks(ACCOUNTS_FILE)?;
        blocks.iter().map(|b| account_from_block(b)).collect()
    }

    fn write_accounts(&self, accounts: &[AccountRecord]) -> Result<(), StoreError> {
        let blocks: Vec<String> = accounts.iter().map(account_to_block).collect();
        self.write_blocks(ACCOUNTS_FILE, &blocks)
    }

    fn load_characters(&self) -> Result<Vec<CharacterRecord>, StoreError> {
        let blocks = self.load_blocks(CHARACTERS_FILE)?;
        blocks.iter().map(|b| character_from_block(b)).collect()
    }

    fn write_characters(&self, characters: &[CharacterRecord]) -> Result<(), StoreError> {
        let blocks: Vec<String> = characters.iter().map(character_to_block).collect();
        self.write_blocks(CHARACTERS_FILE, &blocks)
    }

    fn load_blocks(&self, rel: &str) -> Result<Vec<String>, StoreError> {
        let path = self.root.join(rel);
        let data = with_retry(|| match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        })?;
        let Some(data) = data else {
            return Ok(Vec::new());
        };
        Ok(split_blocks(&data))
    }

    fn write_blocks(&self, rel: &str, blocks: &[String]) -> Result<(), StoreError> {
        let path = self.root.join(rel);
        let mut data = String::new();
        for block in blocks {
            data.push_str(block);
            data.push('\n');
        }
        with_retry(|| {
            if path.exists() {
                let backup = path.with_extension("bak");
                fs::copy(&path, &backup)?;
            }
            fs::write(&path, &data)
        })
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bounded retry with exponential back-off; only IO errors are retried.
fn with_retry<T>(mut op: impl FnMut() -> std::io::Result<T>) -> Result<T, StoreError> {
    let mut last_error = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = Some(err.to_string());
                if attempt + 1 < RETRY_ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(RETRY_BASE_BACKOFF_MS << attempt));
                }
            }
        }
    }
    Err(StoreError::Unavailable(
        last_error.unwrap_or_else(|| "unknown io error".to_string()),
    ))
}

fn split_blocks(data: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for raw_line in data.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn block_fields(block: &str) -> Result<HashMap<&str, &str>, StoreError> {
    let mut fields = HashMap::new();
    for line in block.lines() {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| StoreError::Corrupt(format!("expected key=value, got '{}'", line)))?;
        fields.insert(key.trim(), value.trim());
    }
    Ok(fields)
}

fn field<'a>(fields: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str, StoreError> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| StoreError::Corrupt(format!("missing field '{}'", key)))
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, StoreError> {
    value
        .parse::<T>()
        .map_err(|_| StoreError::Corrupt(format!("field '{}' has invalid value '{}'", key, value)))
}

fn num_field<T: std::str::FromStr>(
    fields: &HashMap<&str, &str>,
    key: &str,
) -> Result<T, StoreError> {
    parse_num(field(fields, key)?, key)
}

fn account_from_block(block: &str) -> Result<AccountRecord, StoreError> {
    let fields = block_fields(block)?;
    Ok(AccountRecord {
        account_id: num_field(&fields, "account_id")?,
        username: field(&fields, "username")?.to_string(),
        password_hash: field(&fields, "password_hash")?.to_string(),
        password_salt: field(&fields, "password_salt")?.to_string(),
        last_login: num_field(&fields, "last_login")?,
    })
}

fn account_to_block(account: &AccountRecord) -> String {
    format!(
        "account_id={}\nusername={}\npassword_hash={}\npassword_salt={}\nlast_login={}\n",
        account.account_id,
        account.username,
        account.password_hash,
        account.password_salt,
        account.last_login
    )
}

fn world_from_block(block: &str) -> Result<WorldRecord, StoreError> {
    let fields = block_fields(block)?;
    Ok(WorldRecord {
        world_id: num_field(&fields, "world_id")?,
        world_name: field(&fields, "world_name")?.to_string(),
        status: num_field(&fields, "status")?,
    })
}

fn world_to_block(world: &WorldRecord) -> String {
    format!(
        "world_id={}\nworld_name={}\nstatus={}\n",
        world.world_id, world.world_name, world.status
    )
}

fn character_from_block(block: &str) -> Result<CharacterRecord, StoreError> {
    let fields = block_fields(block)?;
    Ok(CharacterRecord {
        character_id: num_field(&fields, "character_id")?,
        account_id: num_field(&fields, "account_id")?,
        world_id: num_field(&fields, "world_id")?,
        handle: field(&fields, "handle")?.to_string(),
        first_name: field(&fields, "first_name")?.to_string(),
        last_name: field(&fields, "last_name")?.to_string(),
        experience: num_field(&fields, "experience")?,
        information: num_field(&fields, "information")?,
        health_current: num_field(&fields, "health_current")?,
        health_max: num_field(&fields, "health_max")?,
        inner_str_current: num_field(&fields, "inner_str_current")?,
        inner_str_max: num_field(&fields, "inner_str_max")?,
        profession: num_field(&fields, "profession")?,
        level: num_field(&fields, "level")?,
        alignment: num_field(&fields, "alignment")?,
        position: LocationVector::with_orientation(
            num_field(&fields, "pos_x")?,
            num_field(&fields, "pos_y")?,
            num_field(&fields, "pos_z")?,
            num_field(&fields, "rotation")?,
        ),
        district: num_field(&fields, "district")?,
        is_online: field(&fields, "is_online")? == "1",
    })
}

fn character_to_block(ch: &CharacterRecord) -> String {
    format!(
        "character_id={}\naccount_id={}\nworld_id={}\nhandle={}\nfirst_name={}\nlast_name={}\n\
         experience={}\ninformation={}\nhealth_current={}\nhealth_max={}\n\
         inner_str_current={}\ninner_str_max={}\nprofession={}\nlevel={}\nalignment={}\n\
         pos_x={}\npos_y={}\npos_z={}\nrotation={}\ndistrict={}\nis_online={}\n",
        ch.character_id,
        ch.account_id,
        ch.world_id,
        ch.handle,
        ch.first_name,
        ch.last_name,
        ch.experience,
        ch.information,
        ch.health_current,
        ch.health_max,
        ch.inner_str_current,
        ch.inner_str_max,
        ch.profession,
        ch.level,
        ch.alignment,
        ch.position.x,
        ch.position.y,
        ch.position.z,
        ch.position.o,
        ch.district,
        if ch.is_online { 1 } else { 0 }
    )
}

fn mission_instance_from_block(block: &str) -> Result<MissionInstanceRecord, StoreError> {
    let mut record = MissionInstanceRecord::default();
    let mut saw_mission_id = false;
    for line in block.lines() {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| StoreError::Corrupt(format!("expected key=value, got '{}'", line)))?;
        match key.trim() {
            "mission_id" => {
                record.mission_id = parse_num(value.trim(), "mission_id")?;
                saw_mission_id = true;
            }
            "started_at" => record.started_at = parse_num(value.trim(), "started_at")?,
            "failed" => record.failed = value.trim() == "1",
            "objective" => {
                let (id, progress) = value.trim().split_once(':').ok_or_else(|| {
                    StoreError::Corrupt(format!("objective expects id:progress, got '{}'", value))
                })?;
                record.objectives.push((
                    parse_num(id, "objective id")?,
                    parse_num(progress, "objective progress")?,
                ));
            }
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown mission field '{}'",
                    other
                )))
            }
        }
    }
    if !saw_mission_id {
        return Err(StoreError::Corrupt(
            "mission block missing mission_id".to_string(),
        ));
    }
    Ok(record)
}

fn mission_instance_to_block(instance: &MissionInstanceRecord) -> String {
    let mut block = format!(
        "mission_id={}\nstarted_at={}\nfailed={}\n",
        instance.mission_id,
        instance.started_at,
        if instance.failed { 1 } else { 0 }
    );
    for (objective_id, progress) in &instance.objectives {
        block.push_str(&format!("objective={}:{}\n", objective_id, progress));
    }
    block
}

fn completed_from_block(block: &str) -> Result<CompletedMissionRecord, StoreError> {
    let fields = block_fields(block)?;
    Ok(CompletedMissionRecord {
        mission_id: num_field(&fields, "mission_id")?,
        completed_at: num_field(&fields, "completed_at")?,
    })
}

fn completed_to_block(record: &CompletedMissionRecord) -> String {
    format!(
        "mission_id={}\ncompleted_at={}\n",
        record.mission_id, record.completed_at
    )
}

fn dialogue_from_block(block: &str) -> Result<(u32, Vec<u32>), StoreError> {
    let fields = block_fields(block)?;
    let npc_id = num_field(&fields, "npc_id")?;
    let visited_raw = field(&fields, "visited")?;
    let mut visited = Vec::new();
    for token in visited_raw.split_whitespace() {
        visited.push(parse_num(token, "visited")?);
    }
    Ok((npc_id, visited))
}

fn dialogue_to_block(npc_id: u32, visited: &[u32]) -> String {
    let ids: Vec<String> = visited.iter().map(|id| id.to_string()).collect();
    format!("npc_id={}\nvisited={}\n", npc_id, ids.join(" "))
}
