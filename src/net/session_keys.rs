use std::collections::HashMap;
use std::sync::Mutex;

/// Live session minted by Auth. `character_id` stays 0 until character
/// selection binds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub account_id: u32,
    pub character_id: u64,
}

/// The shared secret table binding Auth, Game and Margin connections of one
/// session. Keys are one-to-one with live accounts: a second Auth success for
/// the same account invalidates the prior key.
#[derive(Debug, Default)]
pub struct SessionKeyTable {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionKeyTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: String, account_id: u32) {
        let mut entries = self.lock_entries();
        entries.retain(|_, entry| entry.account_id != account_id);
        entries.insert(
            key,
            SessionEntry {
                account_id,
                character_id: 0,
            },
        );
    }

    pub fn bind_character(&self, key: &str, character_id: u64) -> bool {
        let mut entries = self.lock_entries();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.character_id = character_id;
                true
            }
            None => false,
        }
    }

    pub fn validate(&self, key: &str) -> Option<SessionEntry> {
        self.lock_entries().get(key).cloned()
    }

    /// Game/Margin handshake check: the key must exist and have this
    /// character bound.
    pub fn validate_character(&self, key: &str, character_id: u64) -> Option<SessionEntry> {
        self.lock_entries()
            .get(key)
            .filter(|entry| entry.character_id == character_id && character_id != 0)
            .cloned()
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock_entries().remove(key).is_some()
    }

    pub fn invalidate_account(&self, account_id: u32) {
        self.lock_entries()
            .retain(|_, entry| entry.account_id != account_id);
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
