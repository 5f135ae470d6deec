use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rsa::RsaPublicKey;

use crate::crypto;
use crate::crypto::keys::{encrypt_handshake, AuthKeyring, SignKeySize};
use crate::net::messages::*;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::session_keys::SessionKeyTable;
use crate::persistence::store::{CharacterRecord, Store, StoreError};
use crate::telemetry::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthState {
    Initial,
    ChallengeSent,
    Authenticating,
    Authenticated,
    CharacterList,
    CharacterSelected,
    Closed,
}

/// Shared collaborators of every auth session.
pub struct AuthContext {
    pub store: Arc<Store>,
    pub keyring: Arc<AuthKeyring>,
    pub sessions: Arc<SessionKeyTable>,
    pub min_client_version: u32,
    pub sign_key_size: SignKeySize,
}

/// Frames to send back, and whether the connection is done afterwards.
#[derive(Debug, Default)]
pub struct AuthReply {
    pub frames: Vec<(u16, Vec<u8>)>,
    pub close: bool,
}

impl AuthReply {
    fn send(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            frames: vec![(msg_type, payload)],
            close: false,
        }
    }

    fn send_and_close(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            frames: vec![(msg_type, payload)],
            close: true,
        }
    }

    fn close_silently() -> Self {
        Self {
            frames: Vec::new(),
            close: true,
        }
    }
}

/// Per-connection login state machine. The TCP plumbing lives in the server
/// module; this type only turns incoming messages into outgoing frames and
/// state transitions.
pub struct AuthSession {
    state: AuthState,
    account_id: u32,
    account_name: String,
    selected_world_id: u16,
    selected_character_id: u64,
    session_key: String,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession {
    pub fn new() -> Self {
        Self {
            state: AuthState::Initial,
            account_id: 0,
            account_name: String::new(),
            selected_world_id: 0,
            selected_character_id: 0,
            session_key: String::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn account_id(&self) -> u32 {
        self.account_id
    }

    pub fn selected_character_id(&self) -> u64 {
        self.selected_character_id
    }

    pub fn selected_world_id(&self) -> u16 {
        self.selected_world_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn is_authenticated(&self) -> bool {
        self.state >= AuthState::Authenticated && self.state != AuthState::Closed
    }

    /// Socket accepted: send the signed server key.
    pub fn on_connect(&mut self, ctx: &AuthContext) -> AuthReply {
        match ctx.keyring.challenge_blob(ctx.sign_key_size) {
            Ok(blob) => {
                self.state = AuthState::ChallengeSent;
                AuthReply::send(MSG_AUTH_CHALLENGE, blob)
            }
            Err(err) => {
                logging::log_error(&format!("auth challenge build failed: {}", err));
                self.state = AuthState::Closed;
                AuthReply::close_silently()
            }
        }
    }

    pub fn on_message(&mut self, ctx: &AuthContext, msg_type: u16, payload: &[u8]) -> AuthReply {
        match msg_type {
            MSG_AUTH_RESPONSE if self.state == AuthState::ChallengeSent => {
                self.handle_auth_response(ctx, payload)
            }
            MSG_WORLD_LIST_REQUEST if self.is_authenticated() => self.handle_world_list(ctx),
            MSG_CHAR_LIST_REQUEST if self.is_authenticated() => {
                self.handle_char_list(ctx, payload)
            }
            MSG_CHAR_CREATE_REQUEST if self.state == AuthState::CharacterList => {
                self.handle_char_create(ctx, payload)
            }
            MSG_CHAR_DELETE_REQUEST if self.state == AuthState::CharacterList => {
                self.handle_char_delete(ctx, payload)
            }
            MSG_CHAR_SELECT_REQUEST if self.state == AuthState::CharacterList => {
                self.handle_char_select(ctx, payload)
            }
            other => {
                // Unexpected for the current state: report and hold.
                logging::log_warn(&format!(
                    "auth message 0x{:04x} unexpected in state {:?}",
                    other, self.state
                ));
                AuthReply::send(MSG_AUTH_RESULT, build_auth_result(AUTH_NO_ACCESS, ""))
            }
        }
    }

    /// Idle too long; the server closes us.
    pub fn on_timeout(&mut self) {
        self.state = AuthState::Closed;
    }

    fn handle_auth_response(&mut self, ctx: &AuthContext, payload: &[u8]) -> AuthReply {
        self.state = AuthState::Authenticating;
        let plaintext = match ctx.keyring.decrypt_handshake(payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                // No response at all: a decrypt oracle is worse than a drop.
                logging::log_warn(&format!("auth response decrypt failed: {}", err));
                self.state = AuthState::Closed;
                return AuthReply::close_silently();
            }
        };
        let Some(credentials) = parse_credentials(&plaintext) else {
            logging::log_warn("auth response credential layout invalid");
            self.state = AuthState::Closed;
            return AuthReply::close_silently();
        };

        if credentials.client_version < ctx.min_client_version {
            self.state = AuthState::Closed;
            return AuthReply::send_and_close(
                MSG_AUTH_RESULT,
                build_auth_result(AUTH_INVALID_CLIENT_VERSION, ""),
            );
        }

        let account = match ctx.store.lookup_account(&credentials.username) {
            Ok(account) => account,
            Err(err) => return self.internal_error("account lookup", err),
        };
        // Hash against a fixed salt even for unknown users so both rejection
        // paths cost one hash plus one constant-time compare.
        let (stored_hash, salt, account) = match account {
            Some(account) => (
                account.password_hash.clone(),
                account.password_salt.clone(),
                Some(account),
            ),
            None => (
                "0000000000000000000000000000000000000000".to_string(),
                "00000000000000000000000000000000".to_string(),
                None,
            ),
        };
        let attempt = crypto::hash_password(&salt, &credentials.password);
        let matches = crypto::constant_time_eq(attempt.as_bytes(), stored_hash.as_bytes());
        let Some(account) = account.filter(|_| matches) else {
            self.state = AuthState::Closed;
            return AuthReply::send_and_close(
                MSG_AUTH_RESULT,
                build_auth_result(AUTH_INVALID_CREDENTIALS, ""),
            );
        };

        let session_key = crypto::generate_session_key();
        ctx.sessions.insert(session_key.clone(), account.account_id);
        if let Err(err) = ctx.store.touch_last_login(account.account_id, unix_now()) {
            logging::log_error(&format!("last_login update failed: {}", err));
        }

        self.account_id = account.account_id;
        self.account_name = account.username;
        self.session_key = session_key.clone();
        self.state = AuthState::Authenticated;
        logging::log_info(&format!("account '{}' authenticated", self.account_name));
        AuthReply::send(MSG_AUTH_RESULT, build_auth_result(AUTH_SUCCESS, &session_key))
    }

    fn handle_world_list(&mut self, ctx: &AuthContext) -> AuthReply {
        let worlds = match ctx.store.list_worlds() {
            Ok(worlds) => worlds,
            Err(err) => return self.internal_error("world list", err),
        };
        let mut writer = PacketWriter::new();
        writer.write_u16_le(worlds.len() as u16);
        for world in &worlds {
            writer.write_u16_le(world.world_id);
            writer.write_cstring_str(&world.world_name);
            writer.write_u8(world.status);
        }
        AuthReply::send(MSG_WORLD_LIST_RESPONSE, writer.into_vec())
    }

    fn handle_char_list(&mut self, ctx: &AuthContext, payload: &[u8]) -> AuthReply {
        let mut reader = PacketReader::new(payload);
        let Some(world_id) = reader.read_u16_le() else {
            return self.wire_error("char list request truncated");
        };
        let characters = match ctx.store.list_characters(self.account_id, world_id) {
            Ok(characters) => characters,
            Err(err) => return self.internal_error("character list", err),
        };
        self.selected_world_id = world_id;
        self.state = AuthState::CharacterList;
        let mut writer = PacketWriter::new();
        writer.write_u16_le(characters.len() as u16);
        for ch in &characters {
            writer.write_u64_le(ch.character_id);
            writer.write_cstring_str(&ch.handle);
            writer.write_cstring_str(&ch.first_name);
            writer.write_cstring_str(&ch.last_name);
            writer.write_u8(ch.level);
            writer.write_u8(ch.profession);
        }
        AuthReply::send(MSG_CHAR_LIST_RESPONSE, writer.into_vec())
    }

    fn handle_char_create(&mut self, ctx: &AuthContext, payload: &[u8]) -> AuthReply {
        let mut reader = PacketReader::new(payload);
        let parsed = (|| {
            let world_id = reader.read_u16_le()?;
            let handle = reader.read_cstring_lossy()?;
            let first_name = reader.read_cstring_lossy()?;
            let last_name = reader.read_cstring_lossy()?;
            let profession = reader.read_u8()?;
            Some((world_id, handle, first_name, last_name, profession))
        })();
        let Some((world_id, handle, first_name, last_name, profession)) = parsed else {
            return self.wire_error("char create request truncated");
        };
        if handle.trim().is_empty() {
            return AuthReply::send(
                MSG_CHAR_CREATE_RESPONSE,
                build_char_result(1, 0, "A handle is required."),
            );
        }
        let record = CharacterRecord::new_character(
            self.account_id,
            world_id,
            handle.trim().to_string(),
            first_name,
            last_name,
            profession,
            DISTRICT_RICHLAND,
        );
        match ctx.store.insert_character(record) {
            Ok(created) => {
                logging::log_info(&format!(
                    "account '{}' created character '{}'",
                    self.account_name, created.handle
                ));
                AuthReply::send(
                    MSG_CHAR_CREATE_RESPONSE,
                    build_char_result(0, created.character_id, ""),
                )
            }
            Err(StoreError::Conflict(_)) => AuthReply::send(
                MSG_CHAR_CREATE_RESPONSE,
                build_char_result(1, 0, "That handle is already taken."),
            ),
            Err(err) => self.internal_error("character create", err),
        }
    }

    fn handle_char_delete(&mut self, ctx: &AuthContext, payload: &[u8]) -> AuthReply {
        let mut reader = PacketReader::new(payload);
        let Some(character_id) = reader.read_u64_le() else {
            return self.wire_error("char delete request truncated");
        };
        match ctx.store.delete_character(character_id, self.account_id) {
            Ok(true) => AuthReply::send(MSG_CHAR_DELETE_RESPONSE, build_result(0, "")),
            Ok(false) => AuthReply::send(
                MSG_CHAR_DELETE_RESPONSE,
                build_result(1, "No such character."),
            ),
            Err(err) => self.internal_error("character delete", err),
        }
    }

    fn handle_char_select(&mut self, ctx: &AuthContext, payload: &[u8]) -> AuthReply {
        let mut reader = PacketReader::new(payload);
        let Some(character_id) = reader.read_u64_le() else {
            return self.wire_error("char select request truncated");
        };
        let character = match ctx.store.lookup_character(character_id) {
            Ok(character) => character,
            Err(err) => return self.internal_error("character select", err),
        };
        let owned = character
            .as_ref()
            .map(|ch| ch.account_id == self.account_id)
            .unwrap_or(false);
        if !owned {
            return AuthReply::send(
                MSG_CHAR_SELECT_RESPONSE,
                build_result(1, "No such character."),
            );
        }
        if !ctx.sessions.bind_character(&self.session_key, character_id) {
            return AuthReply::send(
                MSG_CHAR_SELECT_RESPONSE,
                build_result(1, "Session expired."),
            );
        }
        self.selected_character_id = character_id;
        self.state = AuthState::CharacterSelected;
        AuthReply::send(MSG_CHAR_SELECT_RESPONSE, build_result(0, ""))
    }

    fn wire_error(&mut self, what: &str) -> AuthReply {
        logging::log_warn(&format!("auth session: {}", what));
        self.state = AuthState::Closed;
        AuthReply::close_silently()
    }

    fn internal_error(&mut self, what: &str, err: StoreError) -> AuthReply {
        logging::log_error(&format!("auth session: {} failed: {}", what, err));
        self.state = AuthState::Closed;
        AuthReply::send_and_close(MSG_AUTH_RESULT, build_auth_result(AUTH_INTERNAL_ERROR, ""))
    }
}

struct Credentials {
    username: String,
    password: String,
    client_version: u32,
}

fn parse_credentials(plaintext: &[u8]) -> Option<Credentials> {
    let mut reader = PacketReader::new(plaintext);
    let username = reader.read_cstring_lossy()?;
    let password = reader.read_cstring_lossy()?;
    let client_version = reader.read_u32_le()?;
    Some(Credentials {
        username,
        password,
        client_version,
    })
}

fn build_auth_result(code: u16, session_key: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u16_le(code);
    writer.write_cstring_str(session_key);
    writer.into_vec()
}

fn build_result(code: u16, message: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u16_le(code);
    writer.write_cstring_str(message);
    writer.into_vec()
}

fn build_char_result(code: u16, character_id: u64, message: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u16_le(code);
    writer.write_u64_le(character_id);
    writer.write_cstring_str(message);
    writer.into_vec()
}

/// Client-side credential payload, encrypted against the advertised key.
pub fn build_auth_response(
    server_key: &RsaPublicKey,
    username: &str,
    password: &str,
    client_version: u32,
) -> Result<Vec<u8>, crate::crypto::CryptoError> {
    let mut writer = PacketWriter::new();
    writer.write_cstring_str(username);
    writer.write_cstring_str(password);
    writer.write_u32_le(client_version);
    encrypt_handshake(server_key, writer.as_slice())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
