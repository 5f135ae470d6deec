use crate::crypto;
use crate::net::messages::DISTRICT_RICHLAND;
use crate::persistence::store::{CharacterRecord, Store, StoreError};

/// Commands accepted on the server console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    CreateAccount { username: String, password: String },
    SetPassword { username: String, password: String },
    CreateWorld { name: String },
    CreateCharacter {
        world: String,
        username: String,
        handle: String,
        first_name: String,
        last_name: String,
    },
    Online,
    Shutdown,
    Help,
}

pub fn parse_console_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = parts.collect();
    match command.to_ascii_lowercase().as_str() {
        "createaccount" => match args.as_slice() {
            [username, password] => Ok(ConsoleCommand::CreateAccount {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err("usage: createaccount <username> <password>".to_string()),
        },
        "setpassword" => match args.as_slice() {
            [username, password] => Ok(ConsoleCommand::SetPassword {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err("usage: setpassword <username> <password>".to_string()),
        },
        "createworld" => match args.as_slice() {
            [name] => Ok(ConsoleCommand::CreateWorld {
                name: name.to_string(),
            }),
            _ => Err("usage: createworld <name>".to_string()),
        },
        "createcharacter" => match args.as_slice() {
            [world, username, handle, first_name, last_name] => {
                Ok(ConsoleCommand::CreateCharacter {
                    world: world.to_string(),
                    username: username.to_string(),
                    handle: handle.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                })
            }
            _ => Err(
                "usage: createcharacter <world> <username> <handle> <first> <last>".to_string(),
            ),
        },
        "online" => Ok(ConsoleCommand::Online),
        "shutdown" | "quit" | "exit" => Ok(ConsoleCommand::Shutdown),
        "help" | "?" => Ok(ConsoleCommand::Help),
        other => Err(format!("unknown command '{}', try 'help'", other)),
    }
}

pub const HELP_TEXT: &str = "commands:\n\
    createaccount <username> <password>\n\
    setpassword <username> <password>\n\
    createworld <name>\n\
    createcharacter <world> <username> <handle> <first> <last>\n\
    online\n\
    shutdown";

/// Store-side console commands. `Online`, `Shutdown` and `Help` are handled
/// by the console loop itself.
pub fn execute_store_command(command: &ConsoleCommand, store: &Store) -> Result<String, String> {
    match command {
        ConsoleCommand::CreateAccount { username, password } => {
            let salt = crypto::generate_salt(crypto::SALT_LEN);
            let hash = crypto::hash_password(&salt, password);
            match store.insert_account(username, &hash, &salt) {
                Ok(account) => Ok(format!(
                    "account '{}' created with id {}",
                    account.username, account.account_id
                )),
                Err(StoreError::Conflict(_)) => {
                    Err(format!("account '{}' already exists", username))
                }
                Err(err) => Err(err.to_string()),
            }
        }
        ConsoleCommand::SetPassword { username, password } => {
            let salt = crypto::generate_salt(crypto::SALT_LEN);
            let hash = crypto::hash_password(&salt, password);
            match store.update_password(username, &hash, &salt) {
                Ok(()) => Ok(format!("password changed for '{}'", username)),
                Err(StoreError::NotFound) => Err(format!("no account '{}'", username)),
                Err(err) => Err(err.to_string()),
            }
        }
        ConsoleCommand::CreateWorld { name } => match store.insert_world(name) {
            Ok(world) => Ok(format!(
                "world '{}' created with id {}",
                world.world_name, world.world_id
            )),
            Err(StoreError::Conflict(_)) => Err(format!("world '{}' already exists", name)),
            Err(err) => Err(err.to_string()),
        },
        ConsoleCommand::CreateCharacter {
            world,
            username,
            handle,
            first_name,
            last_name,
        } => {
            let world_row = store
                .list_worlds()
                .map_err(|err| err.to_string())?
                .into_iter()
                .find(|w| w.world_name.eq_ignore_ascii_case(world))
                .ok_or_else(|| format!("no world '{}'", world))?;
            let account = store
                .lookup_account(username)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("no account '{}'", username))?;
            let record = CharacterRecord::new_character(
                account.account_id,
                world_row.world_id,
                handle.clone(),
                first_name.clone(),
                last_name.clone(),
                0,
                DISTRICT_RICHLAND,
            );
            match store.insert_character(record) {
                Ok(created) => Ok(format!(
                    "character '{}' created with id {}",
                    created.handle, created.character_id
                )),
                Err(StoreError::Conflict(_)) => {
                    Err(format!("handle '{}' already exists", handle))
                }
                Err(err) => Err(err.to_string()),
            }
        }
        ConsoleCommand::Online | ConsoleCommand::Shutdown | ConsoleCommand::Help => {
            Err("not a store command".to_string())
        }
    }
}
