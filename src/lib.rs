pub mod admin;
mod config;
pub mod crypto;
pub mod dialogue;
pub mod entities;
pub mod missions;
pub mod net;
pub mod persistence;
pub mod telemetry;
pub mod world;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::crypto::keys::{AuthKeyring, SignKeySize};
use crate::dialogue::DialogueEngine;
use crate::entities::object::ObjectIdAllocator;
use crate::missions::MissionEngine;
use crate::net::auth::AuthContext;
use crate::net::game::GameContext;
use crate::net::margin::MarginContext;
use crate::net::server::{
    hook_signals, run_auth_server, run_console, run_game_server, run_margin_server,
    ListenerConfig, ServerControl,
};
use crate::net::session_keys::SessionKeyTable;
use crate::persistence::autosave::AutosaveConfig;
use crate::persistence::definitions::{load_dialogue_entries, load_mission_definitions};
use crate::persistence::store::Store;
use crate::telemetry::logging;
use crate::world::manager::{builtin_districts, WorldManager};
use crate::world::navmesh::{NavMesh, NavMeshService};

pub use config::AppConfig;
pub use net::packet::{PacketReader, PacketWriter};

const MAIN_LOOP_POLL: Duration = Duration::from_millis(100);

pub fn run(args: &[String]) -> Result<(), String> {
    let config = AppConfig::from_args(args)?;
    logging::init(&config.root, config.log_level)?;
    logging::log_info(&format!(
        "reality starting, root {} (store '{}')",
        config.root.display(),
        config.database.name
    ));

    let store = Arc::new(Store::open(&config.root).map_err(|err| err.to_string())?);
    let keyring = Arc::new(AuthKeyring::load_or_generate(&config.root.join("keys"))?);
    let sessions = Arc::new(SessionKeyTable::new());
    let control = Arc::new(ServerControl::new());
    hook_signals(&control)?;

    // Navmeshes load once; a district without one stays open.
    let districts = builtin_districts();
    let mut navmesh = NavMeshService::new();
    for district in &districts {
        let path = config
            .root
            .join("nav")
            .join(format!("{}.nav", district.name.to_ascii_lowercase()));
        if path.exists() {
            navmesh.insert(district.id, NavMesh::load(&path)?);
            logging::log_info(&format!("navmesh loaded for {}", district.name));
        } else {
            logging::log_debug(&format!("no navmesh for {}, treating as open", district.name));
        }
    }
    let world = Arc::new(WorldManager::new(districts, navmesh));

    let mission_defs =
        load_mission_definitions(&config.root.join("data").join("missions.json"))?;
    let dialogue_entries =
        load_dialogue_entries(&config.root.join("data").join("dialogues.json"))?;
    logging::log_info(&format!(
        "content loaded: {} missions, {} dialogue entries",
        mission_defs.len(),
        dialogue_entries.len()
    ));
    let missions = Arc::new(MissionEngine::new(mission_defs, Arc::clone(&store)));
    let dialogue = Arc::new(DialogueEngine::new(dialogue_entries, Arc::clone(&store)));

    let auth_ctx = Arc::new(AuthContext {
        store: Arc::clone(&store),
        keyring,
        sessions: Arc::clone(&sessions),
        min_client_version: config.min_client_version,
        sign_key_size: SignKeySize::Bits1024,
    });
    let margin_ctx = Arc::new(MarginContext {
        store: Arc::clone(&store),
        sessions: Arc::clone(&sessions),
        missions,
        dialogue,
    });
    let game_ctx = Arc::new(GameContext {
        store: Arc::clone(&store),
        sessions,
        world,
        allocator: Arc::new(ObjectIdAllocator::new()),
        transport: config.transport,
        autosave: AutosaveConfig {
            interval_seconds: config.autosave_secs,
        },
        live_characters: Arc::new(Mutex::new(HashSet::new())),
    });

    let idle_timeout = config.transport.timeout;
    let auth_config = ListenerConfig {
        bind_addr: format!("0.0.0.0:{}", config.auth_listen_port),
        max_connections: config.limits.max_auth_connections,
        idle_timeout,
    };
    let margin_config = ListenerConfig {
        bind_addr: format!("0.0.0.0:{}", config.margin_listen_port),
        max_connections: config.limits.max_margin_connections,
        idle_timeout,
    };
    let game_config = ListenerConfig {
        bind_addr: format!("0.0.0.0:{}", config.game_listen_port),
        max_connections: config.limits.max_game_connections,
        idle_timeout,
    };

    let auth_control = Arc::clone(&control);
    let auth_handle =
        thread::spawn(move || run_auth_server(auth_config, auth_ctx, auth_control));
    let margin_control = Arc::clone(&control);
    let margin_handle =
        thread::spawn(move || run_margin_server(margin_config, margin_ctx, margin_control));
    let game_control = Arc::clone(&control);
    let game_handle =
        thread::spawn(move || run_game_server(game_config, game_ctx, game_control));

    // The console may sit in a blocking read at shutdown; never joined.
    let console_store = Arc::clone(&store);
    let console_control = Arc::clone(&control);
    thread::spawn(move || run_console(console_store, console_control));

    while control.is_running() {
        thread::sleep(MAIN_LOOP_POLL);
    }
    logging::log_info("shutdown requested, stopping listeners");

    // Joined in reverse start order.
    for (name, handle) in [
        ("game", game_handle),
        ("margin", margin_handle),
        ("auth", auth_handle),
    ] {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => eprintln!("{} server error: {}", name, err),
            Err(_) => eprintln!("{} server thread panicked", name),
        }
    }
    logging::log_info("reality stopped");
    Ok(())
}
