use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::admin::commands::{
    execute_store_command, parse_console_command, ConsoleCommand, HELP_TEXT,
};
use crate::net::auth::{AuthContext, AuthSession};
use crate::net::framing::{build_tcp_frame, read_tcp_frame, FrameReadError};
use crate::net::game::{GameContext, GameSession, GameSessionState, SessionEvent};
use crate::net::margin::{MarginContext, MarginSession};
use crate::persistence::store::Store;
use crate::telemetry::logging;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const FRAME_POLL: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TCP_PAYLOAD: usize = 0xffff;
const UDP_RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSignal {
    Running = 0,
    Shutdown = 1,
}

/// Shared stop flag, flipped by the console or a process signal.
#[derive(Debug, Default)]
pub struct ServerControl {
    signal: AtomicU8,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(ServerSignal::Running as u8),
        }
    }

    pub fn request_shutdown(&self) {
        self.signal
            .store(ServerSignal::Shutdown as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == ServerSignal::Running as u8
    }
}

/// Routes SIGINT/SIGTERM/SIGABRT into the stop flag.
#[cfg(unix)]
pub fn hook_signals(control: &Arc<ServerControl>) -> Result<(), String> {
    use signal_hook::consts::{SIGABRT, SIGINT, SIGTERM};
    for signal in [SIGINT, SIGTERM, SIGABRT] {
        let control = Arc::clone(control);
        unsafe {
            signal_hook::low_level::register(signal, move || control.request_shutdown())
                .map_err(|err| format!("signal hook failed for {}: {}", signal, err))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn hook_signals(_control: &Arc<ServerControl>) -> Result<(), String> {
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

// ---- auth listener ----

pub fn run_auth_server(
    config: ListenerConfig,
    ctx: Arc<AuthContext>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("auth listener nonblocking failed: {}", err))?;
    logging::log_info(&format!("auth server listening on {}", config.bind_addr));
    println!("reality: auth server listening on {}", config.bind_addr);

    let active = Arc::new(AtomicUsize::new(0));
    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if active.load(Ordering::SeqCst) >= config.max_connections {
                    logging::log_warn(&format!("auth connection {} refused: at capacity", addr));
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let ctx = Arc::clone(&ctx);
                let control = Arc::clone(&control);
                let active = Arc::clone(&active);
                let idle_timeout = config.idle_timeout;
                thread::spawn(move || {
                    if let Err(err) = handle_auth_connection(stream, ctx.as_ref(), control.as_ref(), idle_timeout) {
                        logging::log_error(&format!("auth connection {}: {}", addr, err));
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                logging::log_error(&format!("auth accept error: {}", err));
            }
        }
    }
    Ok(())
}

fn handle_auth_connection(
    mut stream: TcpStream,
    ctx: &AuthContext,
    control: &ServerControl,
    idle_timeout: Duration,
) -> Result<(), String> {
    stream
        .set_read_timeout(Some(FRAME_POLL))
        .map_err(|err| format!("read timeout failed: {}", err))?;
    stream
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .map_err(|err| format!("write timeout failed: {}", err))?;

    let mut session = AuthSession::new();
    let reply = session.on_connect(ctx);
    write_frames(&mut stream, &reply.frames)?;
    if reply.close {
        return Ok(());
    }

    let mut last_activity = Instant::now();
    while control.is_running() {
        match read_tcp_frame(&mut stream, MAX_TCP_PAYLOAD) {
            Ok((msg_type, payload)) => {
                last_activity = Instant::now();
                let reply = session.on_message(ctx, msg_type, &payload);
                write_frames(&mut stream, &reply.frames)?;
                if reply.close {
                    break;
                }
            }
            Err(FrameReadError::Timeout) => {
                if last_activity.elapsed() >= idle_timeout {
                    session.on_timeout();
                    break;
                }
            }
            Err(FrameReadError::Closed) => break,
            Err(err) => {
                logging::log_warn(&format!("auth frame error: {}", err));
                break;
            }
        }
    }
    Ok(())
}

// ---- margin listener ----

pub fn run_margin_server(
    config: ListenerConfig,
    ctx: Arc<MarginContext>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("margin listener nonblocking failed: {}", err))?;
    logging::log_info(&format!("margin server listening on {}", config.bind_addr));
    println!("reality: margin server listening on {}", config.bind_addr);

    let active = Arc::new(AtomicUsize::new(0));
    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if active.load(Ordering::SeqCst) >= config.max_connections {
                    logging::log_warn(&format!("margin connection {} refused: at capacity", addr));
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let ctx = Arc::clone(&ctx);
                let control = Arc::clone(&control);
                let active = Arc::clone(&active);
                let idle_timeout = config.idle_timeout;
                thread::spawn(move || {
                    if let Err(err) = handle_margin_connection(stream, ctx.as_ref(), control.as_ref(), idle_timeout)
                    {
                        logging::log_error(&format!("margin connection {}: {}", addr, err));
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                logging::log_error(&format!("margin accept error: {}", err));
            }
        }
    }
    Ok(())
}

fn handle_margin_connection(
    mut stream: TcpStream,
    ctx: &MarginContext,
    control: &ServerControl,
    idle_timeout: Duration,
) -> Result<(), String> {
    stream
        .set_read_timeout(Some(FRAME_POLL))
        .map_err(|err| format!("read timeout failed: {}", err))?;
    stream
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .map_err(|err| format!("write timeout failed: {}", err))?;

    let mut session = MarginSession::new();
    session.on_connect();
    let mut last_activity = Instant::now();
    while control.is_running() {
        match read_tcp_frame(&mut stream, MAX_TCP_PAYLOAD) {
            Ok((msg_type, payload)) => {
                last_activity = Instant::now();
                let reply = session.on_message(ctx, msg_type, &payload);
                write_frames(&mut stream, &reply.frames)?;
                if reply.close {
                    break;
                }
            }
            Err(FrameReadError::Timeout) => {
                if last_activity.elapsed() >= idle_timeout {
                    break;
                }
            }
            Err(FrameReadError::Closed) => break,
            Err(err) => {
                logging::log_warn(&format!("margin frame error: {}", err));
                break;
            }
        }
    }
    Ok(())
}

fn write_frames(stream: &mut TcpStream, frames: &[(u16, Vec<u8>)]) -> Result<(), String> {
    for (msg_type, payload) in frames {
        let frame = build_tcp_frame(*msg_type, payload);
        stream
            .write_all(&frame)
            .map_err(|err| format!("frame write failed: {}", err))?;
    }
    Ok(())
}

// ---- game listener ----

pub fn run_game_server(
    config: ListenerConfig,
    ctx: Arc<GameContext>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let socket = UdpSocket::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    socket
        .set_read_timeout(Some(ACCEPT_POLL))
        .map_err(|err| format!("game socket timeout failed: {}", err))?;
    logging::log_info(&format!("game server listening on {}", config.bind_addr));
    println!("reality: game server listening on {}", config.bind_addr);

    let mut sessions: HashMap<SocketAddr, GameSession> = HashMap::new();
    let mut buffer = vec![0u8; UDP_RECV_BUFFER];
    while control.is_running() {
        let mut pending: Vec<(SocketAddr, SessionEvent)> = Vec::new();

        match socket.recv_from(&mut buffer) {
            Ok((len, addr)) => {
                let now = Instant::now();
                if !sessions.contains_key(&addr) && sessions.len() >= config.max_connections {
                    logging::log_warn(&format!("game datagram from {} refused: at capacity", addr));
                } else {
                    let session = sessions
                        .entry(addr)
                        .or_insert_with(|| GameSession::new(addr, ctx.transport, ctx.autosave, now));
                    for event in session.on_datagram(ctx.as_ref(), &buffer[..len], now) {
                        pending.push((addr, event));
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                logging::log_error(&format!("game recv error: {}", err));
            }
        }

        let now = Instant::now();
        for (addr, session) in sessions.iter_mut() {
            for event in session.tick(ctx.as_ref(), now) {
                pending.push((*addr, event));
            }
        }

        route_events(&mut sessions, pending, now);
        flush_outgoing(&socket, &mut sessions);
        sessions.retain(|_, session| session.state() != GameSessionState::Closed);
    }

    // Orderly shutdown: every session persists and says goodbye once.
    let now = Instant::now();
    let mut pending = Vec::new();
    let addrs: Vec<SocketAddr> = sessions.keys().copied().collect();
    for addr in addrs {
        if let Some(session) = sessions.get_mut(&addr) {
            for event in session.begin_close(ctx.as_ref(), "server shutdown".to_string(), now) {
                pending.push((addr, event));
            }
        }
    }
    route_events(&mut sessions, pending, now);
    flush_outgoing(&socket, &mut sessions);
    Ok(())
}

/// District broadcasts and whispers need the whole session table.
fn route_events(
    sessions: &mut HashMap<SocketAddr, GameSession>,
    pending: Vec<(SocketAddr, SessionEvent)>,
    now: Instant,
) {
    for (origin, event) in pending {
        match event {
            SessionEvent::Broadcast { district, message } => {
                for (addr, session) in sessions.iter_mut() {
                    if *addr == origin || !session.is_in_world() {
                        continue;
                    }
                    if session.district() == Some(district) {
                        session.send(message.clone(), now);
                    }
                }
            }
            SessionEvent::Whisper { handle, message } => {
                let target = sessions.iter_mut().find(|(_, session)| {
                    session
                        .handle()
                        .map(|h| h.eq_ignore_ascii_case(&handle))
                        .unwrap_or(false)
                });
                match target {
                    Some((_, session)) => session.send(message, now),
                    None => logging::log_debug(&format!("whisper to unknown handle '{}'", handle)),
                }
            }
            SessionEvent::Closed { reason } => {
                logging::log_debug(&format!("game session {} closed: {}", origin, reason));
            }
        }
    }
}

fn flush_outgoing(socket: &UdpSocket, sessions: &mut HashMap<SocketAddr, GameSession>) {
    for (addr, session) in sessions.iter_mut() {
        for datagram in session.take_outgoing() {
            if let Err(err) = socket.send_to(&datagram, *addr) {
                logging::log_warn(&format!("game send to {} failed: {}", addr, err));
                break;
            }
        }
    }
}

// ---- console ----

/// Reads operator commands from stdin until shutdown. Spawned detached; a
/// blocked `read_line` must not hold up process exit.
pub fn run_console(store: Arc<Store>, control: Arc<ServerControl>) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    while control.is_running() {
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_console_command(trimmed) {
                    Ok(ConsoleCommand::Shutdown) => {
                        println!("reality: shutdown requested");
                        control.request_shutdown();
                        break;
                    }
                    Ok(ConsoleCommand::Help) => println!("{}", HELP_TEXT),
                    Ok(ConsoleCommand::Online) => match store.list_worlds() {
                        Ok(worlds) => {
                            for world in worlds {
                                println!(
                                    "world {} '{}' status {}",
                                    world.world_id, world.world_name, world.status
                                );
                            }
                        }
                        Err(err) => eprintln!("reality: {}", err),
                    },
                    Ok(command) => match execute_store_command(&command, &store) {
                        Ok(output) => println!("reality: {}", output),
                        Err(err) => eprintln!("reality: {}", err),
                    },
                    Err(err) => eprintln!("reality: {}", err),
                }
            }
            Err(err) => {
                logging::log_error(&format!("console read failed: {}", err));
                break;
            }
        }
    }
}
