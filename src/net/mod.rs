pub mod auth;
pub mod framing;
pub mod game;
pub mod margin;
pub mod messages;
pub mod packet;
pub mod server;
pub mod session_keys;
