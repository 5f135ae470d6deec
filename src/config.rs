use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::net::game::TransportConfig;
use crate::telemetry::logging::LogLevel;

const DEFAULT_CONF_NAME: &str = "reality.conf";

/// Connection parameters of the backing store, kept for operators even
/// though the file-backed gateway only needs the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
    pub connection_count: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 3306,
            username: String::new(),
            password: String::new(),
            name: "reality".to_string(),
            connection_count: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_auth_connections: usize,
    pub max_margin_connections: usize,
    pub max_game_connections: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_auth_connections: 64,
            max_margin_connections: 64,
            max_game_connections: 256,
        }
    }
}

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub auth_listen_port: u16,
    pub margin_listen_port: u16,
    pub game_listen_port: u16,
    pub database: DatabaseConfig,
    pub limits: ConnectionLimits,
    pub transport: TransportConfig,
    pub log_level: LogLevel,
    pub autosave_secs: u64,
    pub min_client_version: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            auth_listen_port: 10001,
            margin_listen_port: 10002,
            game_listen_port: 10003,
            database: DatabaseConfig::default(),
            limits: ConnectionLimits::default(),
            transport: TransportConfig::default(),
            log_level: LogLevel::Info,
            autosave_secs: 30,
            min_client_version: 0,
        }
    }
}

impl AppConfig {
    /// `reality <root> [conf]` — the conf defaults to `<root>/reality.conf`
    /// and may be absent entirely.
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err("usage: reality <root> [conf]".to_string());
        }
        let root = Path::new(&args[1]).to_path_buf();
        let conf_path = if args.len() > 2 {
            PathBuf::from(&args[2])
        } else {
            root.join(DEFAULT_CONF_NAME)
        };
        let mut config = AppConfig {
            root,
            ..AppConfig::default()
        };
        match std::fs::read_to_string(&conf_path) {
            Ok(text) => config.apply(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(format!(
                    "config read failed for {}: {}",
                    conf_path.display(),
                    err
                ))
            }
        }
        Ok(config)
    }

    /// Applies `Key = value` lines; `#` starts a comment. Unknown keys are
    /// rejected so typos surface at boot.
    pub fn apply(&mut self, text: &str) -> Result<(), String> {
        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("expected Key = value at line {}", line_no))?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "Auth.ListenPort" => self.auth_listen_port = parse(value, key, line_no)?,
                "Margin.ListenPort" => self.margin_listen_port = parse(value, key, line_no)?,
                "Game.ListenPort" => self.game_listen_port = parse(value, key, line_no)?,
                "Database.Hostname" => self.database.hostname = value.to_string(),
                "Database.Port" => self.database.port = parse(value, key, line_no)?,
                "Database.Username" => self.database.username = value.to_string(),
                "Database.Password" => self.database.password = value.to_string(),
                "Database.Name" => self.database.name = value.to_string(),
                "Database.ConnectionCount" => {
                    self.database.connection_count = parse(value, key, line_no)?
                }
                "Limits.MaxAuthConnections" => {
                    self.limits.max_auth_connections = parse(value, key, line_no)?
                }
                "Limits.MaxMarginConnections" => {
                    self.limits.max_margin_connections = parse(value, key, line_no)?
                }
                "Limits.MaxGameConnections" => {
                    self.limits.max_game_connections = parse(value, key, line_no)?
                }
                "Transport.TimeoutMs" => {
                    self.transport.timeout = Duration::from_millis(parse(value, key, line_no)?)
                }
                "Transport.PingMs" => {
                    self.transport.ping_interval =
                        Duration::from_millis(parse(value, key, line_no)?)
                }
                "Transport.ResendMs" => {
                    self.transport.resend_interval =
                        Duration::from_millis(parse(value, key, line_no)?)
                }
                "Transport.MaxRetries" => {
                    self.transport.max_retries = parse(value, key, line_no)?
                }
                "Transport.WindowSize" => {
                    self.transport.window_size = parse(value, key, line_no)?
                }
                "Log.Level" => {
                    self.log_level = LogLevel::parse(value).ok_or_else(|| {
                        format!("Log.Level expects debug|info|warn|error at line {}", line_no)
                    })?
                }
                "World.AutosaveSecs" => self.autosave_secs = parse(value, key, line_no)?,
                "Auth.MinClientVersion" => {
                    self.min_client_version = parse(value, key, line_no)?
                }
                other => return Err(format!("unknown config key '{}' at line {}", other, line_no)),
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str, line_no: usize) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("{} has invalid value '{}' at line {}", key, value, line_no))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let config = AppConfig::default();
        assert_eq!(config.auth_listen_port, 10001);
        assert_eq!(config.margin_listen_port, 10002);
        assert_eq!(config.game_listen_port, 10003);
        assert_eq!(config.autosave_secs, 30);
    }

    #[test]
    fn apply_overrides_recognised_keys() {
        let mut config = AppConfig::default();
        config
            .apply(
                "# ports\n\
                 Auth.ListenPort = 11001\n\
                 Game.ListenPort = 11003   # udp\n\
                 Database.Hostname = db.internal\n\
                 Limits.MaxGameConnections = 512\n\
                 Transport.TimeoutMs = 15000\n\
                 Transport.MaxRetries = 4\n\
                 Log.Level = debug\n\
                 World.AutosaveSecs = 60\n",
            )
            .expect("apply");
        assert_eq!(config.auth_listen_port, 11001);
        assert_eq!(config.game_listen_port, 11003);
        assert_eq!(config.database.hostname, "db.internal");
        assert_eq!(config.limits.max_game_connections, 512);
        assert_eq!(config.transport.timeout, Duration::from_secs(15));
        assert_eq!(config.transport.max_retries, 4);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.autosave_secs, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut config = AppConfig::default();
        let err = config.apply("Auth.LstenPort = 1").unwrap_err();
        assert!(err.contains("unknown config key"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let mut config = AppConfig::default();
        assert!(config.apply("just words").is_err());
        assert!(config.apply("Auth.ListenPort = many").is_err());
    }

    #[test]
    fn from_args_requires_root() {
        let err = AppConfig::from_args(&["reality".to_string()]).unwrap_err();
        assert!(err.contains("usage"));
    }
}
