use crate::error::{ServerError, ServerResult};
use log::warn;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read-only typed access to key/value settings
pub trait ConfigSource {
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_bool(&self, key: &str, default: bool) -> bool;
}

/// Flat string-keyed settings.
///
/// Values that do not parse as the requested type fall back to the default.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    /// Load settings from a flat JSON object. Numbers, strings and booleans
    /// are accepted; nested values are rejected.
    pub fn from_json_str(content: &str) -> ServerResult<Self> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(content)?;
        let mut props = Self::new();
        for (key, value) in raw {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ServerError::Config(format!(
                        "unsupported value for {}: {}",
                        key, other
                    )))
                }
            };
            props.values.insert(key, text);
        }
        Ok(props)
    }

    /// Load settings from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

impl ConfigSource for Properties {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring non-numeric value {:?} for {}", raw, key);
                default
            }),
            None => default,
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "yes" || v == "1" => true,
            Some(v) if v == "false" || v == "no" || v == "0" => false,
            Some(v) => {
                warn!("Ignoring non-boolean value {:?} for {}", v, key);
                default
            }
            None => default,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub backlog_size: u32,
    pub accept_timeout: Duration,
    pub server_name: String,

    // Keep-alive
    pub keep_alive_timeout: Duration,
    /// Advertised in the `keep-alive: max=` header
    pub max_keep_alive_requests: u32,
    /// Hard cap on requests served over one connection
    pub max_requests_per_connection: usize,

    /// Largest non-multipart request body read into memory
    pub max_body_size: u64,

    // Uploads
    pub max_upload_size: u64,
    pub upload_dir: Option<PathBuf>,

    // Sessions
    pub session_timeout: Duration,
    pub session_cookie_name: String,
    pub auto_sessions: bool,
    pub session_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 8080,
            backlog_size: 1024,
            accept_timeout: Duration::from_secs(5),
            server_name: "servlet-core".to_string(),

            keep_alive_timeout: Duration::from_secs(5),
            max_keep_alive_requests: 100,
            max_requests_per_connection: 100,

            max_body_size: 1024 * 1024, // 1 MB

            max_upload_size: 10 * 1024 * 1024, // 10 MB
            upload_dir: None,

            session_timeout: Duration::from_secs(30 * 60),
            session_cookie_name: "SESSIONID".to_string(),
            auto_sessions: true,
            session_sweep_interval: Duration::from_secs(30),
        }
    }
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every setting from a config source, defaulting what is missing
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let d = Self::default();

        let port = source.get_int("server.port", d.port as i64);
        let port = u16::try_from(port).unwrap_or_else(|_| {
            warn!("Port {} out of range, using {}", port, d.port);
            d.port
        });
        let upload_dir = source.get_string("upload.dir", "");

        Self {
            listen_address: source.get_string("server.address", &d.listen_address),
            port,
            backlog_size: non_negative(source.get_int("server.backlog", d.backlog_size as i64))
                .min(u32::MAX as u64) as u32,
            accept_timeout: Duration::from_millis(non_negative(
                source.get_int("server.accept_timeout", d.accept_timeout.as_millis() as i64),
            )),
            server_name: source.get_string("server.name", &d.server_name),

            keep_alive_timeout: Duration::from_secs(non_negative(
                source.get_int("keepalive.timeout", d.keep_alive_timeout.as_secs() as i64),
            )),
            max_keep_alive_requests: non_negative(
                source.get_int("keepalive.max", d.max_keep_alive_requests as i64),
            )
            .min(u32::MAX as u64) as u32,
            max_requests_per_connection: non_negative(
                source.get_int("connection.max_requests", d.max_requests_per_connection as i64),
            )
            .max(1) as usize,

            max_body_size: non_negative(
                source.get_int("request.max_body", d.max_body_size as i64),
            ),

            max_upload_size: non_negative(
                source.get_int("upload.max_size", d.max_upload_size as i64),
            ),
            upload_dir: if upload_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(upload_dir))
            },

            session_timeout: Duration::from_secs(non_negative(
                source.get_int("session.timeout", d.session_timeout.as_secs() as i64),
            )),
            session_cookie_name: source.get_string("session.cookie", &d.session_cookie_name),
            auto_sessions: source.get_bool("session.auto", d.auto_sessions),
            session_sweep_interval: Duration::from_secs(
                non_negative(source.get_int(
                    "session.sweep_interval",
                    d.session_sweep_interval.as_secs() as i64,
                ))
                .max(1),
            ),
        }
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the idle timeout between keep-alive requests
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Set the number of requests served before a connection is closed
    pub fn with_max_requests_per_connection(mut self, max: usize) -> Self {
        self.max_requests_per_connection = max.max(1);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_max_body_size(mut self, size: u64) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_max_upload_size(mut self, size: u64) -> Self {
        self.max_upload_size = size;
        self
    }

    pub fn with_upload_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_auto_sessions(mut self, enabled: bool) -> Self {
        self.auto_sessions = enabled;
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Directory temporary upload files are written to
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
