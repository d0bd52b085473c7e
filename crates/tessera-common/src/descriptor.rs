//! Connection descriptor grammar
//!
//! A descriptor is a semicolon-delimited list of `key=value` pairs, e.g.
//! `Provider=Tessera;Database=SALES;Server=db1;Port=1549;User Id=admin;Password=`.
//! Keys are matched case-insensitively. Values containing `;`, `"` or
//! surrounding whitespace are written double-quoted with `""` as the escape.
//!
//! `Provider`, `Database` and `Server` are required. A descriptor that lacks
//! one of them, or carries a key the grammar does not know, parses successfully
//! but reports `is_initialized() == false`; handlers reject it before doing work.

use crate::error::{Result, TesseraError};
use std::fmt;
use std::str::FromStr;

/// Default gateway port
pub const DEFAULT_PORT: u16 = 1549;
/// Default login when `User Id` is omitted
pub const DEFAULT_USER: &str = "admin";
/// Provider tag written by this crate's builders
pub const DEFAULT_PROVIDER: &str = "Tessera";

const KEY_PROVIDER: &str = "Provider";
const KEY_DATABASE: &str = "Database";
const KEY_SERVER: &str = "Server";
const KEY_PORT: &str = "Port";
const KEY_USER_ID: &str = "User Id";
const KEY_PASSWORD: &str = "Password";

/// Parsed connection descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub provider: Option<String>,
    pub database: Option<String>,
    pub server: Option<String>,
    pub port: u16,
    pub user_id: String,
    pub password: String,
    /// Keys the grammar does not recognise, kept so formatting stays lossless
    pub unknown: Vec<(String, String)>,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            provider: None,
            database: None,
            server: None,
            port: DEFAULT_PORT,
            user_id: DEFAULT_USER.to_string(),
            password: String::new(),
            unknown: Vec::new(),
        }
    }
}

impl ConnectionDescriptor {
    /// Build an initialized descriptor for `database` on `server:port`
    pub fn new(database: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            provider: Some(DEFAULT_PROVIDER.to_string()),
            database: Some(database.into()),
            server: Some(server.into()),
            port,
            ..Default::default()
        }
    }

    /// Set login credentials
    pub fn with_credentials(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.password = password.into();
        self
    }

    /// Parse a descriptor string. Only syntax errors (a pair without `=`,
    /// an unterminated quote, a non-numeric port) fail; missing or unknown keys
    /// produce an uninitialized descriptor instead.
    pub fn parse(input: &str) -> Result<Self> {
        let mut descriptor = ConnectionDescriptor::default();

        for (key, value) in split_pairs(input)? {
            match canonical_key(&key) {
                Some(KEY_PROVIDER) => descriptor.provider = Some(value),
                Some(KEY_DATABASE) => descriptor.database = Some(value),
                Some(KEY_SERVER) => descriptor.server = Some(value),
                Some(KEY_PORT) => {
                    descriptor.port = value.trim().parse().map_err(|_| {
                        TesseraError::InvalidDescriptor(format!("Port '{}' is not a valid port number", value))
                    })?;
                }
                Some(KEY_USER_ID) => descriptor.user_id = value,
                Some(KEY_PASSWORD) => descriptor.password = value,
                _ => descriptor.unknown.push((key, value)),
            }
        }

        Ok(descriptor)
    }

    /// True when all required keys are present and no unknown key was given
    pub fn is_initialized(&self) -> bool {
        self.missing_keys().is_empty() && self.unknown.is_empty()
    }

    /// Fail with a descriptive error unless the descriptor is initialized
    pub fn ensure_initialized(&self) -> Result<()> {
        let missing = self.missing_keys();
        if !missing.is_empty() {
            return Err(TesseraError::InvalidDescriptor(format!(
                "connection descriptor is uninitialized: missing {}",
                missing.join(", ")
            )));
        }
        if !self.unknown.is_empty() {
            let keys: Vec<&str> = self.unknown.iter().map(|(k, _)| k.as_str()).collect();
            return Err(TesseraError::InvalidDescriptor(format!(
                "connection descriptor is uninitialized: unknown key(s) {}",
                keys.join(", ")
            )));
        }
        Ok(())
    }

    /// Database name; empty when absent
    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or_default()
    }

    fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.provider.as_deref().map_or(true, str::is_empty) {
            missing.push(KEY_PROVIDER);
        }
        if self.database.as_deref().map_or(true, str::is_empty) {
            missing.push(KEY_DATABASE);
        }
        if self.server.as_deref().map_or(true, str::is_empty) {
            missing.push(KEY_SERVER);
        }
        missing
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(ref provider) = self.provider {
            pairs.push((KEY_PROVIDER, provider.clone()));
        }
        if let Some(ref database) = self.database {
            pairs.push((KEY_DATABASE, database.clone()));
        }
        if let Some(ref server) = self.server {
            pairs.push((KEY_SERVER, server.clone()));
        }
        pairs.push((KEY_PORT, self.port.to_string()));
        pairs.push((KEY_USER_ID, self.user_id.clone()));
        pairs.push((KEY_PASSWORD, self.password.clone()));
        for (key, value) in &self.unknown {
            pairs.push((key.as_str(), value.clone()));
        }

        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, quote_value(value))?;
        }
        Ok(())
    }
}

fn canonical_key(key: &str) -> Option<&'static str> {
    let normalized: String = key.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    match normalized.as_str() {
        "provider" => Some(KEY_PROVIDER),
        "database" => Some(KEY_DATABASE),
        "server" => Some(KEY_SERVER),
        "port" => Some(KEY_PORT),
        "user id" => Some(KEY_USER_ID),
        "password" => Some(KEY_PASSWORD),
        _ => None,
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains(';')
        || value.contains('"')
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Split `k=v;k="v;v"` into pairs, honouring quoted values
fn split_pairs(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        // key
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(';') if key.trim().is_empty() => key.clear(),
                Some(';') => {
                    return Err(TesseraError::InvalidDescriptor(format!(
                        "'{}' is not a key=value pair",
                        key.trim()
                    )))
                }
                Some(c) => key.push(c),
                None if key.trim().is_empty() => return Ok(pairs),
                None => {
                    return Err(TesseraError::InvalidDescriptor(format!(
                        "'{}' is not a key=value pair",
                        key.trim()
                    )))
                }
            }
        }

        // value
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        value.push('"');
                    }
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(TesseraError::InvalidDescriptor(format!(
                            "unterminated quoted value for '{}'",
                            key.trim()
                        )))
                    }
                }
            }
            // anything between the closing quote and the separator is ignored whitespace
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
                value.push(c);
            }
        }

        pairs.push((key.trim().to_string(), value));
        if chars.peek().is_none() {
            return Ok(pairs);
        }
    }
}
