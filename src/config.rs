//! Configuration file loading. An external collaborator per `SPEC_FULL.md`
//! §1 — kept deliberately thin: parse the TOML file in §6 into a typed,
//! read-only `Config` and nothing more.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dialect::DbType;
use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> String {
    "stdout".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    db_type: String,
    target_ip: String,
    target_port: u16,
    listen_ip: String,
    listen_port: u16,
    db_dir: PathBuf,
    learning: bool,
    #[serde(default = "default_action")]
    action: String,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    #[serde(default)]
    action_email: Option<String>,
    #[serde(default = "default_log_path")]
    log_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_action() -> String {
    "drop".to_string()
}

/// Typed, validated configuration. Read-only after `load` returns; shared via
/// `Arc` into every session.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_type: DbType,
    pub target_ip: String,
    pub target_port: u16,
    pub listen_ip: String,
    pub listen_port: u16,
    pub db_dir: PathBuf,
    pub learning: bool,
    pub action: String,
    pub action_email: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub log_path: String,
    pub log_level: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let db_type: DbType = raw.db_type.parse()?;

        if !matches!(raw.action.as_str(), "drop" | "pass" | "email") {
            return Err(ConfigError::UnknownAction(raw.action));
        }

        if let (Some(cert), Some(key)) = (&raw.tls_cert, &raw.tls_key) {
            // §6: proxy-terminated TLS is an Oracle-only capability.
            if db_type != DbType::Oracle {
                return Err(ConfigError::TlsNotSupported(raw.db_type));
            }
            if !cert.exists() {
                return Err(ConfigError::Certificate(format!("tls_cert not found: {}", cert.display())));
            }
            if !key.exists() {
                return Err(ConfigError::Certificate(format!("tls_key not found: {}", key.display())));
            }
        }

        Ok(Config {
            db_type,
            target_ip: raw.target_ip,
            target_port: raw.target_port,
            listen_ip: raw.listen_ip,
            listen_port: raw.listen_port,
            db_dir: raw.db_dir,
            learning: raw.learning,
            action: raw.action,
            action_email: raw.action_email,
            tls_cert: raw.tls_cert,
            tls_key: raw.tls_key,
            log_path: raw.log_path,
            log_level: raw.log_level,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_ip, self.target_port)
    }

    pub fn store_path(&self) -> PathBuf {
        crate::store::store_path(&self.db_dir, &self.target_ip, &self.db_type.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        db_type = "postgres"
        target_ip = "127.0.0.1"
        target_port = 5432
        listen_ip = "0.0.0.0"
        listen_port = 5433
        db_dir = "/var/lib/dbwarden"
        learning = true
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.db_type, DbType::Postgres);
        assert_eq!(cfg.action, "drop");
        assert_eq!(cfg.log_path, "stdout");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn rejects_unknown_db_type() {
        let text = MINIMAL.replace("postgres", "mssql");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn rejects_unknown_action() {
        let text = format!("{MINIMAL}\naction = \"carrier-pigeon\"");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn store_path_follows_target_ip_and_dialect_convention() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.store_path(), Path::new("/var/lib/dbwarden/127.0.0.1_postgres.db"));
    }

    #[test]
    fn rejects_unknown_config_keys() {
        let text = format!("{MINIMAL}\nfrobnicate = true");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn rejects_tls_for_non_oracle_dialect() {
        let text = format!("{MINIMAL}\ntls_cert = \"/tmp/does-not-exist.pem\"\ntls_key = \"/tmp/does-not-exist-key.pem\"");
        let err = Config::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::TlsNotSupported(_)));
    }
}
