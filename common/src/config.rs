//! Process configuration.
//!
//! Assembled once at startup from the environment and handed to the
//! connection provider explicitly; nothing downstream reads env vars.

use std::fmt;
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::connection::{Driver, InstanceConnectionName};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SQLADMIN_ENDPOINT: &str = "https://sqladmin.googleapis.com";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listener address.
    pub host: String,
    /// Listener port.
    pub port: u16,
    /// Upper bound on connection acquisition, credential exchange included.
    pub connect_timeout_secs: u64,
    /// Upper bound on one query, from issue to last row.
    pub query_timeout_secs: u64,
    /// Emit JSON-formatted logs.
    pub json_logs: bool,
    /// How to reach the database.
    pub connectivity: ConnectivityConfig,
}

/// Database connectivity mode. Exactly one is active per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityConfig {
    /// Plain network connection with static credentials.
    Direct(DirectConfig),
    /// Cloud SQL instance reached over its private address with IAM auth.
    Proxied(ProxiedConfig),
}

impl ConnectivityConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            ConnectivityConfig::Direct(_) => "direct",
            ConnectivityConfig::Proxied(_) => "proxied",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DirectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for DirectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedConfig {
    /// Instance identifier; the address is resolved through the Admin API.
    pub instance: InstanceConnectionName,
    pub driver: Driver,
    /// IAM database user.
    pub user: String,
    pub database: String,
    /// Cloud SQL Admin API base URL.
    pub admin_endpoint: String,
    /// Metadata server host used to mint IAM access tokens.
    pub metadata_host: String,
}

impl AppConfig {
    /// Loads configuration from process environment variables.
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let connectivity = match env.required("db_connection_type")?.to_lowercase().as_str() {
            "direct" => ConnectivityConfig::Direct(DirectConfig {
                host: env.required("db_host")?,
                port: env.parsed("db_port", Driver::MySql.default_port())?,
                user: env.required("db_user")?,
                password: env.verbatim("db_pass")?,
                database: env.required("db_name")?,
            }),
            "proxied" => ConnectivityConfig::Proxied(ProxiedConfig {
                instance: env.required("db_host")?.parse()?,
                driver: Driver::MySql,
                user: env.required("db_user")?,
                database: env.required("db_name")?,
                admin_endpoint: env
                    .optional("SQLADMIN_API_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_SQLADMIN_ENDPOINT.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                metadata_host: env
                    .optional("GCE_METADATA_HOST")
                    .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string()),
            }),
            other => {
                return Err(AppError::Config(format!(
                    "db_connection_type must be 'direct' or 'proxied', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            host: env
                .optional("SERVER_HOST")
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: env.parsed("SERVER_PORT", DEFAULT_PORT)?,
            connect_timeout_secs: env
                .parsed("DB_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            query_timeout_secs: env.parsed("DB_QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS)?,
            json_logs: env
                .optional("LOG_FORMAT")
                .is_some_and(|v| v.eq_ignore_ascii_case("json")),
            connectivity,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> AppResult<String> {
        self.optional(key)
            .ok_or_else(|| AppError::Config(format!("missing required setting '{}'", key)))
    }

    /// Secrets are taken as-is: no trimming, and an empty value is valid.
    fn verbatim(&self, key: &str) -> AppResult<String> {
        (self.0)(key)
            .ok_or_else(|| AppError::Config(format!("missing required setting '{}'", key)))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> AppResult<T> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::Config(format!("invalid value '{}' for '{}'", raw, key))),
            None => Ok(default),
        }
    }
}

/// Loads `.env` from the working directory without overriding variables
/// that are already set. Missing or unreadable files are ignored.
pub fn load_dotenv() {
    let Ok(content) = std::fs::read_to_string(".env") else {
        return;
    };

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value.trim().trim_matches('"'));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> AppResult<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_direct_mode() {
        let config = load(&[
            ("db_connection_type", "direct"),
            ("db_host", "db1"),
            ("db_user", "u"),
            ("db_pass", "p"),
            ("db_name", "app"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(
            config.connectivity,
            ConnectivityConfig::Direct(DirectConfig {
                host: "db1".into(),
                port: 3306,
                user: "u".into(),
                password: "p".into(),
                database: "app".into(),
            })
        );
    }

    #[test]
    fn test_proxied_mode_ignores_password() {
        let config = load(&[
            ("db_connection_type", "PROXIED"),
            ("db_host", "proj:us-central1:main"),
            ("db_user", "svc-reader"),
            ("db_name", "app"),
            ("SQLADMIN_API_ENDPOINT", "http://localhost:9000/"),
        ])
        .unwrap();

        let ConnectivityConfig::Proxied(proxied) = config.connectivity else {
            panic!("expected proxied mode");
        };
        assert_eq!(proxied.instance.instance, "main");
        assert_eq!(proxied.admin_endpoint, "http://localhost:9000");
        assert_eq!(proxied.metadata_host, "metadata.google.internal");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let err = load(&[
            ("db_connection_type", "socket"),
            ("db_host", "proj:us-central1:main"),
            ("db_user", "u"),
            ("db_name", "app"),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_direct_mode_requires_password() {
        let err = load(&[
            ("db_connection_type", "direct"),
            ("db_host", "db1"),
            ("db_user", "u"),
            ("db_name", "app"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("db_pass"));
    }

    #[test]
    fn test_password_is_taken_verbatim() {
        let password_of = |pass: &str| {
            let config = load(&[
                ("db_connection_type", "direct"),
                ("db_host", "db1"),
                ("db_user", "u"),
                ("db_pass", pass),
                ("db_name", "app"),
            ])
            .unwrap();
            match config.connectivity {
                ConnectivityConfig::Direct(direct) => direct.password,
                other => panic!("expected direct mode, got {:?}", other),
            }
        };

        assert_eq!(password_of(" p w "), " p w ");
        assert_eq!(password_of(""), "");
    }

    #[test]
    fn test_malformed_timeout() {
        let err = load(&[
            ("db_connection_type", "direct"),
            ("db_host", "db1"),
            ("db_user", "u"),
            ("db_pass", "p"),
            ("db_name", "app"),
            ("DB_QUERY_TIMEOUT_SECS", "soon"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("DB_QUERY_TIMEOUT_SECS"));
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let direct = DirectConfig {
            host: "db1".into(),
            port: 3306,
            user: "u".into(),
            password: "hunter2".into(),
            database: "app".into(),
        };
        assert!(!format!("{:?}", direct).contains("hunter2"));
    }
}
