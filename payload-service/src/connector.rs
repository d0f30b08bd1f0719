//! Database connection provider.
//!
//! Turns the configured connectivity mode into one live MySQL session:
//! - direct: host and static credentials taken verbatim from config
//! - proxied: Cloud SQL instance resolved to its private address, IAM token
//!   in place of a password

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection};

use common::config::{ConnectivityConfig, DirectConfig, ProxiedConfig};
use common::errors::{AppError, AppResult};
use common::models::{Driver, InstanceConnectionName, IpType, PayloadRow, PAYLOAD_QUERY};

use crate::cloudsql::{AccessToken, MetadataTokenSource, SqlAdminClient};

/// SQLSTATE MySQL reports for `ER_ACCESS_DENIED_ERROR`.
const ACCESS_DENIED_SQLSTATE: &str = "28000";

/// Produces one exclusively-owned database session per call.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> AppResult<Box<dyn PayloadConnection>>;
}

/// An open session able to run the payload query.
#[async_trait]
pub trait PayloadConnection: Send {
    /// Runs the payload query, yielding rows in result-set order.
    fn rows(&mut self) -> BoxStream<'_, AppResult<PayloadRow>>;

    /// Closes the session. Later calls are no-ops.
    async fn close(&mut self) -> AppResult<()>;
}

/// Builds the provider for the configured mode.
pub fn from_config(
    connectivity: &ConnectivityConfig,
    http_client: reqwest::Client,
) -> Arc<dyn ConnectionProvider> {
    match connectivity {
        ConnectivityConfig::Direct(config) => Arc::new(DirectProvider::new(config.clone())),
        ConnectivityConfig::Proxied(config) => {
            Arc::new(ProxiedProvider::new(config.clone(), http_client))
        }
    }
}

// ============== Dial plan ==============

/// What we authenticate with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Static password from configuration.
    Password(String),
    /// Short-lived IAM access token.
    IamToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::IamToken(_) => f.write_str("IamToken(***)"),
        }
    }
}

/// How the session's TLS is negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Use TLS when the server offers it.
    Preferred,
    /// Require TLS and verify the server certificate against this PEM CA.
    VerifyCa(String),
}

/// Fully resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub credential: Credential,
    pub tls: TlsPolicy,
}

impl ConnectionTarget {
    pub fn is_iam(&self) -> bool {
        matches!(self.credential, Credential::IamToken(_))
    }

    pub fn to_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);

        let options = match &self.tls {
            TlsPolicy::Preferred => options.ssl_mode(MySqlSslMode::Preferred),
            TlsPolicy::VerifyCa(pem) => options
                .ssl_mode(MySqlSslMode::VerifyCa)
                .ssl_ca_from_pem(pem.as_bytes().to_vec()),
        };

        match &self.credential {
            Credential::Password(password) => options.password(password),
            // IAM tokens travel via mysql_clear_password, only ever over TLS.
            Credential::IamToken(token) => options.password(token).enable_cleartext_plugin(true),
        }
    }

    async fn connect(&self) -> AppResult<Box<dyn PayloadConnection>> {
        tracing::debug!(host = %self.host, port = self.port, user = %self.user, iam = self.is_iam(), "Opening database session");

        let conn = self
            .to_options()
            .connect()
            .await
            .map_err(connect_error)?;

        Ok(Box::new(MySqlPayloadConnection { conn: Some(conn) }))
    }
}

fn connect_error(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(ACCESS_DENIED_SQLSTATE) => {
            AppError::Authentication(db.message().to_string())
        }
        _ => AppError::DatabaseConnection(e.to_string()),
    }
}

// ============== Direct ==============

/// Plain network connection, one attempt, no IAM.
pub struct DirectProvider {
    config: DirectConfig,
}

impl DirectProvider {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            host: self.config.host.clone(),
            port: self.config.port,
            user: self.config.user.clone(),
            database: self.config.database.clone(),
            credential: Credential::Password(self.config.password.clone()),
            tls: TlsPolicy::Preferred,
        }
    }
}

#[async_trait]
impl ConnectionProvider for DirectProvider {
    async fn acquire(&self) -> AppResult<Box<dyn PayloadConnection>> {
        self.target().connect().await
    }
}

// ============== Proxied ==============

/// Connection request handed to the managed-instance broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedConnectRequest {
    pub instance: InstanceConnectionName,
    pub driver: Driver,
    pub user: String,
    pub database: String,
    pub enable_iam_auth: bool,
    pub ip_type: IpType,
}

impl ProxiedConnectRequest {
    /// Dial plan for an already resolved instance address and its server CA.
    pub fn target(
        &self,
        address: &str,
        token: &AccessToken,
        server_ca_pem: &str,
    ) -> AppResult<ConnectionTarget> {
        if !self.enable_iam_auth {
            return Err(AppError::Config(
                "proxied connections require IAM authentication".into(),
            ));
        }

        Ok(ConnectionTarget {
            host: address.to_string(),
            port: self.driver.default_port(),
            user: self.user.clone(),
            database: self.database.clone(),
            credential: Credential::IamToken(token.secret().to_string()),
            tls: TlsPolicy::VerifyCa(server_ca_pem.to_string()),
        })
    }
}

/// Cloud SQL instance over its private address, authenticated with IAM.
pub struct ProxiedProvider {
    config: ProxiedConfig,
    admin: SqlAdminClient,
    tokens: MetadataTokenSource,
}

impl ProxiedProvider {
    pub fn new(config: ProxiedConfig, http_client: reqwest::Client) -> Self {
        Self {
            admin: SqlAdminClient::new(http_client.clone(), &config.admin_endpoint),
            tokens: MetadataTokenSource::new(http_client, &config.metadata_host),
            config,
        }
    }

    pub fn request(&self) -> ProxiedConnectRequest {
        ProxiedConnectRequest {
            instance: self.config.instance.clone(),
            driver: self.config.driver,
            user: self.config.user.clone(),
            database: self.config.database.clone(),
            enable_iam_auth: true,
            ip_type: IpType::Private,
        }
    }
}

#[async_trait]
impl ConnectionProvider for ProxiedProvider {
    async fn acquire(&self) -> AppResult<Box<dyn PayloadConnection>> {
        let request = self.request();

        let token = self.tokens.token().await?;
        let settings = self.admin.connect_settings(&request.instance, &token).await?;
        settings.verify(&request.instance, request.driver)?;
        let address = settings.address_for(request.ip_type)?;

        tracing::debug!(instance = %request.instance, address = %address, "Resolved Cloud SQL instance");

        request
            .target(address, &token, settings.server_ca_pem()?)?
            .connect()
            .await
    }
}

// ============== MySQL session ==============

/// Live MySQL session. Dropping it without `close` still shuts the socket.
pub struct MySqlPayloadConnection {
    conn: Option<MySqlConnection>,
}

#[async_trait]
impl PayloadConnection for MySqlPayloadConnection {
    fn rows(&mut self) -> BoxStream<'_, AppResult<PayloadRow>> {
        let Some(conn) = self.conn.as_mut() else {
            return futures::stream::once(async {
                Err(AppError::Internal("connection already closed".into()))
            })
            .boxed();
        };

        sqlx::query_as::<sqlx::MySql, PayloadRow>(PAYLOAD_QUERY)
            .fetch(conn)
            .map(|row| row.map_err(|e| AppError::DatabaseQuery(e.to_string())))
            .boxed()
    }

    async fn close(&mut self) -> AppResult<()> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .await
                .map_err(|e| AppError::DatabaseConnection(e.to_string())),
            None => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudsql::ConnectSettings;

    fn direct_config() -> DirectConfig {
        DirectConfig {
            host: "db1".into(),
            port: 3306,
            user: "u".into(),
            password: "p".into(),
            database: "app".into(),
        }
    }

    fn proxied_config() -> ProxiedConfig {
        ProxiedConfig {
            instance: "proj:us-central1:main".parse().unwrap(),
            driver: Driver::MySql,
            user: "svc-reader".into(),
            database: "app".into(),
            admin_endpoint: "http://127.0.0.1:1".into(),
            metadata_host: "127.0.0.1:1".into(),
        }
    }

    #[test]
    fn test_direct_target_uses_config_verbatim() {
        let target = DirectProvider::new(direct_config()).target();

        assert_eq!(
            target,
            ConnectionTarget {
                host: "db1".into(),
                port: 3306,
                user: "u".into(),
                database: "app".into(),
                credential: Credential::Password("p".into()),
                tls: TlsPolicy::Preferred,
            }
        );
        assert!(!target.is_iam());
    }

    #[test]
    fn test_proxied_request_enforces_iam_and_private_ip() {
        let provider = ProxiedProvider::new(proxied_config(), reqwest::Client::new());
        let request = provider.request();

        assert!(request.enable_iam_auth);
        assert_eq!(request.ip_type, IpType::Private);
        assert_eq!(request.driver, Driver::MySql);
        assert_eq!(request.instance.to_string(), "proj:us-central1:main");
        assert_eq!(request.user, "svc-reader");
    }

    const SERVER_CA: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";

    #[test]
    fn test_proxied_target_sends_token_not_password() {
        let provider = ProxiedProvider::new(proxied_config(), reqwest::Client::new());
        let token = AccessToken::new("ya29.short-lived");

        let target = provider
            .request()
            .target("10.20.0.3", &token, SERVER_CA)
            .unwrap();

        assert_eq!(target.host, "10.20.0.3");
        assert_eq!(target.port, 3306);
        assert_eq!(target.credential, Credential::IamToken("ya29.short-lived".into()));
        assert!(target.is_iam());
    }

    #[test]
    fn test_proxied_target_verifies_server_ca() {
        let provider = ProxiedProvider::new(proxied_config(), reqwest::Client::new());
        let settings: ConnectSettings = serde_json::from_str(
            r#"{
                "ipAddresses": [{"type": "PRIVATE", "ipAddress": "10.20.0.3"}],
                "serverCaCert": {"cert": "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"}
            }"#,
        )
        .unwrap();

        let target = provider
            .request()
            .target(
                settings.address_for(IpType::Private).unwrap(),
                &AccessToken::new("t"),
                settings.server_ca_pem().unwrap(),
            )
            .unwrap();

        assert_eq!(target.tls, TlsPolicy::VerifyCa(SERVER_CA.to_string()));
    }

    #[test]
    fn test_proxied_target_refuses_without_iam() {
        let provider = ProxiedProvider::new(proxied_config(), reqwest::Client::new());
        let mut request = provider.request();
        request.enable_iam_auth = false;

        assert!(request
            .target("10.20.0.3", &AccessToken::new("t"), SERVER_CA)
            .is_err());
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let target = DirectProvider::new(direct_config()).target();
        let rendered = format!("{:?}", target);
        assert!(rendered.contains("Password(***)"));
        assert!(!rendered.contains("\"p\""));
    }

    #[tokio::test]
    async fn test_proxied_acquire_surfaces_token_failure() {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        let provider = ProxiedProvider::new(proxied_config(), http);

        let err = match provider.acquire().await {
            Err(e) => e,
            Ok(_) => panic!("metadata server is unreachable"),
        };
        assert!(matches!(err, AppError::ExternalService(_)));
    }
}
