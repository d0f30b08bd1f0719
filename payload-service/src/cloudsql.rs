//! Cloud SQL collaborators for the proxied connection path.
//!
//! - `MetadataTokenSource`: mints IAM access tokens from the metadata server
//! - `SqlAdminClient`: resolves an instance connection name to its addresses

use serde::Deserialize;

use common::errors::{AppError, AppResult};
use common::models::{Driver, InstanceConnectionName, IpType};

/// Short-lived OAuth2 access token.
#[derive(Clone, Deserialize)]
pub struct AccessToken {
    access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl AccessToken {
    #[cfg(test)]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            access_token: secret.into(),
            expires_in: None,
        }
    }

    pub fn secret(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Fetches tokens for the default service account from the metadata server.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    url: String,
}

impl MetadataTokenSource {
    pub fn new(http: reqwest::Client, metadata_host: &str) -> Self {
        Self {
            http,
            url: format!(
                "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
                metadata_host
            ),
        }
    }

    pub async fn token(&self) -> AppResult<AccessToken> {
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("metadata server unreachable: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Authentication(format!(
                "metadata server refused token request: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AppError::ExternalService(format!(
                "metadata server returned {}",
                status
            )));
        }

        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("invalid token response: {}", e)))?;

        if token.secret().is_empty() {
            return Err(AppError::Authentication("metadata server returned an empty token".into()));
        }
        tracing::debug!(expires_in = ?token.expires_in, "Fetched IAM access token");
        Ok(token)
    }
}

/// Client for the Cloud SQL Admin API `connectSettings` call.
pub struct SqlAdminClient {
    http: reqwest::Client,
    endpoint: String,
}

impl SqlAdminClient {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn connect_settings_url(&self, instance: &InstanceConnectionName) -> String {
        format!(
            "{}/sql/v1beta4/projects/{}/instances/{}/connectSettings",
            self.endpoint, instance.project, instance.instance
        )
    }

    pub async fn connect_settings(
        &self,
        instance: &InstanceConnectionName,
        token: &AccessToken,
    ) -> AppResult<ConnectSettings> {
        let response = self
            .http
            .get(self.connect_settings_url(instance))
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Cloud SQL Admin API unreachable: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Authentication(format!(
                "Cloud SQL Admin API denied access to {}: {}",
                instance, status
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::DatabaseConnection(format!(
                "Cloud SQL instance {} not found",
                instance
            )));
        }
        if !status.is_success() {
            return Err(AppError::ExternalService(format!(
                "Cloud SQL Admin API returned {} for {}",
                status, instance
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("invalid connectSettings response: {}", e)))
    }
}

/// Subset of the `connectSettings` response we rely on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSettings {
    #[serde(default)]
    pub ip_addresses: Vec<IpMapping>,
    pub region: Option<String>,
    pub database_version: Option<String>,
    #[serde(default)]
    pub server_ca_cert: Option<SslCert>,
}

/// PEM certificate as returned by the Admin API.
#[derive(Debug, Clone, Deserialize)]
pub struct SslCert {
    pub cert: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpMapping {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip_address: String,
}

impl ConnectSettings {
    /// Rejects instances in another region or running another engine.
    pub fn verify(&self, instance: &InstanceConnectionName, driver: Driver) -> AppResult<()> {
        if let Some(region) = &self.region {
            if region != &instance.region {
                return Err(AppError::Config(format!(
                    "instance {} is in region '{}', not '{}'",
                    instance, region, instance.region
                )));
            }
        }

        if let Some(version) = &self.database_version {
            if !version.starts_with(driver.version_prefix()) {
                return Err(AppError::Config(format!(
                    "instance {} runs {}, which the {} driver cannot talk to",
                    instance, version, driver
                )));
            }
        }

        Ok(())
    }

    /// CA the instance's server certificate must chain to.
    pub fn server_ca_pem(&self) -> AppResult<&str> {
        self.server_ca_cert
            .as_ref()
            .map(|ca| ca.cert.as_str())
            .filter(|pem| !pem.trim().is_empty())
            .ok_or_else(|| {
                AppError::ExternalService("connectSettings carries no server CA certificate".into())
            })
    }

    /// The address of the requested type. No fallback to other types.
    pub fn address_for(&self, ip_type: IpType) -> AppResult<&str> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.kind == ip_type.api_name())
            .map(|ip| ip.ip_address.as_str())
            .ok_or_else(|| {
                AppError::DatabaseConnection(format!(
                    "instance has no {} address",
                    ip_type.api_name()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceConnectionName {
        "proj:us-central1:main".parse().unwrap()
    }

    fn settings(json: &str) -> ConnectSettings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_private_address_is_selected() {
        let s = settings(
            r#"{
                "kind": "sql#connectSettings",
                "ipAddresses": [
                    {"type": "PRIMARY", "ipAddress": "34.1.2.3"},
                    {"type": "PRIVATE", "ipAddress": "10.20.0.3"}
                ],
                "region": "us-central1",
                "databaseVersion": "MYSQL_8_0",
                "serverCaCert": {
                    "kind": "sql#sslCert",
                    "cert": "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"
                }
            }"#,
        );

        s.verify(&instance(), Driver::MySql).unwrap();
        assert_eq!(s.address_for(IpType::Private).unwrap(), "10.20.0.3");
        assert!(s.server_ca_pem().unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_missing_server_ca_is_an_error() {
        let s = settings(r#"{"ipAddresses": [{"type": "PRIVATE", "ipAddress": "10.20.0.3"}]}"#);
        assert!(matches!(s.server_ca_pem(), Err(AppError::ExternalService(_))));

        let s = settings(r#"{"serverCaCert": {"cert": ""}}"#);
        assert!(s.server_ca_pem().is_err());
    }

    #[test]
    fn test_public_only_instance_is_rejected_for_private() {
        let s = settings(r#"{"ipAddresses": [{"type": "PRIMARY", "ipAddress": "34.1.2.3"}]}"#);

        let err = s.address_for(IpType::Private).unwrap_err();
        assert!(matches!(err, AppError::DatabaseConnection(_)));
    }

    #[test]
    fn test_region_mismatch() {
        let s = settings(r#"{"region": "europe-west1", "databaseVersion": "MYSQL_8_0"}"#);
        assert!(s.verify(&instance(), Driver::MySql).is_err());
    }

    #[test]
    fn test_wrong_engine() {
        let s = settings(r#"{"region": "us-central1", "databaseVersion": "POSTGRES_15"}"#);
        assert!(s.verify(&instance(), Driver::MySql).is_err());
    }

    #[test]
    fn test_connect_settings_url() {
        let client = SqlAdminClient::new(reqwest::Client::new(), "https://sqladmin.googleapis.com/");
        assert_eq!(
            client.connect_settings_url(&instance()),
            "https://sqladmin.googleapis.com/sql/v1beta4/projects/proj/instances/main/connectSettings"
        );
    }

    #[test]
    fn test_token_response_and_redaction() {
        let token: AccessToken = serde_json::from_str(
            r#"{"access_token": "ya29.abc", "expires_in": 3599, "token_type": "Bearer"}"#,
        )
        .unwrap();

        assert_eq!(token.secret(), "ya29.abc");
        assert_eq!(token.expires_in, Some(3599));
        assert!(!format!("{:?}", token).contains("ya29"));
    }
}
