//! Connection models for the managed (Cloud SQL) connectivity path.

use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Database driver/dialect the proxied connection must speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// MySQL wire protocol.
    MySql,
}

impl Driver {
    /// Prefix of the Admin API `databaseVersion` values this driver can talk to.
    pub fn version_prefix(&self) -> &'static str {
        match self {
            Driver::MySql => "MYSQL",
        }
    }

    /// Default server port.
    pub fn default_port(&self) -> u16 {
        match self {
            Driver::MySql => 3306,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::MySql => write!(f, "mysql"),
        }
    }
}

/// Which of an instance's addresses a connection may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpType {
    /// VPC-internal address only.
    Private,
}

impl IpType {
    /// Address type label used by the Cloud SQL Admin API.
    pub fn api_name(&self) -> &'static str {
        match self {
            IpType::Private => "PRIVATE",
        }
    }
}

/// Cloud SQL instance connection name, `project:region:instance`.
///
/// Domain-scoped projects (`example.com:project:region:instance`) keep the
/// domain as part of `project`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConnectionName {
    pub project: String,
    pub region: String,
    pub instance: String,
}

impl FromStr for InstanceConnectionName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (project, region, instance) = match parts.as_slice() {
            [project, region, instance] => (project.to_string(), *region, *instance),
            [domain, project, region, instance] => {
                (format!("{}:{}", domain, project), *region, *instance)
            }
            _ => {
                return Err(AppError::Config(format!(
                    "invalid instance connection name '{}', expected project:region:instance",
                    s
                )))
            }
        };

        if project.is_empty()
            || project.ends_with(':')
            || project.starts_with(':')
            || region.is_empty()
            || instance.is_empty()
        {
            return Err(AppError::Config(format!(
                "invalid instance connection name '{}': empty component",
                s
            )));
        }

        Ok(Self {
            project,
            region: region.to_string(),
            instance: instance.to_string(),
        })
    }
}

impl fmt::Display for InstanceConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.instance)
    }
}
