use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

fn default_max_connections() -> u32 {
    10
}

/// Maximum records returned from a filtered fetch when the caller does not
/// narrow the limit further.
fn default_max_records() -> u64 {
    1000
}

/// One configured backend service. Connection fields are backend-specific:
/// `url` for SQL/MongoDB, `region`/`endpoint` for the AWS backends,
/// `instance_url` plus credentials for Salesforce.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub security_token: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

impl ServiceConfig {
    pub fn sql(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend_type: "sql".to_string(),
            url: Some(url.into()),
            database: None,
            max_connections: default_max_connections(),
            max_records: default_max_records(),
            region: None,
            endpoint: None,
            instance_url: None,
            username: None,
            password: None,
            client_id: None,
            client_secret: None,
            security_token: None,
            api_version: None,
        }
    }

    /// In-memory SQLite service for development and testing.
    pub fn memory_sqlite(name: impl Into<String>) -> Self {
        let mut config = Self::sql(name, "sqlite::memory:");
        // A pooled in-memory SQLite database must not fan out: every pool
        // connection would otherwise get its own private database.
        config.max_connections = 1;
        config
    }

    pub fn require_url(&self) -> ApiResult<&str> {
        self.url.as_deref().ok_or_else(|| {
            ApiError::Configuration(format!(
                "Service '{}' requires a connection 'url'.",
                self.name
            ))
        })
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.name.is_empty() {
            return Err(ApiError::Configuration(
                "Service name cannot be empty.".to_string(),
            ));
        }
        match self.backend_type.to_lowercase().as_str() {
            "sql" | "sqlite" | "postgres" | "postgresql" | "mongodb" | "mongo" => {
                self.require_url()?;
            }
            "salesforce" => {
                if self.instance_url.is_none() || self.username.is_none() {
                    return Err(ApiError::Configuration(format!(
                        "Service '{}' requires 'instance_url' and credentials.",
                        self.name
                    )));
                }
            }
            // AWS backends fall back to the default credential/region chain.
            "dynamodb" | "aws_dynamodb" | "sns" | "aws_sns" => {}
            other => {
                return Err(ApiError::Configuration(format!(
                    "Unsupported backend type '{}'.",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> ApiResult<AppConfig> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            ApiError::Configuration(format!(
                "Cannot read configuration file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|e| ApiError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration: one in-memory SQLite service named `db`.
    pub fn default_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            services: vec![ServiceConfig::memory_sqlite("db")],
        }
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.services.is_empty() {
            return Err(ApiError::Configuration(
                "At least one service must be configured.".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.name.as_str()) {
                return Err(ApiError::Configuration(format!(
                    "Duplicate service name '{}'.",
                    service.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.services[0].name, "db");
        assert_eq!(config.services[0].max_connections, 1);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  host: 0.0.0.0
  port: 8080
services:
  - name: main
    type: sql
    url: "postgres://app@localhost/app"
  - name: docs
    type: mongodb
    url: "mongodb://localhost:27017"
    database: app
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[1].database.as_deref(), Some("app"));
        assert_eq!(config.services[0].max_records, 1000);
    }

    #[test]
    fn test_missing_url_rejected() {
        let service = ServiceConfig {
            url: None,
            ..ServiceConfig::sql("broken", "x")
        };
        assert!(service.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            services: vec![
                ServiceConfig::memory_sqlite("db"),
                ServiceConfig::memory_sqlite("db"),
            ],
        };
        assert!(config.validate().is_err());
    }
}
