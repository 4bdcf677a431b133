//! Environment-driven configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Where fulfillment state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub lookup_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentConfig {
    pub store: StoreConfig,
    /// `None` disables delivery reconciliation.
    pub carrier: Option<CarrierConfig>,
    pub reconcile_interval: Duration,
}

impl FulfillmentConfig {
    pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 900;
    pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let use_persistent: bool = parse_or(&lookup, "USE_PERSISTENT_STORES", false)?;

        let store = if use_persistent {
            let database_url = lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing {
                    name: "DATABASE_URL",
                })?;
            StoreConfig::Postgres {
                database_url,
                max_connections: parse_or(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    Self::DEFAULT_MAX_CONNECTIONS,
                )?,
            }
        } else {
            StoreConfig::InMemory
        };

        let carrier = match lookup("CARRIER_API_URL").filter(|v| !v.trim().is_empty()) {
            Some(base_url) => Some(CarrierConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_token: lookup("CARRIER_API_TOKEN").filter(|v| !v.is_empty()),
                lookup_timeout: Duration::from_millis(parse_or(
                    &lookup,
                    "CARRIER_LOOKUP_TIMEOUT_MS",
                    Self::DEFAULT_LOOKUP_TIMEOUT_MS,
                )?),
            }),
            None => None,
        };

        let interval_secs: u64 = parse_or(
            &lookup,
            "RECONCILE_INTERVAL_SECS",
            Self::DEFAULT_RECONCILE_INTERVAL_SECS,
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "RECONCILE_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            store,
            carrier,
            reconcile_interval: Duration::from_secs(interval_secs),
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<FulfillmentConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FulfillmentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_local_dev_friendly() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.store, StoreConfig::InMemory);
        assert!(cfg.carrier.is_none());
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(900));
    }

    #[test]
    fn persistent_store_requires_database_url() {
        let err = config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing { name: "DATABASE_URL" });

        let cfg = config(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/depot"),
        ])
        .unwrap();
        assert_eq!(
            cfg.store,
            StoreConfig::Postgres {
                database_url: "postgres://localhost/depot".to_string(),
                max_connections: 5,
            }
        );
    }

    #[test]
    fn carrier_settings_are_read_together() {
        let cfg = config(&[
            ("CARRIER_API_URL", "https://track.example.com/"),
            ("CARRIER_API_TOKEN", "secret"),
            ("CARRIER_LOOKUP_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        let carrier = cfg.carrier.unwrap();
        assert_eq!(carrier.base_url, "https://track.example.com");
        assert_eq!(carrier.api_token.as_deref(), Some("secret"));
        assert_eq!(carrier.lookup_timeout, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config(&[("RECONCILE_INTERVAL_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::Invalid { name, .. } => assert_eq!(name, "RECONCILE_INTERVAL_SECS"),
            other => panic!("Expected Invalid, got {other:?}"),
        }
        assert!(config(&[("USE_PERSISTENT_STORES", "yes")]).is_err());
    }
}
