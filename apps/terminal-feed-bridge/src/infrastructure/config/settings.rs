//! Bridge Configuration Settings
//!
//! Configuration types for the bridge, loaded from environment variables.
//! Every setting except the push channel has a default.

use std::time::Duration;

use crate::application::services::{AuthSettings, NormalizerConfig, QuerySettings};
use crate::domain::{
    FieldCode, FieldInput, FieldList, PagingMode, PushChannel, RequestCount, ScreenSlot,
};

const DEFAULT_PROGRAM_ID: &str = "HFCOMMAGENT.HFCommAgentCtrl.1";
const DEFAULT_NODE_NAME: &str = "terminal-feed-bridge";
const DEFAULT_OUTPUT_FIELDS: &str = "8,9,30,31,32,33,6,40,41,42,43,1098,666";
const DEFAULT_INSTRUMENT_FIELDS: &str = "9001=FX,9002=D05GBP/AUD,GID=1003,9119=1";
const DEFAULT_REMOTE_ID_FIELD: &str = "ID";
const DEFAULT_DEDUP_WINDOW: usize = 4096;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Terminal login credentials.
#[derive(Clone)]
pub struct Credentials {
    user_id: String,
    password: String,
    cert_password: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(user_id: String, password: String, cert_password: String) -> Self {
        Self {
            user_id,
            password,
            cert_password,
        }
    }

    /// Get the user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the login password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Get the certificate password.
    #[must_use]
    pub fn cert_password(&self) -> &str {
        &self.cert_password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("cert_password", &"[REDACTED]")
            .finish()
    }
}

/// Terminal control settings.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    /// Vendor control program id.
    pub program_id: String,
    /// Login credentials; only the dispatch adapter needs them.
    pub credentials: Option<Credentials>,
    /// Node label for logs and health output.
    pub node_name: String,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            program_id: DEFAULT_PROGRAM_ID.to_string(),
            credentials: None,
            node_name: DEFAULT_NODE_NAME.to_string(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Terminal control settings.
    pub terminal: TerminalSettings,
    /// Push channel subscribed on connect.
    pub channel: PushChannel,
    /// Login modes.
    pub auth: AuthSettings,
    /// Query defaults.
    pub query: QuerySettings,
    /// Output fields of the date-range query.
    pub output_fields: FieldList,
    /// Push normalization.
    pub normalizer: NormalizerConfig,
    /// Server port settings.
    pub server: ServerSettings,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// structured value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let channel = PushChannel::new(
            env.required("TERMINAL_REAL_NAME")?,
            env.required("TERMINAL_SYMBOL")?,
        );

        let credentials = match env.get("TERMINAL_USER_ID") {
            Some(user_id) if user_id.is_empty() => {
                return Err(ConfigError::EmptyValue("TERMINAL_USER_ID".to_string()));
            }
            Some(user_id) => Some(Credentials::new(
                user_id,
                env.required("TERMINAL_PASSWORD")?,
                env.required("TERMINAL_CERT_PASSWORD")?,
            )),
            None => None,
        };

        let terminal = TerminalSettings {
            program_id: env
                .get("TERMINAL_PROGRAM_ID")
                .unwrap_or_else(|| DEFAULT_PROGRAM_ID.to_string()),
            credentials,
            node_name: env
                .get("TERMINAL_NODE_NAME")
                .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string()),
        };

        let auth_defaults = AuthSettings::default();
        let auth = AuthSettings {
            option: env.parse_or("TERMINAL_AUTH_OPTION", auth_defaults.option),
            probe_mode: env.parse_or("TERMINAL_PROBE_MODE", auth_defaults.probe_mode),
            login_mode: env.parse_or("TERMINAL_LOGIN_MODE", auth_defaults.login_mode),
        };

        let requested_count = match env.get("TERMINAL_REQUEST_COUNT") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(count) => RequestCount::new(count)
                    .map_err(|e| ConfigError::invalid("TERMINAL_REQUEST_COUNT", e))?,
                Err(_) => RequestCount::default(),
            },
            None => RequestCount::default(),
        };

        let paging_mode = match env.get("TERMINAL_PAGING_MODE") {
            Some(raw) => raw
                .trim()
                .parse::<PagingMode>()
                .map_err(|e| ConfigError::invalid("TERMINAL_PAGING_MODE", e))?,
            None => PagingMode::default(),
        };

        let instrument_fields = FieldInput::parse_list(
            &env.get("TERMINAL_INSTRUMENT_FIELDS")
                .unwrap_or_else(|| DEFAULT_INSTRUMENT_FIELDS.to_string()),
        )
        .map_err(|e| ConfigError::invalid("TERMINAL_INSTRUMENT_FIELDS", e))?;

        let query = QuerySettings {
            timeout: env.millis_or("TERMINAL_QUERY_TIMEOUT_MS", DEFAULT_QUERY_TIMEOUT),
            instrument_fields,
            paging_mode,
            screen_slot: env
                .get("TERMINAL_SCREEN_SLOT")
                .map_or_else(ScreenSlot::default, ScreenSlot::new),
            requested_count,
        };

        let output_fields = env
            .get("TERMINAL_OUTPUT_FIELDS")
            .unwrap_or_else(|| DEFAULT_OUTPUT_FIELDS.to_string())
            .parse::<FieldList>()
            .map_err(|e| ConfigError::invalid("TERMINAL_OUTPUT_FIELDS", e))?;

        let normalizer = NormalizerConfig {
            remote_id_field: FieldCode::new(
                env.get("TERMINAL_REMOTE_ID_FIELD")
                    .unwrap_or_else(|| DEFAULT_REMOTE_ID_FIELD.to_string()),
            )
            .map_err(|e| ConfigError::invalid("TERMINAL_REMOTE_ID_FIELD", e))?,
            dedup_window: env.parse_or("TERMINAL_DEDUP_WINDOW", DEFAULT_DEDUP_WINDOW),
        };

        let server = ServerSettings {
            health_port: env.parse_or("BRIDGE_HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            terminal,
            channel,
            auth,
            query,
            output_fields,
            normalizer,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// Parse failure.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis_or(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const CHANNEL: [(&str, &str); 2] = [("TERMINAL_REAL_NAME", "FX_TICK"), ("TERMINAL_SYMBOL", "GBP/AUD")];

    #[test]
    fn defaults_match_source_system() {
        let config = config(&CHANNEL).unwrap();

        assert_eq!(config.channel, PushChannel::new("FX_TICK", "GBP/AUD"));
        assert_eq!(config.terminal.program_id, DEFAULT_PROGRAM_ID);
        assert!(config.terminal.credentials.is_none());
        assert_eq!(config.auth, AuthSettings::default());
        assert_eq!(config.query.timeout, Duration::from_secs(5));
        assert_eq!(config.query.screen_slot.as_str(), "9999");
        assert_eq!(config.query.requested_count.get(), 9999);
        assert_eq!(config.query.paging_mode, PagingMode::First);
        assert_eq!(config.query.instrument_fields.len(), 4);
        assert_eq!(config.output_fields.to_string(), DEFAULT_OUTPUT_FIELDS);
        assert_eq!(config.normalizer.remote_id_field.as_str(), "ID");
        assert_eq!(config.normalizer.dedup_window, 4096);
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn channel_is_required() {
        let err = config(&[("TERMINAL_REAL_NAME", "FX_TICK")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "TERMINAL_SYMBOL"));

        let err = config(&[("TERMINAL_REAL_NAME", ""), ("TERMINAL_SYMBOL", "X")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn credentials_need_all_three_values() {
        let mut pairs = CHANNEL.to_vec();
        pairs.push(("TERMINAL_USER_ID", "trader"));
        pairs.push(("TERMINAL_PASSWORD", "pw"));
        let err = config(&pairs).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "TERMINAL_CERT_PASSWORD"));

        pairs.push(("TERMINAL_CERT_PASSWORD", "cert"));
        let creds = config(&pairs).unwrap().terminal.credentials.unwrap();
        assert_eq!(creds.user_id(), "trader");
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let mut pairs = CHANNEL.to_vec();
        pairs.push(("TERMINAL_QUERY_TIMEOUT_MS", "soon"));
        pairs.push(("BRIDGE_HEALTH_PORT", "-1"));
        pairs.push(("TERMINAL_REQUEST_COUNT", "lots"));
        let config = config(&pairs).unwrap();

        assert_eq!(config.query.timeout, DEFAULT_QUERY_TIMEOUT);
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.query.requested_count.get(), 9999);
    }

    #[test]
    fn request_count_over_limit_is_rejected() {
        let mut pairs = CHANNEL.to_vec();
        pairs.push(("TERMINAL_REQUEST_COUNT", "10000"));
        let err = config(&pairs).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "TERMINAL_REQUEST_COUNT"));
    }

    #[test]
    fn malformed_field_list_is_rejected() {
        let mut pairs = CHANNEL.to_vec();
        pairs.push(("TERMINAL_INSTRUMENT_FIELDS", "9001"));
        assert!(matches!(
            config(&pairs).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new(
            "trader".to_string(),
            "secret456".to_string(),
            "cert789".to_string(),
        );
        let debug = format!("{creds:?}");
        assert!(!debug.contains("trader"));
        assert!(!debug.contains("secret456"));
        assert!(!debug.contains("cert789"));
        assert!(debug.contains("[REDACTED]"));
    }
}
