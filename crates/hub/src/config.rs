//! TOML config file loading, environment overrides and validation for the
//! remote store, monitored channels and the actuator channel.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;

use crate::feed::{ChannelKind, MAX_FIELD};

/// The remote store accepts one update per channel every 15 s; polling
/// faster only burns requests.
pub const MIN_POLL_INTERVAL_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub channel_id: String,
    #[serde(default)]
    pub read_api_key: Option<String>,
    pub field: u8,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub channel_id: String,
    #[serde(default)]
    pub read_api_key: Option<String>,
    pub write_api_key: String,
    #[serde(default = "default_motor_field")]
    pub motor_field: u8,
    #[serde(default = "default_fertilizer_field")]
    pub fertilizer_field: u8,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_base_url() -> String {
    "https://api.thingspeak.com".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_interval_secs() -> u64 {
    MIN_POLL_INTERVAL_SECS
}
fn default_motor_field() -> u8 {
    3
}
fn default_fertilizer_field() -> u8 {
    2
}
fn default_lockout_secs() -> u32 {
    15
}
fn default_web_port() -> u16 {
    8080
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_remote(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_actuator(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_remote(&self, errors: &mut Vec<String>) {
        let url = &self.remote.base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            errors.push(format!(
                "remote: base_url '{url}' must start with http:// or https://"
            ));
        }
        if self.remote.timeout_secs == 0 {
            errors.push("remote: timeout_secs must be positive".to_string());
        }
        if self.poller.interval_secs < MIN_POLL_INTERVAL_SECS {
            errors.push(format!(
                "poller: interval_secs {} is below the remote rate limit of {MIN_POLL_INTERVAL_SECS}s",
                self.poller.interval_secs
            ));
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.name.is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.name)
                }
            };

            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&c.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if c.channel_id.trim().is_empty() {
                errors.push(format!("{}: channel_id is empty", ctx()));
            }

            if !(1..=MAX_FIELD).contains(&c.field) {
                errors.push(format!(
                    "{}: field {} out of range [1, {MAX_FIELD}]",
                    ctx(),
                    c.field
                ));
            }
        }
    }

    fn validate_actuator(&self, errors: &mut Vec<String>) {
        let a = &self.actuator;

        if a.channel_id.trim().is_empty() {
            errors.push("actuator: channel_id is empty".to_string());
        }
        if a.write_api_key.trim().is_empty() {
            errors.push("actuator: write_api_key is empty".to_string());
        }
        for (name, field) in [
            ("motor_field", a.motor_field),
            ("fertilizer_field", a.fertilizer_field),
        ] {
            if !(1..=MAX_FIELD).contains(&field) {
                errors.push(format!(
                    "actuator: {name} {field} out of range [1, {MAX_FIELD}]"
                ));
            }
        }
        if a.motor_field == a.fertilizer_field {
            errors.push(format!(
                "actuator: motor_field and fertilizer_field are both {}",
                a.motor_field
            ));
        }
        if a.lockout_secs == 0 {
            errors.push("actuator: lockout_secs must be positive".to_string());
        }
    }

    /// Apply `REMOTE_BASE_URL` / `WEB_PORT` from the environment.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("REMOTE_BASE_URL") {
            self.remote.base_url = url;
        }
        if let Ok(port) = env::var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config = parse(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        channels = config.channels.len(),
        base_url = %config.remote.base_url,
        interval_secs = config.poller.interval_secs,
        "config loaded"
    );

    Ok(config)
}

fn parse(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_channel() -> ChannelConfig {
        ChannelConfig {
            name: "node1".into(),
            channel_id: "3232296".into(),
            read_api_key: None,
            field: 1,
            kind: ChannelKind::Environment,
        }
    }

    fn valid_actuator() -> ActuatorConfig {
        ActuatorConfig {
            channel_id: "3259969".into(),
            read_api_key: Some("READKEY".into()),
            write_api_key: "WRITEKEY".into(),
            motor_field: 3,
            fertilizer_field: 2,
            lockout_secs: 15,
        }
    }

    fn valid_config() -> Config {
        Config {
            remote: RemoteConfig::default(),
            poller: PollerConfig::default(),
            channels: vec![valid_channel()],
            actuator: valid_actuator(),
            web: WebConfig::default(),
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[remote]
base_url = "http://localhost:3000"
timeout_secs = 5

[poller]
interval_secs = 30

[[channels]]
name = "node1"
channel_id = "3232296"
read_api_key = "KEY1"
field = 1
kind = "environment"

[[channels]]
name = "npk"
channel_id = "3232296"
field = 3
kind = "nutrient"

[actuator]
channel_id = "3259969"
write_api_key = "WRITEKEY"
lockout_secs = 20

[web]
port = 9090
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.remote.base_url, "http://localhost:3000");
        assert_eq!(config.remote.timeout_secs, 5);
        assert_eq!(config.poller.interval_secs, 30);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].read_api_key.as_deref(), Some("KEY1"));
        assert_eq!(config.channels[1].kind, ChannelKind::Nutrient);
        assert_eq!(config.actuator.motor_field, 3);
        assert_eq!(config.actuator.fertilizer_field, 2);
        assert_eq!(config.actuator.lockout_secs, 20);
        assert_eq!(config.web.port, 9090);
        config.validate().unwrap();
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let toml_str = r#"
[actuator]
channel_id = "3259969"
write_api_key = "WRITEKEY"
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.remote.base_url, "https://api.thingspeak.com");
        assert_eq!(config.remote.timeout_secs, 10);
        assert_eq!(config.poller.interval_secs, 15);
        assert!(config.channels.is_empty());
        assert_eq!(config.actuator.lockout_secs, 15);
        assert_eq!(config.web.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn parse_missing_actuator_fails() {
        assert!(parse("").is_err());
    }

    #[test]
    fn parse_unknown_kind_fails() {
        let toml_str = r#"
[[channels]]
name = "x"
channel_id = "1"
field = 1
kind = "weather"

[actuator]
channel_id = "3259969"
write_api_key = "WRITEKEY"
"#;
        assert!(parse(toml_str).is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Remote / poller ----------------------------------------------------

    #[test]
    fn base_url_without_scheme_rejected() {
        let mut cfg = valid_config();
        cfg.remote.base_url = "api.thingspeak.com".into();
        assert_validation_err(&cfg, "must start with http:// or https://");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.remote.timeout_secs = 0;
        assert_validation_err(&cfg, "timeout_secs must be positive");
    }

    #[test]
    fn poll_interval_below_rate_limit_rejected() {
        let mut cfg = valid_config();
        cfg.poller.interval_secs = 5;
        assert_validation_err(&cfg, "below the remote rate limit");
    }

    #[test]
    fn poll_interval_at_rate_limit_accepted() {
        let mut cfg = valid_config();
        cfg.poller.interval_secs = 15;
        cfg.validate().unwrap();
    }

    // -- Channels -----------------------------------------------------------

    #[test]
    fn channel_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].name = " ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn channel_duplicate_name_rejected() {
        let mut cfg = valid_config();
        cfg.channels.push(ChannelConfig {
            field: 2,
            ..valid_channel()
        });
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn channel_same_remote_id_different_names_accepted() {
        let mut cfg = valid_config();
        cfg.channels.push(ChannelConfig {
            name: "npk".into(),
            field: 3,
            kind: ChannelKind::Nutrient,
            ..valid_channel()
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn channel_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].channel_id = "".into();
        assert_validation_err(&cfg, "channel_id is empty");
    }

    #[test]
    fn channel_field_zero_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].field = 0;
        assert_validation_err(&cfg, "field 0 out of range");
    }

    #[test]
    fn channel_field_nine_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].field = 9;
        assert_validation_err(&cfg, "field 9 out of range");
    }

    // -- Actuator -----------------------------------------------------------

    #[test]
    fn actuator_empty_write_key_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.write_api_key = "".into();
        assert_validation_err(&cfg, "write_api_key is empty");
    }

    #[test]
    fn actuator_same_fields_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.fertilizer_field = 3;
        assert_validation_err(&cfg, "motor_field and fertilizer_field are both 3");
    }

    #[test]
    fn actuator_field_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.motor_field = 12;
        assert_validation_err(&cfg, "motor_field 12 out of range");
    }

    #[test]
    fn actuator_zero_lockout_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.lockout_secs = 0;
        assert_validation_err(&cfg, "lockout_secs must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.remote.base_url = "ftp://nope".into();
        cfg.channels[0].field = 0;
        cfg.actuator.write_api_key = "".into();

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("base_url"), "got: {msg}");
        assert!(msg.contains("field 0"), "got: {msg}");
        assert!(msg.contains("write_api_key"), "got: {msg}");
    }

    // -- Environment overrides ----------------------------------------------

    #[test]
    fn env_overrides_apply() {
        // Single test touches these vars so parallel tests cannot interleave.
        env::set_var("REMOTE_BASE_URL", "http://127.0.0.1:4000");
        env::set_var("WEB_PORT", "9191");
        let mut cfg = valid_config();
        cfg.apply_env().unwrap();
        assert_eq!(cfg.remote.base_url, "http://127.0.0.1:4000");
        assert_eq!(cfg.web.port, 9191);

        env::set_var("WEB_PORT", "not-a-port");
        let err = valid_config().apply_env().unwrap_err();
        assert!(format!("{err:#}").contains("not-a-port"));

        env::remove_var("REMOTE_BASE_URL");
        env::remove_var("WEB_PORT");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_fails_with_path() {
        let err = load("/nonexistent/fieldlink.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/fieldlink.toml"));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = parse(include_str!("../../../config.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.channels.len(), 3);
        assert_eq!(cfg.channels[2].kind, ChannelKind::Nutrient);
        assert_eq!(cfg.actuator.motor_field, 3);
    }
}
