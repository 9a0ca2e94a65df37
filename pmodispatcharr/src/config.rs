//! # Dispatcharr bridge configuration
//!
//! YAML configuration with:
//! - embedded defaults merged with an optional `config.yaml`
//! - environment variable overrides (`PMODISPATCHARR_CONFIG__SECTION__KEY`)
//! - typed getters/setters
//! - runtime mutation, so options such as `epg.enabled` apply on the next
//!   tick without a restart
//! - the password sealed on disk as an `encrypted:` value
//!
//! Only defaults, the file and runtime changes are written back to
//! `config.yaml`; environment overrides stay in memory.
//!
//! ```no_run
//! use pmodispatcharr::config::DispatcharrConfig;
//!
//! let config = DispatcharrConfig::load_config("")?;
//! println!("Polling {}", config.base_url()?);
//! config.set_epg_enabled(false)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::encryption;
use crate::reconcile::CountPolicy;
use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde_yaml::{Mapping, Number, Value};
use std::{env, fs, path::Path, sync::Mutex};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = r#"
dispatcharr:
  host: ""
  port: 9191
  use_ssl: false
  username: ""
  password: ""
  request_timeout_secs: 30
  token_lifetime_secs: 1500
epg:
  enabled: true
polling:
  scan_interval_secs: 30
  count_policy: on_change
"#;

const ENV_CONFIG_DIR: &str = "PMODISPATCHARR_CONFIG";
const ENV_PREFIX: &str = "PMODISPATCHARR_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmodispatcharr";

const DEFAULT_PORT: u16 = 9191;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = crate::auth::DEFAULT_TOKEN_LIFETIME_SECS;

/// Generates a getter/setter pair for a u64 value with a default
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            match self.get_value($path) {
                Ok(Value::Number(n)) if n.as_u64().is_some() => Ok(n.as_u64().unwrap_or($default)),
                Ok(Value::String(s)) => Ok(s.trim().parse().unwrap_or($default)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Generates a getter/setter pair for a bool value with a default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Generates a getter/setter pair for a mandatory string value
///
/// Scalars YAML reads as numbers or booleans (`password: 123456`) are
/// returned in their textual form.
macro_rules! impl_required_string_config {
    ($getter:ident, $setter:ident, $path:expr) => {
        pub fn $getter(&self) -> Result<String> {
            match self.get_value($path).ok().as_ref().and_then(scalar_to_string) {
                Some(s) if !s.trim().is_empty() => Ok(s),
                _ => Err(anyhow!("{} is required", $path.join("."))),
            }
        }

        pub fn $setter(&self, value: impl Into<String>) -> Result<()> {
            self.set_value($path, Value::String(value.into()))
        }
    };
}

const PASSWORD_PATH: &[&str] = &["dispatcharr", "password"];

#[derive(Debug)]
struct ConfigData {
    /// Defaults merged with the file and runtime changes; what `save` writes
    stored: Value,
    /// `stored` plus environment overrides; what getters read
    live: Value,
}

/// Configuration of one Dispatcharr bridge instance
///
/// Environment overrides are never written back to `config.yaml`, and the
/// password is stored sealed (see [`crate::encryption`]).
#[derive(Debug)]
pub struct DispatcharrConfig {
    /// Backing file; `None` for in-memory configurations
    path: Option<String>,
    data: Mutex<ConfigData>,
}

impl DispatcharrConfig {
    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return env_path;
        }

        if Path::new(CONFIG_DIR_NAME).exists() {
            return CONFIG_DIR_NAME.to_string();
        }

        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        CONFIG_DIR_NAME.to_string()
    }

    /// Loads the configuration
    ///
    /// The directory is, in order: `directory` if not empty, the
    /// `PMODISPATCHARR_CONFIG` environment variable, `./.pmodispatcharr`,
    /// `~/.pmodispatcharr`. Its `config.yaml` is merged over the embedded
    /// defaults, then environment overrides are applied. The merged result
    /// is written back so that the file documents every option.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::find_config_dir(directory);
        let dir = Path::new(&config_dir);
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        if !dir.is_dir() {
            return Err(anyhow!("{} is not a directory", config_dir));
        }
        info!(config_dir = %config_dir, "Using config directory");

        let path = dir.join("config.yaml").to_string_lossy().to_string();
        let external = match fs::read_to_string(&path) {
            Ok(data) => {
                info!(config_file = %path, "Loaded config file");
                Some(data)
            }
            Err(_) => {
                info!(config_file = %path, "Config file not found, using defaults");
                None
            }
        };

        let config = Self::build(external.as_deref(), Some(path))?;
        config.seal_stored_password()?;
        config.save()?;
        Ok(config)
    }

    /// In-memory configuration, never written to disk
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::build(Some(yaml), None)
    }

    fn build(external: Option<&str>, path: Option<String>) -> Result<Self> {
        let mut stored: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(yaml) = external {
            let external_value = lower_keys_value(serde_yaml::from_str(yaml)?);
            merge_yaml(&mut stored, &external_value);
        }
        let mut live = stored.clone();
        apply_env_overrides(&mut live);

        Ok(Self {
            path,
            data: Mutex::new(ConfigData { stored, live }),
        })
    }

    /// Replaces a plaintext password in the stored layer by its sealed form
    fn seal_stored_password(&self) -> Result<()> {
        let mut data = self.lock()?;
        let plain = match get_value_internal(&data.stored, PASSWORD_PATH) {
            Ok(value) => match scalar_to_string(&value) {
                Some(s) if !s.is_empty() && !encryption::is_encrypted(&s) => s,
                _ => return Ok(()),
            },
            Err(_) => return Ok(()),
        };
        match encryption::encrypt_password(&plain) {
            Ok(sealed) => {
                set_value_internal(&mut data.stored, PASSWORD_PATH, Value::String(sealed))?;
                info!("Password sealed in the configuration file");
            }
            Err(err) => warn!("Cannot seal the password, keeping it in clear: {}", err),
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ConfigData>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("configuration lock poisoned"))
    }

    /// Writes the configuration back to its file (no-op in memory)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(&self.lock()?.stored)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    /// Sets a value at `path` (e.g. `&["epg", "enabled"]`) and saves
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.lock()?;
            set_value_internal(&mut data.stored, path, value.clone())?;
            set_value_internal(&mut data.live, path, value)?;
        }
        self.save()
    }

    /// Reads the value at `path`
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.lock()?;
        get_value_internal(&data.live, path)
    }

    impl_required_string_config!(get_host, set_host, &["dispatcharr", "host"]);
    impl_required_string_config!(get_username, set_username, &["dispatcharr", "username"]);

    /// Dispatcharr password in clear, opening a sealed `encrypted:` value
    pub fn get_password(&self) -> Result<String> {
        let stored = self
            .get_value(PASSWORD_PATH)
            .ok()
            .as_ref()
            .and_then(scalar_to_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("{} is required", PASSWORD_PATH.join(".")))?;
        encryption::reveal_password(&stored)
            .map_err(|e| anyhow!("Failed to decrypt {}: {}", PASSWORD_PATH.join("."), e))
    }

    /// Stores the password, sealed when the machine key is available
    pub fn set_password(&self, password: &str) -> Result<()> {
        let value = match encryption::encrypt_password(password) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("Cannot seal the password, keeping it in clear: {}", err);
                password.to_string()
            }
        };
        self.set_value(PASSWORD_PATH, Value::String(value))
    }

    impl_bool_config!(get_use_ssl, set_use_ssl, &["dispatcharr", "use_ssl"], false);
    impl_bool_config!(get_epg_enabled, set_epg_enabled, &["epg", "enabled"], true);

    impl_u64_config!(
        get_scan_interval_secs,
        set_scan_interval_secs,
        &["polling", "scan_interval_secs"],
        DEFAULT_SCAN_INTERVAL_SECS
    );
    impl_u64_config!(
        get_request_timeout_secs,
        set_request_timeout_secs,
        &["dispatcharr", "request_timeout_secs"],
        DEFAULT_REQUEST_TIMEOUT_SECS
    );
    impl_u64_config!(
        get_token_lifetime_secs,
        set_token_lifetime_secs,
        &["dispatcharr", "token_lifetime_secs"],
        DEFAULT_TOKEN_LIFETIME_SECS
    );

    /// Dispatcharr port, falling back to 9191 on garbage
    pub fn get_port(&self) -> u16 {
        match self.get_value(&["dispatcharr", "port"]) {
            Ok(Value::Number(n)) => match n.as_u64().and_then(|p| u16::try_from(p).ok()) {
                Some(port) => port,
                None => {
                    warn!("Invalid port {}, using default {}", n, DEFAULT_PORT);
                    DEFAULT_PORT
                }
            },
            Ok(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!("Invalid port '{}', using default {}", s, DEFAULT_PORT);
                DEFAULT_PORT
            }),
            _ => DEFAULT_PORT,
        }
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        self.set_value(&["dispatcharr", "port"], Value::Number(Number::from(port)))
    }

    pub fn get_count_policy(&self) -> CountPolicy {
        match self.get_value(&["polling", "count_policy"]) {
            Ok(Value::String(s)) => s.parse().unwrap_or_else(|err| {
                warn!("{}, using on_change", err);
                CountPolicy::OnChange
            }),
            _ => CountPolicy::OnChange,
        }
    }

    pub fn set_count_policy(&self, policy: CountPolicy) -> Result<()> {
        let name = match policy {
            CountPolicy::OnChange => "on_change",
            CountPolicy::EveryTick => "every_tick",
        };
        self.set_value(&["polling", "count_policy"], Value::String(name.to_string()))
    }

    /// `http(s)://host:port`; a host that already carries a scheme is kept as is
    pub fn base_url(&self) -> Result<String> {
        let host = self.get_host()?;
        let host = host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            return Ok(host.to_string());
        }
        let scheme = if self.get_use_ssl()? { "https" } else { "http" };
        Ok(format!("{}://{}:{}", scheme, host, self.get_port()))
    }

    /// Checks that every mandatory option is present
    pub fn validate(&self) -> Result<()> {
        self.get_host()?;
        self.get_username()?;
        self.get_password()?;
        Ok(())
    }
}

fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    if path.is_empty() {
        *data = value;
        return Ok(());
    }
    if let Value::Mapping(map) = data {
        let key = Value::String(path[0].to_lowercase());
        if path.len() == 1 {
            map.insert(key, value);
        } else {
            let entry = map.entry(key).or_insert(Value::Mapping(Mapping::new()));
            set_value_internal(entry, &path[1..], value)?;
        }
        Ok(())
    } else {
        Err(anyhow!("Current node is not a map"))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
    let mut current = data;
    for (i, key) in path.iter().enumerate() {
        match current {
            Value::Mapping(map) => match map.get(Value::String(key.to_lowercase())) {
                Some(next) => current = next,
                None => return Err(anyhow!("Path {} does not exist", path[..=i].join("."))),
            },
            _ => return Err(anyhow!("Path {} is not a map", path[..i].join("."))),
        }
    }
    Ok(current.clone())
}

fn apply_env_overrides(config: &mut Value) {
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            let key_path = stripped.split("__").collect::<Vec<_>>();
            let yaml_value = serde_yaml::from_str::<Value>(&value)
                .unwrap_or_else(|_| Value::String(value.clone()));
            if let Err(err) = set_value_internal(config, &key_path, yaml_value) {
                warn!("Ignoring override {}: {}", key, err);
            }
        }
    }
}

fn lower_keys_value(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut new_map = Mapping::new();
            for (k, v) in map {
                let k = match k {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                new_map.insert(k, lower_keys_value(v));
            }
            Value::Mapping(new_map)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys_value).collect()),
        _ => value,
    }
}

/// Recursively merges `external` into `default`; scalars and sequences replace
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (d, e) => *d = e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Dispatcharr:
  Host: dispatcharr.lan
  username: admin
  password: secret
epg:
  enabled: false
"#;

    #[test]
    fn test_defaults_and_merge() {
        let config = DispatcharrConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.get_host().unwrap(), "dispatcharr.lan");
        assert_eq!(config.get_port(), 9191);
        assert!(!config.get_epg_enabled().unwrap());
        assert_eq!(config.get_scan_interval_secs().unwrap(), 30);
        assert_eq!(config.get_count_policy(), CountPolicy::OnChange);
        assert_eq!(config.base_url().unwrap(), "http://dispatcharr.lan:9191");
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_credentials_fail_validation() {
        let config = DispatcharrConfig::from_yaml_str("dispatcharr:\n  host: x\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatcharr.username"));
    }

    #[test]
    fn test_runtime_updates() {
        let config = DispatcharrConfig::from_yaml_str(SAMPLE).unwrap();
        config.set_epg_enabled(true).unwrap();
        assert!(config.get_epg_enabled().unwrap());

        config.set_use_ssl(true).unwrap();
        config.set_port(443).unwrap();
        assert_eq!(config.base_url().unwrap(), "https://dispatcharr.lan:443");

        config.set_count_policy(CountPolicy::EveryTick).unwrap();
        assert_eq!(config.get_count_policy(), CountPolicy::EveryTick);
    }

    #[test]
    fn test_host_with_scheme() {
        let config =
            DispatcharrConfig::from_yaml_str("dispatcharr:\n  host: https://tv.example.org/\n")
                .unwrap();
        assert_eq!(config.base_url().unwrap(), "https://tv.example.org");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = DispatcharrConfig::from_yaml_str(
            "dispatcharr:\n  port: 99999\npolling:\n  scan_interval_secs: soon\n  count_policy: maybe\n",
        )
        .unwrap();
        assert_eq!(config.get_port(), 9191);
        assert_eq!(config.get_scan_interval_secs().unwrap(), 30);
        assert_eq!(config.get_count_policy(), CountPolicy::OnChange);
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), SAMPLE).unwrap();

        let config = DispatcharrConfig::load_config(dir.path().to_str().unwrap()).unwrap();
        config.set_scan_interval_secs(10).unwrap();

        let reloaded = DispatcharrConfig::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(reloaded.get_scan_interval_secs().unwrap(), 10);
        assert_eq!(reloaded.get_username().unwrap(), "admin");
    }

    #[test]
    fn test_scalar_credentials_are_text() {
        let config = DispatcharrConfig::from_yaml_str(
            "dispatcharr:\n  host: 10.0.0.2\n  username: 1001\n  password: 123456\n",
        )
        .unwrap();
        assert_eq!(config.get_username().unwrap(), "1001");
        assert_eq!(config.get_password().unwrap(), "123456");
        config.validate().unwrap();

        let config =
            DispatcharrConfig::from_yaml_str("dispatcharr:\n  host: x\n  username: true\n")
                .unwrap();
        assert_eq!(config.get_username().unwrap(), "true");
        assert!(config.get_password().is_err());
    }

    #[test]
    fn test_password_is_sealed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, SAMPLE).unwrap();

        let config = DispatcharrConfig::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.get_password().unwrap(), "secret");

        let on_disk = std::fs::read_to_string(&file).unwrap();
        if encryption::machine_key().is_ok() {
            assert!(on_disk.contains("encrypted:"));
            assert!(!on_disk.contains("secret"));
        }

        config.set_password("n3w-pass").unwrap();
        let reloaded = DispatcharrConfig::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(reloaded.get_password().unwrap(), "n3w-pass");
    }

    #[test]
    fn test_env_overrides_stay_out_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, SAMPLE).unwrap();

        env::set_var("PMODISPATCHARR_CONFIG__EXTRA__API_KEY", "k-4242");
        let config = DispatcharrConfig::load_config(dir.path().to_str().unwrap());
        env::remove_var("PMODISPATCHARR_CONFIG__EXTRA__API_KEY");
        let config = config.unwrap();

        assert_eq!(
            config.get_value(&["extra", "api_key"]).unwrap(),
            Value::from("k-4242")
        );
        let on_disk = std::fs::read_to_string(&file).unwrap();
        assert!(!on_disk.contains("k-4242"));
        assert!(!on_disk.contains("extra"));
    }

    #[test]
    fn test_merge_keeps_defaults() {
        let mut base: Value = serde_yaml::from_str("a:\n  b: 1\n  c: 2\n").unwrap();
        let ext: Value = serde_yaml::from_str("a:\n  c: 3\n").unwrap();
        merge_yaml(&mut base, &ext);
        assert_eq!(get_value_internal(&base, &["a", "b"]).unwrap(), Value::from(1));
        assert_eq!(get_value_internal(&base, &["a", "c"]).unwrap(), Value::from(3));
    }
}
