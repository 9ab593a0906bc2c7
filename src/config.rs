//! Configuration of the tokenkeeper daemon and the token access layer.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error, warn};
use secrecy::{ExposeSecret, SecretString};
use serde::de;
use serde::{Deserialize, Deserializer};

use crate::commons::ext_serde::{de_level_filter, de_lowercase_keys};
use crate::constants::{
    DFLT_CLIENT_SECRET_KEY, DFLT_CLIENT_SECRET_SALT, TOKENKEEPER_ENV_LOG_LEVEL,
    TOKENKEEPER_ENV_LOG_TYPE,
};
use crate::token::credential::SecretMaterial;
use crate::token::pin::PinProvider;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        3080
    }

    fn log_level() -> LevelFilter {
        LevelFilter::Info
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn post_limit_api() -> u64 {
        256 * 1024
    }

    fn client_secret_key() -> SecretString {
        SecretString::new(DFLT_CLIENT_SECRET_KEY.to_string())
    }

    fn client_secret_salt() -> String {
        DFLT_CLIENT_SECRET_SALT.to_string()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the tokenkeeper daemon and client.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// The largest request body accepted by the daemon, in bytes.
    #[serde(default = "ConfigDefaults::post_limit_api")]
    pub post_limit_api: u64,

    #[serde(default)]
    pub token_access: Arc<TokenAccessConfig>,
}

impl Config {
    /// Reads and verifies the config file at `path`.
    pub fn parse(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|err| {
            ConfigError::Other(format!(
                "Could not read config file '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::parse_str(&content)
    }

    /// Parses and verifies a config from a string.
    ///
    /// Applies the log level and log type overrides from the environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_env_overrides()?;
        config.verify()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = env::var(TOKENKEEPER_ENV_LOG_LEVEL) {
            self.log_level = LevelFilter::from_str(&level).map_err(|_| {
                ConfigError::Other(format!(
                    "Unrecognized value for log level in env var {TOKENKEEPER_ENV_LOG_LEVEL}"
                ))
            })?;
        }
        if let Ok(log_type) = env::var(TOKENKEEPER_ENV_LOG_TYPE) {
            self.log_type = LogType::from_str(&log_type).map_err(|_| {
                ConfigError::Other(format!(
                    "Unrecognized value for log type in env var {TOKENKEEPER_ENV_LOG_TYPE}"
                ))
            })?;
        }
        Ok(())
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.log_type == LogType::File && self.log_file.is_none() {
            return Err(ConfigError::other(
                "log_type 'file' requires log_file to be set",
            ));
        }
        if self.post_limit_api == 0 {
            return Err(ConfigError::other("post_limit_api must not be zero"));
        }
        self.token_access.verify()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => match &self.log_file {
                Some(path) => self.file_logger(path),
                None => Err(ConfigError::other("No log_file configured")),
            },
            LogType::Stderr => self.stderr_logger(),
            LogType::Syslog => self.syslog_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init stderr logging: {e}"))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}",
                    path.display(),
                    err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init file logging: {e}"))
            })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = syslog::Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("tokenkeeper"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| {
                    ConfigError::Other(format!("Failed to init syslog: {e}"))
                }),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {err}");
                Err(ConfigError::Other(msg))
            }
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("Syslog is only supported on Unix systems"))
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("rustls", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
    }
}

//------------ TokenAccessConfig ---------------------------------------------

/// Which token libraries to open, and who may use which token.
///
/// Loaded once at startup. Changes need a restart.
#[derive(Debug, Deserialize)]
pub struct TokenAccessConfig {
    /// Token libraries to open, in search order.
    #[serde(default)]
    pub library_paths: Vec<PathBuf>,

    /// Token serial number to PIN.
    #[serde(default, deserialize_with = "de_lowercase_keys")]
    pub token_pins: HashMap<String, SecretString>,

    /// Tenant id to the serial numbers of the tokens it may use.
    #[serde(default, deserialize_with = "de_tenants")]
    pub tenants: HashMap<String, Vec<String>>,

    /// Environment variables to set before any library is opened.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "ConfigDefaults::client_secret_key")]
    pub client_secret_key: SecretString,

    #[serde(default = "ConfigDefaults::client_secret_salt")]
    pub client_secret_salt: String,
}

impl Default for TokenAccessConfig {
    fn default() -> Self {
        TokenAccessConfig {
            library_paths: Vec::new(),
            token_pins: HashMap::new(),
            tenants: HashMap::new(),
            environment: BTreeMap::new(),
            client_secret_key: ConfigDefaults::client_secret_key(),
            client_secret_salt: ConfigDefaults::client_secret_salt(),
        }
    }
}

impl TokenAccessConfig {
    fn verify(&self) -> Result<(), ConfigError> {
        for (tenant, tokens) in &self.tenants {
            if tenant.is_empty() {
                return Err(ConfigError::other("tenant ids must not be empty"));
            }
            for token in tokens {
                if !self.token_pins.contains_key(token) {
                    warn!(
                        "Tenant '{tenant}' refers to token '{token}' which has no PIN configured"
                    );
                }
            }
        }
        Ok(())
    }

    /// Returns the serial numbers of the tokens a tenant may use.
    pub fn tenant_tokens(&self, tenant: &str) -> Option<&[String]> {
        self.tenants.get(&tenant.to_lowercase()).map(Vec::as_slice)
    }

    pub fn token_pin(&self, serial_number: &str) -> Option<&str> {
        self.token_pins
            .get(&serial_number.to_lowercase())
            .map(|pin| pin.expose_secret().as_str())
    }

    /// Creates a PIN provider for all configured tokens.
    pub fn pin_provider(&self) -> PinProvider {
        PinProvider::new(self.token_pins.iter().map(|(serial, pin)| {
            (serial.as_str(), pin.expose_secret().as_bytes())
        }))
    }

    pub fn secret_material(&self) -> SecretMaterial {
        SecretMaterial::new(
            self.client_secret_key.expose_secret().as_str(),
            self.client_secret_salt.as_str(),
        )
    }

    /// Exports the configured environment variables to this process.
    ///
    /// Must be called before any other threads are started.
    pub fn export_environment(&self) {
        for (key, value) in &self.environment {
            // SAFETY: we are still single threaded at this point.
            unsafe { env::set_var(key, value) };
        }
    }
}

fn de_tenants<'de, D>(d: D) -> Result<HashMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = HashMap::<String, Vec<String>>::deserialize(d)?;
    Ok(map
        .into_iter()
        .map(|(tenant, tokens)| {
            let tokens = tokens.iter().map(|t| t.to_lowercase()).collect();
            (tenant.to_lowercase(), tokens)
        })
        .collect())
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{s}\""
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONFIG: &str = r#"
        port = 3999
        log_level = "debug"

        [token_access]
        library_paths = ["/usr/lib/softhsm/libsofthsm2.so"]
        client_secret_salt = "pepper"

        [token_access.token_pins]
        T1 = "1234"

        [token_access.tenants]
        Acme = ["T1", "t2"]

        [token_access.environment]
        SOFTHSM2_CONF = "/etc/softhsm2.conf"
    "#;

    #[test]
    fn defaults_apply() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.port, 3080);
        assert_eq!(config.log_type, LogType::Stderr);
        assert_eq!(config.post_limit_api, 256 * 1024);
        assert!(config.token_access.library_paths.is_empty());
        assert_eq!(config.token_access.client_secret_salt, "salt");
        assert_eq!(
            config.token_access.client_secret_key.expose_secret(),
            "secret"
        );
    }

    #[test]
    fn token_access_is_case_insensitive() {
        let config = Config::parse_str(CONFIG).unwrap();
        let access = &config.token_access;
        assert_eq!(config.port, 3999);
        assert_eq!(
            access.tenant_tokens("ACME"),
            Some(["t1".to_string(), "t2".to_string()].as_slice())
        );
        assert_eq!(access.token_pin("T1"), Some("1234"));
        assert_eq!(access.token_pin("t2"), None);
        assert_eq!(
            access.environment.get("SOFTHSM2_CONF").map(String::as_str),
            Some("/etc/softhsm2.conf")
        );
    }

    #[test]
    fn secret_material_uses_configured_salt() {
        let config = Config::parse_str(CONFIG).unwrap();
        let configured = config
            .token_access
            .secret_material()
            .derive_secret("acme", "client1", "T1", "1234");
        let default = SecretMaterial::default()
            .derive_secret("acme", "client1", "T1", "1234");
        assert_ne!(configured, default);
    }

    #[test]
    fn default_config_file_parses() {
        let config =
            Config::parse_str(include_str!("../defaults/tokenkeeper.conf"))
                .unwrap();
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:3080");
        assert_eq!(config.token_access.library_paths.len(), 1);
        assert!(config.token_access.tenants.is_empty());
    }

    #[test]
    fn file_logging_needs_a_file() {
        assert!(Config::parse_str(r#"log_type = "file""#).is_err());
        assert!(Config::parse_str(r#"log_type = "journal""#).is_err());
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = Config::parse(file.path()).unwrap();
        assert_eq!(config.token_access.library_paths.len(), 1);

        let missing = file.path().with_extension("missing");
        assert!(Config::parse(&missing).is_err());
    }
}
