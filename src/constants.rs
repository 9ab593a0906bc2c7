//! Various tokenkeeper-wide constants.

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `tokenkeeper` binary.
pub const TOKENKEEPER_SERVER_APP: &str = "Tokenkeeper";

/// The friendly name of the `tokenkeeperc` binary.
pub const TOKENKEEPER_CLIENT_APP: &str = "Tokenkeeper Client";

/// The version of this crate, reported in the user agent.
pub const TOKENKEEPER_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the tokenkeeper config file.
pub const TOKENKEEPER_DEFAULT_CONFIG_FILE: &str = "/etc/tokenkeeper.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the path of the config file.
///
/// Overridden by the `--config` command line option.
pub const TOKENKEEPER_ENV_CONFIG: &str = "TOKENKEEPER_CONFIG";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It
/// overrides the config file.
pub const TOKENKEEPER_ENV_LOG_LEVEL: &str = "TOKENKEEPER_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It overrides the config file.
pub const TOKENKEEPER_ENV_LOG_TYPE: &str = "TOKENKEEPER_LOG_TYPE";

/// The environment variable with the URI of a remote tokenkeeper server.
pub const TOKENKEEPER_ENV_SERVER: &str = "TOKENKEEPER_SERVER";


//------------ Credential Secrets -------------------------------------------

/// The default server-side key mixed into derived client secrets.
pub const DFLT_CLIENT_SECRET_KEY: &str = "secret";

/// The default server-side salt mixed into derived client secrets.
pub const DFLT_CLIENT_SECRET_SALT: &str = "salt";


//------------ Token Access -------------------------------------------------

/// How often a drain wait wakes up to report outstanding references.
pub const DRAIN_PROGRESS_INTERVAL_MILLIS: u64 = 100;

/// The number of times a failed token operation is retried.
pub const TOKEN_ACCESS_MAX_RETRIES: usize = 1;


//------------ HTTP ---------------------------------------------------------

/// The timeout for HTTP requests made by the remote client.
pub const HTTP_CLIENT_TIMEOUT_SECS: u64 = 120;

/// The longest user agent string we keep when logging requests.
pub const HTTP_USER_AGENT_TRUNCATE: usize = 256;
