//! Connection options.
//!
//! Options are captured once at connect time and never mutated afterwards.
//! They can be built programmatically or loaded from a TOML file:
//!
//! ```toml
//! server = "acme.snowflakecomputing.com"
//! driver = "/usr/lib/snowflake/odbc/lib/libSnowflake.so"
//! uid = "loader"
//! pwd = "secret"
//! database = "ANALYTICS"
//! warehouse = "LOAD_WH"
//! role = "LOADER"
//! after_connect = ["ALTER SESSION SET TIMEZONE = 'UTC'"]
//! idle_interval_secs = 3600
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Options used to establish (and re-establish) a bridge connection.
#[derive(Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOptions {
    /// Data source name, or a URL passed to the driver verbatim.
    pub dsn: Option<String>,

    /// Path to the ODBC driver library.
    pub driver: Option<String>,

    /// Account endpoint, e.g. `acme.snowflakecomputing.com`.
    pub server: Option<String>,

    pub uid: Option<String>,
    pub pwd: Option<String>,
    pub database: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    pub warehouse: Option<String>,
    pub role: Option<String>,

    /// Authenticator mode (`snowflake`, `snowflake_jwt`, `externalbrowser`, ...).
    pub authenticator: Option<String>,

    /// Private key for key-pair authentication.
    pub priv_key_file: Option<PathBuf>,

    /// Session statements run once after every successful connect.
    #[serde(default)]
    pub after_connect: Vec<String>,

    /// A pooled connection idle longer than this is pinged before reuse.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// Bridge-side timeout for a single call. Exceeding it tears the
    /// connection down.
    pub query_timeout_secs: Option<u64>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_idle_interval() -> u64 {
    3600
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            dsn: None,
            driver: None,
            server: None,
            uid: None,
            pwd: None,
            database: None,
            schema: default_schema(),
            warehouse: None,
            role: None,
            authenticator: None,
            priv_key_file: None,
            after_connect: Vec::new(),
            idle_interval_secs: default_idle_interval(),
            query_timeout_secs: None,
        }
    }
}

impl ConnectionOptions {
    /// Create a new options builder.
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    /// Parse options from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// `<config dir>/snowbridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("snowbridge").join("config.toml"))
    }

    /// Check that enough is set to reach a warehouse.
    pub fn validate(&self) -> Result<()> {
        if self.dsn.as_deref().is_none_or(str::is_empty)
            && self.server.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::Config("either dsn or server must be set".to_string()));
        }
        if self.pwd.is_some() && self.priv_key_file.is_some() {
            return Err(Error::Config(
                "pwd and priv_key_file are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }

    /// Whether the DSN is a driver URL rather than an ODBC data source name.
    pub fn is_url(&self) -> bool {
        self.dsn.as_deref().is_some_and(|dsn| dsn.contains("://"))
    }

    /// Render the string handed to the bridge driver.
    ///
    /// A URL DSN is returned verbatim; otherwise the options become
    /// ODBC `KEY=value;` pairs.
    pub fn connection_string(&self) -> String {
        self.render(false)
    }

    /// Same as [`connection_string`](Self::connection_string) with the
    /// password masked.
    pub fn connection_string_redacted(&self) -> String {
        self.render(true)
    }

    fn render(&self, redact: bool) -> String {
        if let Some(dsn) = self.dsn.as_deref().filter(|_| self.is_url()) {
            return if redact { redact_url(dsn) } else { dsn.to_string() };
        }

        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&odbc_escape(value));
            out.push(';');
        };

        if let Some(dsn) = &self.dsn {
            push("DSN", dsn);
        }
        if let Some(driver) = &self.driver {
            push("DRIVER", driver);
        }
        if let Some(server) = &self.server {
            push("SERVER", server);
        }
        if let Some(uid) = &self.uid {
            push("UID", uid);
        }
        if let Some(pwd) = &self.pwd {
            push("PWD", if redact { "****" } else { pwd });
        }
        if let Some(database) = &self.database {
            push("DATABASE", database);
        }
        push("SCHEMA", &self.schema);
        if let Some(warehouse) = &self.warehouse {
            push("WAREHOUSE", warehouse);
        }
        if let Some(role) = &self.role {
            push("ROLE", role);
        }
        if let Some(authenticator) = &self.authenticator {
            push("AUTHENTICATOR", authenticator);
        }
        if let Some(key) = &self.priv_key_file {
            push("PRIV_KEY_FILE", &key.to_string_lossy());
        }
        out
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connection", &self.connection_string_redacted())
            .field("after_connect", &self.after_connect)
            .field("idle_interval_secs", &self.idle_interval_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .finish()
    }
}

/// Brace-quote values that would otherwise break the `KEY=value;` syntax.
fn odbc_escape(value: &str) -> String {
    if value.contains([';', '{', '}', '=']) || value.starts_with(' ') || value.ends_with(' ') {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:****@{}", scheme, user, host),
        None => url.to_string(),
    }
}

/// Builder for [`ConnectionOptions`].
#[derive(Debug, Default)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions,
}

impl ConnectionOptionsBuilder {
    /// Set the DSN (or driver URL).
    pub fn dsn(mut self, dsn: impl Into<String>) -> Self {
        self.options.dsn = Some(dsn.into());
        self
    }

    /// Set the driver library path.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.options.driver = Some(driver.into());
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.options.server = Some(server.into());
        self
    }

    /// Set user and password.
    pub fn credentials(mut self, uid: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.options.uid = Some(uid.into());
        self.options.pwd = Some(pwd.into());
        self
    }

    /// Use key-pair authentication.
    pub fn private_key(mut self, uid: impl Into<String>, key_file: impl Into<PathBuf>) -> Self {
        self.options.uid = Some(uid.into());
        self.options.priv_key_file = Some(key_file.into());
        self.options.authenticator = Some("snowflake_jwt".to_string());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.options.database = Some(database.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.options.schema = schema.into();
        self
    }

    pub fn warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.options.warehouse = Some(warehouse.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.options.role = Some(role.into());
        self
    }

    pub fn authenticator(mut self, authenticator: impl Into<String>) -> Self {
        self.options.authenticator = Some(authenticator.into());
        self
    }

    /// Add a statement to run after every successful connect.
    pub fn after_connect(mut self, statement: impl Into<String>) -> Self {
        self.options.after_connect.push(statement.into());
        self
    }

    /// Set the idle-keepalive interval.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.options.idle_interval_secs = interval.as_secs();
        self
    }

    /// Set the per-call timeout.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.options.query_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Build and validate the options.
    pub fn build(self) -> Result<ConnectionOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
