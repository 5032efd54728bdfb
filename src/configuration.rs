use std::env;
use std::env::current_dir;
use std::fmt::Display;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

use crate::cors::AllowedOrigins;
use crate::square_client::SquareClient;

/// Global configuration, loaded from `configuration/*.yaml` and the
/// environment. See `get_configuration`.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub square: SquareSettings,
    pub cors: CorsSettings,
}

/// Server configuration
#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    /// Should be localhost on dev machine, 0.0.0.0 on prod
    pub host: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
}

/// Square Customers API configuration
#[derive(Deserialize, Clone)]
pub struct SquareSettings {
    /// `https://connect.squareup.com` in production,
    /// `https://connect.squareupsandbox.com` for the sandbox
    pub base_url: String,

    /// Never committed to the yaml files; supplied through
    /// `SQUARE_ACCESS_TOKEN` (or `APP_SQUARE__ACCESS_TOKEN`). When missing,
    /// the server still starts, but every subscription fails with 500.
    pub access_token: Option<Secret<String>>,

    /// Sent as the `Square-Version` header
    pub api_version: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_milliseconds: u64,

    /// Customer group that new subscribers are added to, if any
    pub newsletter_group_id: Option<String>,
}

impl SquareSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_milliseconds) }

    /// An empty token is as good as no token.
    pub fn access_token(&self) -> Option<Secret<String>> {
        self.access_token
            .as_ref()
            .filter(|t| !t.expose_secret().is_empty())
            .cloned()
    }

    /// An empty group id is treated as unset.
    pub fn newsletter_group(&self) -> Option<String> {
        self.newsletter_group_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
    }

    /// Fails on a `base_url` that cannot be parsed as a URL
    pub fn client(&self) -> Result<SquareClient, anyhow::Error> {
        SquareClient::new(
            self.base_url.clone(),
            self.access_token(),
            self.api_version.clone(),
            self.timeout(),
        )
    }
}

/// Origins allowed to `POST` subscriptions cross-origin
#[derive(Deserialize, Clone)]
pub struct CorsSettings {
    /// Matched as prefixes; the first entry doubles as the
    /// `Access-Control-Allow-Origin` value for requests without an `Origin`
    pub allowed_origins: Vec<String>,
}

impl CorsSettings {
    pub fn allowed_origins(&self) -> Result<AllowedOrigins, String> {
        AllowedOrigins::new(self.allowed_origins.clone())
    }
}

#[derive(Debug)]
pub enum Environment {
    Local,
    Production,
}

impl Display for Environment {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Environment::Local => "local",
                Environment::Production => "production",
            }
        )
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            e => Err(format!(
                "{e} is not a supported environment. Use either `local` or `production`"
            )),
        }
    }
}

/// Load yaml configuration files at `<project_root>/configuration`, then
/// layer environment variables on top.
///
/// Precedence, lowest first:
///     1. `base.yaml`
///     2. `{local,production}.yaml`, selected by `APP_ENVIRONMENT`
///     3. `APP_*` variables, e.g. `APP_APPLICATION__PORT=5001` ->
///        `Settings.application.port`
///     4. `SQUARE_ACCESS_TOKEN` and `SQUARE_NEWSLETTER_GROUP_ID`, the names
///        used by the hosting platform
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let cfg_dir = current_dir()
        .map_err(|e| ConfigError::Message(format!("could not get current dir: {e}")))?
        .join("configuration");

    let env: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or("local".to_string())
        .try_into()
        .map_err(ConfigError::Message)?;

    let settings = Config::builder()
        .add_source(config::File::from(cfg_dir.join("base.yaml")))
        .add_source(config::File::from(cfg_dir.join(format!("{env}.yaml"))))
        .add_source(
            // env vars are always strings; numbers go through `serde-aux`, and
            // the origin list is split on commas
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cors.allowed_origins")
                .try_parsing(true),
        )
        .set_override_option("square.access_token", env::var("SQUARE_ACCESS_TOKEN").ok())?
        .set_override_option(
            "square.newsletter_group_id",
            env::var("SQUARE_NEWSLETTER_GROUP_ID").ok(),
        )?
        .build()?;

    settings.try_deserialize::<Settings>()
}
