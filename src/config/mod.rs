//! The `config` module supplies broker-connection parameters.
//!
//! Values are layered the same way for every caller: an optional
//! `config/default.toml` (or an explicit file) first, then environment
//! variables prefixed with `AMQP_BRIDGE`, e.g. `AMQP_BRIDGE__BROKER__URI`.
//! Missing optional settings are filled with defaults; the connection values
//! the broker cannot work without are checked when parameters are requested.
//!
//! Consumers never read settings directly. They go through
//! [`ParameterProvider`], which a facade calls on every configuration load.

mod settings;

use std::collections::BTreeMap;
use std::path::PathBuf;

use config::{Config, Environment, File};

use crate::utils::{BrokerError, Result};
use settings::PartialSettings;

pub use settings::{
    BackendKind, BrokerSettings, DEFAULT_TOPIC, LoggingSettings, Settings, TopicRoute,
};

/// Plain connection parameters handed to the topology builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerParameters {
    pub uri: String,
    pub vhost: String,
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
    pub insecure_skip_verify: bool,
    pub topics: BTreeMap<String, TopicRoute>,
}

impl BrokerParameters {
    /// Parameters for a single static exchange/queue/binding.
    pub fn new(
        uri: impl Into<String>,
        vhost: impl Into<String>,
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            vhost: vhost.into(),
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
            insecure_skip_verify: false,
            topics: BTreeMap::new(),
        }
    }

    pub fn with_topic_route(mut self, topic: impl Into<String>, route: TopicRoute) -> Self {
        self.topics.insert(topic.into(), route);
        self
    }
}

/// Source of broker parameters.
///
/// Implementations may re-read their backing store on every call; callers
/// must not assume two calls return the same values.
pub trait ParameterProvider: Send + Sync {
    fn parameters(&self) -> Result<BrokerParameters>;
}

impl ParameterProvider for BrokerParameters {
    fn parameters(&self) -> Result<BrokerParameters> {
        Ok(self.clone())
    }
}

impl BrokerSettings {
    /// Check that every required value is present and non-empty.
    pub fn parameters(&self) -> Result<BrokerParameters> {
        Ok(BrokerParameters {
            uri: required("broker.uri", &self.uri)?,
            vhost: self.vhost.clone(),
            exchange: required("broker.exchange", &self.exchange)?,
            queue_name: required("broker.queue", &self.queue)?,
            routing_key: required("broker.routing_key", &self.routing_key)?,
            insecure_skip_verify: self.insecure_skip_verify,
            topics: self.topics.clone(),
        })
    }
}

fn required(key: &str, value: &Option<String>) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(BrokerError::Config(format!("missing value for {key}"))),
    }
}

/// Provider that reloads settings from disk and environment on every call.
#[derive(Debug, Clone, Default)]
pub struct FileParameterProvider {
    path: Option<PathBuf>,
}

impl FileParameterProvider {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ParameterProvider for FileParameterProvider {
    fn parameters(&self) -> Result<BrokerParameters> {
        let settings = match &self.path {
            Some(path) => load_config_from(path.clone())?,
            None => load_config()?,
        };
        settings.broker.parameters()
    }
}

/// Loads `config/default` (if present) merged with environment variables.
pub fn load_config() -> Result<Settings> {
    build(File::with_name("config/default").required(false))
}

/// Loads an explicit configuration file merged with environment variables.
/// The file must exist.
pub fn load_config_from(path: PathBuf) -> Result<Settings> {
    build(File::from(path).required(true))
}

fn build<S>(file: S) -> Result<Settings>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("AMQP_BRIDGE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
