use std::collections::BTreeMap;

use serde::Deserialize;

/// Topic the sample facade publishes to and consumes from when nothing else
/// is configured.
pub const DEFAULT_TOPIC: &str = "service.app.go.transaction.request";

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub broker: BrokerSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Which backend a `Backend` is built for.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    RabbitMq,
    Kafka,
}

/// Broker connection parameters.
///
/// `uri`, `exchange`, `queue` and `routing_key` have no defaults; they stay
/// `None` until a source provides them and are checked when parameters are
/// requested.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub backend: BackendKind,
    pub topic: String,
    pub uri: Option<String>,
    pub vhost: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub insecure_skip_verify: bool,
    pub topics: BTreeMap<String, TopicRoute>,
}

/// Per-topic override of exchange, queue and binding key.
///
/// Missing fields fall back to the broker-wide values.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct TopicRoute {
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
}

/// Partial configuration settings loaded from files or environment.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub backend: Option<BackendKind>,
    pub topic: Option<String>,
    pub uri: Option<String>,
    pub vhost: Option<String>,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub insecure_skip_verify: Option<bool>,
    pub topics: Option<BTreeMap<String, TopicRoute>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            broker: BrokerSettings {
                backend: BackendKind::RabbitMq,
                topic: DEFAULT_TOPIC.to_string(),
                uri: None,
                vhost: "/".to_string(),
                exchange: None,
                queue: None,
                routing_key: None,
                insecure_skip_verify: false,
                topics: BTreeMap::new(),
            },
        }
    }
}

impl Settings {
    /// Fill everything the partial settings leave out with defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let logging = partial.logging;
        let broker = partial.broker;

        Settings {
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
            broker: match broker {
                None => default.broker,
                Some(b) => BrokerSettings {
                    backend: b.backend.unwrap_or(default.broker.backend),
                    topic: b.topic.unwrap_or(default.broker.topic),
                    uri: b.uri,
                    vhost: b.vhost.unwrap_or(default.broker.vhost),
                    exchange: b.exchange,
                    queue: b.queue,
                    routing_key: b.routing_key,
                    insecure_skip_verify: b
                        .insecure_skip_verify
                        .unwrap_or(default.broker.insecure_skip_verify),
                    topics: b.topics.unwrap_or_default(),
                },
            },
        }
    }
}
