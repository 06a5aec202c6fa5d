//! Translates broker parameters into a `TopologyDescriptor`.
//!
//! The builder is pure: no I/O, no retries. The policies are fixed:
//! - topic exchange, durable
//! - durable, non-auto-deleting quorum queue with a 6000 ms message TTL
//! - prefetch of 10 unacknowledged messages per consumer
//! - publish routing key equals the topic
//!
//! Without per-topic routes every name generator ignores its topic, so one
//! facade talks to exactly one exchange/queue/binding whatever topic it is
//! given. Per-topic routes switch the generators to a lookup that falls back
//! to the static names.

use std::collections::BTreeMap;

use crate::config::{BrokerParameters, TopicRoute};
use crate::topology::descriptor::*;
use crate::utils::{BrokerError, Result};

pub const PREFETCH_COUNT: u16 = 10;
pub const MESSAGE_TTL_MS: i64 = 6000;
pub const QUEUE_TYPE: &str = "quorum";

pub fn build(params: &BrokerParameters) -> Result<TopologyDescriptor> {
    require("uri", &params.uri)?;
    require("exchange", &params.exchange)?;
    require("queue", &params.queue_name)?;
    require("routing key", &params.routing_key)?;

    Ok(TopologyDescriptor {
        connection: connection_policy(params),
        exchange: ExchangeDescriptor {
            name: generator(&params.exchange, &params.topics, |r| &r.exchange),
            kind: ExchangeKind::Topic,
            durable: true,
        },
        queue: QueueDescriptor {
            name: generator(&params.queue_name, &params.topics, |r| &r.queue),
            durable: true,
            auto_delete: false,
            arguments: queue_arguments(),
        },
        binding: BindingDescriptor {
            routing_key: generator(&params.routing_key, &params.topics, |r| &r.routing_key),
        },
        publish: PublishPolicy {
            routing_key: NameGenerator::Topic,
        },
        consume: ConsumePolicy {
            prefetch_count: PREFETCH_COUNT,
        },
        marshaler: Marshaler::Default,
        creation: TopologyCreation::AutoCreate,
    })
}

fn connection_policy(params: &BrokerParameters) -> ConnectionPolicy {
    ConnectionPolicy {
        uri: params.uri.clone(),
        vhost: params.vhost.clone(),
        tls: TlsPolicy {
            insecure_skip_verify: params.insecure_skip_verify,
        },
        reconnect: ReconnectPolicy::default(),
    }
}

fn queue_arguments() -> BTreeMap<String, ArgValue> {
    BTreeMap::from([
        (MESSAGE_TTL_ARG.to_string(), ArgValue::Int(MESSAGE_TTL_MS)),
        (QUEUE_TYPE_ARG.to_string(), ArgValue::Str(QUEUE_TYPE.to_string())),
    ])
}

fn generator(
    fallback: &str,
    topics: &BTreeMap<String, TopicRoute>,
    field: impl Fn(&TopicRoute) -> &Option<String>,
) -> NameGenerator {
    let routes: BTreeMap<String, String> = topics
        .iter()
        .filter_map(|(topic, route)| field(route).clone().map(|name| (topic.clone(), name)))
        .collect();

    if routes.is_empty() {
        NameGenerator::Static(fallback.to_string())
    } else {
        NameGenerator::PerTopic {
            routes,
            fallback: fallback.to_string(),
        }
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BrokerError::Config(format!("broker {name} must not be empty")));
    }
    Ok(())
}
