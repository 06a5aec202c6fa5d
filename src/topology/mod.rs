//! The `topology` module describes what a facade declares on the broker and
//! how it publishes and consumes. See [`builder::build`].

pub mod builder;
pub mod descriptor;

pub use builder::build;
pub use descriptor::{
    ArgValue, BindingDescriptor, ConnectionPolicy, ConsumePolicy, ExchangeDescriptor,
    ExchangeKind, Marshaler, NameGenerator, PublishPolicy, QueueDescriptor, ReconnectPolicy,
    ResolvedTopology, TlsPolicy, TopologyCreation, TopologyDescriptor,
};

#[cfg(test)]
mod tests;
