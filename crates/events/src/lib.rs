//! `eventide-events`: committed event model and distribution mechanics.
//!
//! - [`Event`] / [`NewEvent`]: immutable facts and not-yet-committed decisions
//! - [`Topic`] / [`SubscriptionPattern`]: hierarchical routing keys
//! - [`EventBus`]: pub/sub with bounded, lag-signalling subscriptions
//! - [`AggregateEngine`]: the pure state-machine boundary used by the runtime
//! - [`Projection`] / [`ProjectionRunner`]: read-model folding keyed on global order

pub mod bus;
pub mod engine;
pub mod event;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;
pub mod topic;

pub use bus::{EventBus, PublishError, RecvError, Subscription, SubscriberQueue};
pub use engine::{AggregateEngine, EngineError, Versioned};
pub use event::{Event, Metadata, NewEvent};
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryEventBus};
pub use projection::Projection;
pub use runner::{ProjectionError, ProjectionRunner};
pub use topic::{FixedDomain, PatternError, SubscriptionPattern, Topic, TopicResolver};
