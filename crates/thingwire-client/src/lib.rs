//! Client runtime for the thing protocol: correlates requests with their
//! responses, aggregates acknowledgements, dispatches live commands and fans
//! out events to subscriptions over one resilient WebSocket connection.

pub mod acks;
pub mod bus;
pub mod claims;
pub mod client;
pub mod consumption;
pub mod live;
pub mod pending;
pub mod signal;
pub mod worker;

#[cfg(test)]
mod testing;

pub use acks::{AcknowledgementAggregator, AcknowledgementHandle, AcknowledgementRequest, AggregateOutcome};
pub use bus::{CorrelationBus, Delivery, SignalHandler};
pub use client::{Client, ClientConfig};
pub use consumption::{ConsumptionManager, ConsumptionOptions, ConsumptionScope};
pub use live::{
    Dispatch, EntityHandleLookup, FeatureHandleLookup, GlobalHandlers, Handle, LiveCommandDispatcher, LiveProcessor,
};
pub use pending::{PendingRequests, ResponseHandle};
pub use signal::{LiveCommand, Signal};
pub use worker::WorkerPool;
