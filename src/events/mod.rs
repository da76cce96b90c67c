//! In-process eventing: the sampler-to-SSE fan-out bus and the durable
//! write-event relay.

pub mod bus;
pub mod relay;

pub use bus::{EventBus, PropertyEvent, Subscription};
pub use relay::{EventSink, KafkaSink, NullSink, WriteEvent, WriteEventRelay};
