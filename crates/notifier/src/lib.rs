//! Delivery side of the pipeline: the chat transport and the workers that
//! consume delivery tasks from the broker.

pub mod transport;
pub mod worker;

pub use transport::{ChatTransport, TelegramTransport, TransportError};
pub use worker::{DeliveryOutcome, DeliveryWorker, backoff_delay};
