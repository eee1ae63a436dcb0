//! Outbox → stream → consumer pipeline: the dispatcher publishes claimed
//! outbox rows to the stream (C5); the consumer group-reads them back,
//! reorders and dedupes, and hands them to the Hub (C6).

pub mod consumer;
pub mod dispatcher;
