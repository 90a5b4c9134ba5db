//! Signal vocabulary, classification, escalation rules and sentiment.
//!
//! A domain event becomes one immutable `SignalEvent` carrying a category,
//! a weight and a polarity. Everything downstream works on signals, never
//! on raw events.

pub mod bus;
pub mod classifier;
pub mod rules;
pub mod sentiment;
