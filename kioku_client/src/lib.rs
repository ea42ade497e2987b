//! Offline-first client engine: a durable local replica, a pending-change
//! queue, push/pull services and the sync manager state machine that ties
//! them together. Everything here works without a network; the transport is
//! injected and failures are recorded, not thrown.

pub mod manager;
pub mod ops;
pub mod pull;
pub mod push;
pub mod queue;
pub mod status;
pub mod store;
pub mod transport;
