/// Change-feed fan-out: the dispatcher broadcasts thread-scoped change
/// events, each WebSocket connection forwards the events of its thread.
pub mod connection;
pub mod dispatcher;
