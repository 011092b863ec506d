/// Shared types for the Atelier thread service and its sync engine.
///
/// `models` holds validated records the engine works with, `api` holds the
/// loosely-typed wire payloads, `validate` is the only bridge between them.
pub mod api;
pub mod events;
pub mod models;
pub mod validate;
