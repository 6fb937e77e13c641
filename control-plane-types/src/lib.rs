//! Shared domain entities and error taxonomy for the proxy/WAF control
//! plane. Kept as its own crate so the Store, the reconciliation engine, and
//! (eventually) an external API layer can all depend on the same plain-data
//! shapes without pulling in the engine's async workers.

pub mod entities;
pub mod error;

pub use entities::*;
pub use error::{EngineError, Result};
