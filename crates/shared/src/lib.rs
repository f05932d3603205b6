//! Shared types for notiflow producers and consumers.
//!
//! Holds the notification model, the inbound/outbound wire protocol of the
//! real-time notification stream, and the connection error taxonomy.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
