//! Command handlers for the conduit CLI.

pub mod auth;
pub mod logging;
pub mod servers;

pub use auth::*;
pub use logging::*;
pub use servers::*;
