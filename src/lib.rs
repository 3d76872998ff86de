//! fishbowl: per-user Docker sandboxes whose terminals everyone in the room
//! can watch.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod http_server;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod provision;
pub mod runtime;
pub mod state;
pub mod terminal;

pub use config::Config;
pub use state::AppState;
