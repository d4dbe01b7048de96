//! Common utilities and types shared across lockstep

pub mod config;
pub mod error;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use utils::{
    bind_key_and_user, key_from_event, parent_key, parse_members, sanitize_server_id,
    timestamp_micros,
};
