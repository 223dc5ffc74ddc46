pub mod config;
pub mod controller;
pub mod negotiation;
pub(crate) mod state;

pub use config::{Preset, StreamConfig, StreamRequest};
pub use controller::StreamController;
pub use state::StreamState;
