//! Frame delivery: reassembly sink, drop-oldest queue, decode worker and
//! host notifications.

pub mod events;
pub mod ringbuf;
pub(crate) mod sink;
pub mod stats;
pub(crate) mod worker;

pub use events::{EventCallback, EventHub, FrameCallback, StreamEvent};
pub use ringbuf::FrameQueue;
pub use stats::{StatsSnapshot, StreamStats};
