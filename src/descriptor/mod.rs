//! UVC descriptor catalog: parsing of the raw configuration block into a
//! typed device model, plus a serializer for synthetic devices.

pub mod builder;
pub mod parser;
pub mod types;

pub use builder::{ConfigurationBuilder, FormatSpec, FrameSpec};
pub use parser::{parse, parse_configuration, parse_device_descriptor, DeviceIds};
pub use types::*;
