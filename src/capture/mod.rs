pub mod decoder;
pub mod frame;
pub mod payload;
pub mod reassembler;
pub mod scheduler;

pub use decoder::{Codecs, FormatDecoder, JpegDecoder, OutputFormat, YuvConverter};
pub use frame::{CompletedFrame, DecodedFrame, Encoding, FrameLayout, PixelFormat};
pub use reassembler::{Assembly, DropReason, FrameReassembler};
pub use scheduler::{PayloadSink, SchedulerConfig, TransferScheduler};
