//! Loopback demo: streams synthesized frames from an in-memory webcam
//! through the full engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use uvcstream::capture::Encoding;
use uvcstream::usb::loopback::LoopbackTransport;
use uvcstream::{Codecs, EngineConfig, StreamController, StreamEvent, StreamRequest};

const DEMO_FRAMES: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("uvcstream launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(path.as_deref())?;

    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = StreamController::new(device.clone(), Codecs::default(), config.clone());

    controller.on_event(|event| {
        if let StreamEvent::Fault(fault) = event {
            warn!("Stream faulted: {}", fault);
        }
    });
    let frames = controller.subscribe_frames(4);

    let request = if config.stream.is_empty() && config.preset.is_none() {
        StreamRequest {
            encoding: Some(Encoding::Yuy2),
            width: Some(640),
            height: Some(480),
            ..Default::default()
        }
    } else {
        StreamRequest::default()
    };
    let stream = controller.open(&request).await?.clone();
    info!("Negotiated {:?}", stream);

    // Device side: one synthetic frame per negotiated interval
    let producer = {
        let device = device.clone();
        let interval = Duration::from_nanos(u64::from(stream.frame_interval.max(1)) * 100);
        let bpp = stream.encoding.bits_per_pixel().ok_or_else(|| {
            eyre!("loopback demo only synthesizes raw formats, got {}", stream.encoding)
        })?;
        let size = (stream.width * stream.height * bpp / 8) as usize;
        let payload = (stream.max_payload_transfer_size as usize)
            .clamp(64, stream.max_packet_size.max(64));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut shade = 0u8;
            loop {
                ticker.tick().await;
                device.queue_frame(&vec![shade; size], payload);
                device.pump();
                shade = shade.wrapping_add(8);
            }
        })
    };

    let mut received = 0;
    loop {
        tokio::select! {
            frame = frames.recv_async() => {
                let Ok(frame) = frame else { break };
                received += 1;
                info!(
                    "Frame {} {}x{} {:?}, {} bytes",
                    frame.sequence, frame.width, frame.height, frame.format, frame.data.len()
                );
                if received >= DEMO_FRAMES {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    producer.abort();
    controller.close().await?;
    info!("Stats: {:?}", controller.stats());
    info!("uvcstream shutting down");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvcstream=debug"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}
