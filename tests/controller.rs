use std::sync::{Arc, Mutex};
use std::time::Duration;

use uvcstream::capture::decoder::{JpegImage, SoftwareYuv};
use uvcstream::capture::{DropReason, Encoding, JpegDecoder, PixelFormat};
use uvcstream::error::{DecodeError, SchedulerError};
use uvcstream::usb::{LoopbackTransport, TransferKind};
use uvcstream::{
    Codecs, EngineConfig, StreamController, StreamError, StreamEvent, StreamFault,
    StreamRequest, StreamState,
};

const WAIT: Duration = Duration::from_secs(5);

fn controller(device: &Arc<LoopbackTransport>) -> StreamController {
    StreamController::new(device.clone(), Codecs::default(), EngineConfig::default())
}

fn record_events(controller: &StreamController) -> Arc<Mutex<Vec<StreamEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    controller.on_event(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn yuy2_vga() -> StreamRequest {
    StreamRequest {
        encoding: Some(Encoding::Yuy2),
        width: Some(640),
        height: Some(480),
        ..Default::default()
    }
}

async fn wait_for_state(controller: &StreamController, state: StreamState) {
    tokio::time::timeout(WAIT, async {
        while controller.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("state not reached in time");
}

#[tokio::test]
async fn test_open_with_default_policy() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);

    let config = controller.open(&StreamRequest::default()).await.unwrap().clone();
    assert_eq!(config.encoding, Encoding::Mjpeg);
    assert_eq!((config.width, config.height), (800, 600));
    assert_eq!(config.frame_interval, 333_333);
    assert_eq!(config.alt_setting, 4);
    assert_eq!(config.max_packet_size, 1024);
    assert_eq!(config.packets_per_request, 32);
    assert_eq!(config.active_urbs, 32);
    assert_eq!(config.transfer, TransferKind::Isochronous);

    assert_eq!(controller.state(), StreamState::Streaming);
    assert!(controller.descriptor().is_some());
    assert_eq!(device.submitted(), 32);
    assert_eq!(device.interface_calls(), vec![(1, 4)]);

    let committed = device.committed().unwrap();
    assert_eq!(committed.format_index, config.format_index);
    assert_eq!(committed.frame_index, config.frame_index);
    assert_eq!(committed.frame_interval, 333_333);

    controller.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);

    // Closing a never-opened controller is fine
    controller.close().await.unwrap();

    controller.open(&yuy2_vga()).await.unwrap();
    controller.close().await.unwrap();
    controller.close().await.unwrap();

    assert_eq!(controller.state(), StreamState::Closed);
    assert!(controller.config().is_none());
    assert!(controller.descriptor().is_none());
    assert_eq!(device.pending(), 0);
    assert_eq!(device.interface_calls(), vec![(1, 5), (1, 0)]);

    // And it can be reopened
    controller.open(&yuy2_vga()).await.unwrap();
    controller.close().await.unwrap();
}

#[tokio::test]
async fn test_yuy2_frames_reach_the_host() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);
    let frames = controller.subscribe_frames(4);

    let config = controller.open(&yuy2_vga()).await.unwrap().clone();
    assert_eq!(config.max_packet_size, 3072);
    assert_eq!(config.alt_setting, 5);

    let size = 640 * 480 * 2;
    device.queue_frame(&vec![0x80; size], config.max_packet_size);
    assert!(device.pump() > 0);

    let frame = tokio::time::timeout(WAIT, frames.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.sequence, 1);
    assert_eq!((frame.width, frame.height), (640, 480));
    assert_eq!(frame.format, PixelFormat::Yuyv);
    assert_eq!(frame.stride, 1280);
    assert_eq!(frame.data.len(), size);
    assert!(frame.data.iter().all(|&b| b == 0x80));

    let stats = controller.stats();
    assert_eq!(stats.frames_completed, 1);
    assert_eq!(stats.frames_delivered, 1);
    assert_eq!(stats.frames_dropped(), 0);

    controller.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_faults_the_stream() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);
    let events = record_events(&controller);

    controller.open(&yuy2_vga()).await.unwrap();
    device.disconnect();
    wait_for_state(&controller, StreamState::Faulted).await;
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[StreamEvent::Disconnected]
    );

    let err = controller.open(&yuy2_vga()).await.err().unwrap();
    assert!(matches!(
        err,
        StreamError::InvalidState {
            operation: "open",
            state: StreamState::Faulted
        }
    ));

    controller.close().await.unwrap();
    assert_eq!(controller.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_notify_disconnect() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);
    let events = record_events(&controller);

    // Ignored while closed
    controller.notify_disconnect();
    assert_eq!(controller.state(), StreamState::Closed);

    controller.open(&yuy2_vga()).await.unwrap();
    controller.notify_disconnect();
    assert_eq!(controller.state(), StreamState::Faulted);
    controller.notify_disconnect();
    assert_eq!(events.lock().unwrap().len(), 1);

    controller.close().await.unwrap();
    assert_eq!(controller.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_rejected_probe_returns_to_closed() {
    let device = Arc::new(LoopbackTransport::webcam());
    device.reject_probe(true);
    let mut controller = controller(&device);

    let err = controller.open(&yuy2_vga()).await.err().unwrap();
    assert!(matches!(err, StreamError::NegotiationRejected(_)));
    assert!(err.is_recoverable());
    assert_eq!(controller.state(), StreamState::Closed);
    assert_eq!(device.submitted(), 0);

    device.reject_probe(false);
    controller.open(&yuy2_vga()).await.unwrap();
    controller.close().await.unwrap();
}

#[tokio::test]
async fn test_probe_answer_with_other_frame_is_rejected() {
    let device = Arc::new(LoopbackTransport::webcam());
    device.answer_frame(Some(3));
    let mut controller = controller(&device);

    let err = controller.open(&yuy2_vga()).await.err().unwrap();
    assert!(matches!(err, StreamError::NegotiationRejected(_)));
    assert_eq!(controller.state(), StreamState::Closed);
    assert!(device.committed().is_none());
}

#[tokio::test]
async fn test_unsupported_request() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut controller = controller(&device);

    let request = StreamRequest {
        encoding: Some(Encoding::Yuy2),
        width: Some(1920),
        height: Some(1080),
        ..Default::default()
    };
    let err = controller.open(&request).await.err().unwrap();
    assert!(matches!(err, StreamError::UnsupportedFormat(_)));
    assert_eq!(controller.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_single_owner_per_device() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut first = controller(&device);
    let mut second = controller(&device);

    first.open(&yuy2_vga()).await.unwrap();
    let err = second.open(&yuy2_vga()).await.err().unwrap();
    assert!(matches!(err, StreamError::DeviceBusy(_)));
    assert_eq!(second.state(), StreamState::Closed);

    first.close().await.unwrap();
    second.open(&yuy2_vga()).await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_consecutive_decode_errors_fault() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut config = EngineConfig::default();
    config.pipeline.max_consecutive_decode_errors = 2;
    let mut controller = StreamController::new(device.clone(), Codecs::default(), config);
    let events = record_events(&controller);

    let request = StreamRequest {
        encoding: Some(Encoding::Mjpeg),
        width: Some(640),
        height: Some(480),
        ..Default::default()
    };
    let stream = controller.open(&request).await.unwrap().clone();

    // No SOI marker
    for attempt in 1..=2 {
        device.queue_frame(&[0x11; 4000], stream.max_packet_size);
        device.pump();
        wait_for_decode_errors(&controller, attempt).await;
    }
    wait_for_state(&controller, StreamState::Faulted).await;

    let events = events.lock().unwrap().clone();
    let decode_errors = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::DecodeError { .. }))
        .count();
    assert_eq!(decode_errors, 2);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Fault(StreamFault::DecodeErrors { count: 2 }))
    );

    // The next completion tells the scheduler to cancel its requests
    device.queue_frame(&[0x11; 16], stream.max_packet_size);
    device.pump();
    wait_until(|| device.pending() == 0).await;
    assert_eq!(device.cancelled(), 32);

    controller.close().await.unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// MJPEG decoder that parks on every frame until the test releases it.
struct GatedJpeg {
    entered: flume::Sender<()>,
    release: flume::Receiver<()>,
}

impl JpegDecoder for GatedJpeg {
    fn decode(&self, _data: &[u8]) -> Result<JpegImage, DecodeError> {
        let _ = self.entered.send(());
        self.release
            .recv()
            .map_err(|_| DecodeError::Jpeg("released".into()))?;
        Ok(JpegImage {
            pixels: vec![0; 640 * 480],
            width: 640,
            height: 480,
            format: PixelFormat::Grey,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_decoder_drops_oldest_queued_frames() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (entered_tx, entered) = flume::unbounded();
    let (release, release_rx) = flume::unbounded();
    let codecs = Codecs {
        jpeg: Arc::new(GatedJpeg {
            entered: entered_tx,
            release: release_rx,
        }),
        yuv: Arc::new(SoftwareYuv),
    };
    let mut config = EngineConfig::default();
    config.pipeline.queue_capacity = 2;
    let mut controller = StreamController::new(device.clone(), codecs, config);
    let events = record_events(&controller);
    let frames = controller.subscribe_frames(8);

    let request = StreamRequest {
        encoding: Some(Encoding::Mjpeg),
        width: Some(640),
        height: Some(480),
        ..Default::default()
    };
    let stream = controller.open(&request).await.unwrap().clone();
    let jpeg = [0xFF, 0xD8, 0, 0, 0, 0xFF, 0xD9];

    // Frame 1 occupies the worker
    device.queue_frame(&jpeg, stream.max_packet_size);
    device.pump();
    tokio::time::timeout(WAIT, entered.recv_async())
        .await
        .unwrap()
        .unwrap();

    // Frames 2..=6 contend for two queue slots
    for _ in 0..5 {
        device.queue_frame(&jpeg, stream.max_packet_size);
    }
    device.pump();
    wait_until(|| controller.stats().dropped_backpressure == 3).await;

    let dropped: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            StreamEvent::FrameDropped {
                reason: DropReason::Backpressure,
                sequence,
                ..
            } => *sequence,
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![2, 3, 4]);

    // Transfers keep cycling while the decoder is stuck
    wait_until(|| device.pending() == 32).await;
    assert_eq!(controller.state(), StreamState::Streaming);

    let mut delivered = Vec::new();
    for _ in 0..3 {
        release.send(()).unwrap();
        let frame = tokio::time::timeout(WAIT, frames.recv_async())
            .await
            .unwrap()
            .unwrap();
        delivered.push(frame.sequence);
    }
    assert_eq!(delivered, vec![1, 5, 6]);
    assert_eq!(controller.stats().frames_delivered, 3);

    controller.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_controller_releases_the_device() {
    let device = Arc::new(LoopbackTransport::webcam());
    let mut first = controller(&device);
    first.open(&yuy2_vga()).await.unwrap();
    drop(first);

    // The endpoint frees up once the detached scheduler task has drained
    let mut second = controller(&device);
    tokio::time::timeout(WAIT, async {
        loop {
            match second.open(&yuy2_vga()).await {
                Ok(_) => break,
                Err(StreamError::Scheduler(SchedulerError::DeviceBusy { .. })) => {
                    tokio::time::sleep(Duration::from_millis(1)).await
                }
                Err(e) => panic!("unexpected open error: {e}"),
            }
        }
    })
    .await
    .expect("device not released");

    assert_eq!(device.cancelled(), 32);
    assert_eq!(&device.interface_calls()[..3], &[(1, 5), (1, 0), (1, 5)]);
    second.close().await.unwrap();
}

async fn wait_for_decode_errors(controller: &StreamController, count: u64) {
    tokio::time::timeout(WAIT, async {
        while controller.stats().decode_errors < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("frame not decoded in time");
}
