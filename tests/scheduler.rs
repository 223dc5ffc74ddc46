use std::sync::Arc;
use std::time::Duration;

use uvcstream::capture::{PayloadSink, SchedulerConfig, TransferScheduler};
use uvcstream::error::{SchedulerError, StreamFault, TransportError};
use uvcstream::usb::{LoopbackTransport, TransferKind, TransferStatus};

const WAIT: Duration = Duration::from_secs(2);

/// Forwards everything the dispatch task hands over to the test.
struct ChannelSink {
    payloads: flume::Sender<Vec<u8>>,
    faults: flume::Sender<StreamFault>,
}

fn sink() -> (
    ChannelSink,
    flume::Receiver<Vec<u8>>,
    flume::Receiver<StreamFault>,
) {
    let (payloads, payload_rx) = flume::unbounded();
    let (faults, fault_rx) = flume::unbounded();
    (ChannelSink { payloads, faults }, payload_rx, fault_rx)
}

impl PayloadSink for ChannelSink {
    fn payload(&mut self, payload: &[u8]) {
        let _ = self.payloads.send(payload.to_vec());
    }

    fn fault(&mut self, fault: StreamFault) {
        let _ = self.faults.send(fault);
    }
}

fn iso(request_count: usize) -> SchedulerConfig {
    SchedulerConfig {
        endpoint: 0x81,
        mode: TransferKind::Isochronous,
        packet_size: 64,
        packets_per_request: 4,
        request_count,
        cancel_timeout: Duration::from_millis(500),
    }
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

#[tokio::test]
async fn test_payloads_forwarded_in_order_and_resubmitted() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, payloads, _faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(2), sink)
        .await
        .unwrap();
    assert_eq!(device.pending(), 2);

    for i in 0..6u8 {
        device.queue_payload(vec![2, 0x80, i]);
    }
    // Four packets per request: the first request takes 0..4, the second 4..6
    assert_eq!(device.pump(), 2);

    let mut received = Vec::new();
    for _ in 0..6 {
        let payload = tokio::time::timeout(WAIT, payloads.recv_async())
            .await
            .unwrap()
            .unwrap();
        received.push(payload[2]);
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);

    wait_until(|| device.pending() == 2).await;
    assert_eq!(device.submitted(), 4);
    assert_eq!(scheduler.stats().completed, 2);
    assert_eq!(scheduler.stats().payload_bytes, 18);

    scheduler.stop().await;
    assert_eq!(device.pending(), 0);
}

#[tokio::test]
async fn test_three_failures_fault_once() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(3), sink)
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(device.complete_next(TransferStatus::Stall));
    }

    let fault = tokio::time::timeout(WAIT, faults.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fault,
        StreamFault::TransferFailures {
            count: 3,
            last: TransferStatus::Stall
        }
    );

    // Two resubmissions before the third failure, both cancelled on shutdown
    wait_until(|| !scheduler.is_running()).await;
    assert_eq!(device.submitted(), 5);
    assert_eq!(device.cancelled(), 2);
    assert_eq!(device.pending(), 0);

    scheduler.stop().await;
    assert!(faults.try_recv().is_err());
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(3), sink)
        .await
        .unwrap();

    for status in [
        TransferStatus::Error,
        TransferStatus::Error,
        TransferStatus::Completed,
        TransferStatus::Error,
        TransferStatus::Error,
    ] {
        wait_until(|| device.pending() == 3).await;
        assert!(device.complete_next(status));
    }
    wait_until(|| device.pending() == 3).await;
    assert!(scheduler.is_running());
    assert!(faults.try_recv().is_err());

    scheduler.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(4), sink)
        .await
        .unwrap();
    assert!(scheduler.is_running());

    scheduler.stop().await;
    scheduler.stop().await;

    assert!(!scheduler.is_running());
    assert_eq!(device.cancelled(), 4);
    assert_eq!(device.pending(), 0);
    assert_eq!(scheduler.stats().cancelled, 4);
    // A clean stop is not a fault
    assert!(faults.try_recv().is_err());
}

#[tokio::test]
async fn test_endpoint_claim() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (first_sink, _p1, _f1) = sink();
    let mut first = TransferScheduler::start(device.clone(), iso(1), first_sink)
        .await
        .unwrap();

    let (second_sink, _p2, _f2) = sink();
    let err = TransferScheduler::start(device.clone(), iso(1), second_sink)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::DeviceBusy { endpoint: 0x81 }));

    first.stop().await;
    let (third_sink, _p3, _f3) = sink();
    let mut third = TransferScheduler::start(device.clone(), iso(1), third_sink)
        .await
        .unwrap();
    third.stop().await;
}

#[tokio::test]
async fn test_zero_sized_pool_is_rejected() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, _faults) = sink();
    let config = SchedulerConfig {
        packet_size: 0,
        ..iso(2)
    };
    let err = TransferScheduler::start(device.clone(), config, sink)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::AllocationFailure(_)));
    assert_eq!(device.submitted(), 0);
}

#[tokio::test]
async fn test_initial_submit_failure() {
    let device = Arc::new(LoopbackTransport::webcam());
    device.fail_submits(1);
    let (sink, _payloads, _faults) = sink();
    let err = TransferScheduler::start(device.clone(), iso(2), sink)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SchedulerError::Transport(TransportError::Io(_))
    ));
    assert_eq!(device.pending(), 0);

    // The endpoint is free again
    let (sink, _payloads, _faults) = self::sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(2), sink)
        .await
        .unwrap();
    scheduler.stop().await;
}

#[tokio::test]
async fn test_bulk_transfers() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, payloads, _faults) = sink();
    let config = SchedulerConfig {
        endpoint: 0x82,
        mode: TransferKind::Bulk,
        packet_size: 512,
        packets_per_request: 4,
        request_count: 2,
        cancel_timeout: Duration::from_millis(500),
    };
    let mut scheduler = TransferScheduler::start(device.clone(), config, sink)
        .await
        .unwrap();

    let mut payload = vec![12, 0x82];
    payload.extend(std::iter::repeat(0xAB).take(1500));
    device.queue_payload(payload.clone());
    device.queue_payload(vec![2, 0x83]);
    assert_eq!(device.pump(), 2);

    let first = tokio::time::timeout(WAIT, payloads.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, payload);
    let second = tokio::time::timeout(WAIT, payloads.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, vec![2, 0x83]);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_disconnect_faults_immediately() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(3), sink)
        .await
        .unwrap();

    device.disconnect();
    let fault = tokio::time::timeout(WAIT, faults.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault, StreamFault::Disconnected);

    scheduler.stop().await;
    assert_eq!(device.submitted(), 3);
}

#[tokio::test]
async fn test_early_completions_release_their_buffers() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, payloads, _faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(4), sink)
        .await
        .unwrap();

    // Transfer 1 stays outstanding while 2, 3 and 4 complete behind it
    for tag in [0xA, 0xB, 0xC] {
        device.queue_payload(vec![2, 0x80, tag]);
        assert!(device.complete_nth(1, TransferStatus::Completed));
        wait_until(|| device.pending() == 4).await;
    }
    assert_eq!(device.submitted(), 7);
    assert!(payloads.try_recv().is_err());

    device.queue_payload(vec![2, 0x80, 0xD]);
    assert!(device.complete_next(TransferStatus::Completed));

    let mut received = Vec::new();
    for _ in 0..4 {
        let payload = tokio::time::timeout(WAIT, payloads.recv_async())
            .await
            .unwrap()
            .unwrap();
        received.push(payload[2]);
    }
    assert_eq!(received, vec![0xD, 0xA, 0xB, 0xC]);
    wait_until(|| device.pending() == 4).await;
    assert_eq!(scheduler.stats().completed, 4);

    scheduler.stop().await;
    assert_eq!(device.cancelled(), 4);
}

#[tokio::test]
async fn test_refused_resubmit_is_retried() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(4), sink)
        .await
        .unwrap();

    device.fail_submits(1);
    device.queue_payload(vec![2, 0x80, 1]);
    assert!(device.complete_next(TransferStatus::Completed));

    // The refused buffer comes back on the retry timer
    wait_until(|| device.submitted() == 5).await;
    assert_eq!(device.pending(), 4);
    assert_eq!(scheduler.stats().resubmit_failures, 1);
    assert!(scheduler.is_running());
    assert!(faults.try_recv().is_err());

    scheduler.stop().await;
    assert_eq!(device.cancelled(), 4);
}

#[tokio::test]
async fn test_persistent_resubmit_refusal_faults() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, faults) = sink();
    let mut scheduler = TransferScheduler::start(device.clone(), iso(4), sink)
        .await
        .unwrap();

    device.fail_submits(100);
    assert!(device.complete_next(TransferStatus::Completed));

    let fault = tokio::time::timeout(WAIT, faults.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fault,
        StreamFault::TransferFailures {
            count: 3,
            last: TransferStatus::Error
        }
    );
    wait_until(|| !scheduler.is_running()).await;
    assert_eq!(scheduler.stats().resubmit_failures, 3);
    assert_eq!(device.cancelled(), 3);
    assert_eq!(device.pending(), 0);

    scheduler.stop().await;
}

/// Accepts payloads but reports itself closed after the first one.
struct ClosingSink {
    payloads: usize,
    faults: flume::Sender<StreamFault>,
}

impl PayloadSink for ClosingSink {
    fn payload(&mut self, _payload: &[u8]) {
        self.payloads += 1;
    }

    fn fault(&mut self, fault: StreamFault) {
        let _ = self.faults.send(fault);
    }

    fn is_closed(&self) -> bool {
        self.payloads > 0
    }
}

#[tokio::test]
async fn test_closed_sink_stops_transfers() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (faults, fault_rx) = flume::unbounded();
    let sink = ClosingSink { payloads: 0, faults };
    let mut scheduler = TransferScheduler::start(device.clone(), iso(3), sink)
        .await
        .unwrap();

    device.queue_payload(vec![2, 0x80, 1]);
    assert!(device.complete_next(TransferStatus::Completed));

    wait_until(|| !scheduler.is_running()).await;
    assert_eq!(device.pending(), 0);
    assert_eq!(device.submitted(), 4);
    assert_eq!(device.cancelled(), 3);
    assert!(fault_rx.try_recv().is_err());

    scheduler.stop().await;
}

#[tokio::test]
async fn test_dropped_scheduler_cancels_and_releases_endpoint() {
    let device = Arc::new(LoopbackTransport::webcam());
    let (sink, _payloads, _faults) = sink();
    let scheduler = TransferScheduler::start(device.clone(), iso(3), sink)
        .await
        .unwrap();
    drop(scheduler);

    wait_until(|| device.cancelled() == 3).await;
    assert_eq!(device.pending(), 0);

    // The detached task releases the endpoint once it has drained
    let mut again = tokio::time::timeout(WAIT, async {
        loop {
            let (sink, _payloads, _faults) = self::sink();
            match TransferScheduler::start(device.clone(), iso(1), sink).await {
                Ok(scheduler) => break scheduler,
                Err(SchedulerError::DeviceBusy { .. }) => {
                    tokio::time::sleep(Duration::from_millis(1)).await
                }
                Err(e) => panic!("unexpected start error: {e}"),
            }
        }
    })
    .await
    .expect("endpoint not released");
    again.stop().await;
}
