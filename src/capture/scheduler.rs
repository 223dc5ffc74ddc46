//! Transfer scheduler: keeps a pool of requests in flight on the streaming
//! endpoint and forwards received payloads in submission order.
//!
//! One dispatch task per stream owns the pool. The transport posts
//! completions on a bounded `flume` channel; the task reorders them by
//! transfer id, hands payloads to the [`PayloadSink`] and resubmits the
//! buffer right away. Buffers move between the task and the transport,
//! never shared. A completion that arrives ahead of an older one has its
//! payloads copied out so its buffer can go back to the device.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SchedulerError, StreamFault, TransportError};
use crate::usb::{
    Claim, ClaimKey, Completion, Transfer, TransferId, TransferKind, TransferStatus, UsbTransport,
};

/// Consecutive failed completions tolerated before the stream faults.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Delay before retrying requests the transport refused.
const RESUBMIT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub endpoint: u8,
    pub mode: TransferKind,
    /// Bytes per isochronous packet (bulk: bytes per packet of a request)
    pub packet_size: usize,
    pub packets_per_request: usize,
    pub request_count: usize,
    /// How long shutdown waits for cancelled requests to come back
    pub cancel_timeout: Duration,
}

impl SchedulerConfig {
    pub fn request_size(&self) -> Option<usize> {
        self.packet_size.checked_mul(self.packets_per_request)
    }
}

/// Receives payloads and the terminal fault from the dispatch task.
pub trait PayloadSink: Send + 'static {
    /// One UVC payload, header included.
    fn payload(&mut self, payload: &[u8]);

    /// Called at most once, after every request has been reclaimed.
    fn fault(&mut self, fault: StreamFault);

    /// True once the consumer has given up on the stream. The scheduler
    /// then cancels its requests and ends without reporting a fault.
    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub resubmit_failures: AtomicU64,
    pub packet_errors: AtomicU64,
    pub payload_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub resubmit_failures: u64,
    pub packet_errors: u64,
    pub payload_bytes: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
            packet_errors: self.packet_errors.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Releases items strictly in id order, holding early arrivals.
#[derive(Debug)]
struct ReorderWindow<T> {
    next: TransferId,
    held: BTreeMap<TransferId, T>,
}

impl<T> ReorderWindow<T> {
    fn new(first: TransferId) -> Self {
        Self {
            next: first,
            held: BTreeMap::new(),
        }
    }

    fn is_next(&self, id: TransferId) -> bool {
        id == self.next
    }

    fn advance(&mut self) {
        self.next += 1;
    }

    fn insert(&mut self, id: TransferId, item: T) {
        self.held.insert(id, item);
    }

    fn pop_ready(&mut self) -> Option<T> {
        let item = self.held.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }
}

/// An early completion parked in the reorder window. Its buffer has already
/// been resubmitted.
#[derive(Debug)]
struct Received {
    status: TransferStatus,
    payloads: Vec<Bytes>,
    failed_packets: usize,
}

impl Received {
    fn copy_from(transfer: &Transfer, status: TransferStatus) -> Self {
        let payloads = if status.is_success() {
            transfer.payloads().map(Bytes::copy_from_slice).collect()
        } else {
            Vec::new()
        };
        Self {
            status,
            payloads,
            failed_packets: transfer.failed_packets(),
        }
    }
}

pub struct TransferScheduler {
    endpoint: u8,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<CachePadded<SchedulerStats>>,
}

impl TransferScheduler {
    /// Claim the endpoint, allocate and submit every request, and spawn the
    /// dispatch task. Must be called from within a Tokio runtime.
    #[instrument(skip(transport, sink), fields(endpoint = config.endpoint))]
    pub async fn start<S: PayloadSink>(
        transport: Arc<dyn UsbTransport>,
        config: SchedulerConfig,
        sink: S,
    ) -> Result<Self, SchedulerError> {
        let size = config
            .request_size()
            .filter(|&size| size > 0 && config.request_count > 0)
            .ok_or_else(|| {
                SchedulerError::AllocationFailure(format!(
                    "{} requests of {} x {} bytes",
                    config.request_count, config.packet_size, config.packets_per_request
                ))
            })?;
        size.checked_mul(config.request_count).ok_or_else(|| {
            SchedulerError::AllocationFailure("transfer pool size overflows".into())
        })?;

        let claim = Claim::acquire(ClaimKey::endpoint(transport.device_id(), config.endpoint))
            .ok_or(SchedulerError::DeviceBusy {
                endpoint: config.endpoint,
            })?;

        let mut pool = Vec::new();
        pool.try_reserve_exact(config.request_count)
            .map_err(|e| SchedulerError::AllocationFailure(e.to_string()))?;
        for _ in 0..config.request_count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|e| SchedulerError::AllocationFailure(e.to_string()))?;
            buffer.resize(size, 0);
            pool.push(match config.mode {
                TransferKind::Isochronous => Transfer::isochronous(
                    config.endpoint,
                    config.packet_size,
                    config.packets_per_request,
                    buffer,
                ),
                TransferKind::Bulk => Transfer::bulk(config.endpoint, buffer),
            });
        }

        let stats = Arc::new(CachePadded::new(SchedulerStats::default()));
        let (tx, rx) = flume::bounded(config.request_count);
        let mut dispatch = Dispatch {
            transport,
            config,
            completions: tx,
            rx,
            window: ReorderWindow::new(1),
            in_flight: BTreeSet::new(),
            idle: Vec::new(),
            next_id: 1,
            failures: 0,
            stats: stats.clone(),
            _claim: claim,
        };

        for transfer in pool {
            if let Err(e) = dispatch.submit(transfer) {
                warn!("Initial submission failed: {}", e.error);
                dispatch.shutdown().await;
                return Err(SchedulerError::Transport(e.error));
            }
        }
        info!(
            "Streaming {} on endpoint 0x{:02x}: {} requests x {} bytes",
            config.mode, config.endpoint, config.request_count, size
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch.run(sink, stop_rx));

        Ok(Self {
            endpoint: config.endpoint,
            stop: Some(stop_tx),
            task: Some(task),
            stats,
        })
    }

    /// Cancel every request, wait for all of them to come back and release
    /// the endpoint. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // Err means the task already ended on its own
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Dispatch task for endpoint 0x{:02x} failed: {}", self.endpoint, e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stats(&self) -> SchedulerSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        // The detached task still cancels and drains before releasing the
        // endpoint.
        if let Some(stop) = self.stop.take() {
            debug!("Scheduler for endpoint 0x{:02x} dropped while running", self.endpoint);
            let _ = stop.send(());
        }
    }
}

struct Dispatch {
    transport: Arc<dyn UsbTransport>,
    config: SchedulerConfig,
    completions: flume::Sender<Completion>,
    rx: flume::Receiver<Completion>,
    window: ReorderWindow<Received>,
    in_flight: BTreeSet<TransferId>,
    /// Reclaimed transfers waiting to be submitted again
    idle: Vec<Transfer>,
    next_id: TransferId,
    failures: u32,
    stats: Arc<CachePadded<SchedulerStats>>,
    _claim: Claim,
}

impl Dispatch {
    async fn run<S: PayloadSink>(mut self, mut sink: S, mut stop: oneshot::Receiver<()>) {
        let fault = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break None,
                completion = self.rx.recv_async() => {
                    // We hold a sender, so the channel never disconnects.
                    let Ok(completion) = completion else { break None };
                    if let Some(fault) = self.receive(completion, &mut sink) {
                        break Some(fault);
                    }
                    if sink.is_closed() {
                        debug!("Sink closed, stopping endpoint 0x{:02x}", self.config.endpoint);
                        break None;
                    }
                }
                _ = tokio::time::sleep(RESUBMIT_RETRY), if !self.idle.is_empty() => {
                    if let Some(fault) = self.refill() {
                        break Some(fault);
                    }
                }
            }
        };

        self.shutdown().await;
        if let Some(fault) = fault {
            error!("Stream on endpoint 0x{:02x} faulted: {}", self.config.endpoint, fault);
            sink.fault(fault);
        }
    }

    fn receive<S: PayloadSink>(&mut self, completion: Completion, sink: &mut S) -> Option<StreamFault> {
        let Completion { transfer, status } = completion;
        let id = transfer.id();
        self.in_flight.remove(&id);

        let fault = if self.window.is_next(id) {
            self.window.advance();
            self.process(status, transfer.failed_packets(), transfer.payloads(), sink)
        } else {
            self.window.insert(id, Received::copy_from(&transfer, status));
            None
        };
        self.idle.push(transfer);
        if fault.is_some() {
            return fault;
        }

        while let Some(held) = self.window.pop_ready() {
            let payloads = held.payloads.iter().map(|p| &p[..]);
            if let Some(fault) = self.process(held.status, held.failed_packets, payloads, sink) {
                return Some(fault);
            }
        }
        self.refill()
    }

    fn process<'a, S: PayloadSink>(
        &mut self,
        status: TransferStatus,
        failed_packets: usize,
        payloads: impl Iterator<Item = &'a [u8]>,
        sink: &mut S,
    ) -> Option<StreamFault> {
        match status {
            TransferStatus::Completed => {
                self.failures = 0;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                if failed_packets > 0 {
                    self.stats
                        .packet_errors
                        .fetch_add(failed_packets as u64, Ordering::Relaxed);
                }
                let mut bytes = 0;
                for payload in payloads {
                    bytes += payload.len() as u64;
                    sink.payload(payload);
                }
                self.stats.payload_bytes.fetch_add(bytes, Ordering::Relaxed);
                metrics::counter!("uvc_payload_bytes").increment(bytes);
                None
            }
            TransferStatus::NoDevice => {
                warn!("Transfer reports the device is gone");
                Some(StreamFault::Disconnected)
            }
            status => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("uvc_transfer_failures").increment(1);
                self.fail(status)
            }
        }
    }

    fn fail(&mut self, status: TransferStatus) -> Option<StreamFault> {
        self.failures += 1;
        warn!(
            "Transfer failed with {} ({}/{})",
            status, self.failures, MAX_CONSECUTIVE_FAILURES
        );
        (self.failures >= MAX_CONSECUTIVE_FAILURES).then_some(StreamFault::TransferFailures {
            count: self.failures,
            last: status,
        })
    }

    /// Submit every idle transfer. A refused transfer stays idle and is
    /// retried after [`RESUBMIT_RETRY`]; each refusal counts as a failure.
    fn refill(&mut self) -> Option<StreamFault> {
        while let Some(transfer) = self.idle.pop() {
            let Err(e) = self.submit(transfer) else {
                continue;
            };
            self.idle.push(e.transfer);
            self.stats.resubmit_failures.fetch_add(1, Ordering::Relaxed);
            if e.error == TransportError::NoDevice {
                return Some(StreamFault::Disconnected);
            }
            debug!("Resubmit refused: {}", e.error);
            return self.fail(TransferStatus::Error);
        }
        None
    }

    /// Ids are only consumed by accepted submissions, so the window never
    /// waits on an id that will not complete.
    fn submit(&mut self, mut transfer: Transfer) -> Result<(), crate::usb::SubmitError> {
        let id = self.next_id;
        transfer.prepare(id);
        self.transport.submit(transfer, self.completions.clone())?;
        self.next_id += 1;
        self.in_flight.insert(id);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&mut self) {
        let outstanding = self.in_flight.len();
        for &id in &self.in_flight {
            if let Err(e) = self.transport.cancel(self.config.endpoint, id) {
                debug!("Cancel of transfer {} failed: {}", id, e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.cancel_timeout;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.rx.recv_async()).await {
                Ok(Ok(completion)) => {
                    let id = completion.transfer.id();
                    if completion.status == TransferStatus::Cancelled {
                        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    self.in_flight.remove(&id);
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        "{} transfers not returned within {:?}",
                        self.in_flight.len(),
                        self.config.cancel_timeout
                    );
                    break;
                }
            }
        }
        debug!(
            "Reclaimed {}/{} in-flight transfers on endpoint 0x{:02x}",
            outstanding - self.in_flight.len(),
            outstanding,
            self.config.endpoint
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_window_releases_in_order() {
        let mut window = ReorderWindow::new(1);
        window.insert(2, "b");
        window.insert(3, "c");
        assert_eq!(window.pop_ready(), None);

        window.insert(1, "a");
        let released: Vec<_> = std::iter::from_fn(|| window.pop_ready()).collect();
        assert_eq!(released, vec!["a", "b", "c"]);

        window.insert(5, "e");
        assert_eq!(window.pop_ready(), None);
    }

    #[test]
    fn test_reorder_window_advances_past_in_place_items() {
        let mut window = ReorderWindow::new(1);
        assert!(window.is_next(1));
        window.advance();
        window.insert(3, "c");
        assert_eq!(window.pop_ready(), None);
        assert!(window.is_next(2));
        window.advance();
        assert_eq!(window.pop_ready(), Some("c"));
        assert!(window.is_next(4));
    }

    #[test]
    fn test_held_completion_copies_payloads() {
        let mut transfer = Transfer::isochronous(0x81, 8, 2, vec![0; 16]);
        transfer.fill_packet(0, &[2, 0x80, 1, 2], TransferStatus::Completed);
        transfer.fill_packet(1, &[], TransferStatus::Overflow);
        let held = Received::copy_from(&transfer, TransferStatus::Completed);
        transfer.prepare(9);

        assert_eq!(held.payloads, vec![Bytes::from_static(&[2, 0x80, 1, 2])]);
        assert_eq!(held.failed_packets, 1);
        assert!(Received::copy_from(&transfer, TransferStatus::Stall)
            .payloads
            .is_empty());
    }

    #[test]
    fn test_request_size_overflow() {
        let config = SchedulerConfig {
            endpoint: 0x81,
            mode: TransferKind::Isochronous,
            packet_size: usize::MAX,
            packets_per_request: 2,
            request_count: 1,
            cancel_timeout: Duration::from_secs(1),
        };
        assert_eq!(config.request_size(), None);
    }
}
