//! USB host-stack boundary.
//!
//! The engine never talks to libusb/usbfs directly. Everything it needs from
//! the host stack goes through [`UsbTransport`]: descriptor reads, control
//! transfers, alternate-setting selection and asynchronous transfer
//! submission. Completions are posted back as messages on a `flume` channel.

pub mod claim;
pub mod loopback;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::TransportError;

pub use claim::{Claim, ClaimKey};
pub use loopback::LoopbackTransport;

/// Identifier the scheduler assigns to each submission.
pub type TransferId = u64;

/// Transfer type used on the streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransferKind {
    Isochronous,
    Bulk,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isochronous => write!(f, "isochronous"),
            Self::Bulk => write!(f, "bulk"),
        }
    }
}

/// Final status of a transfer (or of one isochronous packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    Completed,
    Stall,
    Timeout,
    Overflow,
    NoDevice,
    Cancelled,
    Error,
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Stall => "stall",
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
            Self::NoDevice => "no device",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Per-packet bookkeeping of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub actual_length: usize,
    pub status: TransferStatus,
}

/// A transfer request and the buffer it owns.
///
/// The scheduler moves a `Transfer` into the transport on submit and gets it
/// back inside a [`Completion`]; the buffer is never shared while in flight.
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    endpoint: u8,
    kind: TransferKind,
    packet_size: usize,
    buffer: Vec<u8>,
    packets: Vec<IsoPacket>,
    actual_length: usize,
}

impl Transfer {
    /// Isochronous request: `buffer` holds `packets` slots of `packet_size` bytes.
    pub fn isochronous(endpoint: u8, packet_size: usize, packets: usize, buffer: Vec<u8>) -> Self {
        Self {
            id: 0,
            endpoint,
            kind: TransferKind::Isochronous,
            packet_size,
            buffer,
            packets: vec![IsoPacket::default(); packets],
            actual_length: 0,
        }
    }

    pub fn bulk(endpoint: u8, buffer: Vec<u8>) -> Self {
        let packet_size = buffer.len();
        Self {
            id: 0,
            endpoint,
            kind: TransferKind::Bulk,
            packet_size,
            buffer,
            packets: Vec::new(),
            actual_length: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn packets(&self) -> &[IsoPacket] {
        &self.packets
    }

    /// Bytes received by a bulk transfer.
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Write `data` into isochronous packet slot `index`, truncating to the
    /// packet size. Returns the number of bytes stored.
    pub fn fill_packet(&mut self, index: usize, data: &[u8], status: TransferStatus) -> usize {
        let Some(packet) = self.packets.get_mut(index) else {
            return 0;
        };
        let len = data.len().min(self.packet_size);
        let start = index * self.packet_size;
        self.buffer[start..start + len].copy_from_slice(&data[..len]);
        packet.actual_length = len;
        packet.status = status;
        len
    }

    /// Write `data` at the start of a bulk buffer, truncating to capacity.
    pub fn fill_bulk(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&data[..len]);
        self.actual_length = len;
        len
    }

    /// Received payloads in packet order.
    ///
    /// Isochronous packets that failed or carried no bytes are skipped; each
    /// remaining packet is one UVC payload. A bulk transfer yields at most one
    /// payload.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let bulk = match self.kind {
            TransferKind::Bulk if self.actual_length > 0 => Some(&self.buffer[..self.actual_length]),
            _ => None,
        };
        let iso = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status.is_success() && p.actual_length > 0)
            .map(move |(i, p)| {
                let start = i * self.packet_size;
                &self.buffer[start..start + p.actual_length]
            });
        bulk.into_iter().chain(iso)
    }

    /// Number of isochronous packets that completed with an error status.
    pub fn failed_packets(&self) -> usize {
        self.packets
            .iter()
            .filter(|p| !p.status.is_success())
            .count()
    }

    pub(crate) fn prepare(&mut self, id: TransferId) {
        self.id = id;
        self.actual_length = 0;
        for packet in &mut self.packets {
            *packet = IsoPacket::default();
        }
    }
}

/// A finished (or cancelled) transfer handed back by the transport.
#[derive(Debug)]
pub struct Completion {
    pub transfer: Transfer,
    pub status: TransferStatus,
}

/// Submission refused by the transport; the transfer is handed back.
#[derive(Debug)]
pub struct SubmitError {
    pub transfer: Transfer,
    pub error: TransportError,
}

/// Class-specific control request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Capability interface over the USB host stack.
///
/// Implementations must post exactly one [`Completion`] for every accepted
/// submission, including cancelled ones, on the sender given at submit time.
pub trait UsbTransport: Send + Sync + 'static {
    /// Stable identifier for the physical device (bus/address or similar).
    fn device_id(&self) -> String;

    /// Raw 18-byte device descriptor.
    fn device_descriptor(&self) -> Result<Bytes, TransportError>;

    /// Raw active configuration descriptor block (all interfaces).
    fn configuration_descriptor(&self) -> Result<Bytes, TransportError>;

    fn control_in(
        &self,
        setup: ControlSetup,
        length: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Queue `transfer` on its endpoint. Returns immediately.
    fn submit(
        &self,
        transfer: Transfer,
        completions: flume::Sender<Completion>,
    ) -> Result<(), SubmitError>;

    /// Request cancellation. The transfer still completes (with
    /// [`TransferStatus::Cancelled`] or its real status) through the channel.
    fn cancel(&self, endpoint: u8, id: TransferId) -> Result<(), TransportError>;
}
