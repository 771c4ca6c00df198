//! # Shared Record Layout (Device Runtime ↔ Collector)
//!
//! Defines the completion-record wire format produced by a coprocessor runtime
//! and consumed by the `strata` flush pipeline. Records are packed back to back
//! inside an activity buffer; every record starts with a [`RecordHeader`] whose
//! `size` covers the whole record, so readers advance by the header rather than
//! assuming a fixed stride.
//!
//! All integers are little-endian. The crate is `no_std` so the same layout can
//! be shared with device-side or embedded producers.
//!
//! ## Key Types
//!
//! - [`RecordHeader`] - Kind and total size of one record
//! - [`ActivityRecord`] - Completed asynchronous operation (kernel, copy, barrier)
//! - [`MarkerRecord`] - Variable-length runtime marker (ignored by most consumers)

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Record Kinds
// ============================================================================

/// **Activity**: a completed asynchronous operation with a correlation id
pub const RECORD_ACTIVITY: u32 = 1;

/// **Marker**: runtime-internal annotation with a variable-length label
pub const RECORD_MARKER: u32 = 2;

// ============================================================================
// Activity Domains
// ============================================================================

/// Host API calls (synchronous callbacks only, no completion records)
pub const DOMAIN_API: u32 = 1;

/// Device operations reported by the runtime (kernels, copies)
pub const DOMAIN_DEVICE_OPS: u32 = 2;

/// Operations reported by the queue layer underneath the runtime
pub const DOMAIN_QUEUE_OPS: u32 = 3;

// ============================================================================
// Operations (device/queue domains)
// ============================================================================

pub const OP_KERNEL: u32 = 0;
pub const OP_COPY: u32 = 1;
pub const OP_BARRIER: u32 = 2;

/// Size of [`RecordHeader`] on the wire
pub const HEADER_SIZE: usize = 8;

/// Size of an encoded [`ActivityRecord`] including its header
pub const ACTIVITY_RECORD_SIZE: usize = HEADER_SIZE + 48;

/// Fixed part of an encoded [`MarkerRecord`] (header + timestamp)
pub const MARKER_FIXED_SIZE: usize = HEADER_SIZE + 8;

/// Human-readable name for a device/queue operation
#[must_use]
pub fn op_name(domain: u32, op: u32) -> &'static str {
    match (domain, op) {
        (DOMAIN_DEVICE_OPS | DOMAIN_QUEUE_OPS, OP_KERNEL) => "KernelExecution",
        (DOMAIN_DEVICE_OPS | DOMAIN_QUEUE_OPS, OP_COPY) => "CopyMemory",
        (DOMAIN_DEVICE_OPS | DOMAIN_QUEUE_OPS, OP_BARRIER) => "Barrier",
        _ => "Unknown",
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(raw);
    Some(u32::from_le_bytes(buf))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw = bytes.get(at..at + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

fn write_bytes(out: &mut [u8], at: usize, value: &[u8]) -> Option<()> {
    out.get_mut(at..at + value.len())?.copy_from_slice(value);
    Some(())
}

// ============================================================================
// Record Header
// ============================================================================

/// Common prefix of every record in an activity buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record kind (`RECORD_ACTIVITY`, `RECORD_MARKER`, ...)
    pub kind: u32,
    /// Total encoded size in bytes, header included
    pub size: u32,
}

impl RecordHeader {
    /// Read a header from the front of `bytes`
    #[must_use]
    pub fn read(bytes: &[u8]) -> Option<Self> {
        Some(Self { kind: read_u32(bytes, 0)?, size: read_u32(bytes, 4)? })
    }

    /// Write the header to the front of `out`
    pub fn write(&self, out: &mut [u8]) -> Option<()> {
        write_bytes(out, 0, &self.kind.to_le_bytes())?;
        write_bytes(out, 4, &self.size.to_le_bytes())
    }
}

/// Length of the record at the front of `rest`.
///
/// Returns `None` when the boundary cannot be determined: truncated header,
/// a size smaller than the header itself, or a size running past the buffer.
#[must_use]
pub fn next_record_len(rest: &[u8]) -> Option<usize> {
    let header = RecordHeader::read(rest)?;
    let size = header.size as usize;
    (size >= HEADER_SIZE && size <= rest.len()).then_some(size)
}

// ============================================================================
// Activity Record
// ============================================================================

/// Completion record for one asynchronous device operation
///
/// Produced by the runtime when the operation finishes on the device. The
/// `correlation_id` matches the id handed to the API callback when the
/// operation was launched on the host.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Activity domain (`DOMAIN_DEVICE_OPS`, `DOMAIN_QUEUE_OPS`)
    pub domain: u32,
    /// Operation within the domain (`OP_KERNEL`, `OP_COPY`, ...)
    pub op: u32,
    /// Id assigned by the runtime at launch time
    pub correlation_id: u64,
    /// Device timestamp at operation start (ns)
    pub begin_ns: u64,
    /// Device timestamp at operation end (ns)
    pub end_ns: u64,
    pub device_id: u32,
    pub queue_id: u32,
    /// Bytes transferred (copy operations only)
    pub bytes: u64,
}

impl ActivityRecord {
    /// Decode an activity record; `None` if `bytes` holds another kind or is short
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header = RecordHeader::read(bytes)?;
        if header.kind != RECORD_ACTIVITY || (header.size as usize) < ACTIVITY_RECORD_SIZE {
            return None;
        }

        Some(Self {
            domain: read_u32(bytes, 8)?,
            op: read_u32(bytes, 12)?,
            correlation_id: read_u64(bytes, 16)?,
            begin_ns: read_u64(bytes, 24)?,
            end_ns: read_u64(bytes, 32)?,
            device_id: read_u32(bytes, 40)?,
            queue_id: read_u32(bytes, 44)?,
            bytes: read_u64(bytes, 48)?,
        })
    }

    /// Encode into `out`, returning the number of bytes written
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        #[allow(clippy::cast_possible_truncation)]
        RecordHeader { kind: RECORD_ACTIVITY, size: ACTIVITY_RECORD_SIZE as u32 }.write(out)?;
        write_bytes(out, 8, &self.domain.to_le_bytes())?;
        write_bytes(out, 12, &self.op.to_le_bytes())?;
        write_bytes(out, 16, &self.correlation_id.to_le_bytes())?;
        write_bytes(out, 24, &self.begin_ns.to_le_bytes())?;
        write_bytes(out, 32, &self.end_ns.to_le_bytes())?;
        write_bytes(out, 40, &self.device_id.to_le_bytes())?;
        write_bytes(out, 44, &self.queue_id.to_le_bytes())?;
        write_bytes(out, 48, &self.bytes.to_le_bytes())?;
        Some(ACTIVITY_RECORD_SIZE)
    }

    /// Encode into a fresh fixed-size array
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ACTIVITY_RECORD_SIZE] {
        let mut out = [0u8; ACTIVITY_RECORD_SIZE];
        // Cannot fail: the array is exactly ACTIVITY_RECORD_SIZE long
        let _ = self.encode(&mut out);
        out
    }

    /// Operation duration, saturating at zero for inverted timestamps
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.begin_ns)
    }
}

// ============================================================================
// Marker Record
// ============================================================================

/// Runtime marker with a variable-length label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerRecord<'a> {
    pub timestamp_ns: u64,
    pub label: &'a [u8],
}

impl<'a> MarkerRecord<'a> {
    /// Decode a marker record; `None` if `bytes` holds another kind or is short
    #[must_use]
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        let header = RecordHeader::read(bytes)?;
        let size = header.size as usize;
        if header.kind != RECORD_MARKER || size < MARKER_FIXED_SIZE || size > bytes.len() {
            return None;
        }

        Some(Self { timestamp_ns: read_u64(bytes, 8)?, label: &bytes[MARKER_FIXED_SIZE..size] })
    }

    /// Encoded size of this marker
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        MARKER_FIXED_SIZE + self.label.len()
    }

    /// Encode into `out`, returning the number of bytes written
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        let size = self.encoded_len();
        RecordHeader { kind: RECORD_MARKER, size: u32::try_from(size).ok()? }.write(out)?;
        write_bytes(out, 8, &self.timestamp_ns.to_le_bytes())?;
        write_bytes(out, MARKER_FIXED_SIZE, self.label)?;
        Some(size)
    }
}
