//! Shared-memory attachment.
//!
//! The simulator publishes telemetry in a memory region it mutates in place.
//! [`SharedRegion`] is the read surface the rest of the crate uses:
//! acquire-ordered 32-bit loads for header fields and a racy bulk copy for
//! payload bytes. Consumers never lock the region; torn copies are detected
//! with the revision counters described in [`crate::data`].
//!
//! A physical attachment is a region plus the simulator's data-ready signal,
//! produced by a [`SimulatorSource`]. Closing an attachment is dropping it:
//! the native view is unmapped once the last in-flight reader releases its
//! `Arc`.

pub mod local;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::data::buffer::{ReadRetry, STALL_LIMIT};
use crate::data::header::{DataFileHeader, offsets};
use crate::signal::DataReadySignal;
use crate::{ConnectionError, Result};

/// Read access to a memory region that another process may mutate.
pub trait SharedRegion: Send + Sync {
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// Acquire-ordered load of a 4-byte aligned little-endian `i32`.
    fn load_i32(&self, offset: usize) -> Result<i32>;

    /// Copy `dst.len()` bytes starting at `offset`. The copy is not atomic;
    /// callers bracket it with revision reads.
    fn copy_into(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the contents can no longer change, so a rewrite seen in
    /// progress will never finish.
    fn is_frozen(&self) -> bool {
        false
    }
}

/// Check that `[offset, offset + len)` lies inside a region of `region_len` bytes.
pub(crate) fn check_bounds(offset: usize, len: usize, region_len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(()),
        _ => Err(ConnectionError::memory_access_error(offset)),
    }
}

/// Check that an `i32` load at `offset` is aligned and in bounds.
pub(crate) fn check_word(offset: usize, region_len: usize) -> Result<()> {
    if offset % 4 != 0 {
        return Err(ConnectionError::memory_access_error(offset));
    }
    check_bounds(offset, 4, region_len)
}

/// Immutable copy of a region, retained after the live attachment closes so
/// late readers still see the last-known data.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    bytes: Arc<[u8]>,
}

impl MemorySnapshot {
    /// Copy the whole of `region` so that the session info and the latest
    /// data buffer in the copy are each internally consistent.
    ///
    /// The copy is bracketed like the readers in [`crate::data`]: the
    /// session info revision and the tick of the copy's latest buffer must be
    /// non-negative and unchanged from before the copy to after it. A region
    /// without a valid header is copied as is.
    pub fn capture(region: &dyn SharedRegion) -> Result<Self> {
        let started = Instant::now();
        let mut retry = ReadRetry::new();

        loop {
            let Ok(before) = DataFileHeader::read_validated(region) else {
                return Self::copy(region);
            };
            if before.session_info_version < 0 {
                retry.rewriting(region, "session info", before.session_info_version)?;
                continue;
            }

            let copy = Self::copy(region)?;
            if copy.is_consistent_with(region, &before)? {
                if retry.count() > 0 {
                    trace!(retries = retry.count(), "Region snapshot settled");
                }
                return Ok(copy);
            }

            if started.elapsed() >= STALL_LIMIT {
                return Err(ConnectionError::parse_error(
                    "Region snapshot",
                    format!("region kept changing for {:?}", started.elapsed()),
                ));
            }
            retry.torn();
        }
    }

    fn copy(region: &dyn SharedRegion) -> Result<Self> {
        let mut bytes = vec![0u8; region.len()];
        region.copy_into(0, &mut bytes)?;
        Ok(Self { bytes: bytes.into() })
    }

    /// Whether the revisions recorded in this copy match `region` both
    /// before (`before`) and after the copy was taken.
    fn is_consistent_with(&self, region: &dyn SharedRegion, before: &DataFileHeader) -> Result<bool> {
        let Ok(copied) = DataFileHeader::read_validated(self) else {
            return Ok(false);
        };

        let version = copied.session_info_version;
        let version_after = region.load_i32(offsets::SESSION_INFO_VERSION)?;
        if version < 0 || version != before.session_info_version || version != version_after {
            return Ok(false);
        }

        let latest = copied.latest_buffer_index();
        let tick = copied.buffers[latest].tick_count;
        let tick_after = region.load_i32(offsets::buffer_tick(latest))?;
        Ok(tick >= 0 && tick == before.buffers[latest].tick_count && tick == tick_after)
    }

    pub fn empty() -> Self {
        Self { bytes: Arc::from(Vec::<u8>::new()) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for MemorySnapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes: bytes.into() }
    }
}

impl SharedRegion for MemorySnapshot {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn is_frozen(&self) -> bool {
        true
    }

    fn load_i32(&self, offset: usize) -> Result<i32> {
        check_word(offset, self.bytes.len())?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[offset..offset + 4]);
        Ok(i32::from_le_bytes(word))
    }

    fn copy_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_bounds(offset, dst.len(), self.bytes.len())?;
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        Ok(())
    }
}

/// A live attachment to the simulator: the mapped region plus its
/// data-ready signal.
#[derive(Clone)]
pub struct SimulatorAttachment {
    pub memory: Arc<dyn SharedRegion>,
    pub data_ready: Arc<dyn DataReadySignal>,
}

impl SimulatorAttachment {
    pub fn new(memory: Arc<dyn SharedRegion>, data_ready: Arc<dyn DataReadySignal>) -> Self {
        Self { memory, data_ready }
    }
}

impl std::fmt::Debug for SimulatorAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorAttachment").field("len", &self.memory.len()).finish()
    }
}

/// Factory for physical attachments.
///
/// `try_attach` waits at most `wait` for the simulator to become reachable:
///
/// - `Ok(Some(attachment))` - attached
/// - `Ok(None)` - simulator not present (yet); the caller may poll again
/// - `Err(e)` - the simulator is present but the attachment failed
pub trait SimulatorSource: Send + Sync + 'static {
    fn try_attach(&self, wait: Duration) -> Result<Option<SimulatorAttachment>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_little_endian_words() {
        let mut bytes = vec![0u8; 16];
        bytes[4..8].copy_from_slice(&42i32.to_le_bytes());
        let snapshot = MemorySnapshot::from(bytes);

        assert_eq!(snapshot.load_i32(4).unwrap(), 42);
        assert_eq!(snapshot.load_i32(0).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_and_unaligned_reads_fail() {
        let snapshot = MemorySnapshot::from(vec![0u8; 8]);

        assert!(matches!(snapshot.load_i32(6), Err(ConnectionError::Memory { offset: 6 })));
        assert!(matches!(snapshot.load_i32(8), Err(ConnectionError::Memory { .. })));

        let mut dst = [0u8; 4];
        assert!(snapshot.copy_into(6, &mut dst).is_err());
        assert!(snapshot.copy_into(usize::MAX, &mut dst).is_err());
    }

    #[test]
    fn capture_copies_the_whole_region() {
        let original = MemorySnapshot::from((0u8..32).collect::<Vec<_>>());
        let copy = MemorySnapshot::capture(&original).unwrap();
        assert_eq!(copy.as_bytes(), original.as_bytes());
        assert!(MemorySnapshot::empty().is_empty());
    }

    #[test]
    fn capture_brackets_a_live_region_and_refuses_a_frozen_rewrite() {
        let simulator = crate::test_utils::sample_simulator().unwrap();
        let live = MemorySnapshot::capture(&*simulator.memory()).unwrap();
        assert_eq!(live.len(), simulator.memory().len());
        assert!(DataFileHeader::read_validated(&live).unwrap().session_info_version > 0);

        let mut bytes = live.as_bytes().to_vec();
        bytes[offsets::SESSION_INFO_VERSION..offsets::SESSION_INFO_VERSION + 4]
            .copy_from_slice(&(-1i32).to_le_bytes());
        let frozen = MemorySnapshot::from(bytes);
        assert!(matches!(MemorySnapshot::capture(&frozen), Err(ConnectionError::Parse { .. })));
    }
}
