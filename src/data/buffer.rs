//! Consistent reads of the active data buffer.
//!
//! The simulator rotates through up to four data buffers and stamps each one
//! with the tick it was written for. A reader picks the buffer with the highest
//! tick, copies it, and re-reads that buffer's tick. Equal ticks before and
//! after the copy mean the bytes belong to one frame; otherwise the copy is
//! discarded and the read starts over from the buffer table. A negative tick
//! marks a buffer the writer is rewriting in place.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use super::header::{DataFileHeader, offsets};
use crate::memory::SharedRegion;
use crate::{ConnectionError, Result};

/// Retries after which the reader yields its time slice instead of spinning.
const SPIN_RETRIES: u32 = 16;

/// How long a revision counter may stay negative on a live region before the
/// writer is treated as gone.
pub(crate) const STALL_LIMIT: Duration = Duration::from_secs(2);

/// Where a consistent read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSnapshot {
    /// Index of the buffer in the rotation table
    pub index: usize,
    /// Tick that bracketed the copy
    pub tick_count: i32,
    /// Copies discarded because the tick moved underneath them
    pub retries: u32,
}

/// Copy the latest data buffer into `dst`, resizing it to the buffer length.
///
/// Never fails because of concurrent writes; errors only come from a header
/// that points outside the region.
/// Never fails because of concurrent writes; errors come from a header that
/// points outside the region, or from a buffer left mid-rewrite in a region
/// that can no longer change.
pub fn read_latest_buffer_into(region: &dyn SharedRegion, dst: &mut Vec<u8>) -> Result<BufferSnapshot> {
    let mut retry = ReadRetry::new();

    loop {
        let header = DataFileHeader::read_validated(region)?;
        let index = header.latest_buffer_index();
        let tick_offset = offsets::buffer_tick(index);

        let tick_before = region.load_i32(tick_offset)?;
        if tick_before < 0 {
            // Writer is mid-rewrite of this buffer.
            retry.rewriting(region, "data buffer", tick_before)?;
            continue;
        }
        let data_offset = region.load_i32(offsets::buffer_offset(index))?;
        if data_offset != header.buffers[index].offset {
            retry.torn();
            continue;
        }

        dst.resize(header.buffer_length.max(0) as usize, 0);
        region.copy_into(data_offset as usize, dst)?;

        let tick_after = region.load_i32(tick_offset)?;
        if tick_before == tick_after {
            let retries = retry.count();
            if retries > 0 {
                trace!(index, tick = tick_after, retries, "Data buffer read settled");
            }
            return Ok(BufferSnapshot { index, tick_count: tick_after, retries });
        }

        trace!(index, tick_before, tick_after, retries = retry.count() + 1, "Torn data buffer read, retrying");
        retry.torn();
    }
}

/// Copy the latest data buffer into a new vector.
pub fn read_latest_buffer(region: &dyn SharedRegion) -> Result<(Vec<u8>, BufferSnapshot)> {
    let mut data = Vec::new();
    let snapshot = read_latest_buffer_into(region, &mut data)?;
    Ok((data, snapshot))
}

fn backoff(retries: u32) {
    if retries < SPIN_RETRIES {
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

/// Retry bookkeeping for the seqlock readers.
#[derive(Debug, Default)]
pub(crate) struct ReadRetry {
    retries: u32,
    stalled_since: Option<Instant>,
}

impl ReadRetry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self) -> u32 {
        self.retries
    }

    /// The copy raced a writer; try again.
    pub(crate) fn torn(&mut self) {
        self.retries += 1;
        self.stalled_since = None;
        backoff(self.retries);
    }

    /// `what` carries a negative revision, so a rewrite is in progress.
    /// Fails when the region is frozen or the rewrite outlasts [`STALL_LIMIT`].
    pub(crate) fn rewriting(&mut self, region: &dyn SharedRegion, what: &str, revision: i32) -> Result<()> {
        let since = *self.stalled_since.get_or_insert_with(Instant::now);
        if region.is_frozen() || since.elapsed() >= STALL_LIMIT {
            return Err(ConnectionError::parse_error(
                "Consistent read",
                format!("{} revision stuck at {} with a rewrite in progress", what, revision),
            ));
        }

        self.retries += 1;
        backoff(self.retries);
        Ok(())
    }
}
