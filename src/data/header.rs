//! Telemetry header decoding.
//!
//! The header sits at offset 0 of the mapped region and follows the C
//! structure from the iRacing SDK:
//! ```c
//! typedef struct irsdk_header
//! {
//!     int ver;                    // api version 1 for older clients, 2 for newer
//!     int status;                 // bitfield for status
//!     int tickRate;               // ticks per second (60hz)
//!     int sessionInfoUpdate;      // incremented when session info changes
//!     int sessionInfoLen;         // length in bytes of session info string
//!     int sessionInfoOffset;      // offset to session info string
//!     int numVars;                // length of iarVarHeader array
//!     int varHeaderOffset;        // offset to iarVarHeader[0]
//!     int numBuf;                 // num of buffers (should be 4)
//!     int bufLen;                 // length in bytes for each buffer
//!     int pad1[2];
//!     irsdk_varBuf varBuf[4];     // { int tickCount; int bufOffset; int pad[2]; }
//! } irsdk_header;
//! ```
//!
//! Every field is read with an individual acquire load; `sessionInfoUpdate`
//! and each buffer's `tickCount` act as revision counters for the seqlock
//! readers in [`super::buffer`] and [`super::session`].

use tracing::trace;

use super::variables::VARIABLE_HEADER_SIZE;
use crate::memory::SharedRegion;
use crate::{ConnectionError, Result};

/// The expected iRacing SDK version
pub const IRSDK_VER: i32 = 2;

/// Status flag indicating that the simulator is actively publishing telemetry
pub const IRSDK_STATUS_CONNECTED: i32 = 0x1;

/// Maximum number of rotating data buffers
pub const MAX_BUFFERS: usize = 4;

/// Size of the header in bytes
pub const HEADER_SIZE: usize = 112;

/// Byte offsets of the header fields.
pub mod offsets {
    pub const VERSION: usize = 0;
    pub const STATUS: usize = 4;
    pub const TICK_RATE: usize = 8;
    pub const SESSION_INFO_VERSION: usize = 12;
    pub const SESSION_INFO_LENGTH: usize = 16;
    pub const SESSION_INFO_OFFSET: usize = 20;
    pub const VARIABLE_COUNT: usize = 24;
    pub const VARIABLE_HEADER_OFFSET: usize = 28;
    pub const BUFFER_COUNT: usize = 32;
    pub const BUFFER_LENGTH: usize = 36;
    pub const BUFFER_TABLE: usize = 48;
    pub const BUFFER_ENTRY_SIZE: usize = 16;

    /// Offset of the tick counter of buffer `index`.
    pub const fn buffer_tick(index: usize) -> usize {
        BUFFER_TABLE + index * BUFFER_ENTRY_SIZE
    }

    /// Offset of the data offset of buffer `index`.
    pub const fn buffer_offset(index: usize) -> usize {
        BUFFER_TABLE + index * BUFFER_ENTRY_SIZE + 4
    }
}

/// One entry of the rotating buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataBufferInfo {
    /// Tick count when the buffer was last written
    pub tick_count: i32,
    /// Offset of the buffer from the start of the region
    pub offset: i32,
}

/// Decoded copy of the telemetry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFileHeader {
    pub version: i32,
    pub status: i32,
    pub tick_rate: i32,
    /// Incremented when session info changes
    pub session_info_version: i32,
    pub session_info_length: i32,
    pub session_info_offset: i32,
    pub variable_count: i32,
    pub variable_header_offset: i32,
    pub buffer_count: i32,
    /// Length in bytes of one data buffer
    pub buffer_length: i32,
    pub buffers: [DataBufferInfo; MAX_BUFFERS],
}

impl DataFileHeader {
    /// Read the header from `region` without validating it.
    pub fn read(region: &dyn SharedRegion) -> Result<Self> {
        if region.len() < HEADER_SIZE {
            return Err(ConnectionError::memory_access_error(region.len()));
        }

        let mut buffers = [DataBufferInfo::default(); MAX_BUFFERS];
        for (index, buffer) in buffers.iter_mut().enumerate() {
            buffer.tick_count = region.load_i32(offsets::buffer_tick(index))?;
            buffer.offset = region.load_i32(offsets::buffer_offset(index))?;
        }

        let header = Self {
            version: region.load_i32(offsets::VERSION)?,
            status: region.load_i32(offsets::STATUS)?,
            tick_rate: region.load_i32(offsets::TICK_RATE)?,
            session_info_version: region.load_i32(offsets::SESSION_INFO_VERSION)?,
            session_info_length: region.load_i32(offsets::SESSION_INFO_LENGTH)?,
            session_info_offset: region.load_i32(offsets::SESSION_INFO_OFFSET)?,
            variable_count: region.load_i32(offsets::VARIABLE_COUNT)?,
            variable_header_offset: region.load_i32(offsets::VARIABLE_HEADER_OFFSET)?,
            buffer_count: region.load_i32(offsets::BUFFER_COUNT)?,
            buffer_length: region.load_i32(offsets::BUFFER_LENGTH)?,
            buffers,
        };

        trace!(
            version = header.version,
            status = header.status,
            session_info_version = header.session_info_version,
            buffer_count = header.buffer_count,
            "Read telemetry header"
        );

        Ok(header)
    }

    /// Read and validate the header against the region it came from.
    pub fn read_validated(region: &dyn SharedRegion) -> Result<Self> {
        let header = Self::read(region)?;
        header.validate(region.len())?;
        Ok(header)
    }

    /// Validate field ranges and that every referenced span fits in a region
    /// of `region_len` bytes.
    pub fn validate(&self, region_len: usize) -> Result<()> {
        if self.version != IRSDK_VER {
            return Err(ConnectionError::Version { expected: IRSDK_VER, found: self.version });
        }

        if self.buffer_count < 1 || self.buffer_count as usize > MAX_BUFFERS {
            return Err(ConnectionError::parse_error(
                "Header validation",
                format!("Expected 1-{} buffers, found {}", MAX_BUFFERS, self.buffer_count),
            ));
        }

        if self.buffer_length < 0 {
            return Err(ConnectionError::parse_error(
                "Header validation",
                format!("Invalid buffer length: {}", self.buffer_length),
            ));
        }

        if self.variable_count < 0 || self.session_info_length < 0 {
            return Err(ConnectionError::parse_error(
                "Header validation",
                "Header contains invalid negative counts",
            ));
        }

        if self.session_info_length > 0 {
            Self::check_span(
                "session info",
                self.session_info_offset,
                self.session_info_length as i64,
                region_len,
            )?;
        }

        if self.variable_count > 0 {
            Self::check_span(
                "variable headers",
                self.variable_header_offset,
                self.variable_count as i64 * VARIABLE_HEADER_SIZE as i64,
                region_len,
            )?;
        }

        for (index, buffer) in self.active_buffers().iter().enumerate() {
            Self::check_span(
                &format!("buffer {}", index),
                buffer.offset,
                self.buffer_length as i64,
                region_len,
            )?;
        }

        Ok(())
    }

    fn check_span(what: &str, offset: i32, length: i64, region_len: usize) -> Result<()> {
        if offset < 0 || offset as i64 + length > region_len as i64 {
            return Err(ConnectionError::parse_error(
                "Header validation",
                format!("{} span {}+{} exceeds region of {} bytes", what, offset, length, region_len),
            ));
        }
        Ok(())
    }

    /// Returns true when the simulator reports the shared memory is live
    pub fn is_connected(&self) -> bool {
        (self.status & IRSDK_STATUS_CONNECTED) != 0
    }

    /// Check if session info has been updated since last check
    pub fn session_info_changed(&self, last_version: i32) -> bool {
        self.session_info_version != last_version
    }

    /// The buffer table entries in use.
    pub fn active_buffers(&self) -> &[DataBufferInfo] {
        let count = (self.buffer_count.max(0) as usize).min(MAX_BUFFERS);
        &self.buffers[..count]
    }

    /// Index of the buffer with the highest tick count (most recent).
    pub fn latest_buffer_index(&self) -> usize {
        let mut latest = 0;
        for (index, buffer) in self.active_buffers().iter().enumerate().skip(1) {
            if self.buffers[latest].tick_count < buffer.tick_count {
                latest = index;
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySnapshot;
    use proptest::prelude::*;

    fn header_bytes(header: &DataFileHeader, region_len: usize) -> MemorySnapshot {
        let mut bytes = vec![0u8; region_len];
        let mut put = |offset: usize, value: i32| {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        };
        put(offsets::VERSION, header.version);
        put(offsets::STATUS, header.status);
        put(offsets::TICK_RATE, header.tick_rate);
        put(offsets::SESSION_INFO_VERSION, header.session_info_version);
        put(offsets::SESSION_INFO_LENGTH, header.session_info_length);
        put(offsets::SESSION_INFO_OFFSET, header.session_info_offset);
        put(offsets::VARIABLE_COUNT, header.variable_count);
        put(offsets::VARIABLE_HEADER_OFFSET, header.variable_header_offset);
        put(offsets::BUFFER_COUNT, header.buffer_count);
        put(offsets::BUFFER_LENGTH, header.buffer_length);
        for (index, buffer) in header.buffers.iter().enumerate() {
            put(offsets::buffer_tick(index), buffer.tick_count);
            put(offsets::buffer_offset(index), buffer.offset);
        }
        MemorySnapshot::from(bytes)
    }

    fn valid_header() -> DataFileHeader {
        DataFileHeader {
            version: IRSDK_VER,
            status: IRSDK_STATUS_CONNECTED,
            tick_rate: 60,
            session_info_version: 3,
            session_info_length: 64,
            session_info_offset: 200,
            variable_count: 0,
            variable_header_offset: HEADER_SIZE as i32,
            buffer_count: 3,
            buffer_length: 32,
            buffers: [
                DataBufferInfo { tick_count: 10, offset: 300 },
                DataBufferInfo { tick_count: 12, offset: 332 },
                DataBufferInfo { tick_count: 11, offset: 364 },
                DataBufferInfo::default(),
            ],
        }
    }

    prop_compose! {
        fn arb_ticks()(ticks in prop::collection::vec(0..1_000_000_i32, 1..=MAX_BUFFERS)) -> Vec<i32> {
            ticks
        }
    }

    proptest! {
        #[test]
        fn latest_buffer_has_the_highest_tick(ticks in arb_ticks()) {
            let mut header = valid_header();
            header.buffer_count = ticks.len() as i32;
            for (index, tick) in ticks.iter().enumerate() {
                header.buffers[index].tick_count = *tick;
            }

            let latest = header.latest_buffer_index();
            prop_assert!(latest < ticks.len());
            prop_assert_eq!(ticks[latest], *ticks.iter().max().unwrap());
        }

        #[test]
        fn wrong_versions_are_rejected(
            version in prop::sample::select(vec![i32::MIN, -1, 0, 1, 3, i32::MAX])
        ) {
            let mut header = valid_header();
            header.version = version;
            let result = header.validate(1024);
            prop_assert!(
                matches!(result, Err(ConnectionError::Version { expected: IRSDK_VER, found }) if found == version),
                "wrong version should be rejected with ConnectionError::Version"
            );
        }
    }

    #[test]
    fn header_round_trips_through_a_region() {
        let header = valid_header();
        let region = header_bytes(&header, 512);
        let parsed = DataFileHeader::read_validated(&region).expect("valid header");
        assert_eq!(parsed, header);
        assert!(parsed.is_connected());
        assert_eq!(parsed.latest_buffer_index(), 1);
    }

    #[test]
    fn insufficient_memory_returns_error() {
        let region = MemorySnapshot::from(vec![0u8; 10]);
        assert!(matches!(DataFileHeader::read(&region), Err(ConnectionError::Memory { .. })));
    }

    #[test]
    fn spans_outside_the_region_are_rejected() {
        let mut header = valid_header();
        header.buffers[2].offset = 500;
        assert!(matches!(header.validate(512), Err(ConnectionError::Parse { .. })));

        let mut header = valid_header();
        header.session_info_offset = -4;
        assert!(header.validate(512).is_err());

        let mut header = valid_header();
        header.buffer_count = 5;
        assert!(header.validate(512).is_err());
    }

    #[test]
    fn oversized_variable_tables_are_rejected() {
        let mut header = valid_header();
        header.variable_count = i32::MAX;
        assert!(matches!(header.validate(512), Err(ConnectionError::Parse { .. })));

        // 112 + 3 * 144 = 544 bytes
        header.variable_count = 3;
        assert!(header.validate(512).is_err());

        header.variable_count = 2;
        assert!(header.validate(512).is_ok());
    }

    #[test]
    fn session_info_change_detection_works() {
        let header = valid_header();
        assert!(header.session_info_changed(2));
        assert!(!header.session_info_changed(3));
    }
}
