//! In-process simulator.
//!
//! [`LocalSimulator`] lays out a telemetry region exactly like the real SDK
//! and drives it from the test thread: frames rotate through the data
//! buffers, session info is rewritten with its revision counter, and the
//! data-ready event is pulsed after every frame. It also lets callers start
//! and stop the "simulator" and inject attach failures.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{SharedRegion, SimulatorAttachment, SimulatorSource, check_bounds, check_word};
use crate::data::header::{HEADER_SIZE, IRSDK_STATUS_CONNECTED, IRSDK_VER, MAX_BUFFERS, offsets};
use crate::data::session::encode_latin1;
use crate::data::variables::{VARIABLE_HEADER_SIZE, Value, VariableHeader, VariableTable, VariableType};
use crate::signal::{AutoResetEvent, DataReadySignal};
use crate::{ConnectionError, Result};

/// Heap-backed region made of atomic words so a writer and any number of
/// readers can share it without locks.
#[derive(Debug)]
pub struct LocalMemory {
    words: Box<[AtomicU32]>,
    len: usize,
}

impl LocalMemory {
    /// Zeroed region of at least `len` bytes, rounded up to a whole word.
    pub fn new(len: usize) -> Self {
        let word_count = len.div_ceil(4);
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self { words, len: word_count * 4 }
    }

    /// Release-ordered store of a little-endian `i32`.
    pub fn store_i32(&self, offset: usize, value: i32) -> Result<()> {
        check_word(offset, self.len)?;
        self.words[offset / 4].store(u32::from_le_bytes(value.to_le_bytes()), Ordering::Release);
        Ok(())
    }

    /// Relaxed byte-wise write; publish with a following [`Self::store_i32`].
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len(), self.len)?;
        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i;
            let shift = (at % 4) * 8;
            let word = &self.words[at / 4];
            word.fetch_and(!(0xFF << shift), Ordering::Relaxed);
            word.fetch_or((byte as u32) << shift, Ordering::Relaxed);
        }
        Ok(())
    }

    fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.write_bytes(offset, &vec![byte; len])
    }
}

impl SharedRegion for LocalMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn load_i32(&self, offset: usize) -> Result<i32> {
        check_word(offset, self.len)?;
        let word = self.words[offset / 4].load(Ordering::Acquire);
        Ok(i32::from_le_bytes(word.to_le_bytes()))
    }

    fn copy_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_bounds(offset, dst.len(), self.len)?;
        for (i, slot) in dst.iter_mut().enumerate() {
            let at = offset + i;
            let word = self.words[at / 4].load(Ordering::Relaxed);
            *slot = word.to_le_bytes()[at % 4];
        }
        // Order the copy before the caller's closing revision load.
        fence(Ordering::Acquire);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Layout {
    session_info_offset: usize,
    session_info_capacity: usize,
    buffer_offsets: Vec<usize>,
    buffer_length: usize,
}

#[derive(Debug, Default)]
struct LocalState {
    running: bool,
    pending_failure: Option<String>,
    attach_attempts: u64,
    failed_attaches: u64,
    tick: i32,
    session_info_version: i32,
}

struct Shared {
    memory: Arc<LocalMemory>,
    data_ready: Arc<AutoResetEvent>,
    state: Mutex<LocalState>,
    changed: Condvar,
    layout: Layout,
    variables: VariableTable,
}

/// Builder for [`LocalSimulator`].
#[derive(Debug, Clone)]
pub struct LocalSimulatorBuilder {
    variables: Vec<VariableHeader>,
    next_offset: usize,
    buffer_count: usize,
    buffer_length: Option<usize>,
    session_info_capacity: usize,
    tick_rate: i32,
}

impl Default for LocalSimulatorBuilder {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            next_offset: 0,
            buffer_count: 3,
            buffer_length: None,
            session_info_capacity: 4096,
            tick_rate: 60,
        }
    }
}

impl LocalSimulatorBuilder {
    /// Append a variable; offsets are assigned in declaration order.
    pub fn variable(
        mut self,
        name: &str,
        variable_type: VariableType,
        count: usize,
        unit: &str,
        description: &str,
    ) -> Self {
        let size = variable_type.size();
        let offset = self.next_offset.next_multiple_of(size);
        self.next_offset = offset + size * count.max(1);
        self.variables.push(VariableHeader {
            name: name.to_string(),
            variable_type,
            offset,
            count: count.max(1),
            count_as_time: false,
            unit: unit.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    /// Override the data buffer length (defaults to the variables' extent).
    pub fn buffer_length(mut self, length: usize) -> Self {
        self.buffer_length = Some(length);
        self
    }

    pub fn session_info_capacity(mut self, capacity: usize) -> Self {
        self.session_info_capacity = capacity;
        self
    }

    pub fn tick_rate(mut self, tick_rate: i32) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    pub fn build(self) -> Result<LocalSimulator> {
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFERS {
            return Err(ConnectionError::configuration(format!(
                "buffer_count must be 1-{}, got {}",
                MAX_BUFFERS, self.buffer_count
            )));
        }

        let buffer_length = self.buffer_length.unwrap_or(self.next_offset).max(4).next_multiple_of(4);
        if buffer_length < self.next_offset {
            return Err(ConnectionError::configuration(format!(
                "buffer_length {} cannot hold {} bytes of variables",
                buffer_length, self.next_offset
            )));
        }

        let variable_header_offset = HEADER_SIZE;
        let session_info_offset = (variable_header_offset + self.variables.len() * VARIABLE_HEADER_SIZE)
            .next_multiple_of(16);
        let session_info_capacity = self.session_info_capacity.next_multiple_of(4);
        let first_buffer = (session_info_offset + session_info_capacity).next_multiple_of(16);
        let buffer_stride = buffer_length.next_multiple_of(16);
        let buffer_offsets: Vec<usize> =
            (0..self.buffer_count).map(|i| first_buffer + i * buffer_stride).collect();
        let total = first_buffer + buffer_stride * self.buffer_count;

        let memory = LocalMemory::new(total);
        memory.store_i32(offsets::VERSION, IRSDK_VER)?;
        memory.store_i32(offsets::TICK_RATE, self.tick_rate)?;
        memory.store_i32(offsets::SESSION_INFO_LENGTH, session_info_capacity as i32)?;
        memory.store_i32(offsets::SESSION_INFO_OFFSET, session_info_offset as i32)?;
        memory.store_i32(offsets::VARIABLE_COUNT, self.variables.len() as i32)?;
        memory.store_i32(offsets::VARIABLE_HEADER_OFFSET, variable_header_offset as i32)?;
        memory.store_i32(offsets::BUFFER_COUNT, self.buffer_count as i32)?;
        memory.store_i32(offsets::BUFFER_LENGTH, buffer_length as i32)?;
        for (index, offset) in buffer_offsets.iter().enumerate() {
            memory.store_i32(offsets::buffer_offset(index), *offset as i32)?;
        }
        for (index, variable) in self.variables.iter().enumerate() {
            memory.write_bytes(variable_header_offset + index * VARIABLE_HEADER_SIZE, &variable.encode())?;
        }

        debug!(
            bytes = total,
            variables = self.variables.len(),
            buffers = self.buffer_count,
            buffer_length,
            "Built local simulator region"
        );

        Ok(LocalSimulator {
            shared: Arc::new(Shared {
                memory: Arc::new(memory),
                data_ready: Arc::new(AutoResetEvent::new()),
                state: Mutex::new(LocalState::default()),
                changed: Condvar::new(),
                layout: Layout { session_info_offset, session_info_capacity, buffer_offsets, buffer_length },
                variables: VariableTable::from_headers(self.variables),
            }),
        })
    }
}

/// In-process stand-in for the simulator process. Clones share one region.
#[derive(Clone)]
pub struct LocalSimulator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LocalSimulator")
            .field("running", &state.running)
            .field("tick", &state.tick)
            .field("len", &self.shared.memory.len())
            .finish()
    }
}

impl LocalSimulator {
    pub fn builder() -> LocalSimulatorBuilder {
        LocalSimulatorBuilder::default()
    }

    /// Make the simulator reachable and set the connected status bit.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        state.running = true;
        let _ = self.shared.memory.store_i32(offsets::STATUS, IRSDK_STATUS_CONNECTED);
        self.shared.changed.notify_all();
        info!("Local simulator started");
    }

    /// Make the simulator unreachable for new attaches and clear the status bit.
    /// Existing attachments stay mapped but stop receiving frames.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.running = false;
        let _ = self.shared.memory.store_i32(offsets::STATUS, 0);
        info!("Local simulator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Fail the next attach attempt with a connection error.
    pub fn fail_next_attach(&self, reason: impl Into<String>) {
        let mut state = self.shared.state.lock();
        state.pending_failure = Some(reason.into());
        self.shared.changed.notify_all();
    }

    /// Number of `try_attach` calls so far.
    pub fn attach_attempts(&self) -> u64 {
        self.shared.state.lock().attach_attempts
    }

    /// Number of attach attempts that returned an error.
    pub fn failed_attaches(&self) -> u64 {
        self.shared.state.lock().failed_attaches
    }

    pub fn variables(&self) -> &VariableTable {
        &self.shared.variables
    }

    pub fn memory(&self) -> Arc<LocalMemory> {
        Arc::clone(&self.shared.memory)
    }

    /// Pulse the data-ready event without publishing a frame.
    pub fn signal_data_ready(&self) {
        self.shared.data_ready.set();
    }

    /// A zeroed frame of the data buffer length.
    pub fn new_frame(&self) -> Vec<u8> {
        vec![0u8; self.shared.layout.buffer_length]
    }

    /// Encode `value` for the named variable into `frame`.
    pub fn write_value(&self, frame: &mut [u8], name: &str, value: &Value) -> Result<()> {
        let variable = self
            .shared
            .variables
            .get(name)
            .ok_or_else(|| ConnectionError::configuration(format!("Unknown variable {}", name)))?;

        match value {
            Value::Array(values) => {
                for (index, value) in values.iter().enumerate() {
                    encode_element(variable, frame, index, value)?;
                }
                Ok(())
            }
            value => encode_element(variable, frame, 0, value),
        }
    }

    /// Write `frame` into the next buffer of the rotation, stamp it with a new
    /// tick and pulse the data-ready event. Returns the tick.
    pub fn publish_frame(&self, frame: &[u8]) -> Result<i32> {
        let layout = &self.shared.layout;
        if frame.len() > layout.buffer_length {
            return Err(ConnectionError::configuration(format!(
                "frame of {} bytes exceeds buffer length {}",
                frame.len(),
                layout.buffer_length
            )));
        }

        let mut state = self.shared.state.lock();
        let tick = state.tick.wrapping_add(1).max(1);
        let index = tick as usize % layout.buffer_offsets.len();
        let memory = &self.shared.memory;

        memory.store_i32(offsets::buffer_tick(index), -1)?;
        fence(Ordering::Release);
        memory.write_bytes(layout.buffer_offsets[index], frame)?;
        memory.fill(layout.buffer_offsets[index] + frame.len(), layout.buffer_length - frame.len(), 0)?;
        memory.store_i32(offsets::buffer_tick(index), tick)?;

        state.tick = tick;
        drop(state);

        self.shared.data_ready.set();
        Ok(tick)
    }

    /// Rewrite the session info document and bump its revision. Returns the
    /// new revision.
    pub fn set_session_info(&self, text: &str) -> Result<i32> {
        let layout = &self.shared.layout;
        let bytes = encode_latin1(text);
        if bytes.len() >= layout.session_info_capacity {
            warn!(bytes = bytes.len(), capacity = layout.session_info_capacity, "Session info too large");
            return Err(ConnectionError::configuration(format!(
                "session info of {} bytes exceeds capacity {}",
                bytes.len(),
                layout.session_info_capacity
            )));
        }

        let mut state = self.shared.state.lock();
        let version = state.session_info_version.wrapping_add(1).max(1);
        let memory = &self.shared.memory;

        memory.store_i32(offsets::SESSION_INFO_VERSION, -1)?;
        fence(Ordering::Release);
        memory.write_bytes(layout.session_info_offset, &bytes)?;
        memory.fill(
            layout.session_info_offset + bytes.len(),
            layout.session_info_capacity - bytes.len(),
            0,
        )?;
        memory.store_i32(offsets::SESSION_INFO_VERSION, version)?;

        state.session_info_version = version;
        Ok(version)
    }

    fn attachment(&self) -> SimulatorAttachment {
        let memory: Arc<dyn SharedRegion> = self.shared.memory.clone();
        let data_ready: Arc<dyn DataReadySignal> = self.shared.data_ready.clone();
        SimulatorAttachment::new(memory, data_ready)
    }
}

fn encode_element(variable: &VariableHeader, frame: &mut [u8], index: usize, value: &Value) -> Result<()> {
    let size = variable.variable_type.size();
    let start = variable.offset + index * size;
    if index >= variable.count {
        return Err(ConnectionError::configuration(format!(
            "index {} out of range for {}",
            index, variable.name
        )));
    }
    let slot = frame
        .get_mut(start..start + size)
        .ok_or_else(|| ConnectionError::memory_access_error(start))?;

    match (variable.variable_type, value) {
        (VariableType::Char, Value::Char(v)) => slot[0] = *v,
        (VariableType::Bool, Value::Bool(v)) => slot[0] = *v as u8,
        (VariableType::Int, Value::Int(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (VariableType::BitField, Value::BitField(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (VariableType::Float, Value::Float(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (VariableType::Double, Value::Double(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (expected, value) => {
            return Err(ConnectionError::configuration(format!(
                "{} is {:?}, cannot store {:?}",
                variable.name, expected, value
            )));
        }
    }
    Ok(())
}

impl SimulatorSource for LocalSimulator {
    fn try_attach(&self, wait: Duration) -> Result<Option<SimulatorAttachment>> {
        let deadline = Instant::now().checked_add(wait);
        let mut state = self.shared.state.lock();
        state.attach_attempts += 1;

        loop {
            if let Some(reason) = state.pending_failure.take() {
                state.failed_attaches += 1;
                warn!(%reason, "Local simulator attach failed");
                return Err(ConnectionError::connection_failed(reason));
            }

            if state.running {
                debug!(attempt = state.attach_attempts, "Local simulator attached");
                return Ok(Some(self.attachment()));
            }

            let timed_out = match deadline {
                Some(deadline) => self.shared.changed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.shared.changed.wait(&mut state);
                    false
                }
            };

            if timed_out && !state.running && state.pending_failure.is_none() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataFileHeader, SessionInfoText, read_latest_buffer};
    use std::thread;

    fn simulator() -> LocalSimulator {
        LocalSimulator::builder()
            .variable("Speed", VariableType::Float, 1, "m/s", "Vehicle speed")
            .variable("Gear", VariableType::Int, 1, "", "Current gear")
            .variable("OnPitRoad", VariableType::Bool, 1, "", "Car on pit road")
            .build()
            .unwrap()
    }

    #[test]
    fn local_memory_words_and_bytes() {
        let memory = LocalMemory::new(10);
        assert_eq!(memory.len(), 12);

        memory.store_i32(4, -7).unwrap();
        memory.write_bytes(9, &[0xAB, 0xCD]).unwrap();

        assert_eq!(memory.load_i32(4).unwrap(), -7);
        let mut out = [0u8; 4];
        memory.copy_into(8, &mut out).unwrap();
        assert_eq!(out, [0, 0xAB, 0xCD, 0]);
        assert!(memory.write_bytes(11, &[1, 2]).is_err());
    }

    #[test]
    fn region_has_a_valid_header_and_variable_table() {
        let sim = simulator();
        let memory = sim.memory();
        let header = DataFileHeader::read_validated(&*memory).unwrap();

        assert_eq!(header.variable_count, 3);
        assert_eq!(header.buffer_count, 3);
        assert!(!header.is_connected());

        let table = VariableTable::read(&*memory, &header).unwrap();
        assert_eq!(table.get("Gear").unwrap().offset, 4);
        assert_eq!(table.get("OnPitRoad").unwrap().offset, 8);
    }

    #[test]
    fn published_frames_rotate_and_read_back() {
        let sim = simulator();
        sim.start();

        for speed in [10.0f32, 20.0, 30.0, 40.0] {
            let mut frame = sim.new_frame();
            sim.write_value(&mut frame, "Speed", &Value::Float(speed)).unwrap();
            sim.publish_frame(&frame).unwrap();
        }

        let memory = sim.memory();
        let (data, snapshot) = read_latest_buffer(&*memory).unwrap();
        assert_eq!(snapshot.tick_count, 4);
        assert_eq!(snapshot.index, 1);
        assert_eq!(sim.variables().value("Speed", &data).unwrap(), Value::Float(40.0));
        assert!(sim.write_value(&mut sim.new_frame(), "Speed", &Value::Int(1)).is_err());
    }

    #[test]
    fn session_info_revisions_increase() {
        let sim = simulator();
        assert_eq!(sim.set_session_info("WeekendInfo:\n TrackName: spa\n").unwrap(), 1);
        assert_eq!(sim.set_session_info("WeekendInfo:\n TrackName: monza\n").unwrap(), 2);

        let info = SessionInfoText::read(&*sim.memory()).unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.text, "WeekendInfo:\n TrackName: monza\n");
    }

    #[test]
    fn attach_waits_for_start() {
        let sim = simulator();
        assert!(sim.try_attach(Duration::from_millis(5)).unwrap().is_none());

        let starter = {
            let sim = sim.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sim.start();
            })
        };

        let attachment = sim.try_attach(Duration::from_secs(5)).unwrap();
        starter.join().unwrap();
        assert!(attachment.is_some());
        assert_eq!(sim.attach_attempts(), 2);
    }

    #[test]
    fn injected_failures_fail_exactly_one_attach() {
        let sim = simulator();
        sim.start();
        sim.fail_next_attach("mapping denied");

        assert!(matches!(sim.try_attach(Duration::ZERO), Err(ConnectionError::Connection { .. })));
        assert!(sim.try_attach(Duration::ZERO).unwrap().is_some());
        assert_eq!(sim.failed_attaches(), 1);
    }

    #[test]
    fn concurrent_reader_never_sees_a_mixed_frame() {
        let sim = LocalSimulator::builder()
            .variable("Samples", VariableType::Int, 32, "", "")
            .buffer_count(1)
            .build()
            .unwrap();
        sim.start();

        let writer = {
            let sim = sim.clone();
            thread::spawn(move || {
                for n in 1..=500 {
                    let frame = vec![n as u8; sim.new_frame().len()];
                    sim.publish_frame(&frame).unwrap();
                }
            })
        };

        let memory = sim.memory();
        while !writer.is_finished() {
            let (data, _) = read_latest_buffer(&*memory).unwrap();
            assert!(data.iter().all(|&b| b == data[0]), "mixed frame observed");
        }
        writer.join().unwrap();
    }
}
