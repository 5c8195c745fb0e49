//! Test utilities shared by unit tests and benchmarks.
//!
//! Builds a [`LocalSimulator`] with a small, realistic variable table so tests
//! and benchmarks exercise the same layout.

#![cfg(any(test, feature = "benchmark"))]

use std::time::Duration;

use crate::config::ConnectionOptions;
use crate::data::{Value, VariableType};
use crate::memory::local::LocalSimulator;
use crate::Result;

/// Session info document published by [`sample_simulator`].
pub const SAMPLE_SESSION_INFO: &str = "---\nWeekendInfo:\n TrackName: okayama full\n TrackID: 166\n TrackDisplayName: Okayama International Circuit\nDriverInfo:\n DriverCarIdx: 0\n Drivers:\n - CarIdx: 0\n   UserName: Test Driver\n   CarNumber: \"7\"\n...\n";

/// Local simulator with a handful of common variables, a three-buffer
/// rotation and the sample session info. Not started.
pub fn sample_simulator() -> Result<LocalSimulator> {
    let simulator = LocalSimulator::builder()
        .variable("SessionTime", VariableType::Double, 1, "s", "Seconds since session start")
        .variable("Speed", VariableType::Float, 1, "m/s", "GPS vehicle speed")
        .variable("RPM", VariableType::Float, 1, "revs/min", "Engine rpm")
        .variable("Gear", VariableType::Int, 1, "", "-1=reverse 0=neutral 1..n=current gear")
        .variable("IsOnTrack", VariableType::Bool, 1, "", "1=Car on track physics running")
        .variable("SessionFlags", VariableType::BitField, 1, "irsdk_Flags", "Session flags")
        .variable("CarIdxLapDistPct", VariableType::Float, 8, "%", "Percentage distance around lap by car index")
        .buffer_count(3)
        .build()?;
    simulator.set_session_info(SAMPLE_SESSION_INFO)?;
    Ok(simulator)
}

/// A frame whose values are all derived from `step`, so a torn read mixes
/// visibly different values.
pub fn sample_frame(simulator: &LocalSimulator, step: u32) -> Result<Vec<u8>> {
    let mut frame = simulator.new_frame();
    let step_f = step as f32;
    simulator.write_value(&mut frame, "SessionTime", &Value::Double(step as f64 / 60.0))?;
    simulator.write_value(&mut frame, "Speed", &Value::Float(step_f))?;
    simulator.write_value(&mut frame, "RPM", &Value::Float(step_f * 100.0))?;
    simulator.write_value(&mut frame, "Gear", &Value::Int((step % 7) as i32))?;
    simulator.write_value(&mut frame, "IsOnTrack", &Value::Bool(true))?;
    simulator.write_value(&mut frame, "SessionFlags", &Value::BitField(step))?;
    let positions = (0..8).map(|_| Value::Float(step_f)).collect();
    simulator.write_value(&mut frame, "CarIdxLapDistPct", &Value::Array(positions))?;
    Ok(frame)
}

/// Options with short timeouts for tests.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_idle_timeout(Duration::from_millis(500))
        .with_acquisition_poll_interval(Duration::from_millis(10))
}

/// Install a test subscriber once; later calls are no-ops.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
