//! End-to-end connection tests
//!
//! Drives the public API against the in-process local simulator: shared
//! handles, a simulator restart, YAML configuration and consistent reads
//! under a busy writer.

use anyhow::{Context, Result};
use pitwall_connect::{
    ConnectionError, ConnectionManager, ConnectionOptions, ConnectionState, LocalSimulator, Value, VariableType,
};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

fn simulator() -> Result<LocalSimulator> {
    let simulator = LocalSimulator::builder()
        .variable("Speed", VariableType::Float, 1, "m/s", "GPS vehicle speed")
        .variable("Lap", VariableType::Int, 1, "", "Laps started count")
        .buffer_count(3)
        .build()?;
    simulator.set_session_info("---\nWeekendInfo:\n TrackName: spa 2024 up\n...\n")?;
    Ok(simulator)
}

fn options() -> Result<ConnectionOptions> {
    Ok(ConnectionOptions::from_yaml_str("idle_timeout: 300\nacquisition_poll_interval: 10\n")?)
}

fn publish(simulator: &LocalSimulator, lap: i32) -> Result<i32> {
    let mut frame = simulator.new_frame();
    simulator.write_value(&mut frame, "Speed", &Value::Float(lap as f32 * 10.0))?;
    simulator.write_value(&mut frame, "Lap", &Value::Int(lap))?;
    Ok(simulator.publish_frame(&frame)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WeekendInfo {
    track_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Session {
    weekend_info: WeekendInfo,
}

#[test]
fn reads_stay_consistent_under_a_busy_writer() -> Result<()> {
    let simulator = simulator()?;
    simulator.start();
    let manager = ConnectionManager::new(simulator.clone(), options()?)?;
    let connection = manager.connect(Some(OPEN_TIMEOUT))?;
    let variables = connection.variables()?;

    let running = Arc::new(AtomicBool::new(true));
    let writer = {
        let simulator = simulator.clone();
        let running = Arc::clone(&running);
        thread::spawn(move || -> Result<()> {
            let mut lap = 0;
            while running.load(Ordering::Relaxed) {
                lap += 1;
                publish(&simulator, lap)?;
            }
            Ok(())
        })
    };

    let mut buffer = Vec::new();
    for _ in 0..2_000 {
        connection.read_latest_buffer(&mut buffer)?;
        let lap = match variables.value("Lap", &buffer)? {
            Value::Int(lap) => lap,
            other => anyhow::bail!("unexpected Lap value {:?}", other),
        };
        if lap > 0 {
            assert_eq!(variables.value("Speed", &buffer)?, Value::Float(lap as f32 * 10.0));
        }
    }

    running.store(false, Ordering::Relaxed);
    writer.join().map_err(|_| anyhow::anyhow!("writer panicked"))??;
    Ok(())
}

#[test]
fn reconnects_after_the_simulator_restarts() -> Result<()> {
    let simulator = simulator()?;
    simulator.start();
    let manager = ConnectionManager::new(simulator.clone(), options()?)?;

    let connection = manager.connect(Some(OPEN_TIMEOUT))?;
    publish(&simulator, 3)?;
    let first_id = connection.connection_id().context("attached")?;

    // No frames for longer than the idle timeout.
    simulator.stop();
    let deadline = std::time::Instant::now() + OPEN_TIMEOUT;
    while !connection.is_closed() {
        anyhow::ensure!(std::time::Instant::now() < deadline, "connection never went idle");
        thread::sleep(Duration::from_millis(10));
    }

    let session: Session = connection.session_info()?.parse()?;
    assert_eq!(session.weekend_info.track_name, "spa 2024 up");

    let waiting = manager.connect(Some(Duration::from_millis(50)));
    assert!(matches!(waiting, Err(ConnectionError::Timeout { .. })));

    simulator.start();
    let reconnected = manager.connect(Some(OPEN_TIMEOUT))?;
    assert_eq!(reconnected.state(), ConnectionState::Open);
    assert_ne!(reconnected.connection_id(), Some(first_id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_and_blocking_handles_share_a_connection() -> Result<()> {
    let simulator = simulator()?;
    let manager = ConnectionManager::new(simulator.clone(), options()?.with_idle_timeout(OPEN_TIMEOUT))?;

    let blocking = {
        let manager = manager.clone();
        thread::spawn(move || manager.connect(Some(OPEN_TIMEOUT)))
    };

    let starter = {
        let simulator = simulator.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            simulator.start();
        })
    };

    let asynchronous = manager.connect_async(Some(OPEN_TIMEOUT), CancellationToken::new()).await?;
    let blocking = blocking.join().map_err(|_| anyhow::anyhow!("opener panicked"))??;
    starter.join().map_err(|_| anyhow::anyhow!("starter panicked"))?;

    assert_eq!(asynchronous.connection_id(), blocking.connection_id());
    assert_eq!(manager.acquisition_workers_started(), 1);

    manager.dispose();
    assert!(asynchronous.is_closed() && blocking.is_closed());
    Ok(())
}
