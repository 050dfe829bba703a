//! Polling loop and session tests against the simulated platform.

use std::sync::Arc;
use std::time::Duration;

use sensorbus::acquisition::{shutdown_channel, PollingConfig, PollingLoop, StopReason};
use sensorbus::config::{AppConfig, SensorEntry};
use sensorbus::error::AppError;
use sensorbus::session::Session;
use sensorbus::sink::ChannelSink;
#[cfg(feature = "storage_csv")]
use sensorbus::sink::CsvRecorder;
use sensorbus_core::{ErrorKind, Reading, SwitchCommand};
use sensorbus_hal::{Board, Resource, SimPlatform};

fn sim_board() -> (SimPlatform, Board) {
    let sim = SimPlatform::new();
    let board = Board::new(Arc::new(sim.clone()));
    (sim, board)
}

fn entry(id: &str, driver: &str, connection: &str, options: &str) -> SensorEntry {
    SensorEntry {
        id: id.to_string(),
        driver: driver.to_string(),
        connection: connection.to_string(),
        enabled: true,
        options: toml::from_str(options).unwrap(),
    }
}

fn config_with(sensors: Vec<SensorEntry>, interval_ms: u64, max_samples: Option<u64>) -> AppConfig {
    let mut config = AppConfig::default();
    config.acquisition.interval_ms = interval_ms;
    config.acquisition.max_samples = max_samples;
    config.sensors = sensors;
    config
}

#[tokio::test]
async fn test_stops_after_max_samples() {
    let (sim, board) = sim_board();
    sim.set_analog(0, 1023);
    sim.set_level(4, true);

    let config = config_with(
        vec![
            entry("pot", "analog", "a:0", ""),
            entry("button", "digital_input", "g:4", ""),
        ],
        5,
        Some(3),
    );
    let session = Session::with_board(config, board).await.unwrap();
    let (sink, mut rx) = ChannelSink::channel(16);

    let (_handle, shutdown) = shutdown_channel();
    let summary = session
        .polling_loop()
        .with_sink(Box::new(sink))
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::MaxSamples);
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.samples, 6);
    assert_eq!(summary.per_sensor["pot"].samples, 3);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.sensor, "pot");
    assert!(matches!(first.reading, Reading::Scalar { value, .. } if (value - 5.0).abs() < 1e-9));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.sensor, "button");
    assert_eq!(second.reading, Reading::Digital { level: true });
}

#[tokio::test]
async fn test_shutdown_stops_loop() {
    let (_sim, board) = sim_board();
    let config = config_with(vec![entry("pot", "analog", "a:0", "")], 10, None);
    let session = Session::with_board(config, board).await.unwrap();

    let (handle, shutdown) = shutdown_channel();
    let task = tokio::spawn(session.polling_loop().run(shutdown));

    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.trigger();

    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.stop, StopReason::Shutdown);
    assert!(summary.rounds >= 1);
}

#[tokio::test]
async fn test_triggered_before_start_runs_no_rounds() {
    let (_sim, board) = sim_board();
    let config = config_with(vec![entry("pot", "analog", "a:0", "")], 10, Some(5));
    let session = Session::with_board(config, board).await.unwrap();

    let (handle, shutdown) = shutdown_channel();
    handle.trigger();
    let summary = session.polling_loop().run(shutdown).await.unwrap();
    assert_eq!(summary.stop, StopReason::Shutdown);
    assert_eq!(summary.rounds, 0);
}

#[tokio::test]
async fn test_dropped_handle_keeps_polling() {
    let (_sim, board) = sim_board();
    let config = config_with(vec![entry("pot", "analog", "a:0", "")], 5, Some(2));
    let session = Session::with_board(config, board).await.unwrap();

    let (handle, shutdown) = shutdown_channel();
    drop(handle);
    let summary = session.polling_loop().run(shutdown).await.unwrap();
    assert_eq!(summary.stop, StopReason::MaxSamples);
    assert_eq!(summary.rounds, 2);
}

#[tokio::test]
async fn test_transient_failure_skips_sample() {
    let (sim, board) = sim_board();
    sim.set_analog(1, 512);

    let config = config_with(vec![entry("soil", "analog", "a:1", "")], 5, Some(3));
    let session = Session::with_board(config, board).await.unwrap();
    // Opening the channel would consume a fault queued earlier
    sim.fail_next(Resource::Analog(1), ErrorKind::TransientIo);

    let (_handle, shutdown) = shutdown_channel();
    let summary = session.polling_loop().run(shutdown).await.unwrap();
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.transient_failures, 1);
    assert_eq!(summary.per_sensor["soil"].consecutive_failures, 0);
}

#[tokio::test]
async fn test_consecutive_transient_failures_escalate() {
    let (sim, board) = sim_board();
    let mut config = config_with(vec![entry("soil", "analog", "a:1", "")], 5, Some(10));
    config.acquisition.max_consecutive_failures = 3;
    let session = Session::with_board(config, board).await.unwrap();
    for _ in 0..3 {
        sim.fail_next(Resource::Analog(1), ErrorKind::TransientIo);
    }

    let (_handle, shutdown) = shutdown_channel();
    let err = session.polling_loop().run(shutdown).await.unwrap_err();
    match err {
        AppError::Sensor(e) => {
            assert!(e.is_fatal());
            assert!(e.to_string().contains("3 consecutive transient failures"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_fatal_error_stops_loop() {
    let (sim, board) = sim_board();
    let config = config_with(vec![entry("pot", "analog", "a:0", "")], 5, Some(10));
    let session = Session::with_board(config, board).await.unwrap();
    sim.fail_next(Resource::Analog(0), ErrorKind::FatalIo);

    let (_handle, shutdown) = shutdown_channel();
    let err = session.polling_loop().run(shutdown).await.unwrap_err();
    assert!(matches!(err, AppError::Sensor(ref e) if e.kind() == ErrorKind::FatalIo));
    assert_eq!(err.exit_code(), 1);
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_csv_recording() {
    let (sim, board) = sim_board();
    sim.set_analog(0, 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.csv");

    let config = config_with(vec![entry("pot", "analog", "a:0", "unit = \"mV\"")], 5, Some(2));
    let session = Session::with_board(config, board).await.unwrap();
    let recorder = CsvRecorder::open(&path).unwrap();

    let (_handle, shutdown) = shutdown_channel();
    session
        .polling_loop()
        .with_sink(Box::new(recorder))
        .run(shutdown)
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "timestamp,sensor,kind,value,unit");
    assert!(lines[1].ends_with(",pot,scalar,0,mV"), "got {:?}", lines[1]);
}

#[tokio::test]
async fn test_session_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sensorbus.toml");
    std::fs::write(
        &path,
        r#"
[platform]
backend = "sim"

[acquisition]
interval_ms = 5
max_samples = 1

[[sensors]]
id = "pot"
driver = "analog"
connection = "a:0"

[[sensors]]
id = "flow"
driver = "pulse_counter"
connection = "g:22:rising"

[[sensors]]
id = "relay"
driver = "digital_output"
connection = "g:17:out"
enabled = false
"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path).unwrap();
    let session = Session::start(config).await.unwrap();

    assert_eq!(session.sensors().len(), 2);
    assert_eq!(session.counters().len(), 1);
    assert_eq!(session.interrupt_sources().len(), 1);
    assert!(session.switches().is_empty());
    assert!(session.sensor("relay").is_none());

    let summary = session.connection_summary().unwrap();
    assert_eq!(summary.analog, 1);
    assert_eq!(summary.gpio, 1);

    let (_handle, shutdown) = shutdown_channel();
    let summary = session.polling_loop().run(shutdown).await.unwrap();
    assert_eq!(summary.samples, 2);
}

#[tokio::test]
async fn test_session_rejects_claimed_pin() {
    let (_sim, board) = sim_board();
    let config = config_with(
        vec![
            entry("a", "digital_input", "g:4", ""),
            entry("b", "pulse_counter", "g:4", ""),
        ],
        5,
        None,
    );

    let err = Session::with_board(config, board.clone()).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    // The first proxy was dropped with the failed session
    assert!(board.claimed().is_empty());
}

#[tokio::test]
async fn test_session_switches_output_by_id() {
    let (sim, board) = sim_board();
    let config = config_with(
        vec![
            entry("pot", "analog", "a:0", ""),
            entry("relay", "digital_output", "g:17:out", ""),
        ],
        5,
        None,
    );
    let session = Session::with_board(config, board).await.unwrap();

    assert!(session.command("relay", SwitchCommand::On).await.unwrap());
    assert!(sim.level(17));
    assert!(!session.command("relay", SwitchCommand::Toggle).await.unwrap());
    assert!(!sim.level(17));
    assert!(session.switch("relay").unwrap().toggle().await.unwrap());
    assert!(sim.level(17));

    let err = session.command("pot", SwitchCommand::On).await.unwrap_err();
    assert!(err.to_string().contains("not switchable"));
    let err = session.command("pump", SwitchCommand::Off).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_polling_loop_without_session() {
    let (sim, board) = sim_board();
    sim.set_analog(3, 100);
    let analog = board.analog(3).unwrap();
    let sensor = sensorbus_drivers::AnalogSensor::new(
        "raw",
        analog,
        &sensorbus_drivers::AnalogConfig::default(),
    )
    .unwrap();

    let config = PollingConfig {
        interval: Duration::from_millis(5),
        max_samples: Some(1),
        max_consecutive_failures: 1,
    };
    let (_handle, shutdown) = shutdown_channel();
    let summary = PollingLoop::new(config, vec![Arc::new(sensor)])
        .run(shutdown)
        .await
        .unwrap();
    assert_eq!(summary.samples, 1);
}

#[tokio::test]
async fn test_shipped_config_starts_on_sim() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/sensorbus.toml");
    let config = AppConfig::load_from(path).unwrap();
    config.validate().unwrap();

    let session = Session::start(config).await.unwrap();
    assert_eq!(session.sensors().len(), 4);
    assert_eq!(session.switches().len(), 1);
    assert_eq!(session.counters().len(), 1);
}
