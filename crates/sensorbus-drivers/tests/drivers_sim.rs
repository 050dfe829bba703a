//! Drivers built through the registry on the simulated platform.

use std::sync::Arc;
use std::time::Duration;

use sensorbus_core::connection::Direction;
use sensorbus_core::{ConnectionString, Edge, ErrorKind, Reading};
use sensorbus_drivers::{DriverRegistry, SensorComponents, SensorSpec};
use sensorbus_hal::{Board, Resource, SimPlatform};

fn sim_board() -> (SimPlatform, Board) {
    let sim = SimPlatform::new();
    let board = Board::new(Arc::new(sim.clone()));
    (sim, board)
}

fn spec(id: &str, driver: &str, conn: &str, options: &str) -> SensorSpec {
    SensorSpec::new(id, driver, ConnectionString::parse(conn).unwrap())
        .with_options(toml::from_str(options).unwrap())
}

async fn build(board: &Board, spec: SensorSpec) -> SensorComponents {
    DriverRegistry::with_defaults().build(board, spec).await.unwrap()
}

#[tokio::test]
async fn test_digital_input_reads_level() {
    let (sim, board) = sim_board();
    let button = build(&board, spec("button", "digital_input", "g:17:pullup", "")).await;

    assert_eq!(sim.direction(17), Some(Direction::In));
    assert_eq!(button.sensor.read().await.unwrap(), Reading::Digital { level: false });
    sim.set_level(17, true);
    assert_eq!(button.sensor.read().await.unwrap(), Reading::Digital { level: true });
    assert!(button.switch.is_none());
}

#[tokio::test]
async fn test_digital_input_active_low_option() {
    let (sim, board) = sim_board();
    let button = build(&board, spec("button", "digital_input", "g:5", "active_low = true")).await;
    sim.set_level(5, false);
    assert_eq!(button.sensor.read().await.unwrap(), Reading::Digital { level: true });
}

#[tokio::test]
async fn test_digital_output_switches() {
    let (sim, board) = sim_board();
    let relay = build(&board, spec("relay", "digital_output", "g:27", "initial = true")).await;
    assert!(sim.level(27));

    let switch = relay.switch.clone().unwrap();
    switch.turn_off().await.unwrap();
    assert!(!sim.level(27));
    assert!(switch.toggle().await.unwrap());
    assert!(sim.level(27));
    assert_eq!(relay.sensor.read().await.unwrap(), Reading::Digital { level: true });
}

#[tokio::test]
async fn test_analog_scaling() {
    let (sim, board) = sim_board();
    sim.set_analog(0, 1023);
    let temp = build(
        &board,
        spec("temp", "analog", "a:0", "aref = 3.3\nscale = 100.0\noffset = -50.0\nunit = \"C\""),
    )
    .await;

    match temp.sensor.read().await.unwrap() {
        Reading::Scalar { value, unit } => {
            assert!((value - (3.3 * 100.0 - 50.0)).abs() < 1e-9);
            assert_eq!(unit, "C");
        }
        other => panic!("unexpected reading {:?}", other),
    }
}

#[tokio::test]
async fn test_analog_transient_fault_surfaces() {
    let (sim, board) = sim_board();
    sim.set_analog(2, 10);
    let pot = build(&board, spec("pot", "analog", "a:2", "")).await;
    sim.fail_next(Resource::Analog(2), ErrorKind::TransientIo);
    assert!(pot.sensor.read().await.unwrap_err().is_transient());
    assert!(pot.sensor.read().await.is_ok());
}

#[tokio::test]
async fn test_pulse_counter_counts_edges() {
    let (sim, board) = sim_board();
    let flow = build(&board, spec("flow", "pulse_counter", "g:22", "")).await;
    assert_eq!(sim.watched_edge(22), Some(Edge::Rising));

    sim.pulse(22, 5);
    let line = flow.interrupts.as_ref().unwrap().line();
    assert!(line.wait_idle(Duration::from_secs(2)));

    let counter = flow.counter.clone().unwrap();
    assert_eq!(counter.count(), 5);
    assert_eq!(flow.sensor.read().await.unwrap(), Reading::Count { count: 5 });
    assert_eq!(counter.reset(), 5);
    assert_eq!(counter.count(), 0);
    assert_eq!(line.stats().dispatched, 5);
}

#[tokio::test]
async fn test_pulse_counter_per_unit() {
    let (sim, board) = sim_board();
    let flow = build(
        &board,
        spec("flow", "pulse_counter", "g:23:both", "per_unit = 4.0\nunit = \"L\""),
    )
    .await;

    sim.pulse(23, 3);
    assert!(flow.interrupts.as_ref().unwrap().line().wait_idle(Duration::from_secs(2)));
    assert_eq!(flow.sensor.read().await.unwrap(), Reading::scalar(1.5, "L"));
}

#[tokio::test]
async fn test_dropping_pulse_counter_releases_pin() {
    let (sim, board) = sim_board();
    let flow = build(&board, spec("flow", "pulse_counter", "g:24", "")).await;
    assert!(board.is_claimed(&Resource::Gpio(24)));
    drop(flow);
    assert!(!board.is_claimed(&Resource::Gpio(24)));
    assert_eq!(sim.watched_edge(24), None);
}

#[tokio::test]
async fn test_register_over_i2c() {
    let (sim, board) = sim_board();
    // 25 °C on a TMP102-style sensor
    sim.set_i2c_register(1, 0x48, 0x00, 0x19);
    sim.set_i2c_register(1, 0x48, 0x01, 0x00);
    let temp = build(
        &board,
        spec(
            "board_temp",
            "register",
            "i:1:0x48",
            "register = 0\nwidth = 2\nbig_endian = true\nshift = 4\nsigned_bits = 12\nscale = 0.0625\nunit = \"C\"",
        ),
    )
    .await;
    assert_eq!(temp.sensor.read().await.unwrap(), Reading::scalar(25.0, "C"));
}

#[tokio::test]
async fn test_register_address_from_options() {
    let (sim, board) = sim_board();
    sim.set_i2c_register(0, 0x39, 0x0C, 42);
    let lux = build(&board, spec("lux", "register", "i:0", "register = 0x0C\naddress = 0x39")).await;
    assert_eq!(lux.sensor.read().await.unwrap(), Reading::scalar(42.0, ""));
}

#[tokio::test]
async fn test_register_over_spi() {
    let (sim, board) = sim_board();
    sim.queue_spi_response(0, 1, vec![0x00, 0x10, 0x02]);
    let accel = build(
        &board,
        spec("accel_x", "register", "s:0:1:3", "register = 0x32\nwidth = 2\nread_flag = 0x80"),
    )
    .await;
    assert_eq!(accel.sensor.read().await.unwrap(), Reading::scalar(f64::from(0x0210u16), ""));
    assert_eq!(sim.spi_sent(0, 1), vec![vec![0xB2, 0x00, 0x00]]);
}

#[tokio::test]
async fn test_uart_lines_with_checksum() {
    let (sim, board) = sim_board();
    let gps = build(
        &board,
        spec("gps", "uart_lines", "u:1:9600", "timeout_ms = 50\nnmea_checksum = true\nprefix = \"$GP\""),
    )
    .await;

    sim.push_uart_rx(
        "/dev/ttyS1",
        b"boot ok\r\n$GPTXT,01,01,02,ANTSTATUS=OK*3b\r\n$GPGGA,1*00\r\n",
    );
    assert_eq!(
        gps.sensor.read().await.unwrap(),
        Reading::Text {
            line: "$GPTXT,01,01,02,ANTSTATUS=OK*3b".to_string()
        }
    );
    // Bad checksum
    assert!(gps.sensor.read().await.unwrap_err().is_transient());
    // Nothing left: timeout
    assert!(gps.sensor.read().await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_build_rejects_claimed_pin() {
    let (_sim, board) = sim_board();
    let _first = build(&board, spec("a", "digital_input", "g:9", "")).await;
    let err = DriverRegistry::with_defaults()
        .build(&board, spec("b", "digital_output", "g:9", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_wrong_connection_is_configuration_error() {
    let (_sim, board) = sim_board();
    let err = DriverRegistry::with_defaults()
        .build(&board, spec("pot", "analog", "g:1", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("AIO"));
}
