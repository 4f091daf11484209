use std::{sync::Arc, time::Duration};

use cradle_led::{
    mock::{MockScanRadio, RadioCall},
    AlwaysGranted, DiscoveredPeripheral, PeripheralScanner, ScanConfig, ScanState,
};
use tokio::{sync::broadcast::error::TryRecvError, time::Instant};
use tokio_test::assert_ok;

const LIGHT_A: &str = "C4:7C:8D:6A:12:F0";
const LIGHT_B: &str = "C4:7C:8D:6A:12:F1";

fn setup() -> (PeripheralScanner<MockScanRadio>, MockScanRadio) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (radio, events) = MockScanRadio::new();
    let scanner = PeripheralScanner::new(
        radio.clone(),
        events,
        Arc::new(AlwaysGranted),
        ScanConfig::default(),
    );
    (scanner, radio)
}

fn assert_elapsed(since: Instant, secs: u64) {
    let elapsed = since.elapsed();
    assert!(elapsed >= Duration::from_secs(secs), "{elapsed:?} < {secs}s");
    assert!(elapsed < Duration::from_secs(secs) + Duration::from_millis(100), "{elapsed:?} > {secs}s");
}

fn light(address: &str, rssi: i16) -> DiscoveredPeripheral {
    let mut peripheral = DiscoveredPeripheral::new(address, Some(rssi));
    peripheral.advertisement.local_name = Some("Cradle".to_string());
    peripheral
}

#[tokio::test(start_paused = true)]
async fn test_address_reported_once_per_session() {
    let (scanner, radio) = setup();
    let mut discovered = scanner.discovered();
    assert_ok!(scanner.start_scan(20, 5).await);

    radio.advertise(light(LIGHT_A, -70));
    radio.advertise(light(LIGHT_A, -64));
    radio.advertise(light(LIGHT_B, -80));

    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_A);
    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_B);
    assert!(matches!(discovered.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(scanner.known_peripherals().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duty_cycle_until_stopped() {
    let (scanner, radio) = setup();
    let mut state = scanner.scan_state();

    let started = Instant::now();
    assert_ok!(scanner.start_scan(5, 2).await);
    assert_eq!(scanner.current_state(), ScanState::Start);

    state.wait_for(|s| *s == ScanState::Pause).await.unwrap();
    assert_elapsed(started, 5);

    state.wait_for(|s| *s == ScanState::Start).await.unwrap();
    assert_elapsed(started, 7);

    state.wait_for(|s| *s == ScanState::Pause).await.unwrap();
    assert_elapsed(started, 12);

    state.wait_for(|s| *s == ScanState::Start).await.unwrap();
    assert_eq!(radio.start_count(), 3);

    assert_ok!(scanner.stop_scan().await);
    assert_eq!(scanner.current_state(), ScanState::Stop);
    assert_eq!(radio.calls().last(), Some(&RadioCall::StopScan));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.start_count(), 3);
    assert_eq!(scanner.current_state(), ScanState::Stop);
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_cache() {
    let (scanner, radio) = setup();
    let mut discovered = scanner.discovered();

    assert_ok!(scanner.start_scan(5, 2).await);
    radio.advertise(light(LIGHT_A, -70));
    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_A);

    assert_ok!(scanner.stop_scan().await);
    assert!(!scanner.is_known(LIGHT_A));

    assert_ok!(scanner.start_scan(5, 2).await);
    radio.advertise(light(LIGHT_A, -72));
    let again = discovered.recv().await.unwrap();
    assert_eq!(again.address, LIGHT_A);
    assert_eq!(again.rssi, Some(-72));
}

#[tokio::test(start_paused = true)]
async fn test_advertisement_while_radio_stops_is_not_cached() {
    let (scanner, radio) = setup();
    let mut discovered = scanner.discovered();

    assert_ok!(scanner.start_scan(20, 5).await);
    radio.advertise(light(LIGHT_A, -70));
    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_A);

    // The radio takes a while to stop and delivers one more sighting meanwhile
    radio.advertise_during_next_stop(light(LIGHT_A, -66), Duration::from_millis(50));
    assert_ok!(scanner.stop_scan().await);

    assert_eq!(scanner.current_state(), ScanState::Stop);
    assert!(!scanner.is_known(LIGHT_A));
    assert!(matches!(discovered.try_recv(), Err(TryRecvError::Empty)));

    assert_ok!(scanner.start_scan(20, 5).await);
    radio.advertise(light(LIGHT_A, -72));
    let again = discovered.recv().await.unwrap();
    assert_eq!(again.address, LIGHT_A);
    assert_eq!(again.rssi, Some(-72));
}

#[tokio::test(start_paused = true)]
async fn test_advertisements_during_pause_are_ignored() {
    let (scanner, radio) = setup();
    let mut discovered = scanner.discovered();
    let mut state = scanner.scan_state();

    assert_ok!(scanner.start_scan(1, 5).await);
    state.wait_for(|s| *s == ScanState::Pause).await.unwrap();
    radio.advertise(light(LIGHT_A, -70));

    state.wait_for(|s| *s == ScanState::Start).await.unwrap();
    radio.advertise(light(LIGHT_B, -70));

    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_B);
    assert!(!scanner.is_known(LIGHT_A));
}

#[tokio::test(start_paused = true)]
async fn test_restart_applies_new_windows() {
    let (scanner, _radio) = setup();
    let mut state = scanner.scan_state();

    assert_ok!(scanner.start_scan(20, 5).await);
    let restarted = Instant::now();
    assert_ok!(scanner.start_scan(3, 1).await);

    state.wait_for(|s| *s == ScanState::Pause).await.unwrap();
    assert_elapsed(restarted, 3);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_failure_stops_session() {
    let (scanner, radio) = setup();
    let mut discovered = scanner.discovered();
    let mut state = scanner.scan_state();

    assert_ok!(scanner.start_scan(5, 2).await);
    radio.advertise(light(LIGHT_A, -70));
    assert_eq!(discovered.recv().await.unwrap().address, LIGHT_A);

    radio.fail(2);
    state.wait_for(|s| *s == ScanState::Error(2)).await.unwrap();

    assert!(scanner.known_peripherals().is_empty());
    assert_eq!(radio.calls().last(), Some(&RadioCall::StopScan));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.start_count(), 1);
    assert_eq!(scanner.current_state(), ScanState::Error(2));

    // A new start recovers
    assert_ok!(scanner.start_scan(5, 2).await);
    assert_eq!(scanner.current_state(), ScanState::Start);
}

#[tokio::test(start_paused = true)]
async fn test_refused_resume_reports_error() {
    let (scanner, radio) = setup();
    let mut state = scanner.scan_state();

    assert_ok!(scanner.start_scan(5, 2).await);
    radio.fail_start(true);

    state
        .wait_for(|s| matches!(s, ScanState::Error(_)))
        .await
        .unwrap();
    assert_eq!(scanner.current_state(), ScanState::Error(3));
    assert_eq!(radio.start_count(), 2);
}
