use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info};
use cradle_led::{ble, ClientConfig, ConnectionState, CradleError, Result, ScanConfig};

const SCAN_TIMEOUT_MS: u64 = 30_000;
const READY_TIMEOUT_MS: u64 = 15_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💡 Cradle LED Scan and Control Example");
    let adapter = ble::first_adapter().await?;

    // Find the first light advertising the Cradle service
    info!("🔍 Scanning for Cradle lights...");
    let scanner = ble::scanner(adapter.clone(), ScanConfig::default());
    let mut discovered = scanner.discovered();
    scanner.start_scan_default().await?;

    let light = timeout(Duration::from_millis(SCAN_TIMEOUT_MS), discovered.recv())
        .await
        .map_err(|_| CradleError::Timeout {
            timeout_ms: SCAN_TIMEOUT_MS,
        })?
        .map_err(|e| CradleError::Transport(e.to_string()))?;
    scanner.stop_scan().await?;

    info!(
        "✅ Found {} ({}) RSSI {:?}",
        light.advertisement.local_name.as_deref().unwrap_or("unnamed"),
        light.address,
        light.rssi
    );

    // Connect; hydration reads start on their own once the link is ready
    let client = ble::client(adapter, ClientConfig::default()).await?;
    client.connect(&light.address).await?;

    let mut state = client.connection_state();
    let reached = timeout(
        Duration::from_millis(READY_TIMEOUT_MS),
        state.wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Disconnected)),
    )
    .await
    .map_err(|_| CradleError::Timeout {
        timeout_ms: READY_TIMEOUT_MS,
    })?
    .map_err(|_| CradleError::LinkLost)
    .map(|state| *state)?;

    if reached != ConnectionState::Ready {
        error!("❌ Link dropped before services were discovered");
        return Err(CradleError::LinkLost);
    }
    info!("✅ Connected and ready");

    // Give hydration time to read every characteristic
    sleep(Duration::from_secs(4)).await;
    let snapshot = client.snapshot().await;
    info!("📊 Current Settings:");
    if let Some(status) = snapshot.led_switch {
        info!("  LED: {}", if status.on { "ON" } else { "OFF" });
    }
    if let Some(color) = snapshot.led_color {
        info!("  Color: {}", color);
    }
    if let Some(brightness) = snapshot.led_brightness {
        info!("  Brightness: {}", brightness.0);
    }
    if let Some(pir) = snapshot.pir_switch {
        info!("  PIR: {} (min brightness {})", pir.on, pir.min_brightness);
    }
    if let Some(time) = snapshot.current_time {
        info!("  Clock: {}", time);
    }
    if let Some(timer) = snapshot.timer_schedule {
        info!(
            "  Timer: {} on {:02}:{:02} off {:02}:{:02}",
            timer.enabled, timer.on_hour, timer.on_minute, timer.off_hour, timer.off_minute
        );
    }

    info!("🎨 Switching to warm white at 60%...");
    client.set_led_status(true).await?;
    client.set_led_color(255, 180, 100).await?;
    client.set_led_brightness_percent(60).await?;

    info!("🕒 Syncing clock and setting a 07:00-23:00 timer...");
    client.sync_current_time().await?;
    client.set_timer_schedule(true, 7, 0, 23, 0).await?;

    // Let the queued writes drain
    while client.pending_operations().await > 0 {
        sleep(Duration::from_millis(100)).await;
    }

    client.disconnect().await?;
    info!("👋 Disconnected");

    Ok(())
}
