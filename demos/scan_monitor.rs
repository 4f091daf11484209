use tracing::{info, warn};
use cradle_led::{ble, Result, ScanConfig, ScanState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📡 Cradle LED Scan Monitor");
    info!("Press Ctrl+C to stop");

    let adapter = ble::first_adapter().await?;
    let scanner = ble::scanner(adapter, ScanConfig::default());
    let mut discovered = scanner.discovered();
    let mut state = scanner.scan_state();

    scanner.start_scan(10, 5).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping scan");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ScanState::Start => info!("▶️  Scanning"),
                    ScanState::Pause => info!("⏸️  Resting"),
                    ScanState::Error(code) => {
                        warn!("❌ Scan failed with code {}, stopping", code);
                        break;
                    }
                    other => info!("Scan state: {}", other),
                }
            }
            peripheral = discovered.recv() => match peripheral {
                Ok(peripheral) => info!(
                    "💡 {} {} RSSI {:?}",
                    peripheral.address,
                    peripheral.advertisement.local_name.as_deref().unwrap_or("unnamed"),
                    peripheral.rssi
                ),
                Err(e) => warn!("Missed discoveries: {}", e),
            },
        }
    }

    info!("Seen {} light(s) this session", scanner.known_peripherals().len());
    scanner.stop_scan().await?;
    Ok(())
}
