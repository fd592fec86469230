//! Basic example: Scan for nearby BLE devices
//!
//! Run with: cargo run --example scan_devices [seconds]

use blelink::{BleConfig, BleService, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blelink=info".parse().unwrap()),
        )
        .init();

    let seconds = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let service = BleService::with_native(BleConfig::default()).await?;
    let mut results = service.watch_scan_results();
    let mut failures = service.subscribe_scan_failures();

    println!("Scanning for {} seconds...\n", seconds);
    service.start_scan().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = results.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = results.borrow_and_update().len();
                print!("\r{} devices found", count);
            }
            Ok(failure) = failures.recv() => {
                eprintln!("\nScan failed with code {}", failure.code);
                break;
            }
        }
    }

    service.stop_scan().await?;

    println!("\n");
    println!("{:<20} {:>6}  {:<24} Manufacturer", "Address", "RSSI", "Name");
    println!("{}", "-".repeat(72));

    let mut devices = service.scan_results();
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    for device in &devices {
        println!(
            "{:<20} {:>6}  {:<24} {}",
            device.address, device.rssi, device.display_name, device.manufacturer
        );
    }

    service.shutdown().await?;
    Ok(())
}
