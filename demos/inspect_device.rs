//! Example: Connect to a device and print its GATT table
//!
//! Run with: cargo run --example inspect_device <address>
//!
//! Readable characteristics are read once, and the first characteristic that
//! supports notifications is subscribed to for a few seconds.

use blelink::utils::printable_text;
use blelink::{to_hex_string, BleConfig, BleService, Error, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blelink=debug".parse().unwrap()),
        )
        .init();

    let Some(address) = std::env::args().nth(1) else {
        eprintln!("Usage: inspect_device <address>");
        return Ok(());
    };

    let service = BleService::with_native(BleConfig::default()).await?;

    // The backend only knows peripherals it has seen advertising
    service.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("Connecting to {}...", address);
    service.connect(&address).await?;

    for gatt_service in service.services() {
        println!("\n{} ({})", gatt_service.name, gatt_service.uuid);

        for characteristic in &gatt_service.characteristics {
            let properties: Vec<_> = characteristic.properties.iter().map(|p| p.name()).collect();
            println!(
                "  {} ({}) [{}]",
                characteristic.name,
                characteristic.uuid,
                properties.join(", ")
            );

            if characteristic.is_readable {
                match service.read_characteristic(characteristic.uuid).await {
                    Ok(value) => match printable_text(&value) {
                        Some(text) => println!("    value: \"{}\"", text),
                        None => println!("    value: {}", to_hex_string(&value)),
                    },
                    Err(e) => println!("    read failed: {}", e),
                }
            }

            for descriptor in &characteristic.descriptors {
                println!("    {} ({})", descriptor.name, descriptor.uuid);
            }
        }
    }

    let notifiable = service
        .services()
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.supports_push())
        .map(|c| c.uuid);

    if let Some(uuid) = notifiable {
        println!("\nSubscribing to {}...", uuid);
        let mut notifications = service.subscribe_notifications();

        match service.enable_notifications(uuid).await {
            Ok(()) => {
                let listen = async {
                    while let Ok(event) = notifications.recv().await {
                        println!(
                            "  {}: {}",
                            event.characteristic_uuid,
                            to_hex_string(&event.value)
                        );
                    }
                };
                let _ = tokio::time::timeout(Duration::from_secs(10), listen).await;
            }
            Err(Error::NotifyRegistrationFailed { uuid }) => {
                println!("Could not register for notifications on {}", uuid)
            }
            Err(e) => println!("Enabling notifications failed: {}", e),
        }
    }

    service.shutdown().await?;
    Ok(())
}
