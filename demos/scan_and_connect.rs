use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{error, info, warn};
use tymewear::{BtleplugTransport, Result, TymewearDevice, TymewearError, WearableEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🫁 Tyme Wear Scan and Connect Example");
    info!("Scanning for sensors...");

    let transport = Arc::new(BtleplugTransport::new().await?);
    let (device, mut events) = TymewearDevice::new(transport);

    let found = device.scan_for(Duration::from_secs(5)).await?;
    for sensor in &found {
        info!("  {} ({}) {} dBm", sensor.name, sensor.address, sensor.rssi);
    }
    let Some(sensor) = found.first() else {
        error!("❌ No sensor found");
        return Err(TymewearError::DeviceNotFound);
    };

    // Connect to the strongest signal
    if let Err(e) = device.connect(sensor.address).await {
        error!("❌ Failed to connect to {}: {}", sensor.name, e);
        return Err(e);
    }
    info!("✅ Connected to {}", sensor.name);

    let hardware = device.get_info().await?;
    info!("📊 Hardware Info:");
    info!("  Firmware: {}", hardware.firmware_version());
    info!("  Hardware revision: {}", hardware.hw_version);
    info!("  Stretch sensor: {}", hardware.stretch_sensor());
    info!("  Calibrated: {}", hardware.calibrated());
    info!("  IMU present: {}", hardware.imu_present());

    if let Err(e) = device.sync_rtc().await {
        warn!("⚠️ Clock sync failed: {}", e);
    }

    // Stream live telemetry for a while
    info!("▶️ Starting activity...");
    device.start_activity().await?;

    let listen = async {
        while let Some(event) = events.recv().await {
            match event {
                WearableEvent::Telemetry(record) => info!("  {:?}", record),
                WearableEvent::BatteryStatus(status) => info!(
                    "🔋 [{}] charge={} level={:?}",
                    status.elapsed_label(),
                    status.charge,
                    status.battery_percent
                ),
                WearableEvent::BatteryLevel(percent) => info!("🔋 {}%", percent),
                WearableEvent::Disconnected { address } => {
                    warn!("⚠️ Lost {}", address);
                    break;
                }
                _ => {}
            }
        }
    };
    let _ = timeout(Duration::from_secs(30), listen).await;

    info!("⏹️ Stopping activity...");
    if let Err(e) = device.stop_activity().await {
        warn!("⚠️ Failed to stop activity: {}", e);
    }

    if let Some(diagnostics) = device.diagnostics().await {
        info!("📈 Session: {:?}", diagnostics);
    }

    device.disconnect().await?;
    info!("👋 Disconnected");
    Ok(())
}
