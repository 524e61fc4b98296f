use std::{env, fs::File, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tymewear::{BtleplugTransport, Result, TymewearDevice, TymewearError};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let out_dir = env::args().nth(1).map_or_else(|| PathBuf::from("."), PathBuf::from);
    info!("💾 Tyme Wear Download Example");
    info!("Recordings will be saved to {}", out_dir.display());

    let transport = Arc::new(BtleplugTransport::new().await?);
    let (device, _events) = TymewearDevice::new(transport);

    let found = device.scan_for(Duration::from_secs(5)).await?;
    let Some(sensor) = found.first() else {
        error!("❌ No sensor found");
        return Err(TymewearError::DeviceNotFound);
    };
    device.connect(sensor.address).await?;
    info!("✅ Connected to {}", sensor.name);

    let files = device.list_files().await?;
    if files.is_empty() {
        info!("No recordings stored on the sensor");
    }
    for entry in &files {
        let path = out_dir.join(entry.file_name());
        info!("⬇️ {} -> {}", entry, path.display());

        // Give up on a single file after two minutes
        let out = File::create(&path)?;
        let cancel = tokio::time::sleep(Duration::from_secs(120));
        match device.download_file_cancellable(entry, out, cancel).await {
            Ok(summary) => info!(
                "✅ {} records ({} breathing, {} IMU, {} heart rate), {} desync(s)",
                summary.records(),
                summary.breathing,
                summary.imu,
                summary.heart_rate,
                summary.desyncs
            ),
            Err(TymewearError::Cancelled) => {
                warn!("⚠️ Download of {} timed out", entry);
                return Err(TymewearError::Cancelled);
            }
            Err(e) => {
                error!("❌ Download of {} failed: {}", entry, e);
                return Err(e);
            }
        }
    }

    device.disconnect().await?;
    info!("👋 Done");
    Ok(())
}
