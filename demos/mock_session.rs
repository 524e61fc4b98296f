use std::{io, sync::Arc};
use tracing::info;
use tymewear::{
    mock::{control_response, opcode_of, tag_of},
    protocol::SUCCESS_CODE,
    MockTransport, Opcode, Result, TymewearDevice, WearableEvent, CONTROL_CHAR_UUID,
    DATA_STREAM_CHAR_UUID, DOWNLOAD_CHAR_UUID,
};

const SENSOR: tymewear::DeviceAddress = tymewear::DeviceAddress(0x00C4_7F51_0A1B_2C3D);

/// Answer the commands a real sensor would, with one stored recording
fn simulated_sensor(characteristic: uuid::Uuid, data: &[u8]) -> Vec<(uuid::Uuid, Vec<u8>)> {
    let (Some(opcode), Some(tag)) = (opcode_of(data), tag_of(data)) else {
        return Vec::new();
    };
    if characteristic != CONTROL_CHAR_UUID {
        return Vec::new();
    }

    let payload = match Opcode::from_u16(opcode) {
        Some(Opcode::GetInfo) => {
            let mut info = vec![0x12, 0x00, 3, 40, 0, 100, 0, 0b0101_0111];
            info.extend_from_slice(&[0; 14]);
            info
        }
        Some(Opcode::ListFiles) => [1_700_000_000u32, 0, 48]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        _ => Vec::new(),
    };
    let mut replies = vec![(CONTROL_CHAR_UUID, control_response(SUCCESS_CODE, tag, &payload))];

    if opcode == Opcode::DataDump.code() {
        // One breathing record split across two notifications, then a heart rate record
        let mut breathing = vec![0x01];
        breathing.extend_from_slice(&1u32.to_le_bytes());
        for value in [152u16, 150, 610, 600, 9_300, 9_000] {
            breathing.extend_from_slice(&value.to_le_bytes());
        }
        let (head, tail) = breathing.split_at(9);
        replies.push((DOWNLOAD_CHAR_UUID, head.to_vec()));
        let mut rest = tail.to_vec();
        rest.push(0x05);
        rest.extend_from_slice(&1_700_000_005u32.to_le_bytes());
        rest.extend_from_slice(&72u16.to_le_bytes());
        replies.push((DOWNLOAD_CHAR_UUID, rest));
    }
    replies
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 Tyme Wear Mock Session Example");

    let mock = Arc::new(MockTransport::tymewear());
    mock.set_responder(Arc::new(simulated_sensor));
    let (device, mut events) = TymewearDevice::new(mock.clone());

    device.connect(SENSOR).await?;
    info!("✅ Connected to {}", SENSOR.display_name());

    let hardware = device.get_info().await?;
    info!("📊 Firmware {} (IMU every {} ms)", hardware.firmware_version(), hardware.imu_period_ms);

    // Live telemetry arrives on the data stream
    let mut heart_rate = vec![0x05];
    heart_rate.extend_from_slice(&42u32.to_le_bytes());
    heart_rate.extend_from_slice(&65u16.to_le_bytes());
    mock.notify(DATA_STREAM_CHAR_UUID, &heart_rate);

    // So do unsolicited battery pushes, on the control characteristic
    mock.notify(CONTROL_CHAR_UUID, &control_response(0x4002, 0, &3_950u32.to_le_bytes()));

    for entry in device.list_files().await? {
        info!("⬇️ Downloading {}", entry);
        let summary = device.download_file(&entry, io::stdout()).await?;
        info!("✅ {} record(s), {} bytes", summary.records(), summary.bytes_received);
    }

    device.disconnect().await?;

    while let Ok(event) = events.try_recv() {
        info!("📨 {:?}", event);
        if let WearableEvent::Disconnected { .. } = event {
            break;
        }
    }
    Ok(())
}
