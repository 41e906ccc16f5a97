//! Integration tests for the connection layer
//!
//! These run the full stack (session, reassembler, driver) against a scripted
//! device on the loopback interface, and replay captures from temp files.

use super::live::LiveConnection;
use super::replay::ReplayConnection;
use crate::driver::{DriverState, StopReason};
use crate::test_utils::{DeviceScript, DhavPacketBuilder, FakeDevice, H264_INFO};
use crate::types::{MediaKind, VideoCodec};
use crate::{DmssError, MediaFormat, Phase};
use anyhow::{Context, Result, ensure};
use futures::StreamExt;
use std::io::Write;
use std::time::Duration;
use tracing::info;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_ended(connection: &LiveConnection) -> Result<DriverState> {
    let mut updates = Box::pin(connection.state_updates());
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(state) = updates.next().await {
            if state.is_ended() {
                return Some(state);
            }
        }
        None
    })
    .await?
    .context("state stream ended without a final state")
}

#[tokio::test]
async fn admin_login_and_single_key_packet() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    // Declared size 100 with a one-entry extended header.
    let key = DhavPacketBuilder::video_key(vec![0x42; 100 - 24 - 4 - 8]).extended(vec![H264_INFO]).build();
    ensure!(key.len() == 100);

    let script = DeviceScript::default().session_id(u32::from_le_bytes([0x11, 0x22, 0x33, 0x44])).media(&key, 100);
    let device = FakeDevice::spawn(script).await?;
    let mut connection = LiveConnection::connect(device.config().with_credentials("admin", "admin")).await?;

    ensure!(connection.session_id() == Some(0x4433_2211));
    ensure!(connection.connection_id() == Some("12345"));

    let packet = tokio::time::timeout(TEST_TIMEOUT, connection.next_packet()).await?.context("key packet")?;
    info!("Received {:?} packet of {} bytes", packet.kind, packet.len());
    ensure!(packet.is_keyframe());
    ensure!(packet.len() == 100 - 24 - 4 - 8);
    ensure!(packet.format == MediaFormat::Video(VideoCodec::H264));
    ensure!(packet.offset == 0);

    ensure!(tokio::time::timeout(TEST_TIMEOUT, connection.next_packet()).await?.is_none());
    ensure!(wait_ended(&connection).await? == DriverState::Ended(StopReason::Finished));

    let log = device.finish().await?;
    ensure!(log.login_body == b"admin&&admin");
    Ok(())
}

#[tokio::test]
async fn bad_credentials_fail_connect() -> Result<()> {
    let device = FakeDevice::spawn(DeviceScript::default().reject_login()).await?;
    let err = LiveConnection::connect(device.config().with_credentials("admin", "nope")).await.unwrap_err();
    ensure!(matches!(err, DmssError::Authentication { ref user } if user == "admin"), "got {err:?}");
    ensure!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn device_fault_fails_connect_with_phase() -> Result<()> {
    let device = FakeDevice::spawn(DeviceScript::default().add_object_fault("NotSupported")).await?;
    let err = LiveConnection::connect(device.config()).await.unwrap_err();
    ensure!(err.phase() == Some(Phase::AddObject), "got {err:?}");
    ensure!(err.to_string().contains("NotSupported") || format!("{err:?}").contains("NotSupported"));
    Ok(())
}

#[tokio::test]
async fn interleaved_packets_keep_wire_order() -> Result<()> {
    let mut dhav = Vec::new();
    let mut expected = Vec::new();
    for i in 0..30u16 {
        let (builder, kind) = match i % 3 {
            0 => (DhavPacketBuilder::video_key(vec![i as u8; 90]), MediaKind::VideoKey),
            1 => (DhavPacketBuilder::audio(vec![i as u8; 16]), MediaKind::Audio),
            _ => (DhavPacketBuilder::video_delta(vec![i as u8; 45]), MediaKind::VideoDelta),
        };
        expected.push((kind, dhav.len() as u64));
        dhav.extend(builder.timing(100, i * 33).build());
    }

    let device = FakeDevice::spawn(DeviceScript::default().media(&dhav, 7)).await?;
    let mut connection = LiveConnection::connect(device.config()).await?;

    let received: Vec<_> = tokio::time::timeout(TEST_TIMEOUT, connection.packets().collect::<Vec<_>>()).await?;
    let seen: Vec<_> = received.iter().map(|p| (p.kind, p.offset)).collect();
    ensure!(seen == expected, "packets out of order: {seen:?}");
    ensure!(received.windows(2).all(|w| w[0].pts <= w[1].pts));
    Ok(())
}

#[tokio::test]
async fn dropping_connection_closes_session() -> Result<()> {
    let key = DhavPacketBuilder::video_key(vec![1; 32]).build();
    let device = FakeDevice::spawn(DeviceScript::default().media(&key, 64).hold_stream()).await?;
    let mut connection = LiveConnection::connect(device.config()).await?;
    tokio::time::timeout(TEST_TIMEOUT, connection.next_packet()).await?.context("packet")?;

    drop(connection);

    // The device only finishes once the control channel is closed.
    tokio::time::timeout(TEST_TIMEOUT, device.finish()).await??;
    Ok(())
}

#[tokio::test]
async fn stop_cancels_reader() -> Result<()> {
    let key = DhavPacketBuilder::video_key(vec![1; 32]).build();
    let device = FakeDevice::spawn(DeviceScript::default().media(&key, 64).hold_stream()).await?;
    let mut connection = LiveConnection::connect(device.config()).await?;
    tokio::time::timeout(TEST_TIMEOUT, connection.next_packet()).await?.context("packet")?;

    connection.stop();
    ensure!(wait_ended(&connection).await? == DriverState::Ended(StopReason::Cancelled));
    ensure!(connection.next_packet().await.is_none());
    Ok(())
}

#[tokio::test]
async fn replay_connection_reads_capture() -> Result<()> {
    let mut capture = tempfile::NamedTempFile::new()?;
    for i in 0..10u16 {
        capture.write_all(&DhavPacketBuilder::video_delta(vec![i as u8; 64]).timing(1, i * 40).build())?;
    }
    capture.flush()?;

    let mut connection = ReplayConnection::open(capture.path()).await?;
    ensure!(connection.source() == capture.path().display().to_string());

    let packets: Vec<_> = tokio::time::timeout(TEST_TIMEOUT, connection.packets().collect::<Vec<_>>()).await?;
    ensure!(packets.len() == 10);
    ensure!(packets.iter().enumerate().all(|(i, p)| p.payload[0] == i as u8));
    ensure!(connection.state() == DriverState::Ended(StopReason::Finished));
    Ok(())
}

#[tokio::test]
async fn replay_of_missing_capture_fails() {
    let err = ReplayConnection::open("/nonexistent/capture.dav").await.unwrap_err();
    assert!(matches!(err, DmssError::File { .. }));
}

#[tokio::test(start_paused = true)]
async fn paced_replay_follows_timestamps() -> Result<()> {
    let mut capture = tempfile::NamedTempFile::new()?;
    for i in 0..5u16 {
        capture.write_all(&DhavPacketBuilder::audio(vec![0; 8]).timing(3, i * 100).build())?;
    }
    capture.flush()?;

    let mut connection = ReplayConnection::open(capture.path()).await?;
    let start = tokio::time::Instant::now();
    let mut paced = connection.paced_packets();
    let first = paced.next().await.context("first paced packet")?;
    ensure!(first.pts == Duration::from_secs(3));
    let rest = paced.count().await;

    ensure!(rest == 4);
    ensure!(start.elapsed() >= Duration::from_millis(400));
    Ok(())
}
