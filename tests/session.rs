mod common;

use futures::StreamExt;
use tokio::time::{Duration, Instant};

use afterburner_link::device::constants::WRITE_DEADLINE;
use afterburner_link::device::types::{
    Channel, ConnectionState, Frame, Mode, SettingsPatch, TransportKind,
};
use afterburner_link::error::{DeviceError, ErrorKind};
use common::{legacy_packet_link, link, test_config};

const STATUS: &str = r#"{"type":"status","thr":0.42,"mode":1}"#;

#[tokio::test(start_paused = true)]
async fn connect_reaches_ready_and_subscribes_once_per_channel() {
    let (link, mock) = legacy_packet_link();

    assert_eq!(link.current_state(), ConnectionState::Idle);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    assert_eq!(link.current_state(), ConnectionState::Ready);
    assert_eq!(mock.subscriptions(), vec![Channel::Status, Channel::CalibrationStatus]);

    // a second connect while ready does not start another attempt
    assert_eq!(link.connect().await, ConnectionState::Ready);
    assert_eq!(mock.connects(), 1);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn scan_timeout_fails_with_not_found() {
    let (link, mock) = link(TransportKind::Socket);
    mock.set_discoverable(false);

    let started = Instant::now();
    assert_eq!(link.connect().await, ConnectionState::Failed(ErrorKind::NotFound));
    assert!(started.elapsed() >= test_config().scan_timeout);
    assert_eq!(mock.connects(), 0);

    // a failed session can be retried
    mock.set_discoverable(true);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn transport_rejection_fails_the_attempt() {
    let (link, mock) = link(TransportKind::Socket);
    mock.fail_next_connects(1);

    assert_eq!(link.connect().await, ConnectionState::Failed(ErrorKind::TransportRejected));
    assert!(!mock.is_linked());
}

#[tokio::test(start_paused = true)]
async fn status_reaches_every_subscriber() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);

    let mut first = link.telemetry().status_updates();
    let mut second = link.telemetry().status_updates();
    assert!(mock.push_text(STATUS));

    for updates in [&mut first, &mut second] {
        let status = updates.next().await.unwrap();
        assert!((status.throttle - 0.42).abs() < 1e-6);
        assert_eq!(status.mode, Mode::Ease);
    }

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_keep_the_previous_status() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    let mut updates = link.telemetry().status_updates();

    assert!(mock.push_text(STATUS));
    assert!(updates.next().await.is_some());

    assert!(mock.push_text(r#"{"type":"status","thr":"#));
    assert!(mock.push_text(r#"{"type":"status","thr":0.9,"mode":7}"#));
    assert!(mock.push_text(r#"{"type":"status","thr":0.1,"mode":2}"#));

    // the two broken frames are dropped without affecting the session
    let status = updates.next().await.unwrap();
    assert_eq!(status.mode, Mode::Pulse);
    assert_eq!(link.current_state(), ConnectionState::Ready);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_link_reconnects_and_subscribers_keep_receiving() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);

    let mut updates = link.telemetry().status_updates();
    let mut states = link.watch_state();
    states.borrow_and_update();

    mock.drop_link();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Reconnecting);

    let ready = states.wait_for(|state| *state == ConnectionState::Ready).await.unwrap();
    drop(ready);
    assert_eq!(mock.connects(), 2);
    assert_eq!(mock.subscriptions(), vec![Channel::Status, Channel::CalibrationStatus, Channel::Status, Channel::CalibrationStatus]);

    assert!(mock.push_text(STATUS));
    assert!(updates.next().await.is_some());

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_in_failed() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);

    let mut states = link.watch_state();
    mock.set_discoverable(false);
    mock.drop_link();

    let failed = *states.wait_for(|state| matches!(state, ConnectionState::Failed(_))).await.unwrap();
    assert_eq!(failed, ConnectionState::Failed(ErrorKind::NotFound));
    assert_eq!(mock.connects(), 1);
    assert!(matches!(
        link.send_partial(&SettingsPatch { brightness: Some(30), ..Default::default() }).await,
        Err(DeviceError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_with_timeout_and_releases_the_link() {
    let (link, mock) = link(TransportKind::Socket);
    mock.hang_connects();

    let started = Instant::now();
    assert_eq!(link.connect().await, ConnectionState::Failed(ErrorKind::Timeout));
    assert!(started.elapsed() >= test_config().connect_timeout);
    assert!(started.elapsed() < test_config().scan_timeout + test_config().connect_timeout + Duration::from_secs(1));

    // the half-open link was handed back to the transport
    assert_eq!(mock.connects(), 1);
    assert!(mock.disconnects() >= 1);
    assert!(!mock.is_linked());
}

#[tokio::test(start_paused = true)]
async fn stalled_writes_time_out_and_trigger_a_health_check() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    let patch = SettingsPatch { brightness: Some(30), ..Default::default() };

    // a healthy device that stops reading only fails the write
    mock.stall_sends();
    let started = Instant::now();
    let err = link.send_partial(&patch).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(WRITE_DEADLINE));
    assert_eq!(link.current_state(), ConnectionState::Ready);

    // a device that is gone is caught by the check that follows the failed write
    let mut states = link.watch_state();
    states.borrow_and_update();
    mock.kill_silently();
    let started = Instant::now();
    let err = link.send_partial(&patch).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Reconnecting);
    assert!(started.elapsed() < test_config().health_check_interval);
    states.wait_for(|state| *state == ConnectionState::Ready).await.unwrap();
    assert_eq!(mock.connects(), 2);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let (link, mock) = link(TransportKind::Socket);

    link.disconnect().await;
    assert_eq!(link.current_state(), ConnectionState::Idle);

    assert_eq!(link.connect().await, ConnectionState::Ready);
    link.disconnect().await;
    link.disconnect().await;
    assert_eq!(link.current_state(), ConnectionState::Idle);
    assert!(!mock.is_linked());
    assert!(link.telemetry().latest_status().is_none());
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_scan() {
    let (link, mock) = link(TransportKind::Socket);
    mock.set_discoverable(false);

    let connecting = {
        let link = link.clone();
        tokio::spawn(async move { link.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(link.current_state(), ConnectionState::Scanning);

    link.disconnect().await;
    assert_eq!(connecting.await.unwrap(), ConnectionState::Idle);
    assert_eq!(link.current_state(), ConnectionState::Idle);

    // nothing fires after the scan deadline would have passed
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(link.current_state(), ConnectionState::Idle);
    assert_eq!(mock.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn sending_while_idle_is_not_connected() {
    let (link, mock) = link(TransportKind::Socket);

    let patch = SettingsPatch { speed_ms: Some(400), ..Default::default() };
    let result = link.send_partial(&patch).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::NotConnected);
    // the cache still took the edit
    assert_eq!(link.read_cached().speed_ms, 400);
    assert!(mock.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn healthy_link_survives_health_checks() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);

    tokio::time::sleep(test_config().health_check_interval * 3).await;
    assert_eq!(link.current_state(), ConnectionState::Ready);
    assert!(mock.push(Frame::Text("pong".to_string())));
    assert_eq!(mock.connects(), 1);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn silent_disconnect_is_caught_by_the_health_check() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    let mut states = link.watch_state();
    states.borrow_and_update();

    mock.kill_silently();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Reconnecting);
    states.wait_for(|state| *state == ConnectionState::Ready).await.unwrap();
    assert_eq!(mock.connects(), 2);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_pings_count_as_a_lost_link() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    let mut states = link.watch_state();
    states.borrow_and_update();
    let interval = test_config().health_check_interval;

    mock.ignore_pings();
    let started = Instant::now();

    // the first ping goes out unanswered; only the next check notices
    tokio::time::sleep(interval + Duration::from_secs(1)).await;
    assert_eq!(link.current_state(), ConnectionState::Ready);

    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Reconnecting);
    assert!(started.elapsed() >= interval * 2);
    states.wait_for(|state| *state == ConnectionState::Ready).await.unwrap();
    assert_eq!(mock.connects(), 2);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn any_inbound_frame_answers_a_ping() {
    let (link, mock) = link(TransportKind::Socket);
    assert_eq!(link.connect().await, ConnectionState::Ready);
    let interval = test_config().health_check_interval;

    // status traffic alone keeps the link alive
    mock.ignore_pings();
    for _ in 0..4 {
        tokio::time::sleep(interval / 2).await;
        assert!(mock.push_text(STATUS));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(link.current_state(), ConnectionState::Ready);
    assert_eq!(mock.connects(), 1);

    link.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn packet_connect_reads_back_settings_and_calibration() {
    let (link, mock) = legacy_packet_link();
    mock.set_read(Channel::Brightness, vec![9]);
    mock.set_read(Channel::SpeedMs, 700u16.to_le_bytes().to_vec());
    mock.set_read(Channel::CalibrationStatus, vec![1, 0x84, 0x03, 0xD0, 0x07]);

    assert_eq!(link.connect().await, ConnectionState::Ready);

    let settings = link.read_cached();
    assert_eq!(settings.brightness, 10);
    assert_eq!(settings.speed_ms, 700);
    assert_eq!(settings.mode, Mode::Ease);

    let calibration = link.telemetry().latest_calibration().unwrap();
    assert!(calibration.is_calibrated);
    assert_eq!((calibration.min, calibration.max), (900, 2000));

    mock.set_read(Channel::CalibrationStatus, vec![0, 0x84, 0x03, 0xD0, 0x07, 2, 1]);
    let calibration = link.read_calibration().await.unwrap();
    assert!(!calibration.is_calibrated);
    assert_eq!((calibration.min_visits, calibration.max_visits), (2, 1));

    link.disconnect().await;
}
