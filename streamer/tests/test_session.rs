//! Integration tests for the streaming session against a loopback receiver.

mod support;

use raop_common::alac::{decode_uncompressed, FRAMES_PER_PACKET};
use raop_common::gain::db_to_linear;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamer::{
    cleanup_stale_lock, CancellationToken, PcmSource, SessionConfig, SessionError, SessionState,
    StreamingSession,
};
use support::{FakeReceiver, Mode, Received};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Stereo source where every sample is `value`.
fn constant_source(seconds: f64, value: i16) -> PcmSource {
    // ---
    let frames = (seconds * 44_100.0) as usize;
    PcmSource::new(vec![value; frames * 2], 2, 44_100)
}

fn session_for(receiver: &FakeReceiver, config: SessionConfig, gain_db: f32) -> StreamingSession {
    // ---
    StreamingSession::with_config(LOCALHOST, receiver.rtsp_addr.port(), gain_db, config)
}

fn first_sample(received: &Received) -> i16 {
    // ---
    decode_uncompressed(&received.packet.payload, 2).expect("payload should be an ALAC frame")[0]
}

/// Average spacing between consecutive arrivals, in seconds.
fn mean_interval(packets: &[Received]) -> f64 {
    // ---
    let span = packets[packets.len() - 1].at - packets[0].at;
    span.as_secs_f64() / (packets.len() - 1) as f64
}

/// Scenario: start toward a receiver, play, stop.
#[tokio::test]
async fn test_start_play_stop_releases_everything() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let config = receiver.config(dir.path());
    let lock_path = config.lock_path.clone().unwrap();
    let session = session_for(&receiver, config, 0.0);

    session
        .start(constant_source(10.0, 500), CancellationToken::new())
        .await
        .expect("start should succeed");
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(session.resources().clock_open);
    assert!(session.resources().transport_open);
    assert!(lock_path.exists());

    session.send_play_command().await.expect("play should succeed");
    assert_eq!(receiver.dacp_hits(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    session.stop().await;

    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().any());
    assert!(!lock_path.exists());
    assert!(session.last_error().is_none());

    assert_eq!(
        receiver.methods(),
        vec!["OPTIONS", "ANNOUNCE", "SETUP", "RECORD", "TEARDOWN"]
    );

    let audio = receiver.audio();
    assert!(audio.len() > 10, "only {} packets arrived", audio.len());
    assert!(audio[0].packet.marker);
    assert!(audio[1..].iter().all(|r| !r.packet.marker));
    assert!(receiver.sync_packets() >= 1);

    // Sequence and timestamp advance by one packet each time
    for pair in audio.windows(2) {
        assert_eq!(pair[1].packet.sequence, pair[0].packet.sequence.wrapping_add(1));
        assert_eq!(
            pair[1].packet.timestamp,
            pair[0].packet.timestamp.wrapping_add(FRAMES_PER_PACKET as u32)
        );
    }

    // Stopping again is harmless
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stop_cancels_connecting_start() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Silent).await;
    let config = SessionConfig {
        negotiation_timeout_ms: 30_000,
        ..receiver.config(dir.path())
    };
    let lock_path = config.lock_path.clone().unwrap();
    let session = Arc::new(session_for(&receiver, config, 0.0));

    let starter = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .start(constant_source(5.0, 0), CancellationToken::new())
                .await
        })
    };

    assert!(
        session
            .wait_for_state(SessionState::Connecting, Duration::from_secs(2))
            .await
    );
    assert!(session.resources().clock_open);

    tokio::time::timeout(Duration::from_secs(2), session.stop())
        .await
        .expect("stop should not wait for the negotiation timeout");

    let result = starter.await.unwrap();
    assert_eq!(result, Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().any());
    assert!(!lock_path.exists());
}

#[tokio::test]
async fn test_caller_token_cancels_connecting_start() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Silent).await;
    let config = SessionConfig {
        negotiation_timeout_ms: 30_000,
        ..receiver.config(dir.path())
    };
    let session = session_for(&receiver, config, 0.0);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        session.start(constant_source(5.0, 0), cancel),
    )
    .await
    .expect("cancellation should end the start promptly");

    assert_eq!(result, Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().any());
    assert_eq!(session.last_error(), Some(SessionError::Cancelled));
}

#[tokio::test]
async fn test_silent_receiver_times_out() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Silent).await;
    let config = SessionConfig {
        negotiation_timeout_ms: 300,
        ..receiver.config(dir.path())
    };
    let session = session_for(&receiver, config, 0.0);

    let result = session
        .start(constant_source(1.0, 0), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(SessionError::Timeout(_))));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().any());
}

#[tokio::test]
async fn test_rejecting_receiver() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Reject(403)).await;
    let session = session_for(&receiver, receiver.config(dir.path()), 0.0);

    let result = session
        .start(constant_source(1.0, 0), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(SessionError::ReceiverRejected(_))));
    assert_eq!(receiver.methods(), vec!["OPTIONS"]);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().any());
}

#[tokio::test]
async fn test_unreachable_receiver_is_connection_failed() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = SessionConfig {
        lock_path: Some(dir.path().join("raop-streamer.lock")),
        inhibit_sleep: false,
        ..Default::default()
    };
    let session = StreamingSession::with_config(LOCALHOST, port, 0.0, config);

    let result = session
        .start(constant_source(1.0, 0), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
    assert!(!session.resources().any());
}

#[tokio::test]
async fn test_gain_change_scales_amplitude_not_cadence() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let session = session_for(&receiver, receiver.config(dir.path()), 0.0);

    session
        .start(constant_source(5.0, 1000), CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    // +6.0206 dB doubles the amplitude
    session.update_replay_gain(20.0 * 2f32.log10());
    tokio::time::sleep(Duration::from_millis(600)).await;
    session.stop().await;

    let audio = receiver.audio();
    let switch = audio
        .iter()
        .position(|r| first_sample(r) > 1500)
        .expect("gain change never reached the wire");
    let (before, after) = audio.split_at(switch);
    assert!(before.len() > 20 && after.len() > 20);

    assert!(before.iter().all(|r| first_sample(r) == 1000));
    assert!(after.iter().all(|r| (1990..=2010).contains(&first_sample(r))));

    let expected = FRAMES_PER_PACKET as f64 / 44_100.0;
    for (label, part) in [("before", before), ("after", after)] {
        let mean = mean_interval(part);
        assert!(
            (mean - expected).abs() < 0.0015,
            "{} the change packets were {:.5}s apart, expected {:.5}s",
            label,
            mean,
            expected
        );
    }
}

#[tokio::test]
async fn test_end_of_track_tears_down_on_its_own() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let session = session_for(&receiver, receiver.config(dir.path()), 0.0);

    // 8820 frames: 25 full packets and one of 20 frames
    session
        .start(constant_source(0.2, 100), CancellationToken::new())
        .await
        .unwrap();

    assert!(
        session
            .wait_for_state(SessionState::Idle, Duration::from_secs(3))
            .await
    );
    assert!(!session.resources().any());
    assert!(session.last_error().is_none());
    assert_eq!(session.packets_sent(), 26);
    assert_eq!(receiver.count("TEARDOWN"), 1);

    let audio = receiver.audio();
    let last = decode_uncompressed(&audio[audio.len() - 1].packet.payload, 2).unwrap();
    assert_eq!(last.len(), 20 * 2);
}

/// Scenario: the audio channel breaks once streaming has begun.
#[tokio::test]
async fn test_send_failure_interrupts_and_releases_everything() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::DeadAudioPort).await;
    let config = receiver.config(dir.path());
    let lock_path = config.lock_path.clone().unwrap();
    let session = session_for(&receiver, config, 0.0);

    session
        .start(constant_source(5.0, 100), CancellationToken::new())
        .await
        .expect("negotiation itself succeeds");

    assert!(
        session
            .wait_for_state(SessionState::Idle, Duration::from_secs(3))
            .await
    );
    assert!(matches!(
        session.last_error(),
        Some(SessionError::StreamInterrupted(_))
    ));
    assert!(!session.resources().any());
    assert!(!lock_path.exists());
    assert_eq!(session.packets_sent(), 0);
    assert_eq!(receiver.count("TEARDOWN"), 1);

    // Stopping afterwards is harmless and keeps the reason
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(matches!(
        session.last_error(),
        Some(SessionError::StreamInterrupted(_))
    ));
}

#[tokio::test]
async fn test_capture_dir_records_what_was_sent() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let captures = dir.path().join("captures");
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let config = SessionConfig {
        capture_dir: Some(captures.clone()),
        ..receiver.config(dir.path())
    };
    let session = session_for(&receiver, config, -6.0);

    // 8820 frames
    session
        .start(constant_source(0.2, 1000), CancellationToken::new())
        .await
        .unwrap();
    assert!(
        session
            .wait_for_state(SessionState::Idle, Duration::from_secs(3))
            .await
    );
    assert!(!session.is_capturing());

    let files: Vec<PathBuf> = fs::read_dir(&captures)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);

    let mut reader = hound::WavReader::open(&files[0]).unwrap();
    let spec = reader.spec();
    assert_eq!((spec.channels, spec.sample_rate, spec.bits_per_sample), (2, 44_100, 16));

    // Post-gain samples, identical to what went over the wire
    let expected = (1000.0 * db_to_linear(-6.0)).round() as i16;
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 8820 * 2);
    assert!(samples.iter().all(|&s| s == expected));
    assert_eq!(first_sample(&receiver.audio()[0]), expected);
}

#[tokio::test]
async fn test_unusable_capture_dir_does_not_block_streaming() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("captures");
    fs::write(&blocker, b"a file, not a directory").unwrap();

    let receiver = FakeReceiver::start(Mode::Normal).await;
    let config = SessionConfig {
        capture_dir: Some(blocker),
        ..receiver.config(dir.path())
    };
    let session = session_for(&receiver, config, 0.0);

    session
        .start(constant_source(0.1, 100), CancellationToken::new())
        .await
        .expect("capture problems never fail a start");
    assert!(
        session
            .wait_for_state(SessionState::Idle, Duration::from_secs(3))
            .await
    );
    assert!(session.last_error().is_none());
    assert!(session.packets_sent() > 0);
}

#[tokio::test]
async fn test_restart_replaces_active_stream() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let session = session_for(&receiver, receiver.config(dir.path()), 0.0);

    session
        .start(constant_source(5.0, 0), CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Same lock path: only succeeds if the first stream released it
    session
        .start(constant_source(5.0, 0), CancellationToken::new())
        .await
        .expect("restart should succeed");
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(receiver.count("TEARDOWN"), 1);
    assert_eq!(receiver.count("RECORD"), 2);

    session.stop().await;
    assert_eq!(receiver.count("TEARDOWN"), 2);
}

#[tokio::test]
async fn test_second_session_sees_busy_clock() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let first = session_for(&receiver, receiver.config(dir.path()), 0.0);
    let second = session_for(&receiver, receiver.config(dir.path()), 0.0);

    first
        .start(constant_source(5.0, 0), CancellationToken::new())
        .await
        .unwrap();

    let result = second
        .start(constant_source(5.0, 0), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SessionError::ResourceBusy(_))));
    assert_eq!(second.state(), SessionState::Idle);
    assert_eq!(first.state(), SessionState::Streaming);

    first.stop().await;
}

#[tokio::test]
async fn test_stale_lock_cleanup_unblocks_start() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let config = receiver.config(dir.path());
    let lock_path = config.lock_path.clone().unwrap();
    std::fs::write(&lock_path, "99999\n").unwrap();

    let session = session_for(&receiver, config, 0.0);
    let result = session
        .start(constant_source(1.0, 0), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SessionError::ResourceBusy(_))));

    assert!(cleanup_stale_lock(&lock_path).unwrap());
    assert!(!cleanup_stale_lock(&lock_path).unwrap());

    session
        .start(constant_source(1.0, 0), CancellationToken::new())
        .await
        .unwrap();
    session.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_sleep_lease_held_only_while_streaming() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let config = SessionConfig {
        inhibit_sleep: true,
        sleep_command: Some(vec!["sleep".into(), "30".into()]),
        ..receiver.config(dir.path())
    };
    let session = session_for(&receiver, config, 0.0);

    session
        .start(constant_source(5.0, 0), CancellationToken::new())
        .await
        .unwrap();
    assert!(session.resources().sleep_lease_held);

    session.stop().await;
    assert!(!session.resources().sleep_lease_held);
}

#[tokio::test]
async fn test_play_command_needs_a_stream() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let receiver = FakeReceiver::start(Mode::Normal).await;
    let session = session_for(&receiver, receiver.config(dir.path()), 0.0);

    assert_eq!(
        session.send_play_command().await,
        Err(SessionError::NotConnected)
    );
    assert_eq!(receiver.dacp_hits(), 0);
}

/// Scenario address from a typical home network; construction does no I/O.
#[test]
fn test_session_for_lan_receiver() {
    // ---
    let session = StreamingSession::try_new("192.168.1.50", "7000", 0.0).unwrap();
    assert_eq!(session.target().to_string(), "192.168.1.50:7000");
    assert_eq!(session.state(), SessionState::Idle);
}

/// Needs a real receiver at 192.168.1.50:7000.
#[tokio::test]
#[ignore]
async fn test_real_receiver_scenario() {
    // ---
    let session = StreamingSession::try_new("192.168.1.50", "7000", 0.0).unwrap();
    session
        .start(constant_source(3.0, 0), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    let _ = session.send_play_command().await;
    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.resources().clock_open);
}
