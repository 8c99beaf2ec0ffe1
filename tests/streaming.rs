use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use reco_stream::{
    codec::{FrameReader, DEFAULT_MAX_FRAME_LEN},
    reco::{gesture_classes, CONFIDENCE_THRESHOLD},
    stub::{StubCamera, StubDetector},
    CaptureError, ClientError, CodecError, DetectionClient, DetectionFrame, DetectionServer,
    Detector, RawDetection, ServerConfig, ServerError, ServerHandle, SessionState,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.camera.open_backoff = Duration::from_millis(10);
    config
}

/// One "静音" box covering the middle of a 640x480 frame.
fn mute_detector() -> Detector {
    let backend = StubDetector::new(vec![RawDetection {
        class_id: 1,
        confidence: 0.9123,
        xyxy: [256.0, 168.0, 384.0, 312.0],
    }]);
    Detector::new(Box::new(backend), gesture_classes(), CONFIDENCE_THRESHOLD)
}

fn spawn_server(
    camera: StubCamera,
    detector: Detector,
) -> (ServerHandle, JoinHandle<Result<(), ServerError>>) {
    spawn_server_with(test_config(), camera, detector)
}

fn spawn_server_with(
    config: ServerConfig,
    camera: StubCamera,
    detector: Detector,
) -> (ServerHandle, JoinHandle<Result<(), ServerError>>) {
    init_logger();
    let server = DetectionServer::new(&config, Box::new(camera), detector).unwrap();
    let handle = server.handle();
    let join = thread::spawn(move || server.start());
    (handle, join)
}

fn raw_reader(addr: SocketAddr) -> FrameReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    FrameReader::new(stream, DEFAULT_MAX_FRAME_LEN)
}

fn next(reader: &mut FrameReader<TcpStream>) -> DetectionFrame {
    reader.read_frame().unwrap().expect("stream ended early")
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn client_receives_paced_detection_frames() {
    let (handle, server) = spawn_server(StubCamera::new(), mute_detector());
    let addr = handle.local_addr();

    let (tx, rx) = mpsc::channel();
    let client = thread::spawn(move || {
        let client =
            DetectionClient::connect("127.0.0.1", addr.port(), Duration::from_secs(2)).unwrap();
        client.run(|frame| {
            let _ = tx.send((Instant::now(), frame.clone()));
        })
    });

    let mut received = Vec::new();
    for _ in 0..6 {
        received.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    let expected = json!([{"class": "静音", "confidence": 0.9123, "bbox": [0.5, 0.5, 0.2, 0.3]}]);
    for (_, frame) in &received {
        assert_eq!(serde_json::to_value(&frame.detections).unwrap(), expected);
    }
    for pair in received.windows(2) {
        assert!(pair[1].1.frame_id >= pair[0].1.frame_id);
    }

    // five gaps at ~1/30 s each
    let span = received[5].0 - received[0].0;
    assert!(span >= Duration::from_millis(120), "frames came too fast: {span:?}");

    handle.stop();
    let count = client.join().unwrap().unwrap();
    assert!(count >= 6);
    server.join().unwrap().unwrap();
    assert!(!handle.is_running());
}

#[test]
fn detector_failure_sends_empty_detections() {
    let detector = Detector::new(
        Box::new(StubDetector::failing()),
        gesture_classes(),
        CONFIDENCE_THRESHOLD,
    );
    let (handle, server) = spawn_server(StubCamera::new(), detector);

    let mut reader = raw_reader(handle.local_addr());
    let frame = next(&mut reader);
    assert!(frame.detections.is_empty());

    handle.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn camera_read_failure_reopens_once_and_resumes() {
    let camera = StubCamera::new().fail_reads_at(&[3]);
    let stats = camera.stats();
    let (handle, server) = spawn_server(camera, mute_detector());

    let mut reader = raw_reader(handle.local_addr());
    let ids: Vec<u64> = (0..6).map(|_| next(&mut reader).frame_id).collect();
    // the frame position counter restarts after the reopen
    assert_eq!(ids, vec![1, 2, 1, 2, 3, 4]);
    assert_eq!(stats.opens(), 2);
    assert_eq!(stats.releases(), 1);

    // the server and new sessions are unaffected
    assert!(handle.is_running());
    let mut second = raw_reader(handle.local_addr());
    next(&mut second);
    next(&mut reader);

    handle.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn repeated_read_failure_closes_only_that_session() {
    let camera = StubCamera::new().fail_reads_at(&[2, 3]);
    let stats = camera.stats();
    let (handle, server) = spawn_server(camera, mute_detector());

    let mut reader = raw_reader(handle.local_addr());
    assert_eq!(next(&mut reader).frame_id, 1);
    // read 2 fails, reopen succeeds, read 3 fails again: session gives up
    assert_eq!(reader.read_frame().unwrap(), None);
    assert_eq!(stats.opens(), 2);
    assert!(wait_until(Duration::from_secs(2), || handle.active_sessions() == 0));

    assert!(handle.is_running());
    let mut fresh = raw_reader(handle.local_addr());
    assert_eq!(next(&mut fresh).frame_id, 1);

    handle.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn handle_reports_camera_recovery_state() {
    let mut config = test_config();
    config.camera.open_backoff = Duration::from_millis(200);
    // two failed reopen attempts keep the session in recovery for ~400 ms
    let camera = StubCamera::new().fail_reads_at(&[2]).fail_reopens(2);
    let stats = camera.stats();
    let (handle, server) = spawn_server_with(config, camera, mute_detector());

    let mut reader = raw_reader(handle.local_addr());
    assert_eq!(next(&mut reader).frame_id, 1);
    assert!(
        wait_until(Duration::from_secs(2), || {
            handle.session_states() == vec![(1, SessionState::CameraRecovery)]
        }),
        "recovery was not reported: {:?}",
        handle.session_states()
    );

    assert_eq!(next(&mut reader).frame_id, 1);
    assert_eq!(stats.opens(), 4);
    assert_eq!(handle.session_states(), vec![(1, SessionState::Running)]);

    drop(reader);
    assert!(wait_until(Duration::from_secs(5), || {
        handle.session_states().is_empty()
    }));

    handle.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn client_reports_malformed_payload() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sender = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{nope");
        peer.write_all(&bytes).unwrap();
    });

    let client = DetectionClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
    let mut frames = 0;
    let result = client.run(|_| frames += 1);
    sender.join().unwrap();

    assert!(
        matches!(result, Err(ClientError::Decode(CodecError::Json(_)))),
        "unexpected result: {result:?}"
    );
    assert_eq!(frames, 0);
}

#[test]
fn disconnect_terminates_only_that_session() {
    let (handle, server) = spawn_server(StubCamera::new(), mute_detector());
    let addr = handle.local_addr();

    let mut leaving = raw_reader(addr);
    let mut staying = raw_reader(addr);
    next(&mut leaving);
    next(&mut staying);
    assert!(wait_until(Duration::from_secs(2), || handle.active_sessions() == 2));

    drop(leaving);
    assert!(
        wait_until(Duration::from_secs(5), || handle.active_sessions() == 1),
        "session of the closed client did not terminate"
    );

    for _ in 0..3 {
        next(&mut staying);
    }
    let mut newcomer = raw_reader(addr);
    next(&mut newcomer);
    assert!(handle.is_running());

    handle.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn stop_releases_camera_and_ends_streams() {
    let camera = StubCamera::new();
    let stats = camera.stats();
    let (handle, server) = spawn_server(camera, mute_detector());

    let mut reader = raw_reader(handle.local_addr());
    next(&mut reader);

    handle.stop();
    server.join().unwrap().unwrap();
    assert_eq!(stats.releases(), 1);

    // the session notices within a frame or two and closes the socket
    let mut ended = false;
    for _ in 0..10 {
        match reader.read_frame() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                ended = true;
                break;
            }
        }
    }
    assert!(ended);
    assert!(TcpStream::connect_timeout(&handle.local_addr(), Duration::from_millis(500)).is_err());
}

#[test]
fn camera_unavailable_aborts_start() {
    init_logger();
    let camera = StubCamera::new().fail_opens(3);
    let stats = camera.stats();
    let err = DetectionServer::new(&test_config(), Box::new(camera), mute_detector())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ServerError::Camera(CaptureError::Unavailable { attempts: 3, .. })
    ));
    assert_eq!(stats.opens(), 3);
}
