//! End-to-end scenarios driving the server over real TCP sockets, mirroring
//! the concrete scenarios enumerated in the specification's testable
//! properties section.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn spawn_app() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(speed_daemon::serve(listener));
    addr
}

fn encode_plate(plate: &str, timestamp: u32) -> Vec<u8> {
    let mut out = vec![0x20, plate.len() as u8];
    out.extend_from_slice(plate.as_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out
}

fn encode_want_heartbeat(interval: u32) -> Vec<u8> {
    let mut out = vec![0x40];
    out.extend_from_slice(&interval.to_be_bytes());
    out
}

fn encode_i_am_camera(road: u16, mile: u16, limit: u16) -> Vec<u8> {
    let mut out = vec![0x80];
    out.extend_from_slice(&road.to_be_bytes());
    out.extend_from_slice(&mile.to_be_bytes());
    out.extend_from_slice(&limit.to_be_bytes());
    out
}

fn encode_i_am_dispatcher(roads: &[u16]) -> Vec<u8> {
    let mut out = vec![0x81, roads.len() as u8];
    for road in roads {
        out.extend_from_slice(&road.to_be_bytes());
    }
    out
}

/// One decoded server->client frame, just enough to assert on in tests.
#[derive(Debug)]
enum Frame {
    Error(String),
    Ticket {
        plate: String,
        road: u16,
        mile1: u16,
        t1: u32,
        mile2: u16,
        t2: u32,
        speed: u16,
    },
    Heartbeat,
}

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let tag = stream.read_u8().await.unwrap();
    match tag {
        0x10 => Frame::Error(read_str8(stream).await),
        0x21 => {
            let plate = read_str8(stream).await;
            let road = stream.read_u16().await.unwrap();
            let mile1 = stream.read_u16().await.unwrap();
            let t1 = stream.read_u32().await.unwrap();
            let mile2 = stream.read_u16().await.unwrap();
            let t2 = stream.read_u32().await.unwrap();
            let speed = stream.read_u16().await.unwrap();
            Frame::Ticket {
                plate,
                road,
                mile1,
                t1,
                mile2,
                t2,
                speed,
            }
        }
        0x41 => Frame::Heartbeat,
        other => panic!("unexpected tag {other:#04x}"),
    }
}

async fn read_str8(stream: &mut TcpStream) -> String {
    let len = stream.read_u8().await.unwrap();
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn sample_ticket() {
    let addr = spawn_app().await;

    let mut camera_a = TcpStream::connect(addr).await.unwrap();
    camera_a
        .write_all(&encode_i_am_camera(123, 8, 60))
        .await
        .unwrap();
    camera_a.write_all(&encode_plate("UN1X", 0)).await.unwrap();

    let mut camera_b = TcpStream::connect(addr).await.unwrap();
    camera_b
        .write_all(&encode_i_am_camera(123, 9, 60))
        .await
        .unwrap();
    camera_b
        .write_all(&encode_plate("UN1X", 45))
        .await
        .unwrap();

    let mut dispatcher = TcpStream::connect(addr).await.unwrap();
    dispatcher
        .write_all(&encode_i_am_dispatcher(&[123]))
        .await
        .unwrap();

    let frame = timeout(TIMEOUT, read_frame(&mut dispatcher))
        .await
        .expect("dispatcher should receive a ticket");
    match frame {
        Frame::Ticket {
            plate,
            road,
            mile1,
            t1,
            mile2,
            t2,
            speed,
        } => {
            assert_eq!(plate, "UN1X");
            assert_eq!(road, 123);
            assert_eq!(mile1, 8);
            assert_eq!(t1, 0);
            assert_eq!(mile2, 9);
            assert_eq!(t2, 45);
            assert_eq!(speed, 8000);
        }
        other => panic!("expected a ticket, got {other:?}"),
    }
}

#[tokio::test]
async fn below_threshold_produces_no_ticket() {
    let addr = spawn_app().await;

    let mut camera_a = TcpStream::connect(addr).await.unwrap();
    camera_a
        .write_all(&encode_i_am_camera(123, 8, 85))
        .await
        .unwrap();
    camera_a.write_all(&encode_plate("UN1X", 0)).await.unwrap();

    let mut camera_b = TcpStream::connect(addr).await.unwrap();
    camera_b
        .write_all(&encode_i_am_camera(123, 9, 85))
        .await
        .unwrap();
    camera_b
        .write_all(&encode_plate("UN1X", 45))
        .await
        .unwrap();

    let mut dispatcher = TcpStream::connect(addr).await.unwrap();
    dispatcher
        .write_all(&encode_i_am_dispatcher(&[123]))
        .await
        .unwrap();

    let result = timeout(Duration::from_millis(500), read_frame(&mut dispatcher)).await;
    assert!(result.is_err(), "no ticket should have been produced");
}

#[tokio::test]
async fn double_identity_closes_the_connection() {
    let addr = spawn_app().await;

    let mut camera = TcpStream::connect(addr).await.unwrap();
    camera
        .write_all(&encode_i_am_camera(1, 1, 60))
        .await
        .unwrap();
    camera
        .write_all(&encode_i_am_camera(2, 2, 60))
        .await
        .unwrap();

    let frame = timeout(TIMEOUT, read_frame(&mut camera)).await.unwrap();
    assert!(matches!(frame, Frame::Error(_)));

    let mut buf = [0u8; 1];
    let n = timeout(TIMEOUT, camera.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "socket should be at EOF after the error");
}

#[tokio::test]
async fn heartbeat_cadence() {
    let addr = spawn_app().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&encode_want_heartbeat(10)) // 1.0s
        .await
        .unwrap();

    let deadline = Duration::from_millis(3_500);
    let mut count = 0;
    let _ = timeout(deadline, async {
        loop {
            match read_frame(&mut client).await {
                Frame::Heartbeat => count += 1,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await;

    assert!(count >= 3, "expected at least 3 heartbeats, got {count}");
}

#[tokio::test]
async fn queued_ticket_delivered_once_a_dispatcher_registers() {
    let addr = spawn_app().await;

    let mut camera_a = TcpStream::connect(addr).await.unwrap();
    camera_a
        .write_all(&encode_i_am_camera(42, 0, 60))
        .await
        .unwrap();
    camera_a
        .write_all(&encode_plate("QUEUE1", 0))
        .await
        .unwrap();

    let mut camera_b = TcpStream::connect(addr).await.unwrap();
    camera_b
        .write_all(&encode_i_am_camera(42, 100, 60))
        .await
        .unwrap();
    camera_b
        .write_all(&encode_plate("QUEUE1", 3600))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut dispatcher = TcpStream::connect(addr).await.unwrap();
    dispatcher
        .write_all(&encode_i_am_dispatcher(&[42]))
        .await
        .unwrap();

    let frame = timeout(TIMEOUT, read_frame(&mut dispatcher))
        .await
        .expect("queued ticket should be delivered once a dispatcher registers");
    assert!(matches!(frame, Frame::Ticket { road: 42, .. }));
}

#[tokio::test]
async fn ledger_suppresses_a_second_ticket_same_day() {
    let addr = spawn_app().await;

    let mut dispatcher = TcpStream::connect(addr).await.unwrap();
    dispatcher
        .write_all(&encode_i_am_dispatcher(&[10, 20]))
        .await
        .unwrap();

    // First offending pair, road 10.
    let mut camera_a = TcpStream::connect(addr).await.unwrap();
    camera_a
        .write_all(&encode_i_am_camera(10, 0, 60))
        .await
        .unwrap();
    camera_a.write_all(&encode_plate("ABC", 0)).await.unwrap();
    let mut camera_b = TcpStream::connect(addr).await.unwrap();
    camera_b
        .write_all(&encode_i_am_camera(10, 100, 60))
        .await
        .unwrap();
    camera_b
        .write_all(&encode_plate("ABC", 3600))
        .await
        .unwrap();

    let first = timeout(TIMEOUT, read_frame(&mut dispatcher)).await.unwrap();
    assert!(matches!(first, Frame::Ticket { road: 10, .. }));

    // Second independently-offending pair, same plate, same calendar day, road 20.
    let mut camera_c = TcpStream::connect(addr).await.unwrap();
    camera_c
        .write_all(&encode_i_am_camera(20, 0, 60))
        .await
        .unwrap();
    camera_c
        .write_all(&encode_plate("ABC", 7200))
        .await
        .unwrap();
    let mut camera_d = TcpStream::connect(addr).await.unwrap();
    camera_d
        .write_all(&encode_i_am_camera(20, 100, 60))
        .await
        .unwrap();
    camera_d
        .write_all(&encode_plate("ABC", 10_800))
        .await
        .unwrap();

    let second = timeout(Duration::from_millis(500), read_frame(&mut dispatcher)).await;
    assert!(
        second.is_err(),
        "a second ticket for the same plate/day must be suppressed"
    );
}

#[tokio::test]
async fn invalid_plate_closes_the_connection_with_an_error() {
    let addr = spawn_app().await;

    let mut camera = TcpStream::connect(addr).await.unwrap();
    camera
        .write_all(&encode_i_am_camera(1, 1, 60))
        .await
        .unwrap();
    camera.write_all(&encode_plate("ab!", 0)).await.unwrap();

    let frame = timeout(TIMEOUT, read_frame(&mut camera)).await.unwrap();
    match frame {
        Frame::Error(msg) => assert!(msg.contains("ab!")),
        other => panic!("expected an error frame, got {other:?}"),
    }
}
