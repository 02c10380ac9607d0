#[allow(dead_code)]
mod common;

use std::time::{Duration, Instant};

use common::{
    client_addr, fake_server, fast_config, peer_data, server_addr, MockBackend, FAKE_SESSION_ID,
};
use wxp::frame::{PacketType, Pdu};

#[test]
fn close_with_acking_peer() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, true);

    let config = fast_config();
    let close_timeout = Duration::from_millis(config.close_timeout_ms);

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), config)
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");
    assert_eq!(session.write(b"hello").unwrap(), 5);

    let start = Instant::now();
    session.close().unwrap();

    assert!(start.elapsed() < close_timeout);
    assert_eq!(session.state(), wxp::SessionState::Destroyed);
    assert_eq!(context.session_count(), 0);

    let rsts = backend.sent_of_type(PacketType::Rst);
    assert_eq!(rsts.len(), 1);
    assert_eq!(rsts[0].seq(), 1);
    assert_eq!(rsts[0].session_id(), FAKE_SESSION_ID);

    // Closing twice is harmless
    session.close().unwrap();
    assert!(session.write(b"late").is_err());
}

#[test]
fn close_with_silent_peer() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, false);

    let config = wxp::Config {
        close_timeout_ms: 300,
        ..fast_config()
    };

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), config)
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");
    session.write(b"unheard").unwrap();

    let start = Instant::now();
    session.close().unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(2000));
    assert_eq!(context.session_count(), 0);

    // Unacknowledged data was retransmitted while waiting
    assert!(backend.sent_of_type(PacketType::Data).len() > 1);
}

#[test]
fn reset_by_peer() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, true);

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), fast_config())
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");

    backend.inject_pdu(&server_addr(), &client_addr(), &peer_data(FAKE_SESSION_ID, 0, b"bye"));
    backend.inject_pdu(&server_addr(), &client_addr(), &Pdu::rst(FAKE_SESSION_ID, 1));

    // Data ahead of the reset is still delivered
    let mut buf = [0; 16];
    assert_eq!(session.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"bye");

    assert!(matches!(session.read(&mut buf), Err(wxp::Error::Closing)));
    assert!(matches!(session.write(b"x"), Err(wxp::Error::Closing)));
    assert_eq!(session.state(), wxp::SessionState::Closing);

    std::thread::sleep(Duration::from_millis(100));

    // Our own reset answers the peer's
    let rsts = backend.sent_of_type(PacketType::Rst);
    assert_eq!(rsts.len(), 1);
    assert_eq!(rsts[0].seq(), 0);

    // Both received PDUs were acknowledged
    let acked: Vec<u16> = backend
        .sent_of_type(PacketType::Ack)
        .iter()
        .flat_map(|pdu| pdu.entries().collect::<Vec<_>>())
        .collect();
    assert!(acked.contains(&0));
    assert!(acked.contains(&1));

    let start = Instant::now();
    session.close().unwrap();
    assert!(start.elapsed() < Duration::from_millis(1000));
}

#[test]
fn retries_exhausted() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, false);

    let config = wxp::Config {
        max_retry: 3,
        repeat_timeout_ms: 20,
        ..fast_config()
    };

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), config)
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");
    session.write(b"doomed").unwrap();

    let mut buf = [0; 16];
    let result = session.read(&mut buf);

    assert!(matches!(
        result,
        Err(wxp::Error::Closed(wxp::CloseReason::AckTimeout))
    ));

    // Original transmission plus three retries
    assert_eq!(backend.sent_of_type(PacketType::Data).len(), 4);

    session.close().unwrap();
    assert_eq!(context.session_count(), 0);
}

#[test]
fn repeat_request_resends_listed_packets() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, false);

    let config = wxp::Config {
        repeat_timeout_ms: 5_000,
        repeat_check_period_ms: 100,
        ..fast_config()
    };

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), config)
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");

    for payload in [&b"zero"[..], b"one", b"two"] {
        session.write(payload).unwrap();
    }

    // Sent once, then resent once by the first sweep; later sweeps wait for the repeat timeout
    std::thread::sleep(Duration::from_millis(400));
    let before = backend.sent_of_type(PacketType::Data).len();
    assert_eq!(before, 6);

    backend.inject_pdu(&server_addr(), &client_addr(), &Pdu::repeat(FAKE_SESSION_ID, &[1]));
    std::thread::sleep(Duration::from_millis(100));

    let data = backend.sent_of_type(PacketType::Data);
    assert_eq!(data.len(), before + 1);
    assert_eq!(data[before].seq(), 1);
    assert_eq!(&data[before].payload[..], b"one");

    // Unknown sequences are ignored
    backend.inject_pdu(&server_addr(), &client_addr(), &Pdu::repeat(FAKE_SESSION_ID, &[40]));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.sent_of_type(PacketType::Data).len(), before + 1);
}

#[test]
fn dropped_session_is_cleared() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, true);

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), fast_config())
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");
    session.write(b"abandoned").unwrap();
    assert_eq!(context.session_count(), 1);

    drop(session);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(context.session_count(), 0);

    // No graceful reset on drop
    assert!(backend.sent_of_type(PacketType::Rst).is_empty());
}

#[test]
fn dropped_context_clears_sessions() {
    common::init_logging();

    let backend = MockBackend::new();
    fake_server(&backend, true);

    let context = wxp::Context::init_with_config(server_addr(), backend.clone(), fast_config())
        .expect("failed to create context");

    let session = context.connect(client_addr()).expect("connect failed");
    assert_eq!(session.state(), wxp::SessionState::Connected);

    drop(context);

    assert_eq!(session.state(), wxp::SessionState::Destroyed);

    let mut buf = [0; 16];
    assert!(matches!(
        session.read(&mut buf),
        Err(wxp::Error::Closed(wxp::CloseReason::StateCleared))
    ));
    assert!(matches!(
        session.write(b"x"),
        Err(wxp::Error::Closed(wxp::CloseReason::StateCleared))
    ));

    session.close().unwrap();
}
