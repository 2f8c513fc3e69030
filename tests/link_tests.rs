mod common;

use std::time::Duration;

use common::{FakeDevice, Reply};
use pullscale::{CommandCode, DriverError, FrameError, Sample};

#[test]
fn handshake_returns_second_reply() {
    let dev = FakeDevice::new();
    dev.push_lines(&[b"BOOT\r\n", b"READY\n"]);
    let mut link = dev.link();

    let hs = link.handshake().unwrap();
    assert!(hs.ok);
    assert_eq!(hs.message, "READY");

    assert_eq!(dev.written(), vec![vec![0u8], vec![0u8]]);
    let st = dev.state();
    assert_eq!(st.reopens, 1);
    assert!(st.clears >= 1);
    assert_eq!(
        st.timeout_history,
        vec![Duration::from_secs(2), Duration::from_secs(1)]
    );
    assert_eq!(st.timeout, Duration::from_secs(1));
}

#[test]
fn handshake_with_custom_code() {
    let dev = FakeDevice::new();
    dev.push_lines(&[b"a\n", b"b\n"]);
    let mut link = dev.link();

    let hs = link
        .handshake_with(Duration::ZERO, CommandCode::ValueRequest)
        .unwrap();
    assert_eq!(hs.message, "b");
    assert_eq!(dev.written(), vec![vec![1u8], vec![1u8]]);
}

#[test]
fn empty_handshake_reply_is_not_ok() {
    let dev = FakeDevice::new();
    dev.push_lines(&[b"\n", b"\r\n"]);
    let hs = dev.link().handshake().unwrap();
    assert!(!hs.ok);
    assert_eq!(hs.message, "");
}

#[test]
fn silent_device_times_out_and_restores_timeout() {
    let dev = FakeDevice::new();
    dev.push_line(b"READY\n").push(Reply::Timeout);
    let mut link = dev.link();

    let err = link.handshake().unwrap_err();
    assert!(matches!(err, DriverError::HandshakeTimeout(t) if t == Duration::from_secs(2)));
    assert_eq!(dev.state().timeout, Duration::from_secs(1));
    assert_eq!(link.read_timeout(), Duration::from_secs(1));
}

#[test]
fn unterminated_reply_counts_as_timeout() {
    let dev = FakeDevice::new();
    dev.push_line(b"REA");
    let err = dev.link().handshake().unwrap_err();
    assert!(matches!(err, DriverError::HandshakeTimeout(_)));
}

#[test]
fn tare_sends_code_five() {
    let dev = FakeDevice::new();
    let mut link = dev.link();
    assert!(!link.tare_applied());

    link.tare().unwrap();
    assert!(link.tare_applied());
    assert_eq!(dev.written(), vec![vec![5u8]]);
    assert_eq!(dev.state().reopens, 1);
}

#[test]
fn request_value_reads_one_frame() {
    let dev = FakeDevice::new();
    dev.push_line(b"250,1.5\n");
    let mut link = dev.link();

    assert_eq!(link.request_value().unwrap(), Some(Sample::new(250, 1.5)));
    assert_eq!(dev.written(), vec![vec![1u8]]);
}

#[test]
fn request_value_without_answer_is_none() {
    let dev = FakeDevice::new();
    dev.push(Reply::Timeout);
    assert_eq!(dev.link().request_value().unwrap(), None);
}

#[test]
fn request_value_surfaces_garbage() {
    let dev = FakeDevice::new();
    dev.push_line(b"garbage\n");
    let err = dev.link().request_value().unwrap_err();
    assert!(matches!(err, DriverError::Frame(FrameError::Malformed(_))));
}
