mod common;

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use scslink_core::protocol::{
    Address, Command, ProtocolError, ResponseCode, SessionConfig, SessionState, Transport,
};

use common::*;

fn addr(value: u32) -> Address {
    Address::new(value).unwrap()
}

#[test]
fn test_wake_up_acked_on_fifth_enquire() {
    let meter = FakeMeter {
        enquire_ack_after: 4,
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        wake_poll_ms: 10,
        ..SessionConfig::default()
    };
    let (transport, mut session) = setup(meter, config);

    let started = Instant::now();
    assert_eq!(session.wake_up().unwrap(), ResponseCode::Ack);

    // Settle time applies after the ACK
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(sent(&transport), vec![vec![ENQ]; 5]);
    assert_eq!(session.state(), SessionState::Woken);
}

#[test]
fn test_wake_up_gives_up_after_all_attempts() {
    let meter = FakeMeter {
        silent: true,
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        wake_attempts: 6,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    assert_eq!(session.wake_up().unwrap(), ResponseCode::NoResponse);
    assert_eq!(sent(&transport).len(), 6);
    assert_eq!(session.state(), SessionState::AwaitingWake);
}

#[test]
fn test_identify_populates_identity() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());

    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);

    let mut expected = vec![b'I'];
    expected.extend_from_slice(&[0u8; 11]);
    expected.extend_from_slice(&[0x41, 0x64]);
    assert_eq!(sent(&transport), vec![expected]);

    assert!(session.is_identified());
    assert_eq!(session.device_type(), "ABC");
    assert_eq!(session.device_id(), "12345678");
    assert_eq!(session.meter_start_address(), addr(0x001000));
    assert_eq!(session.meter_stop_address(), addr(0x002000));
    assert_eq!(session.state(), SessionState::Identified);
}

#[test]
fn test_accessors_empty_before_identify() {
    let meter = FakeMeter {
        silent: true,
        ..FakeMeter::default()
    };
    let (_transport, mut session) = setup(meter, fast_config());

    assert!(session.identify().is_err());
    assert!(!session.is_identified());
    assert_eq!(session.device_id(), "");
    assert_eq!(session.device_type(), "");
    assert_eq!(session.meter_start_address(), Address::ZERO);
    assert_eq!(session.meter_stop_address(), Address::ZERO);
}

#[test]
fn test_security_sends_padded_code() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());

    assert_eq!(session.security("SECRET").unwrap(), ResponseCode::Ack);

    let mut expected = b"SSECRET\0\0".to_vec();
    expected.extend_from_slice(&[0x3B, 0xDD]);
    assert_eq!(sent(&transport), vec![expected]);
    assert_eq!(session.state(), SessionState::LoggedIn);
    assert!(session.keep_alive_active());

    session.logout();
    assert!(!session.keep_alive_active());
}

#[test]
fn test_security_rejected_with_can_is_not_retried() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());

    assert_eq!(session.security("WRONG").unwrap(), ResponseCode::Can);
    assert_eq!(sent(&transport).len(), 1);
    assert!(!session.keep_alive_active());
    assert_ne!(session.state(), SessionState::LoggedIn);
}

#[test]
fn test_silence_exhausts_retries_then_times_out() {
    let meter = FakeMeter {
        silent: true,
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_retries: 3,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    match session.identify() {
        Err(ProtocolError::Timeout { command, attempts }) => {
            assert_eq!(command, Command::Identify);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(sent(&transport).len(), 3);
    assert_eq!(session.stats().timeouts, 3);
    assert_eq!(session.state(), SessionState::AwaitingWake);
}

#[test]
fn test_nak_triggers_resync_before_retry() {
    let meter = FakeMeter {
        nak_next: 1,
        ..FakeMeter::default()
    };
    let (transport, mut session) = setup(meter, fast_config());

    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
    assert_eq!(
        transport.lock().unwrap().command_bytes(),
        vec![b'I', ENQ, b'I']
    );
    assert_eq!(session.stats().naks, 1);
}

#[test]
fn test_persistent_nak_returns_last_code() {
    let meter = FakeMeter {
        nak_next: 10,
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_retries: 2,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    assert_eq!(session.identify().unwrap(), ResponseCode::Nak);
    // No resync after the final attempt
    assert_eq!(
        transport.lock().unwrap().command_bytes(),
        vec![b'I', ENQ, b'I']
    );
    assert!(!session.is_identified());
}

#[test]
fn test_crc_mismatch_is_retried() {
    let meter = FakeMeter {
        corrupt_next_crc: 1,
        ..FakeMeter::default()
    };
    let (transport, mut session) = setup(meter, fast_config());

    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
    assert_eq!(transport.lock().unwrap().command_bytes(), vec![b'I', b'I']);
    assert_eq!(session.stats().crc_failures, 1);
    assert_eq!(session.device_id(), "12345678");
}

#[test]
fn test_crc_mismatch_on_every_attempt_is_no_response() {
    let meter = FakeMeter {
        corrupt_next_crc: 10,
        ..FakeMeter::default()
    };
    let (_transport, mut session) = setup(meter, fast_config());

    assert_eq!(session.identify().unwrap(), ResponseCode::NoResponse);
    assert!(!session.is_identified());
}

#[test]
fn test_upload_single_frame() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());

    let mut buf = [0u8; 16];
    assert_eq!(session.upload(addr(0x1000), &mut buf).unwrap(), ResponseCode::Ack);

    let frames = sent(&transport);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..7], &[b'U', 0x00, 0x10, 0x00, 0x00, 0x10, 0x0F]);

    let guard = transport.lock().unwrap();
    assert_eq!(&buf[..], &guard.meter.memory[0x1000..0x1010]);
}

#[test]
fn test_upload_splits_into_contiguous_chunks() {
    let config = SessionConfig {
        max_upload_size: 20,
        ..fast_config()
    };
    let (transport, mut session) = setup(FakeMeter::default(), config);

    // 17 data bytes per chunk: 17 + 17 + 16
    let mut buf = vec![0u8; 50];
    assert_eq!(session.upload(addr(0x100), &mut buf).unwrap(), ResponseCode::Ack);

    let ranges: Vec<(u32, u32)> = sent(&transport)
        .iter()
        .map(|f| {
            assert_eq!(f[0], b'U');
            (Address::extract(f, 1).value(), Address::extract(f, 4).value())
        })
        .collect();
    assert_eq!(ranges, vec![(0x100, 0x110), (0x111, 0x121), (0x122, 0x131)]);

    let guard = transport.lock().unwrap();
    assert_eq!(&buf[..], &guard.meter.memory[0x100..0x132]);
}

#[test]
fn test_upload_rejects_bad_ranges() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());

    let mut empty: [u8; 0] = [];
    assert!(matches!(
        session.upload(addr(0x100), &mut empty),
        Err(ProtocolError::EmptyTransfer)
    ));

    let mut buf = [0u8; 8];
    assert!(matches!(
        session.upload(addr(0xFF_FFFC), &mut buf),
        Err(ProtocolError::AddressOutOfRange(_))
    ));
    assert!(sent(&transport).is_empty());
}

#[test]
fn test_download_writes_memory_in_chunks() {
    let config = SessionConfig {
        max_download_size: 10,
        ..fast_config()
    };
    let (transport, mut session) = setup(FakeMeter::default(), config);

    // 8 data bytes per chunk: 8 + 8 + 4
    let data: Vec<u8> = (0..20).map(|i| 0xA0 + i as u8).collect();
    assert_eq!(session.download(addr(0x2000), &data).unwrap(), ResponseCode::Ack);

    let frames = sent(&transport);
    assert_eq!(frames.len(), 6);
    assert_eq!(&frames[0][..7], &[b'D', 0x00, 0x20, 0x00, 0x00, 0x20, 0x07]);
    assert_eq!(frames[1].len(), 8 + 2);
    assert_eq!(&frames[1][..8], &data[..8]);
    assert_eq!(Address::extract(&frames[4], 1).value(), 0x2010);
    assert_eq!(frames[5].len(), 4 + 2);

    let guard = transport.lock().unwrap();
    assert_eq!(&guard.meter.memory[0x2000..0x2014], &data[..]);
}

#[test]
fn test_download_cancelled_aborts_without_data() {
    let meter = FakeMeter {
        cancel_downloads: true,
        ..FakeMeter::default()
    };
    let (transport, mut session) = setup(meter, fast_config());
    let before = transport.lock().unwrap().meter.memory[0x3000..0x3004].to_vec();

    assert_eq!(
        session.download(addr(0x3000), &[1, 2, 3, 4]).unwrap(),
        ResponseCode::Can
    );
    assert_eq!(transport.lock().unwrap().command_bytes(), vec![b'D']);
    assert_eq!(&transport.lock().unwrap().meter.memory[0x3000..0x3004], &before[..]);
}

#[test]
fn test_download_data_phase_gets_one_attempt() {
    let meter = FakeMeter {
        silent_data_phase: true,
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_retries: 3,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    match session.download(addr(0x3000), &[9, 9, 9, 9]) {
        Err(ProtocolError::Timeout { command, attempts }) => {
            assert_eq!(command, Command::DownloadData);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    let frames = sent(&transport);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0][0], b'D');
    assert_eq!(&frames[1][..4], &[9, 9, 9, 9]);
}

#[test]
fn test_closed_transport() {
    let (transport, mut session) = setup(FakeMeter::default(), fast_config());
    transport.lock().unwrap().close().unwrap();

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.identify(), Err(ProtocolError::NotOpen)));
    assert!(sent(&transport).is_empty());
}

#[test]
fn test_full_session_flow() {
    let meter = FakeMeter {
        enquire_ack_after: 2,
        ..FakeMeter::default()
    };
    let (transport, mut session) = setup(meter, fast_config());

    assert_eq!(session.wake_up().unwrap(), ResponseCode::Ack);
    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
    assert_eq!(session.security("SECRET").unwrap(), ResponseCode::Ack);
    assert_eq!(session.state(), SessionState::LoggedIn);

    let start = session.meter_start_address();
    session.download(start, b"hello").unwrap();
    let mut back = [0u8; 5];
    session.upload(start, &mut back).unwrap();
    assert_eq!(&back, b"hello");

    let stats = session.stats();
    assert_eq!(stats.naks, 0);
    assert_eq!(stats.frames_sent, transport.lock().unwrap().sent.len() as u64);
}

#[test]
fn test_session_logs_inside_injected_span() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (_transport, session) = setup(FakeMeter::default(), fast_config());
    let mut session = session.with_span(tracing::info_span!("meter", port = "mock0"));

    assert_eq!(session.wake_up().unwrap(), ResponseCode::Ack);
    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
}

#[test]
fn test_noise_before_response_code_is_skipped() {
    let meter = FakeMeter {
        noise_prefix: vec![0x41, 0x00, 0xFF],
        ..FakeMeter::default()
    };
    let (transport, mut session) = setup(meter, fast_config());

    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
    assert_eq!(session.device_id(), "12345678");
    assert_eq!(session.security("SECRET").unwrap(), ResponseCode::Ack);
    assert_eq!(transport.lock().unwrap().command_bytes(), vec![b'I', b'S']);
}

#[test]
fn test_garbage_only_replies_time_out() {
    let meter = FakeMeter {
        garbage_reply: Some(0x00),
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_retries: 3,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    match session.security("SECRET") {
        Err(ProtocolError::Timeout { command, attempts }) => {
            assert_eq!(command, Command::Security);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(sent(&transport).len(), 3);
    assert_eq!(session.state(), SessionState::AwaitingWake);
}

#[test]
fn test_reidentify_keeps_login() {
    let (_transport, mut session) = setup(FakeMeter::default(), fast_config());
    assert_eq!(session.security("SECRET").unwrap(), ResponseCode::Ack);

    assert_eq!(session.identify().unwrap(), ResponseCode::Ack);
    assert_eq!(session.state(), SessionState::LoggedIn);
    assert!(session.keep_alive_active());
}

#[test]
fn test_failed_wake_up_stops_keep_alive() {
    let config = SessionConfig {
        wake_attempts: 3,
        ..fast_config()
    };
    let (transport, mut session) = setup(FakeMeter::default(), config);
    assert_eq!(session.security("SECRET").unwrap(), ResponseCode::Ack);

    transport.lock().unwrap().meter.silent = true;
    assert_eq!(session.wake_up().unwrap(), ResponseCode::NoResponse);
    assert_eq!(session.state(), SessionState::AwaitingWake);
    assert!(!session.keep_alive_active());
}

#[test]
fn test_upload_later_chunk_cancel_aborts() {
    let meter = FakeMeter {
        cancel_command: Some((b'U', 2)),
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_upload_size: 20,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    let mut buf = vec![0u8; 50];
    assert_eq!(session.upload(addr(0x100), &mut buf).unwrap(), ResponseCode::Can);
    assert_eq!(transport.lock().unwrap().command_bytes(), vec![b'U', b'U']);

    let guard = transport.lock().unwrap();
    assert_eq!(&buf[..17], &guard.meter.memory[0x100..0x111]);
    assert!(buf[17..].iter().all(|&b| b == 0));
}

#[test]
fn test_download_later_chunk_cancel_aborts() {
    let meter = FakeMeter {
        cancel_command: Some((b'D', 2)),
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_download_size: 10,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);
    let before = transport.lock().unwrap().meter.memory[0x2008..0x2014].to_vec();

    let data = [0x5Au8; 20];
    assert_eq!(session.download(addr(0x2000), &data).unwrap(), ResponseCode::Can);

    let frames = sent(&transport);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0][0], b'D');
    assert_eq!(frames[1].len(), 8 + 2);
    assert_eq!(frames[2][0], b'D');
    assert_eq!(Address::extract(&frames[2], 1).value(), 0x2008);

    let guard = transport.lock().unwrap();
    assert_eq!(&guard.meter.memory[0x2000..0x2008], &data[..8]);
    assert_eq!(&guard.meter.memory[0x2008..0x2014], &before[..]);
}

#[test]
fn test_upload_nak_resyncs_and_retries_same_chunk() {
    let meter = FakeMeter {
        nak_command: Some((b'U', 2)),
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_upload_size: 20,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    let mut buf = vec![0u8; 50];
    assert_eq!(session.upload(addr(0x100), &mut buf).unwrap(), ResponseCode::Ack);

    let frames = sent(&transport);
    let kinds: Vec<u8> = frames.iter().map(|f| f[0]).collect();
    assert_eq!(kinds, vec![b'U', b'U', ENQ, b'U', b'U']);

    let ranges: Vec<(u32, u32)> = frames
        .iter()
        .filter(|f| f[0] == b'U')
        .map(|f| (Address::extract(f, 1).value(), Address::extract(f, 4).value()))
        .collect();
    assert_eq!(
        ranges,
        vec![(0x100, 0x110), (0x111, 0x121), (0x111, 0x121), (0x122, 0x131)]
    );

    let guard = transport.lock().unwrap();
    assert_eq!(&buf[..], &guard.meter.memory[0x100..0x132]);
}

#[test]
fn test_download_nak_on_announcement_resyncs() {
    let meter = FakeMeter {
        nak_command: Some((b'D', 2)),
        ..FakeMeter::default()
    };
    let config = SessionConfig {
        max_download_size: 10,
        ..fast_config()
    };
    let (transport, mut session) = setup(meter, config);

    let data: Vec<u8> = (0..20).map(|i| 0x30 + i as u8).collect();
    assert_eq!(session.download(addr(0x2000), &data).unwrap(), ResponseCode::Ack);

    // D, data, D (NAK), ENQ, D, data, D, data
    let frames = sent(&transport);
    assert_eq!(frames.len(), 8);
    assert_eq!(frames[2][0], b'D');
    assert_eq!(frames[3], vec![ENQ]);
    assert_eq!(frames[4], frames[2]);
    assert_eq!(Address::extract(&frames[4], 1).value(), 0x2008);
    assert_eq!(&frames[5][..8], &data[8..16]);
    assert_eq!(session.stats().naks, 1);

    let guard = transport.lock().unwrap();
    assert_eq!(&guard.meter.memory[0x2000..0x2014], &data[..]);
}
