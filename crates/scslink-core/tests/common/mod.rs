//! Scripted meter and in-memory transport shared by the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use scslink_core::protocol::address::Address;
use scslink_core::protocol::crc::{append_crc, verify_crc};
use scslink_core::protocol::{
    ProtocolError, ProtocolSession, RxNotify, RxQueue, SessionConfig, Transport,
};

pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;

pub const MEMORY_SIZE: usize = 0x1_0000;

/// Behaves like a meter answering frames, with knobs for misbehaving
pub struct FakeMeter {
    pub memory: Vec<u8>,
    pub device_type: &'static str,
    pub device_id: &'static str,
    pub start: u32,
    pub stop: u32,
    pub password: &'static str,
    /// Enquiries ignored before the first ACK
    pub enquire_ack_after: u32,
    pub enquires_seen: u32,
    /// Answer nothing at all
    pub silent: bool,
    /// Ignore enquiries only
    pub mute_enquires: bool,
    /// NAK this many command frames
    pub nak_next: u32,
    /// Flip the CRC of this many Identify/Upload responses
    pub corrupt_next_crc: u32,
    /// Refuse every Download announcement with CAN
    pub cancel_downloads: bool,
    /// Never answer the data phase of a Download
    pub silent_data_phase: bool,
    /// NAK the n-th (1-based) frame carrying this command byte, once
    pub nak_command: Option<(u8, u32)>,
    /// CAN the n-th (1-based) frame carrying this command byte
    pub cancel_command: Option<(u8, u32)>,
    /// Line noise sent ahead of every reply
    pub noise_prefix: Vec<u8>,
    /// Answer every frame with this one byte instead
    pub garbage_reply: Option<u8>,
    pub command_counts: [u32; 256],
    pub pending_download: Option<(usize, usize)>,
}

impl Default for FakeMeter {
    fn default() -> Self {
        let memory = (0..MEMORY_SIZE).map(|i| (i * 7 + i / 256) as u8).collect();
        Self {
            memory,
            device_type: "ABC",
            device_id: "12345678",
            start: 0x001000,
            stop: 0x002000,
            password: "SECRET",
            enquire_ack_after: 0,
            enquires_seen: 0,
            silent: false,
            mute_enquires: false,
            nak_next: 0,
            corrupt_next_crc: 0,
            cancel_downloads: false,
            silent_data_phase: false,
            nak_command: None,
            cancel_command: None,
            noise_prefix: Vec::new(),
            garbage_reply: None,
            command_counts: [0; 256],
            pending_download: None,
        }
    }
}

impl FakeMeter {
    fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if let Some(byte) = self.garbage_reply {
            return Some(vec![byte]);
        }
        let mut reply = self.answer(frame)?;
        if !self.noise_prefix.is_empty() {
            reply.splice(0..0, self.noise_prefix.iter().copied());
        }
        Some(reply)
    }

    fn answer(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.silent {
            self.pending_download = None;
            return None;
        }

        if let Some((start, len)) = self.pending_download.take() {
            if self.silent_data_phase {
                return None;
            }
            if frame.len() != len + 2 || !verify_crc(frame) {
                return Some(vec![NAK]);
            }
            self.memory[start..start + len].copy_from_slice(&frame[..len]);
            return Some(vec![ACK]);
        }

        if frame == [ENQ] {
            self.enquires_seen += 1;
            if self.mute_enquires || self.enquires_seen <= self.enquire_ack_after {
                return None;
            }
            return Some(vec![ACK]);
        }

        if !verify_crc(frame) {
            return Some(vec![NAK]);
        }
        if self.nak_next > 0 {
            self.nak_next -= 1;
            return Some(vec![NAK]);
        }

        let count = &mut self.command_counts[usize::from(frame[0])];
        *count += 1;
        let nth = *count;
        if self.nak_command == Some((frame[0], nth)) {
            return Some(vec![NAK]);
        }
        if self.cancel_command == Some((frame[0], nth)) {
            return Some(vec![CAN]);
        }

        match frame[0] {
            b'I' => {
                let mut payload = Vec::new();
                payload.extend_from_slice(self.device_type.as_bytes());
                payload.extend_from_slice(self.device_id.as_bytes());
                payload.extend_from_slice(&self.start.to_be_bytes()[1..]);
                payload.extend_from_slice(&self.stop.to_be_bytes()[1..]);
                Some(self.checked_reply(payload))
            }
            b'S' => {
                let mut expected = self.password.as_bytes().to_vec();
                expected.resize(8, 0);
                if frame[1..9] == expected[..] {
                    Some(vec![ACK])
                } else {
                    Some(vec![CAN])
                }
            }
            b'U' => {
                let start = Address::extract(frame, 1).value() as usize;
                let end = Address::extract(frame, 4).value() as usize;
                let data = self.memory[start..=end].to_vec();
                Some(self.checked_reply(data))
            }
            b'D' => {
                if self.cancel_downloads {
                    return Some(vec![CAN]);
                }
                let start = Address::extract(frame, 1).value() as usize;
                let end = Address::extract(frame, 4).value() as usize;
                self.pending_download = Some((start, end - start + 1));
                Some(vec![ACK])
            }
            _ => Some(vec![NAK]),
        }
    }

    fn checked_reply(&mut self, payload: Vec<u8>) -> Vec<u8> {
        let mut body = payload;
        append_crc(&mut body);
        if self.corrupt_next_crc > 0 {
            self.corrupt_next_crc -= 1;
            if let Some(last) = body.last_mut() {
                *last ^= 0xFF;
            }
        }
        let mut reply = vec![ACK];
        reply.extend_from_slice(&body);
        reply
    }
}

/// Transport that hands each sent frame to a [`FakeMeter`] and queues its reply
pub struct MockTransport {
    pub open: bool,
    rx: RxQueue,
    pub meter: FakeMeter,
    pub sent: Vec<Vec<u8>>,
    /// Delay before each reply is made readable
    pub reply_delay: Duration,
}

impl MockTransport {
    pub fn new(meter: FakeMeter) -> Self {
        Self {
            open: true,
            rx: RxQueue::default(),
            meter,
            sent: Vec::new(),
            reply_delay: Duration::ZERO,
        }
    }

    /// Sent frames reduced to their first byte
    pub fn command_bytes(&self) -> Vec<u8> {
        self.sent.iter().map(|f| f[0]).collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self, _identifier: &str) -> Result<(), ProtocolError> {
        if self.open {
            return Err(ProtocolError::AlreadyOpen);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::NotOpen);
        }
        self.sent.push(bytes.to_vec());
        if let Some(reply) = self.meter.handle(bytes) {
            if !self.reply_delay.is_zero() {
                thread::sleep(self.reply_delay);
            }
            self.rx.push(&reply);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        if !self.open {
            return Err(ProtocolError::NotOpen);
        }
        Ok(self.rx.read_timeout(buf, timeout))
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        self.rx.clear();
        Ok(())
    }

    fn rx_notify(&self) -> RxNotify {
        self.rx.notifier()
    }
}

pub type Shared = Arc<Mutex<MockTransport>>;

/// Short deadlines so failure paths finish quickly; keep-alive effectively off
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        min_receive_timeout_ms: 50,
        wake_poll_ms: 10,
        wake_settle_ms: 0,
        keep_alive_interval_ms: 60_000,
        ..SessionConfig::default()
    }
}

pub fn setup(meter: FakeMeter, config: SessionConfig) -> (Shared, ProtocolSession<MockTransport>) {
    let transport = Arc::new(Mutex::new(MockTransport::new(meter)));
    let session = ProtocolSession::new(Arc::clone(&transport), config);
    (transport, session)
}

/// Clear the sent-frame log
pub fn clear_sent(transport: &Shared) {
    transport.lock().unwrap().sent.clear();
}

pub fn sent(transport: &Shared) -> Vec<Vec<u8>> {
    transport.lock().unwrap().sent.clone()
}
