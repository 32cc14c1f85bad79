//! Single-exchange primitives over a locked transport
//!
//! A [`Link`] borrows the transport for as long as its owner holds the
//! transport mutex. Nothing here retries; retry policy lives in the session.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::commands::ResponseCode;
use super::packet::{enquire_frame, Response};
use super::stats::LinkStats;
use super::stream::{RxNotify, Transport};
use super::ProtocolError;

pub(crate) struct Link<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    rx: &'a RxNotify,
    stats: &'a LinkStats,
}

impl<'a, T: Transport + ?Sized> Link<'a, T> {
    pub(crate) fn new(transport: &'a mut T, rx: &'a RxNotify, stats: &'a LinkStats) -> Self {
        Self {
            transport,
            rx,
            stats,
        }
    }

    /// Send a frame after dropping stale input from earlier exchanges
    pub(crate) fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.transport.discard_input()?;
        trace!(bytes = ?frame, "tx");
        self.transport.send(frame)?;
        self.stats.record_sent(frame.len());
        Ok(())
    }

    /// Fill `buf` from the transport, blocking on the byte-received
    /// notification until it is full or `deadline` passes.
    fn receive(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, ProtocolError> {
        let mut got = 0;
        while got < buf.len() {
            let seen = self.rx.generation();
            let n = self.transport.read(&mut buf[got..], Duration::ZERO)?;
            if n > 0 {
                got += n;
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.rx.wait_for_change(seen, deadline - now);
        }
        self.stats.record_received(got);
        Ok(got)
    }

    /// Wait up to `timeout` for a response of `expected_len` bytes.
    ///
    /// Bytes that are not ACK, NAK or CAN are skipped until a response code
    /// arrives. Only an ACK is followed by more bytes. Returns `None` if no
    /// code arrived or an ACK response was cut short by the deadline.
    pub(crate) fn read_response(
        &mut self,
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Option<Response>, ProtocolError> {
        let deadline = Instant::now() + timeout;

        let mut first = [0u8; 1];
        let mut skipped = 0usize;
        let code = loop {
            if self.receive(&mut first, deadline)? == 0 {
                if skipped > 0 {
                    debug!(skipped, "no response code before deadline, only noise");
                }
                return Ok(None);
            }
            match ResponseCode::from_byte(first[0]) {
                ResponseCode::NoResponse => {
                    skipped += 1;
                    trace!(byte = first[0], "skipping non-code byte");
                }
                code => break code,
            }
        };

        let mut raw = vec![first[0]];
        if code == ResponseCode::Ack && expected_len > 1 {
            raw.resize(expected_len, 0);
            let got = self.receive(&mut raw[1..], deadline)?;
            if got < expected_len - 1 {
                debug!(
                    "response truncated: {} of {} bytes before deadline",
                    got + 1,
                    expected_len
                );
                return Ok(None);
            }
        }

        trace!(bytes = ?raw, "rx response");
        Ok(Some(Response { code, raw }))
    }

    /// Send Enquire up to `attempts` times, waiting `poll` for each answer,
    /// until one is ACKed. Returns the last code seen.
    pub(crate) fn enquire(
        &mut self,
        attempts: u32,
        poll: Duration,
    ) -> Result<ResponseCode, ProtocolError> {
        let frame = enquire_frame();
        let mut last = ResponseCode::NoResponse;
        for attempt in 1..=attempts {
            self.send(&frame)?;
            last = self
                .read_response(1, poll)?
                .map_or(ResponseCode::NoResponse, |r| r.code);
            if last.is_ack() {
                debug!(attempt, "enquire acknowledged");
                break;
            }
            trace!(attempt, code = %last, "enquire unanswered");
        }
        Ok(last)
    }
}
