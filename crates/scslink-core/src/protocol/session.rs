//! Protocol session
//!
//! Drives the SCS exchange sequence against one meter: WakeUp, Identify,
//! Security (login), then any number of Upload/Download calls.
//!
//! Every public operation locks the shared transport for its full duration,
//! sub-chunks included, so a keep-alive can never land between the frames of
//! one call. Protocol-level refusals come back as [`ResponseCode`]s; only an
//! exchange that is still silent after its last retry, or a transport failure,
//! becomes an error. The retry-exhausted timeout also ends the logical
//! session: the keep-alive stops and the caller must wake, identify and log
//! in again.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

use super::address::Address;
use super::commands::{Command, ResponseCode, IDENTIFY_RESPONSE_LEN, UPLOAD_OVERHEAD};
use super::config::SessionConfig;
use super::crc::CRC_LEN;
use super::keepalive::{Activity, KeepAlive, KeepAliveParams};
use super::link::Link;
use super::packet::{
    download_data_frame, download_frame, identify_frame, security_frame, upload_frame,
    DeviceIdentity, Response,
};
use super::stats::{LinkStats, StatsSnapshot};
use super::stream::{RxNotify, Transport};
use super::ProtocolError;

/// A transport shared between its owner and a session
pub type SharedTransport<T> = Arc<Mutex<T>>;

/// Session progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Transport not open
    Disconnected,
    /// Open, but the meter has not answered a WakeUp yet (or the link was lost)
    AwaitingWake,
    /// Meter answered WakeUp
    Woken,
    /// Identify succeeded
    Identified,
    /// Security exchange in progress
    SecurityPending,
    /// Logged in; keep-alive running. Leaving this state always stops the
    /// keep-alive, and a keep-alive that gives up reports `AwaitingWake`.
    LoggedIn,
}

/// One SCS conversation with a meter over a caller-owned transport
pub struct ProtocolSession<T: Transport + 'static> {
    transport: SharedTransport<T>,
    rx: RxNotify,
    config: SessionConfig,
    state: SessionState,
    identity: Option<DeviceIdentity>,
    stats: Arc<LinkStats>,
    activity: Arc<Activity>,
    keep_alive: Option<KeepAlive>,
    span: Span,
}

impl<T: Transport + 'static> ProtocolSession<T> {
    /// Create a session over `transport`. The transport may be opened before
    /// or after; the session never closes it.
    pub fn new(transport: SharedTransport<T>, config: SessionConfig) -> Self {
        let rx = transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rx_notify();
        Self {
            transport,
            rx,
            config: config.normalized(),
            state: SessionState::AwaitingWake,
            identity: None,
            stats: Arc::new(LinkStats::new()),
            activity: Arc::new(Activity::new()),
            keep_alive: None,
            span: info_span!("scs_session"),
        }
    }

    /// Log everything this session (and its keep-alive thread) does inside `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current progress. `Disconnected` whenever the transport is closed.
    pub fn state(&self) -> SessionState {
        let open = self
            .transport
            .lock()
            .map(|t| t.is_open())
            .unwrap_or(false);
        if !open {
            SessionState::Disconnected
        } else if self.state == SessionState::LoggedIn && !self.keep_alive_active() {
            SessionState::AwaitingWake
        } else {
            self.state
        }
    }

    /// Current tuning, after clamping
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receive deadline in ms, capped at 254000
    pub fn set_min_receive_timeout(&mut self, ms: u64) {
        self.config.set_min_receive_timeout(ms);
    }

    /// Send attempts per exchange, at least one
    pub fn set_max_retries(&mut self, retries: u32) {
        self.config.set_max_retries(retries);
    }

    /// Upload response limit in bytes, never below the Identify response length
    pub fn set_max_upload_size(&mut self, size: usize) {
        self.config.set_max_upload_size(size);
    }

    /// Download data frame limit in bytes, never below 3
    pub fn set_max_download_size(&mut self, size: usize) {
        self.config.set_max_download_size(size);
    }

    /// Link counters so far
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether an Identify has succeeded
    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }

    /// Result of the last successful Identify
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Device ID, empty until identified
    pub fn device_id(&self) -> &str {
        self.identity.as_ref().map_or("", |i| i.device_id.as_str())
    }

    /// Device type, empty until identified
    pub fn device_type(&self) -> &str {
        self.identity.as_ref().map_or("", |i| i.device_type.as_str())
    }

    /// First valid meter address, zero until identified
    pub fn meter_start_address(&self) -> Address {
        self.identity
            .as_ref()
            .map_or(Address::ZERO, |i| i.start_address)
    }

    /// Last valid meter address, zero until identified
    pub fn meter_stop_address(&self) -> Address {
        self.identity
            .as_ref()
            .map_or(Address::ZERO, |i| i.stop_address)
    }

    /// Whether the keep-alive timer is still running
    pub fn keep_alive_active(&self) -> bool {
        self.keep_alive.as_ref().is_some_and(|k| k.is_running())
    }

    /// Enquire until the meter ACKs or the wake attempts run out, then let
    /// the meter settle. Returns the last response code seen.
    pub fn wake_up(&mut self) -> Result<ResponseCode, ProtocolError> {
        let code = self.run(|ex| ex.wake_up())?;
        if code.is_ack() {
            if self.state == SessionState::AwaitingWake {
                self.set_state(SessionState::Woken);
            }
        } else {
            self.set_state(SessionState::AwaitingWake);
        }
        Ok(code)
    }

    /// Fetch the device type, ID and memory range.
    ///
    /// On anything but ACK the previously cached identity is left untouched.
    /// A logged-in session stays logged in.
    pub fn identify(&mut self) -> Result<ResponseCode, ProtocolError> {
        let response = self.run(|ex| {
            ex.send_and_receive(Command::Identify, &identify_frame(), IDENTIFY_RESPONSE_LEN)
        })?;
        if !response.code.is_ack() {
            return Ok(response.code);
        }

        match response.checked_payload().and_then(DeviceIdentity::parse) {
            Some(identity) => {
                info!(
                    device_type = %identity.device_type,
                    device_id = %identity.device_id,
                    start = %identity.start_address,
                    stop = %identity.stop_address,
                    "meter identified"
                );
                self.identity = Some(identity);
                if self.state != SessionState::LoggedIn {
                    self.set_state(SessionState::Identified);
                }
                Ok(ResponseCode::Ack)
            }
            None => Ok(ResponseCode::NoResponse),
        }
    }

    /// Log in with `code` (null-padded or truncated to 8 bytes). On ACK the
    /// keep-alive timer starts.
    pub fn security(&mut self, code: &str) -> Result<ResponseCode, ProtocolError> {
        let previous = match self.state {
            SessionState::LoggedIn => self.logged_out_state(),
            other => other,
        };
        self.set_state(SessionState::SecurityPending);

        let frame = security_frame(code);
        let response = match self.run(|ex| ex.send_and_receive(Command::Security, &frame, 1)) {
            Ok(response) => response,
            Err(e) => {
                if !e.is_timeout() {
                    self.set_state(previous);
                }
                return Err(e);
            }
        };

        if !response.code.is_ack() {
            warn!(code = %response.code, "security code rejected");
            self.set_state(previous);
            return Ok(response.code);
        }

        info!("logged in");
        self.set_state(SessionState::LoggedIn);
        self.start_keep_alive()?;
        Ok(ResponseCode::Ack)
    }

    /// Read `buf.len()` bytes of meter memory starting at `start`.
    ///
    /// Requests whose response would exceed `max_upload_size` are split into
    /// consecutive chunks; the first failing chunk ends the call with its code
    /// and `buf` is only partially filled.
    pub fn upload(&mut self, start: Address, buf: &mut [u8]) -> Result<ResponseCode, ProtocolError> {
        start.range_end(buf.len())?;
        let chunk_len = self.config.max_upload_size - UPLOAD_OVERHEAD;

        self.run(|ex| {
            for (index, part) in buf.chunks_mut(chunk_len).enumerate() {
                let addr = Address::new(start.value() + (index * chunk_len) as u32)?;
                let code = ex.upload_chunk(addr, part)?;
                if !code.is_ack() {
                    warn!(%addr, %code, "upload aborted");
                    return Ok(code);
                }
            }
            Ok(ResponseCode::Ack)
        })
    }

    /// Write `data` to meter memory starting at `start`, in chunks of at most
    /// `max_download_size` bytes per data frame. A CAN on any chunk's
    /// announcement aborts the whole call.
    pub fn download(&mut self, start: Address, data: &[u8]) -> Result<ResponseCode, ProtocolError> {
        start.range_end(data.len())?;
        let chunk_len = self.config.max_download_size - CRC_LEN;

        self.run(|ex| {
            for (index, part) in data.chunks(chunk_len).enumerate() {
                let addr = Address::new(start.value() + (index * chunk_len) as u32)?;
                let code = ex.download_chunk(addr, part)?;
                if !code.is_ack() {
                    warn!(%addr, %code, "download aborted");
                    return Ok(code);
                }
            }
            Ok(ResponseCode::Ack)
        })
    }

    /// Stop the keep-alive without touching the transport
    pub fn logout(&mut self) {
        self.stop_keep_alive();
        if self.state == SessionState::LoggedIn {
            self.set_state(self.logged_out_state());
        }
    }

    fn logged_out_state(&self) -> SessionState {
        if self.identity.is_some() {
            SessionState::Identified
        } else {
            SessionState::Woken
        }
    }

    /// Move to `next`; anything but `LoggedIn` stops the keep-alive
    fn set_state(&mut self, next: SessionState) {
        if next != SessionState::LoggedIn {
            self.stop_keep_alive();
        }
        self.state = next;
    }

    fn start_keep_alive(&mut self) -> Result<(), ProtocolError> {
        self.stop_keep_alive();
        let params = KeepAliveParams {
            interval: self.config.keep_alive_interval(),
            attempts: self.config.keep_alive_retries,
            poll: self.config.wake_poll(),
        };
        let keep_alive = KeepAlive::start(
            Arc::clone(&self.transport),
            self.rx.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.activity),
            params,
            self.span.clone(),
        )?;
        self.keep_alive = Some(keep_alive);
        Ok(())
    }

    fn stop_keep_alive(&mut self) {
        if self.keep_alive.take().is_some() {
            debug!("keep-alive stopped");
        }
    }

    /// Run `op` with exclusive use of the transport and the keep-alive paused
    fn run<R>(
        &mut self,
        op: impl FnOnce(&mut Exchange<'_, T>) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let transport = Arc::clone(&self.transport);
        let result = {
            let _paused = self.activity.pause();
            let mut guard = transport.lock().map_err(|_| ProtocolError::LinkPoisoned)?;
            if !guard.is_open() {
                return Err(ProtocolError::NotOpen);
            }
            let mut exchange = Exchange {
                link: Link::new(&mut *guard, &self.rx, &self.stats),
                config: &self.config,
                stats: &self.stats,
            };
            op(&mut exchange)
        };

        if let Err(e) = &result {
            if e.is_timeout() {
                warn!("{}; closing logical session", e);
                self.set_state(SessionState::AwaitingWake);
            }
        }
        result
    }
}

impl<T: Transport + 'static> Drop for ProtocolSession<T> {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

/// Retry policy on top of a locked [`Link`]
struct Exchange<'a, T: Transport + ?Sized> {
    link: Link<'a, T>,
    config: &'a SessionConfig,
    stats: &'a LinkStats,
}

impl<T: Transport + ?Sized> Exchange<'_, T> {
    fn wake_up(&mut self) -> Result<ResponseCode, ProtocolError> {
        let code = self
            .link
            .enquire(self.config.wake_attempts, self.config.wake_poll())?;
        if code.is_ack() {
            thread::sleep(self.config.wake_settle());
        } else {
            warn!(
                "meter did not wake after {} enquiries ({})",
                self.config.wake_attempts, code
            );
        }
        Ok(code)
    }

    fn send_and_receive(
        &mut self,
        command: Command,
        frame: &[u8],
        expected_len: usize,
    ) -> Result<Response, ProtocolError> {
        let attempts = self.config.max_retries;
        self.send_and_receive_with(command, frame, expected_len, attempts)
    }

    /// Send `frame` up to `attempts` times until it is ACKed or CANcelled.
    ///
    /// A NAK triggers a WakeUp before the next attempt. An ACK whose payload
    /// CRC fails counts as no response. No response code on the final attempt,
    /// whether silence or only line noise, is a
    /// [`ProtocolError::Timeout`]; any other exhausted outcome is returned as
    /// the last code seen.
    fn send_and_receive_with(
        &mut self,
        command: Command,
        frame: &[u8],
        expected_len: usize,
        attempts: u32,
    ) -> Result<Response, ProtocolError> {
        let attempts = attempts.max(1);
        let timeout = self.config.receive_timeout();
        let mut last = ResponseCode::NoResponse;

        for attempt in 1..=attempts {
            self.link.send(frame)?;

            let response = match self.link.read_response(expected_len, timeout)? {
                Some(response) if response.code != ResponseCode::NoResponse => response,
                _ => {
                    self.stats.record_timeout();
                    if attempt == attempts {
                        return Err(ProtocolError::Timeout { command, attempts });
                    }
                    debug!(%command, attempt, "no response code before deadline, retrying");
                    last = ResponseCode::NoResponse;
                    continue;
                }
            };

            match response.code {
                ResponseCode::Ack => {
                    if !command.has_checked_payload() || response.checked_payload().is_some() {
                        return Ok(response);
                    }
                    self.stats.record_crc_failure();
                    warn!(%command, attempt, "response CRC mismatch, treating as no response");
                    last = ResponseCode::NoResponse;
                }
                ResponseCode::Can => {
                    warn!(%command, "meter cancelled request");
                    return Ok(response);
                }
                ResponseCode::Nak => {
                    self.stats.record_nak();
                    last = ResponseCode::Nak;
                    if attempt < attempts {
                        debug!(%command, attempt, "NAK, resynchronising");
                        self.wake_up()?;
                    }
                }
                ResponseCode::NoResponse => last = ResponseCode::NoResponse,
            }
        }

        Ok(Response {
            code: last,
            raw: Vec::new(),
        })
    }

    fn upload_chunk(&mut self, addr: Address, out: &mut [u8]) -> Result<ResponseCode, ProtocolError> {
        let end = addr.range_end(out.len())?;
        debug!(start = %addr, %end, "upload chunk");
        let response = self.send_and_receive(
            Command::Upload,
            &upload_frame(addr, end),
            out.len() + UPLOAD_OVERHEAD,
        )?;
        match response.checked_payload() {
            Some(data) if data.len() == out.len() => {
                out.copy_from_slice(data);
                Ok(ResponseCode::Ack)
            }
            Some(_) => Ok(ResponseCode::NoResponse),
            None => Ok(response.code),
        }
    }

    /// Two-phase write: announce the range, then send the data. The data
    /// phase gets a single attempt.
    fn download_chunk(&mut self, addr: Address, data: &[u8]) -> Result<ResponseCode, ProtocolError> {
        let end = addr.range_end(data.len())?;
        debug!(start = %addr, %end, "download chunk");

        let header = self.send_and_receive(Command::Download, &download_frame(addr, end), 1)?;
        match header.code {
            ResponseCode::Ack => {}
            ResponseCode::Can => {
                warn!(%addr, "download refused by meter security");
                return Ok(ResponseCode::Can);
            }
            other => return Ok(other),
        }

        let reply =
            self.send_and_receive_with(Command::DownloadData, &download_data_frame(data), 1, 1)?;
        Ok(reply.code)
    }
}
