//! Byte transports consumed by device drivers.
//!
//! A [`Transport`] is an opaque byte channel with non-blocking reads, bounded
//! blocking reads/writes and a readiness query the event loop polls.
//! [`SerialTransport`] talks to a real serial port, [`ScriptedTransport`]
//! replays canned bytes for tests and demos.

use crate::event_loop::Interest;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout on {port}: {operation} did not complete within {timeout:?}")]
    Timeout {
        port: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Transport {0} is not open")]
    NotOpen(String),

    #[error("Transport {0} is already claimed")]
    Busy(String),

    #[error("Transport {0} disconnected")]
    Disconnected(String),

    #[error("Invalid serial parameters '{params}': {reason}")]
    InvalidParams { params: String, reason: String },
}

/// Uniform byte channel.
///
/// `read_blocking` and `write_blocking` return the number of bytes moved; a
/// count below the buffer length means the timeout elapsed first.
pub trait Transport: fmt::Debug {
    fn connection_id(&self) -> &str;

    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Reads what is available right now, `Ok(0)` when nothing is.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn read_blocking(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn write_blocking(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Discards pending input and output.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Timeout for moving `num_bytes` over this transport.
    fn io_timeout(&self, _num_bytes: usize) -> Duration {
        Duration::from_secs(1)
    }

    /// Which of `interest` is ready. Failures are reported as `ERROR` so the
    /// owning callback can surface them through its next read.
    fn readiness(&mut self, interest: Interest) -> Interest {
        let mut ready = Interest::empty();
        if interest.contains(Interest::READABLE) {
            match self.bytes_available() {
                Ok(0) => {}
                Ok(_) => ready |= Interest::READABLE,
                Err(e) => {
                    log::debug!("Readiness query on {} failed: {}", self.connection_id(), e);
                    ready |= Interest::ERROR;
                }
            }
        }
        if interest.contains(Interest::WRITABLE) {
            ready |= Interest::WRITABLE;
        }
        ready
    }

    /// Writes all of `buf` or fails with `Timeout`.
    fn send(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let written = self.write_blocking(buf, timeout)?;
        if written < buf.len() {
            return Err(TransportError::Timeout {
                port: self.connection_id().to_string(),
                operation: "write",
                timeout,
            });
        }
        Ok(())
    }
}

/// Serial line settings in the `"9600/8n1/dtr=1/rts=0/flow=0"` notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub baudrate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baudrate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr: None,
            rts: None,
        }
    }
}

impl SerialParams {
    fn data_bit_count(&self) -> u32 {
        match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }

    /// Start bit, data bits, parity bit and stop bits.
    pub fn bits_per_frame(&self) -> u32 {
        let data = self.data_bit_count();
        let parity = u32::from(self.parity != Parity::None);
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        1 + data + parity + stop
    }

    /// 10 ms of OS overhead plus the wire time of `num_bytes`.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn timeout_for(&self, num_bytes: usize) -> Duration {
        if self.baudrate == 0 {
            return Duration::from_secs(1);
        }
        let per_byte_ms = 1000.0 / f64::from(self.baudrate) * f64::from(self.bits_per_frame());
        let wire_ms = per_byte_ms * num_bytes as f64;
        Duration::from_millis(10 + wire_ms as u64)
    }
}

impl FromStr for SerialParams {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidParams {
            params: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split('/');
        let mut params = Self::default();
        params.baudrate = parts
            .next()
            .and_then(|b| b.parse().ok())
            .filter(|b| *b > 0)
            .ok_or_else(|| invalid("missing or invalid baud rate"))?;

        for part in parts {
            if let Some((key, value)) = part.split_once('=') {
                match (key, value) {
                    ("dtr", "0" | "1") => params.dtr = Some(value == "1"),
                    ("rts", "0" | "1") => params.rts = Some(value == "1"),
                    ("flow", "0") => params.flow_control = FlowControl::None,
                    ("flow", "1") => params.flow_control = FlowControl::Hardware,
                    ("flow", "2") => params.flow_control = FlowControl::Software,
                    _ => return Err(invalid(&format!("unknown option '{part}'"))),
                }
                continue;
            }

            let bytes = part.as_bytes();
            if bytes.len() != 3 {
                return Err(invalid(&format!("unknown frame format '{part}'")));
            }
            params.data_bits = match bytes[0] {
                b'5' => DataBits::Five,
                b'6' => DataBits::Six,
                b'7' => DataBits::Seven,
                b'8' => DataBits::Eight,
                _ => return Err(invalid("data bits must be 5 to 8")),
            };
            params.parity = match bytes[1].to_ascii_lowercase() {
                b'n' => Parity::None,
                b'e' => Parity::Even,
                b'o' => Parity::Odd,
                _ => return Err(invalid("parity must be n, e or o")),
            };
            params.stop_bits = match bytes[2] {
                b'1' => StopBits::One,
                b'2' => StopBits::Two,
                _ => return Err(invalid("stop bits must be 1 or 2")),
            };
        }

        Ok(params)
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'n',
            Parity::Even => 'e',
            Parity::Odd => 'o',
        };
        let data = self.data_bit_count();
        let stop = if self.stop_bits == StopBits::Two { 2 } else { 1 };
        write!(f, "{}/{}{}{}", self.baudrate, data, parity, stop)
    }
}

pub struct SerialTransport {
    port_name: String,
    params: SerialParams,
    serial: Option<Box<dyn SerialPort>>,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("params", &self.params)
            .field("open", &self.serial.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(port_name: &str, params: SerialParams) -> Self {
        Self {
            port_name: port_name.to_string(),
            params,
            serial: None,
        }
    }

    pub fn params(&self) -> &SerialParams {
        &self.params
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.serial
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.port_name.clone()))
    }

    fn map_io(&self, e: std::io::Error) -> TransportError {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                TransportError::Disconnected(self.port_name.clone())
            }
            _ => TransportError::Io(e),
        }
    }
}

impl Transport for SerialTransport {
    fn connection_id(&self) -> &str {
        &self.port_name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.serial.is_some() {
            return Ok(());
        }
        log::debug!("Opening serial port '{}' ({}).", self.port_name, self.params);

        let mut serial = serialport::new(&self.port_name, self.params.baudrate)
            .data_bits(self.params.data_bits)
            .parity(self.params.parity)
            .stop_bits(self.params.stop_bits)
            .flow_control(self.params.flow_control)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| {
                if e.description.to_ascii_lowercase().contains("busy") {
                    TransportError::Busy(self.port_name.clone())
                } else {
                    TransportError::SerialPort(e)
                }
            })?;

        if let Some(dtr) = self.params.dtr {
            serial.write_data_terminal_ready(dtr)?;
        }
        if let Some(rts) = self.params.rts {
            serial.write_request_to_send(rts)?;
        }
        serial.clear(ClearBuffer::All)?;
        self.serial = Some(serial);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.serial.take().is_some() {
            log::debug!("Closing serial port '{}'.", self.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.serial.is_some()
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        let pending = self.port()?.bytes_to_read()?;
        Ok(pending as usize)
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let available = self.bytes_available()?;
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = available.min(buf.len());
        match self.port()?.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(self.map_io(e)),
        }
    }

    fn read_blocking(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let serial = self.port()?;
            serial.set_timeout(remaining)?;
            match serial.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(self.map_io(e)),
            }
        }
        Ok(filled)
    }

    fn write_blocking(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let serial = self.port()?;
            serial.set_timeout(remaining)?;
            match serial.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(self.map_io(e)),
            }
        }
        if written == buf.len() {
            self.port()?.flush().map_err(|e| self.map_io(e))?;
        }
        log::trace!("Wrote {}/{} bytes to '{}'.", written, buf.len(), self.port_name);
        Ok(written)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.port()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn io_timeout(&self, num_bytes: usize) -> Duration {
        self.params.timeout_for(num_bytes)
    }
}

/// A serial port whose USB identity matched one of the requested ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSerialPort {
    pub port: String,
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Lists serial ports whose USB vendor/product id is in `usb_ids`.
pub fn available_ports(usb_ids: &[(u16, u16)]) -> Result<Vec<UsbSerialPort>, TransportError> {
    let ports = serialport::available_ports()?
        .into_iter()
        .filter_map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) if usb_ids.contains(&(usb.vid, usb.pid)) => {
                Some(UsbSerialPort {
                    port: info.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    product: usb.product,
                    serial_number: usb.serial_number,
                })
            }
            _ => None,
        })
        .collect();
    Ok(ports)
}

#[derive(Debug, Default)]
struct Script {
    rx: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    unanswered: Vec<u8>,
    replies: Vec<Reply>,
    claimed: bool,
    disconnected: bool,
}

#[derive(Debug)]
struct Reply {
    request: Vec<u8>,
    response: Vec<u8>,
    repeat: bool,
}

impl Script {
    fn answer_requests(&mut self) {
        while let Some(index) = self.replies.iter().position(|reply| {
            self.unanswered
                .windows(reply.request.len().max(1))
                .any(|w| w == reply.request.as_slice())
        }) {
            let request_len = self.replies[index].request.len();
            let end = self
                .unanswered
                .windows(request_len.max(1))
                .position(|w| w == self.replies[index].request.as_slice())
                .map_or(0, |start| start + request_len);
            self.unanswered.drain(..end);

            let response = if self.replies[index].repeat {
                self.replies[index].response.clone()
            } else {
                self.replies.remove(index).response
            };
            if !response.is_empty() {
                self.rx.push_back(response);
            }
        }
    }
}

/// In-memory transport driven by a script of received chunks and
/// request/reply rules. Clones share the same script, so a test can keep a
/// handle after the transport has moved into a device.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    id: String,
    open: bool,
    script: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            open: false,
            script: Rc::new(RefCell::new(Script::default())),
        }
    }

    /// Queues one received chunk; a non-blocking read never returns bytes
    /// from two chunks at once.
    pub fn push_rx(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.script.borrow_mut().rx.push_back(bytes.to_vec());
        }
    }

    pub fn push_rx_chunked(&self, bytes: &[u8], chunk_size: usize) {
        for chunk in bytes.chunks(chunk_size.max(1)) {
            self.push_rx(chunk);
        }
    }

    /// Queues `response` once `request` has been written.
    pub fn reply_once(&self, request: &[u8], response: &[u8]) {
        self.add_reply(request, response, false);
    }

    /// Queues `response` every time `request` is written.
    pub fn reply_always(&self, request: &[u8], response: &[u8]) {
        self.add_reply(request, response, true);
    }

    fn add_reply(&self, request: &[u8], response: &[u8], repeat: bool) {
        let mut script = self.script.borrow_mut();
        script.replies.push(Reply {
            request: request.to_vec(),
            response: response.to_vec(),
            repeat,
        });
        script.answer_requests();
    }

    pub fn written(&self) -> Vec<u8> {
        self.script.borrow().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.script.borrow_mut().written)
    }

    pub fn pending_rx(&self) -> usize {
        self.script.borrow().rx.iter().map(Vec::len).sum()
    }

    /// Every further operation fails with `Disconnected`.
    pub fn disconnect(&self) {
        self.script.borrow_mut().disconnected = true;
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.script.borrow().disconnected {
            return Err(TransportError::Disconnected(self.id.clone()));
        }
        if !self.open {
            return Err(TransportError::NotOpen(self.id.clone()));
        }
        Ok(())
    }

    fn pop_into(&self, buf: &mut [u8]) -> usize {
        let mut script = self.script.borrow_mut();
        let Some(mut chunk) = script.rx.pop_front() else {
            return 0;
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            script.rx.push_front(chunk);
        }
        n
    }
}

impl Transport for ScriptedTransport {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.open {
            return Ok(());
        }
        let mut script = self.script.borrow_mut();
        if script.disconnected {
            return Err(TransportError::Disconnected(self.id.clone()));
        }
        if script.claimed {
            return Err(TransportError::Busy(self.id.clone()));
        }
        script.claimed = true;
        drop(script);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.script.borrow_mut().claimed = false;
            self.open = false;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        self.check()?;
        Ok(self.script.borrow().rx.front().map_or(0, Vec::len))
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check()?;
        Ok(self.pop_into(buf))
    }

    fn read_blocking(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check()?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.pop_into(&mut buf[filled..]);
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write_blocking(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.check()?;
        let mut script = self.script.borrow_mut();
        script.written.extend_from_slice(buf);
        script.unanswered.extend_from_slice(buf);
        script.answer_requests();
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.check()?;
        self.script.borrow_mut().rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serialcomm() {
        let params: SerialParams = "115200/7e2/dtr=1/rts=0/flow=1".parse().unwrap();
        assert_eq!(params.baudrate, 115_200);
        assert_eq!(params.data_bits, DataBits::Seven);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.stop_bits, StopBits::Two);
        assert_eq!(params.flow_control, FlowControl::Hardware);
        assert_eq!(params.dtr, Some(true));
        assert_eq!(params.rts, Some(false));
        assert_eq!(params.to_string(), "115200/7e2");

        let plain: SerialParams = "9600".parse().unwrap();
        assert_eq!(plain, SerialParams::default());
    }

    #[test]
    fn test_parse_serialcomm_rejects_garbage() {
        assert!("fast/8n1".parse::<SerialParams>().is_err());
        assert!("9600/9n1".parse::<SerialParams>().is_err());
        assert!("9600/8n1/parity=x".parse::<SerialParams>().is_err());
        assert!("0/8n1".parse::<SerialParams>().is_err());
    }

    #[test]
    fn test_serial_timeout() {
        let params = SerialParams::default();
        assert_eq!(params.bits_per_frame(), 10);
        // 9600 baud, 10 bits: ~1.04 ms per byte.
        assert_eq!(params.timeout_for(0), Duration::from_millis(10));
        let timeout = params.timeout_for(96);
        assert!(timeout >= Duration::from_millis(109) && timeout <= Duration::from_millis(110));
    }

    #[test]
    fn test_scripted_reads_respect_chunks() {
        let mut transport = ScriptedTransport::new("scripted:0");
        transport.open().unwrap();
        transport.push_rx(&[1, 2, 3]);
        transport.push_rx(&[4]);

        let mut buf = [0u8; 8];
        assert_eq!(transport.bytes_available().unwrap(), 3);
        assert_eq!(transport.read_nonblocking(&mut buf[..2]).unwrap(), 2);
        assert_eq!(transport.read_nonblocking(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        assert_eq!(transport.read_nonblocking(&mut buf).unwrap(), 1);
        assert_eq!(transport.read_nonblocking(&mut buf).unwrap(), 0);
        assert_eq!(transport.readiness(Interest::READABLE), Interest::empty());
    }

    #[test]
    fn test_scripted_request_reply() {
        let mut transport = ScriptedTransport::new("scripted:1");
        let handle = transport.clone();
        transport.open().unwrap();
        handle.reply_once(b"GMOD\r", b"3302\rOK\r");

        transport.send(b"GMOD\r", Duration::from_millis(50)).unwrap();
        let mut buf = [0u8; 8];
        let n = transport
            .read_blocking(&mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(&buf[..n], b"3302\rOK\r");
        assert_eq!(handle.written(), b"GMOD\r");

        transport.send(b"GMOD\r", Duration::from_millis(50)).unwrap();
        assert_eq!(handle.pending_rx(), 0);
    }

    #[test]
    fn test_scripted_claim_and_disconnect() {
        let mut first = ScriptedTransport::new("scripted:2");
        let mut second = first.clone();
        second.open().unwrap();
        assert!(matches!(first.open(), Err(TransportError::Busy(_))));
        second.close().unwrap();
        first.open().unwrap();

        first.disconnect();
        let mut buf = [0u8; 1];
        assert!(matches!(
            first.read_nonblocking(&mut buf),
            Err(TransportError::Disconnected(_))
        ));
        assert_eq!(first.readiness(Interest::READABLE), Interest::ERROR);
    }
}
