//! Client for the photon counter's start/query/stop socket protocol.
//!
//! Wire format (ASCII command bytes, fixed-length binary replies):
//! - start: `M<bin width in ms>M`, answered by an opaque acknowledgement
//! - sample: `D`, answered by exactly four bytes, a big-endian `u32` count
//! - stop: `S`, answered by an opaque acknowledgement
//!
//! There is no framing beyond the fixed lengths, so the four count bytes are
//! accumulated across short reads.

use crate::error::ScanError;
use crate::utils::dwell;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub const START_DELIMITER: u8 = b'M';
pub const SAMPLE_QUERY: u8 = b'D';
pub const STOP_COMMAND: u8 = b'S';
/// Size of a count reply
pub const COUNT_SIZE: usize = 4;
/// Acknowledgement of a start or stop frame
pub const ACK_SIZE: usize = 2;
pub const ACK: &[u8; ACK_SIZE] = b"OK";

/// Timeouts for the acquisition socket.
///
/// ```
/// use std::time::Duration;
/// use rusty_raster::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     read_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for a single read; bounds how long a sample may take
    pub read_timeout: Duration,
    /// Timeout for writing a command
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Protocol state of the instrument link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Disconnected,
    Connected,
    Armed,
    Sampling,
    Disarmed,
}

/// Builder for [`AcquisitionClient`] over TCP.
///
/// ```no_run
/// use rusty_raster::AcquisitionClient;
///
/// let mut client = AcquisitionClient::builder()
///     .address("192.168.236.2")
///     .port(65053)
///     .build()?;
/// client.connect()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct AcquisitionClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl AcquisitionClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Resolve the address. The socket is opened by [`AcquisitionClient::connect`].
    pub fn build(self) -> Result<AcquisitionClient<TcpStream>, ScanError> {
        let address = self
            .address
            .ok_or_else(|| ScanError::InvalidAddress("Address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| ScanError::InvalidAddress("Port must be specified".to_string()))?;

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| ScanError::InvalidAddress(format!("{address}:{port}")))?;

        Ok(AcquisitionClient {
            address: Some(socket_addr),
            config: self.config,
            stream: None,
            state: AcquisitionState::Disconnected,
        })
    }
}

pub struct AcquisitionClient<S = TcpStream> {
    address: Option<SocketAddr>,
    config: ConnectionConfig,
    stream: Option<S>,
    state: AcquisitionState,
}

impl AcquisitionClient<TcpStream> {
    pub fn builder() -> AcquisitionClientBuilder {
        AcquisitionClientBuilder::default()
    }

    /// Client for `host:port` with default timeouts, not yet connected
    pub fn new(host: &str, port: u16) -> Result<Self, ScanError> {
        Self::builder().address(host).port(port).build()
    }

    /// Open the socket. Calling this while connected does nothing.
    pub fn connect(&mut self) -> Result<(), ScanError> {
        if self.stream.is_some() {
            debug!("Acquisition link already connected");
            return Ok(());
        }
        let address = self
            .address
            .ok_or_else(|| ScanError::InvalidAddress("No address configured".to_string()))?;

        debug!("Connecting to acquisition server at {address}");
        let stream =
            TcpStream::connect_timeout(&address, self.config.connect_timeout).map_err(|e| {
                warn!("Failed to connect to {address}: {e}");
                if e.kind() == ErrorKind::TimedOut {
                    ScanError::Timeout(format!("Connecting to {address}"))
                } else {
                    ScanError::io(e, format!("Failed to connect to {address}"))
                }
            })?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        info!("Connected to acquisition server at {address}");
        self.stream = Some(stream);
        self.state = AcquisitionState::Connected;
        Ok(())
    }
}

impl<S: Read + Write> AcquisitionClient<S> {
    /// Wrap an already open byte channel
    pub fn from_stream(stream: S) -> Self {
        Self {
            address: None,
            config: ConnectionConfig::default(),
            stream: Some(stream),
            state: AcquisitionState::Connected,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Underlying byte channel, if connected
    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Send the start frame, wait for its acknowledgement, then block for
    /// `settle` so the instrument's buffer reaches steady state.
    pub fn arm(&mut self, bin_width_millis: u32, settle: Duration) -> Result<(), ScanError> {
        match self.state {
            AcquisitionState::Connected | AcquisitionState::Disarmed => {}
            other => {
                return Err(ScanError::InvalidState(format!(
                    "Cannot arm acquisition while {:?}",
                    other
                )));
            }
        }

        let frame = start_frame(bin_width_millis);
        debug!("Arming with bin width {} ms", bin_width_millis);
        self.send(&frame, "start frame")?;
        let ack = self.read_ack()?;
        debug!("Start acknowledged: {:?}", String::from_utf8_lossy(&ack));

        self.state = AcquisitionState::Armed;
        dwell(settle);
        Ok(())
    }

    /// Query one count. A short or broken reply fails this sample only.
    pub fn sample(&mut self) -> Result<u32, ScanError> {
        if self.state != AcquisitionState::Armed {
            return Err(ScanError::InvalidState(format!(
                "Cannot sample while {:?}",
                self.state
            )));
        }

        self.state = AcquisitionState::Sampling;
        let result = self
            .send(&[SAMPLE_QUERY], "sample query")
            .and_then(|()| self.read_count());
        self.state = AcquisitionState::Armed;

        let count = result?;
        debug!("Sample count: {}", count);
        Ok(count)
    }

    /// Send the stop frame and read its acknowledgement.
    ///
    /// The measurement window is ending anyway, so failures are logged and
    /// the link is considered disarmed regardless.
    pub fn disarm(&mut self) {
        if !matches!(
            self.state,
            AcquisitionState::Armed | AcquisitionState::Sampling
        ) {
            debug!("Disarm skipped, acquisition is {:?}", self.state);
            return;
        }

        let result = self
            .send(&[STOP_COMMAND], "stop frame")
            .and_then(|()| self.read_ack());
        match result {
            Ok(ack) => debug!("Stop acknowledged: {:?}", String::from_utf8_lossy(&ack)),
            Err(e) => warn!("Failed to disarm acquisition: {}", e),
        }
        self.state = AcquisitionState::Disarmed;
    }

    /// Drop the byte channel
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Acquisition link closed");
        }
        self.state = AcquisitionState::Disconnected;
    }

    fn stream(&mut self) -> Result<&mut S, ScanError> {
        self.stream
            .as_mut()
            .ok_or_else(|| ScanError::InvalidState("Acquisition link is not connected".to_string()))
    }

    fn send(&mut self, bytes: &[u8], what: &str) -> Result<(), ScanError> {
        debug!("Sending {}: {:?}", what, String::from_utf8_lossy(bytes));
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .and_then(|()| stream.flush())
            .map_err(|e| ScanError::io(e, format!("Writing {}", what)))
    }

    /// Read the two-byte acknowledgement exactly, so nothing of it is left
    /// behind to be mistaken for a count
    fn read_ack(&mut self) -> Result<Vec<u8>, ScanError> {
        let mut buf = [0u8; ACK_SIZE];
        self.read_reply(&mut buf, "acknowledgement")?;
        if &buf != ACK {
            warn!(
                "Unexpected acknowledgement {:?}",
                String::from_utf8_lossy(&buf)
            );
        }
        Ok(buf.to_vec())
    }

    fn read_count(&mut self) -> Result<u32, ScanError> {
        let mut buf = [0u8; COUNT_SIZE];
        self.read_reply(&mut buf, "count reply")?;
        Ok(BigEndian::read_u32(&buf))
    }

    /// Fill `buf` completely, accumulating short reads
    fn read_reply(&mut self, buf: &mut [u8], what: &str) -> Result<(), ScanError> {
        let stream = self.stream()?;
        let mut received = 0;

        while received < buf.len() {
            match stream.read(&mut buf[received..]) {
                Ok(0) => {
                    warn!(
                        "{} truncated after {} of {} bytes",
                        what,
                        received,
                        buf.len()
                    );
                    return Err(ScanError::ConnectionBroken {
                        expected: buf.len(),
                        received,
                    });
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_read_error(e, what)),
            }
        }
        Ok(())
    }
}

fn map_read_error(e: std::io::Error, what: &str) -> ScanError {
    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
        ScanError::Timeout(format!("Waiting for {}", what))
    } else {
        ScanError::io(e, format!("Reading {}", what))
    }
}

/// `M<digits>M`
pub fn start_frame(bin_width_millis: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.push(START_DELIMITER);
    frame.extend_from_slice(bin_width_millis.to_string().as_bytes());
    frame.push(START_DELIMITER);
    frame
}
