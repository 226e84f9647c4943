//! Stand-in photon counter for dry runs and end-to-end tests.
//!
//! Serves the start/query/stop protocol on a local TCP port from a
//! background thread, one client at a time.

use crate::acquisition::{ACK, COUNT_SIZE, SAMPLE_QUERY, START_DELIMITER, STOP_COMMAND};
use crate::actuator::SimulatedStage;
use crate::angular::SimulatedMotorBoard;
use crate::error::ScanError;
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Produces the count for the `n`-th sample query. `None` makes the server
/// send a truncated reply and hang up.
pub type CountSource = Box<dyn FnMut(u64) -> Option<u32> + Send>;

pub struct CounterServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    bin_width: Arc<AtomicU32>,
    handle: Option<JoinHandle<Result<(), ScanError>>>,
}

impl CounterServer {
    /// Bind an ephemeral port on localhost and start serving
    pub fn spawn(source: CountSource) -> Result<Self, ScanError> {
        Self::bind("127.0.0.1:0", source)
    }

    pub fn bind(addr: &str, mut source: CountSource) -> Result<Self, ScanError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| ScanError::io(e, format!("Binding counter server to {}", addr)))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let bin_width = Arc::new(AtomicU32::new(0));
        let shutdown_clone = shutdown.clone();
        let bin_width_clone = bin_width.clone();

        let handle = thread::spawn(move || -> Result<(), ScanError> {
            info!("Simulated counter listening on {}", addr);
            let mut served = 0u64;

            while !shutdown_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("Simulated counter accepted {}", peer);
                        let mut session = Session {
                            stream,
                            shutdown: &shutdown_clone,
                            bin_width: &bin_width_clone,
                            source: &mut source,
                            served: &mut served,
                        };
                        if let Err(e) = session.serve() {
                            warn!("Simulated counter session ended: {}", e);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                    Err(e) => return Err(ScanError::io(e, "Accepting counter client")),
                }
            }
            Ok(())
        });

        Ok(Self {
            addr,
            shutdown,
            bin_width,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bin width from the most recent start frame
    pub fn bin_width(&self) -> u32 {
        self.bin_width.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) -> Result<(), ScanError> {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                ScanError::InvalidState("Counter server thread panicked".to_string())
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for CounterServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct Session<'a> {
    stream: TcpStream,
    shutdown: &'a AtomicBool,
    bin_width: &'a AtomicU32,
    source: &'a mut CountSource,
    served: &'a mut u64,
}

impl Session<'_> {
    fn serve(&mut self) -> Result<(), ScanError> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(POLL_INTERVAL * 10))?;

        while let Some(command) = self.read_byte()? {
            match command {
                START_DELIMITER => {
                    let mut digits = String::new();
                    while let Some(byte) = self.read_byte()? {
                        if byte == START_DELIMITER {
                            break;
                        }
                        digits.push(byte as char);
                    }
                    let width = digits.trim().parse::<u32>().map_err(|_| {
                        ScanError::Protocol(format!("Invalid bin width '{}'", digits))
                    })?;
                    self.bin_width.store(width, Ordering::Relaxed);
                    self.stream.write_all(ACK)?;
                }
                SAMPLE_QUERY => {
                    let index = *self.served;
                    *self.served += 1;
                    match (*self.source)(index) {
                        Some(count) => self.stream.write_all(&count.to_be_bytes())?,
                        None => {
                            self.stream.write_all(&[0u8; COUNT_SIZE - 1])?;
                            return Ok(());
                        }
                    }
                }
                STOP_COMMAND => self.stream.write_all(ACK)?,
                other => debug!("Simulated counter ignoring byte {:#04x}", other),
            }
        }
        Ok(())
    }

    /// Next byte, `None` on hang-up or shutdown
    fn read_byte(&mut self) -> Result<Option<u8>, ScanError> {
        let mut byte = [0u8; 1];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.stream.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(ScanError::io(e, "Reading counter command")),
            }
        }
    }
}

/// Count source that images a Gaussian spot centred on the stage origin.
///
/// The count depends on where the simulated stage currently is, so a scan
/// against it produces a recognisable picture.
pub fn gaussian_spot(stage: SimulatedStage, sigma_steps: f64, peak: u32, background: u32) -> CountSource {
    Box::new(move |_| {
        let (x, y) = stage.position();
        let r2 = (x * x + y * y) as f64;
        let signal = peak as f64 * (-r2 / (2.0 * sigma_steps * sigma_steps)).exp();
        Some(background + signal.round() as u32)
    })
}

/// Count source behind a polariser on a simulated motor: Malus's law over
/// the motor's step position, brightest at zero.
pub fn malus_law(
    board: SimulatedMotorBoard,
    motor: u8,
    steps_per_rev: u32,
    peak: u32,
    background: u32,
) -> CountSource {
    let steps_per_rev = steps_per_rev.max(1) as i64;
    Box::new(move |_| {
        let steps = board.position(motor).rem_euclid(steps_per_rev);
        let angle = (steps as f64 / steps_per_rev as f64) * std::f64::consts::TAU;
        let signal = peak as f64 * angle.cos().powi(2);
        Some(background + signal.round() as u32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionClient;

    #[test]
    fn test_protocol_round_trip_over_socket() {
        let mut server = CounterServer::spawn(Box::new(|n| Some(n as u32 * 10))).unwrap();
        let mut client = AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
        client.connect().unwrap();
        client.connect().unwrap();

        client.arm(250, Duration::ZERO).unwrap();
        assert_eq!(client.sample().unwrap(), 0);
        assert_eq!(client.sample().unwrap(), 10);
        assert_eq!(client.sample().unwrap(), 20);
        client.disarm();
        assert_eq!(server.bin_width(), 250);

        client.close();
        server.stop().unwrap();
    }

    #[test]
    fn test_truncated_reply_breaks_connection() {
        let server = CounterServer::spawn(Box::new(|n| if n == 0 { Some(7) } else { None })).unwrap();
        let port = server.addr().port();

        let mut client = AcquisitionClient::new("127.0.0.1", port).unwrap();
        client.connect().unwrap();
        client.arm(10, Duration::ZERO).unwrap();
        assert_eq!(client.sample().unwrap(), 7);
        assert!(matches!(
            client.sample(),
            Err(ScanError::ConnectionBroken { received: 3, .. })
        ));
    }

    #[test]
    fn test_gaussian_spot_peaks_at_origin() {
        let stage = SimulatedStage::new();
        let mut source = gaussian_spot(stage, 5.0, 1000, 10);
        assert_eq!(source(0), Some(1010));
    }

    #[test]
    fn test_malus_law_follows_motor_position() {
        use crate::angular::MotorBoard;
        use crate::types::RotationDirection;

        let mut board = SimulatedMotorBoard::new();
        let mut source = malus_law(board.clone(), 4, 200, 1000, 20);
        assert_eq!(source(0), Some(1020));
        board.move_steps(4, 1, RotationDirection::Clockwise, 50).unwrap();
        assert_eq!(source(1), Some(20));
        board.move_steps(4, 1, RotationDirection::Clockwise, 25).unwrap();
        assert_eq!(source(2), Some(520));
    }
}
