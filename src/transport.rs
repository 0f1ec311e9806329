/// Serial transport to the sniffer.
///
/// A dedicated reader thread drains the port as fast as bytes arrive and
/// pushes them into a fixed-capacity queue. The decoder side pops one byte
/// at a time with a timeout, so serial I/O timing never stalls parsing.
///
/// Closing is idempotent, may happen from any thread, wakes every waiter,
/// and joins the reader before returning.
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use heapless::Deque;

use crate::error::TransportError;

/// Baud rates spoken by the sniffer firmware. The first entry is the
/// current firmware default; the second the legacy one.
pub const SNIFFER_BAUD_RATES: &[u32] = &[1_000_000, 460_800];

/// Capacity of the byte queue between the reader thread and the decoder.
pub const QUEUE_CAPACITY: usize = 16 * 1024;

/// Port read timeout. Bounds how long `close()` waits for the reader.
pub const READ_POLL: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 1024;

/// Reject baud rates outside the allow-list before touching the port.
pub fn check_baud_rate(rate: u32) -> Result<(), TransportError> {
    if SNIFFER_BAUD_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(TransportError::InvalidBaudRate {
            rate,
            allowed: SNIFFER_BAUD_RATES,
        })
    }
}

/// Anything the decoder can pull bytes from.
pub trait ByteSource {
    /// Pop the next byte, waiting up to `timeout` (forever when `None`).
    /// Returns `None` on timeout or once the source is closed.
    fn read_byte(&self, timeout: Option<Duration>) -> Option<u8>;

    /// `false` once the source will never produce another byte.
    fn is_open(&self) -> bool;
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn read_byte(&self, timeout: Option<Duration>) -> Option<u8> {
        (**self).read_byte(timeout)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    fn read_byte(&self, timeout: Option<Duration>) -> Option<u8> {
        (**self).read_byte(timeout)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Read half of a serial link, as seen by the reader thread.
pub trait SerialLink: Read + Send {
    /// Bytes that can be read right now without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

#[cfg(feature = "serial")]
impl SerialLink for Box<dyn serialport::SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

// ── Shared queue ──────────────────────────────────────────────────────

struct QueueState {
    bytes: Deque<u8, QUEUE_CAPACITY>,
    closed: bool,
    overruns: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                bytes: Deque::new(),
                closed: false,
                overruns: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append received bytes; returns how many were dropped for lack of room.
    fn extend(&self, data: &[u8]) -> usize {
        let mut state = self.lock();
        let mut dropped = 0;
        for &byte in data {
            if state.bytes.push_back(byte).is_err() {
                dropped += 1;
            }
        }
        state.overruns += dropped as u64;
        drop(state);
        if dropped < data.len() {
            self.ready.notify_all();
        }
        dropped
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    fn pop(&self, timeout: Option<Duration>) -> Option<u8> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(byte) = state.bytes.pop_front() {
                return Some(byte);
            }
            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────

/// An open connection to a sniffer.
pub struct Transport {
    port: String,
    shared: Arc<Shared>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Open `port` at `baud_rate` with hardware flow control.
    ///
    /// The baud rate is validated before the port is touched.
    #[cfg(feature = "serial")]
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        check_baud_rate(baud_rate)?;
        log::info!("Opening serial port {} at {} baud", port, baud_rate);

        let open_err = |e: serialport::Error| TransportError::Open {
            port: port.to_string(),
            message: e.to_string(),
        };

        let serial = serialport::new(port, baud_rate)
            .flow_control(serialport::FlowControl::Hardware)
            .timeout(READ_POLL)
            .open()
            .map_err(open_err)?;
        if let Err(e) = serial.clear(serialport::ClearBuffer::Input) {
            log::warn!("Could not flush input buffer of {}: {}", port, e);
        }
        let reader = serial.try_clone().map_err(open_err)?;

        Self::from_link(port, reader, Box::new(serial))
    }

    /// Start a transport over an already-open link.
    pub fn from_link<L>(
        port: &str,
        link: L,
        writer: Box<dyn Write + Send>,
    ) -> Result<Self, TransportError>
    where
        L: SerialLink + 'static,
    {
        let shared = Arc::new(Shared::new());
        let worker_shared = Arc::clone(&shared);
        let worker_port = port.to_string();
        let handle = thread::Builder::new()
            .name(format!("uart-{port}"))
            .spawn(move || read_loop(link, &worker_shared, &worker_port))
            .map_err(|e| TransportError::Io {
                port: port.to_string(),
                source: e,
            })?;

        Ok(Self {
            port: port.to_string(),
            shared,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Total bytes dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.shared.lock().overruns
    }

    /// Write raw bytes. A write timeout is logged and ignored; any other
    /// I/O error closes the transport and is returned. Once the reader has
    /// stopped, the port is released and every write reports `Closed`.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.is_closed() {
            guard.take();
        }
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed {
                port: self.port.clone(),
            });
        };

        let result = writer.write_all(bytes).and_then(|()| writer.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                log::warn!("Write timeout on {}, ignoring", self.port);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.close();
                Err(TransportError::Io {
                    port: self.port.clone(),
                    source: e,
                })
            }
        }
    }

    /// Stop the reader thread and release the port. Safe to call more than
    /// once and from any thread.
    pub fn close(&self) {
        self.shared.close();
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            log::info!("Closing serial port {}", self.port);
            if handle.join().is_err() {
                log::error!("Reader thread for {} panicked", self.port);
            }
            let overruns = self.overruns();
            if overruns > 0 {
                log::warn!("{} bytes dropped on {} (receive queue full)", overruns, self.port);
            }
        }
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl ByteSource for Transport {
    fn read_byte(&self, timeout: Option<Duration>) -> Option<u8> {
        self.shared.pop(timeout)
    }

    fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread body: read whatever is buffered, or block for one byte.
fn read_loop<L: SerialLink>(mut link: L, shared: &Shared, port: &str) {
    let mut buf = [0u8; READ_CHUNK];
    let mut overrun_reported = false;

    while !shared.is_closed() {
        let want = match link.bytes_available() {
            Ok(0) | Err(_) => 1,
            Ok(n) => n.min(READ_CHUNK),
        };

        match link.read(&mut buf[..want]) {
            Ok(0) => {
                log::info!("Serial port {} reached end of stream", port);
                break;
            }
            Ok(n) => {
                let dropped = shared.extend(&buf[..n]);
                if dropped > 0 && !overrun_reported {
                    log::warn!("Read queue full on {}, dropping {} bytes", port, dropped);
                    overrun_reported = true;
                } else if dropped == 0 {
                    overrun_reported = false;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                log::warn!("Unable to read {}: {}", port, e);
                break;
            }
        }
    }

    shared.close();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted link: yields queued chunks, then times out (or fails).
    pub(crate) struct ScriptedLink {
        chunks: VecDeque<Vec<u8>>,
        fail_when_drained: bool,
    }

    impl ScriptedLink {
        pub(crate) fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                fail_when_drained: false,
            }
        }

        pub(crate) fn failing(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                fail_when_drained: true,
            }
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None if self.fail_when_drained => {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
                }
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
            }
        }
    }

    impl SerialLink for ScriptedLink {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.chunks.front().map_or(0, Vec::len))
        }
    }

    /// Writer capturing everything into a shared buffer.
    #[derive(Clone, Default)]
    pub(crate) struct SharedWriter(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter(io::ErrorKind);

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(self.0, "write failed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn transport(link: ScriptedLink) -> Transport {
        Transport::from_link("test", link, Box::new(SharedWriter::default())).unwrap()
    }

    // ── Baud rate validation ────────────────────────────────────────

    #[test]
    fn accepts_allowed_baud_rates() {
        assert!(check_baud_rate(1_000_000).is_ok());
        assert!(check_baud_rate(460_800).is_ok());
    }

    #[test]
    fn rejects_other_baud_rates() {
        let err = check_baud_rate(115_200).unwrap_err();
        assert!(matches!(err, TransportError::InvalidBaudRate { rate: 115_200, .. }));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn open_with_bad_baud_rate_never_touches_port() {
        let err = Transport::open("/dev/does-not-exist", 9600).err().unwrap();
        assert!(matches!(err, TransportError::InvalidBaudRate { .. }));
    }

    // ── Reading ─────────────────────────────────────────────────────

    #[test]
    fn bytes_arrive_in_order() {
        let t = transport(ScriptedLink::new(vec![vec![1, 2, 3], vec![4]]));
        let got: Vec<u8> = (0..4)
            .filter_map(|_| t.read_byte(Some(Duration::from_secs(1))))
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert!(t.is_open());
    }

    #[test]
    fn read_times_out_when_idle() {
        let t = transport(ScriptedLink::new(vec![]));
        let start = Instant::now();
        assert_eq!(t.read_byte(Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(t.is_open());
    }

    #[test]
    fn device_error_closes_transport() {
        let t = transport(ScriptedLink::failing(vec![vec![9]]));
        // Queued byte may or may not be observed before the loop dies;
        // afterwards every read reports closed.
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!t.is_open());
        assert_eq!(t.read_byte(None), None);
    }

    #[test]
    fn device_error_releases_writer() {
        let out = SharedWriter::default();
        let t = Transport::from_link("test", ScriptedLink::failing(vec![]), Box::new(out.clone()))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!t.is_open());
        assert!(matches!(t.write(&[1]), Err(TransportError::Closed { .. })));
        assert_eq!(Arc::strong_count(&out.0), 1);
        assert!(out.0.lock().unwrap().is_empty());
    }

    // ── Closing ─────────────────────────────────────────────────────

    #[test]
    fn close_unblocks_waiting_reader() {
        let t = Arc::new(transport(ScriptedLink::new(vec![])));
        let waiter = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.read_byte(None))
        };
        thread::sleep(Duration::from_millis(20));
        t.close();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let t = transport(ScriptedLink::new(vec![vec![1, 2, 3]]));
        t.close();
        t.close();
        assert!(!t.is_open());
        assert_eq!(t.read_byte(Some(Duration::from_millis(10))), None);
        assert!(matches!(t.write(&[0]), Err(TransportError::Closed { .. })));
    }

    // ── Writing ─────────────────────────────────────────────────────

    #[test]
    fn write_reaches_link() {
        let out = SharedWriter::default();
        let t = Transport::from_link("test", ScriptedLink::new(vec![]), Box::new(out.clone()))
            .unwrap();
        t.write(&[0xAB, 0xBC]).unwrap();
        assert_eq!(*out.0.lock().unwrap(), vec![0xAB, 0xBC]);
    }

    #[test]
    fn write_timeout_is_ignored() {
        let t = Transport::from_link(
            "test",
            ScriptedLink::new(vec![]),
            Box::new(FailingWriter(io::ErrorKind::TimedOut)),
        )
        .unwrap();
        assert!(t.write(&[1]).is_ok());
        assert!(t.is_open());
    }

    #[test]
    fn hard_write_error_closes_transport() {
        let t = Transport::from_link(
            "test",
            ScriptedLink::new(vec![]),
            Box::new(FailingWriter(io::ErrorKind::BrokenPipe)),
        )
        .unwrap();
        assert!(matches!(t.write(&[1]), Err(TransportError::Io { .. })));
        assert!(!t.is_open());
    }

    // ── Queue bounds ────────────────────────────────────────────────

    #[test]
    fn full_queue_drops_and_counts_overruns() {
        let shared = Shared::new();
        let data = vec![0u8; QUEUE_CAPACITY + 10];
        assert_eq!(shared.extend(&data), 10);
        assert_eq!(shared.lock().overruns, 10);
        assert_eq!(shared.pop(Some(Duration::ZERO)), Some(0));
    }

    #[test]
    fn unread_bytes_beyond_capacity_are_counted() {
        let t = transport(ScriptedLink::new(vec![vec![0x5A; QUEUE_CAPACITY + 10]]));
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.overruns() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(t.overruns(), 10);
        t.close();
        assert_eq!(t.overruns(), 10);
    }
}
