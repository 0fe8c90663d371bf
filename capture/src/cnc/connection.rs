use std::{sync::Arc, time::Duration};

use tokio::{
    io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    time::{sleep, timeout, Instant},
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};
use common::grbl::MachineStatus;
use tracing::{debug, trace, warn};

use crate::error::{RigError, RigResult};

/// Silence that marks the end of the boot chatter.
const SETTLE_QUIET: Duration = Duration::from_millis(50);

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Callbacks for raw traffic on the link; should only include minimal logic!
pub trait LinkObserver: Send + Sync {
    fn after_send(&self, _bytes: &[u8]) {}
    fn after_receive(&self, _line: &str) {}
    fn warn(&self, _message: &str) {}
    fn after_status(&self, _status: MachineStatus, _raw: &str) {}
}

pub struct TracingObserver;
impl LinkObserver for TracingObserver {
    fn after_send(&self, bytes: &[u8]) {
        trace!("> {}", bytes.escape_ascii());
    }
    fn after_receive(&self, line: &str) {
        trace!("< {}", line);
    }
    fn warn(&self, message: &str) {
        warn!("{}", message);
    }
}

/// Line-oriented transport to the controller.
pub struct SerialLink {
    lines: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    observer: Arc<dyn LinkObserver>,
    closed: bool,
}

impl SerialLink {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        SerialLink {
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
            observer: Arc::new(TracingObserver),
            closed: false,
        }
    }
    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = observer;
        self
    }
    pub fn set_observer(&mut self, observer: Arc<dyn LinkObserver>) {
        self.observer = observer;
    }
    pub fn observer(&self) -> &Arc<dyn LinkObserver> {
        &self.observer
    }
    /// Opens an 8N1 port. The controller still needs a settling delay afterwards.
    pub fn open(path: &str, baud_rate: u32) -> RigResult<Self> {
        let mut port = tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(30))
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| RigError::connection(path, e))?;
        // Some boards (Arduino-like) reset on DTR; others ignore it.
        if let Err(e) = port.write_data_terminal_ready(true) {
            debug!("could not raise DTR on {}: {}", path, e);
        }
        let (reader, writer) = split(port);
        debug!("opened {} at {} baud", path, baud_rate);
        Ok(SerialLink::new(reader, writer))
    }
    pub async fn write(&mut self, bytes: &[u8]) -> RigResult<()> {
        if self.closed {
            return Err(RigError::Transport("link already closed".into()));
        }
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| RigError::Transport(format!("write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| RigError::Transport(format!("flush failed: {}", e)))?;
        self.observer.after_send(bytes);
        Ok(())
    }
    /// Writes a line command terminated by CRLF.
    pub async fn write_command(&mut self, command: &str) -> RigResult<()> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.write(&bytes).await
    }
    /// Next complete line, or `None` if nothing arrived within `wait`.
    pub async fn read_line(&mut self, wait: Duration) -> RigResult<Option<String>> {
        if self.closed {
            return Err(RigError::Transport("link already closed".into()));
        }
        match timeout(wait, self.lines.next_line()).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(Some(line))) => {
                let line = line.trim_end_matches('\r').to_string();
                self.observer.after_receive(&line);
                Ok(Some(line))
            }
            Ok(Ok(None)) => {
                self.closed = true;
                Err(RigError::Transport("controller closed the connection".into()))
            }
            Ok(Err(e)) => Err(RigError::Transport(format!("read failed: {}", e))),
        }
    }
    /// Discards lines until the link has been quiet for `quiet`, or until `limit` has passed
    /// in total. Returns how many were dropped.
    pub async fn flush_input(&mut self, quiet: Duration, limit: Duration) -> RigResult<usize> {
        let deadline = Instant::now() + limit;
        let mut dropped = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("controller still talking after {:?}, stopped draining", limit);
                break;
            }
            match self.read_line(quiet.min(remaining)).await? {
                Some(line) => {
                    debug!("discarding stale line {:?}", line);
                    dropped += 1;
                }
                None => break,
            }
        }
        Ok(dropped)
    }
    /// Wakes the controller and throws away whatever it said while booting.
    pub async fn settle(&mut self, delay: Duration) -> RigResult<()> {
        self.write(b"\r\n\r\n").await?;
        sleep(delay).await;
        let dropped = self.flush_input(SETTLE_QUIET, delay + SETTLE_QUIET).await?;
        debug!("link settled, {} stale lines dropped", dropped);
        Ok(())
    }
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.writer.shutdown().await {
                debug!("error while closing link: {}", e);
            }
        }
    }
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
