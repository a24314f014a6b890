//! Reader and writer pumps between a [`Port`] and the flasher.
//!
//! ```text
//!            inbound (raw chunks)
//!   Port ---- reader pump ----> [sync_channel] ----> Flasher
//!   Port <--- writer pump <---- [sync_channel] <---- Flasher
//!            outbound (whole frames)
//! ```
//!
//! Both queues are bounded. A full queue applies backpressure: the producer
//! waits in [`POLL_TICK`] steps until there is room or the link is cancelled.
//! Chunks are never dropped.

use crate::cancel::{CancellationToken, POLL_TICK};
use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, error, trace};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{
    self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of each queue, in chunks.
pub const QUEUE_CAPACITY: usize = 8000;

/// Largest chunk the reader pump takes from the port at once.
const READ_CHUNK: usize = 1024;

/// How long dropping a link waits for queued frames to reach the port.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// A running pair of pumps over one port.
pub struct Link {
    name: String,
    outbound: Option<SyncSender<Vec<u8>>>,
    inbound: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<Result<()>>>,
    writer: Option<JoinHandle<Result<()>>>,
    in_flight: Arc<AtomicUsize>,
    fault: Option<(io::ErrorKind, String)>,
    cancel: CancellationToken,
}

impl Link {
    /// Start the pumps.
    ///
    /// The port handle is cloned: the clone reads with a [`POLL_TICK`]
    /// timeout so the reader pump observes cancellation, the original keeps
    /// its timeout for writes.
    pub fn spawn(port: Box<dyn Port>, cancel: CancellationToken) -> Result<Self> {
        let name = port.name().to_string();
        let mut rx_port = port.try_clone_port()?;
        rx_port.set_timeout(POLL_TICK)?;

        let (in_tx, in_rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let reader = {
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name("fpgaboot-reader".into())
                .spawn(move || reader_pump(rx_port, &in_tx, &cancel))?
        };
        let writer = {
            let cancel = cancel.clone();
            let in_flight = Arc::clone(&in_flight);
            std::thread::Builder::new()
                .name("fpgaboot-writer".into())
                .spawn(move || writer_pump(port, &out_rx, &in_flight, &cancel))?
        };

        debug!("Link to {name} started");

        Ok(Self {
            name,
            outbound: Some(out_tx),
            inbound: in_rx,
            reader: Some(reader),
            writer: Some(writer),
            in_flight,
            fault: None,
            cancel,
        })
    }

    /// Name of the underlying port.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame for the writer pump.
    pub fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(Error::Cancelled);
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if push(outbound, frame, &self.cancel).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(self.failure());
        }
        Ok(())
    }

    /// Wait up to `wait` for the next inbound chunk.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        match self.inbound.recv_timeout(wait) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => {
                self.ensure_running()?;
                Ok(None)
            },
            Err(RecvTimeoutError::Disconnected) => Err(self.failure()),
        }
    }

    /// Take every chunk already queued without waiting.
    pub fn drain(&mut self) -> Result<Vec<u8>> {
        let mut stale = Vec::new();
        loop {
            match self.inbound.try_recv() {
                Ok(chunk) => stale.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => return Ok(stale),
                Err(TryRecvError::Disconnected) => return Err(self.failure()),
            }
        }
    }

    /// Wait until every queued frame has been written to the port.
    pub fn flush(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.ensure_running()?;
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("writing to {}", self.name)));
            }
            std::thread::sleep(POLL_TICK);
        }
        Ok(())
    }

    /// Flush pending frames, stop both pumps and report a transport fault.
    pub fn shutdown(mut self) -> Result<()> {
        let flushed = self.flush(FLUSH_GRACE);
        self.stop();
        match self.fault.take() {
            Some((kind, message)) => Err(Error::Transport(io::Error::new(kind, message))),
            None => flushed,
        }
    }

    fn ensure_running(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.failure());
        }
        Ok(())
    }

    /// Stop the pumps and turn their outcome into the error to surface.
    fn failure(&mut self) -> Error {
        self.stop();
        match &self.fault {
            Some((kind, message)) => Error::Transport(io::Error::new(*kind, message.clone())),
            None => Error::Cancelled,
        }
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        self.outbound.take();
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            let outcome = handle.join().unwrap_or_else(|_| {
                Err(Error::Transport(io::Error::other("pump thread panicked")))
            });
            if let Err(Error::Transport(err)) = outcome {
                if self.fault.is_none() {
                    error!("Link to {} failed: {err}", self.name);
                    self.fault = Some((err.kind(), err.to_string()));
                }
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            let _ = self.flush(FLUSH_GRACE);
            self.stop();
            debug!("Link to {} stopped", self.name);
        }
    }
}

/// Push onto a bounded queue, waiting for room while not cancelled.
fn push(tx: &SyncSender<Vec<u8>>, chunk: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
    let mut chunk = chunk;
    loop {
        match tx.try_send(chunk) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(back)) => {
                cancel.check()?;
                std::thread::sleep(POLL_TICK);
                chunk = back;
            },
            Err(TrySendError::Disconnected(_)) => return Err(Error::Cancelled),
        }
    }
}

fn reader_pump(
    mut port: Box<dyn Port>,
    tx: &SyncSender<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    while !cancel.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                trace!("<- {n} bytes: {:02x?}", &buf[..n]);
                if push(tx, buf[..n].to_vec(), cancel).is_err() {
                    break;
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                cancel.cancel();
                return Err(Error::Transport(e));
            },
        }
    }
    Ok(())
}

fn writer_pump(
    mut port: Box<dyn Port>,
    rx: &Receiver<Vec<u8>>,
    in_flight: &AtomicUsize,
    cancel: &CancellationToken,
) -> Result<()> {
    while !cancel.is_cancelled() {
        match rx.recv_timeout(POLL_TICK) {
            Ok(frame) => {
                trace!("-> {} bytes: {:02x?}", frame.len(), frame);
                let written = port.write_all(&frame).and_then(|()| port.flush());
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = written {
                    cancel.cancel();
                    return Err(Error::Transport(e));
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
