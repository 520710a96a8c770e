//! Serialized console output.
//!
//! Any thread may print; a single worker drains a bounded queue, runs the
//! formatter chain over each message and writes it framed as
//! `"\r" + text + "> "` so the input prompt is redrawn after every line.

pub mod reader;

use parking_lot::Mutex;
use std::cell::Cell;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::error;

use crate::fault::catch_fault;

/// Messages the queue holds before producers block.
pub const QUEUE_CAPACITY: usize = 50;

pub const PROMPT: &str = "> ";

/// Target of events emitted by the output worker. The console log layer
/// filters it out so the worker never feeds its own queue.
pub(crate) const WORKER_TARGET: &str = "oasis::console::worker";

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a console output worker. Events raised
/// here, formatter logging included, must not be printed back to the console.
pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

/// Upper bound on idle buffers kept for reuse.
const POOL_LIMIT: usize = QUEUE_CAPACITY * 2;

/// Rewrites a message before it reaches the output device.
pub trait Formatter: Send + Sync {
    fn format(&self, text: &str) -> String;
}

impl<F> Formatter for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn format(&self, text: &str) -> String {
        self(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("console output is closed")]
    Closed,
}

struct Shared {
    sender: Mutex<Option<SyncSender<Vec<u8>>>>,
    pool: Mutex<Vec<Vec<u8>>>,
    formatters: Mutex<Vec<Arc<dyn Formatter>>>,
}

impl Shared {
    fn enqueue(&self, payload: &[u8]) -> Result<(), ConsoleError> {
        // Clone the sender so a full queue blocks only this producer.
        let sender = self.sender.lock().clone().ok_or(ConsoleError::Closed)?;

        let mut buffer = self.pool.lock().pop().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(payload);

        sender.send(buffer).map_err(|_| ConsoleError::Closed)
    }

    fn recycle(&self, buffer: Vec<u8>) {
        let mut pool = self.pool.lock();
        if pool.len() < POOL_LIMIT {
            pool.push(buffer);
        }
    }

    fn apply_formatters(&self, text: String) -> String {
        let chain = self.formatters.lock().clone();
        chain.iter().fold(text, |text, formatter| {
            match catch_fault(|| formatter.format(&text)) {
                Ok(formatted) => formatted,
                Err(message) => {
                    error!(target: WORKER_TARGET, "Console formatter panicked: {message}");
                    text
                }
            }
        })
    }
}

/// Handle to the console output pipeline.
pub struct ConsolePrinter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConsolePrinter {
    /// Start the worker writing to `output`.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn start<W>(output: W) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            sender: Mutex::new(Some(sender)),
            pool: Mutex::new(Vec::new()),
            formatters: Mutex::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("console-output".to_string())
            .spawn(move || run_worker(&receiver, &worker_shared, output))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Start the worker writing to standard output.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn stdout() -> io::Result<Self> {
        Self::start(io::stdout())
    }

    /// Queue `text`, blocking while the queue is full.
    ///
    /// # Errors
    /// Returns [`ConsoleError::Closed`] once the pipeline has been stopped.
    pub fn print(&self, text: &str) -> Result<(), ConsoleError> {
        self.shared.enqueue(text.as_bytes())
    }

    /// [`ConsolePrinter::print`] with a trailing newline.
    ///
    /// # Errors
    /// Returns [`ConsoleError::Closed`] once the pipeline has been stopped.
    pub fn println(&self, text: &str) -> Result<(), ConsoleError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.shared.enqueue(line.as_bytes())
    }

    /// Append a formatter to the end of the chain.
    pub fn register_formatter(&self, formatter: Arc<dyn Formatter>) {
        self.shared.formatters.lock().push(formatter);
    }

    pub fn clear_formatters(&self) {
        self.shared.formatters.lock().clear();
    }

    /// `io::Write` handle feeding this pipeline.
    #[must_use]
    pub fn writer(&self) -> ConsoleWriter {
        ConsoleWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.sender.lock().is_none()
    }

    /// Close the queue and wait for the worker to drain it.
    ///
    /// Producers blocked on a full queue still get their message written.
    pub fn stop(&self) {
        drop(self.shared.sender.lock().take());

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!(target: WORKER_TARGET, "Console output worker panicked");
            }
        }
    }
}

impl Drop for ConsolePrinter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<W: Write>(receiver: &Receiver<Vec<u8>>, shared: &Shared, mut output: W) {
    ON_WORKER.with(|flag| flag.set(true));

    // Ends once every sender, including clones held by blocked producers,
    // has been dropped.
    for buffer in receiver {
        let text = shared.apply_formatters(String::from_utf8_lossy(&buffer).into_owned());
        shared.recycle(buffer);

        let written = write!(output, "\r{text}{PROMPT}").and_then(|()| output.flush());
        if let Err(e) = written {
            error!(target: WORKER_TARGET, "Failed to write console output: {e}");
        }
    }
}

/// `io::Write` adapter over a [`ConsolePrinter`]; each `write` call is one
/// message.
#[derive(Clone)]
pub struct ConsoleWriter {
    shared: Arc<Shared>,
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared
            .enqueue(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).map(|_| ())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
