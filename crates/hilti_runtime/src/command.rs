//! Serialized side effects.
//!
//! Output produced by many workers at once (file writes, flushes, arbitrary
//! closures) is funnelled through one FIFO and performed by a single
//! consumer thread, one command at a time. A single-threaded runtime runs
//! each command inline on the producer instead.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::threads::RuntimeMetrics;

/// Output target owned by the command consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl SinkId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

pub type CommandFn = Box<dyn FnOnce() + Send + 'static>;

pub enum Command {
    Open {
        sink: SinkId,
        writer: Box<dyn Write + Send>,
    },
    Write {
        sink: SinkId,
        data: Vec<u8>,
    },
    Flush {
        sink: SinkId,
    },
    Close {
        sink: SinkId,
    },
    Run(CommandFn),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { sink, .. } => f.debug_struct("Open").field("sink", sink).finish(),
            Self::Write { sink, data } => f
                .debug_struct("Write")
                .field("sink", sink)
                .field("len", &data.len())
                .finish(),
            Self::Flush { sink } => f.debug_struct("Flush").field("sink", sink).finish(),
            Self::Close { sink } => f.debug_struct("Close").field("sink", sink).finish(),
            Self::Run(_) => f.write_str("Run(..)"),
        }
    }
}

enum Envelope {
    Command(Command),
    Shutdown,
}

/// Performs commands. Lives on the consumer thread, or behind a lock when
/// commands run inline.
struct CommandExecutor {
    sinks: HashMap<SinkId, Box<dyn Write + Send>>,
    metrics: Arc<RuntimeMetrics>,
}

impl CommandExecutor {
    fn new(metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            sinks: HashMap::new(),
            metrics,
        }
    }

    fn execute(&mut self, command: Command) {
        let label = format!("{command:?}");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.apply(command)));
        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(command = %label, error = %err, "command failed");
                false
            }
            Err(_) => {
                warn!(command = %label, "command panicked");
                false
            }
        };
        self.metrics.record_command(ok);
    }

    fn apply(&mut self, command: Command) -> io::Result<()> {
        match command {
            Command::Open { sink, writer } => {
                self.sinks.insert(sink, writer);
                Ok(())
            }
            Command::Write { sink, data } => self.sink(sink)?.write_all(&data),
            Command::Flush { sink } => self.sink(sink)?.flush(),
            Command::Close { sink } => match self.sinks.remove(&sink) {
                Some(mut writer) => writer.flush(),
                None => Err(unknown_sink(sink)),
            },
            Command::Run(func) => {
                func();
                Ok(())
            }
        }
    }

    fn sink(&mut self, sink: SinkId) -> io::Result<&mut Box<dyn Write + Send>> {
        self.sinks.get_mut(&sink).ok_or_else(|| unknown_sink(sink))
    }

    fn close_all(&mut self) {
        for (sink, mut writer) in self.sinks.drain() {
            if let Err(err) = writer.flush() {
                warn!(sink = sink.0, error = %err, "flushing sink on shutdown failed");
            }
        }
    }
}

fn unknown_sink(sink: SinkId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown sink {}", sink.0))
}

/// Inline execution state. Commands pushed while another inline command runs
/// (from inside a `Run` closure) are queued and drained by the outermost push.
struct InlineDispatch {
    executor: Mutex<CommandExecutor>,
    pending: Mutex<InlinePending>,
}

#[derive(Default)]
struct InlinePending {
    commands: VecDeque<Command>,
    draining: bool,
}

impl InlineDispatch {
    fn push(&self, command: Command) {
        {
            let mut pending = self.pending.lock();
            pending.commands.push_back(command);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let next = {
                let mut pending = self.pending.lock();
                match pending.commands.pop_front() {
                    Some(command) => command,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };
            self.executor.lock().execute(next);
        }
    }
}

enum Dispatch {
    Inline(InlineDispatch),
    Threaded {
        sender: Sender<Envelope>,
        consumer: Mutex<Option<JoinHandle<()>>>,
    },
}

struct QueueInner {
    dispatch: Dispatch,
    next_sink: AtomicU64,
    closed: AtomicBool,
    metrics: Arc<RuntimeMetrics>,
}

impl QueueInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.dispatch {
            Dispatch::Inline(inline) => inline.executor.lock().close_all(),
            Dispatch::Threaded { sender, consumer } => {
                let _ = sender.send(Envelope::Shutdown);
                if let Some(handle) = consumer.lock().take() {
                    if handle.join().is_err() {
                        warn!("command consumer thread panicked");
                    }
                }
            }
        }
        debug!("command queue shut down");
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the global command FIFO. Clones share the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    /// Starts the dedicated consumer thread.
    pub fn threaded(metrics: Arc<RuntimeMetrics>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let executor = CommandExecutor::new(Arc::clone(&metrics));
        let handle = thread::Builder::new()
            .name("hilti-cmdqueue".into())
            .spawn(move || consume(&receiver, executor))
            .map_err(|err| {
                RuntimeError::OutOfMemory(format!("failed to spawn command consumer: {err}"))
            })?;

        Ok(Self::from_dispatch(
            Dispatch::Threaded {
                sender,
                consumer: Mutex::new(Some(handle)),
            },
            metrics,
        ))
    }

    /// Executes every command on the pushing thread.
    pub fn inline(metrics: Arc<RuntimeMetrics>) -> Self {
        let executor = CommandExecutor::new(Arc::clone(&metrics));
        let inline = InlineDispatch {
            executor: Mutex::new(executor),
            pending: Mutex::new(InlinePending::default()),
        };
        Self::from_dispatch(Dispatch::Inline(inline), metrics)
    }

    fn from_dispatch(dispatch: Dispatch, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                dispatch,
                next_sink: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.inner.dispatch, Dispatch::Threaded { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, command: Command) {
        if self.is_closed() {
            debug!(?command, "command pushed after shutdown, dropping");
            self.inner.metrics.record_command(false);
            return;
        }
        match &self.inner.dispatch {
            Dispatch::Inline(inline) => inline.push(command),
            Dispatch::Threaded { sender, .. } => {
                if sender.send(Envelope::Command(command)).is_err() {
                    self.inner.metrics.record_command(false);
                }
            }
        }
    }

    pub fn run<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Command::Run(Box::new(func)));
    }

    /// Registers `writer` with the consumer and returns its id.
    pub fn open_sink(&self, writer: Box<dyn Write + Send>) -> SinkId {
        let sink = SinkId(self.inner.next_sink.fetch_add(1, Ordering::Relaxed));
        self.push(Command::Open { sink, writer });
        sink
    }

    pub fn write(&self, sink: SinkId, data: impl Into<Vec<u8>>) {
        self.push(Command::Write {
            sink,
            data: data.into(),
        });
    }

    pub fn flush(&self, sink: SinkId) {
        self.push(Command::Flush { sink });
    }

    pub fn close(&self, sink: SinkId) {
        self.push(Command::Close { sink });
    }

    /// Runs every command queued so far, then stops the consumer. Later
    /// pushes are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("threaded", &self.is_threaded())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn consume(receiver: &Receiver<Envelope>, mut executor: CommandExecutor) {
    debug!("command consumer started");
    while let Ok(envelope) = receiver.recv() {
        match envelope {
            Envelope::Command(command) => executor.execute(command),
            Envelope::Shutdown => break,
        }
    }
    executor.close_all();
    debug!("command consumer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer whose contents stay observable after it moves into the queue.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn inline_queue_executes_on_push() {
        let metrics = RuntimeMetrics::new();
        let queue = CommandQueue::inline(Arc::clone(&metrics));
        let buffer = SharedBuffer::default();
        let sink = queue.open_sink(Box::new(buffer.clone()));
        queue.write(sink, "hello");
        assert_eq!(buffer.0.lock().as_slice(), b"hello");
        assert!(!queue.is_threaded());
        assert_eq!(metrics.snapshot().commands_executed, 2);
    }

    #[test]
    fn inline_commands_may_push_to_their_own_queue() {
        let metrics = RuntimeMetrics::new();
        let queue = CommandQueue::inline(Arc::clone(&metrics));
        let order = Arc::new(Mutex::new(Vec::new()));

        let nested_queue = queue.clone();
        let outer = Arc::clone(&order);
        queue.run(move || {
            outer.lock().push("outer");
            let inner = Arc::clone(&outer);
            nested_queue.run(move || inner.lock().push("nested"));
            outer.lock().push("outer done");
        });
        let last = Arc::clone(&order);
        queue.run(move || last.lock().push("next"));

        assert_eq!(*order.lock(), vec!["outer", "outer done", "nested", "next"]);
        assert_eq!(metrics.snapshot().commands_executed, 3);
    }

    #[test]
    fn threaded_queue_drains_before_shutdown() {
        let metrics = RuntimeMetrics::new();
        let queue = CommandQueue::threaded(Arc::clone(&metrics)).unwrap();
        let buffer = SharedBuffer::default();
        let sink = queue.open_sink(Box::new(buffer.clone()));
        for n in 0..100 {
            queue.write(sink, format!("{n};"));
        }
        queue.close(sink);
        queue.shutdown();

        let expected: String = (0..100).map(|n| format!("{n};")).collect();
        assert_eq!(String::from_utf8(buffer.0.lock().clone()).unwrap(), expected);
        assert_eq!(metrics.snapshot().commands_executed, 102);
    }

    #[test]
    fn failures_are_counted_not_propagated() {
        let metrics = RuntimeMetrics::new();
        let queue = CommandQueue::inline(Arc::clone(&metrics));
        queue.write(SinkId(999), "lost");
        queue.run(|| panic!("side effect failed"));
        queue.run(|| {});
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands_failed, 2);
        assert_eq!(snapshot.commands_executed, 1);
    }

    #[test]
    fn pushes_after_shutdown_are_dropped() {
        let metrics = RuntimeMetrics::new();
        let queue = CommandQueue::threaded(Arc::clone(&metrics)).unwrap();
        queue.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.run(move || flag.store(true, Ordering::SeqCst));
        assert!(queue.is_closed());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(metrics.snapshot().commands_failed, 1);
    }
}
