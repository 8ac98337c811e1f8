//! # Log fan-out for one supervised core.
//!
//! ```text
//! stdout ──► forward_lines ──┐
//!                            ├──► mpsc ──► pump ──► LogBroadcaster::append
//! stderr ──► forward_lines ──┘                         │
//!                                          ┌───────────┼─────────────┐
//!                                          ▼           ▼             ▼
//!                                       LogRing   [buffer S1] ... [buffer SN]
//! ```
//!
//! The pump is the only writer. `append` pushes into the ring and copies the
//! subscriber list under one short lock, then delivers to the copied buffers
//! outside it. `subscribe` snapshots the ring and registers under the same
//! lock, so every line lands either in a subscriber's snapshot or in its
//! live feed, never both and never neither.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CoreKind;
use crate::ring::LogRing;

const LINE_CHANNEL_CAPACITY: usize = 512;

type SubscriberBuffer = Arc<Mutex<VecDeque<String>>>;

struct Shared {
    ring: LogRing,
    subscribers: HashMap<u64, SubscriberBuffer>,
}

pub struct LogBroadcaster {
    shared: Mutex<Shared>,
    next_id: AtomicU64,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                ring: LogRing::new(capacity),
                subscribers: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn append(&self, line: String) {
        let targets: Vec<SubscriberBuffer> = {
            let mut shared = lock(&self.shared);
            shared.ring.push(line.clone());
            shared.subscribers.values().cloned().collect()
        };
        for buffer in targets {
            lock(&buffer).push_back(line.clone());
        }
    }

    /// Registers a subscriber seeded with the ring's current contents.
    ///
    /// The returned guard unregisters itself when dropped; anything it has
    /// not consumed by then is discarded.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let buffer = {
            let mut shared = lock(&self.shared);
            let buffer = Arc::new(Mutex::new(shared.ring.snapshot()));
            shared.subscribers.insert(id, buffer.clone());
            buffer
        };
        Subscriber {
            id,
            buffer,
            owner: Arc::clone(self),
        }
    }

    /// Current ring contents, oldest first.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.shared).ring.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.shared).subscribers.len()
    }

    fn unregister(&self, id: u64) {
        lock(&self.shared).subscribers.remove(&id);
    }

    /// Drains both output streams line by line into the broadcaster.
    ///
    /// The returned task ends once both streams reach end-of-file, which
    /// happens when the process exits and its pipes are drained.
    pub fn spawn_reader<O, E>(
        self: &Arc<Self>,
        stdout: O,
        stderr: E,
        echo: Option<CoreKind>,
    ) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
        tokio::spawn(forward_lines(stderr, line_tx));

        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(kind) = echo {
                    debug!(target: "mnode_core::core", core = %kind, "{line}");
                }
                broadcaster.append(line.to_string());
            }
        })
    }
}

/// Forwards raw lines until end-of-file or a read error. Bytes that are
/// not valid UTF-8 are replaced rather than ending the stream.
async fn forward_lines<R>(reader: R, line_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(event = "core_output_read_failed", error = %err);
                break;
            }
        }
    }
}

/// One live view: snapshot at subscribe time plus every later line.
pub struct Subscriber {
    id: u64,
    buffer: SubscriberBuffer,
    owner: Arc<LogBroadcaster>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Takes the oldest unconsumed line.
    pub fn pop(&self) -> Option<String> {
        lock(&self.buffer).pop_front()
    }

    /// Takes every unconsumed line.
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<String> {
        lock(&self.buffer).drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.buffer).is_empty()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.owner.unregister(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
