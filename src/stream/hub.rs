use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::wire::StreamPart;

pub type ChunkStream = BoxStream<'static, Bytes>;

/// Backend a client reattaches through after losing its connection.
#[async_trait]
pub trait ResumableBackend: Send + Sync {
    /// Attach to `stream_id` from its first chunk. `Ok(None)` when the
    /// backend holds nothing for it: never seen, or already collected.
    async fn resume(&self, stream_id: &str) -> anyhow::Result<Option<ChunkStream>>;
}

#[derive(Default)]
struct EntryState {
    chunks: Vec<Bytes>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct Entry {
    state: Mutex<EntryState>,
    notify: Notify,
}

/// In-process resumable stream store keyed by stream id.
///
/// Every chunk is buffered, so any number of subscribers can attach at any
/// point and replay from the start. Finished streams stay replayable for
/// `retention`, then [`StreamHub::collect_garbage`] drops them.
pub struct StreamHub {
    streams: DashMap<String, Arc<Entry>>,
    retention: Duration,
}

impl StreamHub {
    pub fn new(retention: Duration) -> Self {
        Self {
            streams: DashMap::new(),
            retention,
        }
    }

    /// Open a stream for writing. Reopening an id starts it over.
    pub fn create(&self, stream_id: &str) -> StreamWriter {
        let entry = Arc::new(Entry::default());
        self.streams.insert(stream_id.to_string(), entry.clone());
        tracing::debug!(stream_id, "opened resumable stream");

        StreamWriter {
            stream_id: stream_id.to_string(),
            entry,
            finished: false,
        }
    }

    pub fn subscribe(&self, stream_id: &str) -> Option<ChunkStream> {
        let entry = self.streams.get(stream_id)?.value().clone();
        Some(subscription(entry))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop finished streams older than the retention window. Returns the
    /// number removed.
    pub fn collect_garbage(&self) -> usize {
        let before = self.streams.len();
        let retention = self.retention;
        self.streams.retain(|_, entry| match entry.state.lock().finished_at {
            Some(finished_at) => finished_at.elapsed() < retention,
            None => true,
        });
        let removed = before.saturating_sub(self.streams.len());
        if removed > 0 {
            tracing::debug!(removed, "collected finished streams");
        }
        removed
    }

    /// Sweep periodically until the hub is dropped.
    pub fn spawn_collector(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub: Weak<StreamHub> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match hub.upgrade() {
                    Some(hub) => {
                        hub.collect_garbage();
                    }
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl ResumableBackend for StreamHub {
    async fn resume(&self, stream_id: &str) -> anyhow::Result<Option<ChunkStream>> {
        Ok(self.subscribe(stream_id))
    }
}

/// Write half of a hub stream. Dropping it finishes the stream.
pub struct StreamWriter {
    stream_id: String,
    entry: Arc<Entry>,
    finished: bool,
}

impl StreamWriter {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn write(&self, part: &StreamPart) {
        self.write_bytes(part.encode());
    }

    pub fn write_bytes(&self, chunk: Bytes) {
        {
            let mut state = self.entry.state.lock();
            if state.finished_at.is_some() {
                return;
            }
            state.chunks.push(chunk);
        }
        self.entry.notify.notify_waiters();
    }

    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.entry.state.lock().finished_at = Some(Instant::now());
        self.entry.notify.notify_waiters();
        tracing::debug!(stream_id = %self.stream_id, "finished resumable stream");
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.close();
    }
}

enum Step {
    Chunk(Bytes),
    Done,
    Waited,
}

fn subscription(entry: Arc<Entry>) -> ChunkStream {
    stream::unfold((entry, 0usize), |(entry, cursor)| async move {
        loop {
            let step = {
                // Register interest before inspecting state so a write
                // between the check and the await is not missed.
                let notified = entry.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let ready = {
                    let state = entry.state.lock();
                    if let Some(chunk) = state.chunks.get(cursor) {
                        Some(Step::Chunk(chunk.clone()))
                    } else if state.finished_at.is_some() {
                        Some(Step::Done)
                    } else {
                        None
                    }
                };

                match ready {
                    Some(step) => step,
                    None => {
                        notified.await;
                        Step::Waited
                    }
                }
            };

            match step {
                Step::Chunk(chunk) => return Some((chunk, (entry, cursor + 1))),
                Step::Done => return None,
                Step::Waited => continue,
            }
        }
    })
    .boxed()
}
