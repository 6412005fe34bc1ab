//! Request-write log for retried and hedged streaming calls.
//!
//! When a retry or hedging policy wraps a client-streaming or duplex call,
//! written messages are serialized once and the encoded frames logged here.
//! Every attempt's request body is a [`WriteBuffer::replay_stream`] cursor
//! over the log: a newly started attempt replays the prefix, then follows
//! live writes.
//!
//! Once an attempt commits the buffer is released: [`WriteBuffer::commit`]
//! switches the log to drain mode, the already-replayed prefix is dropped,
//! and from then on each frame is handed to the committed cursor exactly
//! once and freed. Cursors of losing attempts end their streams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::Notify;

#[derive(Default)]
struct BufferState {
    frames: VecDeque<Bytes>,
    /// Absolute index of `frames[0]`. Zero until drain mode starts
    /// dropping consumed frames.
    base: usize,
    closed: bool,
    /// Cursor id of the committed attempt, once one wins.
    committed: Option<u32>,
}

/// Shared, append-only log of encoded request frames.
pub(crate) struct WriteBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl WriteBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(WriteBuffer {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        })
    }

    /// Append one encoded frame and wake replaying attempts.
    pub fn push(&self, frame: Bytes) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.frames.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    /// Mark the request stream complete.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    /// Release the log to the committed attempt's cursor. The replayed
    /// prefix is dropped as soon as that cursor wakes, later frames are
    /// freed as it consumes them, and every other cursor ends.
    pub fn commit(&self, cursor: u32) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.committed.is_none() {
                state.committed = Some(cursor);
            }
        }
        self.notify.notify_waiters();
    }

    /// Await the frame at `index` for `cursor`, or `None` once the log is
    /// closed and fully consumed, or once another cursor has committed.
    async fn frame_at(&self, cursor: u32, index: usize) -> Option<Bytes> {
        loop {
            // Register interest before inspecting state so a concurrent
            // push cannot be missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(committed) = state.committed {
                    if cursor != committed {
                        return None;
                    }
                    // Sole surviving consumer: frames behind its position
                    // were delivered during replay and can go now.
                    while state.base < index && state.frames.pop_front().is_some() {
                        state.base += 1;
                    }
                    if index < state.base {
                        return None;
                    }
                    if index == state.base {
                        if let Some(frame) = state.frames.pop_front() {
                            state.base += 1;
                            return Some(frame);
                        }
                    }
                } else {
                    // Replay mode: every cursor reads the shared log.
                    if index < state.frames.len() {
                        return Some(state.frames[index].clone());
                    }
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// A cursor over the log, from the first frame. `cursor` identifies the
    /// attempt so a commit can single it out.
    pub fn replay_stream(self: &Arc<Self>, cursor: u32) -> impl Stream<Item = Bytes> + Send + use<> {
        let buffer = Arc::clone(self);
        futures::stream::unfold((buffer, 0usize), move |(buffer, index)| async move {
            let frame = buffer.frame_at(cursor, index).await?;
            Some((frame, (buffer, index + 1)))
        })
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn replay_yields_existing_then_live_frames() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"one"));
        buffer.push(Bytes::from_static(b"two"));

        let mut stream = Box::pin(buffer.replay_stream(1));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"two"));

        let pending = tokio::spawn(async move { stream.next().await });
        buffer.push(Bytes::from_static(b"three"));
        assert_eq!(
            pending.await.unwrap().unwrap(),
            Bytes::from_static(b"three")
        );
    }

    #[tokio::test]
    async fn close_ends_every_cursor() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"only"));
        buffer.close();

        let mut first = Box::pin(buffer.replay_stream(1));
        let mut second = Box::pin(buffer.replay_stream(2));

        assert_eq!(first.next().await.unwrap(), Bytes::from_static(b"only"));
        assert!(first.next().await.is_none());
        assert_eq!(second.next().await.unwrap(), Bytes::from_static(b"only"));
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn late_cursor_replays_from_start() {
        let buffer = WriteBuffer::new();
        for i in 0..5u8 {
            buffer.push(Bytes::from(vec![i]));
        }
        buffer.close();

        let collected: Vec<Bytes> = buffer.replay_stream(1).collect().await;
        assert_eq!(collected.len(), 5);
        assert_eq!(collected[0], Bytes::from_static(&[0]));
        assert_eq!(collected[4], Bytes::from_static(&[4]));
    }

    #[tokio::test]
    async fn commit_releases_replayed_prefix_and_drains_live_frames() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"one"));
        buffer.push(Bytes::from_static(b"two"));

        let mut stream = Box::pin(buffer.replay_stream(1));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(buffer.buffered_len(), 2);

        buffer.commit(1);

        // Frames written after the commit are handed over and freed as the
        // committed cursor consumes them.
        buffer.push(Bytes::from_static(b"three"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"three"));
        assert_eq!(buffer.buffered_len(), 0);

        buffer.push(Bytes::from_static(b"four"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"four"));
        assert_eq!(buffer.buffered_len(), 0);

        buffer.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn commit_wakes_a_parked_cursor_to_drop_its_prefix() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"one"));
        buffer.push(Bytes::from_static(b"two"));

        let mut stream = Box::pin(buffer.replay_stream(1));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"two"));

        // Park the cursor waiting for a third frame, then commit.
        let parked = tokio::spawn(async move { stream.next().await });
        buffer.commit(1);
        tokio::task::yield_now().await;
        assert_eq!(buffer.buffered_len(), 0);

        buffer.close();
        assert!(parked.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn losing_cursor_ends_after_commit() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"one"));

        let mut winner = Box::pin(buffer.replay_stream(1));
        let mut loser = Box::pin(buffer.replay_stream(2));
        assert_eq!(winner.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(loser.next().await.unwrap(), Bytes::from_static(b"one"));

        buffer.commit(1);
        assert!(loser.next().await.is_none());

        // The winner keeps draining.
        buffer.push(Bytes::from_static(b"two"));
        assert_eq!(winner.next().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn first_commit_wins() {
        let buffer = WriteBuffer::new();
        buffer.push(Bytes::from_static(b"one"));
        buffer.commit(1);
        buffer.commit(2);

        let mut winner = Box::pin(buffer.replay_stream(1));
        assert_eq!(winner.next().await.unwrap(), Bytes::from_static(b"one"));
        let mut late = Box::pin(buffer.replay_stream(2));
        assert!(late.next().await.is_none());
    }
}
