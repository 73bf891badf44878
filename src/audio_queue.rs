use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// 16-bit mono PCM.
pub const BYTES_PER_SAMPLE: u64 = 2;

/// One slice of captured PCM audio, tagged with the sample rate that was
/// active when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

struct Inner {
    queue: VecDeque<AudioFrame>,
    /// Concatenation of all accepted frames, retained after the queue drains
    /// so duration math and persistence still work post-stream.
    buffered: Vec<u8>,
    sample_rate: u32,
    open: bool,
}

/// Thread-safe frame buffer between the capture callback and the merge loop.
///
/// The producer side (`push`) is synchronous so it can be called from the
/// native capture thread; the consumer side (`next_frame`) is async and is
/// only ever awaited by the single merge loop. The wake primitive is a
/// `Notify`, which holds at most one permit: attaching a new waiter replaces
/// rather than queues, which is exactly the single-consumer discipline here.
pub struct AudioBufferQueue {
    inner: Mutex<Inner>,
    frame_ready: Notify,
}

impl AudioBufferQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                buffered: Vec::new(),
                sample_rate,
                open: false,
            }),
            frame_ready: Notify::new(),
        }
    }

    /// Clear all state and open the queue for a new session.
    pub fn reset(&self, sample_rate: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.buffered.clear();
        inner.sample_rate = sample_rate;
        inner.open = true;
    }

    /// Update the sample rate once capture reports its effective output rate.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        if sample_rate == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.sample_rate = sample_rate;
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().unwrap().sample_rate
    }

    /// Append a frame to the outgoing queue and to the retained buffer, then
    /// wake the consumer. Silent no-op once the queue is closed: frames
    /// arriving after stop are dropped from the wire.
    pub fn push(&self, pcm: Vec<u8>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return;
            }
            inner.buffered.extend_from_slice(&pcm);
            let sample_rate = inner.sample_rate;
            inner.queue.push_back(AudioFrame { pcm, sample_rate });
        }
        self.frame_ready.notify_one();
    }

    /// Close the queue, ending the frame sequence once drained. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
        }
        self.frame_ready.notify_one();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    /// Pop the next frame, suspending while the queue is open but empty.
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn next_frame(&self) -> Option<AudioFrame> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if !inner.open {
                    return None;
                }
            }
            self.frame_ready.notified().await;
        }
    }

    /// Duration of all audio accepted this session, floored to milliseconds.
    pub fn buffered_duration_ms(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let rate = inner.sample_rate.max(1) as u64;
        let samples = inner.buffered.len() as u64 / BYTES_PER_SAMPLE;
        samples.saturating_mul(1000) / rate
    }

    /// Snapshot of all audio accepted this session, in arrival order.
    pub fn buffered_audio(&self) -> Vec<u8> {
        self.inner.lock().unwrap().buffered.clone()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.inner.lock().unwrap().buffered.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_queue(rate: u32) -> AudioBufferQueue {
        let q = AudioBufferQueue::new(rate);
        q.reset(rate);
        q
    }

    #[tokio::test]
    async fn frames_drain_in_arrival_order() {
        let q = open_queue(16000);
        q.push(vec![1, 1]);
        q.push(vec![2, 2]);
        q.push(vec![3, 3]);
        q.close();

        assert_eq!(q.next_frame().await.unwrap().pcm, vec![1, 1]);
        assert_eq!(q.next_frame().await.unwrap().pcm, vec![2, 2]);
        assert_eq!(q.next_frame().await.unwrap().pcm, vec![3, 3]);
        assert!(q.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_pending_consumer_with_end_of_stream() {
        let q = Arc::new(open_queue(16000));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.next_frame().await });
        // Give the consumer a chance to park on the empty queue.
        tokio::task::yield_now().await;
        q.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_after_close_is_dropped_from_wire() {
        let q = open_queue(16000);
        q.push(vec![1, 1]);
        q.close();
        q.push(vec![2, 2]);

        assert_eq!(q.next_frame().await.unwrap().pcm, vec![1, 1]);
        assert!(q.next_frame().await.is_none());
        // The late frame never reached the retained buffer either.
        assert_eq!(q.buffered_audio(), vec![1, 1]);
    }

    #[tokio::test]
    async fn buffered_audio_survives_drain() {
        let q = open_queue(16000);
        q.push(vec![1, 2]);
        q.push(vec![3, 4]);
        q.close();
        while q.next_frame().await.is_some() {}
        assert_eq!(q.buffered_audio(), vec![1, 2, 3, 4]);
        assert_eq!(q.buffered_bytes(), 4);
    }

    #[test]
    fn duration_math_floors_to_ms() {
        let q = open_queue(16000);
        // 3200 bytes = 1600 samples at 16 kHz = exactly 100 ms.
        q.push(vec![0; 3200]);
        assert_eq!(q.buffered_duration_ms(), 100);
    }

    #[test]
    fn sub_sample_frame_yields_zero_duration() {
        let q = open_queue(16000);
        q.push(vec![0; 1]);
        assert_eq!(q.buffered_duration_ms(), 0);
    }

    #[test]
    fn empty_queue_has_zero_duration() {
        let q = open_queue(16000);
        assert_eq!(q.buffered_duration_ms(), 0);
    }

    #[test]
    fn reset_clears_previous_session_audio() {
        let q = open_queue(16000);
        q.push(vec![0; 3200]);
        q.close();
        q.reset(16000);
        assert_eq!(q.buffered_duration_ms(), 0);
        assert!(q.buffered_audio().is_empty());
    }

    #[test]
    fn sample_rate_update_changes_duration_math() {
        let q = open_queue(16000);
        q.push(vec![0; 3200]);
        q.set_sample_rate(32000);
        assert_eq!(q.buffered_duration_ms(), 50);
    }
}
