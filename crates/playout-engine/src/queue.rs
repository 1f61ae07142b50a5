//! Thread-safe bounded queue for interleaved audio samples.
//!
//! Decode and resample stages run on background threads and hand samples to
//! the frame adapter through this queue:
//! - decode thread → queue (blocking push, bounded)
//! - resampler thread → queue
//! - frame adapter drains the final queue without blocking, because it is
//!   polled from the scheduling thread
//!
//! A `done` flag stored under the same mutex as the data gives deterministic
//! shutdown: once a producer calls [`SampleQueue::close`], consumers drain
//! what is left and then observe end-of-stream.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Bounded multi-producer queue of interleaved `f32` samples.
///
/// The `channels` count is fixed for the lifetime of the queue; all frame
/// arithmetic below is in frames of `channels` samples.
pub struct SampleQueue {
    channels: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct QueueInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Conservative queue capacity in samples for a `(rate, channels, seconds)`
/// target. Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        Self {
            channels,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples,
        }
    }

    /// Channel count of the interleaved stream carried by this queue.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Mark the stream finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Whether the queue is closed and fully drained.
    pub fn is_finished(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.done && g.queue.is_empty()
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns early (dropping the remainder) if the queue is closed while
    /// waiting for capacity.
    pub fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return;
            }

            while offset < samples.len() && g.queue.len() < self.max_buffered_samples {
                g.queue.push_back(samples[offset]);
                offset += 1;
            }

            drop(g);
            self.cv.notify_all();
        }
    }

    /// Block until exactly `frames` frames are available and pop them.
    ///
    /// Returns `None` once the queue is closed and cannot satisfy the
    /// request in full.
    pub fn pop_exact_blocking(&self, frames: usize) -> Option<Vec<f32>> {
        let want = frames * self.channels;
        let mut g = self.inner.lock().unwrap();

        while g.queue.len() < want && !g.done {
            g = self.cv.wait(g).unwrap();
        }
        if g.queue.len() < want {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..want).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until at least one frame is available, then pop up to
    /// `max_frames`. Returns `None` when the queue is closed and empty.
    pub fn pop_up_to_blocking(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();

        while g.queue.is_empty() && !g.done {
            g = self.cv.wait(g).unwrap();
        }
        if g.queue.is_empty() {
            return None;
        }

        let take = (g.queue.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.queue.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Non-blocking pop of exactly `frames` frames.
    ///
    /// While the stream is still open, an underfilled queue yields `None`
    /// (the caller treats it as a transient miss). After close, any leftover
    /// partial tail is returned once so the final samples are not lost;
    /// callers pad it to a full frame.
    pub fn try_pop_exact(&self, frames: usize) -> Option<Vec<f32>> {
        let want = frames * self.channels;
        let mut g = self.inner.lock().unwrap();

        let take = if g.queue.len() >= want {
            want
        } else if g.done && !g.queue.is_empty() {
            (g.queue.len() / self.channels) * self.channels
        } else {
            return None;
        };
        if take == 0 {
            // Stray samples shorter than one frame; drop them.
            g.queue.clear();
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_scales_with_rate_and_channels() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 1.0), 96_000);
        // Fallback for nonsense durations.
        assert_eq!(
            calc_max_buffered_samples(48_000, 1, f32::NAN),
            calc_max_buffered_samples(48_000, 1, 2.0)
        );
    }

    #[test]
    fn try_pop_exact_reports_transient_underfill() {
        let q = SampleQueue::new(1, 1_000);
        q.push_blocking(&[0.1, 0.2]);
        assert!(q.try_pop_exact(4).is_none());
        // Data is still there for later.
        q.push_blocking(&[0.3, 0.4]);
        assert_eq!(q.try_pop_exact(4).unwrap(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn try_pop_exact_returns_partial_tail_after_close() {
        let q = SampleQueue::new(1, 1_000);
        q.push_blocking(&[0.5, 0.6]);
        q.close();
        assert_eq!(q.try_pop_exact(4).unwrap(), vec![0.5, 0.6]);
        assert!(q.try_pop_exact(4).is_none());
        assert!(q.is_finished());
    }

    #[test]
    fn pop_exact_blocking_returns_none_on_closed_short_queue() {
        let q = SampleQueue::new(2, 1_000);
        q.push_blocking(&[1.0, 2.0]);
        q.close();
        assert!(q.pop_exact_blocking(2).is_none());
    }

    #[test]
    fn push_blocking_respects_capacity_until_consumer_drains() {
        let q = Arc::new(SampleQueue::new(1, 4));
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);

        let q2 = q.clone();
        let producer = thread::spawn(move || {
            // Blocks until the consumer below makes room.
            q2.push_blocking(&[5.0, 6.0]);
        });

        let first = q.pop_exact_blocking(4).unwrap();
        assert_eq!(first, vec![1.0, 2.0, 3.0, 4.0]);
        producer.join().unwrap();
        assert_eq!(q.pop_exact_blocking(2).unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn close_unblocks_waiting_consumer() {
        let q = Arc::new(SampleQueue::new(1, 16));
        let q2 = q.clone();
        let consumer = thread::spawn(move || q2.pop_up_to_blocking(8));
        q.close();
        assert!(consumer.join().unwrap().is_none());
    }
}
