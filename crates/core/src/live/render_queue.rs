//! Single-producer/single-consumer hand-off of rendered samples from the
//! capture callback to the render callback.
//!
//! Neither side locks or allocates: the capture side drops what does not
//! fit, the render side pads with silence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Samples lost on either side of the queue.
#[derive(Debug, Default)]
pub struct RenderCounters {
    overflow: AtomicU64,
    underrun: AtomicU64,
}

impl RenderCounters {
    /// Rendered samples dropped because the queue was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Output samples filled with silence because the queue was empty.
    pub fn underrun(&self) -> u64 {
        self.underrun.load(Ordering::Relaxed)
    }
}

pub struct RenderProducer {
    inner: HeapProd<f32>,
    counters: Arc<RenderCounters>,
}

pub struct RenderConsumer {
    inner: HeapCons<f32>,
    counters: Arc<RenderCounters>,
}

/// Creates a queue holding up to `capacity` samples (at least one).
pub fn render_queue(capacity: usize) -> (RenderProducer, RenderConsumer, Arc<RenderCounters>) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
    let counters = Arc::new(RenderCounters::default());
    (
        RenderProducer {
            inner: producer,
            counters: counters.clone(),
        },
        RenderConsumer {
            inner: consumer,
            counters: counters.clone(),
        },
        counters,
    )
}

impl RenderProducer {
    /// Queues as much of `samples` as fits and returns how many were taken.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let pushed = self.inner.push_slice(samples);
        let dropped = samples.len() - pushed;
        if dropped > 0 {
            self.counters.overflow.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        pushed
    }
}

impl RenderConsumer {
    /// Fills `out` from the queue, padding the rest with silence. Returns the
    /// number of queued samples used.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let filled = self.inner.pop_slice(out);
        if filled < out.len() {
            out[filled..].fill(0.0);
            self.counters
                .underrun
                .fetch_add((out.len() - filled) as u64, Ordering::Relaxed);
        }
        filled
    }
}
