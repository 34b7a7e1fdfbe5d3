//! Fixed-capacity block delay that holds the motion signal back until the
//! matching sound has made it through the effects stage.

/// Number of blocks needed to cover `delay_ms`.
pub fn delay_blocks(delay_ms: f32, sample_rate: u32, block_size: usize) -> usize {
    let blocks = delay_ms.max(0.0) * sample_rate as f32 / block_size.max(1) as f32 / 1000.0;
    blocks.round() as usize
}

/// FIFO of audio blocks with a fixed capacity `N`.
///
/// A push returns the block that was pushed `N` pushes earlier, or `None`
/// while the line is still filling. With `N == 0` the pushed block comes
/// straight back.
#[derive(Debug, Clone)]
pub struct DelayLine {
    slots: Vec<Vec<f32>>,
    head: usize,
    filled: usize,
    released: Vec<f32>,
}

impl DelayLine {
    /// Preallocates `capacity` slots of `block_size` samples each.
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Vec::with_capacity(block_size))
                .collect(),
            head: 0,
            filled: 0,
            released: Vec::with_capacity(block_size),
        }
    }

    pub fn for_delay(delay_ms: f32, sample_rate: u32, block_size: usize) -> Self {
        Self::new(delay_blocks(delay_ms, sample_rate, block_size), block_size)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn push<'a>(&'a mut self, block: &'a [f32]) -> Option<&'a [f32]> {
        let capacity = self.slots.len();
        if capacity == 0 {
            return Some(block);
        }

        let slot = &mut self.slots[self.head];
        let released = if self.filled == capacity {
            // Swap instead of copying twice; both buffers keep their capacity.
            std::mem::swap(slot, &mut self.released);
            true
        } else {
            self.filled += 1;
            false
        };
        slot.clear();
        slot.extend_from_slice(block);
        self.head = (self.head + 1) % capacity;

        released.then_some(self.released.as_slice())
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(Vec::clear);
        self.head = 0;
        self.filled = 0;
        self.released.clear();
    }
}
