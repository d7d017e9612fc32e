use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_derive::{Deserialize, Serialize};

use crate::{color::Frame, models::PlayerOptions};

/// Which buffered frame is played next
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferOrder {
    /// Oldest frame first, frames play in the order they were computed
    #[default]
    Fifo,
    /// Newest frame first, each refill batch plays backwards
    Lifo,
}

/// Bounded store of frames waiting to be rendered
///
/// Shared between a pacing thread popping frames and a refill task pushing them.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    low_water: f64,
    order: BufferOrder,
}

impl FrameBuffer {
    pub fn new(options: &PlayerOptions) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(options.capacity)),
            capacity: options.capacity,
            low_water: options.capacity as f64 * (1.0 - options.threshold),
            order: options.order,
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> BufferOrder {
        self.order
    }

    /// Append `frames`, dropping those that do not fit. Returns how many were stored.
    pub fn push_many(&self, frames: impl IntoIterator<Item = Frame>) -> usize {
        let mut buffer = self.frames();
        let free = self.capacity.saturating_sub(buffer.len());
        let before = buffer.len();

        buffer.extend(frames.into_iter().take(free));
        buffer.len() - before
    }

    pub fn push(&self, frame: Frame) -> bool {
        self.push_many(std::iter::once(frame)) == 1
    }

    /// Next frame to render, `None` if the buffer ran dry
    pub fn pop(&self) -> Option<Frame> {
        let mut buffer = self.frames();

        match self.order {
            BufferOrder::Fifo => buffer.pop_front(),
            BufferOrder::Lifo => buffer.pop_back(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.frames().clear();
    }

    /// Number of frames to request if the buffer drained below its low-water mark
    pub fn refill_count(&self) -> Option<usize> {
        let len = self.len();

        if (len as f64) < self.low_water {
            Some(self.capacity - len)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::PixelColor;

    fn numbered(count: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| Frame::solid(1, PixelColor::rgb((i % 256) as u8, (i / 256) as u8, 0)))
            .collect()
    }

    fn buffer(order: BufferOrder) -> FrameBuffer {
        FrameBuffer::new(&PlayerOptions {
            order,
            ..Default::default()
        })
    }

    #[test]
    fn fifo_is_lossless() {
        let buffer = buffer(BufferOrder::Fifo);
        let frames = numbered(buffer.capacity());

        assert_eq!(buffer.push_many(frames.clone()), 500);

        let popped: Vec<_> = std::iter::from_fn(|| buffer.pop()).collect();
        assert_eq!(popped, frames);
        assert!(buffer.is_empty());
    }

    #[test]
    fn lifo_is_lossless() {
        let buffer = buffer(BufferOrder::Lifo);
        let frames = numbered(buffer.capacity());

        assert_eq!(buffer.push_many(frames.clone()), 500);

        let mut popped: Vec<_> = std::iter::from_fn(|| buffer.pop()).collect();
        popped.reverse();
        assert_eq!(popped, frames);
    }

    #[test]
    fn empty_pop() {
        let buffer = buffer(BufferOrder::Fifo);
        assert_eq!(buffer.pop(), None);
        assert_eq!(buffer.refill_count(), Some(500));
    }

    #[test]
    fn bounded_by_capacity() {
        let buffer = buffer(BufferOrder::Fifo);

        assert_eq!(buffer.push_many(numbered(498)), 498);
        assert_eq!(buffer.push_many(numbered(5)), 2);
        assert!(!buffer.push(Frame::black(1)));
        assert_eq!(buffer.len(), 500);
    }

    #[test]
    fn low_water_mark() {
        let buffer = buffer(BufferOrder::Fifo);

        buffer.push_many(numbered(100));
        assert_eq!(buffer.refill_count(), None);

        buffer.pop();
        assert_eq!(buffer.len(), 99);
        assert_eq!(buffer.refill_count(), Some(401));
    }
}
