// src/ring_buffer.rs
//! N-buffered command recording.
//!
//! A ring hands out one slot per frame. Slots that have never been recorded
//! into are handed out as-is; slots coming around for a second time are reset
//! first, which for primary rings means waiting on the submission that last
//! used them. With N slots the CPU can record frame `k` while the GPU still
//! consumes frames `k-N+1 .. k-1`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// 1. GENERIC RING
// ============================================================================

/// Something a [`RingBuffer`] can recycle.
pub trait RingSlot {
    /// Release whatever the previous use left behind. Never called on a slot
    /// that has not been handed out yet.
    fn reset(&mut self);
}

pub struct RingBuffer<S: RingSlot> {
    slots: Vec<S>,
    used: Vec<bool>,
    index: usize,
}

impl<S: RingSlot> RingBuffer<S> {
    /// `slots` must not be empty. The cursor starts on the last slot so the
    /// first [`advance`](Self::advance) lands on slot 0.
    pub fn new(slots: Vec<S>) -> Self {
        assert!(!slots.is_empty(), "a ring buffer needs at least one slot");
        let len = slots.len();
        Self {
            slots,
            used: vec![false; len],
            index: len - 1,
        }
    }

    pub fn from_fn(len: usize, mut make: impl FnMut(usize) -> S) -> Self {
        Self::new((0..len.max(1)).map(&mut make).collect())
    }

    /// Move to `(index + 1) % N`, resetting the slot unless this is its first use.
    pub fn advance(&mut self) -> &mut S {
        self.index = (self.index + 1) % self.slots.len();

        if self.used[self.index] {
            self.slots[self.index].reset();
        } else {
            self.used[self.index] = true;
        }

        &mut self.slots[self.index]
    }

    #[inline]
    pub fn current(&self) -> &S {
        &self.slots[self.index]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut S {
        &mut self.slots[self.index]
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &S> {
        self.slots.iter()
    }
}

// ============================================================================
// 2. COMMAND SLOTS
// ============================================================================

/// Primary slots are submitted directly and wait for their previous
/// submission on reset; secondary slots are stitched into a primary and
/// never wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLevel {
    Primary,
    Secondary,
}

/// One recording slot: its last submission plus buffers that must outlive it.
pub struct CommandSlot {
    device: Arc<wgpu::Device>,
    label: String,
    level: CommandLevel,
    submission: Option<wgpu::SubmissionIndex>,
    retained: Vec<wgpu::Buffer>,
    /// Pre-recorded draws of a secondary slot.
    bundle: Option<wgpu::RenderBundle>,
}

impl CommandSlot {
    pub fn new(device: Arc<wgpu::Device>, label: impl Into<String>, level: CommandLevel) -> Self {
        Self {
            device,
            label: label.into(),
            level,
            submission: None,
            retained: Vec::new(),
            bundle: None,
        }
    }

    pub fn encoder(&self) -> wgpu::CommandEncoder {
        self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&self.label),
        })
    }

    /// Record the submission this slot's work went out with.
    pub fn submitted(&mut self, index: wgpu::SubmissionIndex) {
        self.submission = Some(index);
    }

    /// Keep `buffer` alive until this slot comes around again.
    pub fn retain(&mut self, buffer: wgpu::Buffer) {
        self.retained.push(buffer);
    }

    pub fn level(&self) -> CommandLevel {
        self.level
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_bundle(&mut self, bundle: wgpu::RenderBundle) {
        self.bundle = Some(bundle);
    }

    pub fn bundle(&self) -> Option<&wgpu::RenderBundle> {
        self.bundle.as_ref()
    }
}

impl RingSlot for CommandSlot {
    fn reset(&mut self) {
        if let (CommandLevel::Primary, Some(index)) = (self.level, self.submission.take()) {
            let _ = self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
        self.submission = None;
        self.bundle = None;
        for buffer in self.retained.drain(..) {
            buffer.destroy();
        }
    }
}

pub type CommandRingBuffer = RingBuffer<CommandSlot>;

impl CommandRingBuffer {
    pub fn commands(device: &Arc<wgpu::Device>, label: &str, len: usize, level: CommandLevel) -> Self {
        RingBuffer::from_fn(len, |i| {
            CommandSlot::new(device.clone(), format!("{label}_cbo_{i}"), level)
        })
    }
}

// ============================================================================
// 3. EVENT SLOTS
// ============================================================================

/// Marks the point after which a pass's resources may be reused.
pub struct EventSlot {
    device: Arc<wgpu::Device>,
    signaled: Arc<AtomicBool>,
}

impl EventSlot {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            signaled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Signal once everything submitted to `queue` so far has executed.
    pub fn arm(&mut self, queue: &wgpu::Queue) {
        self.signaled.store(false, Ordering::Release);
        let flag = self.signaled.clone();
        queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
    }

    /// Non-blocking. True when nothing is pending on this slot.
    pub fn is_signaled(&self) -> bool {
        if self.signaled.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.signaled.load(Ordering::Acquire)
    }
}

impl RingSlot for EventSlot {
    fn reset(&mut self) {
        if !self.is_signaled() {
            let _ = self.device.poll(wgpu::Maintain::Wait);
        }
        self.signaled = Arc::new(AtomicBool::new(true));
    }
}

pub type EventRingBuffer = RingBuffer<EventSlot>;

impl EventRingBuffer {
    pub fn events(device: &Arc<wgpu::Device>, len: usize) -> Self {
        RingBuffer::from_fn(len, |_| EventSlot::new(device.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        id: usize,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl RingSlot for Recorder {
        fn reset(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    fn ring(len: usize) -> (RingBuffer<Recorder>, Rc<RefCell<Vec<usize>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ring = RingBuffer::from_fn(len, |id| Recorder { id, log: log.clone() });
        (ring, log)
    }

    #[test]
    fn first_lap_never_resets() {
        let (mut ring, log) = ring(3);
        for _ in 0..3 {
            ring.advance();
        }
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn second_lap_resets_each_slot_once() {
        let (mut ring, log) = ring(3);
        for _ in 0..7 {
            ring.advance();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2, 0]);
    }

    #[test]
    fn cursor_wraps_modulo_len() {
        let (mut ring, _) = ring(3);
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                ring.advance();
                ring.index()
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);
        assert_eq!(ring.current().id, 1);
    }

    #[test]
    fn single_slot_ring_resets_from_the_second_frame() {
        let (mut ring, log) = ring(1);
        ring.advance();
        assert!(log.borrow().is_empty());
        ring.advance();
        ring.advance();
        assert_eq!(*log.borrow(), vec![0, 0]);
    }
}
