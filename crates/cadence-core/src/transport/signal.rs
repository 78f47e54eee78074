//! Bitmask wait channel.
//!
//! A [`WaitChannel`] is the single point where a container thread blocks.
//! Every queue that can wake the container owns one bit; producers set the
//! bit after enqueueing, the consumer clears it when the queue is drained.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Bitmask over the 32 channel bits.
pub type ChannelMask = u32;

/// Number of bits a channel carries.
pub const CHANNEL_BITS: u32 = 32;

struct ChannelState {
    signaled: ChannelMask,
    allocated: ChannelMask,
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

/// Shared signal set a container thread waits on.
#[derive(Clone)]
pub struct WaitChannel {
    inner: Arc<ChannelInner>,
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitChannel {
    /// Creates a channel with no bits allocated or signaled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    signaled: 0,
                    allocated: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Reserves the lowest free bit and returns a [`Signal`] for it.
    pub fn allocate(&self) -> Option<Signal> {
        let mut state = self.inner.state.lock();
        let free = !state.allocated;
        if free == 0 {
            return None;
        }
        let bit = free.trailing_zeros();
        state.allocated |= 1 << bit;
        state.signaled &= !(1 << bit);
        Some(Signal {
            channel: self.clone(),
            bit,
        })
    }

    /// Reserves a specific bit.
    pub fn allocate_bit(&self, bit: u32) -> Option<Signal> {
        if bit >= CHANNEL_BITS {
            return None;
        }
        let mut state = self.inner.state.lock();
        if state.allocated & (1 << bit) != 0 {
            return None;
        }
        state.allocated |= 1 << bit;
        Some(Signal {
            channel: self.clone(),
            bit,
        })
    }

    /// Returns a bit to the free set and clears any pending signal on it.
    pub fn release(&self, bit: u32) {
        let mut state = self.inner.state.lock();
        state.allocated &= !(1 << bit);
        state.signaled &= !(1 << bit);
    }

    /// Sets a bit and wakes any waiter.
    pub fn signal(&self, bit: u32) {
        let mut state = self.inner.state.lock();
        state.signaled |= 1 << bit;
        self.inner.cond.notify_all();
    }

    /// Clears a bit.
    pub fn clear(&self, bit: u32) {
        self.inner.state.lock().signaled &= !(1 << bit);
    }

    /// Returns the signaled bits within `mask` without blocking.
    pub fn poll(&self, mask: ChannelMask) -> ChannelMask {
        self.inner.state.lock().signaled & mask
    }

    /// Blocks until at least one bit in `mask` is signaled.
    pub fn wait(&self, mask: ChannelMask) -> ChannelMask {
        let mut state = self.inner.state.lock();
        while state.signaled & mask == 0 {
            self.inner.cond.wait(&mut state);
        }
        state.signaled & mask
    }

    /// Like [`wait`](Self::wait) with an upper bound; returns 0 on timeout.
    pub fn wait_timeout(&self, mask: ChannelMask, timeout: Duration) -> ChannelMask {
        let mut state = self.inner.state.lock();
        if state.signaled & mask == 0 {
            let _ = self
                .inner
                .cond
                .wait_while_for(&mut state, |s| s.signaled & mask == 0, timeout);
        }
        state.signaled & mask
    }
}

/// Handle to one bit of a [`WaitChannel`].
#[derive(Clone)]
pub struct Signal {
    channel: WaitChannel,
    bit: u32,
}

impl Signal {
    /// Bit index.
    pub fn bit(&self) -> u32 {
        self.bit
    }

    /// Mask with only this bit set.
    pub fn mask(&self) -> ChannelMask {
        1 << self.bit
    }

    /// Sets the bit.
    pub fn set(&self) {
        self.channel.signal(self.bit);
    }

    /// Clears the bit.
    pub fn clear(&self) {
        self.channel.clear(self.bit);
    }

    /// Returns `true` if the bit is currently set.
    pub fn is_set(&self) -> bool {
        self.channel.poll(self.mask()) != 0
    }
}

impl core::fmt::Debug for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signal").field("bit", &self.bit).finish()
    }
}
