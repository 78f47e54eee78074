//! Wait-mask event loop and handler registry.
//!
//! A container thread blocks on its [`WaitChannel`] for any bit in the
//! current mask. On wake it drains *every* signaled bit, re-polling until
//! nothing is left, and only then blocks again. Each bit maps to a
//! [`HandlerKind`] in a [`HandlerRegistry`]; a signaled bit with no handler
//! is logged and dropped from the mask for good.

use std::sync::Arc;

use crate::ids::PortKey;
use crate::transport::{CHANNEL_BITS, ChannelMask, WaitChannel};

/// What a wait bit is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// The container's command queue.
    Command,
    /// Data queue of an external input.
    ExtInputData(PortKey),
    /// Buffer returns to an external output's pool.
    ExtOutputReturn(PortKey),
}

/// What a handler asks the loop to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep draining.
    Continue,
    /// Exit the loop; the container is done.
    Terminate,
    /// Exit the loop so the thread can be relaunched.
    Relaunch,
}

/// Why the loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// A terminal command was handled.
    Terminated,
    /// A handler stored a continuation and needs a fresh thread.
    Relaunch,
}

/// Maps channel bits to handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    slots: [Option<HandlerKind>; CHANNEL_BITS as usize],
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `bit` to `kind`, replacing any previous binding.
    pub fn register(&mut self, bit: u32, kind: HandlerKind) {
        if let Some(slot) = self.slots.get_mut(bit as usize) {
            *slot = Some(kind);
        }
    }

    /// Removes the binding for `bit`.
    pub fn unregister(&mut self, bit: u32) -> Option<HandlerKind> {
        self.slots.get_mut(bit as usize).and_then(Option::take)
    }

    /// Handler bound to `bit`, if any.
    pub fn get(&self, bit: u32) -> Option<HandlerKind> {
        self.slots.get(bit as usize).copied().flatten()
    }

    /// Bit bound to `kind`, if any.
    pub fn bit_of(&self, kind: HandlerKind) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| *s == Some(kind))
            .map(|b| b as u32)
    }
}

/// Scheduling priority control for the current thread.
pub trait ThreadPriority: Send + Sync {
    /// Current priority.
    fn current(&self) -> i32;
    /// Sets the priority.
    fn set(&self, priority: i32);
}

/// Restores the previous priority on drop.
pub struct PriorityBoost {
    control: Arc<dyn ThreadPriority>,
    previous: i32,
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        self.control.set(self.previous);
    }
}

/// Wait mask, handler registry and optional command priority boost.
pub struct EventLoop {
    channel: WaitChannel,
    mask: ChannelMask,
    registry: HandlerRegistry,
    boost: Option<(Arc<dyn ThreadPriority>, i32)>,
}

impl core::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLoop")
            .field("mask", &format_args!("0x{:08X}", self.mask))
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates a loop over `channel` with an empty mask.
    pub fn new(channel: WaitChannel) -> Self {
        Self {
            channel,
            mask: 0,
            registry: HandlerRegistry::new(),
            boost: None,
        }
    }

    /// Raises the thread to `priority` while command handlers run.
    pub fn set_command_boost(&mut self, control: Arc<dyn ThreadPriority>, priority: i32) {
        self.boost = Some((control, priority));
    }

    /// Binds `bit` and adds it to the wait mask.
    pub fn register(&mut self, bit: u32, kind: HandlerKind) {
        self.registry.register(bit, kind);
        self.mask |= 1 << bit;
    }

    /// Unbinds `bit` and removes it from the wait mask.
    pub fn unregister(&mut self, bit: u32) -> Option<HandlerKind> {
        self.mask &= !(1 << bit);
        self.registry.unregister(bit)
    }

    /// Current wait mask.
    pub fn mask(&self) -> ChannelMask {
        self.mask
    }

    /// The channel this loop waits on.
    pub fn channel(&self) -> &WaitChannel {
        &self.channel
    }

    /// Handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Blocks until some bit in the mask is signaled.
    pub fn wait(&self) -> ChannelMask {
        self.channel.wait(self.mask)
    }

    /// Signaled bits in the mask, without blocking.
    pub fn poll(&self) -> ChannelMask {
        self.channel.poll(self.mask)
    }

    /// Resolves a signaled bit to its handler.
    ///
    /// A bit with no handler is removed from the mask and never polled
    /// again.
    pub fn resolve(&mut self, bit: u32) -> Option<HandlerKind> {
        let kind = self.registry.get(bit);
        if kind.is_none() {
            tracing::warn!(bit, "signal without handler, dropping bit from mask");
            self.mask &= !(1 << bit);
        }
        kind
    }

    /// Boosts priority for a command handler if configured.
    pub fn boost_for(&self, kind: HandlerKind) -> Option<PriorityBoost> {
        if kind != HandlerKind::Command {
            return None;
        }
        let (control, priority) = self.boost.as_ref()?;
        let previous = control.current();
        control.set(*priority);
        Some(PriorityBoost {
            control: Arc::clone(control),
            previous,
        })
    }
}

/// A handler target driven by an [`EventLoop`].
pub trait Dispatch {
    /// The loop state.
    fn event_loop(&mut self) -> &mut EventLoop;

    /// Runs the handler for one signaled bit.
    fn dispatch(&mut self, kind: HandlerKind) -> LoopControl;
}

fn drain_bits<D: Dispatch>(target: &mut D, mut ready: ChannelMask) -> Option<LoopExit> {
    while ready != 0 {
        let mut bits = ready;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= bits - 1;
            let Some(kind) = target.event_loop().resolve(bit) else {
                continue;
            };
            let boost = target.event_loop().boost_for(kind);
            let control = target.dispatch(kind);
            drop(boost);
            match control {
                LoopControl::Continue => {}
                LoopControl::Terminate => return Some(LoopExit::Terminated),
                LoopControl::Relaunch => return Some(LoopExit::Relaunch),
            }
        }
        ready = target.event_loop().poll();
    }
    None
}

/// Runs until a handler terminates or asks for relaunch.
pub fn run<D: Dispatch>(target: &mut D) -> LoopExit {
    loop {
        let ready = target.event_loop().wait();
        if let Some(exit) = drain_bits(target, ready) {
            return exit;
        }
    }
}

/// Drains whatever is signaled now without blocking.
///
/// Returns `None` when the loop went idle.
pub fn run_until_idle<D: Dispatch>(target: &mut D) -> Option<LoopExit> {
    let ready = target.event_loop().poll();
    drain_bits(target, ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Recorder {
        el: EventLoop,
        seen: Vec<HandlerKind>,
        stop_after: usize,
    }

    impl Dispatch for Recorder {
        fn event_loop(&mut self) -> &mut EventLoop {
            &mut self.el
        }

        fn dispatch(&mut self, kind: HandlerKind) -> LoopControl {
            self.seen.push(kind);
            if let Some(bit) = self.el.registry().bit_of(kind) {
                self.el.channel().clear(bit);
            }
            if self.seen.len() >= self.stop_after {
                LoopControl::Terminate
            } else {
                LoopControl::Continue
            }
        }
    }

    fn recorder(stop_after: usize) -> Recorder {
        Recorder {
            el: EventLoop::new(WaitChannel::new()),
            seen: Vec::new(),
            stop_after,
        }
    }

    #[test]
    fn drains_all_signaled_bits() {
        let mut r = recorder(usize::MAX);
        let port = PortKey::new(0x10, 0);
        r.el.register(0, HandlerKind::Command);
        r.el.register(3, HandlerKind::ExtInputData(port));
        r.el.channel().signal(0);
        r.el.channel().signal(3);

        assert_eq!(run_until_idle(&mut r), None);
        assert_eq!(
            r.seen,
            vec![HandlerKind::Command, HandlerKind::ExtInputData(port)]
        );
    }

    #[test]
    fn unregistered_bit_is_dropped_from_mask() {
        let mut r = recorder(usize::MAX);
        r.el.register(0, HandlerKind::Command);
        r.el.register(5, HandlerKind::Command);
        r.el.registry.unregister(5);
        r.el.channel().signal(5);

        assert_eq!(run_until_idle(&mut r), None);
        assert!(r.seen.is_empty());
        assert_eq!(r.el.mask() & (1 << 5), 0);
        assert_eq!(r.el.poll(), 0);
    }

    #[test]
    fn terminate_exits_loop() {
        let mut r = recorder(1);
        r.el.register(0, HandlerKind::Command);
        r.el.channel().signal(0);
        assert_eq!(run(&mut r), LoopExit::Terminated);
    }

    struct FakePriority(AtomicI32);

    impl ThreadPriority for FakePriority {
        fn current(&self) -> i32 {
            self.0.load(Ordering::Relaxed)
        }
        fn set(&self, priority: i32) {
            self.0.store(priority, Ordering::Relaxed);
        }
    }

    #[test]
    fn boost_applies_only_to_commands_and_restores() {
        let prio = Arc::new(FakePriority(AtomicI32::new(10)));
        let mut el = EventLoop::new(WaitChannel::new());
        el.set_command_boost(prio.clone(), 50);

        assert!(el.boost_for(HandlerKind::ExtInputData(PortKey::new(1, 0))).is_none());
        let guard = el.boost_for(HandlerKind::Command);
        assert_eq!(prio.current(), 50);
        drop(guard);
        assert_eq!(prio.current(), 10);
    }
}
