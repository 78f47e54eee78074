//! Send-once-per-change propagation of port properties across containers.
//!
//! Every property a port exposes to its peer is wrapped in a
//! [`PropagatedProperty`]. A send goes out only when the value differs from
//! what was last delivered; a failed send rolls the cache back so the next
//! natural trigger retries it.

use crate::error::{CntrError, CntrResult};
use crate::state::PortState;

/// Most properties carried by one peer message.
pub const MAX_PROPERTIES_PER_MESSAGE: usize = 2;

/// Delivery state of one property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PropagationState {
    /// Never delivered (or reset by disconnect).
    #[default]
    Unsent,
    /// The cached value reached the peer.
    Sent,
    /// The last attempt failed; the next trigger retries.
    SendFailedPendingRetry,
}

/// Outcome of [`PropagatedProperty::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peer already has this value.
    Suppressed,
    /// The value was sent.
    Sent,
    /// Sending failed and the cache was rolled back.
    Failed(CntrError),
}

impl SendOutcome {
    /// Returns `true` if a message went out.
    pub fn was_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Cache and state machine for one outbound property.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagatedProperty<T> {
    state: PropagationState,
    last_sent: Option<T>,
}

impl<T: Copy + PartialEq> PropagatedProperty<T> {
    /// Creates an unsent property.
    pub fn new() -> Self {
        Self {
            state: PropagationState::Unsent,
            last_sent: None,
        }
    }

    /// Current delivery state.
    pub fn state(&self) -> PropagationState {
        self.state
    }

    /// Value the peer is known to hold.
    pub fn last_sent(&self) -> Option<T> {
        match self.state {
            PropagationState::Sent => self.last_sent,
            _ => None,
        }
    }

    /// Returns `true` if `value` would be sent by [`try_send`](Self::try_send).
    pub fn needs_send(&self, value: T) -> bool {
        self.state != PropagationState::Sent || self.last_sent != Some(value)
    }

    /// Sends `value` through `send` unless the peer already holds it.
    ///
    /// On failure the cache returns to its pre-attempt value and the state
    /// becomes [`PropagationState::SendFailedPendingRetry`].
    pub fn try_send(&mut self, value: T, send: impl FnOnce(T) -> CntrResult<()>) -> SendOutcome {
        if !self.needs_send(value) {
            return SendOutcome::Suppressed;
        }
        let previous = self.last_sent;
        self.state = PropagationState::Sent;
        self.last_sent = Some(value);
        match send(value) {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                self.state = PropagationState::SendFailedPendingRetry;
                self.last_sent = previous;
                SendOutcome::Failed(err)
            }
        }
    }

    /// Forgets what was sent; used when the peer goes away.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// A property exchanged between peer ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProperty {
    /// At an input: whether its upstream is real time.
    IsUpstreamRt(bool),
    /// At an output: whether its downstream is real time.
    IsDownstreamRt(bool),
    /// At an output: the downstream's topology state.
    TopoState(PortState),
}

/// Packs properties into peer messages of at most
/// [`MAX_PROPERTIES_PER_MESSAGE`] entries.
pub fn batch_properties(props: &[PortProperty]) -> impl Iterator<Item = &[PortProperty]> {
    props.chunks(MAX_PROPERTIES_PER_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn same_value_twice_sends_once() {
        let sends = Cell::new(0);
        let mut prop = PropagatedProperty::<bool>::new();
        let send = |_v: bool| {
            sends.set(sends.get() + 1);
            Ok(())
        };
        assert_eq!(prop.try_send(true, send), SendOutcome::Sent);
        assert_eq!(prop.try_send(true, send), SendOutcome::Suppressed);
        assert_eq!(sends.get(), 1);
        assert_eq!(prop.try_send(false, send), SendOutcome::Sent);
        assert_eq!(sends.get(), 2);
    }

    #[test]
    fn failure_rolls_back_and_retries() {
        let mut prop = PropagatedProperty::<bool>::new();
        prop.try_send(false, |_| Ok(()));

        let out = prop.try_send(true, |_| Err(CntrError::not_ready("no peer")));
        assert!(matches!(out, SendOutcome::Failed(_)));
        assert_eq!(prop.state(), PropagationState::SendFailedPendingRetry);
        assert_eq!(prop.last_sent(), None);
        assert!(prop.needs_send(true));
        // Even the old value is resent: delivery is no longer known.
        assert!(prop.needs_send(false));

        assert_eq!(prop.try_send(true, |_| Ok(())), SendOutcome::Sent);
        assert_eq!(prop.last_sent(), Some(true));
    }

    #[test]
    fn reset_forces_resend() {
        let mut prop = PropagatedProperty::<PortState>::new();
        prop.try_send(PortState::Started, |_| Ok(()));
        prop.reset();
        assert_eq!(prop.state(), PropagationState::Unsent);
        assert!(prop.needs_send(PortState::Started));
    }

    #[test]
    fn batches_hold_two_properties() {
        let props = [
            PortProperty::IsDownstreamRt(true),
            PortProperty::TopoState(PortState::Stopped),
            PortProperty::IsDownstreamRt(false),
        ];
        let sizes: Vec<usize> = batch_properties(&props).map(<[_]>::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }
}
