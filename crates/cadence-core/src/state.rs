//! Subgraph and port lifecycle states.
//!
//! A subgraph moves `Stopped → Prepared → Started`, with `Suspended`
//! reachable from `Started`. Ports carry a [`PortState`] that is the
//! *downgraded* combination of their own subgraph's state and whatever the
//! connected peer has reported; see [`PortState::downgrade`].

use core::fmt;

/// Lifecycle state of a subgraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SubgraphState {
    /// Created or stopped; no data flows.
    #[default]
    Stopped,
    /// Media format and buffering resolved; ready to start.
    Prepared,
    /// Data flows.
    Started,
    /// Paused without releasing prepared resources.
    Suspended,
    /// Transient value used by operations that do not change state.
    Invalid,
}

/// Lifecycle state of a port.
///
/// Ordered `Invalid < Stopped < Suspended < Prepared < Started` for display
/// only; use [`downgrade`](Self::downgrade) to combine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum PortState {
    /// Unknown or not applicable.
    #[default]
    Invalid,
    /// Stopped.
    Stopped,
    /// Suspended.
    Suspended,
    /// Prepared.
    Prepared,
    /// Started.
    Started,
}

impl PortState {
    /// Combines a port's own state with its connected/propagated state.
    ///
    /// The result is the "lowest" of the two under
    /// `Stopped < Suspended < Prepared < Started`. If either side is
    /// `Invalid` the result is `Invalid`.
    pub fn downgrade(self, connected: PortState) -> PortState {
        if self == PortState::Invalid || connected == PortState::Invalid {
            return PortState::Invalid;
        }
        if self <= connected { self } else { connected }
    }

    /// Returns `true` for `Prepared` and `Started`: the states in which a
    /// peer is allowed to receive propagated properties.
    pub fn is_prepared_or_started(self) -> bool {
        matches!(self, PortState::Prepared | PortState::Started)
    }

    /// Returns `true` if the state may be propagated to an upstream peer.
    ///
    /// `Prepared` is never propagated: it would trigger a needless
    /// upstream-stop acknowledgment handshake.
    pub fn is_propagatable_upstream(self) -> bool {
        matches!(
            self,
            PortState::Stopped | PortState::Suspended | PortState::Started
        )
    }
}

impl From<SubgraphState> for PortState {
    fn from(state: SubgraphState) -> Self {
        match state {
            SubgraphState::Stopped => PortState::Stopped,
            SubgraphState::Prepared => PortState::Prepared,
            SubgraphState::Started => PortState::Started,
            SubgraphState::Suspended => PortState::Suspended,
            SubgraphState::Invalid => PortState::Invalid,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Prepared => "prepared",
            Self::Started => "started",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SubgraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Prepared => "prepared",
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// A graph-management operation applied to a set of subgraphs and ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubgraphOp {
    /// Resolve media format and buffering.
    Prepare,
    /// Begin data flow.
    Start,
    /// End data flow.
    Stop,
    /// Pause data flow.
    Suspend,
    /// Drop in-flight data without changing state.
    Flush,
    /// Tear down.
    Close,
}

impl SubgraphOp {
    /// The subgraph state after the operation, or `Invalid` when the
    /// operation does not change state.
    pub fn target_state(self) -> SubgraphState {
        match self {
            Self::Prepare => SubgraphState::Prepared,
            Self::Start => SubgraphState::Started,
            Self::Stop => SubgraphState::Stopped,
            Self::Suspend => SubgraphState::Suspended,
            Self::Flush | Self::Close => SubgraphState::Invalid,
        }
    }

    /// The connected-port state implied by the operation.
    pub fn port_state(self) -> PortState {
        self.target_state().into()
    }

    /// Operations after which real-time flags are re-propagated.
    pub fn repropagates_rt(self) -> bool {
        matches!(
            self,
            Self::Prepare | Self::Stop | Self::Suspend | Self::Close
        )
    }

    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Flush => "flush",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for SubgraphOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: [PortState; 4] = [
        PortState::Stopped,
        PortState::Suspended,
        PortState::Prepared,
        PortState::Started,
    ];

    #[test]
    fn downgrade_table() {
        use PortState::*;
        assert_eq!(Started.downgrade(Started), Started);
        assert_eq!(Started.downgrade(Prepared), Prepared);
        assert_eq!(Started.downgrade(Suspended), Suspended);
        assert_eq!(Started.downgrade(Stopped), Stopped);
        assert_eq!(Prepared.downgrade(Suspended), Suspended);
        assert_eq!(Prepared.downgrade(Started), Prepared);
        assert_eq!(Suspended.downgrade(Prepared), Suspended);
        assert_eq!(Stopped.downgrade(Started), Stopped);
        assert_eq!(Invalid.downgrade(Started), Invalid);
        assert_eq!(Started.downgrade(Invalid), Invalid);
    }

    #[test]
    fn downgrade_is_commutative() {
        for a in VALID {
            for b in VALID {
                assert_eq!(a.downgrade(b), b.downgrade(a));
            }
        }
    }

    #[test]
    fn prepared_is_never_propagated_upstream() {
        assert!(!PortState::Prepared.is_propagatable_upstream());
        assert!(!PortState::Invalid.is_propagatable_upstream());
        assert!(PortState::Stopped.is_propagatable_upstream());
        assert!(PortState::Started.is_propagatable_upstream());
    }

    #[test]
    fn op_states() {
        assert_eq!(SubgraphOp::Start.port_state(), PortState::Started);
        assert_eq!(SubgraphOp::Flush.target_state(), SubgraphState::Invalid);
        assert_eq!(SubgraphOp::Close.port_state(), PortState::Invalid);
        assert!(SubgraphOp::Close.repropagates_rt());
        assert!(!SubgraphOp::Start.repropagates_rt());
    }
}
