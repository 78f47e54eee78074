//! Island (duty-cycle) handshake with an external duty-cycling manager.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CntrResult;

/// Acknowledgment a container gives to an island request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IslandAck {
    /// Island entry is fine.
    EntryAllowed,
    /// Island exit is done.
    ExitAllowed,
    /// Entry refused: gapless playback in progress.
    EntryBlockedGapless,
}

/// Requests a duty-cycling manager sends to a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DcmRequest {
    /// Enter island.
    IslandEntry,
    /// Leave island.
    IslandExit,
    /// Island entry was blocked; it may be attempted again.
    UnblockIslandEntry,
}

/// External duty-cycling manager.
pub trait DutyCycleManager: Send {
    /// Registers a client.
    fn register(&mut self, client: &str, log_id: u32) -> CntrResult<()>;
    /// Deregisters the client.
    fn deregister(&mut self, client: &str) -> CntrResult<()>;
    /// Sends an acknowledgment.
    fn acknowledge(&mut self, client: &str, ack: IslandAck) -> CntrResult<()>;
}

/// One call observed by a [`RecordingDutyCycleManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DcmCall {
    /// `register`.
    Register(String, u32),
    /// `deregister`.
    Deregister(String),
    /// `acknowledge`.
    Acknowledge(String, IslandAck),
}

/// Duty-cycling manager that records every call; clones share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingDutyCycleManager {
    calls: Arc<Mutex<Vec<DcmCall>>>,
}

impl RecordingDutyCycleManager {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calls so far.
    pub fn calls(&self) -> Vec<DcmCall> {
        self.calls.lock().clone()
    }

    /// Acknowledgments sent so far.
    pub fn acks(&self) -> Vec<IslandAck> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                DcmCall::Acknowledge(_, ack) => Some(*ack),
                _ => None,
            })
            .collect()
    }
}

impl DutyCycleManager for RecordingDutyCycleManager {
    fn register(&mut self, client: &str, log_id: u32) -> CntrResult<()> {
        self.calls
            .lock()
            .push(DcmCall::Register(client.to_owned(), log_id));
        Ok(())
    }

    fn deregister(&mut self, client: &str) -> CntrResult<()> {
        self.calls.lock().push(DcmCall::Deregister(client.to_owned()));
        Ok(())
    }

    fn acknowledge(&mut self, client: &str, ack: IslandAck) -> CntrResult<()> {
        self.calls
            .lock()
            .push(DcmCall::Acknowledge(client.to_owned(), ack));
        Ok(())
    }
}

/// Container-side duty-cycle state.
#[derive(Default)]
pub struct DutyCycleState {
    manager: Option<Box<dyn DutyCycleManager>>,
    registered: bool,
    /// Island entry is vetoed, by a module or by the container's heap.
    pub module_disallows: bool,
}

impl core::fmt::Debug for DutyCycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DutyCycleState")
            .field("has_manager", &self.manager.is_some())
            .field("registered", &self.registered)
            .field("module_disallows", &self.module_disallows)
            .finish()
    }
}

impl DutyCycleState {
    /// State bound to an optional manager.
    pub fn new(manager: Option<Box<dyn DutyCycleManager>>) -> Self {
        Self {
            manager,
            registered: false,
            module_disallows: false,
        }
    }

    /// Returns `true` once registered.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Registers once; no-op without a manager.
    pub fn register(&mut self, client: &str, log_id: u32) -> CntrResult<()> {
        if self.registered {
            return Ok(());
        }
        if let Some(m) = self.manager.as_mut() {
            m.register(client, log_id)?;
            self.registered = true;
            tracing::debug!(client, "dcm registered");
        }
        Ok(())
    }

    /// Deregisters if registered.
    pub fn deregister(&mut self, client: &str) -> CntrResult<()> {
        if !self.registered {
            return Ok(());
        }
        if let Some(m) = self.manager.as_mut() {
            m.deregister(client)?;
        }
        self.registered = false;
        Ok(())
    }

    /// Answers an island-entry request.
    ///
    /// While a module disallows duty cycling the answer is
    /// [`IslandAck::EntryBlockedGapless`] and no acknowledgment command is
    /// sent to the manager.
    pub fn handle_entry(&mut self, client: &str) -> CntrResult<IslandAck> {
        if self.module_disallows {
            tracing::debug!(client, "island entry blocked by module");
            return Ok(IslandAck::EntryBlockedGapless);
        }
        self.acknowledge(client, IslandAck::EntryAllowed)?;
        Ok(IslandAck::EntryAllowed)
    }

    /// Answers an island-exit request.
    pub fn handle_exit(&mut self, client: &str) -> CntrResult<IslandAck> {
        self.acknowledge(client, IslandAck::ExitAllowed)?;
        Ok(IslandAck::ExitAllowed)
    }

    fn acknowledge(&mut self, client: &str, ack: IslandAck) -> CntrResult<()> {
        match self.manager.as_mut() {
            Some(m) if self.registered => m.acknowledge(client, ack),
            _ => Ok(()),
        }
    }
}
