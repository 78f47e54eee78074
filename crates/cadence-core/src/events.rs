//! Client event subscriptions.
//!
//! Clients subscribe to container or module events with a reply address.
//! A raised event is delivered once to every subscribed address. Removal
//! matches the exact address tuple.

use crossbeam_channel::Sender;

use crate::error::{CntrError, CntrResult};
use crate::ids::ModuleId;
use crate::params::{padded, read_u32};

/// A frame was delivered by a sink module.
pub const EVENT_FRAME_DELIVERY_DONE: u32 = 0x0800_1201;
/// Load (KPPS or bandwidth) of the container changed.
pub const EVENT_PERF_PARAMS_UPDATED: u32 = 0x0800_1202;
/// A persisted delay path changed value.
pub const EVENT_PATH_DELAY_CHANGED: u32 = 0x0800_1203;

/// Header of one packed registration record.
pub const REGISTRATION_HEADER_BYTES: usize = 16;

/// Reply address of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientAddress {
    /// Processor domain.
    pub domain: u32,
    /// Port within the domain.
    pub port: u32,
    /// Client-chosen token echoed in every event.
    pub token: u64,
}

/// Who raises an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventOwner {
    /// The container itself.
    Container,
    /// A module, with the container tracking its clients.
    Module(ModuleId),
}

/// An event on its way to one client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaisedEvent {
    /// Destination.
    pub client: ClientAddress,
    /// Raiser.
    pub owner: EventOwner,
    /// Event id.
    pub event_id: u32,
    /// Event payload.
    pub payload: Vec<u8>,
}

/// One (de)registration record borrowed from a packed buffer.
///
/// Layout: `module: u32, event_id: u32, is_register: u32, cfg_size: u32`
/// followed by the configuration padded to 8 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration<'a> {
    /// Addressed module (the container's own id for container events).
    pub module: ModuleId,
    /// Event id.
    pub event_id: u32,
    /// Register (`true`) or deregister.
    pub register: bool,
    /// Event configuration.
    pub cfg: &'a [u8],
}

/// Iterator over packed registration records; stops on truncation.
#[derive(Clone, Debug)]
pub struct RegistrationIter<'a> {
    buf: &'a [u8],
    pos: usize,
    truncated: bool,
}

impl<'a> RegistrationIter<'a> {
    /// Iterates `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            truncated: false,
        }
    }

    /// Returns `true` once iteration stopped on a truncated record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for RegistrationIter<'a> {
    type Item = Registration<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let at = self.pos;
        let header = (
            read_u32(self.buf, at),
            read_u32(self.buf, at + 4),
            read_u32(self.buf, at + 8),
            read_u32(self.buf, at + 12),
        );
        let start = at + REGISTRATION_HEADER_BYTES;
        let parsed = match header {
            (Some(module), Some(event_id), Some(register), Some(size)) => self
                .buf
                .get(start..start.saturating_add(size as usize))
                .map(|cfg| (module, event_id, register, cfg)),
            _ => None,
        };
        let Some((module, event_id, register, cfg)) = parsed else {
            tracing::warn!(offset = at, "event registration truncated, ignoring remainder");
            self.truncated = true;
            self.pos = self.buf.len();
            return None;
        };
        self.pos = (start + padded(cfg.len())).min(self.buf.len());
        Some(Registration {
            module: ModuleId(module),
            event_id,
            register: register != 0,
            cfg,
        })
    }
}

/// Encodes registration records.
pub fn encode_registrations(records: &[(ModuleId, u32, bool, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(module, event_id, register, cfg) in records {
        out.extend_from_slice(&module.0.to_le_bytes());
        out.extend_from_slice(&event_id.to_le_bytes());
        out.extend_from_slice(&u32::from(register).to_le_bytes());
        out.extend_from_slice(&(cfg.len() as u32).to_le_bytes());
        out.extend_from_slice(cfg);
        out.resize(out.len() + padded(cfg.len()) - cfg.len(), 0);
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Subscription {
    owner: EventOwner,
    event_id: u32,
    client: ClientAddress,
}

/// Subscriptions of one container and the outlet events are raised on.
#[derive(Debug, Default)]
pub struct EventRegistry {
    subs: Vec<Subscription>,
    outlet: Option<Sender<RaisedEvent>>,
}

impl EventRegistry {
    /// Creates a registry delivering to `outlet`, if any.
    pub fn new(outlet: Option<Sender<RaisedEvent>>) -> Self {
        Self {
            subs: Vec::new(),
            outlet,
        }
    }

    /// Subscribes `client`. Returns `false` if it already was.
    pub fn register(&mut self, owner: EventOwner, event_id: u32, client: ClientAddress) -> bool {
        let sub = Subscription {
            owner,
            event_id,
            client,
        };
        if self.subs.contains(&sub) {
            return false;
        }
        self.subs.push(sub);
        true
    }

    /// Removes the subscription matching exactly. Fails if there is none.
    pub fn deregister(
        &mut self,
        owner: EventOwner,
        event_id: u32,
        client: ClientAddress,
    ) -> CntrResult<()> {
        let sub = Subscription {
            owner,
            event_id,
            client,
        };
        let Some(idx) = self.subs.iter().position(|s| *s == sub) else {
            return Err(CntrError::failed(format!(
                "client {}:{} not registered for event 0x{event_id:X}",
                client.domain, client.port
            )));
        };
        self.subs.remove(idx);
        Ok(())
    }

    /// Drops every subscription to a module's events.
    pub fn remove_module(&mut self, module: ModuleId) -> usize {
        let before = self.subs.len();
        self.subs.retain(|s| s.owner != EventOwner::Module(module));
        before - self.subs.len()
    }

    /// Returns `true` if anyone subscribed to the event.
    pub fn has_clients(&self, owner: EventOwner, event_id: u32) -> bool {
        self.subs
            .iter()
            .any(|s| s.owner == owner && s.event_id == event_id)
    }

    /// Clients subscribed to the event.
    pub fn clients(&self, owner: EventOwner, event_id: u32) -> Vec<ClientAddress> {
        self.subs
            .iter()
            .filter(|s| s.owner == owner && s.event_id == event_id)
            .map(|s| s.client)
            .collect()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Returns `true` if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Raises an event to every subscribed client. Returns how many
    /// deliveries went out.
    pub fn raise(&self, owner: EventOwner, event_id: u32, payload: &[u8]) -> usize {
        let clients = self.clients(owner, event_id);
        if clients.is_empty() {
            return 0;
        }
        let Some(outlet) = &self.outlet else {
            tracing::debug!(event_id, ?owner, "event raised with no outlet");
            return 0;
        };
        let mut sent = 0;
        for client in clients {
            let event = RaisedEvent {
                client,
                owner,
                event_id,
                payload: payload.to_vec(),
            };
            if outlet.send(event).is_ok() {
                sent += 1;
            } else {
                tracing::warn!(event_id, "event outlet closed, dropping event");
                break;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(token: u64) -> ClientAddress {
        ClientAddress {
            domain: 1,
            port: 0x2001,
            token,
        }
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let mut reg = EventRegistry::default();
        assert!(reg.register(EventOwner::Container, EVENT_FRAME_DELIVERY_DONE, client(1)));
        assert!(!reg.register(EventOwner::Container, EVENT_FRAME_DELIVERY_DONE, client(1)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn deregister_matches_exact_address() {
        let mut reg = EventRegistry::default();
        reg.register(EventOwner::Container, EVENT_PERF_PARAMS_UPDATED, client(1));
        assert!(
            reg.deregister(EventOwner::Container, EVENT_PERF_PARAMS_UPDATED, client(2))
                .is_err()
        );
        reg.deregister(EventOwner::Container, EVENT_PERF_PARAMS_UPDATED, client(1))
            .unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn raise_reaches_every_subscriber_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reg = EventRegistry::new(Some(tx));
        let owner = EventOwner::Module(ModuleId(0x10));
        reg.register(owner, 7, client(1));
        reg.register(owner, 7, client(2));
        reg.register(owner, 8, client(3));

        assert_eq!(reg.raise(owner, 7, &[1, 2]), 2);
        let tokens: Vec<u64> = rx.try_iter().map(|e| e.client.token).collect();
        assert_eq!(tokens, vec![1, 2]);
        assert_eq!(reg.remove_module(ModuleId(0x10)), 3);
    }

    #[test]
    fn registrations_parse_until_truncation() {
        let cfg = [9u8; 3];
        let mut buf = encode_registrations(&[
            (ModuleId(0x10), 1, true, &cfg[..]),
            (ModuleId(0x11), 2, false, &[][..]),
        ]);
        buf.extend_from_slice(&[0; 10]);
        let mut iter = RegistrationIter::new(&buf);
        let got: Vec<_> = iter.by_ref().collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].cfg, &cfg);
        assert!(got[0].register && !got[1].register);
        assert!(iter.truncated());
    }
}
