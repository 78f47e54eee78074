//! Module capability interface.
//!
//! The container never processes samples itself; it drives modules through
//! [`Module`], which exposes configuration, event registration, port
//! operations, delay queries and resource needs. Every method has a default
//! so simple modules only override what they support.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CntrError, CntrResult};
use crate::ids::PortId;
use crate::media::MediaFormat;

/// Which side of a module a port is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Data input.
    Input,
    /// Data output.
    Output,
    /// Control link.
    Control,
}

/// Operation applied to one port of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortOp {
    /// Port created or prepared.
    Open,
    /// Data flow begins.
    Start,
    /// Data flow ends.
    Stop,
    /// Data flow pauses.
    Suspend,
    /// Port torn down.
    Close,
}

/// Processing load a module asks the container to vote for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleResources {
    /// Thousands of packets (instructions) per second.
    pub kpps: u32,
    /// Memory bandwidth in bytes per second.
    pub bw_bytes_per_sec: u32,
}

impl core::ops::Add for ModuleResources {
    type Output = ModuleResources;

    fn add(self, rhs: Self) -> Self::Output {
        ModuleResources {
            kpps: self.kpps.saturating_add(rhs.kpps),
            bw_bytes_per_sec: self.bw_bytes_per_sec.saturating_add(rhs.bw_bytes_per_sec),
        }
    }
}

/// Who keeps the client list for a registered module event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventTracking {
    /// The module tracks its own clients.
    Module,
    /// The container tracks clients and raises on the module's behalf.
    Container,
}

/// A processing module hosted by a container.
pub trait Module: Send {
    /// Applies one configuration parameter.
    fn set_param(&mut self, param_id: u32, _payload: &[u8]) -> CntrResult<()> {
        Err(CntrError::unsupported(format!("param 0x{param_id:X}")))
    }

    /// Reads one configuration parameter.
    fn get_param(&mut self, param_id: u32) -> CntrResult<Vec<u8>> {
        Err(CntrError::unsupported(format!("param 0x{param_id:X}")))
    }

    /// Registers (or deregisters) interest in a module event.
    fn register_event(
        &mut self,
        event_id: u32,
        _register: bool,
        _cfg: &[u8],
    ) -> CntrResult<EventTracking> {
        Err(CntrError::unsupported(format!("event 0x{event_id:X}")))
    }

    /// Algorithmic delay between an input and an output, in microseconds.
    ///
    /// Either side may be `None` for source/sink modules.
    fn algorithmic_delay_us(&self, _input: Option<PortId>, _output: Option<PortId>) -> u32 {
        0
    }

    /// Notifies the module of a port lifecycle operation.
    fn port_operation(
        &mut self,
        _direction: PortDirection,
        _port: PortId,
        _op: PortOp,
    ) -> CntrResult<()> {
        Ok(())
    }

    /// Current processing load.
    fn resources(&self) -> ModuleResources {
        ModuleResources::default()
    }

    /// Stack the module needs on the container thread, in bytes.
    fn required_stack_bytes(&self) -> usize {
        0
    }

    /// Returns `false` while the module must not enter low-power island.
    fn allows_duty_cycling(&self) -> bool {
        true
    }

    /// Output media format given the format on its first input.
    fn output_media_format(&self, input: Option<MediaFormat>) -> Option<MediaFormat> {
        input
    }
}

/// A configurable module with no signal processing.
///
/// Stores parameters verbatim, reports a fixed delay and load, and records
/// every port operation it receives. Used by configuration-driven graphs
/// and by tests.
#[derive(Debug, Clone, Default)]
pub struct BasicModule {
    delay_us: u32,
    resources: ModuleResources,
    stack_bytes: usize,
    allows_duty_cycling: bool,
    output_format: Option<MediaFormat>,
    event_tracking: Option<EventTracking>,
    params: BTreeMap<u32, Vec<u8>>,
    events: BTreeSet<u32>,
    port_ops: Vec<(PortDirection, PortId, PortOp)>,
}

impl BasicModule {
    /// Parameter that sets the required stack (`u32` little-endian bytes).
    pub const PARAM_STACK_BYTES: u32 = 0x0800_1001;
    /// Parameter that sets the KPPS load (`u32` little-endian).
    pub const PARAM_KPPS: u32 = 0x0800_1002;
    /// Parameter that allows (non-zero) or vetoes (zero) duty cycling.
    pub const PARAM_DUTY_CYCLING: u32 = 0x0800_1003;

    /// Creates a module with no delay or load that allows duty cycling.
    pub fn new() -> Self {
        Self {
            allows_duty_cycling: true,
            ..Self::default()
        }
    }

    /// Sets the algorithmic delay.
    pub fn with_delay_us(mut self, delay_us: u32) -> Self {
        self.delay_us = delay_us;
        self
    }

    /// Sets the processing load.
    pub fn with_resources(mut self, kpps: u32, bw_bytes_per_sec: u32) -> Self {
        self.resources = ModuleResources {
            kpps,
            bw_bytes_per_sec,
        };
        self
    }

    /// Sets the required stack.
    pub fn with_stack_bytes(mut self, stack_bytes: usize) -> Self {
        self.stack_bytes = stack_bytes;
        self
    }

    /// Sets whether the module allows duty cycling.
    pub fn with_duty_cycling(mut self, allowed: bool) -> Self {
        self.allows_duty_cycling = allowed;
        self
    }

    /// Makes the module produce `format` regardless of its input.
    pub fn with_output_format(mut self, format: MediaFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Makes the module accept event registrations with the given tracking.
    pub fn with_events(mut self, tracking: EventTracking) -> Self {
        self.event_tracking = Some(tracking);
        self
    }

    /// Port operations received so far.
    pub fn port_ops(&self) -> &[(PortDirection, PortId, PortOp)] {
        &self.port_ops
    }

    /// Event ids currently registered.
    pub fn registered_events(&self) -> impl Iterator<Item = u32> + '_ {
        self.events.iter().copied()
    }
}

fn read_u32(payload: &[u8]) -> CntrResult<u32> {
    payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| CntrError::bad_param(format!("need 4 bytes, got {}", payload.len())))
}

impl Module for BasicModule {
    fn set_param(&mut self, param_id: u32, payload: &[u8]) -> CntrResult<()> {
        match param_id {
            Self::PARAM_STACK_BYTES => self.stack_bytes = read_u32(payload)? as usize,
            Self::PARAM_KPPS => self.resources.kpps = read_u32(payload)?,
            Self::PARAM_DUTY_CYCLING => self.allows_duty_cycling = read_u32(payload)? != 0,
            _ => {}
        }
        self.params.insert(param_id, payload.to_vec());
        Ok(())
    }

    fn get_param(&mut self, param_id: u32) -> CntrResult<Vec<u8>> {
        self.params
            .get(&param_id)
            .cloned()
            .ok_or_else(|| CntrError::unsupported(format!("param 0x{param_id:X} never set")))
    }

    fn register_event(
        &mut self,
        event_id: u32,
        register: bool,
        _cfg: &[u8],
    ) -> CntrResult<EventTracking> {
        let tracking = self
            .event_tracking
            .ok_or_else(|| CntrError::unsupported(format!("event 0x{event_id:X}")))?;
        if register {
            self.events.insert(event_id);
        } else {
            self.events.remove(&event_id);
        }
        Ok(tracking)
    }

    fn algorithmic_delay_us(&self, _input: Option<PortId>, _output: Option<PortId>) -> u32 {
        self.delay_us
    }

    fn port_operation(
        &mut self,
        direction: PortDirection,
        port: PortId,
        op: PortOp,
    ) -> CntrResult<()> {
        self.port_ops.push((direction, port, op));
        Ok(())
    }

    fn resources(&self) -> ModuleResources {
        self.resources
    }

    fn required_stack_bytes(&self) -> usize {
        self.stack_bytes
    }

    fn allows_duty_cycling(&self) -> bool {
        self.allows_duty_cycling
    }

    fn output_media_format(&self, input: Option<MediaFormat>) -> Option<MediaFormat> {
        self.output_format.or(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_module_stores_params() {
        let mut m = BasicModule::new();
        m.set_param(0x10, &[1, 2, 3]).unwrap();
        assert_eq!(m.get_param(0x10).unwrap(), vec![1, 2, 3]);
        assert!(m.get_param(0x11).is_err());
    }

    #[test]
    fn special_params_change_capabilities() {
        let mut m = BasicModule::new();
        m.set_param(BasicModule::PARAM_STACK_BYTES, &65_536u32.to_le_bytes())
            .unwrap();
        m.set_param(BasicModule::PARAM_KPPS, &900u32.to_le_bytes())
            .unwrap();
        m.set_param(BasicModule::PARAM_DUTY_CYCLING, &0u32.to_le_bytes())
            .unwrap();
        assert_eq!(m.required_stack_bytes(), 65_536);
        assert_eq!(m.resources().kpps, 900);
        assert!(!m.allows_duty_cycling());
        assert!(m.set_param(BasicModule::PARAM_KPPS, &[1]).is_err());
    }

    #[test]
    fn events_unsupported_unless_enabled() {
        let mut m = BasicModule::new();
        assert!(m.register_event(5, true, &[]).is_err());
        let mut m = BasicModule::new().with_events(EventTracking::Container);
        assert_eq!(m.register_event(5, true, &[]), Ok(EventTracking::Container));
        assert_eq!(m.registered_events().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn output_format_overrides_input() {
        let fmt = MediaFormat::pcm(48_000, 2, 16);
        let m = BasicModule::new();
        assert_eq!(m.output_media_format(Some(fmt)), Some(fmt));
        let src = BasicModule::new().with_output_format(MediaFormat::pcm(16_000, 1, 16));
        assert_eq!(src.output_media_format(None).map(|f| f.sample_rate), Some(16_000));
    }
}
