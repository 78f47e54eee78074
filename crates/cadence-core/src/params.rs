//! Packed parameter buffers.
//!
//! A set/get-configuration payload is a sequence of little-endian records,
//! each a header followed by a payload padded to 8 bytes. Two framings
//! exist:
//!
//! | framing | header |
//! |---------|--------|
//! | shared-persistent | `param_id: u32, size: u32` |
//! | per-instance | `module: u32, param_id: u32, size: u32, error_code: u32` |
//!
//! Iteration stops at the first truncated header or payload; everything
//! before it is still yielded.

use crate::ids::ModuleId;

/// Header size of a shared-persistent record.
pub const SHARED_HEADER_BYTES: usize = 8;
/// Header size of a per-instance record.
pub const PER_INSTANCE_HEADER_BYTES: usize = 16;
/// Payload alignment.
pub const PARAM_ALIGN: usize = 8;

/// Container processing duration override (`u32` microseconds, set only).
pub const PARAM_PROC_DURATION: u32 = 0x0800_1101;
/// Container frame size (`kind: u32, value: u32`, set only).
///
/// `kind` is 0 for the default, 1 for microseconds, 2 for samples.
pub const PARAM_FRAME_SIZE: u32 = 0x0800_1102;
/// Container processing info (get only): frame length, period and
/// processing duration in microseconds, then the real-time flag.
pub const PARAM_PROC_PARAMS_INFO: u32 = 0x0800_1103;

/// Record framing of a packed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Every record addresses the same module, named once for the buffer.
    SharedPersistent {
        /// Addressed module.
        module: ModuleId,
    },
    /// Every record names its own module.
    PerInstance,
}

impl Framing {
    /// Header size of one record.
    pub fn header_bytes(self) -> usize {
        match self {
            Self::SharedPersistent { .. } => SHARED_HEADER_BYTES,
            Self::PerInstance => PER_INSTANCE_HEADER_BYTES,
        }
    }
}

/// Rounds `len` up to [`PARAM_ALIGN`].
pub fn padded(len: usize) -> usize {
    len.div_ceil(PARAM_ALIGN) * PARAM_ALIGN
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at.checked_add(4)?)?;
    bytes.try_into().ok().map(u32::from_le_bytes)
}

/// One record borrowed from a packed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamEntry<'a> {
    /// Addressed module.
    pub module: ModuleId,
    /// Parameter id.
    pub param_id: u32,
    /// Declared payload, without padding.
    pub payload: &'a [u8],
    /// Byte offset of the payload in the buffer; identifies the record.
    pub offset: usize,
    /// Error code field (per-instance only, else 0).
    pub error_code: u32,
}

/// Iterator over the records of a packed buffer.
#[derive(Clone, Debug)]
pub struct ParamIter<'a> {
    buf: &'a [u8],
    framing: Framing,
    pos: usize,
    truncated: bool,
}

impl<'a> ParamIter<'a> {
    /// Iterates `buf` with the given framing.
    pub fn new(buf: &'a [u8], framing: Framing) -> Self {
        Self {
            buf,
            framing,
            pos: 0,
            truncated: false,
        }
    }

    /// Returns `true` once iteration stopped on a truncated record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn stop_truncated(&mut self, what: &str) -> Option<ParamEntry<'a>> {
        tracing::warn!(
            offset = self.pos,
            len = self.buf.len(),
            "packed params: truncated {what}, ignoring remainder"
        );
        self.truncated = true;
        self.pos = self.buf.len();
        None
    }
}

impl<'a> Iterator for ParamIter<'a> {
    type Item = ParamEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let header = self.framing.header_bytes();
        if self.buf.len() - self.pos < header {
            return self.stop_truncated("header");
        }
        let at = self.pos;
        let (module, param_id, size, error_code) = match self.framing {
            Framing::SharedPersistent { module } => (
                Some(module.0),
                read_u32(self.buf, at),
                read_u32(self.buf, at + 4),
                Some(0),
            ),
            Framing::PerInstance => (
                read_u32(self.buf, at),
                read_u32(self.buf, at + 4),
                read_u32(self.buf, at + 8),
                read_u32(self.buf, at + 12),
            ),
        };
        let (Some(module), Some(param_id), Some(size), Some(error_code)) =
            (module, param_id, size, error_code)
        else {
            return self.stop_truncated("header");
        };

        let start = at + header;
        let size = size as usize;
        let remaining = self.buf.len() - start;
        if size > remaining {
            return self.stop_truncated("payload");
        }
        let payload = &self.buf[start..start + size];
        // The last record may omit its padding.
        self.pos = (start + padded(size)).min(self.buf.len());

        Some(ParamEntry {
            module: ModuleId(module),
            param_id,
            payload,
            offset: start,
            error_code,
        })
    }
}

/// An owned record, used to build buffers and replies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamRecord {
    /// Addressed module (ignored for shared-persistent framing).
    pub module: ModuleId,
    /// Parameter id.
    pub param_id: u32,
    /// Payload, unpadded.
    pub payload: Vec<u8>,
    /// Error code (per-instance framing only).
    pub error_code: u32,
}

impl ParamRecord {
    /// Record with no error.
    pub fn new(module: ModuleId, param_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            module,
            param_id,
            payload: payload.into(),
            error_code: 0,
        }
    }
}

/// Encodes records with the given framing.
pub fn encode(framing: Framing, records: &[ParamRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        records
            .iter()
            .map(|r| framing.header_bytes() + padded(r.payload.len()))
            .sum(),
    );
    for r in records {
        if framing == Framing::PerInstance {
            out.extend_from_slice(&r.module.0.to_le_bytes());
        }
        out.extend_from_slice(&r.param_id.to_le_bytes());
        out.extend_from_slice(&(r.payload.len() as u32).to_le_bytes());
        if framing == Framing::PerInstance {
            out.extend_from_slice(&r.error_code.to_le_bytes());
        }
        out.extend_from_slice(&r.payload);
        out.resize(out.len() + padded(r.payload.len()) - r.payload.len(), 0);
    }
    out
}

/// Encodes a list of `u32` words, little-endian.
pub fn encode_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<ParamRecord> {
        vec![
            ParamRecord::new(ModuleId(0x10), 1, vec![1, 2, 3]),
            ParamRecord::new(ModuleId(0x11), 2, vec![0; 8]),
            ParamRecord::new(ModuleId(0x10), 3, Vec::new()),
        ]
    }

    #[test]
    fn per_instance_records_are_yielded_in_order() {
        let buf = encode(Framing::PerInstance, &records());
        let got: Vec<_> = ParamIter::new(&buf, Framing::PerInstance)
            .map(|e| (e.module, e.param_id, e.payload.len()))
            .collect();
        assert_eq!(
            got,
            vec![
                (ModuleId(0x10), 1, 3),
                (ModuleId(0x11), 2, 8),
                (ModuleId(0x10), 3, 0),
            ]
        );
    }

    #[test]
    fn shared_framing_uses_buffer_module() {
        let framing = Framing::SharedPersistent {
            module: ModuleId(0x42),
        };
        let buf = encode(framing, &records());
        assert_eq!(buf.len(), 3 * SHARED_HEADER_BYTES + 8 + 8);
        assert!(ParamIter::new(&buf, framing).all(|e| e.module == ModuleId(0x42)));
    }

    #[test]
    fn oversized_payload_stops_iteration() {
        let mut buf = encode(Framing::PerInstance, &records()[..2]);
        let mut bad = encode(
            Framing::PerInstance,
            &[ParamRecord::new(ModuleId(0x10), 9, vec![0; 4])],
        );
        // Declare 64 bytes while only 8 follow.
        bad[8..12].copy_from_slice(&64u32.to_le_bytes());
        buf.extend_from_slice(&bad);

        let mut iter = ParamIter::new(&buf, Framing::PerInstance);
        assert_eq!(iter.by_ref().count(), 2);
        assert!(iter.truncated());
    }

    #[test]
    fn partial_header_stops_iteration() {
        let mut buf = encode(Framing::PerInstance, &records()[..1]);
        buf.extend_from_slice(&[0; 6]);
        let mut iter = ParamIter::new(&buf, Framing::PerInstance);
        assert_eq!(iter.by_ref().count(), 1);
        assert!(iter.truncated());
    }

    #[test]
    fn offsets_identify_records() {
        let buf = encode(Framing::PerInstance, &records());
        let offsets: Vec<_> = ParamIter::new(&buf, Framing::PerInstance)
            .map(|e| e.offset)
            .collect();
        assert_eq!(offsets, vec![16, 16 + 8 + 16, 16 + 8 + 16 + 8 + 16]);
    }

    #[test]
    fn unpadded_last_record_is_accepted() {
        let mut buf = encode(Framing::PerInstance, &records()[..1]);
        buf.truncate(PER_INSTANCE_HEADER_BYTES + 3);
        let mut iter = ParamIter::new(&buf, Framing::PerInstance);
        assert_eq!(iter.next().map(|e| e.payload), Some(&[1u8, 2, 3][..]));
        assert!(iter.next().is_none());
        assert!(!iter.truncated());
    }
}
