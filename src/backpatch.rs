//! Deferred writes into earlier buffer positions once their targets become
//! known.

use crate::buffer::ByteBuffer;
use crate::error::{CompileError, CompileResult};

/// What a backpatch entry ultimately resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A known IR index — resolved once the emitter has recorded its
    /// `ip_dst` in the `ip_src -> ip_dst` map.
    IrIndex(usize),
    Label(String),
    Function(String),
    StaticString(String),
    StaticScalar(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// `*(i8)(buf+offset) = target_ip_dst - anchor_ip_dst`. Fatal if the
    /// result overflows a signed 8-bit value.
    Rel8 {
        offset: usize,
        anchor_ip_dst: usize,
        target: Target,
        ir_index: usize,
    },
    /// `*(i16)(buf+offset) = target_ip_dst - anchor_ip_dst`.
    Rel16 {
        offset: usize,
        anchor_ip_dst: usize,
        target: Target,
        ir_index: usize,
    },
    /// `*(u16)(buf+offset) = static_base + offset_of_string_or_static`.
    DsAbs16 {
        offset: usize,
        target: Target,
        ir_index: usize,
    },
    /// `*(i8)(buf+offset) = finalized_stack_offset_of_local`.
    Stack8 {
        offset: usize,
        local_name: String,
        ir_index: usize,
    },
}

/// Append-only during emission, drained in resolution order: locals, then
/// statics/strings, then IP/label/function targets. Each
/// resolution pass only resolves the entries its lookup function can
/// currently answer for — shared-function call targets, for instance, stay
/// pending until the packager has decided which helpers are appended to the
/// image and at what offset. A category is only considered final once
/// `assert_drained` is called after every expected pass has run.
#[derive(Debug, Default)]
pub struct BackpatchRegistry {
    entries: Vec<Entry>,
}

impl BackpatchRegistry {
    pub fn new() -> Self {
        BackpatchRegistry::default()
    }

    pub fn add(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Resolves every `Stack8` entry whose `offset_of(name)` currently
    /// answers `Some`; anything else is left pending.
    pub fn resolve_locals(&mut self, buf: &mut ByteBuffer, offset_of: impl Fn(&str) -> Option<i8>) {
        let mut remaining = Vec::new();
        for entry in self.entries.drain(..) {
            match &entry {
                Entry::Stack8 {
                    offset, local_name, ..
                } => match offset_of(local_name) {
                    Some(v) => buf.patch_i8_at(*offset, v),
                    None => remaining.push(entry),
                },
                _ => remaining.push(entry),
            }
        }
        self.entries = remaining;
    }

    /// Resolves every `DsAbs16` entry whose `address_of(target)` currently
    /// answers `Some`; anything else is left pending.
    pub fn resolve_statics(&mut self, buf: &mut ByteBuffer, address_of: impl Fn(&Target) -> Option<u16>) {
        let mut remaining = Vec::new();
        for entry in self.entries.drain(..) {
            match &entry {
                Entry::DsAbs16 { offset, target, .. } => match address_of(target) {
                    Some(v) => buf.patch_u16_at(*offset, v),
                    None => remaining.push(entry),
                },
                _ => remaining.push(entry),
            }
        }
        self.entries = remaining;
    }

    /// Resolves every `Rel8`/`Rel16` entry whose `ip_dst_of(target)`
    /// currently answers `Some`; anything else is left pending. A `Rel8`
    /// whose computed displacement doesn't fit a signed byte is always a
    /// hard `EncodingError`, even though the target itself did resolve.
    pub fn resolve_targets(
        &mut self,
        buf: &mut ByteBuffer,
        ip_dst_of: impl Fn(&Target) -> Option<usize>,
    ) -> CompileResult<()> {
        let mut remaining = Vec::new();
        for entry in self.entries.drain(..) {
            match &entry {
                Entry::Rel8 {
                    offset,
                    anchor_ip_dst,
                    target,
                    ir_index,
                } => match ip_dst_of(target) {
                    Some(target_ip_dst) => {
                        let disp = target_ip_dst as i64 - *anchor_ip_dst as i64;
                        if !(-128..=127).contains(&disp) {
                            return Err(CompileError::encoding(
                                *ir_index,
                                "short-jump displacement beyond +/-127",
                            ));
                        }
                        buf.patch_i8_at(*offset, disp as i8);
                    }
                    None => remaining.push(entry),
                },
                Entry::Rel16 {
                    offset,
                    anchor_ip_dst,
                    target,
                    ir_index,
                } => match ip_dst_of(target) {
                    Some(target_ip_dst) => {
                        let disp = target_ip_dst as i64 - *anchor_ip_dst as i64;
                        if !(i16::MIN as i64..=i16::MAX as i64).contains(&disp) {
                            return Err(CompileError::encoding(
                                *ir_index,
                                "near-jump displacement beyond a signed 16-bit range",
                            ));
                        }
                        buf.patch_i16_at(*offset, disp as i16);
                    }
                    None => remaining.push(entry),
                },
                _ => remaining.push(entry),
            }
        }
        self.entries = remaining;
        Ok(())
    }

    /// After every expected resolution pass has run, the registry must be
    /// empty; a remaining entry is an internal error.
    pub fn assert_drained(&self) -> CompileResult<()> {
        if let Some(entry) = self.entries.first() {
            return Err(CompileError::internal(
                0,
                format!("backpatch registry not drained: {entry:?}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel8_resolves_forward_jump() {
        let mut buf = ByteBuffer::new();
        let off = buf.reserve(1);
        let mut registry = BackpatchRegistry::new();
        registry.add(Entry::Rel8 {
            offset: off,
            anchor_ip_dst: 10,
            target: Target::IrIndex(5),
            ir_index: 0,
        });
        registry
            .resolve_targets(&mut buf, |t| match t {
                Target::IrIndex(5) => Some(15),
                _ => None,
            })
            .unwrap();
        assert_eq!(buf.as_slice()[off] as i8, 5);
        assert!(registry.is_empty());
    }

    #[test]
    fn rel8_overflow_is_encoding_error() {
        let mut buf = ByteBuffer::new();
        let off = buf.reserve(1);
        let mut registry = BackpatchRegistry::new();
        registry.add(Entry::Rel8 {
            offset: off,
            anchor_ip_dst: 0,
            target: Target::IrIndex(1),
            ir_index: 0,
        });
        let err = registry
            .resolve_targets(&mut buf, |_| Some(200))
            .unwrap_err();
        assert!(matches!(err, CompileError::Encoding { .. }));
    }

    #[test]
    fn unresolved_target_stays_pending_until_answered() {
        let mut buf = ByteBuffer::new();
        let off = buf.reserve(2);
        let mut registry = BackpatchRegistry::new();
        registry.add(Entry::Rel16 {
            offset: off,
            anchor_ip_dst: 0,
            target: Target::Function("PrintString".to_string()),
            ir_index: 0,
        });
        registry.resolve_targets(&mut buf, |_| None).unwrap();
        assert_eq!(registry.pending_count(), 1);
        registry.assert_drained().unwrap_err();

        registry
            .resolve_targets(&mut buf, |_| Some(42))
            .unwrap();
        registry.assert_drained().unwrap();
    }
}
