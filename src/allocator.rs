//! Register allocator: LRU-based acquisition, save/unload, spill-on-demand
//! over the four general-purpose registers.
//!
//! Grounded on `GetUnusedRegister`/`SaveAndUnloadRegister`/
//! `SaveAndUnloadAllRegisters`/`SaveVariable` in
//! `original_source/c-like-to-x86/DosExeEmitter.cpp`, and on the RAII
//! suppression guard in `SuppressRegister.h`/`.cpp`.

use std::collections::{HashMap, HashSet};

use crate::buffer::ByteBuffer;
use crate::error::{CompileError, CompileResult};
use crate::symbol::ScalarType;

/// The allocation unit. Sub-register views (AL/AH, CL/CH, ...) alias the
/// same physical slot and are never tracked separately: AL/CL/DL/BL happen
/// to share the exact ModRM `reg` encoding as AX/CX/DX/BX (fields 0-3), so
/// an 8-bit operation against one of these four just picks up the low byte
/// for free — no separate 8-bit register identity is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuRegister {
    Ax,
    Cx,
    Dx,
    Bx,
}

pub const ALL_REGISTERS: [CpuRegister; 4] =
    [CpuRegister::Ax, CpuRegister::Cx, CpuRegister::Dx, CpuRegister::Bx];

impl CpuRegister {
    /// The 3-bit `reg`/`rm` field this register occupies in a ModRM byte,
    /// independent of operand width.
    pub fn field(self) -> u8 {
        match self {
            CpuRegister::Ax => 0,
            CpuRegister::Cx => 1,
            CpuRegister::Dx => 2,
            CpuRegister::Bx => 3,
        }
    }
}

/// Where a variable's value lives when it isn't in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    /// Signed 8-bit offset from `BP`, assigned during frame layout.
    Stack(i8),
    /// Absolute DS-relative offset, resolved by a `DsAbs16` backpatch.
    Static,
}

/// Per-variable runtime record (`Variable Descriptor`). Created when
/// the emitter starts a function and destroyed on function exit (for
/// function-local descriptors); static descriptors live for the program.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: String,
    pub scalar_type: ScalarType,
    pub reg: Option<CpuRegister>,
    pub location: StorageLocation,
    pub last_used: usize,
    pub is_dirty: bool,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, scalar_type: ScalarType, location: StorageLocation) -> Self {
        Descriptor {
            name: name.into(),
            scalar_type,
            reg: None,
            location,
            last_used: 0,
            is_dirty: false,
        }
    }
}

/// A scoped guard that suppresses a register from allocation for as long as
/// the guard is alive. Mirrors `SuppressRegister`'s RAII acquire-on-
/// construction/release-on-destruction in the original source, ensuring the
/// suppression never outlives the instruction being emitted even if an error
/// propagates out early.
pub struct SuppressedRegisterGuard<'a> {
    suppressed: &'a mut HashSet<CpuRegister>,
    reg: CpuRegister,
}

impl<'a> SuppressedRegisterGuard<'a> {
    fn new(suppressed: &'a mut HashSet<CpuRegister>, reg: CpuRegister) -> Self {
        suppressed.insert(reg);
        SuppressedRegisterGuard { suppressed, reg }
    }
}

impl Drop for SuppressedRegisterGuard<'_> {
    fn drop(&mut self) {
        self.suppressed.remove(&self.reg);
    }
}

pub struct RegisterAllocator {
    descriptors: HashMap<String, Descriptor>,
    suppressed: HashSet<CpuRegister>,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        RegisterAllocator {
            descriptors: HashMap::new(),
            suppressed: HashSet::new(),
        }
    }

    pub fn declare(&mut self, descriptor: Descriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.suppressed.clear();
    }

    pub fn get(&self, name: &str) -> Option<&Descriptor> {
        self.descriptors.get(name)
    }

    pub fn suppress(&mut self, reg: CpuRegister) -> SuppressedRegisterGuard<'_> {
        SuppressedRegisterGuard::new(&mut self.suppressed, reg)
    }

    fn owner_of(&self, reg: CpuRegister) -> Option<&str> {
        self.descriptors
            .values()
            .find(|d| d.reg == Some(reg))
            .map(|d| d.name.as_str())
    }

    /// Non-spilling variant: a free, non-suppressed register, if one exists.
    pub fn try_get_unused(&self) -> Option<CpuRegister> {
        ALL_REGISTERS
            .into_iter()
            .find(|r| self.owner_of(*r).is_none() && !self.suppressed.contains(r))
    }

    /// Returns a register not currently bound to any descriptor. If all four
    /// (minus suppressed) are bound, evicts the descriptor with the smallest
    /// `last_used` and spills it.
    pub fn get_unused(
        &mut self,
        buf: &mut ByteBuffer,
        ip_src: usize,
        referenced_after: &HashSet<String>,
    ) -> CompileResult<CpuRegister> {
        if let Some(reg) = self.try_get_unused() {
            return Ok(reg);
        }

        let victim = ALL_REGISTERS
            .into_iter()
            .filter(|r| !self.suppressed.contains(r))
            .filter_map(|r| self.owner_of(r).map(|name| (r, name.to_string())))
            .min_by_key(|(_, name)| self.descriptors[name].last_used)
            .map(|(r, _)| r)
            .ok_or_else(|| {
                CompileError::internal(ip_src, "no unsuppressed register available to spill")
            })?;

        self.save_and_unload(buf, victim, ip_src, referenced_after)?;
        Ok(victim)
    }

    /// Spill policy (§4.3.1): write back only if `is_dirty` AND some later
    /// IR instruction in the same function references the variable.
    pub fn save_and_unload(
        &mut self,
        buf: &mut ByteBuffer,
        reg: CpuRegister,
        ip_src: usize,
        referenced_after: &HashSet<String>,
    ) -> CompileResult<()> {
        let owner_name = match self.owner_of(reg) {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };

        let (is_dirty, location, scalar_type) = {
            let d = &self.descriptors[&owner_name];
            (d.is_dirty, d.location, d.scalar_type)
        };

        if is_dirty && referenced_after.contains(&owner_name) {
            store_register_to_location(buf, reg, location, scalar_type, ip_src)?;
        } else if is_dirty {
            log::warn!(
                "ir#{ip_src}: skipping spill write-back for '{owner_name}' (not referenced again)"
            );
        }

        let d = self.descriptors.get_mut(&owner_name).unwrap();
        d.reg = None;
        d.is_dirty = false;
        Ok(())
    }

    /// Barrier applied before every control-transfer boundary: after this
    /// call, no variable of the current function has a register binding.
    pub fn save_and_unload_all(
        &mut self,
        buf: &mut ByteBuffer,
        ip_src: usize,
        referenced_after: &HashSet<String>,
    ) -> CompileResult<()> {
        for reg in ALL_REGISTERS {
            self.save_and_unload(buf, reg, ip_src, referenced_after)?;
        }
        Ok(())
    }

    /// Used only at `Return`: spills every dirty register unconditionally,
    /// ignoring whether the value is referenced again (it can't be — the
    /// function is ending) to leave frame state fully consistent before
    /// teardown, matching the function epilogue's register-saving discipline.
    pub fn force_save_and_unload_all(&mut self, buf: &mut ByteBuffer) -> CompileResult<()> {
        for reg in ALL_REGISTERS {
            let owner_name = match self.owner_of(reg) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let (is_dirty, location, scalar_type) = {
                let d = &self.descriptors[&owner_name];
                (d.is_dirty, d.location, d.scalar_type)
            };
            if is_dirty {
                store_register_to_location(buf, reg, location, scalar_type, 0)?;
            }
            let d = self.descriptors.get_mut(&owner_name).unwrap();
            d.reg = None;
            d.is_dirty = false;
        }
        Ok(())
    }

    /// Ensures `name`'s value is available in a register of at least
    /// `desired_size` bytes, performing the zero-extension mandated by the
    /// unsigned-only type system when the stored width is narrower.
    pub fn load_variable(
        &mut self,
        buf: &mut ByteBuffer,
        name: &str,
        desired_size: u32,
        ip_src: usize,
        referenced_after: &HashSet<String>,
    ) -> CompileResult<CpuRegister> {
        if let Some(reg) = self.descriptors.get(name).and_then(|d| d.reg) {
            if !self.suppressed.contains(&reg) {
                self.touch(name, ip_src);
                return Ok(reg);
            }
            // `reg` is off-limits for this call (e.g. DX/AX while emitting
            // Mul/Div/Rem) — relocate the live value to a free register
            // instead of handing back a register the caller is about to
            // clobber, or re-reading memory that a dirty value has already
            // diverged from.
            let (scalar_type, is_dirty) = {
                let d = &self.descriptors[name];
                (d.scalar_type, d.is_dirty)
            };
            let new_reg = self.get_unused(buf, ip_src, referenced_after)?;
            if scalar_type.size() < desired_size {
                emit_xor_reg_reg(buf, new_reg, new_reg, desired_size);
            }
            emit_mov_reg_reg(buf, new_reg, reg, scalar_type.size());
            let d = self.descriptors.get_mut(name).unwrap();
            d.reg = Some(new_reg);
            d.is_dirty = is_dirty;
            d.last_used = ip_src;
            return Ok(new_reg);
        }

        let (location, scalar_type) = {
            let d = self
                .descriptors
                .get(name)
                .ok_or_else(|| CompileError::internal(ip_src, format!("unknown variable '{name}'")))?;
            (d.location, d.scalar_type)
        };

        let reg = self.get_unused(buf, ip_src, referenced_after)?;
        load_location_to_register(buf, reg, location, scalar_type, desired_size, ip_src)?;

        let d = self.descriptors.get_mut(name).unwrap();
        d.reg = Some(reg);
        d.is_dirty = false;
        d.last_used = ip_src;
        Ok(reg)
    }

    /// Forces `name`'s value into a specific register, spilling that
    /// register's current tenant first.
    pub fn copy_variable_to(
        &mut self,
        buf: &mut ByteBuffer,
        name: &str,
        reg: CpuRegister,
        desired_size: u32,
        ip_src: usize,
        referenced_after: &HashSet<String>,
    ) -> CompileResult<()> {
        if self.owner_of(reg) != Some(name) {
            self.save_and_unload(buf, reg, ip_src, referenced_after)?;
        }
        let current = self.descriptors.get(name).and_then(|d| d.reg);
        if current != Some(reg) {
            let (location, scalar_type) = {
                let d = self
                    .descriptors
                    .get(name)
                    .ok_or_else(|| CompileError::internal(ip_src, format!("unknown variable '{name}'")))?;
                (d.location, d.scalar_type)
            };
            if current.is_none() {
                load_location_to_register(buf, reg, location, scalar_type, desired_size, ip_src)?;
            } else if scalar_type.size() < desired_size {
                emit_xor_reg_reg(buf, reg, reg, desired_size);
                emit_mov_reg_reg(buf, reg, current.unwrap(), scalar_type.size());
            } else {
                emit_mov_reg_reg(buf, reg, current.unwrap(), scalar_type.size());
            }
        }
        let d = self.descriptors.get_mut(name).unwrap();
        d.reg = Some(reg);
        d.last_used = ip_src;
        Ok(())
    }

    /// Emits `mov r, imm` with minimal encoding (`xor r, r` for zero).
    pub fn load_constant(&mut self, buf: &mut ByteBuffer, value: u32, reg: CpuRegister, size: u32) {
        if value == 0 {
            emit_xor_reg_reg(buf, reg, reg, size);
        } else if size <= 2 {
            buf.write_u8(0xB8 + reg.field());
            buf.write_u16(value as u16);
        } else {
            buf.write_u8(0x66);
            buf.write_u8(0xB8 + reg.field());
            buf.write_u32(value);
        }
    }

    /// Zeroes `reg` at `size` width (`xor reg, reg`) — exposed for callers
    /// outside the allocator (static loads) that need the same
    /// narrower-than-desired zero-extension the allocator applies to locals.
    pub fn zero_register(&mut self, buf: &mut ByteBuffer, reg: CpuRegister, size: u32) {
        emit_xor_reg_reg(buf, reg, reg, size);
    }

    pub fn bind_result(&mut self, name: &str, reg: CpuRegister, ip_src: usize) {
        if let Some(d) = self.descriptors.get_mut(name) {
            d.reg = Some(reg);
            d.is_dirty = true;
            d.last_used = ip_src;
        }
    }

    pub fn touch(&mut self, name: &str, ip_src: usize) {
        if let Some(d) = self.descriptors.get_mut(name) {
            d.last_used = ip_src;
        }
    }

    pub fn mark_dirty(&mut self, name: &str) {
        if let Some(d) = self.descriptors.get_mut(name) {
            d.is_dirty = true;
        }
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn emit_mov_reg_reg(buf: &mut ByteBuffer, to: CpuRegister, from: CpuRegister, size: u32) {
    let modrm = crate::encoding::to_xrm(3, from.field(), to.field());
    if size == 4 {
        buf.write_u8(0x66);
    }
    let opcode = if size == 1 { 0x88 } else { 0x89 };
    buf.write_u8(opcode);
    buf.write_u8(modrm);
}

fn emit_xor_reg_reg(buf: &mut ByteBuffer, to: CpuRegister, from: CpuRegister, size: u32) {
    let modrm = crate::encoding::to_xrm(3, from.field(), to.field());
    if size == 4 {
        buf.write_u8(0x66);
    }
    let opcode = if size == 1 { 0x30 } else { 0x31 };
    buf.write_u8(opcode);
    buf.write_u8(modrm);
}

/// `mov reg, [bp+disp8]` for locals, `mov reg, [static]` (address to be
/// backpatched by the caller) for statics. Statics must be resolved via a
/// `DsAbs16` backpatch by the caller before this is reached, since the final
/// address form differs by variable kind — here we only emit the stack
/// form; statics are handled in `emitter.rs` where the backpatch registry is
/// in scope.
fn load_location_to_register(
    buf: &mut ByteBuffer,
    reg: CpuRegister,
    location: StorageLocation,
    scalar_type: ScalarType,
    desired_size: u32,
    ip_src: usize,
) -> CompileResult<()> {
    match location {
        StorageLocation::Stack(disp) => {
            let size = scalar_type.size();
            // The value in memory is only `size` bytes wide; reading a
            // wider ModRM form than that would read adjacent memory. When
            // the caller needs more bytes than are stored, zero the whole
            // register first and then load only the bytes that exist.
            if size < desired_size {
                emit_xor_reg_reg(buf, reg, reg, desired_size);
            }
            if size == 4 {
                buf.write_u8(0x66);
            }
            let opcode = if size == 1 { 0x8A } else { 0x8B };
            buf.write_u8(opcode);
            buf.write_u8(crate::encoding::to_xrm(1, reg.field(), 6));
            buf.write_i8(disp);
            Ok(())
        }
        StorageLocation::Static => Err(CompileError::internal(
            ip_src,
            "static variable load must be routed through the emitter's backpatch path",
        )),
    }
}

fn store_register_to_location(
    buf: &mut ByteBuffer,
    reg: CpuRegister,
    location: StorageLocation,
    scalar_type: ScalarType,
    ip_src: usize,
) -> CompileResult<()> {
    match location {
        StorageLocation::Stack(disp) => {
            let size = scalar_type.size();
            if size == 4 {
                buf.write_u8(0x66);
            }
            let opcode = if size == 1 { 0x88 } else { 0x89 };
            buf.write_u8(opcode);
            buf.write_u8(crate::encoding::to_xrm(1, reg.field(), 6));
            buf.write_i8(disp);
            Ok(())
        }
        StorageLocation::Static => Err(CompileError::internal(
            ip_src,
            "static variable store must be routed through the emitter's backpatch path",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn referenced(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_unused_returns_free_register_first() {
        let mut alloc = RegisterAllocator::new();
        let mut buf = ByteBuffer::new();
        let reg = alloc.get_unused(&mut buf, 0, &referenced(&[])).unwrap();
        assert_eq!(reg, CpuRegister::Ax);
        assert!(buf.is_empty());
    }

    #[test]
    fn spill_writes_back_only_when_dirty_and_referenced_later() {
        let mut alloc = RegisterAllocator::new();
        alloc.declare(Descriptor::new("a", ScalarType::Uint16, StorageLocation::Stack(-2)));
        alloc.declare(Descriptor::new("b", ScalarType::Uint16, StorageLocation::Stack(-4)));
        alloc.declare(Descriptor::new("c", ScalarType::Uint16, StorageLocation::Stack(-6)));
        alloc.declare(Descriptor::new("d", ScalarType::Uint16, StorageLocation::Stack(-8)));
        alloc.declare(Descriptor::new("e", ScalarType::Uint16, StorageLocation::Stack(-10)));

        let mut buf = ByteBuffer::new();
        for name in ["a", "b", "c", "d"] {
            let reg = alloc.get_unused(&mut buf, 0, &referenced(&[])).unwrap();
            alloc.bind_result(name, reg, 0);
        }
        // mark "a" as oldest use so it gets evicted next, and dirty+referenced
        alloc.descriptors.get_mut("a").unwrap().last_used = 0;
        alloc.descriptors.get_mut("b").unwrap().last_used = 10;
        alloc.descriptors.get_mut("c").unwrap().last_used = 11;
        alloc.descriptors.get_mut("d").unwrap().last_used = 12;

        let before = buf.len();
        let reg = alloc
            .get_unused(&mut buf, 5, &referenced(&["a"]))
            .unwrap();
        assert!(buf.len() > before, "dirty + referenced-later value must be spilled");
        alloc.bind_result("e", reg, 5);
        assert!(alloc.get("a").unwrap().reg.is_none());
    }

    #[test]
    fn suppressed_register_is_skipped_and_released_on_drop() {
        let mut alloc = RegisterAllocator::new();
        {
            let _guard = alloc.suppress(CpuRegister::Ax);
            assert_eq!(alloc.try_get_unused(), Some(CpuRegister::Cx));
        }
        assert_eq!(alloc.try_get_unused(), Some(CpuRegister::Ax));
    }
}
