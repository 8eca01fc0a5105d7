//! x86 instruction emitter — the core of this compiler.
//!
//! Walks the IR linearly, maintaining `ip_src` (the IR index) and `ip_dst`
//! (the code-buffer offset), lowering each instruction to bytes while
//! consulting the register allocator (C5) and recording deferred fixes in
//! the backpatch registry (C6). Grounded throughout on
//! `DosExeEmitter::EmitInstructions`/`EmitAssign`/`EmitGoto`/`EmitGotoLabel`/
//! `EmitIf`/`EmitPush`/`EmitCall`/`EmitReturn` in
//! `original_source/c-like-to-x86/DosExeEmitter.cpp`.

use std::collections::{HashMap, HashSet};

use crate::allocator::{CpuRegister, Descriptor, RegisterAllocator, StorageLocation};
use crate::backpatch::{BackpatchRegistry, Entry, Target};
use crate::buffer::ByteBuffer;
use crate::encoding::to_xrm;
use crate::error::{CompileError, CompileResult};
use crate::ir::{AssignOp, CompareOp, Instruction, Operand, OperandKind};
use crate::symbol::{ReturnType, ScalarType, Symbol, SymbolKind, SymbolTable};

/// BP/SP occupy ModRM register-field slots 5/4 but are never allocation
/// targets for variables — they're frame-management registers only.
const REG_FIELD_SP: u8 = 4;
const REG_FIELD_BP: u8 = 5;

/// Rough bytes-per-IR-instruction estimate used to decide whether an `If`'s
/// short jump should be promoted to the two-instruction near-jump form
/// before the true displacement is known (a 10-byte safety margin against
/// the rel8 range, per DESIGN.md's open-question note).
const ESTIMATED_BYTES_PER_IR: i64 = 6;
const REL8_SAFETY_MARGIN: i64 = 10;

pub struct EmitOutput {
    pub code: Vec<u8>,
    pub backpatch: BackpatchRegistry,
    pub string_literals: Vec<String>,
    pub static_scalars: Vec<(String, u32)>,
    pub entry_ip_dst: usize,
}

#[derive(Clone)]
struct FunctionFrame {
    name: String,
    end_ip_src: usize,
    return_type: ReturnType,
    param_area_size: u32,
    is_entry_point: bool,
}

#[derive(Default)]
struct StringTable {
    order: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> usize {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.order.len();
        self.order.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

pub struct Emitter<'a> {
    symbols: &'a SymbolTable,
    buf: ByteBuffer,
    backpatch: BackpatchRegistry,
    ip_src_to_ip_dst: HashMap<usize, usize>,
    /// Prologue-start offset for each function/entry-point IR index, captured
    /// before `emit_prologue` runs — this, not `ip_src_to_ip_dst`, is what
    /// `Target::Function` call sites must resolve against, since a `call`
    /// has to land on the callee's `push ebp` rather than skip past it.
    function_entry_ip_dst: HashMap<usize, usize>,
    strings: StringTable,
    param_stack: Vec<String>,
    alloc: RegisterAllocator,
    frame: Option<FunctionFrame>,
    entry_ip_dst: Option<usize>,
}

impl<'a> Emitter<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Emitter {
            symbols,
            buf: ByteBuffer::new(),
            backpatch: BackpatchRegistry::new(),
            ip_src_to_ip_dst: HashMap::new(),
            function_entry_ip_dst: HashMap::new(),
            strings: StringTable::default(),
            param_stack: Vec::new(),
            alloc: RegisterAllocator::new(),
            frame: None,
            entry_ip_dst: None,
        }
    }

    pub fn emit_program(mut self, instructions: &[Instruction]) -> CompileResult<EmitOutput> {
        let function_starts = self.collect_function_starts();
        let mut sorted_starts: Vec<usize> = function_starts.keys().copied().collect();
        sorted_starts.sort_unstable();

        for ip_src in 0..instructions.len() {
            if let Some(symbol) = function_starts.get(&ip_src) {
                let end_ip_src = sorted_starts
                    .iter()
                    .copied()
                    .find(|&s| s > ip_src)
                    .unwrap_or(instructions.len());
                self.start_function(*symbol, end_ip_src)?;
            }
            self.ip_src_to_ip_dst.insert(ip_src, self.buf.len());
            let instruction = &instructions[ip_src];
            self.emit_one(ip_src, instruction, instructions)?;
        }

        // Every user-defined function/label/IR-index target is now known;
        // shared-function call targets remain pending until the packager
        // decides which helpers are appended and where.
        let ip_src_to_ip_dst = self.ip_src_to_ip_dst.clone();
        let function_entry_ip_dst = self.function_entry_ip_dst.clone();
        let symbols = self.symbols;
        self.backpatch.resolve_targets(&mut self.buf, |target| {
            resolve_user_target(target, &ip_src_to_ip_dst, &function_entry_ip_dst, symbols)
        })?;

        let entry_ip_dst = self
            .entry_ip_dst
            .ok_or_else(|| CompileError::internal(0, "program has no EntryPoint symbol"))?;

        let static_scalars = self
            .symbols
            .all_static_scalars()
            .map(|s| (s.name.clone(), s.size()))
            .collect();

        Ok(EmitOutput {
            code: self.buf.finalize(),
            backpatch: self.backpatch,
            string_literals: self.strings.order,
            static_scalars,
            entry_ip_dst,
        })
    }

    /// Maps each function/entry-point's first IR index to its symbol, per
    /// §4.4's "function prologue IR position (derived from the symbol
    /// table)".
    fn collect_function_starts(&self) -> HashMap<usize, &'a Symbol> {
        let mut starts = HashMap::new();
        for idx in 0.. {
            let Some(symbol) = self.symbols.symbol_at(idx) else {
                break;
            };
            if matches!(symbol.kind, SymbolKind::Function | SymbolKind::EntryPoint) {
                starts.insert(symbol.ip.get() as usize, symbol);
            }
        }
        starts
    }

    fn start_function(&mut self, symbol: &'a Symbol, end_ip_src: usize) -> CompileResult<()> {
        log::debug!("emitting '{}' at ip_dst={}", symbol.name, self.buf.len());
        self.alloc.clear();
        let is_entry_point = symbol.kind == SymbolKind::EntryPoint;
        self.function_entry_ip_dst
            .insert(symbol.ip.get() as usize, self.buf.len());

        let (descriptors, locals_size) = build_frame_locals(self.symbols, &symbol.name)?;
        for d in descriptors {
            self.alloc.declare(d);
        }
        let param_descriptors = build_frame_params(self.symbols, &symbol.name)?;
        let param_area_size = param_descriptors.iter().map(|d| d.scalar_type.size()).sum();
        for d in param_descriptors {
            self.alloc.declare(d);
        }

        if is_entry_point {
            self.entry_ip_dst = Some(self.buf.len());
        }

        self.frame = Some(FunctionFrame {
            name: symbol.name.clone(),
            end_ip_src,
            return_type: symbol.return_type.unwrap_or(ReturnType::Void),
            param_area_size,
            is_entry_point,
        });

        self.emit_prologue(is_entry_point, locals_size);
        Ok(())
    }

    fn emit_prologue(&mut self, is_entry_point: bool, locals_size: u32) {
        if is_entry_point {
            // DOS sets DS to the PSP segment, one paragraph behind CS, on
            // entry to an .EXE — not equal to CS. Every direct-offset static
            // reference this emitter generates assumes DS==CS, so the entry
            // point fixes that up first. The original source never does
            // this (see DESIGN.md); this crate always emits it.
            self.buf.write_u8(0x8C);
            self.buf.write_u8(to_xrm(3, 1, 0)); // mov ax, cs
            self.buf.write_u8(0x8E);
            self.buf.write_u8(to_xrm(3, 3, 0)); // mov ds, ax
        } else {
            self.buf.write_u8(0x66);
            self.buf.write_u8(0x50 + REG_FIELD_BP); // push ebp
        }
        self.buf.write_u8(0x66);
        self.buf.write_u8(0x89);
        self.buf.write_u8(to_xrm(3, REG_FIELD_SP, REG_FIELD_BP)); // mov ebp, esp

        if locals_size > 0 {
            // `sub esp, imm16` — the 0x66 prefix marks the 32-bit register
            // operand while the immediate itself stays 16-bit; this mirrors
            // the original compiler's literal intent (see DESIGN.md) rather
            // than strict encode-by-the-book 0x66 semantics.
            self.buf.write_u8(0x66);
            self.buf.write_u8(0x81);
            self.buf.write_u8(to_xrm(3, 5, REG_FIELD_SP)); // /5 = SUB
            self.buf.write_u16(locals_size as u16);
        }
    }

    fn emit_one(
        &mut self,
        ip_src: usize,
        instruction: &Instruction,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        log::trace!("ir#{ip_src} -> ip_dst={}: {instruction:?}", self.buf.len());
        match instruction {
            Instruction::Assign { op, dst, a, b } => {
                self.emit_assign(ip_src, *op, dst, a, b.as_ref(), instructions)
            }
            Instruction::Goto { target_ip } => {
                self.emit_goto(ip_src, Target::IrIndex(*target_ip), instructions)
            }
            Instruction::GotoLabel { label } => {
                let target = self.label_target(label, ip_src)?;
                self.emit_goto(ip_src, target, instructions)
            }
            Instruction::If {
                compare,
                a,
                b,
                target_ip,
            } => self.emit_if(ip_src, *compare, a, b, *target_ip, instructions),
            Instruction::Push { symbol } => {
                self.param_stack.push(symbol.clone());
                Ok(())
            }
            Instruction::Call { target, return_dst } => {
                self.emit_call(ip_src, target, return_dst.as_deref(), instructions)
            }
            Instruction::Return { value } => self.emit_return(ip_src, value.as_ref()),
        }
    }

    fn label_target(&self, label: &str, ip_src: usize) -> CompileResult<Target> {
        let symbol = self
            .symbols
            .resolve_label(label)
            .ok_or_else(|| CompileError::internal(ip_src, format!("unknown label '{label}'")))?;
        Ok(Target::IrIndex(symbol.ip.get() as usize))
    }

    fn referenced_after(&self, ip_src: usize, instructions: &[Instruction]) -> HashSet<String> {
        let end = self
            .frame
            .as_ref()
            .map(|f| f.end_ip_src)
            .unwrap_or(instructions.len());
        names_referenced_in(instructions, ip_src + 1, end)
    }

    /// Resolves the symbol for a variable operand: function-local first
    /// (via the allocator's descriptor table), falling back to a static.
    fn is_static(&self, name: &str) -> bool {
        self.alloc.get(name).is_none()
            && self
                .symbols
                .lookup_variable(None, name)
                .map(|s| s.kind == SymbolKind::ScalarVar)
                .unwrap_or(false)
    }

    fn materialize(
        &mut self,
        operand: &Operand,
        desired_size: u32,
        ip_src: usize,
        instructions: &[Instruction],
    ) -> CompileResult<CpuRegister> {
        match operand.kind {
            OperandKind::Constant => {
                let reg = {
                    let referenced = self.referenced_after(ip_src, instructions);
                    self.alloc.get_unused(&mut self.buf, ip_src, &referenced)?
                };
                let value = operand.as_u32().ok_or_else(|| {
                    CompileError::internal(ip_src, format!("bad constant literal '{}'", operand.value))
                })?;
                self.alloc.load_constant(&mut self.buf, value, reg, desired_size);
                Ok(reg)
            }
            OperandKind::Variable => {
                if self.is_static(&operand.value) {
                    self.load_static(&operand.value, desired_size, ip_src)
                } else {
                    let referenced = self.referenced_after(ip_src, instructions);
                    self.alloc
                        .load_variable(&mut self.buf, &operand.value, desired_size, ip_src, &referenced)
                }
            }
        }
    }

    fn load_static(&mut self, name: &str, desired_size: u32, ip_src: usize) -> CompileResult<CpuRegister> {
        let referenced = HashSet::new();
        let reg = self.alloc.get_unused(&mut self.buf, ip_src, &referenced)?;
        self.emit_load_static_mov(name, reg, desired_size, ip_src);
        Ok(reg)
    }

    /// Loads the static `name` into `reg`, widened to `desired_size`. The
    /// memory read is always exactly the static's declared size — reading
    /// more would read into whatever static was laid out next — so a
    /// `desired_size` wider than that gets a zero-extend first, the same
    /// rule `allocator::load_location_to_register` applies to locals.
    fn emit_load_static_mov(&mut self, name: &str, reg: CpuRegister, desired_size: u32, ip_src: usize) {
        let native_size = self
            .symbols
            .lookup_variable(None, name)
            .map(|s| s.size())
            .unwrap_or(desired_size);
        if native_size < desired_size {
            self.alloc.zero_register(&mut self.buf, reg, desired_size);
        }
        if native_size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if native_size == 1 { 0x8A } else { 0x8B };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(0, reg.field(), 6)); // direct address, disp16 follows
        let disp_offset = self.buf.write_u16(0);
        self.backpatch.add(Entry::DsAbs16 {
            offset: disp_offset,
            target: Target::StaticScalar(name.to_string()),
            ir_index: ip_src,
        });
    }

    /// Forces `operand`'s value into exactly `reg`, spilling whatever `reg`
    /// currently holds first. Used by the two-operand-register instructions
    /// (Mul/Div/Rem/Shl/Shr) that need a fixed hardware register regardless
    /// of where the allocator would otherwise have placed the value.
    fn force_operand_into(
        &mut self,
        operand: &Operand,
        reg: CpuRegister,
        size: u32,
        ip_src: usize,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let referenced = self.referenced_after(ip_src, instructions);
        match operand.kind {
            OperandKind::Variable if self.is_static(&operand.value) => {
                self.alloc.save_and_unload(&mut self.buf, reg, ip_src, &referenced)?;
                self.emit_load_static_mov(&operand.value, reg, size, ip_src);
                Ok(())
            }
            OperandKind::Variable => {
                self.alloc
                    .copy_variable_to(&mut self.buf, &operand.value, reg, size, ip_src, &referenced)
            }
            OperandKind::Constant => {
                self.alloc.save_and_unload(&mut self.buf, reg, ip_src, &referenced)?;
                let value = operand
                    .as_u32()
                    .ok_or_else(|| CompileError::internal(ip_src, format!("bad constant literal '{}'", operand.value)))?;
                self.alloc.load_constant(&mut self.buf, value, reg, size);
                Ok(())
            }
        }
    }

    fn store_static(&mut self, name: &str, reg: CpuRegister, ip_src: usize) {
        let size = self.symbols.lookup_variable(None, name).map(|s| s.size()).unwrap_or(2);
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0x88 } else { 0x89 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(0, reg.field(), 6));
        let disp_offset = self.buf.write_u16(0);
        self.backpatch.add(Entry::DsAbs16 {
            offset: disp_offset,
            target: Target::StaticScalar(name.to_string()),
            ir_index: ip_src,
        });
    }

    fn bind_dst(&mut self, dst: &str, reg: CpuRegister, ip_src: usize) {
        if self.is_static(dst) {
            self.store_static(dst, reg, ip_src);
        } else {
            self.alloc.bind_result(dst, reg, ip_src);
        }
    }

    fn emit_assign(
        &mut self,
        ip_src: usize,
        op: AssignOp,
        dst: &str,
        a: &Operand,
        b: Option<&Operand>,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let size = self.dst_size(dst, a, b).max(2);

        match op {
            AssignOp::None => self.emit_assign_none(ip_src, dst, a, size, instructions),
            AssignOp::Negate => {
                let reg = self.materialize(a, size, ip_src, instructions)?;
                self.emit_unary(reg, size, 3); // neg is /3
                self.bind_dst(dst, reg, ip_src);
                Ok(())
            }
            AssignOp::Add | AssignOp::Sub => self.emit_add_sub(ip_src, op, dst, a, b, size, instructions),
            AssignOp::Mul => self.emit_mul(ip_src, dst, a, b, size, instructions),
            AssignOp::Div | AssignOp::Rem => self.emit_div_rem(ip_src, op, dst, a, b, size, instructions),
            AssignOp::Shl | AssignOp::Shr => self.emit_shift(ip_src, op, dst, a, b, size, instructions),
        }
    }

    fn dst_size(&self, dst: &str, a: &Operand, b: Option<&Operand>) -> u32 {
        self.symbols
            .lookup_variable(self.frame.as_ref().map(|f| f.name.as_str()), dst)
            .map(|s| s.size())
            .unwrap_or_else(|| a.scalar_type.size().max(b.map(|b| b.scalar_type.size()).unwrap_or(0)))
    }

    fn emit_assign_none(
        &mut self,
        ip_src: usize,
        dst: &str,
        a: &Operand,
        size: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        if a.kind == OperandKind::Constant && a.scalar_type == ScalarType::String {
            let reg = {
                let referenced = self.referenced_after(ip_src, instructions);
                self.alloc.get_unused(&mut self.buf, ip_src, &referenced)?
            };
            self.strings.intern(&a.value);
            self.buf.write_u8(0xB8 + reg.field());
            let disp_offset = self.buf.write_u16(0);
            self.backpatch.add(Entry::DsAbs16 {
                offset: disp_offset,
                target: Target::StaticString(a.value.clone()),
                ir_index: ip_src,
            });
            self.bind_dst(dst, reg, ip_src);
            return Ok(());
        }
        let reg = self.materialize(a, size, ip_src, instructions)?;
        self.bind_dst(dst, reg, ip_src);
        Ok(())
    }

    fn canonicalize<'op>(&self, compare: CompareOp, a: &'op Operand, b: &'op Operand) -> (CompareOp, &'op Operand, &'op Operand) {
        if a.is_constant() && !b.is_constant() {
            (compare.swapped(), b, a)
        } else {
            (compare, a, b)
        }
    }

    fn emit_add_sub(
        &mut self,
        ip_src: usize,
        op: AssignOp,
        dst: &str,
        a: &Operand,
        b: Option<&Operand>,
        size: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let b = b.ok_or_else(|| CompileError::internal(ip_src, "Add/Sub missing second operand"))?;

        if a.is_constant() && b.is_constant() {
            if a.scalar_type == ScalarType::String && b.scalar_type == ScalarType::String && op == AssignOp::Add {
                let concatenated = format!("{}{}", a.value, b.value);
                let reg = {
                    let referenced = self.referenced_after(ip_src, instructions);
                    self.alloc.get_unused(&mut self.buf, ip_src, &referenced)?
                };
                self.strings.intern(&concatenated);
                self.buf.write_u8(0xB8 + reg.field());
                let disp_offset = self.buf.write_u16(0);
                self.backpatch.add(Entry::DsAbs16 {
                    offset: disp_offset,
                    target: Target::StaticString(concatenated),
                    ir_index: ip_src,
                });
                self.bind_dst(dst, reg, ip_src);
                return Ok(());
            }
            let av = a.as_u32().ok_or_else(|| CompileError::internal(ip_src, "bad constant"))?;
            let bv = b.as_u32().ok_or_else(|| CompileError::internal(ip_src, "bad constant"))?;
            let folded = if op == AssignOp::Add {
                av.wrapping_add(bv)
            } else {
                av.wrapping_sub(bv)
            };
            let reg = {
                let referenced = self.referenced_after(ip_src, instructions);
                self.alloc.get_unused(&mut self.buf, ip_src, &referenced)?
            };
            self.alloc.load_constant(&mut self.buf, folded, reg, size);
            self.bind_dst(dst, reg, ip_src);
            return Ok(());
        }

        let (op, a, b) = if b.is_constant() {
            (op, a, b)
        } else if a.is_constant() && op == AssignOp::Add {
            (op, b, a) // addition commutes; keep the variable as operand 1
        } else {
            (op, a, b)
        };

        let ra = self.materialize(a, size, ip_src, instructions)?;
        if b.is_constant() {
            let value = b.as_u32().ok_or_else(|| CompileError::internal(ip_src, "bad constant"))?;
            self.emit_alu_imm(ra, size, value, if op == AssignOp::Add { 0 } else { 5 });
        } else {
            let rb = self.materialize(b, size, ip_src, instructions)?;
            self.emit_alu_reg(ra, rb, size, op == AssignOp::Add);
        }
        self.bind_dst(dst, ra, ip_src);
        Ok(())
    }

    fn emit_mul(
        &mut self,
        ip_src: usize,
        dst: &str,
        a: &Operand,
        b: Option<&Operand>,
        size: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let b = b.ok_or_else(|| CompileError::internal(ip_src, "Mul missing second operand"))?;
        self.force_operand_into(a, CpuRegister::Ax, size, ip_src, instructions)?;
        // `mul` writes DX:AX unconditionally; any variable still resident in
        // either register has to be written back before the opcode clobbers
        // it, not just excluded from future allocation.
        let referenced = self.referenced_after(ip_src, instructions);
        self.alloc
            .save_and_unload(&mut self.buf, CpuRegister::Dx, ip_src, &referenced)?;
        self.alloc
            .save_and_unload(&mut self.buf, CpuRegister::Ax, ip_src, &referenced)?;
        let _dx_guard = self.alloc.suppress(CpuRegister::Dx);
        let _ax_guard = self.alloc.suppress(CpuRegister::Ax);
        let rb = self.materialize(b, size, ip_src, instructions)?;
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0xF6 } else { 0xF7 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, 4, rb.field())); // /4 = MUL
        drop(_dx_guard);
        self.bind_dst(dst, CpuRegister::Ax, ip_src);
        Ok(())
    }

    fn emit_div_rem(
        &mut self,
        ip_src: usize,
        op: AssignOp,
        dst: &str,
        a: &Operand,
        b: Option<&Operand>,
        size: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let b = b.ok_or_else(|| CompileError::internal(ip_src, "Div/Rem missing second operand"))?;
        self.force_operand_into(a, CpuRegister::Ax, size, ip_src, instructions)?;

        // `div` clobbers DX unconditionally (the `xor dx, dx` below and the
        // division both write it) and AX holds the dividend we just loaded —
        // flush any prior tenant of either register before suppressing them,
        // the same way `mul` does.
        let referenced = self.referenced_after(ip_src, instructions);
        self.alloc
            .save_and_unload(&mut self.buf, CpuRegister::Dx, ip_src, &referenced)?;
        self.alloc
            .save_and_unload(&mut self.buf, CpuRegister::Ax, ip_src, &referenced)?;

        let ax_guard = self.alloc.suppress(CpuRegister::Ax);
        let dx_guard = self.alloc.suppress(CpuRegister::Dx);
        let rb = self.materialize(b, size, ip_src, instructions)?;
        drop(ax_guard);
        drop(dx_guard);

        if size == 4 {
            self.buf.write_u8(0x66);
        }
        self.buf.write_u8(0x31); // xor dx, dx (zero-extend dividend)
        self.buf.write_u8(to_xrm(3, 2, 2));

        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0xF6 } else { 0xF7 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, 6, rb.field())); // /6 = DIV

        let result_reg = if op == AssignOp::Div {
            CpuRegister::Ax
        } else {
            CpuRegister::Dx
        };
        self.bind_dst(dst, result_reg, ip_src);
        Ok(())
    }

    fn emit_shift(
        &mut self,
        ip_src: usize,
        op: AssignOp,
        dst: &str,
        a: &Operand,
        b: Option<&Operand>,
        size: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let b = b.ok_or_else(|| CompileError::internal(ip_src, "Shl/Shr missing second operand"))?;
        let ra = {
            let _cx_guard = self.alloc.suppress(CpuRegister::Cx);
            self.materialize(a, size, ip_src, instructions)?
        };
        self.force_operand_into(b, CpuRegister::Cx, 1, ip_src, instructions)?;

        // 32-bit shifts need the 0x66 prefix ahead of the opcode — the
        // original source drops it here (see DESIGN.md); this always emits
        // it correctly.
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0xD2 } else { 0xD3 };
        let reg_field = if op == AssignOp::Shl { 4 } else { 5 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, reg_field, ra.field()));
        self.bind_dst(dst, ra, ip_src);
        Ok(())
    }

    fn emit_unary(&mut self, reg: CpuRegister, size: u32, reg_field: u8) {
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0xF6 } else { 0xF7 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, reg_field, reg.field()));
    }

    fn emit_alu_imm(&mut self, reg: CpuRegister, size: u32, value: u32, reg_field: u8) {
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0x80 } else { 0x81 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, reg_field, reg.field()));
        if size == 1 {
            self.buf.write_u8(value as u8);
        } else if size == 4 {
            self.buf.write_u32(value);
        } else {
            self.buf.write_u16(value as u16);
        }
    }

    fn emit_alu_reg(&mut self, to: CpuRegister, from: CpuRegister, size: u32, is_add: bool) {
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if is_add {
            if size == 1 {
                0x00
            } else {
                0x01
            }
        } else if size == 1 {
            0x28
        } else {
            0x29
        };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, from.field(), to.field()));
    }

    fn emit_goto(&mut self, ip_src: usize, target: Target, instructions: &[Instruction]) -> CompileResult<()> {
        if let Target::IrIndex(t) = target {
            if t == ip_src {
                return Err(CompileError::internal(ip_src, "self-loop goto"));
            }
            if t == ip_src + 1 {
                return Ok(()); // single-step forward jump elided entirely
            }
        }
        {
            let referenced = self.referenced_after(ip_src, instructions);
            self.alloc.save_and_unload_all(&mut self.buf, ip_src, &referenced)?;
        }
        self.buf.write_u8(0xE9);
        let offset = self.buf.write_u16(0);
        let anchor_ip_dst = self.buf.len();
        self.backpatch.add(Entry::Rel16 {
            offset,
            anchor_ip_dst,
            target,
            ir_index: ip_src,
        });
        Ok(())
    }

    fn condition_code(compare: CompareOp) -> u8 {
        match compare {
            CompareOp::LogOr | CompareOp::LogAnd => 0x75, // jnz
            CompareOp::Eq => 0x74,
            CompareOp::Ne => 0x75,
            CompareOp::Gt => 0x77,
            CompareOp::Lt => 0x72,
            CompareOp::Ge => 0x73,
            CompareOp::Le => 0x76,
        }
    }

    fn inverted_condition_code(compare: CompareOp) -> u8 {
        match compare {
            CompareOp::LogOr | CompareOp::LogAnd => 0x74, // jz
            CompareOp::Eq => 0x75,
            CompareOp::Ne => 0x74,
            CompareOp::Gt => 0x76,
            CompareOp::Lt => 0x73,
            CompareOp::Ge => 0x72,
            CompareOp::Le => 0x77,
        }
    }

    fn emit_if(
        &mut self,
        ip_src: usize,
        compare: CompareOp,
        a: &Operand,
        b: &Operand,
        target_ip: usize,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        if a.is_constant() && b.is_constant() {
            let truth = evaluate_constant_compare(compare, a, b)
                .ok_or_else(|| CompileError::internal(ip_src, "bad constant compare"))?;
            return if truth {
                self.emit_goto(ip_src, Target::IrIndex(target_ip), instructions)
            } else {
                Ok(())
            };
        }

        let (compare, a, b) = self.canonicalize(compare, a, b);
        let size = a.scalar_type.size().max(b.scalar_type.size()).max(2);
        let ra = self.materialize(a, size, ip_src, instructions)?;

        match compare {
            CompareOp::LogOr | CompareOp::LogAnd => {
                let opcode_reg_field: u8 = if compare == CompareOp::LogOr { 1 } else { 4 };
                if b.is_constant() {
                    let value = b.as_u32().ok_or_else(|| CompileError::internal(ip_src, "bad constant"))?;
                    self.emit_alu_imm(ra, size, value, opcode_reg_field);
                } else {
                    let rb = self.materialize(b, size, ip_src, instructions)?;
                    self.emit_bitwise_reg(ra, rb, size, compare == CompareOp::LogOr);
                }
            }
            _ => {
                if b.is_constant() {
                    let value = b.as_u32().ok_or_else(|| CompileError::internal(ip_src, "bad constant"))?;
                    self.emit_alu_imm(ra, size, value, 7); // /7 = CMP
                } else {
                    let rb = self.materialize(b, size, ip_src, instructions)?;
                    self.emit_cmp_reg(ra, rb, size);
                }
            }
        }

        {
            let referenced = self.referenced_after(ip_src, instructions);
            self.alloc.save_and_unload_all(&mut self.buf, ip_src, &referenced)?;
        }

        let estimated_distance = (target_ip as i64 - ip_src as i64).unsigned_abs() as i64 * ESTIMATED_BYTES_PER_IR;
        let promote = estimated_distance > 127 - REL8_SAFETY_MARGIN;

        if promote {
            self.buf.write_u8(Self::inverted_condition_code(compare));
            let skip_offset = self.buf.write_u8(0);
            let skip_anchor = self.buf.len() + 3; // size of the jmp rel16 that follows
            self.buf.patch_i8_at(skip_offset, (skip_anchor - self.buf.len()) as i8);

            self.buf.write_u8(0xE9);
            let jmp_offset = self.buf.write_u16(0);
            let anchor_ip_dst = self.buf.len();
            self.backpatch.add(Entry::Rel16 {
                offset: jmp_offset,
                anchor_ip_dst,
                target: Target::IrIndex(target_ip),
                ir_index: ip_src,
            });
        } else {
            self.buf.write_u8(Self::condition_code(compare));
            let offset = self.buf.write_u8(0);
            let anchor_ip_dst = self.buf.len();
            self.backpatch.add(Entry::Rel8 {
                offset,
                anchor_ip_dst,
                target: Target::IrIndex(target_ip),
                ir_index: ip_src,
            });
        }
        Ok(())
    }

    fn emit_bitwise_reg(&mut self, to: CpuRegister, from: CpuRegister, size: u32, is_or: bool) {
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if is_or {
            if size == 1 {
                0x08
            } else {
                0x09
            }
        } else if size == 1 {
            0x20
        } else {
            0x21
        };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, from.field(), to.field()));
    }

    fn emit_cmp_reg(&mut self, to: CpuRegister, from: CpuRegister, size: u32) {
        if size == 4 {
            self.buf.write_u8(0x66);
        }
        let opcode = if size == 1 { 0x38 } else { 0x39 };
        self.buf.write_u8(opcode);
        self.buf.write_u8(to_xrm(3, from.field(), to.field()));
    }

    fn emit_call(
        &mut self,
        ip_src: usize,
        target: &str,
        return_dst: Option<&str>,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        let formals: Vec<(u32, bool)> = if let Some(sym) = self.symbols.resolve_shared_function(target) {
            sym.bump_ref_count();
            crate::shared::formal_widths(target)
                .iter()
                .map(|&w| (w, false))
                .collect()
        } else {
            self.symbols
                .parameters_of(target)
                .iter()
                .map(|s| (s.size(), s.scalar_type == Some(ScalarType::String)))
                .collect()
        };

        if formals.len() != self.param_stack.len() {
            return Err(CompileError::internal(
                ip_src,
                format!(
                    "call to '{target}' arity mismatch: {} args pushed, {} declared",
                    self.param_stack.len(),
                    formals.len()
                ),
            ));
        }

        let args: Vec<String> = self.param_stack.drain(..).collect();
        for (arg_name, (width, _is_string)) in args.into_iter().zip(formals.into_iter()).rev() {
            self.emit_push_argument(ip_src, &arg_name, width, instructions)?;
        }

        self.buf.write_u8(0xE8);
        let offset = self.buf.write_u16(0);
        let anchor_ip_dst = self.buf.len();
        self.backpatch.add(Entry::Rel16 {
            offset,
            anchor_ip_dst,
            target: Target::Function(target.to_string()),
            ir_index: ip_src,
        });

        if let Some(dst) = return_dst {
            self.bind_dst(dst, CpuRegister::Ax, ip_src);
        }
        Ok(())
    }

    fn emit_push_argument(
        &mut self,
        ip_src: usize,
        arg_name: &str,
        width: u32,
        instructions: &[Instruction],
    ) -> CompileResult<()> {
        // An argument that is itself a string *literal* never reaches here
        // as a bare variable name — the parser always materializes string
        // constant arguments into a temp variable first, so looking the
        // name up as a variable/static is always correct.
        let width = width.max(2);
        let reg = if self.is_static(arg_name) {
            self.load_static(arg_name, width, ip_src)?
        } else {
            let referenced = self.referenced_after(ip_src, instructions);
            self.alloc
                .load_variable(&mut self.buf, arg_name, width, ip_src, &referenced)?
        };
        // The 0x66 prefix must immediately precede the `push` opcode it
        // modifies, so it's emitted after the load, not before it.
        if width == 4 {
            self.buf.write_u8(0x66);
        }
        self.buf.write_u8(0x50 + reg.field());
        Ok(())
    }

    fn emit_return(&mut self, ip_src: usize, value: Option<&Operand>) -> CompileResult<()> {
        self.alloc.force_save_and_unload_all(&mut self.buf)?;

        let frame = self
            .frame
            .clone()
            .ok_or_else(|| CompileError::internal(ip_src, "Return outside a function"))?;

        if frame.is_entry_point {
            let exit_code = match value {
                Some(op) if op.is_constant() => op.as_u32().unwrap_or(0) as u8,
                _ => 0,
            };
            self.buf.write_u8(0xB8);
            self.buf.write_u16(0x4C00 | exit_code as u16);
            self.buf.write_u8(0xCD);
            self.buf.write_u8(0x21);
            return Ok(());
        }

        let return_size = match frame.return_type {
            ReturnType::Scalar(ty) => ty.size(),
            ReturnType::Void => 2,
        };
        if frame.return_type == ReturnType::Void && value.is_some() {
            log::warn!("ir#{ip_src}: Return carries a value in void function '{}'", frame.name);
        }

        if let Some(op) = value {
            match op.kind {
                OperandKind::Constant => {
                    let v = op.as_u32().unwrap_or(0);
                    self.alloc.load_constant(&mut self.buf, v, CpuRegister::Ax, return_size);
                }
                OperandKind::Variable => {
                    if self.is_static(&op.value) {
                        let referenced = HashSet::new();
                        self.alloc
                            .save_and_unload(&mut self.buf, CpuRegister::Ax, ip_src, &referenced)?;
                        self.emit_load_static_mov(&op.value, CpuRegister::Ax, return_size, ip_src);
                    } else {
                        let referenced = HashSet::new();
                        self.alloc
                            .copy_variable_to(&mut self.buf, &op.value, CpuRegister::Ax, return_size, ip_src, &referenced)?;
                    }
                }
            }
        }

        self.buf.write_u8(0x66);
        self.buf.write_u8(0x89);
        self.buf.write_u8(to_xrm(3, REG_FIELD_BP, REG_FIELD_SP)); // mov esp, ebp
        self.buf.write_u8(0x66);
        self.buf.write_u8(0x58 + REG_FIELD_BP); // pop ebp

        if frame.param_area_size > 0 {
            self.buf.write_u8(0xC2);
            self.buf.write_u16(frame.param_area_size as u16);
        } else {
            self.buf.write_u8(0xC3);
        }
        Ok(())
    }
}

fn evaluate_constant_compare(compare: CompareOp, a: &Operand, b: &Operand) -> Option<bool> {
    let av = a.as_u32()?;
    let bv = b.as_u32()?;
    Some(match compare {
        CompareOp::LogOr => (av != 0) || (bv != 0),
        CompareOp::LogAnd => (av != 0) && (bv != 0),
        CompareOp::Eq => av == bv,
        CompareOp::Ne => av != bv,
        CompareOp::Gt => av > bv,
        CompareOp::Lt => av < bv,
        CompareOp::Ge => av >= bv,
        CompareOp::Le => av <= bv,
    })
}

fn build_frame_locals(symbols: &SymbolTable, function_name: &str) -> CompileResult<(Vec<Descriptor>, u32)> {
    let locals = symbols.locals_of(function_name);
    let mut offset: i32 = 0;
    let mut descriptors = Vec::new();
    for local in locals {
        let size = local.size() as i32;
        offset -= size;
        if !(-128..=127).contains(&offset) {
            return Err(CompileError::encoding(
                0,
                format!("stack reference beyond signed-8-bit window for '{}'", local.name),
            ));
        }
        descriptors.push(Descriptor::new(
            local.name.clone(),
            local.scalar_type.unwrap_or(ScalarType::Uint16),
            StorageLocation::Stack(offset as i8),
        ));
    }
    Ok((descriptors, (-offset) as u32))
}

fn build_frame_params(symbols: &SymbolTable, function_name: &str) -> CompileResult<Vec<Descriptor>> {
    let params = symbols.parameters_of(function_name);
    let mut offset: i32 = 6;
    let mut descriptors = Vec::new();
    for param in params {
        if !(-128..=127).contains(&offset) {
            return Err(CompileError::encoding(
                0,
                format!("stack reference beyond signed-8-bit window for '{}'", param.name),
            ));
        }
        descriptors.push(Descriptor::new(
            param.name.clone(),
            param.scalar_type.unwrap_or(ScalarType::Uint16),
            StorageLocation::Stack(offset as i8),
        ));
        offset += param.size() as i32;
    }
    Ok(descriptors)
}

/// Names of every variable operand referenced strictly between `[start,
/// end)` — the "forward liveness" check behind the §4.3.1 spill policy.
fn names_referenced_in(instructions: &[Instruction], start: usize, end: usize) -> HashSet<String> {
    let mut names = HashSet::new();
    for instruction in instructions.iter().take(end.min(instructions.len())).skip(start) {
        match instruction {
            Instruction::Assign { dst, a, b, .. } => {
                names.insert(dst.clone());
                collect_operand(a, &mut names);
                if let Some(b) = b {
                    collect_operand(b, &mut names);
                }
            }
            Instruction::If { a, b, .. } => {
                collect_operand(a, &mut names);
                collect_operand(b, &mut names);
            }
            Instruction::Push { symbol } => {
                names.insert(symbol.clone());
            }
            Instruction::Call { return_dst, .. } => {
                if let Some(name) = return_dst {
                    names.insert(name.clone());
                }
            }
            Instruction::Return { value: Some(v) } => collect_operand(v, &mut names),
            _ => {}
        }
    }
    names
}

fn collect_operand(operand: &Operand, names: &mut HashSet<String>) {
    if operand.kind == OperandKind::Variable {
        names.insert(operand.value.clone());
    }
}

fn resolve_user_target(
    target: &Target,
    ip_src_to_ip_dst: &HashMap<usize, usize>,
    function_entry_ip_dst: &HashMap<usize, usize>,
    symbols: &SymbolTable,
) -> Option<usize> {
    match target {
        Target::IrIndex(ip) => ip_src_to_ip_dst.get(ip).copied(),
        Target::Label(name) => symbols
            .resolve_label(name)
            .and_then(|s| ip_src_to_ip_dst.get(&(s.ip.get() as usize)))
            .copied(),
        // Calls must land on the callee's prologue start, not its first
        // post-prologue instruction, so this resolves against
        // `function_entry_ip_dst` rather than `ip_src_to_ip_dst`.
        Target::Function(name) => symbols
            .resolve_function(name)
            .and_then(|s| function_entry_ip_dst.get(&(s.ip.get() as usize)))
            .copied(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{ScalarType, Symbol, SymbolKind, SymbolTable};

    fn entry_point_table(locals: &[(&str, ScalarType)]) -> SymbolTable {
        let mut table = SymbolTable::new();
        let mut entry = Symbol::new("Main", SymbolKind::EntryPoint);
        entry.return_type = Some(ReturnType::Scalar(ScalarType::Uint8));
        entry.ip.set(0);
        table.insert(entry);
        for (name, ty) in locals {
            let mut local = Symbol::new(*name, SymbolKind::ScalarVar);
            local.scalar_type = Some(*ty);
            local.parent = Some("Main".to_string());
            table.insert(local);
        }
        table
    }

    #[test]
    fn trivial_entry_point_emits_prologue_and_dos_exit() {
        let symbols = entry_point_table(&[]);
        let instructions = vec![Instruction::Return {
            value: Some(Operand::constant("0", ScalarType::Uint8)),
        }];
        let out = Emitter::new(&symbols).emit_program(&instructions).unwrap();
        assert_eq!(out.entry_ip_dst, 0);
        // mov ebp,esp ends with INT 21h/4Ch somewhere in the tail.
        assert!(out.code.windows(2).any(|w| w == [0xCD, 0x21]));
        out.backpatch.assert_drained().unwrap();
    }

    #[test]
    fn names_referenced_in_collects_variables_not_constants() {
        let instrs = vec![
            Instruction::Assign {
                op: AssignOp::Add,
                dst: "x".to_string(),
                a: Operand::variable("y", ScalarType::Uint16),
                b: Some(Operand::constant("3", ScalarType::Uint16)),
            },
            Instruction::Return {
                value: Some(Operand::variable("x", ScalarType::Uint16)),
            },
        ];
        let names = names_referenced_in(&instrs, 0, 2);
        assert!(names.contains("x"));
        assert!(names.contains("y"));
        assert!(!names.contains("3"));
    }

    #[test]
    fn constant_if_folds_to_unconditional_goto_with_no_compare() {
        let symbols = entry_point_table(&[]);
        let instructions = vec![
            Instruction::If {
                compare: CompareOp::Eq,
                a: Operand::constant("7", ScalarType::Uint16),
                b: Operand::constant("7", ScalarType::Uint16),
                target_ip: 2,
            },
            Instruction::Return { value: None },
            Instruction::Return { value: None },
        ];
        let out = Emitter::new(&symbols).emit_program(&instructions).unwrap();
        // No CMP opcode (0x39/0x3B) should appear for a compile-time-folded compare.
        assert!(!out.code.contains(&0x39));
    }

    #[test]
    fn missing_entry_point_is_internal_error() {
        let symbols = SymbolTable::new();
        let err = Emitter::new(&symbols).emit_program(&[]).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    /// S5 — two string constants under `Add` fold at compile time into a
    /// single interned "foobar" and exactly one `DsAbs16` backpatch.
    #[test]
    fn string_constant_concatenation_interns_once() {
        let symbols = entry_point_table(&[]);
        let instructions = vec![
            Instruction::Assign {
                op: AssignOp::Add,
                dst: "$t0".to_string(),
                a: Operand::constant("foo", ScalarType::String),
                b: Some(Operand::constant("bar", ScalarType::String)),
            },
            Instruction::Return { value: None },
        ];
        let out = Emitter::new(&symbols).emit_program(&instructions).unwrap();
        assert_eq!(out.string_literals, vec!["foobar".to_string()]);
        out.backpatch.assert_drained().unwrap_err(); // StaticString still pending — packager resolves it
    }

    /// S6 — a Div forces its dividend into AX/EAX and suppresses AX/DX while
    /// materializing the divisor; a value left live in AX across that must
    /// be spilled to its stack slot first.
    #[test]
    fn divide_spills_a_live_ax_tenant_before_the_div() {
        let mut symbols = SymbolTable::new();
        let mut entry = Symbol::new("Main", SymbolKind::EntryPoint);
        entry.return_type = Some(ReturnType::Scalar(ScalarType::Uint8));
        entry.ip.set(0);
        symbols.insert(entry);
        for name in ["a", "b", "c", "d", "keep"] {
            let mut local = Symbol::new(name, SymbolKind::ScalarVar);
            local.scalar_type = Some(ScalarType::Uint16);
            local.parent = Some("Main".to_string());
            symbols.insert(local);
        }

        // Fill all four registers, then divide — the allocator must spill
        // one of the live values (all are referenced later via `keep`'s
        // computation) to free AX/DX for the divide.
        let instructions = vec![
            Instruction::Assign {
                op: AssignOp::None,
                dst: "a".to_string(),
                a: Operand::constant("1", ScalarType::Uint16),
                b: None,
            },
            Instruction::Assign {
                op: AssignOp::None,
                dst: "b".to_string(),
                a: Operand::constant("2", ScalarType::Uint16),
                b: None,
            },
            Instruction::Assign {
                op: AssignOp::None,
                dst: "c".to_string(),
                a: Operand::constant("3", ScalarType::Uint16),
                b: None,
            },
            Instruction::Assign {
                op: AssignOp::None,
                dst: "d".to_string(),
                a: Operand::constant("4", ScalarType::Uint16),
                b: None,
            },
            Instruction::Assign {
                op: AssignOp::Div,
                dst: "keep".to_string(),
                a: Operand::variable("a", ScalarType::Uint16),
                b: Some(Operand::variable("b", ScalarType::Uint16)),
            },
            Instruction::Assign {
                op: AssignOp::Add,
                dst: "keep".to_string(),
                a: Operand::variable("c", ScalarType::Uint16),
                b: Some(Operand::variable("d", ScalarType::Uint16)),
            },
            Instruction::Return { value: None },
        ];
        let out = Emitter::new(&symbols).emit_program(&instructions).unwrap();
        // A div opcode (0xF7 /6) must appear: a spill had to make room for it.
        assert!(out.code.contains(&0xF7));
    }
}
