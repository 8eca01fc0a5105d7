//! Bodies of the six shared runtime helpers, supplemental per SPEC_FULL.md
//! §B.3. Each is a fixed, hand-written byte sequence invoking
//! DOS INT 21h services; they are self-contained (all internal jumps are
//! local and resolved immediately — no entry in the `BackpatchRegistry` is
//! needed for a helper's own internal control flow).
//!
//! Calling convention matches ordinary generated functions: arguments are
//! pushed right-to-left by the caller, the helper receives them above its
//! own `push bp; mov bp, sp` frame starting at `[bp+4]`, and cleans up via
//! `retn imm16`.

use crate::buffer::ByteBuffer;
use crate::encoding::to_xrm;

pub const SHARED_FUNCTION_NAMES: [&str; 6] = [
    "PrintString",
    "PrintUint32",
    "PrintNewLine",
    "ReadUint32",
    "GetCommandLine",
    "StringsEqual",
];

fn push_bp_frame(buf: &mut ByteBuffer) {
    buf.write_u8(0x66);
    buf.write_u8(0x55); // push ebp
    buf.write_u8(0x66);
    buf.write_u8(0x89);
    buf.write_u8(to_xrm(3, 4, 5)); // mov ebp, esp
}

fn pop_bp_frame(buf: &mut ByteBuffer) {
    buf.write_u8(0x66);
    buf.write_u8(0x89);
    buf.write_u8(to_xrm(3, 5, 4)); // mov esp, ebp
    buf.write_u8(0x66);
    buf.write_u8(0x5D); // pop ebp
}

fn int21(buf: &mut ByteBuffer, ah: u8, al: u8) {
    buf.write_u8(0xB8); // mov ax, imm16
    buf.write_u16(((ah as u16) << 8) | al as u16);
    buf.write_u8(0xCD);
    buf.write_u8(0x21);
}

/// `mov ax, imm16` — used whenever only AX's value matters (AH/AL are
/// written together since this allocator has no separate 8-bit identity for
/// them; see the comment on `CpuRegister` in allocator.rs).
fn mov_ax_imm16(buf: &mut ByteBuffer, value: u16) {
    buf.write_u8(0xB8);
    buf.write_u16(value);
}

/// `PrintString(s: string)`: one argument at `[bp+4]`, a 2-byte DS-relative
/// address of a `$`-terminated buffer (INT 21h/09h's required format).
fn emit_print_string(buf: &mut ByteBuffer) {
    push_bp_frame(buf);
    // mov dx, [bp+4]
    buf.write_u8(0x8B);
    buf.write_u8(to_xrm(1, 2, 6));
    buf.write_i8(4);
    int21(buf, 0x09, 0x00);
    pop_bp_frame(buf);
    buf.write_u8(0xC2);
    buf.write_u16(2);
}

/// `PrintNewLine()`: no arguments, writes CR LF via AH=02h twice.
fn emit_print_newline(buf: &mut ByteBuffer) {
    for ch in [0x0D_u8, 0x0A_u8] {
        // mov dx, ch
        buf.write_u8(0xBA);
        buf.write_u16(ch as u16);
        int21(buf, 0x02, 0x00);
    }
    buf.write_u8(0xC3);
}

/// `PrintUint32(value: u32)`: one 4-byte argument at `[bp+4..+8)`. Converts
/// to decimal ASCII via repeated division by 10 into an 8-byte scratch
/// buffer carved out of the local frame, then prints most-significant digit
/// first.
fn emit_print_uint32(buf: &mut ByteBuffer) {
    push_bp_frame(buf);
    buf.write_u8(0x66);
    buf.write_u8(0x81);
    buf.write_u8(to_xrm(3, 5, 4)); // sub esp, imm32
    buf.write_u32(8);

    // eax = value
    buf.write_u8(0x66);
    buf.write_u8(0x8B);
    buf.write_u8(to_xrm(1, 0, 6));
    buf.write_i8(4); // mov eax, [bp+4]

    // si = end of scratch buffer (exclusive), di = moving write cursor
    buf.write_u8(0x89); // mov si, sp
    buf.write_u8(to_xrm(3, 4, 6));
    buf.write_u8(0x89); // mov di, sp
    buf.write_u8(to_xrm(3, 4, 7));

    let loop_start = buf.len();
    // xor edx, edx
    buf.write_u8(0x66);
    buf.write_u8(0x31);
    buf.write_u8(to_xrm(3, 2, 2));
    // mov ecx, 10
    buf.write_u8(0x66);
    buf.write_u8(0xB9);
    buf.write_u32(10);
    // div ecx
    buf.write_u8(0x66);
    buf.write_u8(0xF7);
    buf.write_u8(to_xrm(3, 6, 1));
    // add dl, '0'
    buf.write_u8(0x80);
    buf.write_u8(to_xrm(3, 0, 2));
    buf.write_u8(b'0');
    // dec di
    buf.write_u8(0x4F);
    // mov [di], dl
    buf.write_u8(0x88);
    buf.write_u8(to_xrm(0, 2, 5));
    // cmp eax, 0
    buf.write_u8(0x66);
    buf.write_u8(0x83);
    buf.write_u8(to_xrm(3, 7, 0));
    buf.write_u8(0x00);
    // jnz loop_start (backward, computed directly — no registry entry needed)
    buf.write_u8(0x75);
    let disp_offset = buf.write_u8(0x00);
    let disp = loop_start as i64 - (disp_offset as i64 + 1);
    buf.patch_i8_at(disp_offset, disp as i8);

    // cx = si - di (character count)
    buf.write_u8(0x89); // mov cx, si
    buf.write_u8(to_xrm(3, 6, 1));
    buf.write_u8(0x2B); // sub cx, di
    buf.write_u8(to_xrm(3, 1, 7));

    let print_loop_start = buf.len();
    // cmp cx, 0
    buf.write_u8(0x83);
    buf.write_u8(to_xrm(3, 7, 1));
    buf.write_u8(0x00);
    // jz print_done (forward, short enough to compute once we know print_done)
    buf.write_u8(0x74);
    let jz_offset = buf.write_u8(0x00);
    // mov dl, [di]
    buf.write_u8(0x8A);
    buf.write_u8(to_xrm(0, 2, 5));
    int21(buf, 0x02, 0x00);
    buf.write_u8(0x47); // inc di
    buf.write_u8(0x49); // dec cx
    buf.write_u8(0xEB); // jmp print_loop_start (backward)
    let jmp_offset = buf.write_u8(0x00);
    let disp = print_loop_start as i64 - (jmp_offset as i64 + 1);
    buf.patch_i8_at(jmp_offset, disp as i8);

    let print_done = buf.len();
    let disp = print_done as i64 - (jz_offset as i64 + 1);
    buf.patch_i8_at(jz_offset, disp as i8);

    pop_bp_frame(buf);
    buf.write_u8(0xC2);
    buf.write_u16(4);
}

/// `ReadUint32() -> u32`: buffered line input via AH=0Ah, parsed into a
/// 32-bit accumulator via repeated multiply-by-10/add-digit. Result left in
/// EAX (no explicit frame teardown moves it — the caller's `Call` lowering
/// binds the destination variable straight to the return register).
fn emit_read_uint32(buf: &mut ByteBuffer) {
    push_bp_frame(buf);
    buf.write_u8(0x66);
    buf.write_u8(0x81);
    buf.write_u8(to_xrm(3, 5, 4)); // sub esp, imm32
    buf.write_u32(64);

    // SP can't appear as a memory-operand base in 16-bit addressing, so the
    // scratch buffer is addressed BP-relative instead: [bp-64] is its first
    // byte (the `sub esp, 64` above guarantees that range is ours).
    const BUF_DISP: i8 = -64;

    // dx = bp - 64 (buffer address for INT 21h/0Ah)
    buf.write_u8(0x89); // mov dx, bp
    buf.write_u8(to_xrm(3, 5, 2));
    buf.write_u8(0x83); // sub dx, 64
    buf.write_u8(to_xrm(3, 5, 2));
    buf.write_u8(64);
    // [bp-64] = max length (62)
    buf.write_u8(0xC6);
    buf.write_u8(to_xrm(1, 0, 6));
    buf.write_i8(BUF_DISP);
    buf.write_u8(62);
    int21(buf, 0x0A, 0x00);

    // si = bp - 62 (first data byte, past the max-len/actual-len prefix)
    buf.write_u8(0x89); // mov si, bp
    buf.write_u8(to_xrm(3, 5, 6));
    buf.write_u8(0x83); // sub si, 62
    buf.write_u8(to_xrm(3, 5, 6));
    buf.write_u8(62);
    // xor cx, cx ; mov cl, [bp-63] (actual length DOS filled in)
    buf.write_u8(0x31);
    buf.write_u8(to_xrm(3, 1, 1));
    buf.write_u8(0x8A);
    buf.write_u8(to_xrm(1, 1, 6));
    buf.write_i8(BUF_DISP + 1);

    // eax = 0 (accumulator)
    buf.write_u8(0x66);
    buf.write_u8(0x31);
    buf.write_u8(to_xrm(3, 0, 0));

    let loop_start = buf.len();
    // cmp cx, 0 ; jz done
    buf.write_u8(0x83);
    buf.write_u8(to_xrm(3, 7, 1));
    buf.write_u8(0x00);
    buf.write_u8(0x74);
    let jz_offset = buf.write_u8(0x00);

    // eax = eax*10
    buf.write_u8(0x66);
    buf.write_u8(0x6B); // imul r32, r/m32, imm8
    buf.write_u8(to_xrm(3, 0, 0));
    buf.write_u8(10);
    // dl = [si]; sub dl, '0'; movzx not modeled — zero dh/high bits via xor edx,edx before load
    buf.write_u8(0x66);
    buf.write_u8(0x31);
    buf.write_u8(to_xrm(3, 2, 2)); // xor edx, edx
    buf.write_u8(0x8A); // mov dl, [si]
    buf.write_u8(to_xrm(0, 2, 4));
    buf.write_u8(0x80); // sub dl, '0'
    buf.write_u8(to_xrm(3, 5, 2));
    buf.write_u8(b'0');
    buf.write_u8(0x66);
    buf.write_u8(0x01); // add eax, edx
    buf.write_u8(to_xrm(3, 2, 0));

    buf.write_u8(0x46); // inc si
    buf.write_u8(0x49); // dec cx
    buf.write_u8(0xEB); // jmp loop_start
    let jmp_offset = buf.write_u8(0x00);
    let disp = loop_start as i64 - (jmp_offset as i64 + 1);
    buf.patch_i8_at(jmp_offset, disp as i8);

    let done = buf.len();
    let disp = done as i64 - (jz_offset as i64 + 1);
    buf.patch_i8_at(jz_offset, disp as i8);

    pop_bp_frame(buf);
    buf.write_u8(0xC3);
}

/// `GetCommandLine() -> string`: DOS stores the command tail as a
/// length-prefixed buffer at PSP:0x80; this returns its DS-relative address
/// (`0x80`) directly — there is no PSP segment register juggling to do
/// since code/data/PSP share one segment in the tiny memory model this
/// compiler targets.
fn emit_get_command_line(buf: &mut ByteBuffer) {
    mov_ax_imm16(buf, 0x0080);
    buf.write_u8(0xC3);
}

/// `StringsEqual(a: string, b: string) -> bool`: two 2-byte DS-relative
/// addresses at `[bp+4]`/`[bp+6]`; compares byte-by-byte until a `$`
/// terminator is hit in both, or a mismatch is found.
fn emit_strings_equal(buf: &mut ByteBuffer) {
    push_bp_frame(buf);
    // si = [bp+4], di = [bp+6]
    buf.write_u8(0x8B);
    buf.write_u8(to_xrm(1, 6, 6));
    buf.write_i8(4);
    buf.write_u8(0x8B);
    buf.write_u8(to_xrm(1, 7, 6));
    buf.write_i8(6);

    let loop_start = buf.len();
    // al = [si]; ah = [di] (compare bytes via al/ah through two loads + cmp)
    buf.write_u8(0x8A); // mov al, [si]
    buf.write_u8(to_xrm(0, 0, 4));
    buf.write_u8(0x8A); // mov dl, [di] (reuse dl as scratch "ah")
    buf.write_u8(to_xrm(0, 2, 5));
    buf.write_u8(0x38); // cmp dl, al
    buf.write_u8(to_xrm(3, 2, 0));
    buf.write_u8(0x75); // jnz not_equal
    let jnz_offset = buf.write_u8(0x00);

    // cmp al, '$' ; jz equal
    buf.write_u8(0x3C);
    buf.write_u8(b'$');
    buf.write_u8(0x74);
    let jz_equal_offset = buf.write_u8(0x00);

    buf.write_u8(0x46); // inc si
    buf.write_u8(0x47); // inc di
    buf.write_u8(0xEB); // jmp loop_start
    let jmp_offset = buf.write_u8(0x00);
    let disp = loop_start as i64 - (jmp_offset as i64 + 1);
    buf.patch_i8_at(jmp_offset, disp as i8);

    let not_equal = buf.len();
    // ax = 0 (false)
    buf.write_u8(0x66);
    buf.write_u8(0x31);
    buf.write_u8(to_xrm(3, 0, 0));
    buf.write_u8(0xEB); // jmp epilogue
    let jmp_end_offset = buf.write_u8(0x00);

    let equal = buf.len();
    let disp = equal as i64 - (jz_equal_offset as i64 + 1);
    buf.patch_i8_at(jz_equal_offset, disp as i8);
    let disp = not_equal as i64 - (jnz_offset as i64 + 1);
    buf.patch_i8_at(jnz_offset, disp as i8);
    // ax = 1 (true)
    buf.write_u8(0xB8);
    buf.write_u16(1);

    let epilogue = buf.len();
    let disp = epilogue as i64 - (jmp_end_offset as i64 + 1);
    buf.patch_i8_at(jmp_end_offset, disp as i8);

    pop_bp_frame(buf);
    buf.write_u8(0xC2);
    buf.write_u16(4);
}

/// Per-parameter push width (bytes) for each shared helper, in declaration
/// order. `Call` lowering consults this instead of the callee's symbol-table
/// parameter list, since shared helpers carry no per-parameter metadata
/// there (SPEC_FULL.md §B.3).
pub fn formal_widths(name: &str) -> &'static [u32] {
    match name {
        "PrintString" => &[2],
        "PrintUint32" => &[4],
        "PrintNewLine" => &[],
        "ReadUint32" => &[],
        "GetCommandLine" => &[],
        "StringsEqual" => &[2, 2],
        _ => &[],
    }
}

/// Appends `name`'s body to `buf`, returning the offset it starts at.
pub fn emit_shared_function(buf: &mut ByteBuffer, name: &str) -> usize {
    let start = buf.len();
    match name {
        "PrintString" => emit_print_string(buf),
        "PrintUint32" => emit_print_uint32(buf),
        "PrintNewLine" => emit_print_newline(buf),
        "ReadUint32" => emit_read_uint32(buf),
        "GetCommandLine" => emit_get_command_line(buf),
        "StringsEqual" => emit_strings_equal(buf),
        other => unreachable!("not a shared function: {other}"),
    }
    start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_helper_emits_a_nonempty_self_contained_body() {
        for name in SHARED_FUNCTION_NAMES {
            let mut buf = ByteBuffer::new();
            emit_shared_function(&mut buf, name);
            assert!(!buf.is_empty(), "{name} produced no bytes");
        }
    }

    #[test]
    fn print_string_ends_in_a_two_byte_cleanup_return() {
        let mut buf = ByteBuffer::new();
        emit_shared_function(&mut buf, "PrintString");
        let bytes = buf.as_slice();
        assert_eq!(&bytes[bytes.len() - 3..], &[0xC2, 0x02, 0x00]);
    }

    #[test]
    fn get_command_line_returns_the_fixed_psp_offset() {
        let mut buf = ByteBuffer::new();
        emit_shared_function(&mut buf, "GetCommandLine");
        assert_eq!(buf.as_slice(), &[0xB8, 0x80, 0x00, 0xC3]);
    }
}
