//! Executable Packager: concatenates the emitted code,
//! conditionally-appended shared-helper bodies, and the static-data area,
//! then finalizes the 28-byte MZ header. Grounded on the field layout of
//! `MzHeader` in `original_source/c-like-to-x86/DosExeEmitter.h`; the
//! original's own `EmitMzHeader`/`Save` never finish this (see DESIGN.md's
//! open-question note on its buggy `Save`), so the size/CS:IP/SS:SP arithmetic
//! here is this crate's own completion of that routine, recorded in
//! DESIGN.md.

use std::collections::HashMap;

use crate::backpatch::Target;
use crate::buffer::ByteBuffer;
use crate::emitter::EmitOutput;
use crate::error::CompileResult;
use crate::shared::{emit_shared_function, SHARED_FUNCTION_NAMES};
use crate::symbol::SymbolTable;

const HEADER_SIZE: usize = 28;
const HEADER_SIGNATURE_OFF: usize = 0;
const LAST_BLOCK_SIZE_OFF: usize = 2;
const BLOCK_COUNT_OFF: usize = 4;
const RELOC_COUNT_OFF: usize = 6;
const HEADER_PARAGRAPHS_OFF: usize = 8;
const MIN_EXTRA_PARAGRAPHS_OFF: usize = 10;
const MAX_EXTRA_PARAGRAPHS_OFF: usize = 12;
const SS_OFF: usize = 14;
const SP_OFF: usize = 16;
const CHECKSUM_OFF: usize = 18;
const IP_OFF: usize = 20;
const CS_OFF: usize = 22;
const RELOC_TABLE_OFFSET_OFF: usize = 24;
const OVERLAY_COUNT_OFF: usize = 26;

/// Interned strings are laid out `$`-terminated, matching the DOS INT
/// 21h/09h convention `shared::emit_print_string`/`emit_strings_equal` both
/// rely on for their own scan/stop logic.
const STRING_TERMINATOR: u8 = b'$';

pub fn package(emit: EmitOutput, symbols: &SymbolTable, stack_size: u16) -> CompileResult<Vec<u8>> {
    let EmitOutput {
        code,
        mut backpatch,
        string_literals,
        static_scalars,
        entry_ip_dst,
    } = emit;

    let mut body = ByteBuffer::new();
    body.write_bytes(&code);

    let mut shared_offsets: HashMap<String, usize> = HashMap::new();
    for name in SHARED_FUNCTION_NAMES {
        let referenced = symbols
            .all_shared_functions()
            .find(|s| s.name == name)
            .map(|s| s.ref_count.get() > 0)
            .unwrap_or(false);
        if referenced {
            let offset = emit_shared_function(&mut body, name);
            shared_offsets.insert(name.to_string(), offset);
        }
    }

    backpatch.resolve_targets(&mut body, |target| match target {
        Target::Function(name) => shared_offsets.get(name).copied(),
        _ => None,
    })?;

    let static_base = body.len();
    let mut string_offsets: HashMap<String, u16> = HashMap::new();
    for s in &string_literals {
        let offset = (body.len() - static_base) as u16;
        string_offsets.insert(s.clone(), offset);
        body.write_bytes(s.as_bytes());
        body.write_u8(STRING_TERMINATOR);
    }
    let mut scalar_offsets: HashMap<String, u16> = HashMap::new();
    for (name, size) in &static_scalars {
        let offset = (body.len() - static_base) as u16;
        scalar_offsets.insert(name.clone(), offset);
        body.write_bytes(&vec![0u8; *size as usize]);
    }

    backpatch.resolve_statics(&mut body, |target| match target {
        Target::StaticString(name) => string_offsets.get(name).map(|&off| static_base as u16 + off),
        Target::StaticScalar(name) => scalar_offsets.get(name).map(|&off| static_base as u16 + off),
        _ => None,
    });

    backpatch.assert_drained()?;

    let header_paragraphs: u16 = ((HEADER_SIZE + 15) / 16) as u16;
    let header_bytes = header_paragraphs as usize * 16;

    let body_bytes = body.finalize();
    let total_size = header_bytes + body_bytes.len();

    let (block_count, last_block_size) = if total_size % 512 == 0 {
        ((total_size / 512) as u16, 512u16)
    } else {
        ((total_size / 512 + 1) as u16, (total_size % 512) as u16)
    };

    let image_paragraphs: u16 = ((body_bytes.len() + 15) / 16) as u16;
    let stack_paragraphs: u16 = ((stack_size as usize + 15) / 16) as u16;

    let mut out = ByteBuffer::new();
    out.reserve(header_bytes);
    out.write_bytes(&body_bytes);

    out.patch_u8_at(HEADER_SIGNATURE_OFF, b'M');
    out.patch_u8_at(HEADER_SIGNATURE_OFF + 1, b'Z');
    out.patch_u16_at(LAST_BLOCK_SIZE_OFF, last_block_size);
    out.patch_u16_at(BLOCK_COUNT_OFF, block_count);
    out.patch_u16_at(RELOC_COUNT_OFF, 0);
    out.patch_u16_at(HEADER_PARAGRAPHS_OFF, header_paragraphs);
    out.patch_u16_at(MIN_EXTRA_PARAGRAPHS_OFF, stack_paragraphs);
    out.patch_u16_at(MAX_EXTRA_PARAGRAPHS_OFF, stack_paragraphs);
    out.patch_u16_at(SS_OFF, image_paragraphs);
    out.patch_u16_at(SP_OFF, stack_size);
    out.patch_u16_at(CHECKSUM_OFF, 0);
    out.patch_u16_at(IP_OFF, entry_ip_dst as u16);
    out.patch_u16_at(CS_OFF, 0);
    out.patch_u16_at(RELOC_TABLE_OFFSET_OFF, HEADER_SIZE as u16);
    out.patch_u16_at(OVERLAY_COUNT_OFF, 0);

    Ok(out.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpatch::BackpatchRegistry;

    fn empty_emit(code: Vec<u8>, entry_ip_dst: usize) -> EmitOutput {
        EmitOutput {
            code,
            backpatch: BackpatchRegistry::new(),
            string_literals: Vec::new(),
            static_scalars: Vec::new(),
            entry_ip_dst,
        }
    }

    #[test]
    fn header_has_mz_signature_and_zero_relocations() {
        let symbols = SymbolTable::new();
        let bytes = package(empty_emit(vec![0x90, 0x90], 0), &symbols, 0x400).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0);
        assert_eq!(u16::from_le_bytes([bytes[24], bytes[25]]), HEADER_SIZE as u16);
    }

    #[test]
    fn header_paragraphs_round_trips_header_length() {
        let symbols = SymbolTable::new();
        let bytes = package(empty_emit(vec![0x90], 0), &symbols, 0x400).unwrap();
        let header_paragraphs = u16::from_le_bytes([bytes[8], bytes[9]]);
        assert_eq!(header_paragraphs as usize * 16, 32);
    }

    #[test]
    fn block_count_and_last_block_size_round_trip_file_length() {
        let symbols = SymbolTable::new();
        let code = vec![0u8; 1000];
        let bytes = package(empty_emit(code, 0), &symbols, 0x400).unwrap();
        let block_count = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let last_block_size = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!((block_count - 1) * 512 + last_block_size, bytes.len());
    }
}
