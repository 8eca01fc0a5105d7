//! Compilation driver: wires tokenizer → parser → lower →
//! emitter → packager together and renders diagnostics. Grounded on
//! `pipeline.rs`'s `run_pipeline`/`print_error` shape (see DESIGN.md) —
//! same read-source/compile/report-or-write structure, replacing the
//! tokenizer/typechecker/interpreter chain with this language's own.

use std::io::Read;
use std::path::Path;

use log::{debug, info};

use crate::emitter::Emitter;
use crate::error::{CompileError, CompileResult};
use crate::lower;
use crate::packager;
use crate::parser;
use crate::tokenizer;

/// Reads `source`, compiles it to a DOS MZ executable image, and returns the
/// finished byte stream. `stack_override` corresponds to the CLI's
/// `--stack <N>` flag; when set it wins over any `#stack` directive found in
/// the source, matching the "last setting wins" rule used for repeated
/// `#stack` directives.
pub fn compile(source: &str, stack_override: Option<u16>) -> CompileResult<Vec<u8>> {
    info!("tokenizing {} bytes of source", source.len());
    let lines = tokenizer::tokenize(source)?;

    debug!("parsing {} source lines", lines.len());
    let program = parser::parse(&lines)?;

    debug!(
        "lowering {} functions, {} globals",
        program.functions.len(),
        program.globals.len()
    );
    let mut lowered = lower::lower(&program)?;
    if let Some(stack) = stack_override {
        lowered.stack_size = stack;
    }

    debug!("emitting {} IR instructions", lowered.instructions.len());
    let emitter = Emitter::new(&lowered.symbols);
    let output = emitter.emit_program(&lowered.instructions)?;

    debug!("packaging executable, stack size {} bytes", lowered.stack_size);
    packager::package(output, &lowered.symbols, lowered.stack_size)
}

/// Compiles `input_path` (or standard input when `None`) and writes the
/// resulting executable to `output_path`. Returns the process exit code per
/// §6: 0 on success, the failing `CompileError`'s own code otherwise.
pub fn run(input_path: Option<&Path>, output_path: &Path, stack_override: Option<u16>) -> i32 {
    let source = match read_source(input_path) {
        Ok(source) => source,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    match compile(&source, stack_override) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(output_path, &bytes) {
                eprintln!("could not write '{}': {err}", output_path.display());
                return 1;
            }
            info!("wrote {} bytes to {}", bytes.len(), output_path.display());
            0
        }
        Err(err) => {
            report(&err);
            err.exit_code()
        }
    }
}

fn read_source(input_path: Option<&Path>) -> Result<String, String> {
    match input_path {
        Some(path) => std::fs::read_to_string(path).map_err(|err| format!("could not read '{}': {err}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|err| format!("could not read standard input: {err}"))?;
            Ok(buf)
        }
    }
}

fn report(err: &CompileError) {
    eprintln!("{err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_program_to_an_mz_image() {
        let source = "fun Main() -> uint8:\n    return 0\n";
        let bytes = compile(source, None).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
    }

    #[test]
    fn stack_override_wins_over_source_directive() {
        let source = "#stack 128\nfun Main() -> uint8:\n    return 0\n";
        let bytes = compile(source, Some(4096)).unwrap();
        let sp = u16::from_le_bytes([bytes[16], bytes[17]]);
        assert_eq!(sp, 4096);
    }

    #[test]
    fn surfaces_syntax_errors_as_compile_errors() {
        let err = compile("  x = 1\n", None).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }
}
