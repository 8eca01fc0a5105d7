//! End-to-end CLI tests, in the style of `endtoend_test.rs`: drive the
//! built binary with `assert_cmd` and inspect the bytes it writes,
//! since nothing in this sandbox can actually boot the resulting DOS image.

use std::io::Write;

use assert_cmd::Command;
use tempfile::TempDir;

fn mz_header(bytes: &[u8]) -> (u16, u16, u16, u16, u16, u16, u16) {
    let read = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
    (
        read(2),  // last_block_size
        read(4),  // block_count
        read(8),  // header_paragraphs
        read(14), // ss
        read(16), // sp
        read(20), // ip
        read(22), // cs
    )
}

#[test]
fn compiles_source_file_to_mz_executable() {
    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("prog.src");
    let out_path = dir.path().join("prog.exe");
    std::fs::write(&src_path, "fun Main() -> uint8:\n    return 7\n").unwrap();

    Command::cargo_bin("clike86")
        .unwrap()
        .arg(&src_path)
        .arg(&out_path)
        .assert()
        .success();

    let bytes = std::fs::read(&out_path).unwrap();
    assert_eq!(&bytes[0..2], b"MZ");
    let (_, _, header_paragraphs, _, _, _, cs) = mz_header(&bytes);
    assert_eq!(header_paragraphs, 2);
    assert_eq!(cs, 0);
}

#[test]
fn compiles_source_from_standard_input() {
    let dir = TempDir::new().unwrap();
    let out_path = dir.path().join("prog.exe");

    let mut cmd = Command::cargo_bin("clike86").unwrap();
    let mut child = cmd
        .arg(&out_path)
        .stdin(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(b"fun Main() -> uint8:\n    return 0\n")
        .unwrap();
    let status = child.wait().unwrap();
    assert!(status.success());

    let bytes = std::fs::read(&out_path).unwrap();
    assert_eq!(&bytes[0..2], b"MZ");
}

#[test]
fn reports_a_located_syntax_error_and_fails() {
    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("bad.src");
    let out_path = dir.path().join("bad.exe");
    std::fs::write(&src_path, "  x = 1\n").unwrap();

    Command::cargo_bin("clike86")
        .unwrap()
        .arg(&src_path)
        .arg(&out_path)
        .assert()
        .failure()
        .stderr(predicates::str::contains("Syntax:"));

    assert!(!out_path.exists());
}

/// S1 — Armstrong-number checker: reads a uint32, sums cubes of its
/// decimal digits, and prints one of two sentences. Only the static MZ
/// properties are checked here (§8 property 7) since nothing in this
/// sandbox can boot the resulting image under DOS.
#[test]
fn compiles_armstrong_number_program() {
    let src = "\
fun Main() -> uint8:
    uint32 n = ReadUint32()
    uint32 sum = 0
    uint32 temp = n
    while temp != 0:
        uint32 digit = temp % 10
        sum = sum + digit * digit * digit
        temp = temp / 10
    if sum == n:
        PrintUint32(n)
        PrintString(\" is an Armstrong number.\")
    else:
        PrintUint32(n)
        PrintString(\" is not an Armstrong number.\")
    PrintNewLine()
    return 0
";
    assert_valid_mz_image(src);
}

/// S2 — calculator: reads two operands and an operator selector, prints the
/// result of the chosen arithmetic operation.
#[test]
fn compiles_calculator_program() {
    let src = "\
fun Main() -> uint8:
    uint32 a = ReadUint32()
    uint32 b = ReadUint32()
    uint32 op = ReadUint32()
    uint32 result = 0
    if op == 1:
        result = a + b
    if op == 2:
        result = a - b
    if op == 3:
        result = a / b
    if op == 4:
        result = a * b
    if op == 5:
        result = a % b
    PrintUint32(result)
    PrintNewLine()
    return 0
";
    assert_valid_mz_image(src);
}

/// S3 — prints the first N Fibonacci numbers, iteratively.
#[test]
fn compiles_fibonacci_program() {
    let src = "\
fun Main() -> uint8:
    uint32 n = 10
    uint32 a = 0
    uint32 b = 1
    uint32 i = 0
    while i < n:
        PrintUint32(a)
        PrintString(\" \")
        uint32 next = a + b
        a = b
        b = next
        i = i + 1
    PrintNewLine()
    return 0
";
    assert_valid_mz_image(src);
}

/// Compiles `src` via the built binary and checks §8 property 7 (MZ header
/// roundtrip) against the written file.
fn assert_valid_mz_image(src: &str) {
    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("prog.src");
    let out_path = dir.path().join("prog.exe");
    std::fs::write(&src_path, src).unwrap();

    Command::cargo_bin("clike86")
        .unwrap()
        .arg(&src_path)
        .arg(&out_path)
        .assert()
        .success();

    let bytes = std::fs::read(&out_path).unwrap();
    assert_eq!(&bytes[0..2], b"MZ");
    let (last_block_size, block_count, header_paragraphs, _, _, _, _) = mz_header(&bytes);
    assert_eq!(header_paragraphs as usize * 16, ((28 + 15) / 16) * 16);
    let total = (block_count as usize - 1) * 512 + last_block_size as usize;
    assert_eq!(total, bytes.len());
}

#[test]
fn stack_flag_overrides_source_directive() {
    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("prog.src");
    let out_path = dir.path().join("prog.exe");
    std::fs::write(&src_path, "#stack 64\nfun Main() -> uint8:\n    return 0\n").unwrap();

    Command::cargo_bin("clike86")
        .unwrap()
        .arg(&src_path)
        .arg(&out_path)
        .arg("--stack")
        .arg("2048")
        .assert()
        .success();

    let bytes = std::fs::read(&out_path).unwrap();
    let (_, _, _, _, sp, _, _) = mz_header(&bytes);
    assert_eq!(sp, 2048);
}
