//! Architecture-aware assembly tokenizer and canonical normalizer.
//!
//! Lexes x86/x86-64, ARM/AArch64, MIPS, and RISC-V assembly text into an
//! ordered sequence of uppercase tokens. With generalization on,
//! registers/immediates/labels/memory-size-hints collapse to their
//! category placeholder (`REG`, `IMM`, `LABEL`, `MEM_SIZE`); mnemonics
//! and punctuation are always emitted literally (uppercased).
//!
//! The tokenizer never fails — unrecognised bytes degrade to
//! single-character tokens rather than propagating an error, mirroring
//! the "tokenizer never fails" guarantee tracked in §8 of the design.

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Placeholder token emitted for any recognised register, all architectures unioned.
pub const REG_TOKEN: &str = "REG";
/// Placeholder token emitted for any recognised immediate operand.
pub const IMM_TOKEN: &str = "IMM";
/// Placeholder token emitted for any label definition or reference.
pub const LABEL_TOKEN: &str = "LABEL";
/// Placeholder token emitted for memory size hints (`byte`, `dword ptr`, ...).
pub const MEM_SIZE_TOKEN: &str = "MEM_SIZE";

/// Closed set of recognised registers across x86/x86-64, ARM/AArch64, MIPS
/// and RISC-V, unioned per spec §4.1 ("Register recognition is by
/// closed-set lookup per architecture; all four register sets are
/// unioned"). Lookups are case-insensitive; the `$` sigil used by MIPS
/// register names is stripped before lookup.
static REGISTERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut set = HashSet::new();
    // x86 / x86-64 general purpose, legacy 8/16-bit, segment, pointer/flag.
    for r in [
        "eax", "ebx", "ecx", "edx", "esi", "edi", "esp", "ebp", "eip", "eflags", "ax", "bx", "cx",
        "dx", "si", "di", "sp", "bp", "al", "ah", "bl", "bh", "cl", "ch", "dl", "dh", "cs", "ds",
        "es", "fs", "gs", "ss", "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rsp", "rbp", "rip",
        "rflags",
    ] {
        set.insert(r);
    }
    for i in 8..=15u8 {
        set.insert(Box::leak(format!("r{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("r{i}d").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("r{i}w").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("r{i}b").into_boxed_str()) as &'static str);
    }
    for i in 0..=15u8 {
        set.insert(Box::leak(format!("xmm{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("ymm{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=31u8 {
        set.insert(Box::leak(format!("zmm{i}").into_boxed_str()) as &'static str);
    }
    // ARM / AArch64.
    for r in ["sp", "lr", "pc", "xzr", "wzr", "fp"] {
        set.insert(r);
    }
    for i in 0..=15u8 {
        set.insert(Box::leak(format!("r{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=30u8 {
        set.insert(Box::leak(format!("x{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("w{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=31u8 {
        set.insert(Box::leak(format!("v{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("q{i}").into_boxed_str()) as &'static str);
    }
    // MIPS (leading `$` is stripped before lookup).
    for r in [
        "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "gp", "sp", "fp", "ra", "k0", "k1",
    ] {
        set.insert(r);
    }
    for i in 0..=9u8 {
        set.insert(Box::leak(format!("t{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=7u8 {
        set.insert(Box::leak(format!("s{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=31u8 {
        set.insert(Box::leak(format!("f{i}").into_boxed_str()) as &'static str);
    }
    // RISC-V.
    for r in ["zero", "ra", "sp", "gp", "tp", "fp"] {
        set.insert(r);
    }
    for i in 0..=7u8 {
        set.insert(Box::leak(format!("a{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("fa{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=11u8 {
        set.insert(Box::leak(format!("s{i}").into_boxed_str()) as &'static str);
        set.insert(Box::leak(format!("fs{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=6u8 {
        set.insert(Box::leak(format!("t{i}").into_boxed_str()) as &'static str);
    }
    for i in 0..=11u8 {
        set.insert(Box::leak(format!("ft{i}").into_boxed_str()) as &'static str);
    }
    set
});

/// Memory size hint words that, optionally followed by `ptr`, collapse to `MEM_SIZE`.
static MEM_SIZE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["byte", "word", "dword", "qword", "tbyte", "xmmword", "ymmword", "zmmword"]
        .into_iter()
        .collect()
});

/// Punctuation characters emitted verbatim (never dropped, never generalised).
const PUNCTUATION: &[char] = &[',', '[', ']', '+', '-', '*', ':'];

/// Whether generalization (category placeholders) is applied during tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizationMode {
    /// Collapse registers/immediates/labels/size-hints to placeholders.
    Generalize,
    /// Emit the uppercased source token as-is.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Register,
    Immediate,
    Label,
    MemSize,
    Literal,
}

struct RawToken {
    category: Category,
    text: String,
}

/// Tokenize `code` into an ordered token sequence.
///
/// `generalize = true` matches [`TokenizationMode::Generalize`]; `false`
/// matches [`TokenizationMode::Raw`]. This function is total: it never
/// panics or returns an error for any input byte sequence.
pub fn tokenize(code: &str, generalize: bool) -> Vec<String> {
    let mode = if generalize {
        TokenizationMode::Generalize
    } else {
        TokenizationMode::Raw
    };
    scan(code)
        .into_iter()
        .map(|raw| render(raw, mode))
        .collect()
}

/// Normalize `code` into the canonical, whitespace-joined token stream
/// with generalization on. Stable across whitespace/comment reformatting.
pub fn normalize(code: &str) -> String {
    tokenize(code, true).join(" ")
}

/// `hex(SHA256(normalize(code)))` — the snippet's content-addressed key.
pub fn string_checksum(code: &str) -> String {
    let normalized = normalize(code);
    let digest = Sha256::digest(normalized.as_bytes());
    hex_encode(&digest)
}

/// Raw 32-byte SHA-256 of the normalized code, as used for the storage primary key.
pub fn checksum_bytes(code: &str) -> [u8; 32] {
    let normalized = normalize(code);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn render(raw: RawToken, mode: TokenizationMode) -> String {
    match mode {
        TokenizationMode::Raw => raw.text.to_uppercase(),
        TokenizationMode::Generalize => match raw.category {
            Category::Register => REG_TOKEN.to_string(),
            Category::Immediate => IMM_TOKEN.to_string(),
            Category::Label => LABEL_TOKEN.to_string(),
            Category::MemSize => MEM_SIZE_TOKEN.to_string(),
            Category::Literal => raw.text.to_uppercase(),
        },
    }
}

/// Strip a trailing comment from one line. `;` and `//` always start a
/// comment. `#` starts a comment unless immediately followed by a digit
/// or `-` (the ARM-style immediate prefix, e.g. `#8`).
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == ';' {
            return &line[..i];
        }
        if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            return &line[..i];
        }
        if c == '#' {
            let next = bytes.get(i + 1).copied().map(|b| b as char);
            let is_immediate_prefix = matches!(next, Some(c) if c.is_ascii_digit() || c == '-');
            if !is_immediate_prefix {
                return &line[..i];
            }
        }
        i += 1;
    }
    line
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '?' || c == '$' || c == '%'
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '?' || c == '$'
}

fn scan(code: &str) -> Vec<RawToken> {
    let mut tokens = Vec::new();
    for raw_line in code.lines() {
        let line = strip_comment(raw_line);
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c.is_ascii_digit() || (c == '#' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '-'))
            {
                let (text, next) = scan_immediate(&chars, i);
                tokens.push(RawToken {
                    category: Category::Immediate,
                    text,
                });
                i = next;
                continue;
            }
            if is_word_start(c) {
                let (text, next) = scan_word(&chars, i);
                let (category, text, extra) = classify_word(&chars, text, next);
                tokens.push(RawToken { category, text });
                i = next + extra;
                continue;
            }
            if PUNCTUATION.contains(&c) {
                tokens.push(RawToken {
                    category: Category::Literal,
                    text: c.to_string(),
                });
                i += 1;
                continue;
            }
            // Unrecognised byte: single-character PUNCT-style token, per
            // the tokenizer-never-fails guarantee.
            tokens.push(RawToken {
                category: Category::Literal,
                text: c.to_string(),
            });
            i += 1;
        }
    }
    tokens
}

/// Scan a maximal-munch immediate starting at `start`: decimal, `0x`/`0b`
/// prefixed, `#`-prefixed, or trailing `h` assembler-style hex.
fn scan_immediate(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    if chars[i] == '#' {
        i += 1;
    }
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len()
        && (chars[i].is_ascii_alphanumeric() || chars[i] == 'x' || chars[i] == 'b')
    {
        i += 1;
    }
    (chars[start..i].iter().collect(), i)
}

fn scan_word(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start + 1;
    while i < chars.len() && is_word_char(chars[i]) {
        i += 1;
    }
    (chars[start..i].iter().collect(), i)
}

/// If the word immediately following `after` (skipping a single space) is
/// `ptr`, report how many extra characters it (plus the separating
/// whitespace) consumes so the caller can skip past it.
fn consumed_ptr_extra(chars: &[char], after: usize) -> usize {
    let mut i = after;
    let mut skipped = 0;
    while i < chars.len() && chars[i] == ' ' {
        i += 1;
        skipped += 1;
    }
    let word_start = i;
    while i < chars.len() && is_word_char(chars[i]) {
        i += 1;
    }
    let word: String = chars[word_start..i].iter().collect();
    if word.eq_ignore_ascii_case("ptr") {
        skipped + (i - word_start)
    } else {
        0
    }
}

/// Classify a scanned word, returning its category, rendered text, and
/// any extra characters beyond `next` the rendering consumed (e.g. the
/// trailing `:` of a label definition, or a following `ptr` word).
fn classify_word(chars: &[char], word: String, next: usize) -> (Category, String, usize) {
    // Label definition: word immediately followed by `:` with no space.
    if chars.get(next) == Some(&':') {
        return (Category::Label, format!("{word}:"), 1);
    }
    // Label reference: leading `.` or `?` sigils (e.g. `.L1`, `?_0001`).
    if word.starts_with('.') || word.starts_with('?') {
        return (Category::Label, word, 0);
    }
    let lower = word.to_ascii_lowercase();
    let reg_key = lower.strip_prefix('$').unwrap_or(&lower);
    if REGISTERS.contains(reg_key) {
        return (Category::Register, word, 0);
    }
    if MEM_SIZE_WORDS.contains(lower.as_str()) {
        let extra = consumed_ptr_extra(chars, next);
        let text = if extra > 0 {
            format!("{word} ptr")
        } else {
            word
        };
        return (Category::MemSize, text, extra);
    }
    (Category::Literal, word, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_is_total_on_arbitrary_bytes() {
        let weird = "\u{0}\u{1}\u{fffd}\n\tñ€";
        let tokens = tokenize(weird, true);
        // Must not panic; every token comes from the documented alphabet
        // (either a placeholder or a single rendered character).
        for t in tokens {
            assert!(!t.is_empty());
        }
    }

    #[test]
    fn normalization_idempotent() {
        let code = "mov eax, ebx ; hi\n ret";
        let once = normalize(code);
        let twice = normalize(&once);
        assert_eq!(
            string_checksum(code),
            string_checksum(&once.clone()),
            "normalize should be stable on its own output"
        );
        assert_eq!(once, normalize(&twice));
    }

    #[test]
    fn formatting_insensitive_checksum() {
        let a = "mov eax, ebx ; hi\n ret";
        let b = "MOV EAX, EBX\nRET";
        assert_eq!(string_checksum(a), string_checksum(b));
    }

    #[test]
    fn registers_generalize_across_architectures() {
        let x86 = tokenize("mov eax, [ebp+8]", true);
        let arm = tokenize("ldr w0, [x29, #8]", true);
        assert!(x86.contains(&"REG".to_string()));
        assert!(arm.contains(&"REG".to_string()));
        assert!(arm.contains(&"IMM".to_string()));
    }

    #[test]
    fn mips_register_dollar_sigil() {
        let tokens = tokenize("add $t0, $t1, $t2", true);
        assert_eq!(
            tokens,
            vec!["ADD".to_string(), "REG".to_string(), ",".to_string(), "REG".to_string(), ",".to_string(), "REG".to_string()]
        );
    }

    #[test]
    fn label_definition_recognised() {
        let tokens = tokenize("loc_123:\n  jmp loc_123", true);
        assert_eq!(tokens[0], "LABEL");
        assert!(tokens.contains(&"LABEL".to_string()));
    }

    #[test]
    fn mem_size_hint_with_ptr() {
        let tokens = tokenize("mov eax, dword ptr [ebx]", true);
        assert!(tokens.contains(&"MEM_SIZE".to_string()));
    }

    #[test]
    fn raw_mode_preserves_text_but_drops_comments() {
        let tokens = tokenize("mov eax, ebx ; comment", false);
        assert_eq!(tokens, vec!["MOV", "EAX", ",", "EBX"]);
    }

    #[test]
    fn hash_style_immediate_not_treated_as_comment() {
        let tokens = tokenize("mov r0, #8", true);
        assert!(tokens.contains(&"IMM".to_string()));
    }
}
