//! Weighted n-gram shingling over a token sequence.
//!
//! Turns the tokenizer's output into a multiset of shingles (contiguous
//! n-grams), each carrying an integer weight in `{1, 2, 3}` that amplifies
//! rare instructions and dampens boilerplate when the shingles are fed into
//! [`crate::minhash`].

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Default shingle size in tokens.
pub const DEFAULT_NGRAM_SIZE: usize = 3;

/// Separator joining tokens within one shingle. Tokens never contain a
/// space (the tokenizer's alphabet is placeholders, uppercased mnemonics,
/// and single punctuation characters), so this cannot collide with token
/// content.
const SHINGLE_SEPARATOR: &str = "\u{1}";

/// Closed set of "rare" instructions: a shingle made up entirely of these
/// gets the highest weight. Pinned per the design note that the exact set
/// must be documented and stable, since tests pin it.
pub static RARE_INSTRUCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "CPUID",
        "RDTSC",
        "RDMSR",
        "WRMSR",
        "VMCALL",
        "SYSCALL",
        "SYSENTER",
        "XGETBV",
        "AESENC",
        "PCLMULQDQ",
        "MOVDQA",
        "VPXOR",
        "SHA256RNDS2",
        "CLFLUSH",
        "MFENCE",
        "LFENCE",
        "SFENCE",
    ]
    .into_iter()
    .collect()
});

/// Closed set of "common" instructions: a shingle made up entirely of these
/// gets the lowest weight.
pub static COMMON_INSTRUCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "MOV", "PUSH", "POP", "CALL", "RET", "JMP", "JE", "JNE", "JZ", "JNZ", "ADD", "SUB", "NOP",
        "LEA", "CMP", "TEST", "INC", "DEC",
    ]
    .into_iter()
    .collect()
});

/// A single weighted shingle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shingle {
    /// Canonical string: constituent tokens joined by a separator byte that
    /// cannot appear in a token.
    pub text: String,
    /// Insertion weight in `{1, 2, 3}`.
    pub weight: u8,
}

/// Classify a shingle's tokens into a weight per spec: 3 if every token is
/// rare, 1 if every token is common, 2 otherwise.
fn weight_for(tokens: &[String]) -> u8 {
    if tokens.iter().all(|t| RARE_INSTRUCTIONS.contains(t.as_str())) {
        3
    } else if tokens
        .iter()
        .all(|t| COMMON_INSTRUCTIONS.contains(t.as_str()))
    {
        1
    } else {
        2
    }
}

/// Produce the weighted shingle multiset for a token sequence. `k` is the
/// shingle size; sequences shorter than `k` produce a single shingle equal
/// to the full sequence, weight 2.
pub fn shingle(tokens: &[String], k: usize) -> Vec<Shingle> {
    let k = k.max(1);
    if tokens.is_empty() {
        return Vec::new();
    }
    if tokens.len() < k {
        return vec![Shingle {
            text: tokens.join(SHINGLE_SEPARATOR),
            weight: 2,
        }];
    }
    let mut shingles = Vec::with_capacity(tokens.len() - k + 1);
    for window in tokens.windows(k) {
        shingles.push(Shingle {
            text: window.join(SHINGLE_SEPARATOR),
            weight: weight_for(window),
        });
    }
    shingles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn shorter_than_k_is_one_shingle_weight_two() {
        let shingles = shingle(&toks("MOV REG"), 3);
        assert_eq!(shingles.len(), 1);
        assert_eq!(shingles[0].weight, 2);
    }

    #[test]
    fn empty_tokens_produce_no_shingles() {
        assert!(shingle(&[], 3).is_empty());
    }

    #[test]
    fn all_rare_gets_weight_three() {
        let shingles = shingle(&toks("CPUID CPUID CPUID"), 3);
        assert_eq!(shingles.len(), 1);
        assert_eq!(shingles[0].weight, 3);
    }

    #[test]
    fn all_common_gets_weight_one() {
        let shingles = shingle(&toks("MOV PUSH POP"), 3);
        assert_eq!(shingles.len(), 1);
        assert_eq!(shingles[0].weight, 1);
    }

    #[test]
    fn mixed_gets_default_weight_two() {
        let shingles = shingle(&toks("CPUID MOV RET"), 3);
        assert_eq!(shingles.len(), 1);
        assert_eq!(shingles[0].weight, 2);
    }

    #[test]
    fn sliding_window_count_matches_n_minus_k_plus_one() {
        let tokens = toks("MOV PUSH POP CALL RET");
        let shingles = shingle(&tokens, 3);
        assert_eq!(shingles.len(), tokens.len() - 3 + 1);
    }

    #[test]
    fn shingle_text_uses_separator_not_space() {
        let shingles = shingle(&toks("MOV REG IMM"), 3);
        assert_eq!(shingles[0].text, format!("MOV{0}REG{0}IMM", SHINGLE_SEPARATOR));
    }
}
