//! Hybrid similarity scoring: MinHash Jaccard, Levenshtein ratio, and a
//! weighted composite, plus shared-token counting.

use std::collections::HashSet;

use crate::cfg::{self, ControlFlowGraph};
use crate::minhash::MinHashSignature;
use crate::tokenizer::tokenize;

/// Default weight given to the Jaccard term in the hybrid composite.
pub const DEFAULT_JACCARD_WEIGHT: f64 = 0.4;

/// Aggregate comparison result between two snippets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// MinHash-estimated Jaccard similarity of the shingle sets, in `[0, 1]`.
    pub jaccard: f64,
    /// Levenshtein ratio on raw code strings, in `[0, 100]`.
    pub levenshtein: f64,
    /// Weighted composite of `jaccard` and `levenshtein`, in `[0, 100]`.
    pub hybrid: f64,
    /// Control-flow-graph similarity, in `[0, 1]`.
    pub cfg_similarity: f64,
    /// Count of distinct normalized tokens present in both snippets.
    pub shared_tokens: usize,
}

/// Levenshtein ratio: `100 * (1 - edit_distance(a, b) / max(|a|, |b|))`.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 100.0;
    }
    let distance = edit_distance::edit_distance(a, b);
    100.0 * (1.0 - distance as f64 / max_len as f64)
}

/// Weighted composite of Jaccard and Levenshtein ratio.
pub fn hybrid(jaccard: f64, levenshtein: f64, jaccard_weight: f64) -> f64 {
    100.0 * (jaccard_weight * jaccard + (1.0 - jaccard_weight) * (levenshtein / 100.0))
}

/// Count of distinct normalized (generalized) tokens present in both `a` and `b`.
pub fn shared_token_count(code_a: &str, code_b: &str) -> usize {
    let tokens_a: HashSet<String> = tokenize(code_a, true).into_iter().collect();
    let tokens_b: HashSet<String> = tokenize(code_b, true).into_iter().collect();
    tokens_a.intersection(&tokens_b).count()
}

/// Full `compare(a, b)` aggregate, given raw code and precomputed
/// signatures for both snippets.
pub fn compare(
    code_a: &str,
    code_b: &str,
    sig_a: &MinHashSignature,
    sig_b: &MinHashSignature,
    jaccard_weight: f64,
) -> Comparison {
    let jaccard = sig_a.jaccard(sig_b);
    let levenshtein = levenshtein_ratio(code_a, code_b);
    let cfg_a: ControlFlowGraph = cfg::extract(code_a);
    let cfg_b: ControlFlowGraph = cfg::extract(code_b);
    Comparison {
        jaccard,
        levenshtein,
        hybrid: hybrid(jaccard, levenshtein, jaccard_weight),
        cfg_similarity: cfg::cfg_similarity(&cfg_a, &cfg_b),
        shared_tokens: shared_token_count(code_a, code_b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minhash;
    use crate::shingle;
    use crate::tokenizer;

    fn signature_for(code: &str) -> MinHashSignature {
        let tokens = tokenizer::tokenize(code, true);
        let shingles = shingle::shingle(&tokens, 3);
        minhash::compute(&shingles, 128)
    }

    #[test]
    fn identical_code_has_perfect_scores() {
        let code = "mov eax, ebx\nret";
        let sig = signature_for(code);
        let result = compare(code, code, &sig, &sig, DEFAULT_JACCARD_WEIGHT);
        assert_eq!(result.jaccard, 1.0);
        assert_eq!(result.levenshtein, 100.0);
        assert_eq!(result.hybrid, 100.0);
        assert_eq!(result.cfg_similarity, 1.0);
    }

    #[test]
    fn levenshtein_ratio_of_empty_strings_is_full() {
        assert_eq!(levenshtein_ratio("", ""), 100.0);
    }

    #[test]
    fn levenshtein_ratio_decreases_with_distance() {
        let close = levenshtein_ratio("mov eax, ebx", "mov eax, ecx");
        let far = levenshtein_ratio("mov eax, ebx", "completely different text");
        assert!(close > far);
    }

    #[test]
    fn hybrid_blends_jaccard_and_levenshtein() {
        assert_eq!(hybrid(1.0, 100.0, 0.4), 100.0);
        assert_eq!(hybrid(0.0, 0.0, 0.4), 0.0);
    }

    #[test]
    fn architecture_parity_beats_unrelated_snippet() {
        // x86 vs ARM stack-offset load normalise to near-identical
        // REG/MEM_SIZE/IMM token streams despite differing mnemonics and
        // addressing syntax; a snippet with disjoint instructions should
        // score far lower against either one.
        let x86 = "mov eax, dword ptr [ebp+8]\nadd eax, 1\nret";
        let arm = "ldr w0, [x29, #8]\nadd w0, w0, #1\nret";
        let unrelated = "cpuid\nrdtsc\nxgetbv\nvmcall";

        let sig_x86 = signature_for(x86);
        let sig_arm = signature_for(arm);
        let sig_unrelated = signature_for(unrelated);

        let parity = compare(x86, arm, &sig_x86, &sig_arm, DEFAULT_JACCARD_WEIGHT);
        let unrelated_cmp = compare(x86, unrelated, &sig_x86, &sig_unrelated, DEFAULT_JACCARD_WEIGHT);

        assert!(
            parity.hybrid > unrelated_cmp.hybrid,
            "parity hybrid {} should exceed unrelated hybrid {}",
            parity.hybrid,
            unrelated_cmp.hybrid
        );
        assert!(parity.shared_tokens >= unrelated_cmp.shared_tokens);
    }

    #[test]
    fn shared_tokens_counts_distinct_normalized_overlap() {
        let count = shared_token_count("mov eax, ebx", "mov ecx, edx");
        // both normalise to MOV REG , REG
        assert_eq!(count, 2);
    }
}
