//! Simplified control-flow-graph extraction and similarity.
//!
//! Operates on the raw (non-generalized) token stream so branch-target
//! labels survive as literal text, letting basic-block boundaries and
//! edges be recovered from mnemonics and label tokens alone.

use std::collections::HashMap;

use crate::tokenizer::tokenize;

/// Unconditional branch mnemonics: jump to the resolved target only (no
/// fall-through edge).
const UNCONDITIONAL_BRANCHES: &[&str] = &["JMP", "B", "BR", "J"];

/// Conditional branch mnemonics: edge to the resolved target *and* a
/// fall-through edge to the next block.
const CONDITIONAL_BRANCHES: &[&str] = &[
    "JE", "JNE", "JZ", "JNZ", "BEQ", "BNE", "BL", "BLE", "BGT", "BLT", "BGE",
];

/// Return mnemonics: no successor edge.
const RETURNS: &[&str] = &["RET", "RETQ", "JR"];

/// A basic block: its ordered raw tokens and resolved successor indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Tokens belonging to this block, in source order.
    pub tokens: Vec<String>,
    /// Indices of blocks this one can fall through or branch to.
    pub successors: Vec<usize>,
}

/// The extracted control-flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlFlowGraph {
    /// Basic blocks in source order.
    pub blocks: Vec<BasicBlock>,
}

impl ControlFlowGraph {
    /// Number of basic blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of edges across all blocks.
    pub fn num_edges(&self) -> usize {
        self.blocks.iter().map(|b| b.successors.len()).sum()
    }

    /// Adjacency lists, one per block, in block order.
    pub fn adjacency(&self) -> Vec<Vec<usize>> {
        self.blocks.iter().map(|b| b.successors.clone()).collect()
    }

    /// Block sizes (token counts), in block order.
    pub fn block_sizes(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.tokens.len()).collect()
    }

    /// Whether the graph has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Extract a control-flow graph from raw assembly text. Each source line is
/// tokenized independently (generalization off, so branch-target labels
/// survive as literal text) and treated as one instruction — which keeps
/// mnemonic-vs-operand positions unambiguous, unlike a single flat token
/// stream across the whole snippet.
pub fn extract(code: &str) -> ControlFlowGraph {
    let lines = code
        .lines()
        .map(|line| Line {
            tokens: tokenize(line, false),
        })
        .filter(|line| !line.tokens.is_empty())
        .collect();
    build_graph(lines)
}

/// Whether `token` is a label definition (`NAME:` in raw-mode rendering).
fn is_label_def(token: &str) -> bool {
    token.ends_with(':')
}

fn label_name(token: &str) -> &str {
    token.trim_end_matches(':')
}

fn classify_branch(mnemonic: &str) -> BranchKind {
    if UNCONDITIONAL_BRANCHES.contains(&mnemonic) {
        BranchKind::Unconditional
    } else if CONDITIONAL_BRANCHES.contains(&mnemonic) {
        BranchKind::Conditional
    } else if RETURNS.contains(&mnemonic) {
        BranchKind::Return
    } else {
        BranchKind::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    Unconditional,
    Conditional,
    Return,
    None,
}

/// One source line's tokens, treated as a single instruction (or a lone
/// label definition).
struct Line {
    tokens: Vec<String>,
}

fn build_graph(lines: Vec<Line>) -> ControlFlowGraph {
    if lines.is_empty() {
        return ControlFlowGraph::default();
    }

    // Determine block boundaries: a new block opens at stream start, right
    // after a branch/return line, or at a label definition.
    let mut block_starts = vec![0usize];
    for (i, line) in lines.iter().enumerate() {
        let is_label = line.tokens.len() == 1 && is_label_def(&line.tokens[0]);
        let is_branch = line
            .tokens
            .first()
            .map(|m| classify_branch(m) != BranchKind::None)
            .unwrap_or(false);
        if is_label && i > 0 {
            block_starts.push(i);
        }
        if is_branch && i + 1 < lines.len() {
            block_starts.push(i + 1);
        }
    }
    block_starts.sort_unstable();
    block_starts.dedup();

    let mut blocks: Vec<BasicBlock> = Vec::with_capacity(block_starts.len());
    let mut label_to_block: HashMap<String, usize> = HashMap::new();
    let mut block_branch: Vec<BranchKind> = Vec::with_capacity(block_starts.len());
    let mut block_target: Vec<Option<String>> = Vec::with_capacity(block_starts.len());

    for (block_idx, &start) in block_starts.iter().enumerate() {
        let end = block_starts.get(block_idx + 1).copied().unwrap_or(lines.len());
        let mut block_tokens = Vec::new();
        let mut branch = BranchKind::None;
        let mut target = None;
        for line in &lines[start..end] {
            if line.tokens.len() == 1 && is_label_def(&line.tokens[0]) {
                label_to_block.entry(label_name(&line.tokens[0]).to_string()).or_insert(block_idx);
            }
            block_tokens.extend(line.tokens.iter().cloned());
            if let Some(mnemonic) = line.tokens.first() {
                let kind = classify_branch(mnemonic);
                if kind != BranchKind::None {
                    branch = kind;
                    // The label is always the last operand, including the
                    // 3-operand MIPS form (`beq $t0, $t1, target`) — take
                    // the last non-punctuation token, not the first.
                    target = line
                        .tokens
                        .iter()
                        .skip(1)
                        .filter(|t| !matches!(t.as_str(), "," | "[" | "]" | "+" | "-" | "*"))
                        .last()
                        .cloned();
                }
            }
        }
        blocks.push(BasicBlock {
            tokens: block_tokens,
            successors: Vec::new(),
        });
        block_branch.push(branch);
        block_target.push(target);
    }

    for (idx, kind) in block_branch.iter().enumerate() {
        let fallthrough = idx + 1 < blocks.len();
        let resolved = block_target[idx]
            .as_ref()
            .and_then(|t| label_to_block.get(t.trim_end_matches(':')))
            .copied();
        match kind {
            BranchKind::Unconditional => {
                if let Some(target_block) = resolved {
                    blocks[idx].successors.push(target_block);
                } else if fallthrough {
                    blocks[idx].successors.push(idx + 1);
                }
            }
            BranchKind::Conditional => {
                if let Some(target_block) = resolved {
                    blocks[idx].successors.push(target_block);
                }
                if fallthrough {
                    blocks[idx].successors.push(idx + 1);
                }
            }
            BranchKind::Return => {}
            BranchKind::None => {
                if fallthrough {
                    blocks[idx].successors.push(idx + 1);
                }
            }
        }
    }

    ControlFlowGraph { blocks }
}

/// Bucket a block size by powers of two: `[1,2) [2,4) [4,8) [8,16) [16,32) [32,inf)`.
fn size_bucket(size: usize) -> usize {
    match size {
        0 | 1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        _ => 5,
    }
}

fn histogram(sizes: &[usize]) -> [f64; 6] {
    let mut hist = [0.0; 6];
    for &size in sizes {
        hist[size_bucket(size)] += 1.0;
    }
    hist
}

fn cosine(a: &[f64; 6], b: &[f64; 6]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return if norm_a == norm_b { 1.0 } else { 0.0 };
    }
    dot / (norm_a * norm_b)
}

/// Similarity between two control-flow graphs, in `[0, 1]`.
pub fn cfg_similarity(a: &ControlFlowGraph, b: &ControlFlowGraph) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let (na, nb) = (a.num_blocks(), b.num_blocks());
    let size_ratio = if na.max(nb) == 0 {
        1.0
    } else {
        na.min(nb) as f64 / na.max(nb) as f64
    };

    let (ea, eb) = (a.num_edges(), b.num_edges());
    let edge_ratio = if ea.max(eb) == 0 {
        1.0
    } else {
        ea.min(eb) as f64 / ea.max(eb) as f64
    };

    let hist_a = histogram(&a.block_sizes());
    let hist_b = histogram(&b.block_sizes());
    let hist_cos = cosine(&hist_a, &hist_b);

    (0.4 * size_ratio + 0.3 * edge_ratio + 0.3 * hist_cos).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_graphs_are_fully_similar() {
        let a = ControlFlowGraph::default();
        let b = ControlFlowGraph::default();
        assert_eq!(cfg_similarity(&a, &b), 1.0);
    }

    #[test]
    fn single_block_no_branches() {
        let g = extract("mov eax, ebx\nadd eax, 1\nret");
        assert_eq!(g.num_blocks(), 1);
        assert_eq!(g.num_edges(), 0);
    }

    #[test]
    fn unconditional_branch_to_label_resolves() {
        let g = extract("jmp target\ntarget:\nret");
        assert_eq!(g.num_blocks(), 2);
        assert_eq!(g.blocks[0].successors, vec![1]);
    }

    #[test]
    fn conditional_branch_has_target_and_fallthrough() {
        let g = extract("cmp eax, 0\nje target\nmov ebx, 1\ntarget:\nret");
        let branch_block = g
            .blocks
            .iter()
            .find(|b| b.tokens.iter().any(|t| t == "JE"))
            .unwrap();
        assert_eq!(branch_block.successors.len(), 2);
    }

    #[test]
    fn mips_three_operand_conditional_branch_resolves_last_operand_as_target() {
        let g = extract("beq $t0, $t1, target\nmove $t2, $t3\ntarget:\njr $ra");
        let branch_block = g
            .blocks
            .iter()
            .find(|b| b.tokens.iter().any(|t| t == "BEQ"))
            .unwrap();
        // Both the resolved target edge and the fall-through edge must be
        // present; picking `$T0` as the target (first operand) instead of
        // `target` (last operand) would silently drop the target edge.
        assert_eq!(branch_block.successors.len(), 2);
    }

    #[test]
    fn identical_graphs_are_fully_similar() {
        let a = extract("mov eax, ebx\njmp l1\nl1:\nret");
        let b = extract("mov eax, ebx\njmp l1\nl1:\nret");
        assert_eq!(cfg_similarity(&a, &b), 1.0);
    }

    #[test]
    fn structurally_different_graphs_score_lower() {
        let a = extract("mov eax, ebx\nret");
        let b = extract("cmp eax, 0\nje l1\nmov ebx, 1\nl1:\nadd ecx, 1\nret");
        assert!(cfg_similarity(&a, &b) < 1.0);
    }
}
