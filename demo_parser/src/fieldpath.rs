use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Seek};

use demo_bitreader::BitReader;
use lazy_static::lazy_static;

use crate::error::{ParseError, Result};

/// Maximum depth of a field path into a serializer tree.
pub const MAX_FIELD_PATH_DEPTH: usize = 7;

/// Position of one updated field inside a class serializer tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub path: [i32; MAX_FIELD_PATH_DEPTH],
    pub last: usize,
}

impl Default for FieldPath {
    fn default() -> Self {
        let mut path = [0; MAX_FIELD_PATH_DEPTH];
        path[0] = -1;
        Self { path, last: 0 }
    }
}

impl FieldPath {
    pub fn components(&self) -> &[i32] {
        &self.path[..=self.last]
    }

    fn pop(&mut self, n: usize) {
        for _ in 0..n {
            self.path[self.last] = 0;
            self.last = self.last.saturating_sub(1);
        }
    }
}

// Path-delta operations with their encode frequencies; the huffman tree
// over the frequencies is the wire coding.
const FIELD_PATH_OPS: &[(&str, u32)] = &[
    ("PlusOne", 36271),
    ("PlusTwo", 10334),
    ("PlusThree", 1375),
    ("PlusFour", 646),
    ("PlusN", 4128),
    ("PushOneLeftDeltaZeroRightZero", 35),
    ("PushOneLeftDeltaZeroRightNonZero", 3),
    ("PushOneLeftDeltaOneRightZero", 521),
    ("PushOneLeftDeltaOneRightNonZero", 2942),
    ("PushOneLeftDeltaNRightZero", 560),
    ("PushOneLeftDeltaNRightNonZero", 471),
    ("PushOneLeftDeltaNRightNonZeroPack6Bits", 10530),
    ("PushOneLeftDeltaNRightNonZeroPack8Bits", 251),
    ("PushTwoLeftDeltaZero", 0),
    ("PushTwoPack5LeftDeltaZero", 0),
    ("PushThreeLeftDeltaZero", 0),
    ("PushThreePack5LeftDeltaZero", 0),
    ("PushTwoLeftDeltaOne", 0),
    ("PushTwoPack5LeftDeltaOne", 0),
    ("PushThreeLeftDeltaOne", 0),
    ("PushThreePack5LeftDeltaOne", 0),
    ("PushTwoLeftDeltaN", 0),
    ("PushTwoPack5LeftDeltaN", 0),
    ("PushThreeLeftDeltaN", 0),
    ("PushThreePack5LeftDeltaN", 0),
    ("PushN", 0),
    ("PushNAndNonTopological", 310),
    ("PopOnePlusOne", 2),
    ("PopOnePlusN", 0),
    ("PopAllButOnePlusOne", 1837),
    ("PopAllButOnePlusN", 149),
    ("PopAllButOnePlusNPack3Bits", 300),
    ("PopAllButOnePlusNPack6Bits", 634),
    ("PopNPlusOne", 0),
    ("PopNPlusN", 0),
    ("PopNAndNonTopographical", 1),
    ("NonTopoComplex", 76),
    ("NonTopoPenultimatePlusOne", 271),
    ("NonTopoComplexPack4Bits", 99),
    ("FieldPathEncodeFinish", 25474),
];

const OP_FINISH: usize = 39;

#[derive(Debug)]
enum HuffmanNode {
    Leaf { op: usize },
    Internal { left: usize, right: usize },
}

struct HuffmanTree {
    nodes: Vec<HuffmanNode>,
    root: usize,
}

struct HeapEntry {
    weight: u64,
    num: usize,
    node: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.num == other.num
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // Max-heap entry ordering arranged so the smallest weight pops first;
    // ties pop the higher node number first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight
            .cmp(&self.weight)
            .then_with(|| self.num.cmp(&other.num))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn build_tree() -> HuffmanTree {
    let mut nodes = Vec::with_capacity(FIELD_PATH_OPS.len() * 2);
    let mut heap = BinaryHeap::with_capacity(FIELD_PATH_OPS.len());

    for (op, (_, weight)) in FIELD_PATH_OPS.iter().enumerate() {
        nodes.push(HuffmanNode::Leaf { op });
        heap.push(HeapEntry {
            weight: (*weight).max(1) as u64,
            num: op,
            node: op,
        });
    }

    let mut next_num = FIELD_PATH_OPS.len();
    while heap.len() > 1 {
        let lo = heap.pop().expect("heap underflow");
        let hi = heap.pop().expect("heap underflow");
        nodes.push(HuffmanNode::Internal {
            left: lo.node,
            right: hi.node,
        });
        heap.push(HeapEntry {
            weight: lo.weight + hi.weight,
            num: next_num,
            node: nodes.len() - 1,
        });
        next_num += 1;
    }

    let root = heap.pop().expect("empty huffman heap").node;
    HuffmanTree { nodes, root }
}

lazy_static! {
    static ref FIELD_PATH_TREE: HuffmanTree = build_tree();
}

fn apply_op<T: Read + Seek + Send>(
    op: usize,
    fp: &mut FieldPath,
    r: &mut BitReader<T>,
) -> Result<()> {
    // Pushed components start from zero, so += on a fresh slot assigns.
    macro_rules! push {
        ($val:expr) => {{
            fp.last += 1;
            if fp.last >= MAX_FIELD_PATH_DEPTH {
                return Err(ParseError::SchemaMismatch(
                    "field path exceeds maximum depth".to_string(),
                ));
            }
            fp.path[fp.last] += $val;
        }};
    }

    match op {
        0 => fp.path[fp.last] += 1,
        1 => fp.path[fp.last] += 2,
        2 => fp.path[fp.last] += 3,
        3 => fp.path[fp.last] += 4,
        4 => fp.path[fp.last] += r.read_ubitvar_fp()? as i32 + 5,
        5 => push!(0),
        6 => push!(r.read_ubitvar_fp()? as i32),
        7 => {
            fp.path[fp.last] += 1;
            push!(0);
        }
        8 => {
            fp.path[fp.last] += 1;
            push!(r.read_ubitvar_fp()? as i32);
        }
        9 => {
            fp.path[fp.last] += r.read_ubitvar_fp()? as i32;
            push!(0);
        }
        10 => {
            fp.path[fp.last] += r.read_ubitvar_fp()? as i32 + 2;
            push!(r.read_ubitvar_fp()? as i32 + 1);
        }
        11 => {
            fp.path[fp.last] += r.read_int(3)? as i32 + 2;
            push!(r.read_int(3)? as i32 + 1);
        }
        12 => {
            fp.path[fp.last] += r.read_int(4)? as i32 + 2;
            push!(r.read_int(4)? as i32 + 1);
        }
        13 => {
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        14 => {
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        15 => {
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        16 => {
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        17 => {
            fp.path[fp.last] += 1;
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        18 => {
            fp.path[fp.last] += 1;
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        19 => {
            fp.path[fp.last] += 1;
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        20 => {
            fp.path[fp.last] += 1;
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        21 => {
            fp.path[fp.last] += r.read_ubitint()? as i32 + 2;
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        22 => {
            fp.path[fp.last] += r.read_ubitint()? as i32 + 2;
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        23 => {
            fp.path[fp.last] += r.read_ubitint()? as i32 + 2;
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
            push!(r.read_ubitvar_fp()? as i32);
        }
        24 => {
            fp.path[fp.last] += r.read_ubitint()? as i32 + 2;
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
            push!(r.read_int(5)? as i32);
        }
        25 => {
            let n = r.read_ubitint()?;
            fp.path[fp.last] += r.read_ubitint()? as i32 + 2;
            for _ in 0..n {
                push!(r.read_ubitvar_fp()? as i32);
            }
        }
        26 => {
            for i in 0..=fp.last {
                if r.read_bit()? {
                    fp.path[i] += r.read_signed_varint32()? + 1;
                }
            }
            let count = r.read_ubitint()?;
            for _ in 0..count {
                push!(r.read_ubitvar_fp()? as i32);
            }
        }
        27 => {
            fp.pop(1);
            fp.path[fp.last] += 1;
        }
        28 => {
            fp.pop(1);
            fp.path[fp.last] += r.read_ubitvar_fp()? as i32 + 1;
        }
        29 => {
            fp.pop(fp.last);
            fp.path[0] += 1;
        }
        30 => {
            fp.pop(fp.last);
            fp.path[0] += r.read_ubitvar_fp()? as i32 + 1;
        }
        31 => {
            fp.pop(fp.last);
            fp.path[0] += r.read_int(3)? as i32 + 1;
        }
        32 => {
            fp.pop(fp.last);
            fp.path[0] += r.read_int(6)? as i32 + 1;
        }
        33 => {
            let n = r.read_ubitvar_fp()?;
            fp.pop(n);
            fp.path[fp.last] += 1;
        }
        34 => {
            let n = r.read_ubitvar_fp()?;
            fp.pop(n);
            fp.path[fp.last] += r.read_signed_varint32()?;
        }
        35 => {
            let n = r.read_ubitvar_fp()?;
            fp.pop(n);
            for i in 0..=fp.last {
                if r.read_bit()? {
                    fp.path[i] += r.read_signed_varint32()?;
                }
            }
        }
        36 => {
            for i in 0..=fp.last {
                if r.read_bit()? {
                    fp.path[i] += r.read_signed_varint32()?;
                }
            }
        }
        37 => {
            if fp.last == 0 {
                return Err(ParseError::SchemaMismatch(
                    "penultimate field-path op at root".to_string(),
                ));
            }
            fp.path[fp.last - 1] += 1;
        }
        38 => {
            for i in 0..=fp.last {
                if r.read_bit()? {
                    fp.path[i] += r.read_int(4)? as i32 - 7;
                }
            }
        }
        _ => {
            return Err(ParseError::SchemaMismatch(format!(
                "invalid field path op {op}"
            )))
        }
    }
    Ok(())
}

/// Reads the delta-encoded field paths of one entity update.
pub fn read_field_paths<T: Read + Seek + Send>(
    r: &mut BitReader<T>,
    out: &mut Vec<FieldPath>,
) -> Result<()> {
    out.clear();
    let tree = &*FIELD_PATH_TREE;
    let mut fp = FieldPath::default();
    let mut node = tree.root;

    loop {
        node = match &tree.nodes[node] {
            HuffmanNode::Internal { left, right } => {
                if r.read_bit()? {
                    *right
                } else {
                    *left
                }
            }
            HuffmanNode::Leaf { .. } => unreachable!("walk never rests on a leaf"),
        };

        if let HuffmanNode::Leaf { op } = &tree.nodes[node] {
            if *op == OP_FINISH {
                return Ok(());
            }
            apply_op(*op, &mut fp, r)?;
            out.push(fp.clone());
            node = tree.root;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    // Bit path of an op leaf, found by walking the tree.
    fn code_for(op: usize) -> Vec<bool> {
        let tree = &*FIELD_PATH_TREE;
        let mut code = Vec::new();
        assert!(dfs(tree, tree.root, op, &mut code));
        code
    }

    fn dfs(tree: &HuffmanTree, node: usize, op: usize, code: &mut Vec<bool>) -> bool {
        match &tree.nodes[node] {
            HuffmanNode::Leaf { op: leaf_op } => *leaf_op == op,
            HuffmanNode::Internal { left, right } => {
                code.push(false);
                if dfs(tree, *left, op, code) {
                    return true;
                }
                code.pop();
                code.push(true);
                if dfs(tree, *right, op, code) {
                    return true;
                }
                code.pop();
                false
            }
        }
    }

    struct BitWriter {
        bytes: Vec<u8>,
        bit: usize,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        fn push_bits(&mut self, value: u64, n: usize) {
            for i in 0..n {
                if self.bit & 7 == 0 {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 == 1 {
                    let idx = self.bit >> 3;
                    self.bytes[idx] |= 1 << (self.bit & 7);
                }
                self.bit += 1;
            }
        }

        fn push_code(&mut self, code: &[bool]) {
            for bit in code {
                self.push_bits(*bit as u64, 1);
            }
        }
    }

    #[test]
    fn every_op_is_reachable_in_the_tree() {
        for op in 0..FIELD_PATH_OPS.len() {
            assert!(!code_for(op).is_empty(), "op {op} missing from tree");
        }
    }

    #[test]
    fn frequent_ops_get_short_codes() {
        assert!(code_for(0).len() <= 3, "PlusOne should be near the root");
        assert!(code_for(OP_FINISH).len() <= 3);
        assert!(code_for(13).len() > code_for(0).len());
    }

    #[test]
    fn plus_one_then_finish_yields_slot_zero() {
        let mut w = BitWriter::new();
        w.push_code(&code_for(0));
        w.push_code(&code_for(OP_FINISH));
        // Pad so the reader's word loads stay in bounds.
        w.push_bits(0, 64);

        let mut r = BitReader::new_small_bit_reader(Cursor::new(w.bytes)).unwrap();
        let mut paths = Vec::new();
        read_field_paths(&mut r, &mut paths).unwrap();

        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].components(), &[0]);
    }

    #[test]
    fn push_and_pop_walk_the_hierarchy() {
        let mut w = BitWriter::new();
        // PlusOne: [0]
        w.push_code(&code_for(0));
        // PushOneLeftDeltaOneRightNonZero with operand 2: [1, 2]
        w.push_code(&code_for(8));
        w.push_bits(1, 1); // ubitvar_fp selector: 2-bit value
        w.push_bits(2, 2);
        // PopAllButOnePlusOne: [2]
        w.push_code(&code_for(29));
        w.push_code(&code_for(OP_FINISH));
        w.push_bits(0, 64);

        let mut r = BitReader::new_small_bit_reader(Cursor::new(w.bytes)).unwrap();
        let mut paths = Vec::new();
        read_field_paths(&mut r, &mut paths).unwrap();

        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].components(), &[0]);
        assert_eq!(paths[1].components(), &[1, 2]);
        assert_eq!(paths[2].components(), &[2]);
    }
}
