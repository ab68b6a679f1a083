// Copyright 2024 Cornell University
// released under MIT License

//! Dependency ordering of the blocks of one scope.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::ir::BlockId;

/// Result of ordering one scope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockOrder {
    /// blocks in an order in which every block comes after its producers
    pub ordered: Vec<BlockId>,
    /// blocks caught in a cycle that no state-holding block breaks
    pub residual: Vec<BlockId>,
    /// whether state-holding blocks had to be released early
    pub relaxed: bool,
}

impl BlockOrder {
    pub fn is_complete(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Orders `blocks` with Kahn's algorithm. Ties are broken by position in `blocks`.
///
/// Successors outside of `blocks` are ignored. If a cycle remains, the pass is
/// repeated with every state-holding block treated as having no producers:
/// such a block reads its input through a fresh state variable, so it may run
/// before whatever feeds it. Blocks still left over are reported in `residual`.
pub fn order_blocks(
    blocks: &[BlockId],
    successors: impl Fn(BlockId) -> Vec<BlockId>,
    is_state_holding: impl Fn(BlockId) -> bool,
) -> BlockOrder {
    let position: FxHashMap<BlockId, usize> =
        blocks.iter().enumerate().map(|(i, b)| (*b, i)).collect();
    let edges: Vec<Vec<usize>> = blocks
        .iter()
        .map(|b| {
            let mut out: Vec<usize> = successors(*b)
                .into_iter()
                .filter_map(|s| position.get(&s).copied())
                .collect();
            out.sort_unstable();
            out.dedup();
            out
        })
        .collect();

    let (ordered, residual) = kahn(&edges, &vec![false; blocks.len()]);
    if residual.is_empty() {
        info!("ordered {} blocks", blocks.len());
        return BlockOrder {
            ordered: ordered.into_iter().map(|i| blocks[i]).collect(),
            residual: vec![],
            relaxed: false,
        };
    }

    debug!(
        "cycle through {} blocks, releasing state-holding blocks",
        residual.len()
    );
    let released: Vec<bool> = blocks.iter().map(|b| is_state_holding(*b)).collect();
    let (ordered, residual) = kahn(&edges, &released);
    info!(
        "ordered {} blocks after relaxation, {} left in cycles",
        ordered.len(),
        residual.len()
    );
    BlockOrder {
        ordered: ordered.into_iter().map(|i| blocks[i]).collect(),
        residual: residual.into_iter().map(|i| blocks[i]).collect(),
        relaxed: true,
    }
}

/// Kahn's algorithm over positions: `edges[i]` lists what must come after `i`,
/// and the smallest ready position goes first. Released positions start out
/// ready. Returns `(emitted, left_over)`.
pub(crate) fn kahn(edges: &[Vec<usize>], released: &[bool]) -> (Vec<usize>, Vec<usize>) {
    let n = edges.len();
    let mut pending = vec![0usize; n];
    for succ in edges {
        for s in succ {
            pending[*s] += 1;
        }
    }
    for (i, r) in released.iter().enumerate() {
        if *r {
            pending[i] = 0;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|i| pending[*i] == 0).map(Reverse).collect();
    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        emitted[i] = true;
        order.push(i);
        for s in &edges[i] {
            if emitted[*s] || released[*s] {
                continue;
            }
            pending[*s] -= 1;
            if pending[*s] == 0 {
                ready.push(Reverse(*s));
            }
        }
    }
    let left = (0..n).filter(|i| !emitted[*i]).collect();
    (order, left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn ids(n: usize) -> Vec<BlockId> {
        (0..n).map(|i| BlockId::from_u32(i as u32)).collect()
    }

    fn graph(edges: &[(usize, usize)]) -> impl Fn(BlockId) -> Vec<BlockId> + '_ {
        move |b| {
            edges
                .iter()
                .filter(|(s, _)| *s == b.as_u32() as usize)
                .map(|(_, d)| BlockId::from_u32(*d as u32))
                .collect()
        }
    }

    #[test]
    fn chain_in_reverse_declaration() {
        let blocks = ids(3);
        let edges = [(2, 1), (1, 0)];
        let order = order_blocks(&blocks, graph(&edges), |_| false);
        assert_eq!(order.ordered, vec![blocks[2], blocks[1], blocks[0]]);
        assert!(order.is_complete());
        assert!(!order.relaxed);
    }

    #[test]
    fn ties_follow_declaration_order() {
        let blocks = ids(4);
        let edges = [(3, 0)];
        let order = order_blocks(&blocks, graph(&edges), |_| false);
        assert_eq!(
            order.ordered,
            vec![blocks[1], blocks[2], blocks[3], blocks[0]]
        );
    }

    #[test]
    fn state_holding_block_breaks_cycle() {
        // 0: gain, 1: delay, 2: sum; sum -> delay -> gain -> sum
        let blocks = ids(3);
        let edges = [(2, 1), (1, 0), (0, 2)];
        let order = order_blocks(&blocks, graph(&edges), |b| b == blocks[1]);
        assert!(order.is_complete());
        assert!(order.relaxed);
        assert_eq!(order.ordered, vec![blocks[1], blocks[0], blocks[2]]);
    }

    #[test]
    fn algebraic_loop_is_residual() {
        // two blocks feeding each other plus an unrelated source
        let blocks = ids(3);
        let edges = [(0, 1), (1, 0)];
        let order = order_blocks(&blocks, graph(&edges), |_| false);
        assert!(!order.is_complete());
        assert_eq!(order.ordered, vec![blocks[2]]);
        assert_eq!(order.residual, vec![blocks[0], blocks[1]]);
    }

    #[test]
    fn random_dags_respect_edges() {
        let mut rng = StdRng::seed_from_u64(0xd1);
        for _ in 0..50 {
            let n = rng.gen_range(2..20);
            let blocks = ids(n);
            // edges from a random permutation rank to a higher rank are acyclic
            let mut rank: Vec<usize> = (0..n).collect();
            for i in (1..n).rev() {
                rank.swap(i, rng.gen_range(0..=i));
            }
            let mut edges = Vec::new();
            for a in 0..n {
                for b in 0..n {
                    if rank[a] < rank[b] && rng.gen_bool(0.3) {
                        edges.push((a, b));
                    }
                }
            }
            let order = order_blocks(&blocks, graph(&edges), |_| false);
            assert!(order.is_complete());
            let pos = |i: usize| order.ordered.iter().position(|b| *b == blocks[i]).unwrap();
            for (a, b) in &edges {
                assert!(pos(*a) < pos(*b));
            }
        }
    }
}
