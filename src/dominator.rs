//! Dominator tree over the reachability graph (Lengauer–Tarjan, simple
//! variant) and retained sizes by summation over dominator children.

use crate::error::{HprofError, Phase, Result};
use crate::graph::{HeapGraph, SUPER_ROOT};
use log::info;

const UNSET: u32 = u32::MAX;

pub struct DominatorTree {
    /// Node → DFS number; `UNSET` marks nodes unreachable from the
    /// super-root, which have no dominator and retain nothing.
    dfnum: Vec<u32>,
    /// Node → immediate dominator node; `UNSET` for the super-root and
    /// unreachable nodes.
    idom: Vec<u32>,
    /// Node → retained bytes. Saturating; see `is_saturated`.
    retained: Vec<u64>,
    saturated: Vec<bool>,
}

impl DominatorTree {
    pub fn compute(graph: &HeapGraph) -> Result<DominatorTree> {
        let node_count = graph.node_count();
        if node_count == 0 || node_count - 1 > UNSET as usize {
            return Err(HprofError::DumpCorrupted {
                phase: Phase::Dominator,
                offset: 0,
                detail: format!("graph with {} nodes is out of range", node_count),
            });
        }

        // iterative DFS from the super-root; recursion depth is unbounded
        // on real heaps
        let mut dfnum = vec![UNSET; node_count];
        let mut vertex: Vec<u32> = Vec::with_capacity(node_count);
        let mut parent: Vec<u32> = Vec::with_capacity(node_count); // dfs-number space

        let mut stack: Vec<(u32, u32)> = vec![(SUPER_ROOT, UNSET)];
        while let Some((node, parent_num)) = stack.pop() {
            if dfnum[node as usize] != UNSET {
                continue;
            }
            let num = vertex.len() as u32;
            dfnum[node as usize] = num;
            vertex.push(node);
            parent.push(parent_num);
            let successors = graph.successors(node);
            for &succ in successors.iter().rev() {
                if dfnum[succ as usize] == UNSET {
                    stack.push((succ, num));
                }
            }
        }

        let reachable = vertex.len();

        // everything below works in dfs-number space
        let mut semi: Vec<u32> = (0..reachable as u32).collect();
        let mut idom = vec![UNSET; reachable];
        let mut ancestor = vec![UNSET; reachable];
        let mut label: Vec<u32> = (0..reachable as u32).collect();
        let mut bucket: Vec<Vec<u32>> = vec![Vec::new(); reachable];

        fn compress(v: u32, ancestor: &mut [u32], label: &mut [u32], semi: &[u32]) {
            let mut chain = Vec::new();
            let mut u = v;
            while ancestor[ancestor[u as usize] as usize] != UNSET {
                chain.push(u);
                u = ancestor[u as usize];
            }
            while let Some(w) = chain.pop() {
                let a = ancestor[w as usize];
                if semi[label[a as usize] as usize] < semi[label[w as usize] as usize] {
                    label[w as usize] = label[a as usize];
                }
                ancestor[w as usize] = ancestor[a as usize];
            }
        }

        fn eval(v: u32, ancestor: &mut [u32], label: &mut [u32], semi: &[u32]) -> u32 {
            if ancestor[v as usize] == UNSET {
                return label[v as usize];
            }
            compress(v, ancestor, label, semi);
            label[v as usize]
        }

        for w in (1..reachable as u32).rev() {
            let p = parent[w as usize];

            for &pred_node in graph.predecessors(vertex[w as usize]) {
                let pred_num = dfnum[pred_node as usize];
                if pred_num == UNSET {
                    continue;
                }
                let u = eval(pred_num, &mut ancestor, &mut label, &semi);
                if semi[u as usize] < semi[w as usize] {
                    semi[w as usize] = semi[u as usize];
                }
            }

            bucket[semi[w as usize] as usize].push(w);
            ancestor[w as usize] = p;

            for v in std::mem::take(&mut bucket[p as usize]) {
                let u = eval(v, &mut ancestor, &mut label, &semi);
                idom[v as usize] = if semi[u as usize] < semi[v as usize] {
                    u
                } else {
                    p
                };
            }
        }

        for w in 1..reachable as u32 {
            if idom[w as usize] != semi[w as usize] {
                idom[w as usize] = idom[idom[w as usize] as usize];
            }
        }

        // back to node space
        let mut idom_nodes = vec![UNSET; node_count];
        for w in 1..reachable {
            idom_nodes[vertex[w] as usize] = vertex[idom[w] as usize];
        }

        // retained sizes: children fold into their immediate dominator in
        // decreasing dfs order, so every subtotal is complete before its
        // dominator is reached
        let mut retained = vec![0_u64; node_count];
        let mut saturated = vec![false; node_count];
        for node in 0..node_count {
            if dfnum[node] != UNSET {
                retained[node] = graph.shallow(node as u32);
            }
        }
        for w in (1..reachable).rev() {
            let node = vertex[w] as usize;
            let dom = idom_nodes[node] as usize;
            match retained[dom].checked_add(retained[node]) {
                Some(sum) => retained[dom] = sum,
                None => {
                    retained[dom] = u64::MAX;
                    saturated[dom] = true;
                }
            }
            if saturated[node] {
                saturated[dom] = true;
            }
        }

        info!(
            "dominator tree over {} reachable of {} nodes",
            reachable, node_count
        );

        Ok(DominatorTree {
            dfnum,
            idom: idom_nodes,
            retained,
            saturated,
        })
    }

    pub fn is_reachable(&self, node: u32) -> bool {
        self.dfnum[node as usize] != UNSET
    }

    /// Immediate dominator; `None` for the super-root and unreachable nodes.
    pub fn idom(&self, node: u32) -> Option<u32> {
        match self.idom[node as usize] {
            UNSET => None,
            dom => Some(dom),
        }
    }

    /// Retained bytes; zero for nodes unreachable from the super-root.
    pub fn retained(&self, node: u32) -> u64 {
        self.retained[node as usize]
    }

    /// True when the retained sum overflowed and was clamped.
    pub fn is_saturated(&self, node: u32) -> bool {
        self.saturated[node as usize]
    }
}
