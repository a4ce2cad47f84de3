//! Reachability graph: breadth-first expansion from a synthetic super-root
//! through the resolved reference tables, stored CSR-style with dense node
//! indices.

use crate::context::HeapContext;
use crate::error::Result;
use crate::index::Index;
use log::{info, warn};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Node index of the synthetic super-root.
pub const SUPER_ROOT: u32 = 0;

pub struct HeapGraph {
    /// Node index → object id; `node_obj_ids[0] == 0` for the super-root.
    node_obj_ids: Vec<u64>,
    shallow: Vec<u64>,
    index_of: FxHashMap<u64, u32>,
    out_offsets: Vec<u64>,
    out_targets: Vec<u32>,
    in_offsets: Vec<u64>,
    in_targets: Vec<u32>,
    /// Direct super-root children, i.e. the GC-root objects.
    root_flags: Vec<bool>,
}

impl HeapGraph {
    /// Single-threaded BFS over the persisted reference tables. Must run
    /// against a fully built index; visit order is deterministic because GC
    /// roots enumerate in index order.
    pub fn build(index: &Index, ctx: &HeapContext) -> Result<HeapGraph> {
        let mut node_obj_ids: Vec<u64> = vec![0];
        let mut shallow: Vec<u64> = vec![0];
        let mut index_of: FxHashMap<u64, u32> = FxHashMap::default();
        index_of.insert(0, SUPER_ROOT);

        let mut adjacency: Vec<Vec<u32>> = vec![Vec::new()];
        let mut queue: VecDeque<u32> = VecDeque::new();

        // node creation enqueues exactly once, so no separate visited set
        let mut get_or_add = |obj_id: u64,
                              node_obj_ids: &mut Vec<u64>,
                              shallow: &mut Vec<u64>,
                              adjacency: &mut Vec<Vec<u32>>,
                              queue: &mut VecDeque<u32>|
         -> Result<Option<u32>> {
            if let Some(&node) = index_of.get(&obj_id) {
                return Ok(Some(node));
            }
            let entry = match index.record(obj_id)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let node = node_obj_ids.len() as u32;
            node_obj_ids.push(obj_id);
            shallow.push(entry.shallow);
            adjacency.push(Vec::new());
            index_of.insert(obj_id, node);
            queue.push_back(node);
            Ok(Some(node))
        };

        let mut root_flags = vec![false];
        for root in &ctx.gc_roots {
            match get_or_add(
                root.obj_id,
                &mut node_obj_ids,
                &mut shallow,
                &mut adjacency,
                &mut queue,
            )? {
                Some(node) => {
                    adjacency[SUPER_ROOT as usize].push(node);
                    if root_flags.len() <= node as usize {
                        root_flags.resize(node as usize + 1, false);
                    }
                    root_flags[node as usize] = true;
                }
                None => warn!(
                    "{} root {:#x} has no record in the dump",
                    root.kind, root.obj_id
                ),
            }
        }

        while let Some(node) = queue.pop_front() {
            let obj_id = node_obj_ids[node as usize];
            for (target, _kind) in index.outbound(obj_id)? {
                if target == obj_id {
                    continue;
                }
                if let Some(target_node) = get_or_add(
                    target,
                    &mut node_obj_ids,
                    &mut shallow,
                    &mut adjacency,
                    &mut queue,
                )? {
                    adjacency[node as usize].push(target_node);
                }
            }
        }

        root_flags.resize(node_obj_ids.len(), false);

        // one edge per ordered pair; self loops were dropped above
        for targets in adjacency.iter_mut() {
            targets.sort_unstable();
            targets.dedup();
        }

        let node_count = node_obj_ids.len();
        let edge_count: usize = adjacency.iter().map(|t| t.len()).sum();
        info!(
            "reachability graph: {} nodes, {} edges",
            node_count, edge_count
        );

        let mut out_offsets = Vec::with_capacity(node_count + 1);
        let mut out_targets = Vec::with_capacity(edge_count);
        out_offsets.push(0_u64);
        for targets in &adjacency {
            out_targets.extend_from_slice(targets);
            out_offsets.push(out_targets.len() as u64);
        }

        let mut in_degrees = vec![0_u64; node_count];
        for &target in &out_targets {
            in_degrees[target as usize] += 1;
        }
        let mut in_offsets = Vec::with_capacity(node_count + 1);
        in_offsets.push(0_u64);
        for node in 0..node_count {
            in_offsets.push(in_offsets[node] + in_degrees[node]);
        }
        let mut cursor = in_offsets.clone();
        let mut in_targets = vec![0_u32; edge_count];
        for (source, targets) in adjacency.iter().enumerate() {
            for &target in targets {
                in_targets[cursor[target as usize] as usize] = source as u32;
                cursor[target as usize] += 1;
            }
        }

        Ok(HeapGraph {
            node_obj_ids,
            shallow,
            index_of,
            out_offsets,
            out_targets,
            in_offsets,
            in_targets,
            root_flags,
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_obj_ids.len()
    }

    pub fn obj_id(&self, node: u32) -> u64 {
        self.node_obj_ids[node as usize]
    }

    pub fn node_index(&self, obj_id: u64) -> Option<u32> {
        self.index_of.get(&obj_id).copied()
    }

    pub fn shallow(&self, node: u32) -> u64 {
        self.shallow[node as usize]
    }

    pub fn successors(&self, node: u32) -> &[u32] {
        let start = self.out_offsets[node as usize] as usize;
        let end = self.out_offsets[node as usize + 1] as usize;
        &self.out_targets[start..end]
    }

    pub fn predecessors(&self, node: u32) -> &[u32] {
        let start = self.in_offsets[node as usize] as usize;
        let end = self.in_offsets[node as usize + 1] as usize;
        &self.in_targets[start..end]
    }

    /// True for GC-root objects (direct super-root children).
    pub fn is_root_object(&self, node: u32) -> bool {
        self.root_flags[node as usize]
    }

    /// Test-oriented constructor: build a graph directly from adjacency
    /// lists (node 0 is the super-root with shallow size 0).
    pub fn from_adjacency(shallow: Vec<u64>, adjacency: Vec<Vec<u32>>) -> HeapGraph {
        assert_eq!(shallow.len(), adjacency.len());
        let node_count = shallow.len();

        let mut index_of = FxHashMap::default();
        let node_obj_ids: Vec<u64> = (0..node_count as u64).collect();
        for (node, &obj_id) in node_obj_ids.iter().enumerate() {
            index_of.insert(obj_id, node as u32);
        }

        let mut root_flags = vec![false; node_count];
        for &target in &adjacency[SUPER_ROOT as usize] {
            root_flags[target as usize] = true;
        }

        let mut out_offsets = Vec::with_capacity(node_count + 1);
        let mut out_targets = Vec::new();
        out_offsets.push(0_u64);
        for targets in &adjacency {
            out_targets.extend_from_slice(targets);
            out_offsets.push(out_targets.len() as u64);
        }

        let mut in_degrees = vec![0_u64; node_count];
        for &target in &out_targets {
            in_degrees[target as usize] += 1;
        }
        let mut in_offsets = Vec::with_capacity(node_count + 1);
        in_offsets.push(0_u64);
        for node in 0..node_count {
            in_offsets.push(in_offsets[node] + in_degrees[node]);
        }
        let mut cursor = in_offsets.clone();
        let mut in_targets = vec![0_u32; out_targets.len()];
        for (source, targets) in adjacency.iter().enumerate() {
            for &target in targets {
                in_targets[cursor[target as usize] as usize] = source as u32;
                cursor[target as usize] += 1;
            }
        }

        HeapGraph {
            node_obj_ids,
            shallow,
            index_of,
            out_offsets,
            out_targets,
            in_offsets,
            in_targets,
            root_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_round_trip() {
        // 0 -> 1, 2; 1 -> 2; 2 -> (none)
        let graph = HeapGraph::from_adjacency(
            vec![0, 10, 20],
            vec![vec![1, 2], vec![2], vec![]],
        );

        assert_eq!(&[1, 2][..], graph.successors(0));
        assert_eq!(&[2_u32][..], graph.successors(1));
        assert!(graph.successors(2).is_empty());

        assert!(graph.predecessors(0).is_empty());
        assert_eq!(&[0_u32][..], graph.predecessors(1));
        let mut preds = graph.predecessors(2).to_vec();
        preds.sort_unstable();
        assert_eq!(vec![0, 1], preds);

        assert!(graph.is_root_object(1));
        assert!(graph.is_root_object(2));
        assert!(!graph.is_root_object(0));
    }
}
