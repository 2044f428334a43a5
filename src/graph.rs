//! The modification-order graph: a DAG over writes.
//!
//! Nodes are created lazily, one per write. Edges record modification-order
//! precedences derived from the C++11 coherence rules; the graph must stay
//! acyclic at all times, so `add_edge` refuses any edge that would close a
//! cycle and reports the infeasibility to the caller.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ActionId;

#[derive(Debug)]
struct Node {
    action: ActionId,
    edges: SmallVec<[usize; 2]>,
    /// The unique rmw that reads from this write, if any.
    rmw: Option<usize>,
    /// DFS stamp for reachability queries.
    stamp: u64,
}

/// Cycle-checking directed graph over writes.
#[derive(Debug, Default)]
pub struct CycleGraph {
    nodes: Vec<Node>,
    index: FxHashMap<ActionId, usize>,
    stamp: u64,
}

impl CycleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, action: ActionId) -> usize {
        match self.index.get(&action) {
            Some(&n) => n,
            None => {
                let n = self.nodes.len();
                self.nodes.push(Node {
                    action,
                    edges: SmallVec::new(),
                    rmw: None,
                    stamp: 0,
                });
                self.index.insert(action, n);
                n
            }
        }
    }

    /// Iterative DFS from `from`, looking for `to`.
    fn search(&mut self, from: usize, to: usize) -> bool {
        if from == to {
            return true;
        }
        self.stamp += 1;
        let stamp = self.stamp;
        let mut work: Vec<usize> = vec![from];
        self.nodes[from].stamp = stamp;
        while let Some(n) = work.pop() {
            for i in 0..self.nodes[n].edges.len() {
                let next = self.nodes[n].edges[i];
                if next == to {
                    return true;
                }
                if self.nodes[next].stamp != stamp {
                    self.nodes[next].stamp = stamp;
                    work.push(next);
                }
            }
        }
        false
    }

    /// Is `to` reachable from `from` along mo edges?
    pub fn reachable(&mut self, from: ActionId, to: ActionId) -> bool {
        let (Some(&f), Some(&t)) = (self.index.get(&from), self.index.get(&to)) else {
            return false;
        };
        self.search(f, t)
    }

    /// Add the edge `from --mo--> to`.
    ///
    /// Returns false (leaving the graph untouched) if the edge would close a
    /// cycle. An edge into a write with a fused rmw successor lands on the
    /// rmw instead, since the rmw is immediately mo-after its source.
    pub fn add_edge(&mut self, from: ActionId, to: ActionId) -> bool {
        if from == to {
            return false;
        }
        let mut f = self.node(from);
        let t = self.node(to);
        // Redirect through the rmw chain hanging off `from`.
        while let Some(rmw) = self.nodes[f].rmw {
            if rmw == t {
                return true;
            }
            f = rmw;
        }
        if f == t {
            return false;
        }
        if self.search(t, f) {
            return false;
        }
        if !self.nodes[f].edges.contains(&t) {
            self.nodes[f].edges.push(t);
        }
        true
    }

    /// Add an edge from every element of `set` into `to`. Returns false if
    /// any single edge was refused; accepted edges before the failure stay.
    pub fn add_edges(&mut self, set: &[ActionId], to: ActionId) -> bool {
        for &from in set {
            if !self.add_edge(from, to) {
                return false;
            }
        }
        true
    }

    /// Record `rmw` as the unique read-modify-write fused onto `rf`.
    ///
    /// The rmw is immediately mo-after its source, so every existing mo
    /// successor of `rf` moves onto the rmw, and `rf --mo--> rmw` is added.
    pub fn add_rmw_edge(&mut self, rf: ActionId, rmw: ActionId) {
        let f = self.node(rf);
        let r = self.node(rmw);
        assert!(
            self.nodes[f].rmw.is_none() || self.nodes[f].rmw == Some(r),
            "two rmw operations fused onto one write"
        );
        self.nodes[f].rmw = Some(r);
        let moved: SmallVec<[usize; 2]> =
            self.nodes[f].edges.iter().copied().filter(|&e| e != r).collect();
        for e in moved {
            if !self.nodes[r].edges.contains(&e) {
                self.nodes[r].edges.push(e);
            }
        }
        self.nodes[f].edges.clear();
        self.nodes[f].edges.push(r);
    }

    /// The rmw fused onto write `w`, if one exists.
    pub fn rmw_successor(&self, w: ActionId) -> Option<ActionId> {
        let &n = self.index.get(&w)?;
        self.nodes[n].rmw.map(|r| self.nodes[r].action)
    }

    /// Walk every mo edge; used by the trace dumper.
    pub fn for_each_edge(&self, mut f: impl FnMut(ActionId, ActionId)) {
        for node in &self.nodes {
            for &e in &node.edges {
                f(node.action, self.nodes[e].action);
            }
        }
    }

    /// Exhaustive acyclicity check, for tests and debug assertions.
    pub fn is_acyclic(&mut self) -> bool {
        for n in 0..self.nodes.len() {
            for i in 0..self.nodes[n].edges.len() {
                let succ = self.nodes[n].edges[i];
                if self.search(succ, n) {
                    return false;
                }
            }
        }
        true
    }
}
