//! Stable references into the mutating graph.
//!
//! A phase records the node set it cares about with `freeze`; after any
//! amount of collapsing, `track` resolves every recorded node to the node
//! it survived as. Nodes contracted away resolve through the graph's merge
//! chain; dissolved or deleted nodes resolve to nothing.

use ahash::AHashMap;

use crate::graph::{LineGraph, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeId(usize);

#[derive(Debug, Default)]
pub struct FreezeRegistry {
    snapshots: Vec<Vec<NodeId>>,
}

impl FreezeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the set of nodes alive right now.
    pub fn freeze(&mut self, g: &LineGraph) -> FreezeId {
        self.snapshots.push(g.node_ids());
        FreezeId(self.snapshots.len() - 1)
    }

    /// Resolve every node of a snapshot to its current survivor. Nodes
    /// that were deleted (rather than merged) are absent from the result.
    /// Chains are walked once per distinct node and memoized.
    pub fn track(&self, g: &LineGraph, id: FreezeId) -> AHashMap<NodeId, NodeId> {
        let mut out = AHashMap::new();
        let mut memo: AHashMap<NodeId, Option<NodeId>> = AHashMap::new();
        for &n in &self.snapshots[id.0] {
            let resolved = *memo.entry(n).or_insert_with(|| g.resolve(n));
            if let Some(cur) = resolved {
                out.insert(n, cur);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PolyLine;
    use geo::Coord;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    #[test]
    fn freeze_then_track_is_identity_without_mutation() {
        let mut g = LineGraph::new(50.0);
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(10.0, 0.0));

        let mut reg = FreezeRegistry::new();
        let fr = reg.freeze(&g);
        let map = reg.track(&g, fr);
        assert_eq!(map.get(&a), Some(&a));
        assert_eq!(map.get(&b), Some(&b));
    }

    #[test]
    fn track_follows_merge_chains_and_drops_deleted() {
        let mut g = LineGraph::new(50.0);
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(10.0, 0.0));
        let x = g.add_nd(c(20.0, 0.0));
        let lone = g.add_nd(c(500.0, 0.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (10.0, 0.0)]),
            vec![],
        );
        g.add_edg(
            b,
            x,
            PolyLine::from_points(&[(10.0, 0.0), (20.0, 0.0)]),
            vec![],
        );

        let mut reg = FreezeRegistry::new();
        let fr = reg.freeze(&g);

        g.merge_nds(a, b); // a -> b
        g.merge_nds(b, x); // b -> x, so a -> x transitively
        g.del_nd(lone);

        let map = reg.track(&g, fr);
        assert_eq!(map.get(&a), Some(&x));
        assert_eq!(map.get(&b), Some(&x));
        assert_eq!(map.get(&x), Some(&x));
        assert_eq!(map.get(&lone), None);
    }

    #[test]
    fn later_snapshots_do_not_see_earlier_nodes() {
        let mut g = LineGraph::new(50.0);
        let a = g.add_nd(c(0.0, 0.0));
        let mut reg = FreezeRegistry::new();
        let fr0 = reg.freeze(&g);
        g.del_nd(a);
        let b = g.add_nd(c(1.0, 0.0));
        let fr1 = reg.freeze(&g);

        assert!(reg.track(&g, fr0).is_empty());
        assert_eq!(reg.track(&g, fr1).get(&b), Some(&b));
    }
}
