//! Turn-restriction inference.
//!
//! Collapsing merges corridors, which makes junctions more permissive than
//! the schedule ever was: a route that reaches a merged node on a trunk
//! suddenly faces continuations the raw trips never used. This phase
//! snapshots, per node and route, which incident-edge pairs the input
//! graph actually connected, and after collapsing writes a connection
//! exception for every continuation the new topology allows but the
//! snapshot does not contain.
//!
//! Edges are matched across the mutation through their provenance sets:
//! every edge created by a split, fold, or dissolution inherits the
//! init-era ancestor ids of its parents.

use ahash::{AHashMap, AHashSet};
use log::{debug, info};

use crate::freeze::{FreezeId, FreezeRegistry};
use crate::graph::{dir_at, EdgeId, LineGraph, NodeId};
use crate::routes::RouteId;

fn pair_key(a: EdgeId, b: EdgeId) -> (EdgeId, EdgeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Default)]
pub struct RestrInferrer {
    freeze: Option<FreezeId>,
    // (node, route) -> unordered pairs of init-era edges the route
    // continued through at that node
    snap: AHashMap<(NodeId, RouteId), AHashSet<(EdgeId, EdgeId)>>,
    // routes carried by each init-era edge; two fragments of the same
    // ancestor are trivially continuous for the routes it carried
    origin_routes: AHashMap<EdgeId, AHashSet<RouteId>>,
}

impl RestrInferrer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record, for every node and route, the set of permitted edge-pair
    /// continuations, and rebase edge provenance to the current edge set.
    pub fn init(&mut self, g: &mut LineGraph, freeze: &mut FreezeRegistry) {
        g.reset_origins();
        self.freeze = Some(freeze.freeze(g));

        for (e, edge) in g.edges() {
            self.origin_routes
                .insert(e, edge.routes.iter().map(|o| o.route).collect());
        }

        let mut recorded = 0usize;
        for n in g.node_ids() {
            let adj: Vec<EdgeId> = g.nd(n).adj().to_vec();
            for i in 0..adj.len() {
                for j in (i + 1)..adj.len() {
                    let (ea, eb) = (adj[i], adj[j]);
                    for occ_a in &g.edg(ea).routes {
                        let Some(occ_b) = g.edg(eb).occ(occ_a.route) else {
                            continue;
                        };
                        let da = dir_at(occ_a, n);
                        let db = dir_at(occ_b, n);
                        let through = da == 0 || db == 0 || da == -db;
                        if through && g.conn_occurs(n, occ_a.route, ea, eb) {
                            self.snap
                                .entry((n, occ_a.route))
                                .or_default()
                                .insert(pair_key(ea, eb));
                            recorded += 1;
                        }
                    }
                }
            }
        }
        info!("restriction snapshot: {} continuations", recorded);
    }

    /// Compare the collapsed topology against the snapshot and write an
    /// exception for every continuation that would be new. Returns the
    /// number of exceptions added.
    pub fn infer(&self, g: &mut LineGraph, freeze: &FreezeRegistry) -> usize {
        let Some(fr) = self.freeze else {
            return 0;
        };
        let track = freeze.track(g, fr);

        // union the snapshots of everything that collapsed into each
        // survivor; snapshots of deleted nodes are discarded by track
        let mut allowed: AHashMap<(NodeId, RouteId), AHashSet<(EdgeId, EdgeId)>> =
            AHashMap::new();
        let mut survivors: AHashSet<NodeId> = AHashSet::new();
        for ((n, route), pairs) in &self.snap {
            if let Some(&cur) = track.get(n) {
                allowed
                    .entry((cur, *route))
                    .or_default()
                    .extend(pairs.iter().copied());
                survivors.insert(cur);
            }
        }
        for (_, cur) in &track {
            survivors.insert(*cur);
        }

        // Collapse each (survivor, route) pair set into connected
        // components of ancestor edges. A continuation is historically
        // grounded when both current edges descend from one component:
        // pairs compose transitively through edges that contraction has
        // since deleted.
        let mut components: AHashMap<(NodeId, RouteId), AHashMap<EdgeId, usize>> = AHashMap::new();
        for (key, pairs) in &allowed {
            let comp = components.entry(*key).or_default();
            let mut next = 0usize;
            for &(a, b) in pairs {
                match (comp.get(&a).copied(), comp.get(&b).copied()) {
                    (None, None) => {
                        comp.insert(a, next);
                        comp.insert(b, next);
                        next += 1;
                    }
                    (Some(ca), None) => {
                        comp.insert(b, ca);
                    }
                    (None, Some(cb)) => {
                        comp.insert(a, cb);
                    }
                    (Some(ca), Some(cb)) if ca != cb => {
                        for v in comp.values_mut() {
                            if *v == cb {
                                *v = ca;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut added = 0usize;
        for &cur in &survivors {
            if !g.node_alive(cur) {
                continue;
            }
            let adj: Vec<EdgeId> = g.nd(cur).adj().to_vec();
            let mut new_exc: Vec<(RouteId, EdgeId, EdgeId)> = Vec::new();

            for i in 0..adj.len() {
                for j in (i + 1)..adj.len() {
                    let (ea, eb) = (adj[i], adj[j]);
                    for occ_a in &g.edg(ea).routes {
                        let route = occ_a.route;
                        let Some(occ_b) = g.edg(eb).occ(route) else {
                            continue;
                        };
                        let da = dir_at(occ_a, cur);
                        let db = dir_at(occ_b, cur);
                        if !(da == 0 || db == 0 || da == -db) {
                            continue; // directions already forbid it
                        }
                        if !g.conn_occurs(cur, route, ea, eb) {
                            continue; // an exception exists already
                        }

                        // continuous if both edges descend from one
                        // ancestor that carried the route, or from one
                        // connected component of its snapshot pairs
                        let same_ancestor = g.edg(ea).origins.iter().any(|oa| {
                            g.edg(eb).origins.contains(oa)
                                && self
                                    .origin_routes
                                    .get(oa)
                                    .map_or(false, |rs| rs.contains(&route))
                        });
                        let was_allowed = same_ancestor
                            || components.get(&(cur, route)).map_or(false, |comp| {
                                g.edg(ea).origins.iter().any(|oa| {
                                    g.edg(eb).origins.iter().any(|ob| {
                                        oa != ob
                                            && comp.get(oa).is_some()
                                            && comp.get(oa) == comp.get(ob)
                                    })
                                })
                            });
                        if !was_allowed {
                            new_exc.push((route, ea, eb));
                        }
                    }
                }
            }

            for (route, ea, eb) in new_exc {
                g.add_conn_exc(cur, route, ea, eb);
                added += 1;
            }
        }

        if added > 0 {
            debug!("inferred {} connection exceptions", added);
        }
        info!("restriction inference added {} exceptions", added);
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopoConfig;
    use crate::collapse::collapse_shared_segments;
    use crate::geometry::PolyLine;
    use crate::graph::LineOcc;
    use geo::Coord;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    #[test]
    fn snapshot_preserves_original_continuations() {
        // x - n - y with one route passing through: nothing inferred
        let mut g = LineGraph::new(100.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let x = g.add_nd(c(-100.0, 0.0));
        let n = g.add_nd(c(0.0, 0.0));
        let y = g.add_nd(c(100.0, 0.0));
        g.add_edg(
            x,
            n,
            PolyLine::from_points(&[(-100.0, 0.0), (0.0, 0.0)]),
            vec![LineOcc::new(r, Some(n))],
        );
        g.add_edg(
            n,
            y,
            PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r, Some(y))],
        );

        let mut freeze = FreezeRegistry::new();
        let mut ri = RestrInferrer::new();
        ri.init(&mut g, &mut freeze);
        let added = ri.infer(&mut g, &freeze);

        assert_eq!(added, 0);
        let (ea, eb) = (g.nd(n).adj()[0], g.nd(n).adj()[1]);
        assert!(g.routable(n, r, ea, eb));
    }

    #[test]
    fn merged_junction_gets_exceptions_for_unused_continuations() {
        // two disjoint routes merged onto one junction by a node merge:
        // no cross continuation existed, so every cross pair is excepted
        let mut g = LineGraph::new(100.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let x1 = g.add_nd(c(-100.0, 5.0));
        let y1 = g.add_nd(c(100.0, 5.0));
        let n1 = g.add_nd(c(0.0, 5.0));
        let x2 = g.add_nd(c(-100.0, -5.0));
        let y2 = g.add_nd(c(100.0, -5.0));
        let n2 = g.add_nd(c(0.0, -5.0));
        let both = vec![LineOcc::new(r1, None), LineOcc::new(r2, None)];
        g.add_edg(
            x1,
            n1,
            PolyLine::from_points(&[(-100.0, 5.0), (0.0, 5.0)]),
            vec![both[0], both[1]],
        );
        g.add_edg(
            n1,
            y1,
            PolyLine::from_points(&[(0.0, 5.0), (100.0, 5.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            x2,
            n2,
            PolyLine::from_points(&[(-100.0, -5.0), (0.0, -5.0)]),
            vec![LineOcc::new(r2, None)],
        );
        g.add_edg(
            n2,
            y2,
            PolyLine::from_points(&[(0.0, -5.0), (100.0, -5.0)]),
            vec![LineOcc::new(r2, None)],
        );

        let mut freeze = FreezeRegistry::new();
        let mut ri = RestrInferrer::new();
        ri.init(&mut g, &mut freeze);

        // r2 continued x2-n2-y2; after the merge its trunk-side edge
        // (x1-n) also carries r2, opening a new n-to-y2 continuation for
        // r2's trunk and an r2 path from x2's edge into y1's edge
        g.merge_nds(n2, n1);

        let added = ri.infer(&mut g, &freeze);
        assert!(added > 0);

        // r2 from the x2 stub into the y1 stub was never driven
        let e_x2 = g.get_edg(x2, n1).unwrap();
        let e_y1 = g.get_edg(n1, y1).unwrap();
        assert!(!g.conn_occurs(n1, r2, e_x2, e_y1) || !g.edg(e_y1).has_route(r2));

        // but r2's own continuation x2 -> y2 survives
        let e_y2 = g.get_edg(n1, y2).unwrap();
        assert!(g.routable(n1, r2, e_x2, e_y2));
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn split_nodes_keep_single_route_continuity() {
        // a collapse inserting nodes mid-route must not sever the route
        let mut g = LineGraph::new(200.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(400.0, 0.0));
        let a2 = g.add_nd(c(100.0, 2.0));
        let b2 = g.add_nd(c(300.0, 2.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (400.0, 0.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            a2,
            b2,
            PolyLine::from_points(&[(100.0, 2.0), (300.0, 2.0)]),
            vec![LineOcc::new(r2, None)],
        );

        let mut freeze = FreezeRegistry::new();
        let mut ri = RestrInferrer::new();
        ri.init(&mut g, &mut freeze);

        let cfg = TopoConfig {
            max_aggr_distance: 5.0,
            min_shared_len: 50.0,
            ..TopoConfig::default()
        };
        assert!(collapse_shared_segments(&mut g, 5.0, &cfg));
        ri.infer(&mut g, &freeze);

        // r1 must still be routable end to end across the split nodes
        for (n, node) in g.nodes().map(|(n, nd)| (n, nd.clone())).collect::<Vec<_>>() {
            let adj = node.adj().to_vec();
            for i in 0..adj.len() {
                for j in (i + 1)..adj.len() {
                    let (ea, eb) = (adj[i], adj[j]);
                    if g.edg(ea).has_route(r1) && g.edg(eb).has_route(r1) {
                        assert!(
                            g.conn_occurs(n, r1, ea, eb),
                            "r1 severed at node {}",
                            n
                        );
                    }
                }
            }
        }
        g.check_invariants("test", 1e-6).unwrap();
    }
}
