//! Shared-segment collapsing and the cleanup passes between its
//! iterations. This is where the raw trip-per-edge graph turns into a
//! compact skeleton.

use ahash::{AHashMap, AHashSet};
use geo::Coord;
use log::{debug, info, warn};
use ordered_float::OrderedFloat;

use crate::config::TopoConfig;
use crate::geometry::{dist, PolyLine};
use crate::graph::{dir_at, EdgeId, LineGraph, NodeId};
use crate::routes::RouteId;

/// Distance below which a split lands on the existing endpoint instead of
/// creating a node.
pub const SNAP_DIST: f64 = 0.5;

/// Radius of the initial tight pass that fixes exact duplicates before the
/// ladder starts.
const INITIAL_D: f64 = 5.0;

/// Sampling interval when scanning one geometry along another.
const SCAN_STEP: f64 = 5.0;

/// Tangent agreement required for two strands to count as parallel
/// (cosine of 30 degrees).
const MIN_TANGENT_DOT: f64 = 0.866;

/// Backtracking jitter tolerated by the monotonicity check, in meters.
const MONO_JITTER: f64 = 5.0;

/// Consecutive misses before an overlap run is closed.
const MAX_MISSES: usize = 2;

/// Cap on repeated passes at one ladder distance.
const MAX_PASS_ITERS: usize = 64;

// ---------------------------------------------------------------------------
// shared-segment detection

/// A matched pair of sub-polylines, expressed as length fractions on each
/// edge. `reversed` means the second edge runs against the first.
#[derive(Debug, Clone, Copy)]
struct ShrdSeg {
    e1: EdgeId,
    e2: EdgeId,
    f1_lo: f64,
    f1_hi: f64,
    f2_lo: f64,
    f2_hi: f64,
    reversed: bool,
    shared_len: f64,
}

/// Longest run of `g1` that stays within `d` of `g2` with agreeing
/// tangents and a monotone projection. Returns arclength intervals on both
/// geometries.
fn scan_overlap(
    g1: &PolyLine,
    g2: &PolyLine,
    d: f64,
    forward: bool,
) -> Option<(f64, f64, f64, f64)> {
    let len1 = g1.len();
    let step = (d / 2.0).clamp(1.0, SCAN_STEP);
    let dense = g1.densify(step);

    let mut best: Option<(f64, f64, f64, f64)> = None;
    let mut cur: Option<(f64, f64, f64, f64)> = None;
    let mut misses = 0usize;
    let mut last_proj: Option<f64> = None;

    let mut close = |cur: &mut Option<(f64, f64, f64, f64)>| {
        if let Some(run) = cur.take() {
            let span = run.1 - run.0;
            if best.map_or(true, |b| span > b.1 - b.0) {
                best = Some(run);
            }
        }
    };

    let mut arc1 = 0.0;
    let mut prev: Option<Coord> = None;
    for &pt in dense.coords() {
        if let Some(p) = prev {
            arc1 += dist(p, pt);
        }
        prev = Some(pt);

        let lp = g2.project(pt);
        let close_enough = dist(pt, lp.pos) <= d;
        let mono = match last_proj {
            None => true,
            Some(prev_arc) => {
                if forward {
                    lp.arclen >= prev_arc - MONO_JITTER
                } else {
                    lp.arclen <= prev_arc + MONO_JITTER
                }
            }
        };
        let tangents_agree = {
            let h = SCAN_STEP;
            let t1 = g1.slope_between((arc1 - h).max(0.0), (arc1 + h).min(len1));
            let t2 = g2.slope_between(
                (lp.arclen - h).max(0.0),
                (lp.arclen + h).min(g2.len()),
            );
            let dot = t1.0 * t2.0 + t1.1 * t2.1;
            if forward {
                dot >= MIN_TANGENT_DOT
            } else {
                dot <= -MIN_TANGENT_DOT
            }
        };

        if close_enough && mono && tangents_agree {
            misses = 0;
            last_proj = Some(lp.arclen);
            match &mut cur {
                None => cur = Some((arc1, arc1, lp.arclen, lp.arclen)),
                Some(run) => {
                    run.1 = arc1;
                    run.3 = lp.arclen;
                }
            }
        } else {
            misses += 1;
            if misses > MAX_MISSES {
                close(&mut cur);
                last_proj = None;
            }
        }
    }
    close(&mut cur);
    best
}

/// Find the dominant shared segment of an edge pair at aggregation
/// distance `d`, or `None` when there is nothing long enough (or a shared
/// route travels the pair in irreconcilable directions).
fn find_shrd_seg(g: &LineGraph, e1: EdgeId, e2: EdgeId, d: f64, min_len: f64) -> Option<ShrdSeg> {
    let g1 = &g.edg(e1).geom;
    let g2 = &g.edg(e2).geom;
    let len1 = g1.len();
    let len2 = g2.len();
    if len1 < min_len || len2 < min_len {
        return None;
    }

    let fwd = scan_overlap(g1, g2, d, true);
    let bwd = scan_overlap(g1, g2, d, false);
    let (run, reversed) = match (fwd, bwd) {
        (Some(f), Some(b)) => {
            if f.1 - f.0 >= b.1 - b.0 {
                (f, false)
            } else {
                (b, true)
            }
        }
        (Some(f), None) => (f, false),
        (None, Some(b)) => (b, true),
        (None, None) => return None,
    };

    let (a1, b1, a2, b2) = run;
    let span1 = b1 - a1;
    let span2 = (b2 - a2).abs();
    if span1 < min_len || span2 < min_len {
        return None;
    }

    Some(ShrdSeg {
        e1,
        e2,
        f1_lo: a1 / len1,
        f1_hi: b1 / len1,
        f2_lo: a2.min(b2) / len2,
        f2_hi: a2.max(b2) / len2,
        reversed,
        shared_len: span1,
    })
}

// ---------------------------------------------------------------------------
// collapse execution

fn chase(remap: &AHashMap<EdgeId, EdgeId>, mut e: EdgeId) -> EdgeId {
    while let Some(&next) = remap.get(&e) {
        e = next;
    }
    e
}

/// Split one edge around a fraction interval. Returns the two boundary
/// nodes, the middle edge, and the outer stubs (absent when the interval
/// reaches an endpoint). `None` when the interval degenerates.
fn split_span(
    g: &mut LineGraph,
    e: EdgeId,
    f_lo: f64,
    f_hi: f64,
) -> Option<(NodeId, NodeId, EdgeId, Option<EdgeId>, Option<EdgeId>)> {
    let (to, total) = {
        let edge = g.edg(e);
        (edge.to, edge.geom.len())
    };

    let s_a = g.split_edg(e, f_lo, SNAP_DIST);
    let split_a = s_a.before != s_a.after;
    if !split_a && s_a.node == to {
        return None; // interval starts at the far end
    }
    let a = s_a.node;
    let work = s_a.after;
    let stub_a = split_a.then_some(s_a.before);

    let d_lo = if split_a { f_lo * total } else { 0.0 };
    let wlen = g.edg(work).geom.len();
    if wlen <= SNAP_DIST {
        return None;
    }
    let frac = ((f_hi * total - d_lo) / wlen).clamp(0.0, 1.0);
    let s_b = g.split_edg(work, frac, SNAP_DIST);
    let split_b = s_b.before != s_b.after;
    let b = s_b.node;
    if b == a {
        return None; // interval shrank to a point
    }
    let (mid, stub_b) = if split_b {
        (s_b.before, Some(s_b.after))
    } else {
        (work, None)
    };
    debug_assert_eq!(g.edg(mid).other(a), b);
    Some((a, b, mid, stub_a, stub_b))
}

/// Carry out one matched collapse: split both edges, snap the boundary
/// node pairs, fold the middles into a trunk, and seed the connection
/// exceptions that keep one-sided routes out of the other side's stubs.
fn execute(g: &mut LineGraph, m: &ShrdSeg) -> bool {
    let Some((a1, b1, mid1, stub1a, stub1b)) = split_span(g, m.e1, m.f1_lo, m.f1_hi) else {
        return false;
    };
    let Some((lo2, hi2, mid2, stub2_lo, stub2_hi)) = split_span(g, m.e2, m.f2_lo, m.f2_hi)
    else {
        return false;
    };
    let (a2, b2, stub2a, stub2b) = if m.reversed {
        (hi2, lo2, stub2_hi, stub2_lo)
    } else {
        (lo2, hi2, stub2_lo, stub2_hi)
    };
    if mid1 == mid2 {
        return false;
    }
    // crossed boundary nodes would contract the trunk's own endpoints
    if a2 == b1 || b2 == a1 {
        return false;
    }

    let routes1: Vec<RouteId> = g.edg(mid1).routes.iter().map(|o| o.route).collect();
    let routes2: Vec<RouteId> = g.edg(mid2).routes.iter().map(|o| o.route).collect();

    let mut remap: AHashMap<EdgeId, EdgeId> = AHashMap::new();
    if a2 != a1 {
        for (k, v) in g.merge_nds(a2, a1) {
            remap.insert(k, v);
        }
    }
    if b2 != b1 && g.node_alive(b2) && g.node_alive(b1) {
        for (k, v) in g.merge_nds(b2, b1) {
            remap.insert(k, v);
        }
    }

    // fold whatever parallel strands remain between the boundary nodes
    let between = g.edgs_between(a1, b1);
    if between.len() > 1 {
        for &src in &between[1..] {
            g.fold_edg(src, between[0]);
            remap.insert(src, between[0]);
        }
    }
    let Some(trunk) = g.get_edg(a1, b1) else {
        return true; // both middles degenerated into the snap
    };

    // a route on exactly one side must not leak into the other side's stubs
    let mut seed = |g: &mut LineGraph,
                    routes_mine: &[RouteId],
                    routes_other: &[RouteId],
                    stubs: [(Option<EdgeId>, NodeId); 2]| {
        for &r in routes_mine {
            if routes_other.contains(&r) {
                continue;
            }
            for (stub, at) in stubs {
                let Some(stub) = stub else { continue };
                let stub = chase(&remap, stub);
                if !g.edge_alive(stub) || stub == trunk {
                    continue;
                }
                if !g.node_alive(at) || !g.edg(stub).is_incident(at) {
                    continue;
                }
                if g.edg(stub).has_route(r) {
                    continue; // the stubs themselves merged
                }
                g.add_conn_exc(at, r, trunk, stub);
            }
        }
    };
    seed(g, &routes1, &routes2, [(stub2a, a1), (stub2b, b1)]);
    seed(g, &routes2, &routes1, [(stub1a, a1), (stub1b, b1)]);

    true
}

/// One collapsing pass at aggregation distance `d`. Returns whether any
/// pair collapsed.
pub fn collapse_shared_segments(g: &mut LineGraph, d: f64, cfg: &TopoConfig) -> bool {
    // candidate pairs from the edge grid
    let mut matches: Vec<ShrdSeg> = Vec::new();
    for e1 in g.edge_ids() {
        let geom = g.edg(e1).geom.clone();
        for e2 in g.edge_neighbors(&geom, d) {
            if e2 <= e1 {
                continue;
            }
            if let Some(m) = find_shrd_seg(g, e1, e2, d, cfg.min_shared_len) {
                matches.push(m);
            }
        }
    }
    if matches.is_empty() {
        return false;
    }

    // longest shared run first; pairs invalidated by earlier collapses in
    // this pass are skipped, not re-queued
    matches.sort_by_key(|m| std::cmp::Reverse(OrderedFloat(m.shared_len)));

    let mut touched: AHashSet<EdgeId> = AHashSet::new();
    let mut collapsed = 0usize;
    for m in &matches {
        if !g.edge_alive(m.e1) || !g.edge_alive(m.e2) {
            continue;
        }
        if touched.contains(&m.e1) || touched.contains(&m.e2) {
            continue;
        }
        // neighbors may have moved the endpoints; re-measure before acting
        let Some(fresh) = find_shrd_seg(g, m.e1, m.e2, d, cfg.min_shared_len) else {
            continue;
        };
        if execute(g, &fresh) {
            touched.insert(m.e1);
            touched.insert(m.e2);
            collapsed += 1;
        }
    }

    if collapsed > 0 {
        debug!("collapsed {} shared segments at d={}", collapsed, d);
    }
    collapsed > 0
}

// ---------------------------------------------------------------------------
// artifact removal

fn route_id_set(g: &LineGraph, e: EdgeId) -> AHashSet<RouteId> {
    g.edg(e).routes.iter().map(|o| o.route).collect()
}

/// Contract edges shorter than `artifact_len`. A contraction that would
/// fold parallel edges with differing route sets is refused and the edge
/// left in place.
pub fn remove_edge_artifacts(g: &mut LineGraph, artifact_len: f64) -> usize {
    let mut removed = 0usize;
    let mut worklist: Vec<EdgeId> = g.edge_ids();

    while let Some(e) = worklist.pop() {
        if !g.edge_alive(e) {
            continue;
        }
        if g.edg(e).geom.len() >= artifact_len {
            continue;
        }
        let u = g.edg(e).from;
        let v = g.edg(e).to;

        let mut blocked = false;
        for &ue in g.nd(u).adj() {
            if ue == e {
                continue;
            }
            let other = g.edg(ue).other(u);
            if other == v {
                continue;
            }
            if let Some(ex) = g.get_edg(other, v) {
                if route_id_set(g, ue) != route_id_set(g, ex) {
                    blocked = true;
                    break;
                }
            }
        }
        if !blocked {
            for &ve in g.nd(v).adj() {
                if ve == e {
                    continue;
                }
                let other = g.edg(ve).other(v);
                if other == u {
                    continue;
                }
                if let Some(ex) = g.get_edg(other, u) {
                    if route_id_set(g, ve) != route_id_set(g, ex) {
                        blocked = true;
                        break;
                    }
                }
            }
        }
        if blocked {
            debug!("edge {} too short but contraction is blocked", e);
            continue;
        }

        // survivor keeps v; everything at u re-parents there
        let remap = g.merge_nds(u, v);
        removed += 1;
        for &ne in g.nd(v).adj() {
            worklist.push(ne);
        }
        for (_, dst) in remap {
            worklist.push(dst);
        }
    }

    if removed > 0 {
        debug!("contracted {} edge artifacts", removed);
    }
    removed
}

/// Dissolve degree-2 nodes whose two edges agree on routes, direction
/// continuation, and carry no exception between them.
pub fn remove_node_artifacts(g: &mut LineGraph) -> usize {
    let mut removed = 0usize;
    loop {
        let mut changed = false;
        for n in g.node_ids() {
            if !g.node_alive(n) {
                continue;
            }
            let node = g.nd(n);
            if node.deg() != 2 || !node.stations.is_empty() {
                continue;
            }
            let ea = node.adj()[0];
            let eb = node.adj()[1];
            if g.edg(ea).other(n) == g.edg(eb).other(n) {
                continue;
            }
            if route_id_set(g, ea) != route_id_set(g, eb) {
                continue;
            }

            let compatible = g.edg(ea).routes.iter().all(|occ_a| {
                let Some(occ_b) = g.edg(eb).occ(occ_a.route) else {
                    return false;
                };
                let da = dir_at(occ_a, n);
                let db = dir_at(occ_b, n);
                let dirs_ok = da == 0 || db == 0 || da == -db;
                dirs_ok && g.conn_occurs(n, occ_a.route, ea, eb)
            });
            if !compatible {
                continue;
            }

            if g.combine_edgs(ea, eb, n).is_some() {
                removed += 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    if removed > 0 {
        debug!("dissolved {} node artifacts", removed);
    }
    removed
}

// ---------------------------------------------------------------------------
// geometry maintenance

/// Arclength at which incident edges are sampled when re-centering a node.
const AVG_SAMPLE_DIST: f64 = 5.0;

/// Re-center every junction on the centroid of samples taken a small
/// arclength into each incident edge, biasing the position toward the
/// local tangents rather than the raw endpoints.
pub fn average_node_positions(g: &mut LineGraph) {
    for n in g.node_ids() {
        if !g.node_alive(n) || g.nd(n).deg() < 2 {
            continue;
        }
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut count = 0usize;
        for &e in g.nd(n).adj() {
            let geom = g.edg(e).geom_from(n);
            let len = geom.len();
            if len == 0.0 {
                continue;
            }
            let endpoint = geom.first();
            let inward = geom.point_at_dist(AVG_SAMPLE_DIST.min(len / 2.0));
            sx += endpoint.x + inward.x;
            sy += endpoint.y + inward.y;
            count += 2;
        }
        if count > 0 {
            g.set_node_pos(
                n,
                Coord {
                    x: sx / count as f64,
                    y: sy / count as f64,
                },
            );
        }
    }
}

/// Trim every edge geometry to the span between its node projections,
/// re-pin the endpoints, drop zero-length spans, and apply the smoothing
/// tolerance.
pub fn clean_up_geoms(g: &mut LineGraph, smooth_eps: f64) {
    for e in g.edge_ids() {
        let (from_pos, to_pos, geom) = {
            let edge = g.edg(e);
            (g.nd(edge.from).pos, g.nd(edge.to).pos, edge.geom.clone())
        };

        let p_from = geom.project(from_pos);
        let p_to = geom.project(to_pos);
        let mut cut = if p_from.arclen < p_to.arclen {
            geom.segment_dist(p_from.arclen, p_to.arclen)
        } else {
            geom
        };
        cut.dedup(1e-3);

        let mut coords = cut.coords().to_vec();
        if coords.len() < 2 {
            coords = vec![from_pos, to_pos];
        }
        coords[0] = from_pos;
        let i = coords.len() - 1;
        coords[i] = to_pos;
        let mut cut = PolyLine::new(coords);
        if smooth_eps > 0.0 {
            cut = cut.simplified(smooth_eps);
        }
        g.set_geom(e, cut);
    }
}

// ---------------------------------------------------------------------------
// driver

/// Run the full aggregation ladder: a tight initial pass, then distances
/// `d0 .. ladder_mult * d0` in steps of `d0`, cleaning artifacts whenever
/// a pass collapsed something.
pub fn collapse_ladder(g: &mut LineGraph, cfg: &TopoConfig) {
    collapse_shared_segments(g, INITIAL_D.min(cfg.max_aggr_distance), cfg);

    for k in 1..=cfg.ladder_mult {
        let d = cfg.max_aggr_distance * k as f64;
        let mut iters = 0usize;
        while collapse_shared_segments(g, d, cfg) {
            remove_node_artifacts(g);
            remove_edge_artifacts(g, cfg.artifact_len);
            iters += 1;
            if iters >= MAX_PASS_ITERS {
                warn!("collapse at d={} did not settle after {} passes", d, iters);
                break;
            }
        }
        debug!(
            "ladder d={}: {} nodes, {} edges",
            d,
            g.num_nodes(),
            g.num_edges()
        );
    }

    info!(
        "collapse done: {} nodes, {} edges",
        g.num_nodes(),
        g.num_edges()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LineOcc, Station};

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn cfg(d0: f64, min_shared: f64) -> TopoConfig {
        TopoConfig {
            max_aggr_distance: d0,
            min_shared_len: min_shared,
            ..TopoConfig::default()
        }
    }

    #[test]
    fn parallel_pair_merges_into_trunk() {
        let mut g = LineGraph::new(50.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        let a2 = g.add_nd(c(0.0, 1.0));
        let b2 = g.add_nd(c(100.0, 1.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            a2,
            b2,
            PolyLine::from_points(&[(0.0, 1.0), (100.0, 1.0)]),
            vec![LineOcc::new(r2, None)],
        );

        let changed = collapse_shared_segments(&mut g, 2.0, &cfg(2.0, 30.0));
        assert!(changed);
        assert_eq!(g.num_edges(), 1);
        assert_eq!(g.num_nodes(), 2);
        let (_, trunk) = g.edges().next().unwrap();
        assert!(trunk.has_route(r1) && trunk.has_route(r2));
        // centerline between the two strands
        for p in trunk.geom.coords() {
            assert!((p.y - 0.5).abs() < 0.6);
        }
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn antiparallel_pair_merges() {
        let mut g = LineGraph::new(50.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        let a2 = g.add_nd(c(100.0, 1.0));
        let b2 = g.add_nd(c(0.0, 1.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r1, Some(b))],
        );
        // same route, opposite geometric orientation, same physical
        // travel direction (toward x = 100)
        g.add_edg(
            a2,
            b2,
            PolyLine::from_points(&[(100.0, 1.0), (0.0, 1.0)]),
            vec![LineOcc::new(r1, Some(a2))],
        );

        let changed = collapse_shared_segments(&mut g, 2.0, &cfg(2.0, 30.0));
        assert!(changed);
        assert_eq!(g.num_edges(), 1);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn short_overlap_is_left_alone() {
        // Y junction: legs diverge immediately, no run reaches min length
        let mut g = LineGraph::new(50.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(10.0, 0.0));
        let cc = g.add_nd(c(20.0, 5.0));
        let d = g.add_nd(c(20.0, -5.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (10.0, 0.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            b,
            cc,
            PolyLine::from_points(&[(10.0, 0.0), (20.0, 5.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            b,
            d,
            PolyLine::from_points(&[(10.0, 0.0), (20.0, -5.0)]),
            vec![LineOcc::new(r1, None)],
        );

        let changed = collapse_shared_segments(&mut g, 2.0, &cfg(2.0, 30.0));
        assert!(!changed);
        assert_eq!(g.num_edges(), 3);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn trunk_seeds_exceptions_against_foreign_stubs() {
        // two routes converge onto a long common corridor before node n
        let mut g = LineGraph::new(200.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let x1 = g.add_nd(c(-300.0, 40.0));
        let x2 = g.add_nd(c(-300.0, -40.0));
        let n = g.add_nd(c(0.0, 0.0));
        let y = g.add_nd(c(200.0, 0.0));
        g.add_edg(
            x1,
            n,
            PolyLine::from_points(&[(-300.0, 40.0), (-200.0, 1.0), (0.0, 0.0)]),
            vec![LineOcc::new(r1, Some(n))],
        );
        g.add_edg(
            x2,
            n,
            PolyLine::from_points(&[(-300.0, -40.0), (-200.0, -1.0), (0.0, -0.0)]),
            vec![LineOcc::new(r2, Some(n))],
        );
        g.add_edg(
            n,
            y,
            PolyLine::from_points(&[(0.0, 0.0), (200.0, 0.0)]),
            vec![LineOcc::new(r1, Some(y)), LineOcc::new(r2, Some(y))],
        );

        let changed = collapse_shared_segments(&mut g, 5.0, &cfg(5.0, 30.0));
        assert!(changed);

        // a trunk carrying both routes now ends at n, with the stubs
        // hanging off its far boundary node
        let trunk = g
            .nd(n)
            .adj()
            .iter()
            .copied()
            .find(|&e| g.edg(e).has_route(r1) && g.edg(e).has_route(r2) && g.edg(e).other(n) != y)
            .expect("trunk must exist");
        let j = g.edg(trunk).other(n);
        let stubs: Vec<EdgeId> = g
            .nd(j)
            .adj()
            .iter()
            .copied()
            .filter(|&e| e != trunk)
            .collect();
        assert_eq!(stubs.len(), 2);
        for s in stubs {
            let foreign = if g.edg(s).has_route(r1) { r2 } else { r1 };
            assert!(!g.conn_occurs(j, foreign, trunk, s));
        }
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn degree_two_node_dissolves() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let m = g.add_nd(c(50.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        g.add_edg(
            a,
            m,
            PolyLine::from_points(&[(0.0, 0.0), (50.0, 0.0)]),
            vec![LineOcc::new(r, Some(m))],
        );
        g.add_edg(
            m,
            b,
            PolyLine::from_points(&[(50.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r, Some(b))],
        );

        assert_eq!(remove_node_artifacts(&mut g), 1);
        assert!(!g.node_alive(m));
        assert_eq!(g.num_edges(), 1);
        let (_, e) = g.edges().next().unwrap();
        assert!((e.geom.len() - 100.0).abs() < 1e-9);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn station_nodes_are_not_dissolved() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let m = g.add_nd(c(50.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        g.add_station(
            m,
            Station {
                id: "s1".into(),
                label: "Mid".into(),
                pos: c(50.0, 0.0),
            },
        );
        g.add_edg(
            a,
            m,
            PolyLine::from_points(&[(0.0, 0.0), (50.0, 0.0)]),
            vec![LineOcc::new(r, None)],
        );
        g.add_edg(
            m,
            b,
            PolyLine::from_points(&[(50.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r, None)],
        );

        assert_eq!(remove_node_artifacts(&mut g), 0);
        assert!(g.node_alive(m));
    }

    #[test]
    fn exception_blocks_dissolution() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let m = g.add_nd(c(50.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        let ea = g
            .add_edg(
                a,
                m,
                PolyLine::from_points(&[(0.0, 0.0), (50.0, 0.0)]),
                vec![LineOcc::new(r, None)],
            )
            .unwrap();
        let eb = g
            .add_edg(
                m,
                b,
                PolyLine::from_points(&[(50.0, 0.0), (100.0, 0.0)]),
                vec![LineOcc::new(r, None)],
            )
            .unwrap();
        g.add_conn_exc(m, r, ea, eb);

        assert_eq!(remove_node_artifacts(&mut g), 0);
        assert!(g.node_alive(m));
    }

    #[test]
    fn short_edge_contracts_to_midpoint() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let u = g.add_nd(c(0.0, 0.0));
        let v = g.add_nd(c(6.0, 0.0));
        let x = g.add_nd(c(-100.0, 0.0));
        let y = g.add_nd(c(100.0, 0.0));
        g.add_edg(
            x,
            u,
            PolyLine::from_points(&[(-100.0, 0.0), (0.0, 0.0)]),
            vec![LineOcc::new(r, None)],
        );
        g.add_edg(
            u,
            v,
            PolyLine::from_points(&[(0.0, 0.0), (6.0, 0.0)]),
            vec![LineOcc::new(r, None)],
        );
        g.add_edg(
            v,
            y,
            PolyLine::from_points(&[(6.0, 0.0), (100.0, 0.0)]),
            vec![LineOcc::new(r, None)],
        );

        assert_eq!(remove_edge_artifacts(&mut g, 15.0), 1);
        assert!(!g.node_alive(u));
        assert!((g.nd(v).pos.x - 3.0).abs() < 1e-9);
        assert_eq!(g.nd(v).deg(), 2);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn blocked_contraction_is_left_in_place() {
        // triangle where folding would mix different route sets
        let mut g = LineGraph::new(50.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let u = g.add_nd(c(0.0, 0.0));
        let v = g.add_nd(c(6.0, 0.0));
        let w = g.add_nd(c(3.0, 80.0));
        g.add_edg(
            u,
            v,
            PolyLine::from_points(&[(0.0, 0.0), (6.0, 0.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            u,
            w,
            PolyLine::from_points(&[(0.0, 0.0), (3.0, 80.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            v,
            w,
            PolyLine::from_points(&[(6.0, 0.0), (3.0, 80.0)]),
            vec![LineOcc::new(r2, None)],
        );

        assert_eq!(remove_edge_artifacts(&mut g, 15.0), 0);
        assert!(g.node_alive(u) && g.node_alive(v));
        assert_eq!(g.num_edges(), 3);
    }

    #[test]
    fn cleanup_realigns_endpoints() {
        let mut g = LineGraph::new(50.0);
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        let e = g
            .add_edg(
                a,
                b,
                PolyLine::from_points(&[(0.0, 0.0), (50.0, 3.0), (100.0, 0.0)]),
                vec![],
            )
            .unwrap();
        g.set_node_pos(a, c(2.0, 0.0));

        clean_up_geoms(&mut g, 0.0);
        assert!(dist(g.edg(e).geom.first(), g.nd(a).pos) < 1e-9);
        assert!(dist(g.edg(e).geom.last(), g.nd(b).pos) < 1e-9);
        g.check_invariants("test", 1e-6).unwrap();
    }
}
