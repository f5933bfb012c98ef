//! The undirected line graph the whole pipeline mutates in place.
//!
//! Nodes and edges live in slot vectors owned by the graph; everything else
//! refers to them through `NodeId`/`EdgeId`. Ids are never reused, so a
//! tombstoned slot stays a reliable "this node is gone" answer for the
//! freeze registry. The two spatial grids are kept current by every
//! geometry mutation.

use std::fmt;

use ahash::{AHashMap, AHashSet};
use geo::Coord;

use crate::error::{BuildError, Result};
use crate::geometry::{dist, PolyLine};
use crate::grid::{PointGrid, RectGrid};
use crate::routes::{RouteId, RouteRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A station attached to a node. A station may be represented by several
/// nodes early on and consolidates onto one during collapsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub label: String,
    pub pos: Coord,
}

/// One route traveling over an edge. `dir` is the endpoint node the route
/// travels toward; `None` means both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOcc {
    pub route: RouteId,
    pub dir: Option<NodeId>,
}

impl LineOcc {
    pub fn new(route: RouteId, dir: Option<NodeId>) -> Self {
        Self { route, dir }
    }
}

/// Direction of an occurrence relative to node `n`: `1` the route arrives
/// at `n`, `-1` it leaves `n`, `0` undirected.
pub fn dir_at(occ: &LineOcc, n: NodeId) -> i8 {
    match occ.dir {
        None => 0,
        Some(t) if t == n => 1,
        Some(_) => -1,
    }
}

#[derive(Debug, Clone)]
pub struct LineNode {
    pub pos: Coord,
    /// Id the node carried in the input, if any. Survives merges so the
    /// output can keep naming what the input named.
    pub original_id: Option<String>,
    pub stations: Vec<Station>,
    adj: Vec<EdgeId>,
    // (route, edge) -> edges the route must not continue into at this node.
    // Stored in both directions.
    conn_exc: AHashMap<RouteId, AHashMap<EdgeId, AHashSet<EdgeId>>>,
}

impl LineNode {
    fn new(pos: Coord) -> Self {
        Self {
            pos,
            original_id: None,
            stations: Vec::new(),
            adj: Vec::new(),
            conn_exc: AHashMap::new(),
        }
    }

    pub fn deg(&self) -> usize {
        self.adj.len()
    }

    pub fn adj(&self) -> &[EdgeId] {
        &self.adj
    }

    pub fn add_conn_exc(&mut self, route: RouteId, a: EdgeId, b: EdgeId) {
        if a == b {
            return;
        }
        self.conn_exc
            .entry(route)
            .or_default()
            .entry(a)
            .or_default()
            .insert(b);
        self.conn_exc
            .entry(route)
            .or_default()
            .entry(b)
            .or_default()
            .insert(a);
    }

    /// True unless an exception forbids `route` continuing between `a` and
    /// `b` here.
    pub fn conn_occurs(&self, route: RouteId, a: EdgeId, b: EdgeId) -> bool {
        match self.conn_exc.get(&route).and_then(|m| m.get(&a)) {
            Some(forbidden) => !forbidden.contains(&b),
            None => true,
        }
    }

    /// All exceptions, each reported once (`a < b`).
    pub fn exceptions(&self) -> Vec<(RouteId, EdgeId, EdgeId)> {
        let mut out = Vec::new();
        for (route, m) in &self.conn_exc {
            for (a, set) in m {
                for b in set {
                    if a < b {
                        out.push((*route, *a, *b));
                    }
                }
            }
        }
        out.sort();
        out
    }

    fn remap_exc_edge(&mut self, old: EdgeId, new: EdgeId) {
        for m in self.conn_exc.values_mut() {
            if let Some(set) = m.remove(&old) {
                m.entry(new).or_default().extend(set);
            }
            for set in m.values_mut() {
                if set.remove(&old) {
                    set.insert(new);
                }
            }
        }
    }

    fn drop_exc_edge(&mut self, e: EdgeId) {
        for m in self.conn_exc.values_mut() {
            m.remove(&e);
            for set in m.values_mut() {
                set.remove(&e);
            }
        }
        self.conn_exc.retain(|_, m| {
            m.retain(|_, set| !set.is_empty());
            !m.is_empty()
        });
    }
}

#[derive(Debug, Clone)]
pub struct LineEdge {
    pub from: NodeId,
    pub to: NodeId,
    // runs from the `from` node to the `to` node
    pub geom: PolyLine,
    pub routes: Vec<LineOcc>,
    // input-era ancestor edges, consumed by restriction inference
    pub origins: AHashSet<EdgeId>,
}

impl LineEdge {
    pub fn other(&self, n: NodeId) -> NodeId {
        if self.from == n {
            self.to
        } else {
            self.from
        }
    }

    pub fn is_incident(&self, n: NodeId) -> bool {
        self.from == n || self.to == n
    }

    pub fn has_route(&self, r: RouteId) -> bool {
        self.routes.iter().any(|o| o.route == r)
    }

    pub fn occ(&self, r: RouteId) -> Option<&LineOcc> {
        self.routes.iter().find(|o| o.route == r)
    }

    /// Geometry oriented to start at `n`.
    pub fn geom_from(&self, n: NodeId) -> PolyLine {
        if self.from == n {
            self.geom.clone()
        } else {
            self.geom.reversed()
        }
    }

    fn add_occ(&mut self, occ: LineOcc) {
        if !self.routes.contains(&occ) {
            self.routes.push(occ);
        }
    }
}

#[derive(Debug)]
pub struct LineGraph {
    nodes: Vec<Option<LineNode>>,
    edges: Vec<Option<LineEdge>>,
    pub routes: RouteRegistry,
    node_grid: PointGrid<NodeId>,
    edge_grid: RectGrid<EdgeId>,
    // freeze bookkeeping: contractions record their survivor, plain
    // deletions a tombstone
    merged: AHashMap<NodeId, NodeId>,
    dropped: AHashSet<NodeId>,
}

impl LineGraph {
    pub fn new(grid_cell: f64) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            routes: RouteRegistry::new(),
            node_grid: PointGrid::new(grid_cell),
            edge_grid: RectGrid::new(grid_cell),
            merged: AHashMap::new(),
            dropped: AHashSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // access

    pub fn nd(&self, n: NodeId) -> &LineNode {
        self.nodes[n.0 as usize].as_ref().expect("stale node id")
    }

    pub fn nd_mut(&mut self, n: NodeId) -> &mut LineNode {
        self.nodes[n.0 as usize].as_mut().expect("stale node id")
    }

    pub fn edg(&self, e: EdgeId) -> &LineEdge {
        self.edges[e.0 as usize].as_ref().expect("stale edge id")
    }

    pub(crate) fn edg_mut(&mut self, e: EdgeId) -> &mut LineEdge {
        self.edges[e.0 as usize].as_mut().expect("stale edge id")
    }

    pub fn node_alive(&self, n: NodeId) -> bool {
        self.nodes
            .get(n.0 as usize)
            .map_or(false, |s| s.is_some())
    }

    pub fn edge_alive(&self, e: EdgeId) -> bool {
        self.edges
            .get(e.0 as usize)
            .map_or(false, |s| s.is_some())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &LineNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &LineEdge)> {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (EdgeId(i as u32), e)))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|(id, _)| id).collect()
    }

    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.edges().map(|(id, _)| id).collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn num_edges(&self) -> usize {
        self.edges().count()
    }

    pub fn get_edg(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        self.nd(a)
            .adj
            .iter()
            .copied()
            .find(|&e| self.edg(e).other(a) == b)
    }

    /// All edges between a node pair. More than one only transiently,
    /// while a collapse is in flight.
    pub fn edgs_between(&self, a: NodeId, b: NodeId) -> Vec<EdgeId> {
        self.nd(a)
            .adj
            .iter()
            .copied()
            .filter(|&e| self.edg(e).other(a) == b)
            .collect()
    }

    pub fn bbox(&self) -> Option<(Coord, Coord)> {
        let mut min = Coord {
            x: f64::INFINITY,
            y: f64::INFINITY,
        };
        let mut max = Coord {
            x: f64::NEG_INFINITY,
            y: f64::NEG_INFINITY,
        };
        let mut any = false;
        for (_, e) in self.edges() {
            let (lo, hi) = e.geom.bbox();
            min.x = min.x.min(lo.x);
            min.y = min.y.min(lo.y);
            max.x = max.x.max(hi.x);
            max.y = max.y.max(hi.y);
            any = true;
        }
        for (_, n) in self.nodes() {
            min.x = min.x.min(n.pos.x);
            min.y = min.y.min(n.pos.y);
            max.x = max.x.max(n.pos.x);
            max.y = max.y.max(n.pos.y);
            any = true;
        }
        any.then_some((min, max))
    }

    pub fn node_neighbors(&self, pos: Coord, radius: f64) -> Vec<NodeId> {
        self.node_grid.neighbors(pos, radius)
    }

    pub fn nearest_nd(&self, pos: Coord, radius: f64) -> Option<NodeId> {
        self.node_grid.nearest(pos, radius).map(|(n, _)| n)
    }

    pub fn edge_neighbors(&self, geom: &PolyLine, radius: f64) -> Vec<EdgeId> {
        self.edge_grid.neighbors(geom, radius)
    }

    // ------------------------------------------------------------------
    // mutation

    pub fn add_nd(&mut self, pos: Coord) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(LineNode::new(pos)));
        self.node_grid.add(pos, id);
        id
    }

    /// Add a node that keeps the id it carried in the input.
    pub fn add_nd_with_original(&mut self, pos: Coord, original_id: String) -> NodeId {
        let id = self.add_nd(pos);
        self.nd_mut(id).original_id = Some(original_id);
        id
    }

    pub fn add_station(&mut self, n: NodeId, station: Station) {
        self.nd_mut(n).stations.push(station);
    }

    /// Move a node and re-align its incident edge endpoints.
    pub fn set_node_pos(&mut self, n: NodeId, pos: Coord) {
        let old = self.nd(n).pos;
        self.node_grid.remove(old, n);
        self.nd_mut(n).pos = pos;
        self.node_grid.add(pos, n);

        for e in self.nd(n).adj.to_vec() {
            let edge = self.edg(e);
            let mut coords = edge.geom.coords().to_vec();
            if edge.from == n {
                coords[0] = pos;
            }
            if edge.to == n {
                let i = coords.len() - 1;
                coords[i] = pos;
            }
            self.set_geom(e, PolyLine::new(coords));
        }
    }

    /// Replace an edge's geometry, keeping the edge grid current.
    pub fn set_geom(&mut self, e: EdgeId, geom: PolyLine) {
        let old_bbox = self.edg(e).geom.bbox();
        self.edge_grid.remove(old_bbox, e);
        self.edg_mut(e).geom = geom;
        let new_bbox = self.edg(e).geom.bbox();
        self.edge_grid.add(new_bbox, e);
    }

    /// Add an edge between two distinct nodes. A second edge over the same
    /// pair folds its occurrences into the existing one (no parallel
    /// edges); a self-loop is rejected.
    pub fn add_edg(
        &mut self,
        from: NodeId,
        to: NodeId,
        geom: PolyLine,
        routes: Vec<LineOcc>,
    ) -> Option<EdgeId> {
        if from == to {
            return None;
        }
        if let Some(ex) = self.get_edg(from, to) {
            for occ in routes {
                self.edg_mut(ex).add_occ(occ);
            }
            return Some(ex);
        }
        Some(self.insert_edge(from, to, geom, routes, None))
    }

    fn insert_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        mut geom: PolyLine,
        routes: Vec<LineOcc>,
        origins: Option<AHashSet<EdgeId>>,
    ) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);

        // pin the geometry to the endpoint nodes
        geom.dedup(1e-9);
        let mut coords = if geom.coords().len() < 2 {
            vec![self.nd(from).pos, self.nd(to).pos]
        } else {
            geom.into_coords()
        };
        coords[0] = self.nd(from).pos;
        let i = coords.len() - 1;
        coords[i] = self.nd(to).pos;
        let geom = PolyLine::new(coords);

        let origins = origins.unwrap_or_else(|| {
            let mut s = AHashSet::new();
            s.insert(id);
            s
        });

        self.edge_grid.add(geom.bbox(), id);
        self.edges.push(Some(LineEdge {
            from,
            to,
            geom,
            routes,
            origins,
        }));
        self.nd_mut(from).adj.push(id);
        self.nd_mut(to).adj.push(id);
        id
    }

    /// Detach an edge slot without touching connection exceptions. Callers
    /// remap or drop exceptions themselves.
    fn detach_edge(&mut self, e: EdgeId) -> LineEdge {
        let edge = self.edges[e.0 as usize]
            .take()
            .expect("stale edge id");
        self.edge_grid.remove(edge.geom.bbox(), e);
        self.nd_mut(edge.from).adj.retain(|&x| x != e);
        self.nd_mut(edge.to).adj.retain(|&x| x != e);
        edge
    }

    pub fn del_edg(&mut self, e: EdgeId) {
        let edge = self.detach_edge(e);
        self.nd_mut(edge.from).drop_exc_edge(e);
        self.nd_mut(edge.to).drop_exc_edge(e);
    }

    /// Delete a node and everything incident. Records a tombstone.
    pub fn del_nd(&mut self, n: NodeId) {
        for e in self.nd(n).adj.to_vec() {
            self.del_edg(e);
        }
        let node = self.nodes[n.0 as usize]
            .take()
            .expect("stale node id");
        self.node_grid.remove(node.pos, n);
        self.dropped.insert(n);
    }

    // ------------------------------------------------------------------
    // exceptions

    pub fn add_conn_exc(&mut self, n: NodeId, route: RouteId, a: EdgeId, b: EdgeId) {
        self.nd_mut(n).add_conn_exc(route, a, b);
    }

    pub fn conn_occurs(&self, n: NodeId, route: RouteId, a: EdgeId, b: EdgeId) -> bool {
        self.nd(n).conn_occurs(route, a, b)
    }

    /// A route actually continues between `a` and `b` at `n`: present on
    /// both edges and not excepted.
    pub fn routable(&self, n: NodeId, route: RouteId, a: EdgeId, b: EdgeId) -> bool {
        self.edg(a).has_route(route)
            && self.edg(b).has_route(route)
            && self.conn_occurs(n, route, a, b)
    }

    // ------------------------------------------------------------------
    // freeze support

    /// Follow the merge chain of a node; `None` once it hits a tombstone.
    pub fn resolve(&self, n: NodeId) -> Option<NodeId> {
        let mut cur = n;
        loop {
            if self.dropped.contains(&cur) {
                return None;
            }
            match self.merged.get(&cur) {
                Some(&next) => cur = next,
                None => return self.node_alive(cur).then_some(cur),
            }
        }
    }

    /// Reset edge provenance so inference phases key off the current edge
    /// set.
    pub fn reset_origins(&mut self) {
        for i in 0..self.edges.len() {
            if self.edges[i].is_some() {
                let id = EdgeId(i as u32);
                let mut s = AHashSet::new();
                s.insert(id);
                self.edg_mut(id).origins = s;
            }
        }
    }

    // ------------------------------------------------------------------
    // structural operations

    /// Split an edge at a length fraction. Returns the node at the split
    /// position plus the edges covering the parts before and after it;
    /// when the position lies within `snap` of an endpoint no split
    /// happens and both parts are the original edge.
    pub fn split_edg(&mut self, e: EdgeId, frac: f64, snap: f64) -> SplitResult {
        let edge = self.edg(e);
        let total = edge.geom.len();
        let d = frac.clamp(0.0, 1.0) * total;

        if d <= snap {
            return SplitResult {
                node: edge.from,
                before: e,
                after: e,
            };
        }
        if total - d <= snap {
            return SplitResult {
                node: edge.to,
                before: e,
                after: e,
            };
        }

        let from = edge.from;
        let to = edge.to;
        let geom_a = edge.geom.segment_dist(0.0, d);
        let geom_b = edge.geom.segment_dist(d, total);
        let routes = edge.routes.clone();
        let origins = edge.origins.clone();

        let m = self.add_nd(geom_a.last());

        let rebase = |routes: &[LineOcc], sub_from: NodeId, sub_to: NodeId| -> Vec<LineOcc> {
            routes
                .iter()
                .map(|occ| {
                    let dir = match occ.dir {
                        None => None,
                        Some(t) if t == to => Some(sub_to),
                        Some(_) => Some(sub_from),
                    };
                    LineOcc::new(occ.route, dir)
                })
                .collect()
        };

        let ea = self.insert_edge(from, m, geom_a, rebase(&routes, from, m), Some(origins.clone()));
        let eb = self.insert_edge(m, to, geom_b, rebase(&routes, m, to), Some(origins));

        // exceptions at the endpoints now refer to the adjacent part
        self.nd_mut(from).remap_exc_edge(e, ea);
        self.nd_mut(to).remap_exc_edge(e, eb);
        self.detach_edge(e);

        SplitResult {
            node: m,
            before: ea,
            after: eb,
        }
    }

    /// Contract `a` into `b`: any connecting edge disappears, `b` moves to
    /// the midpoint, stations and exceptions transfer, and `a`'s edges are
    /// re-parented onto `b` (folding into existing parallels where
    /// needed). Returns the fold remapping of edge ids.
    pub fn merge_nds(&mut self, a: NodeId, b: NodeId) -> AHashMap<EdgeId, EdgeId> {
        let mut remap: AHashMap<EdgeId, EdgeId> = AHashMap::new();
        if a == b {
            return remap;
        }

        while let Some(conn) = self.get_edg(a, b) {
            self.del_edg(conn);
        }

        let a_pos = self.nd(a).pos;
        let b_pos = self.nd(b).pos;
        self.set_node_pos(
            b,
            Coord {
                x: (a_pos.x + b_pos.x) / 2.0,
                y: (a_pos.y + b_pos.y) / 2.0,
            },
        );

        for e in self.nd(a).adj.to_vec() {
            let other = self.edg(e).other(a);
            let fold_target = self.get_edg(other, b);

            // re-parent onto b
            let b_pos = self.nd(b).pos;
            let (is_from, old_bbox) = {
                let edge = self.edg(e);
                (edge.from == a, edge.geom.bbox())
            };
            self.edge_grid.remove(old_bbox, e);
            {
                let edge = self.edg_mut(e);
                let mut coords = edge.geom.coords().to_vec();
                if is_from {
                    edge.from = b;
                    coords[0] = b_pos;
                } else {
                    edge.to = b;
                    let i = coords.len() - 1;
                    coords[i] = b_pos;
                }
                edge.geom = PolyLine::new(coords);
                for occ in &mut edge.routes {
                    if occ.dir == Some(a) {
                        occ.dir = Some(b);
                    }
                }
            }
            let new_bbox = self.edg(e).geom.bbox();
            self.edge_grid.add(new_bbox, e);
            self.nd_mut(b).adj.push(e);

            if let Some(ex) = fold_target {
                self.fold_edg(e, ex);
                remap.insert(e, ex);
            }
        }

        // transfer stations, the input id, and exceptions
        let node_a = self.nodes[a.0 as usize]
            .take()
            .expect("stale node id");
        self.node_grid.remove(node_a.pos, a);
        self.nd_mut(b).stations.extend(node_a.stations);
        if self.nd(b).original_id.is_none() {
            self.nd_mut(b).original_id = node_a.original_id.clone();
        }

        for (route, m) in node_a.conn_exc {
            for (ea, set) in m {
                let ea = *remap.get(&ea).unwrap_or(&ea);
                for eb in set {
                    let eb = *remap.get(&eb).unwrap_or(&eb);
                    if self.edge_alive(ea)
                        && self.edge_alive(eb)
                        && self.edg(ea).is_incident(b)
                        && self.edg(eb).is_incident(b)
                    {
                        self.nd_mut(b).add_conn_exc(route, ea, eb);
                    }
                }
            }
        }

        self.merged.insert(a, b);
        remap
    }

    /// Fold `src` into `dst`, two edges over the same node pair: the
    /// geometry becomes the route-count-weighted average, occurrences and
    /// provenance are unioned, exceptions re-pointed.
    pub fn fold_edg(&mut self, src: EdgeId, dst: EdgeId) {
        debug_assert!(src != dst);
        let old = self.detach_edge(src);
        debug_assert!(
            self.edg(dst).is_incident(old.from) && self.edg(dst).is_incident(old.to)
        );

        let anchor = self.edg(dst).from;
        let w_old = old.routes.len().max(1) as f64;
        let w_dst = self.edg(dst).routes.len().max(1) as f64;
        let old_oriented = if old.from == anchor {
            old.geom.clone()
        } else {
            old.geom.reversed()
        };
        let avg = PolyLine::average(&[(&self.edg(dst).geom, w_dst), (&old_oriented, w_old)]);
        self.set_geom(dst, avg);

        for occ in &old.routes {
            self.edg_mut(dst).add_occ(*occ);
        }
        let origins = old.origins.clone();
        self.edg_mut(dst).origins.extend(origins);

        self.nd_mut(old.from).remap_exc_edge(src, dst);
        self.nd_mut(old.to).remap_exc_edge(src, dst);
    }

    /// Dissolve a degree-2 node by concatenating its two edges. The caller
    /// has already verified route compatibility. Returns the surviving
    /// edge, or `None` when the merge would form a self-loop.
    pub fn combine_edgs(&mut self, ea: EdgeId, eb: EdgeId, via: NodeId) -> Option<EdgeId> {
        let other_a = self.edg(ea).other(via);
        let other_b = self.edg(eb).other(via);
        if other_a == other_b {
            return None;
        }

        let a = self.edg(ea).clone();
        let b = self.edg(eb).clone();

        let mut coords = if a.from == other_a {
            a.geom.coords().to_vec()
        } else {
            a.geom.reversed().into_coords()
        };
        coords.pop(); // join point appears in both halves
        if b.from == via {
            coords.extend_from_slice(b.geom.coords());
        } else {
            coords.extend(b.geom.reversed().into_coords());
        }

        let mut routes: Vec<LineOcc> = Vec::new();
        for occ_a in &a.routes {
            let da = dir_at(occ_a, via);
            let dir = if let Some(occ_b) = b.occ(occ_a.route) {
                let db = dir_at(occ_b, via);
                if da == 1 && db == -1 {
                    Some(other_b)
                } else if da == -1 && db == 1 {
                    Some(other_a)
                } else {
                    None
                }
            } else {
                match da {
                    1 => Some(other_b),
                    -1 => Some(other_a),
                    _ => None,
                }
            };
            let occ = LineOcc::new(occ_a.route, dir);
            if !routes.contains(&occ) {
                routes.push(occ);
            }
        }
        for occ_b in &b.routes {
            if routes.iter().any(|o| o.route == occ_b.route) {
                continue;
            }
            let dir = match dir_at(occ_b, via) {
                -1 => Some(other_b),
                1 => Some(other_a),
                _ => None,
            };
            routes.push(LineOcc::new(occ_b.route, dir));
        }

        let mut origins = a.origins.clone();
        origins.extend(b.origins.iter().copied());

        self.detach_edge(ea);
        self.detach_edge(eb);

        let new = if let Some(ex) = self.get_edg(other_a, other_b) {
            for occ in routes {
                self.edg_mut(ex).add_occ(occ);
            }
            self.edg_mut(ex).origins.extend(origins);
            ex
        } else {
            self.insert_edge(other_a, other_b, PolyLine::new(coords), routes, Some(origins))
        };

        self.nd_mut(other_a).remap_exc_edge(ea, new);
        self.nd_mut(other_b).remap_exc_edge(eb, new);

        let node = self.nodes[via.0 as usize]
            .take()
            .expect("stale node id");
        self.node_grid.remove(node.pos, via);
        self.dropped.insert(via);

        Some(new)
    }

    /// Split geometrically crossing edges at their intersection points and
    /// join them with a junction node.
    pub fn topologize_intersections(&mut self, snap: f64) -> usize {
        let mut created = 0;
        loop {
            let Some((e1, e2, lp)) = self.next_isect(snap) else {
                break;
            };
            let s1 = self.split_edg(e1, lp.frac, snap);
            let p2 = self.edg(e2).geom.project(lp.pos);
            let s2 = self.split_edg(e2, p2.frac, snap);
            if s1.node != s2.node {
                self.merge_nds(s2.node, s1.node);
            }
            created += 1;
            if created > 10_000 {
                break; // runaway guard
            }
        }
        created
    }

    fn next_isect(&self, snap: f64) -> Option<(EdgeId, EdgeId, crate::geometry::LinePoint)> {
        for (e1, edge1) in self.edges() {
            for e2 in self.edge_grid.neighbors(&edge1.geom, 0.0) {
                if e2 <= e1 {
                    continue;
                }
                let edge2 = self.edg(e2);
                if edge1.is_incident(edge2.from) || edge1.is_incident(edge2.to) {
                    continue;
                }
                for lp in edge1.geom.intersections(&edge2.geom) {
                    let interior_1 = lp.arclen > snap && edge1.geom.len() - lp.arclen > snap;
                    let p2 = edge2.geom.project(lp.pos);
                    let interior_2 = p2.arclen > snap && edge2.geom.len() - p2.arclen > snap;
                    if interior_1 && interior_2 {
                        return Some((e1, e2, lp));
                    }
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // invariants

    /// Walk the whole structure and report the first inconsistency.
    pub fn check_invariants(&self, phase: &'static str, eps: f64) -> Result<()> {
        let fail = |detail: String| -> Result<()> {
            Err(BuildError::InvariantViolation { phase, detail })
        };

        for (id, e) in self.edges() {
            if !self.node_alive(e.from) || !self.node_alive(e.to) {
                return fail(format!("edge {} references a dead node", id));
            }
            if e.from == e.to {
                return fail(format!("edge {} is a self-loop", id));
            }
            if e.geom.is_empty() {
                return fail(format!("edge {} has no geometry", id));
            }
            if dist(e.geom.first(), self.nd(e.from).pos) > eps
                || dist(e.geom.last(), self.nd(e.to).pos) > eps
            {
                return fail(format!("edge {} geometry detached from its nodes", id));
            }
            for (i, a) in e.routes.iter().enumerate() {
                if e.routes[i + 1..].contains(a) {
                    return fail(format!("edge {} has duplicate occurrences", id));
                }
                if let Some(d) = a.dir {
                    if d != e.from && d != e.to {
                        return fail(format!("edge {} occurrence points off-edge", id));
                    }
                }
            }
            if !self.edge_grid.neighbors(&e.geom, 0.0).contains(&id) {
                return fail(format!("edge {} missing from the edge grid", id));
            }
        }

        for (id, n) in self.nodes() {
            let mut others = AHashSet::new();
            for &e in &n.adj {
                if !self.edge_alive(e) {
                    return fail(format!("node {} lists a dead edge", id));
                }
                if !self.edg(e).is_incident(id) {
                    return fail(format!("node {} lists a non-incident edge", id));
                }
                if !others.insert(self.edg(e).other(id)) {
                    return fail(format!("node {} has parallel edges", id));
                }
            }
            for (route, m) in &n.conn_exc {
                for (a, set) in m {
                    for b in set {
                        if !n.adj.contains(a) || !n.adj.contains(b) {
                            return fail(format!(
                                "node {} exception references non-incident edge",
                                id
                            ));
                        }
                        if !n.conn_occurs(*route, *b, *a) {
                            continue; // symmetric entry present
                        }
                        return fail(format!("node {} has an asymmetric exception", id));
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitResult {
    pub node: NodeId,
    pub before: EdgeId,
    pub after: EdgeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn simple_graph() -> (LineGraph, NodeId, NodeId, EdgeId, RouteId) {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(100.0, 0.0));
        let e = g
            .add_edg(
                a,
                b,
                PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
                vec![LineOcc::new(r, Some(b))],
            )
            .unwrap();
        (g, a, b, e, r)
    }

    #[test]
    fn no_parallel_edges_on_creation() {
        let (mut g, a, b, e, _) = simple_graph();
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let e2 = g
            .add_edg(
                a,
                b,
                PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
                vec![LineOcc::new(r2, None)],
            )
            .unwrap();
        assert_eq!(e, e2);
        assert_eq!(g.edg(e).routes.len(), 2);
        assert_eq!(g.num_edges(), 1);
        let (min, max) = g.bbox().unwrap();
        assert!(min.x <= 0.0 && max.x >= 100.0);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn self_loops_rejected() {
        let (mut g, a, _, _, _) = simple_graph();
        assert!(g
            .add_edg(a, a, PolyLine::from_points(&[(0.0, 0.0), (0.0, 0.0)]), vec![])
            .is_none());
    }

    #[test]
    fn split_rebases_directions() {
        let (mut g, a, b, e, r) = simple_graph();
        let s = g.split_edg(e, 0.5, 1.0);
        assert_ne!(s.before, s.after);
        assert!((g.nd(s.node).pos.x - 50.0).abs() < 1e-9);

        // direction toward b survives on both halves, pointing forward
        let occ_a = *g.edg(s.before).occ(r).unwrap();
        let occ_b = *g.edg(s.after).occ(r).unwrap();
        assert_eq!(occ_a.dir, Some(s.node));
        assert_eq!(occ_b.dir, Some(b));
        assert_eq!(g.edg(s.before).from, a);
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn split_near_endpoint_snaps() {
        let (mut g, a, _, e, _) = simple_graph();
        let s = g.split_edg(e, 0.001, 1.0);
        assert_eq!(s.node, a);
        assert_eq!(s.before, e);
        assert_eq!(s.after, e);
        assert_eq!(g.num_nodes(), 2);
    }

    #[test]
    fn merge_contracts_and_reparents() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let a = g.add_nd(c(0.0, 0.0));
        let b = g.add_nd(c(10.0, 0.0));
        let x = g.add_nd(c(-50.0, 0.0));
        g.add_edg(
            x,
            a,
            PolyLine::from_points(&[(-50.0, 0.0), (0.0, 0.0)]),
            vec![LineOcc::new(r, Some(a))],
        );
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (10.0, 0.0)]),
            vec![LineOcc::new(r, Some(b))],
        );

        g.merge_nds(a, b);

        assert!(!g.node_alive(a));
        assert_eq!(g.resolve(a), Some(b));
        assert!((g.nd(b).pos.x - 5.0).abs() < 1e-9);
        let e = g.get_edg(x, b).unwrap();
        assert_eq!(g.edg(e).occ(r).unwrap().dir, Some(b));
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn merge_folds_parallel_strands() {
        let mut g = LineGraph::new(50.0);
        let r1 = g.routes.get_or_insert("R1", "1", "ff0000");
        let r2 = g.routes.get_or_insert("R2", "2", "00ff00");
        let x = g.add_nd(c(0.0, 0.0));
        let a = g.add_nd(c(100.0, 1.0));
        let b = g.add_nd(c(100.0, -1.0));
        g.add_edg(
            x,
            a,
            PolyLine::from_points(&[(0.0, 0.0), (100.0, 1.0)]),
            vec![LineOcc::new(r1, None)],
        );
        g.add_edg(
            x,
            b,
            PolyLine::from_points(&[(0.0, 0.0), (100.0, -1.0)]),
            vec![LineOcc::new(r2, None)],
        );

        let remap = g.merge_nds(a, b);

        assert_eq!(g.num_edges(), 1);
        assert_eq!(remap.len(), 1);
        let e = g.get_edg(x, b).unwrap();
        assert!(g.edg(e).has_route(r1) && g.edg(e).has_route(r2));
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn combine_concatenates_geometry() {
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
                vec![LineOcc::new(r, Some(m))],
            )
            .unwrap();
        let eb = g
            .add_edg(
                m,
                b,
                PolyLine::from_points(&[(50.0, 0.0), (100.0, 0.0)]),
                vec![LineOcc::new(r, Some(b))],
            )
            .unwrap();

        let e = g.combine_edgs(ea, eb, m).unwrap();

        assert!(!g.node_alive(m));
        assert_eq!(g.resolve(m), None); // dissolved, not merged
        assert!((g.edg(e).geom.len() - 100.0).abs() < 1e-9);
        // continuation direction: still toward b
        assert_eq!(g.edg(e).occ(r).unwrap().dir, Some(b));
        g.check_invariants("test", 1e-6).unwrap();
    }

    #[test]
    fn exceptions_are_symmetric_and_survive_merges() {
        let mut g = LineGraph::new(50.0);
        let r = g.routes.get_or_insert("R1", "1", "ff0000");
        let n = g.add_nd(c(0.0, 0.0));
        let x = g.add_nd(c(-100.0, 0.0));
        let y = g.add_nd(c(100.0, 0.0));
        let ex = g
            .add_edg(
                x,
                n,
                PolyLine::from_points(&[(-100.0, 0.0), (0.0, 0.0)]),
                vec![LineOcc::new(r, None)],
            )
            .unwrap();
        let ey = g
            .add_edg(
                n,
                y,
                PolyLine::from_points(&[(0.0, 0.0), (100.0, 0.0)]),
                vec![LineOcc::new(r, None)],
            )
            .unwrap();

        g.add_conn_exc(n, r, ex, ey);
        assert!(!g.conn_occurs(n, r, ex, ey));
        assert!(!g.conn_occurs(n, r, ey, ex));
        assert!(!g.routable(n, r, ex, ey));

        // merging another node into n keeps the exception intact
        let z = g.add_nd(c(0.0, 10.0));
        g.add_edg(
            z,
            n,
            PolyLine::from_points(&[(0.0, 10.0), (0.0, 0.0)]),
            vec![],
        );
        g.merge_nds(z, n);
        g.check_invariants("test", 1e-6).unwrap();
        assert!(!g.conn_occurs(n, r, ex, ey));
        assert_eq!(g.resolve(z), Some(n));
    }

    #[test]
    fn topologize_creates_junction() {
        let mut g = LineGraph::new(50.0);
        let a = g.add_nd(c(-50.0, 0.0));
        let b = g.add_nd(c(50.0, 0.0));
        let u = g.add_nd(c(0.0, -50.0));
        let v = g.add_nd(c(0.0, 50.0));
        g.add_edg(
            a,
            b,
            PolyLine::from_points(&[(-50.0, 0.0), (50.0, 0.0)]),
            vec![],
        );
        g.add_edg(
            u,
            v,
            PolyLine::from_points(&[(0.0, -50.0), (0.0, 50.0)]),
            vec![],
        );

        let n = g.topologize_intersections(1.0);
        assert_eq!(n, 1);
        assert_eq!(g.num_nodes(), 5);
        assert_eq!(g.num_edges(), 4);
        let junction = g
            .nodes()
            .find(|(_, nd)| nd.deg() == 4)
            .map(|(id, _)| id)
            .unwrap();
        assert!(dist(g.nd(junction).pos, c(0.0, 0.0)) < 1.0);
        g.check_invariants("test", 1e-6).unwrap();
    }
}
