//! Station re-insertion.
//!
//! Stations ride along on nodes while the collapse reshapes the graph, but
//! their positions come from the schedule feed, not from the skeleton. So
//! the inserter strips them up front, remembers where they were, and snaps
//! each one back onto the simplified skeleton afterwards.

use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};

use crate::config::TopoConfig;
use crate::freeze::{FreezeId, FreezeRegistry};
use crate::geometry::dist;
use crate::graph::{LineGraph, NodeId, Station};

struct EdgeEnvelope {
    id: crate::graph::EdgeId,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for EdgeEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope_of(g: &LineGraph, e: crate::graph::EdgeId) -> EdgeEnvelope {
    let (min, max) = g.edg(e).geom.bbox();
    EdgeEnvelope {
        id: e,
        env: AABB::from_corners([min.x, min.y], [max.x, max.y]),
    }
}

/// A station that found no edge within the snap distance. It is attached
/// to an isolated node at its original position and reported.
#[derive(Debug, Clone)]
pub struct OrphanStation {
    pub station: Station,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
struct StationSnapshot {
    node: NodeId,
    station: Station,
}

#[derive(Default)]
pub struct StationInserter {
    freeze: Option<FreezeId>,
    snapshots: Vec<StationSnapshot>,
}

impl StationInserter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot and strip all station payloads, and freeze the node set so
    /// the originals can be resolved later.
    pub fn init(&mut self, g: &mut LineGraph, freeze: &mut FreezeRegistry) {
        self.freeze = Some(freeze.freeze(g));
        for n in g.node_ids() {
            let stations = std::mem::take(&mut g.nd_mut(n).stations);
            for station in stations {
                self.snapshots.push(StationSnapshot { node: n, station });
            }
        }
        info!("snapshotted {} stations", self.snapshots.len());
    }

    /// Re-attach every snapshotted station to the skeleton: onto the
    /// surviving node where one is close enough, else by splitting the
    /// nearest edge at the station's projection. Returns the orphans.
    pub fn insert_stations(
        &mut self,
        g: &mut LineGraph,
        freeze: &FreezeRegistry,
        cfg: &TopoConfig,
    ) -> Vec<OrphanStation> {
        let Some(fr) = self.freeze else {
            return Vec::new();
        };
        let track = freeze.track(g, fr);

        let mut tree: RTree<EdgeEnvelope> =
            RTree::bulk_load(g.edge_ids().iter().map(|&e| envelope_of(g, e)).collect());

        let mut orphans = Vec::new();
        let mut attached = 0usize;

        for snap in std::mem::take(&mut self.snapshots) {
            let pos = snap.station.pos;
            let r = cfg.station_snap_dist;
            let query = AABB::from_corners([pos.x - r, pos.y - r], [pos.x + r, pos.y + r]);

            // nearest projection on any surviving edge
            let mut best: Option<(crate::graph::EdgeId, crate::geometry::LinePoint, f64)> = None;
            for cand in tree.locate_in_envelope_intersecting(&query) {
                if !g.edge_alive(cand.id) {
                    continue; // split or folded since the tree was built
                }
                let lp = g.edg(cand.id).geom.project(pos);
                let d = dist(pos, lp.pos);
                if d <= r && best.as_ref().map_or(true, |(_, _, bd)| d < *bd) {
                    best = Some((cand.id, lp, d));
                }
            }

            let Some((edge, lp, d)) = best else {
                let node = g.add_nd(pos);
                g.add_station(node, snap.station.clone());
                warn!(
                    "station '{}' ({}) has no edge within {}; kept isolated",
                    snap.station.label, snap.station.id, r
                );
                orphans.push(OrphanStation {
                    station: snap.station,
                    node,
                });
                continue;
            };

            // prefer the node this station collapsed into, when it still
            // sits on the spot
            let survivor = track
                .get(&snap.node)
                .copied()
                .filter(|&s| g.node_alive(s) && dist(g.nd(s).pos, lp.pos) <= cfg.node_snap_dist);

            let target = if let Some(s) = survivor {
                s
            } else if let Some(near) = g.nearest_nd(lp.pos, cfg.node_snap_dist) {
                near
            } else {
                let split = g.split_edg(edge, lp.frac, cfg.node_snap_dist);
                if split.before != split.after {
                    for &ne in [split.before, split.after].iter() {
                        tree.insert(envelope_of(g, ne));
                    }
                }
                split.node
            };

            debug!(
                "station '{}' attached to node {} ({}m off the skeleton)",
                snap.station.label, target, d as i64
            );
            g.add_station(target, snap.station);
            attached += 1;
        }

        info!(
            "re-inserted {} stations, {} orphans",
            attached,
            orphans.len()
        );
        orphans
    }
}
