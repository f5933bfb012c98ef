//! The end-to-end construction pipeline, in phase order: snapshot
//! stations, clean the raw graph, snapshot restrictions, run the collapse
//! ladder, then fold restrictions and stations back in.

use log::info;

use crate::collapse::{
    average_node_positions, clean_up_geoms, collapse_ladder, remove_edge_artifacts,
    remove_node_artifacts, SNAP_DIST,
};
use crate::config::TopoConfig;
use crate::error::Result;
use crate::freeze::FreezeRegistry;
use crate::graph::LineGraph;
use crate::restrictions::RestrInferrer;
use crate::station::{OrphanStation, StationInserter};

/// Base simplification tolerance; the `smooth` parameter scales it.
const SMOOTH_BASE_EPS: f64 = 3.0;

/// Endpoint coincidence tolerance for the final invariant sweep.
const FINAL_EPS: f64 = 1e-6;

#[derive(Debug)]
pub struct PipelineSummary {
    pub nodes: usize,
    pub edges: usize,
    pub exceptions_added: usize,
    pub orphan_stations: Vec<OrphanStation>,
}

pub fn run_pipeline(g: &mut LineGraph, cfg: &TopoConfig) -> Result<PipelineSummary> {
    let mut freeze = FreezeRegistry::new();

    if cfg.topologize_isects {
        let n = g.topologize_intersections(SNAP_DIST);
        info!("topologized {} crossings", n);
    }

    info!(
        "input: {} nodes, {} edges, {} routes",
        g.num_nodes(),
        g.num_edges(),
        g.routes.len()
    );

    let mut stations = StationInserter::new();
    stations.init(g, &mut freeze);

    average_node_positions(g);
    clean_up_geoms(g, 0.0);
    remove_node_artifacts(g);
    remove_edge_artifacts(g, cfg.artifact_len);

    let mut restrictions = RestrInferrer::new();
    restrictions.init(g, &mut freeze);

    collapse_ladder(g, cfg);

    remove_node_artifacts(g);
    average_node_positions(g);
    clean_up_geoms(g, cfg.smooth * SMOOTH_BASE_EPS);

    let exceptions_added = restrictions.infer(g, &freeze);
    let orphan_stations = stations.insert_stations(g, &freeze, cfg);

    g.check_invariants("final", FINAL_EPS)?;

    Ok(PipelineSummary {
        nodes: g.num_nodes(),
        edges: g.num_edges(),
        exceptions_added,
        orphan_stations,
    })
}
