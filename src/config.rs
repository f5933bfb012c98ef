/// Scalar parameters for the construction pipeline.
///
/// All distances are in the unit of the input coordinates (meters for
/// projected input). The CLI populates the fields it exposes; everything
/// else keeps its default.
#[derive(Debug, Clone)]
pub struct TopoConfig {
    /// Base aggregation distance `d0`. The collapse ladder runs from `d0`
    /// to `ladder_mult * d0` in steps of `d0`.
    pub max_aggr_distance: f64,

    /// Minimum length of a shared segment before two edges are bundled.
    pub min_shared_len: f64,

    /// Edges shorter than this are contracted away between passes.
    pub artifact_len: f64,

    /// Maximum distance from a station to the skeleton when re-inserting.
    pub station_snap_dist: f64,

    /// When a station projection lands this close to an existing node, the
    /// station attaches to that node instead of splitting the edge.
    pub node_snap_dist: f64,

    /// Simplification tolerance multiplier (0..1) applied during final
    /// geometry cleanup.
    pub smooth: f64,

    /// Upper bound of the aggregation ladder, as a multiple of `d0`.
    pub ladder_mult: u32,

    /// Split geometrically crossing edges at their intersection points
    /// before collapsing.
    pub topologize_isects: bool,
}

impl Default for TopoConfig {
    fn default() -> Self {
        Self {
            max_aggr_distance: 50.0,
            min_shared_len: 30.0,
            artifact_len: 15.0,
            station_snap_dist: 100.0,
            node_snap_dist: 20.0,
            smooth: 0.3,
            ladder_mult: 15,
            topologize_isects: false,
        }
    }
}

impl TopoConfig {
    /// Cell size for the spatial grids. Coarse enough that a radius query
    /// at the widest ladder distance touches few cells.
    pub fn grid_cell_size(&self) -> f64 {
        (self.max_aggr_distance * 4.0).max(10.0)
    }
}
