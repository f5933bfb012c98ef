use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use speedwell::config::TopoConfig;
use speedwell::graph_json;
use speedwell::run_pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input graph, JSON or DOT (by .dot/.gv extension; stdin is sniffed).
    /// Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output graph JSON. Writes stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Base aggregation distance d0 in meters. The collapse ladder runs
    /// from d0 up to ladder-mult * d0.
    #[arg(long, env = "SPEEDWELL_MAX_AGGR_DISTANCE", default_value_t = 50.0)]
    max_aggr_distance: f64,

    /// Minimum shared-segment length in meters.
    #[arg(long, default_value_t = 30.0)]
    min_shared_len: f64,

    /// Edges shorter than this are contracted away, in meters.
    #[arg(long, default_value_t = 15.0)]
    artifact_len: f64,

    /// Maximum station snapping distance in meters.
    #[arg(long, default_value_t = 100.0)]
    station_snap_dist: f64,

    /// Geometry smoothing factor (0..1).
    #[arg(long, default_value_t = 0.3)]
    smooth: f64,

    /// Upper bound of the aggregation ladder as a multiple of d0.
    #[arg(long, default_value_t = 15)]
    ladder_mult: u32,

    /// Split geometrically crossing edges into junctions before
    /// collapsing.
    #[arg(long, default_value_t = false)]
    topologize_isects: bool,

    /// Write a graphviz dump of the final graph to this path.
    #[arg(long)]
    dot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = TopoConfig {
        max_aggr_distance: args.max_aggr_distance,
        min_shared_len: args.min_shared_len,
        artifact_len: args.artifact_len,
        station_snap_dist: args.station_snap_dist,
        smooth: args.smooth,
        ladder_mult: args.ladder_mult,
        topologize_isects: args.topologize_isects,
        ..TopoConfig::default()
    };

    info!("parsing input graph");
    let mut g = match &args.input {
        Some(path) => {
            let is_dot = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("dot") || e.eq_ignore_ascii_case("gv"))
                .unwrap_or(false);
            let file = File::open(path)
                .with_context(|| format!("opening input graph {}", path.display()))?;
            if is_dot {
                graph_json::read_dot(BufReader::new(file), cfg.grid_cell_size())?
            } else {
                graph_json::read_graph(BufReader::new(file), cfg.grid_cell_size())?
            }
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading input graph from stdin")?;
            if buf.trim_start().starts_with("graph") {
                graph_json::read_dot(buf.as_bytes(), cfg.grid_cell_size())?
            } else {
                graph_json::read_graph(buf.as_bytes(), cfg.grid_cell_size())?
            }
        }
    };

    let summary = run_pipeline(&mut g, &cfg).context("map construction failed")?;
    info!(
        "pipeline done: {} nodes, {} edges, {} inferred exceptions",
        summary.nodes, summary.edges, summary.exceptions_added
    );
    for orphan in &summary.orphan_stations {
        warn!(
            "orphan station '{}' ({}) kept at its original position",
            orphan.station.label, orphan.station.id
        );
    }

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            graph_json::write_graph(&g, BufWriter::new(file))?;
        }
        None => {
            let stdout = std::io::stdout();
            graph_json::write_graph(&g, stdout.lock())?;
            println!();
        }
    }

    if let Some(path) = &args.dot {
        let file =
            File::create(path).with_context(|| format!("creating dot file {}", path.display()))?;
        graph_json::write_dot(&g, BufWriter::new(file))?;
    }

    // flush explicitly so truncated pipes surface as errors
    std::io::stdout().flush().ok();
    Ok(())
}
