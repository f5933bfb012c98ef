//! The wire formats: a JSON graph in, the same schema (plus inferred
//! exceptions) out, and a DOT dialect as an equivalent alternate for both
//! directions. Both readers funnel through one `JsonGraph` intermediate,
//! so validation and graph construction happen in a single place.
//!
//! Node ids are preserved: whatever the input called a node, the output
//! calls its survivor. Nodes created during construction get fresh ids
//! that do not collide with the input's. Exceptions name edges by their
//! opposite endpoint node, which is the only stable way to address an
//! undirected edge in a node-keyed schema.

use std::io::{Read, Write};

use ahash::{AHashMap, AHashSet};
use geo::Coord;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::geometry::PolyLine;
use crate::graph::{LineGraph, LineOcc, NodeId, Station};

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonGraph {
    pub nodes: Vec<JsonNode>,
    pub edges: Vec<JsonEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonNode {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stations: Vec<JsonStation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_conn: Vec<JsonExcludedConn>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonStation {
    pub id: String,
    pub label: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonExcludedConn {
    pub route: String,
    /// Node id of the opposite endpoint of the first edge.
    pub edge_a: String,
    /// Node id of the opposite endpoint of the second edge.
    pub edge_b: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub geom: Vec<[f64; 2]>,
    #[serde(default)]
    pub lines: Vec<JsonLine>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonLine {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub color: String,
    /// 0 = both ways, 1 = toward `from`, 2 = toward `to`.
    #[serde(default)]
    pub direction: u8,
}

// ---------------------------------------------------------------------------
// construction

pub fn read_graph<R: Read>(r: R, grid_cell: f64) -> Result<LineGraph> {
    let raw: JsonGraph = serde_json::from_reader(r)?;
    build_graph(raw, grid_cell)
}

pub fn build_graph(raw: JsonGraph, grid_cell: f64) -> Result<LineGraph> {
    let mut g = LineGraph::new(grid_cell);
    let mut ids: AHashMap<String, NodeId> = AHashMap::new();

    for jn in &raw.nodes {
        if ids.contains_key(&jn.id) {
            return Err(BuildError::InputMalformed(format!(
                "duplicate node id '{}'",
                jn.id
            )));
        }
        let n = g.add_nd_with_original(Coord { x: jn.x, y: jn.y }, jn.id.clone());
        ids.insert(jn.id.clone(), n);
        for js in &jn.stations {
            g.add_station(
                n,
                Station {
                    id: js.id.clone(),
                    label: js.label.clone(),
                    pos: Coord { x: js.x, y: js.y },
                },
            );
        }
    }

    for je in &raw.edges {
        let from = *ids.get(&je.from).ok_or_else(|| {
            BuildError::InputMalformed(format!("edge references unknown node id '{}'", je.from))
        })?;
        let to = *ids.get(&je.to).ok_or_else(|| {
            BuildError::InputMalformed(format!("edge references unknown node id '{}'", je.to))
        })?;

        if from == to {
            warn!(
                "dropping degenerate edge '{}'-'{}' (self-loop)",
                je.from, je.to
            );
            continue;
        }

        let geom = if je.geom.is_empty() {
            PolyLine::line(g.nd(from).pos, g.nd(to).pos)
        } else {
            PolyLine::new(je.geom.iter().map(|p| Coord { x: p[0], y: p[1] }).collect())
        };
        if geom.is_degenerate(1e-6) {
            warn!(
                "dropping degenerate edge '{}'-'{}' (zero length)",
                je.from, je.to
            );
            continue;
        }

        let mut routes = Vec::with_capacity(je.lines.len());
        for jl in &je.lines {
            let rid = g.routes.get_or_insert(&jl.id, &jl.label, &jl.color);
            let dir = match jl.direction {
                0 => None,
                1 => Some(from),
                2 => Some(to),
                d => {
                    return Err(BuildError::InputMalformed(format!(
                        "line '{}' has direction {} (expected 0, 1 or 2)",
                        jl.id, d
                    )))
                }
            };
            let occ = LineOcc::new(rid, dir);
            if !routes.contains(&occ) {
                routes.push(occ);
            }
        }

        g.add_edg(from, to, geom, routes);
    }

    // exceptions resolve against the now-complete edge set
    for jn in &raw.nodes {
        let n = ids[&jn.id];
        for exc in &jn.excluded_conn {
            let route = g.routes.get_by_id(&exc.route).ok_or_else(|| {
                BuildError::InputMalformed(format!(
                    "exception at node '{}' references unknown route '{}'",
                    jn.id, exc.route
                ))
            })?;
            let resolve_edge = |name: &str| -> Result<crate::graph::EdgeId> {
                let other = *ids.get(name).ok_or_else(|| {
                    BuildError::InputMalformed(format!(
                        "exception at node '{}' references unknown node id '{}'",
                        jn.id, name
                    ))
                })?;
                g.get_edg(n, other).ok_or_else(|| {
                    BuildError::InputMalformed(format!(
                        "exception at node '{}' references missing edge to '{}'",
                        jn.id, name
                    ))
                })
            };
            let ea = resolve_edge(&exc.edge_a)?;
            let eb = resolve_edge(&exc.edge_b)?;
            g.add_conn_exc(n, route, ea, eb);
        }
    }

    Ok(g)
}

// ---------------------------------------------------------------------------
// serialization

/// The output name of every node: its input id where one survived,
/// otherwise a fresh id that collides with nothing.
fn node_names(g: &LineGraph, order: &[NodeId]) -> AHashMap<NodeId, String> {
    let mut used: AHashSet<String> = order
        .iter()
        .filter_map(|&n| g.nd(n).original_id.clone())
        .collect();
    let mut names = AHashMap::new();
    for &n in order {
        let name = match &g.nd(n).original_id {
            Some(s) => s.clone(),
            None => {
                let mut cand = n.to_string();
                while used.contains(&cand) {
                    cand = format!("n{}", cand);
                }
                used.insert(cand.clone());
                cand
            }
        };
        names.insert(n, name);
    }
    names
}

pub fn to_json(g: &LineGraph) -> JsonGraph {
    let mut node_order: Vec<NodeId> = g.node_ids();
    node_order.sort();
    let names = node_names(g, &node_order);

    let mut nodes: Vec<JsonNode> = Vec::with_capacity(node_order.len());
    for n in &node_order {
        let node = g.nd(*n);
        let excluded_conn = node
            .exceptions()
            .into_iter()
            .map(|(route, ea, eb)| JsonExcludedConn {
                route: g.routes.get(route).map(|r| r.id.clone()).unwrap_or_default(),
                edge_a: names[&g.edg(ea).other(*n)].clone(),
                edge_b: names[&g.edg(eb).other(*n)].clone(),
            })
            .collect();
        nodes.push(JsonNode {
            id: names[n].clone(),
            x: node.pos.x,
            y: node.pos.y,
            stations: node
                .stations
                .iter()
                .map(|s| JsonStation {
                    id: s.id.clone(),
                    label: s.label.clone(),
                    x: s.pos.x,
                    y: s.pos.y,
                })
                .collect(),
            excluded_conn,
        });
    }

    let mut edges: Vec<JsonEdge> = Vec::with_capacity(g.num_edges());
    let mut edge_order = g.edge_ids();
    edge_order.sort();
    for e in edge_order {
        let edge = g.edg(e);
        edges.push(JsonEdge {
            from: names[&edge.from].clone(),
            to: names[&edge.to].clone(),
            geom: edge.geom.coords().iter().map(|c| [c.x, c.y]).collect(),
            lines: edge
                .routes
                .iter()
                .map(|occ| {
                    let route = g.routes.get(occ.route);
                    JsonLine {
                        id: route.map(|r| r.id.clone()).unwrap_or_default(),
                        label: route.map(|r| r.label.clone()).unwrap_or_default(),
                        color: route.map(|r| r.color.clone()).unwrap_or_default(),
                        direction: match occ.dir {
                            None => 0,
                            Some(t) if t == edge.from => 1,
                            Some(_) => 2,
                        },
                    }
                })
                .collect(),
        });
    }

    JsonGraph { nodes, edges }
}

pub fn write_graph<W: Write>(g: &LineGraph, w: W) -> Result<()> {
    serde_json::to_writer_pretty(w, &to_json(g))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// DOT dialect
//
// One statement per line. Nodes carry `pos` (graphviz neato syntax, with
// the pinning `!`), optional `stations` and `excluded` attributes; edges
// carry `geom` and `lines`. Field separators inside attributes: `|` within
// a record, `;` between records, spaces between geometry points.
//
//   graph transit {
//     node [shape=point];
//     "a" [pos="0,0!", stations="s1|Alpha|1|1"];
//     "c" [pos="200,0!", excluded="R1,b,d"];
//     "a" -- "b" [geom="0,0 50,5 100,0", lines="R1|1|ff0000|2"];
//   }

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn write_dot<W: Write>(g: &LineGraph, mut w: W) -> Result<()> {
    let jg = to_json(g);

    writeln!(w, "graph transit {{")?;
    writeln!(w, "  node [shape=point];")?;
    for n in &jg.nodes {
        let mut attrs = format!("pos=\"{},{}!\"", n.x, n.y);
        if !n.stations.is_empty() {
            let recs: Vec<String> = n
                .stations
                .iter()
                .map(|s| {
                    format!(
                        "{}|{}|{}|{}",
                        dot_escape(&s.id),
                        dot_escape(&s.label),
                        s.x,
                        s.y
                    )
                })
                .collect();
            attrs.push_str(&format!(", stations=\"{}\"", recs.join(";")));
            attrs.push_str(&format!(
                ", xlabel=\"{}\"",
                dot_escape(&n.stations[0].label)
            ));
        }
        if !n.excluded_conn.is_empty() {
            let recs: Vec<String> = n
                .excluded_conn
                .iter()
                .map(|x| {
                    format!(
                        "{},{},{}",
                        dot_escape(&x.route),
                        dot_escape(&x.edge_a),
                        dot_escape(&x.edge_b)
                    )
                })
                .collect();
            attrs.push_str(&format!(", excluded=\"{}\"", recs.join(";")));
        }
        writeln!(w, "  \"{}\" [{}];", dot_escape(&n.id), attrs)?;
    }
    for e in &jg.edges {
        let geom: Vec<String> = e.geom.iter().map(|p| format!("{},{}", p[0], p[1])).collect();
        let lines: Vec<String> = e
            .lines
            .iter()
            .map(|l| {
                format!(
                    "{}|{}|{}|{}",
                    dot_escape(&l.id),
                    dot_escape(&l.label),
                    dot_escape(&l.color),
                    l.direction
                )
            })
            .collect();
        writeln!(
            w,
            "  \"{}\" -- \"{}\" [geom=\"{}\", lines=\"{}\"];",
            dot_escape(&e.from),
            dot_escape(&e.to),
            geom.join(" "),
            lines.join(";")
        )?;
    }
    writeln!(w, "}}")?;
    Ok(())
}

pub fn read_dot<R: Read>(mut r: R, grid_cell: f64) -> Result<LineGraph> {
    let mut src = String::new();
    r.read_to_string(&mut src)?;
    build_graph(parse_dot(&src)?, grid_cell)
}

fn parse_dot(src: &str) -> Result<JsonGraph> {
    let mut nodes: Vec<JsonNode> = Vec::new();
    let mut edges: Vec<JsonEdge> = Vec::new();

    for raw in src.lines() {
        let line = raw.trim().trim_end_matches(';').trim();
        if line.is_empty()
            || line.starts_with("graph")
            || line.starts_with("digraph")
            || line.starts_with("node ")
            || line.starts_with("node[")
            || line.starts_with("edge ")
            || line.starts_with("edge[")
            || line.starts_with("//")
            || line.starts_with('#')
            || line == "{"
            || line == "}"
        {
            continue;
        }

        let (id, rest) = take_ident(line)
            .ok_or_else(|| BuildError::InputMalformed(format!("unparsable DOT line: {}", raw)))?;
        let rest = rest.trim_start();

        if let Some(rest) = rest.strip_prefix("--") {
            let rest = rest.trim_start();
            let (to, rest) = take_ident(rest).ok_or_else(|| {
                BuildError::InputMalformed(format!("edge without second endpoint: {}", raw))
            })?;
            let attrs = take_attrs(rest)?;

            let mut geom = Vec::new();
            if let Some(v) = attrs.get("geom") {
                for pt in v.split_whitespace() {
                    geom.push(parse_point(pt)?);
                }
            }
            let mut lines = Vec::new();
            if let Some(v) = attrs.get("lines") {
                for rec in v.split(';').filter(|r| !r.is_empty()) {
                    let f: Vec<&str> = rec.split('|').collect();
                    if f.len() != 4 {
                        return Err(BuildError::InputMalformed(format!(
                            "malformed line record '{}'",
                            rec
                        )));
                    }
                    lines.push(JsonLine {
                        id: f[0].to_string(),
                        label: f[1].to_string(),
                        color: f[2].to_string(),
                        direction: f[3].parse().map_err(|_| {
                            BuildError::InputMalformed(format!(
                                "bad direction in line record '{}'",
                                rec
                            ))
                        })?,
                    });
                }
            }
            edges.push(JsonEdge {
                from: id,
                to,
                geom,
                lines,
            });
        } else {
            let attrs = take_attrs(rest)?;
            let pos = attrs.get("pos").ok_or_else(|| {
                BuildError::InputMalformed(format!("node '{}' has no pos attribute", id))
            })?;
            let [x, y] = parse_point(pos.trim_end_matches('!'))?;

            let mut stations = Vec::new();
            if let Some(v) = attrs.get("stations") {
                for rec in v.split(';').filter(|r| !r.is_empty()) {
                    let f: Vec<&str> = rec.split('|').collect();
                    if f.len() != 4 {
                        return Err(BuildError::InputMalformed(format!(
                            "malformed station record '{}'",
                            rec
                        )));
                    }
                    stations.push(JsonStation {
                        id: f[0].to_string(),
                        label: f[1].to_string(),
                        x: parse_num(f[2])?,
                        y: parse_num(f[3])?,
                    });
                }
            }
            let mut excluded_conn = Vec::new();
            if let Some(v) = attrs.get("excluded") {
                for rec in v.split(';').filter(|r| !r.is_empty()) {
                    let f: Vec<&str> = rec.split(',').collect();
                    if f.len() != 3 {
                        return Err(BuildError::InputMalformed(format!(
                            "malformed exception record '{}'",
                            rec
                        )));
                    }
                    excluded_conn.push(JsonExcludedConn {
                        route: f[0].to_string(),
                        edge_a: f[1].to_string(),
                        edge_b: f[2].to_string(),
                    });
                }
            }
            nodes.push(JsonNode {
                id,
                x,
                y,
                stations,
                excluded_conn,
            });
        }
    }

    Ok(JsonGraph { nodes, edges })
}

/// Leading identifier of a statement: a quoted string (with escapes) or a
/// bare word. Returns the identifier and the unconsumed tail.
fn take_ident(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    let mut chars = s.char_indices();
    match chars.next()? {
        (_, '"') => {
            let mut out = String::new();
            let mut escaped = false;
            for (i, ch) in chars {
                if escaped {
                    out.push(ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    return Some((out, &s[i + 1..]));
                } else {
                    out.push(ch);
                }
            }
            None // unterminated quote
        }
        _ => {
            let end = s
                .find(|ch: char| ch.is_whitespace() || ch == '[' || ch == '-')
                .unwrap_or(s.len());
            if end == 0 {
                None
            } else {
                Some((s[..end].to_string(), &s[end..]))
            }
        }
    }
}

/// The `[key="value", ...]` block of a statement, if present. Commas
/// inside quoted values do not split.
fn take_attrs(s: &str) -> Result<AHashMap<String, String>> {
    let mut attrs = AHashMap::new();
    let s = s.trim();
    if s.is_empty() {
        return Ok(attrs);
    }
    let inner = s
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| BuildError::InputMalformed(format!("malformed attribute block: {}", s)))?;

    let mut parts: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            cur.push(ch);
            escaped = false;
        } else if in_quotes && ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == ',' && !in_quotes {
            parts.push(std::mem::take(&mut cur));
        } else {
            cur.push(ch);
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }

    for part in parts {
        let Some((k, v)) = part.split_once('=') else {
            continue; // bare attribute like `bold`
        };
        attrs.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(attrs)
}

fn parse_num(s: &str) -> Result<f64> {
    s.trim()
        .parse()
        .map_err(|_| BuildError::InputMalformed(format!("bad number '{}'", s)))
}

fn parse_point(s: &str) -> Result<[f64; 2]> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| BuildError::InputMalformed(format!("bad point '{}'", s)))?;
    Ok([parse_num(x)?, parse_num(y)?])
}
