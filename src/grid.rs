//! Uniform cell grids for neighborhood queries.
//!
//! Two instances exist per graph: one over node points, one over edge
//! bounding boxes (an edge sits in every cell its bbox overlaps). Single
//! mutations update cells incrementally; bulk rewrites go through
//! `clear` + re-insertion.

use ahash::AHashMap;
use geo::Coord;

use crate::geometry::{dist, PolyLine};

#[derive(Debug, Clone)]
pub struct PointGrid<T> {
    cell_size: f64,
    cells: AHashMap<(i32, i32), Vec<(Coord, T)>>,
}

impl<T: Copy + PartialEq> PointGrid<T> {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            cells: AHashMap::new(),
        }
    }

    fn cell(&self, x: f64, y: f64) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    pub fn add(&mut self, pos: Coord, item: T) {
        let c = self.cell(pos.x, pos.y);
        self.cells.entry(c).or_default().push((pos, item));
    }

    pub fn remove(&mut self, pos: Coord, item: T) {
        let c = self.cell(pos.x, pos.y);
        if let Some(v) = self.cells.get_mut(&c) {
            if let Some(i) = v.iter().position(|(_, t)| *t == item) {
                v.swap_remove(i);
            }
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Items within `radius` of `pos`.
    pub fn neighbors(&self, pos: Coord, radius: f64) -> Vec<T> {
        let mut out = Vec::new();
        let r_sq = radius * radius;
        let min = self.cell(pos.x - radius, pos.y - radius);
        let max = self.cell(pos.x + radius, pos.y + radius);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                if let Some(v) = self.cells.get(&(cx, cy)) {
                    for (p, t) in v {
                        let dx = p.x - pos.x;
                        let dy = p.y - pos.y;
                        if dx * dx + dy * dy <= r_sq {
                            out.push(*t);
                        }
                    }
                }
            }
        }
        out
    }

    /// Nearest item within `radius`, if any.
    pub fn nearest(&self, pos: Coord, radius: f64) -> Option<(T, f64)> {
        let mut best: Option<(T, f64)> = None;
        let min = self.cell(pos.x - radius, pos.y - radius);
        let max = self.cell(pos.x + radius, pos.y + radius);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                if let Some(v) = self.cells.get(&(cx, cy)) {
                    for (p, t) in v {
                        let d = dist(*p, pos);
                        if d <= radius && best.map_or(true, |(_, bd)| d < bd) {
                            best = Some((*t, d));
                        }
                    }
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct RectGrid<T> {
    cell_size: f64,
    cells: AHashMap<(i32, i32), Vec<T>>,
}

impl<T: Copy + PartialEq + Eq + std::hash::Hash> RectGrid<T> {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            cells: AHashMap::new(),
        }
    }

    fn cell(&self, x: f64, y: f64) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    fn cell_range(&self, min: Coord, max: Coord) -> ((i32, i32), (i32, i32)) {
        (self.cell(min.x, min.y), self.cell(max.x, max.y))
    }

    pub fn add(&mut self, bbox: (Coord, Coord), item: T) {
        let (lo, hi) = self.cell_range(bbox.0, bbox.1);
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                self.cells.entry((cx, cy)).or_default().push(item);
            }
        }
    }

    pub fn remove(&mut self, bbox: (Coord, Coord), item: T) {
        let (lo, hi) = self.cell_range(bbox.0, bbox.1);
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                if let Some(v) = self.cells.get_mut(&(cx, cy)) {
                    if let Some(i) = v.iter().position(|t| *t == item) {
                        v.swap_remove(i);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Candidate items whose cells overlap `geom`'s bbox padded by
    /// `radius`. Deduplicated; callers do the exact distance check.
    pub fn neighbors(&self, geom: &PolyLine, radius: f64) -> Vec<T> {
        let (min, max) = geom.bbox();
        let lo = self.cell(min.x - radius, min.y - radius);
        let hi = self.cell(max.x + radius, max.y + radius);
        let mut seen = ahash::AHashSet::new();
        let mut out = Vec::new();
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                if let Some(v) = self.cells.get(&(cx, cy)) {
                    for t in v {
                        if seen.insert(*t) {
                            out.push(*t);
                        }
                    }
                }
            }
        }
        out
    }

    pub fn neighbors_of_point(&self, pos: Coord, radius: f64) -> Vec<T> {
        self.neighbors(&PolyLine::new(vec![pos]), radius)
    }
}
