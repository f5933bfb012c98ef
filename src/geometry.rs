//! Polyline kernel used by the whole pipeline.
//!
//! Everything operates on planar coordinates; projection to a metric plane
//! happens upstream. Tolerances are explicit arguments, never hidden
//! defaults.

use geo::algorithm::convex_hull::ConvexHull;
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::algorithm::simplify::Simplify;
use geo::{Coord, Line, LineString, MultiPoint, Point};

pub fn dist(a: Coord, b: Coord) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// A located point on a polyline: its position, the arclength from the
/// start, and the length fraction in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinePoint {
    pub pos: Coord,
    pub arclen: f64,
    pub frac: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolyLine {
    coords: Vec<Coord>,
}

impl PolyLine {
    pub fn new(coords: Vec<Coord>) -> Self {
        Self { coords }
    }

    pub fn from_points(pts: &[(f64, f64)]) -> Self {
        Self {
            coords: pts.iter().map(|&(x, y)| Coord { x, y }).collect(),
        }
    }

    pub fn line(a: Coord, b: Coord) -> Self {
        Self { coords: vec![a, b] }
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    pub fn into_coords(self) -> Vec<Coord> {
        self.coords
    }

    pub fn first(&self) -> Coord {
        self.coords[0]
    }

    pub fn last(&self) -> Coord {
        self.coords[self.coords.len() - 1]
    }

    pub fn len(&self) -> f64 {
        self.coords.windows(2).map(|w| dist(w[0], w[1])).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.len() < 2
    }

    /// True when the polyline has no usable extent.
    pub fn is_degenerate(&self, eps: f64) -> bool {
        self.coords.len() < 2 || self.len() < eps
    }

    pub fn reverse(&mut self) {
        self.coords.reverse();
    }

    pub fn reversed(&self) -> Self {
        let mut c = self.coords.clone();
        c.reverse();
        Self { coords: c }
    }

    /// Drop consecutive points closer than `eps` to each other.
    pub fn dedup(&mut self, eps: f64) {
        self.coords.dedup_by(|a, b| dist(*a, *b) < eps);
    }

    pub fn point_at_dist(&self, d: f64) -> Coord {
        if self.coords.len() == 1 {
            return self.coords[0];
        }
        let mut remaining = d.max(0.0);
        for w in self.coords.windows(2) {
            let seg = dist(w[0], w[1]);
            if remaining <= seg {
                if seg == 0.0 {
                    return w[0];
                }
                let t = remaining / seg;
                return Coord {
                    x: w[0].x + (w[1].x - w[0].x) * t,
                    y: w[0].y + (w[1].y - w[0].y) * t,
                };
            }
            remaining -= seg;
        }
        self.last()
    }

    pub fn point_at(&self, frac: f64) -> Coord {
        self.point_at_dist(frac.clamp(0.0, 1.0) * self.len())
    }

    /// Orthogonal projection of `p`, as the closest point over all
    /// segments.
    pub fn project(&self, p: Coord) -> LinePoint {
        let total = self.len();
        if self.coords.len() < 2 || total == 0.0 {
            return LinePoint {
                pos: self.coords[0],
                arclen: 0.0,
                frac: 0.0,
            };
        }

        let mut best = LinePoint {
            pos: self.coords[0],
            arclen: 0.0,
            frac: 0.0,
        };
        let mut best_dist = f64::INFINITY;
        let mut walked = 0.0;

        for w in self.coords.windows(2) {
            let dx = w[1].x - w[0].x;
            let dy = w[1].y - w[0].y;
            let seg_len = (dx * dx + dy * dy).sqrt();
            if seg_len == 0.0 {
                continue;
            }
            let t = (((p.x - w[0].x) * dx + (p.y - w[0].y) * dy) / (seg_len * seg_len))
                .clamp(0.0, 1.0);
            let proj = Coord {
                x: w[0].x + dx * t,
                y: w[0].y + dy * t,
            };
            let d = dist(p, proj);
            if d < best_dist {
                best_dist = d;
                let arclen = walked + seg_len * t;
                best = LinePoint {
                    pos: proj,
                    arclen,
                    frac: arclen / total,
                };
            }
            walked += seg_len;
        }
        best
    }

    /// Sub-polyline between length fractions `t0..t1`, keeping interior
    /// vertices and interpolating exact endpoints.
    pub fn segment(&self, t0: f64, t1: f64) -> PolyLine {
        let total = self.len();
        self.segment_dist(t0.clamp(0.0, 1.0) * total, t1.clamp(0.0, 1.0) * total)
    }

    /// Sub-polyline between arclengths `d0..d1`.
    pub fn segment_dist(&self, d0: f64, d1: f64) -> PolyLine {
        let (d0, d1) = if d0 <= d1 { (d0, d1) } else { (d1, d0) };
        let mut out = vec![self.point_at_dist(d0)];

        let mut walked = 0.0;
        for w in self.coords.windows(2) {
            let seg = dist(w[0], w[1]);
            let vertex_pos = walked + seg;
            if vertex_pos > d0 + 1e-9 && vertex_pos < d1 - 1e-9 {
                out.push(w[1]);
            }
            walked = vertex_pos;
        }

        out.push(self.point_at_dist(d1));
        PolyLine::new(out)
    }

    /// Insert vertices so no segment exceeds `max_spacing`.
    pub fn densify(&self, max_spacing: f64) -> PolyLine {
        if self.coords.len() < 2 {
            return self.clone();
        }
        let mut out = Vec::with_capacity(self.coords.len() * 2);
        out.push(self.coords[0]);
        for w in self.coords.windows(2) {
            let seg = dist(w[0], w[1]);
            if seg > max_spacing {
                let steps = (seg / max_spacing).ceil() as usize;
                for j in 1..steps {
                    let t = j as f64 / steps as f64;
                    out.push(Coord {
                        x: w[0].x + (w[1].x - w[0].x) * t,
                        y: w[0].y + (w[1].y - w[0].y) * t,
                    });
                }
            }
            out.push(w[1]);
        }
        PolyLine::new(out)
    }

    /// Douglas-Peucker simplification with tolerance `eps`.
    pub fn simplified(&self, eps: f64) -> PolyLine {
        if self.coords.len() < 3 || eps <= 0.0 {
            return self.clone();
        }
        let ls = LineString::new(self.coords.clone());
        let s = ls.simplify(&eps);
        if s.0.len() < 2 {
            return self.clone();
        }
        PolyLine::new(s.0)
    }

    /// Unit tangent between the points at arclengths `d0` and `d1`,
    /// obtained by endpoint subtraction.
    pub fn slope_between(&self, d0: f64, d1: f64) -> (f64, f64) {
        let a = self.point_at_dist(d0);
        let b = self.point_at_dist(d1);
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let l = (dx * dx + dy * dy).sqrt();
        if l == 0.0 {
            (0.0, 0.0)
        } else {
            (dx / l, dy / l)
        }
    }

    /// Lateral shift by signed distance `d` (positive is left of travel
    /// direction). Vertex normals average the adjacent segment normals.
    pub fn offset_perp(&self, d: f64) -> PolyLine {
        if self.coords.len() < 2 {
            return self.clone();
        }
        let n = self.coords.len();
        let seg_normal = |a: Coord, b: Coord| -> (f64, f64) {
            let dx = b.x - a.x;
            let dy = b.y - a.y;
            let l = (dx * dx + dy * dy).sqrt();
            if l == 0.0 {
                (0.0, 0.0)
            } else {
                (-dy / l, dx / l)
            }
        };
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (nx, ny) = if i == 0 {
                seg_normal(self.coords[0], self.coords[1])
            } else if i == n - 1 {
                seg_normal(self.coords[n - 2], self.coords[n - 1])
            } else {
                let (ax, ay) = seg_normal(self.coords[i - 1], self.coords[i]);
                let (bx, by) = seg_normal(self.coords[i], self.coords[i + 1]);
                let (sx, sy) = (ax + bx, ay + by);
                let l = (sx * sx + sy * sy).sqrt();
                if l == 0.0 {
                    (ax, ay)
                } else {
                    (sx / l, sy / l)
                }
            };
            out.push(Coord {
                x: self.coords[i].x + nx * d,
                y: self.coords[i].y + ny * d,
            });
        }
        PolyLine::new(out)
    }

    /// Proper crossings with `other`, located on `self` and sorted by
    /// arclength. Collinear overlaps contribute no points.
    pub fn intersections(&self, other: &PolyLine) -> Vec<LinePoint> {
        let mut hits: Vec<LinePoint> = Vec::new();
        for a in self.coords.windows(2) {
            for b in other.coords.windows(2) {
                let la = Line::new(a[0], a[1]);
                let lb = Line::new(b[0], b[1]);
                if let Some(LineIntersection::SinglePoint { intersection, .. }) =
                    line_intersection(la, lb)
                {
                    let lp = self.project(intersection);
                    if !hits.iter().any(|h| dist(h.pos, lp.pos) < 1e-9) {
                        hits.push(lp);
                    }
                }
            }
        }
        hits.sort_by(|a, b| a.arclen.total_cmp(&b.arclen));
        hits
    }

    /// Resample to exactly `n` points, equidistant in arclength.
    pub fn resample(&self, n: usize) -> PolyLine {
        let n = n.max(2);
        let total = self.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let d = total * i as f64 / (n - 1) as f64;
            out.push(self.point_at_dist(d));
        }
        PolyLine::new(out)
    }

    /// Weighted point-wise mean of several polylines, resampled to a
    /// common parameterization. All inputs must run in the same
    /// orientation.
    pub fn average(lines: &[(&PolyLine, f64)]) -> PolyLine {
        assert!(!lines.is_empty());
        if lines.len() == 1 {
            return lines[0].0.clone();
        }
        let n = lines
            .iter()
            .map(|(pl, _)| pl.coords.len())
            .max()
            .unwrap_or(2)
            .max(2);
        let resampled: Vec<(PolyLine, f64)> =
            lines.iter().map(|(pl, w)| (pl.resample(n), *w)).collect();

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let mut x = 0.0;
            let mut y = 0.0;
            let mut wsum = 0.0;
            for (pl, w) in &resampled {
                x += pl.coords[i].x * w;
                y += pl.coords[i].y * w;
                wsum += w;
            }
            out.push(Coord {
                x: x / wsum,
                y: y / wsum,
            });
        }
        PolyLine::new(out)
    }

    pub fn bbox(&self) -> (Coord, Coord) {
        let mut min = Coord {
            x: f64::INFINITY,
            y: f64::INFINITY,
        };
        let mut max = Coord {
            x: f64::NEG_INFINITY,
            y: f64::NEG_INFINITY,
        };
        for c in &self.coords {
            min.x = min.x.min(c.x);
            min.y = min.y.min(c.y);
            max.x = max.x.max(c.x);
            max.y = max.y.max(c.y);
        }
        (min, max)
    }
}

/// Sample a cubic Bézier between `p0` and `p1` whose control points follow
/// the endpoint tangents with half the endpoint distance as magnitude.
pub fn bezier_render(
    p0: Coord,
    tan0: (f64, f64),
    p1: Coord,
    tan1: (f64, f64),
    samples: usize,
) -> PolyLine {
    let samples = samples.max(2);
    let mag = dist(p0, p1) / 2.0;
    let c0 = Coord {
        x: p0.x + tan0.0 * mag,
        y: p0.y + tan0.1 * mag,
    };
    // the second tangent points into p1
    let c1 = Coord {
        x: p1.x - tan1.0 * mag,
        y: p1.y - tan1.1 * mag,
    };

    let mut out = Vec::with_capacity(samples);
    for i in 0..samples {
        let t = i as f64 / (samples - 1) as f64;
        let mt = 1.0 - t;
        let b0 = mt * mt * mt;
        let b1 = 3.0 * mt * mt * t;
        let b2 = 3.0 * mt * t * t;
        let b3 = t * t * t;
        out.push(Coord {
            x: b0 * p0.x + b1 * c0.x + b2 * c1.x + b3 * p1.x,
            y: b0 * p0.y + b1 * c0.y + b2 * c1.y + b3 * p1.y,
        });
    }
    PolyLine::new(out)
}

/// Convex hull of a set of polylines buffered by `rad`: every vertex is
/// expanded to a small circle before hulling, so the result clears the
/// input by the given radius everywhere.
pub fn convex_front_hull(lines: &[&PolyLine], rad: f64) -> Vec<Coord> {
    const CIRCLE_STEPS: usize = 12;

    let mut pts: Vec<Point<f64>> = Vec::new();
    for pl in lines {
        for c in pl.coords() {
            if rad > 0.0 {
                for i in 0..CIRCLE_STEPS {
                    let a = std::f64::consts::TAU * i as f64 / CIRCLE_STEPS as f64;
                    pts.push(Point::new(c.x + rad * a.cos(), c.y + rad * a.sin()));
                }
            } else {
                pts.push(Point::new(c.x, c.y));
            }
        }
    }
    if pts.len() < 3 {
        return pts.into_iter().map(|p| p.0).collect();
    }
    let hull = MultiPoint::from(pts).convex_hull();
    hull.exterior().0.clone()
}
