//! Fading position trails for traced agents.

use std::collections::HashMap;

use glam::Vec3;

use crate::agent::InstanceId;
use crate::gpu::mesh::LineVertex;

/// Recent positions of one agent, stored as line segments.
#[derive(Debug, Clone)]
pub struct Path {
    color: [f32; 3],
    /// Segment `i` runs from `points[2 * i]` to `points[2 * i + 1]`, oldest first.
    points: Vec<Vec3>,
    colors: Vec<[f32; 3]>,
    num_segments: usize,
    max_segments: usize,
}

impl Path {
    fn new(color: [f32; 3], max_segments: usize) -> Self {
        Self {
            color,
            points: vec![Vec3::ZERO; max_segments * 2],
            colors: vec![color; max_segments * 2],
            num_segments: 0,
            max_segments,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn color(&self) -> [f32; 3] {
        self.color
    }

    pub fn segments(&self) -> impl Iterator<Item = (Vec3, Vec3)> + '_ {
        self.points[..self.num_segments * 2]
            .chunks_exact(2)
            .map(|s| (s[0], s[1]))
    }

    /// End point of every retained segment, oldest first.
    pub fn segment_end_points(&self) -> Vec<Vec3> {
        self.segments().map(|(_, end)| end).collect()
    }

    /// Fade color at both ends of every retained segment.
    pub fn segment_colors(&self) -> &[[f32; 3]] {
        &self.colors[..self.num_segments * 2]
    }

    fn push_segment(&mut self, from: Vec3, to: Vec3, end_color: [f32; 3]) {
        if self.num_segments == self.max_segments {
            // Evict the oldest segment. The gradient is already full length.
            self.points.copy_within(2.., 0);
            self.colors.copy_within(2.., 0);
            self.num_segments = self.max_segments - 1;
            let i = self.num_segments * 2;
            self.points[i] = from;
            self.points[i + 1] = to;
            self.num_segments += 1;
            return;
        }

        let i = self.num_segments * 2;
        self.points[i] = from;
        self.points[i + 1] = to;
        self.num_segments += 1;
        self.recompute_colors(end_color);
    }

    fn recompute_colors(&mut self, end_color: [f32; 3]) {
        let n = self.num_segments as f32;
        let start = Vec3::from(end_color);
        let newest = Vec3::from(self.color);
        for seg in 0..self.num_segments {
            for (k, t) in [(0, seg as f32 / n), (1, (seg + 1) as f32 / n)] {
                self.colors[seg * 2 + k] = start.lerp(newest, t).to_array();
            }
        }
    }
}

/// Owns the paths of every traced agent.
#[derive(Debug, Clone)]
pub struct PathTrailTracker {
    paths: HashMap<InstanceId, Path>,
    max_segments: usize,
    end_color: [f32; 3],
    extent: Vec3,
    show: bool,
}

impl PathTrailTracker {
    pub fn new(max_segments: usize, end_color: [f32; 3], volume_bounds: [f32; 6]) -> Self {
        let mut tracker = Self {
            paths: HashMap::new(),
            max_segments: max_segments.max(1),
            end_color,
            extent: Vec3::ZERO,
            show: true,
        };
        tracker.set_volume_bounds(volume_bounds);
        tracker
    }

    /// Update the extent the wrap heuristic compares deltas against.
    pub fn set_volume_bounds(&mut self, bounds: [f32; 6]) {
        self.extent = Vec3::new(bounds[3] - bounds[0], bounds[4] - bounds[1], bounds[5] - bounds[2]);
    }

    /// Start tracing `id`. Returns false if it already had a path.
    pub fn add_path_for_agent(&mut self, id: InstanceId, color: [f32; 3]) -> bool {
        if self.paths.contains_key(&id) {
            return false;
        }
        self.paths.insert(id, Path::new(color, self.max_segments));
        true
    }

    pub fn remove_path_for_agent(&mut self, id: InstanceId) -> bool {
        self.paths.remove(&id).is_some()
    }

    pub fn has_path(&self, id: InstanceId) -> bool {
        self.paths.contains_key(&id)
    }

    pub fn path(&self, id: InstanceId) -> Option<&Path> {
        self.paths.get(&id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn set_show_paths(&mut self, show: bool) {
        self.show = show;
    }

    pub fn show_paths(&self) -> bool {
        self.show
    }

    /// Recolor a path; existing fade colors are refreshed.
    pub fn set_path_color(&mut self, id: InstanceId, color: [f32; 3]) {
        if let Some(path) = self.paths.get_mut(&id) {
            path.color = color;
            path.recompute_colors(self.end_color);
        }
    }

    /// Append the segment `(pos - delta, pos)` to `id`'s path.
    ///
    /// A zero delta is ignored. A delta larger than half the volume extent on
    /// any axis is assumed to be a periodic-boundary wrap and is zeroed, which
    /// leaves a degenerate segment rather than a line across the volume.
    pub fn add_point(&mut self, id: InstanceId, pos: Vec3, delta: Vec3) {
        let Some(path) = self.paths.get_mut(&id) else {
            return;
        };
        if delta == Vec3::ZERO {
            return;
        }

        let half = self.extent * 0.5;
        let wrapped = delta.abs().cmpgt(half).any();
        let delta = if wrapped { Vec3::ZERO } else { delta };

        path.push_segment(pos - delta, pos, self.end_color);
    }

    /// Line-list vertices for all visible paths.
    pub fn line_vertices(&self) -> Vec<LineVertex> {
        if !self.show {
            return Vec::new();
        }
        let mut out = Vec::new();
        for path in self.paths.values() {
            for (i, (a, b)) in path.segments().enumerate() {
                let colors = path.segment_colors();
                out.push(LineVertex {
                    position: a.to_array(),
                    color: colors[i * 2],
                });
                out.push(LineVertex {
                    position: b.to_array(),
                    color: colors[i * 2 + 1],
                });
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }
}
