//! Geometry assets that agents are drawn with.
//!
//! Meshes come from Wavefront OBJ and use provided normals when present,
//! otherwise area-weighted normals are generated. Atomic structures come from
//! the `ATOM`/`HETATM` records of a PDB file and are drawn as one sphere per
//! atom, with coarser k-means levels for distant agents.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;

use crate::error::AssetError;
use crate::gpu::mesh::Vertex;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f32; 3]>) -> Self {
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        let mut any = false;
        for p in points {
            any = true;
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }
        if any {
            Self { min, max }
        } else {
            Self::default()
        }
    }

    pub fn center(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Radius of the sphere around `center()` that encloses the box.
    pub fn bounding_radius(&self) -> f32 {
        Vec3::from(self.size()).length() / 2.0
    }
}

/// A triangle mesh ready for upload.
#[derive(Debug, Clone)]
pub struct MeshAsset {
    pub id: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub bounds: BoundingBox,
}

impl MeshAsset {
    pub fn new(id: String, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = BoundingBox::from_points(vertices.iter().map(|v| &v.position));
        Self {
            id,
            vertices,
            indices,
            bounds,
        }
    }

    /// Parse a mesh from OBJ text. All models in the file are merged.
    pub fn from_obj(id: String, obj_content: &str) -> Result<Self, AssetError> {
        let mut cursor = std::io::Cursor::new(obj_content.as_bytes());

        let load_options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };

        let (models, _materials) =
            tobj::load_obj_buf(&mut cursor, &load_options, |_| Ok((vec![], HashMap::new())))
                .map_err(|e| AssetError::Parse {
                    name: id.clone(),
                    reason: e.to_string(),
                })?;

        let mut all_positions: Vec<[f32; 3]> = Vec::new();
        let mut all_normals: Vec<[f32; 3]> = Vec::new();
        let mut all_indices = Vec::new();
        let mut has_normals = true;

        for model in &models {
            let mesh = &model.mesh;
            if mesh.positions.is_empty() {
                continue;
            }

            let vertex_offset = all_positions.len() as u32;
            let model_has_normals = mesh.normals.len() == mesh.positions.len();
            has_normals &= model_has_normals;

            all_positions.extend(mesh.positions.chunks_exact(3).map(|p| [p[0], p[1], p[2]]));
            if model_has_normals {
                all_normals.extend(mesh.normals.chunks_exact(3).map(|n| [n[0], n[1], n[2]]));
            }
            all_indices.extend(mesh.indices.iter().map(|i| vertex_offset + i));
        }

        if all_positions.is_empty() {
            return Err(AssetError::Parse {
                name: id,
                reason: "OBJ file contains no vertices".to_string(),
            });
        }

        let normals = if has_normals && all_normals.len() == all_positions.len() {
            all_normals
        } else {
            compute_vertex_normals(&all_positions, &all_indices)
        };

        let vertices = all_positions
            .iter()
            .zip(normals.iter())
            .map(|(p, n)| Vertex::new(*p, *n))
            .collect();

        Ok(Self::new(id, vertices, all_indices))
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Area-weighted vertex normals: each vertex accumulates the unnormalized face
/// normal of every adjacent triangle.
fn compute_vertex_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vec3::ZERO; positions.len()];

    for tri in indices.chunks_exact(3) {
        let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }
        let p0 = Vec3::from(positions[i0]);
        let face_normal = (Vec3::from(positions[i1]) - p0).cross(Vec3::from(positions[i2]) - p0);
        for idx in [i0, i1, i2] {
            normals[idx] += face_normal;
        }
    }

    normals
        .into_iter()
        .map(|n| {
            if n.length() > 1e-6 {
                n.normalize().to_array()
            } else {
                // Degenerate, fall back to Y-up
                [0.0, 1.0, 0.0]
            }
        })
        .collect()
}

/// Divisors of the atom count for the coarser detail levels.
const LOD_DIVISORS: [usize; 3] = [8, 32, 128];
const KMEANS_ITERATIONS: usize = 10;

/// Atom centers of a molecular structure, relative to its centroid.
///
/// Level 0 holds every atom. Each further level holds cluster centers of
/// the atoms, roughly an eighth, a thirty-second and a hundred-twenty-eighth
/// as many.
#[derive(Debug, Clone)]
pub struct AtomicStructure {
    pub id: String,
    levels: Vec<Vec<Vec3>>,
    pub bounds: BoundingBox,
}

impl AtomicStructure {
    /// Read atom coordinates from PDB text. Coordinates are recentered on their centroid.
    pub fn from_pdb(id: String, pdb_content: &str) -> Result<Self, AssetError> {
        let mut atoms = Vec::new();
        for (line_no, line) in pdb_content.lines().enumerate() {
            if !(line.starts_with("ATOM") || line.starts_with("HETATM")) {
                continue;
            }
            let coord = |range: std::ops::Range<usize>| -> Result<f32, AssetError> {
                line.get(range)
                    .and_then(|s| s.trim().parse::<f32>().ok())
                    .ok_or_else(|| AssetError::Parse {
                        name: id.clone(),
                        reason: format!("bad coordinates on line {}", line_no + 1),
                    })
            };
            atoms.push(Vec3::new(coord(30..38)?, coord(38..46)?, coord(46..54)?));
        }

        if atoms.is_empty() {
            return Err(AssetError::Parse {
                name: id,
                reason: "PDB file contains no atoms".to_string(),
            });
        }

        Ok(Self::from_atoms(id, atoms))
    }

    /// Build a structure and its detail levels from atom positions. Atoms are
    /// recentered on their centroid.
    pub fn from_atoms(id: String, mut atoms: Vec<Vec3>) -> Self {
        if !atoms.is_empty() {
            let centroid = atoms.iter().copied().sum::<Vec3>() / atoms.len() as f32;
            for a in &mut atoms {
                *a -= centroid;
            }
        }
        let arrays: Vec<[f32; 3]> = atoms.iter().map(|a| a.to_array()).collect();
        let bounds = BoundingBox::from_points(arrays.iter());

        let mut levels = Vec::with_capacity(LOD_DIVISORS.len() + 1);
        for divisor in LOD_DIVISORS {
            let k = (atoms.len() / divisor).max(1);
            levels.push(kmeans(&atoms, k, KMEANS_ITERATIONS));
        }
        levels.insert(0, atoms);
        log::debug!(
            "Structure '{}' detail levels: {:?}",
            id,
            levels.iter().map(Vec::len).collect::<Vec<_>>()
        );

        Self { id, levels, bounds }
    }

    /// Every atom.
    pub fn atoms(&self) -> &[Vec3] {
        &self.levels[0]
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Positions at detail level `lod`, clamped to the coarsest level.
    pub fn level(&self, lod: usize) -> &[Vec3] {
        &self.levels[self.clamp_level(lod)]
    }

    /// Sphere scale for level `lod` that keeps the total volume of the full structure.
    pub fn level_radius_scale(&self, lod: usize) -> f32 {
        let full = self.atoms().len().max(1) as f32;
        let count = self.level(lod).len().max(1) as f32;
        (full / count).cbrt()
    }

    fn clamp_level(&self, lod: usize) -> usize {
        lod.min(self.levels.len() - 1)
    }
}

/// Lloyd's k-means with centers seeded at evenly strided points, so the
/// result is deterministic. An empty cluster keeps its previous center.
fn kmeans(points: &[Vec3], k: usize, iterations: usize) -> Vec<Vec3> {
    if points.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, points.len());
    let mut centers: Vec<Vec3> = (0..k).map(|i| points[i * points.len() / k]).collect();
    let mut assignment = vec![usize::MAX; points.len()];

    for _ in 0..iterations {
        let mut moved = false;
        for (p, slot) in points.iter().zip(assignment.iter_mut()) {
            let nearest = centers
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.distance_squared(*p).total_cmp(&b.distance_squared(*p)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            if *slot != nearest {
                *slot = nearest;
                moved = true;
            }
        }
        if !moved {
            break;
        }

        let mut sums = vec![Vec3::ZERO; k];
        let mut counts = vec![0usize; k];
        for (p, &c) in points.iter().zip(&assignment) {
            sums[c] += *p;
            counts[c] += 1;
        }
        for ((center, sum), count) in centers.iter_mut().zip(sums).zip(counts) {
            if count > 0 {
                *center = sum / count as f32;
            }
        }
    }

    centers
}

/// Resolved geometry for an asset name.
#[derive(Debug, Clone)]
pub enum AgentGeometry {
    Mesh(Arc<MeshAsset>),
    Atoms(Arc<AtomicStructure>),
}

impl AgentGeometry {
    pub fn name(&self) -> &str {
        match self {
            AgentGeometry::Mesh(m) => &m.id,
            AgentGeometry::Atoms(a) => &a.id,
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        match self {
            AgentGeometry::Mesh(m) => m.bounds,
            AgentGeometry::Atoms(a) => a.bounds,
        }
    }

    pub fn as_mesh(&self) -> Option<&Arc<MeshAsset>> {
        match self {
            AgentGeometry::Mesh(m) => Some(m),
            AgentGeometry::Atoms(_) => None,
        }
    }

    pub fn as_atoms(&self) -> Option<&Arc<AtomicStructure>> {
        match self {
            AgentGeometry::Atoms(a) => Some(a),
            AgentGeometry::Mesh(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bounding_box_from_points() {
        let pts = [[-1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 2.0, 0.0]];
        let bounds = BoundingBox::from_points(pts.iter());
        assert_eq!(bounds.min, [-1.0, 0.0, 0.0]);
        assert_eq!(bounds.max, [1.0, 2.0, 0.0]);
        assert_eq!(bounds.center(), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_obj_parsing() {
        let obj_content = r#"
            v 0 0 0
            v 1 0 0
            v 0 1 0
            f 1 2 3
        "#;

        let asset = MeshAsset::from_obj("test".to_string(), obj_content).unwrap();
        assert_eq!(asset.vertices.len(), 3);
        assert_eq!(asset.indices.len(), 3);
        assert_eq!(asset.triangle_count(), 1);
        // Counter-clockwise in XY, so generated normals face +Z
        assert_eq!(asset.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_obj_without_vertices_fails() {
        let err = MeshAsset::from_obj("empty".to_string(), "# nothing here").unwrap_err();
        assert!(matches!(err, AssetError::Parse { .. }));
    }

    #[test]
    fn test_pdb_parsing_recenters() {
        let pdb = "\
HEADER    TEST
ATOM      1  N   ALA A   1       1.000   0.000   0.000  1.00  0.00           N
ATOM      2  CA  ALA A   1       3.000   0.000   0.000  1.00  0.00           C
HETATM    3  O   HOH A   2       2.000   3.000   0.000  1.00  0.00           O
END
";
        let s = AtomicStructure::from_pdb("t.pdb".to_string(), pdb).unwrap();
        assert_eq!(s.atoms().len(), 3);
        assert_eq!(s.atoms()[0], Vec3::new(-1.0, -1.0, 0.0));
        assert_eq!(s.atoms()[2], Vec3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_structure_detail_levels_shrink() {
        let atoms: Vec<Vec3> = (0..1024)
            .map(|i| Vec3::new((i % 16) as f32, ((i / 16) % 8) as f32, (i / 128) as f32))
            .collect();
        let s = AtomicStructure::from_atoms("grid".to_string(), atoms);

        assert_eq!(s.level_count(), 4);
        assert_eq!(s.level(0).len(), 1024);
        assert_eq!(s.level(1).len(), 128);
        assert_eq!(s.level(2).len(), 32);
        assert_eq!(s.level(3).len(), 8);
        // Past the coarsest level clamps
        assert_eq!(s.level(9).len(), 8);
        assert_relative_eq!(s.level_radius_scale(0), 1.0);
        assert_relative_eq!(s.level_radius_scale(3), 128f32.cbrt(), epsilon = 1e-4);

        // Cluster centers stay inside the structure
        let half = Vec3::from(s.bounds.size()) / 2.0 + Vec3::splat(1e-3);
        for c in s.level(3) {
            assert!(c.abs().cmple(half).all(), "{:?} outside {:?}", c, half);
        }
    }

    #[test]
    fn test_tiny_structure_keeps_one_center() {
        let s = AtomicStructure::from_atoms(
            "pair".to_string(),
            vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)],
        );
        assert_eq!(s.level(1), &[Vec3::ZERO]);
        assert_eq!(s.level(3), &[Vec3::ZERO]);
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        let mut points = vec![Vec3::new(-10.0, 0.0, 0.0); 5];
        points.extend(vec![Vec3::new(10.0, 0.0, 0.0); 5]);
        let mut centers = kmeans(&points, 2, 10);
        centers.sort_by(|a, b| a.x.total_cmp(&b.x));
        assert_eq!(centers, vec![Vec3::new(-10.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_pdb_bad_coordinates() {
        let pdb = "ATOM      1  N   ALA A   1       abc     0.000   0.000";
        assert!(AtomicStructure::from_pdb("bad".to_string(), pdb).is_err());
    }
}
