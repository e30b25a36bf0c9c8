//! Mesh data structures and functionality

use crate::bounds::BoundingBox;
use crate::error::{Error, Result};
use crate::point::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A triangle mesh with optional per-vertex attributes.
///
/// Faces wind counter-clockwise when seen from the side their normal points
/// to. Attribute vectors, when present, have one entry per vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Point3d>,
    pub faces: Vec<[usize; 3]>,
    pub normals: Option<Vec<Vector3d>>,
    pub colors: Option<Vec<Color>>,
    /// Reconstruction confidence in `[0, 1]` (Poisson output only)
    pub densities: Option<Vec<f64>>,
}

/// Edge and boundary statistics of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshTopology {
    pub vertices: usize,
    pub edges: usize,
    pub faces: usize,
    /// Edges used by exactly one face
    pub boundary_edges: usize,
    /// Edges used by more than two faces
    pub non_manifold_edges: usize,
}

impl MeshTopology {
    /// V - E + F
    pub fn euler_characteristic(&self) -> i64 {
        self.vertices as i64 - self.edges as i64 + self.faces as i64
    }

    /// Closed two-manifold: every edge has exactly two faces
    pub fn is_watertight(&self) -> bool {
        self.faces > 0 && self.boundary_edges == 0 && self.non_manifold_edges == 0
    }
}

impl TriangleMesh {
    /// Create a new empty mesh
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            normals: None,
            colors: None,
            densities: None,
        }
    }

    /// Create a mesh from vertices and faces
    pub fn from_vertices_and_faces(vertices: Vec<Point3d>, faces: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            faces,
            ..Self::new()
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Add a vertex to the mesh
    pub fn add_vertex(&mut self, vertex: Point3d) -> usize {
        let index = self.vertices.len();
        self.vertices.push(vertex);
        index
    }

    /// Add a face to the mesh
    pub fn add_face(&mut self, face: [usize; 3]) {
        self.faces.push(face);
    }

    /// Area of one face
    pub fn triangle_area(&self, face: &[usize; 3]) -> f64 {
        let [a, b, c] = face.map(|i| self.vertices[i]);
        (b - a).cross(&(c - a)).norm() * 0.5
    }

    /// Sum of all face areas
    pub fn surface_area(&self) -> f64 {
        self.faces.iter().map(|f| self.triangle_area(f)).sum()
    }

    /// Unit face normals; degenerate faces get a zero vector
    pub fn calculate_face_normals(&self) -> Vec<Vector3d> {
        self.faces
            .iter()
            .map(|face| {
                let [v0, v1, v2] = face.map(|i| self.vertices[i]);
                (v1 - v0)
                    .cross(&(v2 - v0))
                    .try_normalize(f64::MIN_POSITIVE)
                    .unwrap_or_else(Vector3d::zeros)
            })
            .collect()
    }

    /// Area-weighted vertex normals, stored in `self.normals`.
    ///
    /// Vertices with no incident face of non-zero area keep a zero normal.
    pub fn compute_vertex_normals(&mut self) {
        let mut accum = vec![Vector3d::zeros(); self.vertices.len()];
        for face in &self.faces {
            let [v0, v1, v2] = face.map(|i| self.vertices[i]);
            // Cross product length is twice the area, which is the weight we want.
            let n = (v1 - v0).cross(&(v2 - v0));
            for &i in face {
                accum[i] += n;
            }
        }
        let normals = accum
            .into_iter()
            .map(|n| n.try_normalize(f64::MIN_POSITIVE).unwrap_or_else(Vector3d::zeros))
            .collect();
        self.normals = Some(normals);
    }

    /// Set vertex normals
    pub fn set_normals(&mut self, normals: Vec<Vector3d>) {
        if normals.len() == self.vertices.len() {
            self.normals = Some(normals);
        }
    }

    /// Set vertex colors
    pub fn set_colors(&mut self, colors: Vec<Color>) {
        if colors.len() == self.vertices.len() {
            self.colors = Some(colors);
        }
    }

    /// Set per-vertex densities
    pub fn set_densities(&mut self, densities: Vec<f64>) {
        if densities.len() == self.vertices.len() {
            self.densities = Some(densities);
        }
    }

    /// Axis-aligned bounds of all vertices
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.vertices.iter())
    }

    /// Check the vertex-index invariant and attribute lengths.
    ///
    /// Fails with `DegenerateGeometry` when a face references a missing
    /// vertex or repeats a vertex, or when an attribute vector has the wrong
    /// length.
    pub fn validate(&self) -> Result<()> {
        let n = self.vertices.len();
        for (fi, face) in self.faces.iter().enumerate() {
            if let Some(&bad) = face.iter().find(|&&i| i >= n) {
                return Err(Error::DegenerateGeometry(format!(
                    "face {fi} references vertex {bad} but the mesh has {n} vertices"
                )));
            }
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                return Err(Error::DegenerateGeometry(format!(
                    "face {fi} repeats a vertex: {face:?}"
                )));
            }
        }
        let lengths = [
            ("normals", self.normals.as_ref().map(Vec::len)),
            ("colors", self.colors.as_ref().map(Vec::len)),
            ("densities", self.densities.as_ref().map(Vec::len)),
        ];
        for (name, len) in lengths {
            if let Some(len) = len.filter(|&len| len != n) {
                return Err(Error::DegenerateGeometry(format!(
                    "{name} has {len} entries for {n} vertices"
                )));
            }
        }
        Ok(())
    }

    /// Per-vertex flag: referenced by at least one face
    pub fn referenced_vertices(&self) -> Vec<bool> {
        let mut referenced = vec![false; self.vertices.len()];
        for face in &self.faces {
            for &i in face {
                referenced[i] = true;
            }
        }
        referenced
    }

    /// Number of faces incident to each undirected edge, keyed `(min, max)`
    pub fn edge_face_counts(&self) -> BTreeMap<(usize, usize), usize> {
        let mut counts = BTreeMap::new();
        for face in &self.faces {
            for k in 0..3 {
                let (a, b) = (face[k], face[(k + 1) % 3]);
                *counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Edge and boundary statistics, counting only referenced vertices
    pub fn topology(&self) -> MeshTopology {
        let counts = self.edge_face_counts();
        MeshTopology {
            vertices: self.referenced_vertices().into_iter().filter(|&r| r).count(),
            edges: counts.len(),
            faces: self.faces.len(),
            boundary_edges: counts.values().filter(|&&c| c == 1).count(),
            non_manifold_edges: counts.values().filter(|&&c| c > 2).count(),
        }
    }

    /// Clear the mesh
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.faces.clear();
        self.normals = None;
        self.colors = None;
        self.densities = None;
    }
}

impl Default for TriangleMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tetrahedron() -> TriangleMesh {
        let vertices = vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
            Point3d::new(0.0, 0.0, 1.0),
        ];
        let faces = vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [0, 3, 2]];
        TriangleMesh::from_vertices_and_faces(vertices, faces)
    }

    #[test]
    fn test_tetrahedron_topology() {
        let topo = tetrahedron().topology();
        assert_eq!(topo.vertices, 4);
        assert_eq!(topo.edges, 6);
        assert_eq!(topo.faces, 4);
        assert_eq!(topo.euler_characteristic(), 2);
        assert!(topo.is_watertight());
    }

    #[test]
    fn test_open_mesh_has_boundary() {
        let mut mesh = tetrahedron();
        mesh.faces.pop();
        let topo = mesh.topology();
        assert_eq!(topo.boundary_edges, 3);
        assert!(!topo.is_watertight());
    }

    #[test]
    fn test_validate_catches_dangling_index() {
        let mut mesh = tetrahedron();
        assert!(mesh.validate().is_ok());
        mesh.add_face([0, 1, 7]);
        assert!(matches!(mesh.validate(), Err(Error::DegenerateGeometry(_))));
    }

    #[test]
    fn test_validate_catches_attribute_length() {
        let mut mesh = tetrahedron();
        mesh.colors = Some(vec![[0, 0, 0]; 3]);
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_areas() {
        let mesh = tetrahedron();
        assert_relative_eq!(mesh.triangle_area(&[0, 1, 2]), 0.5);
        assert_relative_eq!(mesh.surface_area(), 1.5 + 3.0_f64.sqrt() / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vertex_normals_point_outward() {
        let mut mesh = tetrahedron();
        mesh.compute_vertex_normals();
        let normals = mesh.normals.as_ref().unwrap();
        let centroid = Point3d::new(0.25, 0.25, 0.25);
        for (v, n) in mesh.vertices.iter().zip(normals) {
            assert!(n.dot(&(v - centroid)) > 0.0);
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_face_normal_of_degenerate_face_is_zero() {
        let mesh = TriangleMesh::from_vertices_and_faces(
            vec![Point3d::origin(), Point3d::new(1.0, 0.0, 0.0), Point3d::new(2.0, 0.0, 0.0)],
            vec![[0, 1, 2]],
        );
        assert_eq!(mesh.calculate_face_normals()[0], Vector3d::zeros());
    }
}
