pub mod export;
pub mod fit;
pub mod stl;

use thiserror::Error;

pub use export::ExportFormat;
pub use fit::{FitTransform, VIEWPORT_SIZE};
pub use stl::parse_stl;

/// Indexed triangle mesh as delivered by the CAD toolchain.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh data is empty")]
    Empty,
    #[error("failed to read STL: {0}")]
    Stl(#[from] std::io::Error),
    #[error("triangle {triangle} references vertex {index}, mesh has {count} vertices")]
    DanglingIndex {
        triangle: usize,
        index: usize,
        count: usize,
    },
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn size(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    pub fn max_dimension(&self) -> f64 {
        let size = self.size();
        size[0].max(size[1]).max(size[2])
    }
}

impl Mesh {
    pub fn empty() -> Self {
        Self {
            vertices: Vec::new(),
            triangles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Bounds over the vertices referenced by at least one triangle.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut referenced = self
            .triangles
            .iter()
            .flat_map(|tri| tri.iter())
            .filter_map(|&index| self.vertices.get(index as usize));

        let first = *referenced.next()?;
        let mut bounds = BoundingBox {
            min: first,
            max: first,
        };
        for vertex in referenced {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(vertex[axis]);
                bounds.max[axis] = bounds.max[axis].max(vertex[axis]);
            }
        }
        Some(bounds)
    }

    /// Signed-tetrahedron volume; positive for outward-facing windings.
    pub fn volume(&self) -> f64 {
        self.corners()
            .map(|[a, b, c]| dot(a, cross(b, c)) / 6.0)
            .sum()
    }

    pub fn surface_area(&self) -> f64 {
        self.corners()
            .map(|[a, b, c]| {
                let n = cross(sub(b, a), sub(c, a));
                dot(n, n).sqrt() * 0.5
            })
            .sum()
    }

    pub(crate) fn corners(&self) -> impl Iterator<Item = [[f64; 3]; 3]> + '_ {
        self.triangles.iter().map(|tri| {
            [
                self.vertices[tri[0] as usize],
                self.vertices[tri[1] as usize],
                self.vertices[tri[2] as usize],
            ]
        })
    }

    pub(crate) fn check_indices(&self) -> Result<(), MeshError> {
        let count = self.vertices.len();
        for (triangle, tri) in self.triangles.iter().enumerate() {
            if let Some(&index) = tri.iter().find(|&&index| index as usize >= count) {
                return Err(MeshError::DanglingIndex {
                    triangle,
                    index: index as usize,
                    count,
                });
            }
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
pub(crate) fn unit_cube() -> Mesh {
    Mesh {
        vertices: vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ],
        triangles: vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [2, 3, 7],
            [2, 7, 6],
            [1, 2, 6],
            [1, 6, 5],
            [0, 4, 7],
            [0, 7, 3],
        ],
    }
}
