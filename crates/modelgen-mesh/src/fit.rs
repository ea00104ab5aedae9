use crate::{BoundingBox, Mesh};

/// Edge length of the cube the viewer frames a mesh into.
pub const VIEWPORT_SIZE: f64 = 5.0;

/// Translation applied first, then the uniform scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitTransform {
    pub offset: [f64; 3],
    pub scale: f64,
}

impl FitTransform {
    pub fn identity() -> Self {
        Self {
            offset: [0.0, 0.0, 0.0],
            scale: 1.0,
        }
    }

    pub fn for_bounds(bounds: &BoundingBox, target_size: f64) -> Self {
        let center = bounds.center();
        let largest = bounds.max_dimension();
        let scale = if largest > f64::EPSILON {
            target_size / largest
        } else {
            1.0
        };
        Self {
            offset: [-center[0], -center[1], -center[2]],
            scale,
        }
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        [
            (point[0] + self.offset[0]) * self.scale,
            (point[1] + self.offset[1]) * self.scale,
            (point[2] + self.offset[2]) * self.scale,
        ]
    }
}

impl Mesh {
    /// Centers the mesh on the origin and scales it so the largest bounding
    /// dimension equals `target_size`. Zero-extent meshes are only centered.
    pub fn fit_to_viewport(&self, target_size: f64) -> (Mesh, FitTransform) {
        let transform = match self.bounding_box() {
            Some(bounds) => FitTransform::for_bounds(&bounds, target_size),
            None => FitTransform::identity(),
        };
        let vertices = self
            .vertices
            .iter()
            .map(|&vertex| transform.apply(vertex))
            .collect();
        (
            Mesh {
                vertices,
                triangles: self.triangles.clone(),
            },
            transform,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::{Mesh, unit_cube};

    use super::{FitTransform, VIEWPORT_SIZE};

    fn assert_close(actual: [f64; 3], expected: [f64; 3]) {
        for axis in 0..3 {
            assert!(
                (actual[axis] - expected[axis]).abs() < 1e-9,
                "axis {axis}: {actual:?} != {expected:?}"
            );
        }
    }

    #[test]
    fn fitted_mesh_is_centered_and_scaled() {
        let mut mesh = unit_cube();
        for vertex in &mut mesh.vertices {
            vertex[0] = vertex[0] * 40.0 + 100.0;
            vertex[1] = vertex[1] * 10.0 - 3.0;
            vertex[2] *= 20.0;
        }

        let (fitted, transform) = mesh.fit_to_viewport(VIEWPORT_SIZE);
        let bounds = fitted.bounding_box().expect("fitted mesh should have bounds");

        assert_close(bounds.center(), [0.0, 0.0, 0.0]);
        assert!((bounds.max_dimension() - VIEWPORT_SIZE).abs() < 1e-9);
        assert_close(bounds.size(), [5.0, 1.25, 2.5]);
        assert!((transform.scale - 0.125).abs() < 1e-12);
    }

    #[test]
    fn flat_mesh_is_only_translated() {
        let mesh = Mesh {
            vertices: vec![[2.0, 2.0, 2.0]; 3],
            triangles: vec![[0, 1, 2]],
        };
        let (fitted, transform) = mesh.fit_to_viewport(VIEWPORT_SIZE);
        assert_eq!(transform.scale, 1.0);
        assert_close(fitted.vertices[0], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn empty_mesh_uses_identity() {
        let (fitted, transform) = Mesh::empty().fit_to_viewport(VIEWPORT_SIZE);
        assert!(fitted.is_empty());
        assert_eq!(transform, FitTransform::identity());
    }
}
