use std::io::Cursor;

use crate::{Mesh, MeshError};

/// Parses binary or ASCII STL into an indexed mesh with shared vertices.
pub fn parse_stl(bytes: &[u8]) -> Result<Mesh, MeshError> {
    if bytes.is_empty() {
        return Err(MeshError::Empty);
    }

    let mut cursor = Cursor::new(bytes);
    let indexed = stl_io::read_stl(&mut cursor)?;

    let vertices = indexed
        .vertices
        .iter()
        .map(|vertex| {
            let [x, y, z] = vertex.0;
            [f64::from(x), f64::from(y), f64::from(z)]
        })
        .collect::<Vec<_>>();
    let triangles = indexed
        .faces
        .iter()
        .map(|face| {
            [
                face.vertices[0] as u32,
                face.vertices[1] as u32,
                face.vertices[2] as u32,
            ]
        })
        .collect::<Vec<_>>();

    let mesh = Mesh {
        vertices,
        triangles,
    };
    mesh.check_indices()?;
    if mesh.is_empty() {
        return Err(MeshError::Empty);
    }
    Ok(mesh)
}
