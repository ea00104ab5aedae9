use std::fmt::Write as _;

use stl_io::{Normal, Triangle, Vertex};

use crate::{Mesh, MeshError, cross, dot, sub};

/// Download formats the model service can hand out for a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Stl,
    AsciiStl,
    Obj,
}

impl ExportFormat {
    pub fn from_extension(ext: &str) -> Result<Self, MeshError> {
        match ext.to_ascii_lowercase().as_str() {
            "stl" => Ok(Self::Stl),
            "ascii-stl" => Ok(Self::AsciiStl),
            "obj" => Ok(Self::Obj),
            other => Err(MeshError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Stl | Self::AsciiStl => "stl",
            Self::Obj => "obj",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Stl | Self::AsciiStl => "model/stl",
            Self::Obj => "model/obj",
        }
    }

    pub fn encode(self, mesh: &Mesh, name: &str) -> Result<Vec<u8>, MeshError> {
        match self {
            Self::Stl => to_binary_stl(mesh, name),
            Self::AsciiStl => Ok(to_ascii_stl(mesh, name).into_bytes()),
            Self::Obj => Ok(to_obj(mesh).into_bytes()),
        }
    }
}

fn unit_normal(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> [f64; 3] {
    let n = cross(sub(b, a), sub(c, a));
    let len = dot(n, n).sqrt();
    if len <= f64::EPSILON {
        [0.0, 0.0, 0.0]
    } else {
        [n[0] / len, n[1] / len, n[2] / len]
    }
}

fn to_f32(v: [f64; 3]) -> [f32; 3] {
    [v[0] as f32, v[1] as f32, v[2] as f32]
}

/// Binary STL. The header carries `name`, truncated to 80 bytes.
pub fn to_binary_stl(mesh: &Mesh, name: &str) -> Result<Vec<u8>, MeshError> {
    mesh.check_indices()?;

    let triangles = mesh
        .corners()
        .map(|[a, b, c]| Triangle {
            normal: Normal::new(to_f32(unit_normal(a, b, c))),
            vertices: [
                Vertex::new(to_f32(a)),
                Vertex::new(to_f32(b)),
                Vertex::new(to_f32(c)),
            ],
        })
        .collect::<Vec<_>>();

    let mut body = Vec::with_capacity(84 + triangles.len() * 50);
    stl_io::write_stl(&mut body, triangles.iter())?;

    let header_len = name.len().min(80);
    body[..header_len].copy_from_slice(&name.as_bytes()[..header_len]);
    Ok(body)
}

pub fn to_ascii_stl(mesh: &Mesh, name: &str) -> String {
    let mut out = format!("solid {name}\n");
    for [a, b, c] in mesh.corners() {
        let n = unit_normal(a, b, c);
        let _ = writeln!(out, "  facet normal {} {} {}", n[0], n[1], n[2]);
        out.push_str("    outer loop\n");
        for v in [a, b, c] {
            let _ = writeln!(out, "      vertex {} {} {}", v[0], v[1], v[2]);
        }
        out.push_str("    endloop\n");
        out.push_str("  endfacet\n");
    }
    let _ = writeln!(out, "endsolid {name}");
    out
}

pub fn to_obj(mesh: &Mesh) -> String {
    let mut out = String::new();
    for v in &mesh.vertices {
        let _ = writeln!(out, "v {} {} {}", v[0], v[1], v[2]);
    }
    for tri in &mesh.triangles {
        let _ = writeln!(out, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1);
    }
    out
}
