use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use modelgen_mesh::{ExportFormat, Mesh, parse_stl};

/// Geometry summary of a mesh, printed by `modelgen inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshReport {
    pub triangles: usize,
    pub vertices: usize,
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub volume: f64,
    pub surface_area: f64,
}

impl MeshReport {
    pub fn of(mesh: &Mesh) -> Self {
        let (min, max) = match mesh.bounding_box() {
            Some(bounds) => (bounds.min, bounds.max),
            None => ([0.0; 3], [0.0; 3]),
        };
        Self {
            triangles: mesh.triangles.len(),
            vertices: mesh.vertices.len(),
            min,
            max,
            volume: mesh.volume().abs(),
            surface_area: mesh.surface_area(),
        }
    }
}

impl fmt::Display for MeshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ];
        writeln!(f, "triangles: {}", self.triangles)?;
        writeln!(f, "vertices: {}", self.vertices)?;
        writeln!(
            f,
            "bounds: [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}]",
            self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]
        )?;
        writeln!(f, "size: {:.3} x {:.3} x {:.3}", size[0], size[1], size[2])?;
        writeln!(f, "volume: {:.3}", self.volume)?;
        write!(f, "surface area: {:.3}", self.surface_area)
    }
}

pub fn read_mesh(path: &Path) -> Result<Mesh> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_stl(&bytes).with_context(|| format!("{} is not a readable STL file", path.display()))
}

/// Re-encodes `mesh` in the format implied by `output`'s extension.
pub fn export(mesh: &Mesh, output: &Path, ascii: bool) -> Result<()> {
    let extension = output
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let format = match ExportFormat::from_extension(extension)? {
        ExportFormat::Stl if ascii => ExportFormat::AsciiStl,
        format => format,
    };
    let name = output
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("model");
    let bytes = format.encode(mesh, name)?;
    std::fs::write(output, bytes).with_context(|| format!("failed to write {}", output.display()))
}
