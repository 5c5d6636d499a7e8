// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Preview rendering for mesh files (STL, OBJ) that carry no embedded
// thumbnail. Parses the geometry, projects it orthographically with a depth
// buffer, and encodes a PNG — or a rotating GIF for the animated preview.
//
// CPU-bound; callers run this under `spawn_blocking`.

use image::codecs::gif::GifEncoder;
use image::{Delay, Frame, ImageFormat, Rgba, RgbaImage};
use tracing::{debug, info, instrument};

use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::FileKind;

/// Camera tilt applied before projection, radians. Gives the familiar
/// three-quarter view instead of a straight top-down silhouette.
const CAMERA_TILT: f32 = -1.1;
/// Fraction of the canvas left as margin around the model.
const MARGIN: f32 = 0.08;
const GIF_FRAMES: u32 = 12;
const GIF_FRAME_DELAY_MS: u32 = 120;

const BACKGROUND: Rgba<u8> = Rgba([245, 245, 245, 255]);
const MODEL_BASE: [f32; 3] = [66.0, 133.0, 190.0];

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PreviewRenderer;

impl PreviewRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render a static PNG preview of a mesh file.
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn render_preview(
        &self,
        path: impl AsRef<std::path::Path>,
        kind: FileKind,
        size: u32,
    ) -> Result<Vec<u8>> {
        let mesh = load_mesh(path.as_ref(), kind)?;
        let frame = render_frame(&mesh, size, 0.6);
        let mut buffer = Vec::new();
        frame
            .write_to(&mut std::io::Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| PrinternizerError::ProcessingFailed(format!("PNG encode: {e}")))?;
        info!(triangles = mesh.triangles.len(), "rendered mesh preview");
        Ok(buffer)
    }

    /// Render a rotating GIF preview of a mesh file.
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn render_animated_preview(
        &self,
        path: impl AsRef<std::path::Path>,
        kind: FileKind,
        size: u32,
    ) -> Result<Vec<u8>> {
        let mesh = load_mesh(path.as_ref(), kind)?;
        let mut buffer = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buffer);
            encoder
                .set_repeat(image::codecs::gif::Repeat::Infinite)
                .map_err(|e| PrinternizerError::ProcessingFailed(format!("GIF setup: {e}")))?;
            for step in 0..GIF_FRAMES {
                let angle = step as f32 * std::f32::consts::TAU / GIF_FRAMES as f32;
                let image = render_frame(&mesh, size, angle);
                let frame = Frame::from_parts(
                    image,
                    0,
                    0,
                    Delay::from_numer_denom_ms(GIF_FRAME_DELAY_MS, 1),
                );
                encoder
                    .encode_frame(frame)
                    .map_err(|e| PrinternizerError::ProcessingFailed(format!("GIF frame: {e}")))?;
            }
        }
        info!(frames = GIF_FRAMES, "rendered animated mesh preview");
        Ok(buffer)
    }
}

fn load_mesh(path: &std::path::Path, kind: FileKind) -> Result<Mesh> {
    let bytes = std::fs::read(path)?;
    let mesh = match kind {
        FileKind::Stl => parse_stl(&bytes)?,
        FileKind::Obj => parse_obj(&String::from_utf8_lossy(&bytes))?,
        other => {
            return Err(PrinternizerError::ProcessingFailed(format!(
                "no preview renderer for {} files",
                other.as_str()
            )))
        }
    };
    if mesh.is_empty() {
        return Err(PrinternizerError::ProcessingFailed(
            "mesh contains no triangles".into(),
        ));
    }
    Ok(mesh)
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// STL comes in two flavors. ASCII files start with `solid` and contain
/// `facet` records; anything else is treated as the 50-byte-per-triangle
/// binary layout. (Some binary exporters also write `solid` into the header,
/// hence the `facet` check.)
pub fn parse_stl(bytes: &[u8]) -> Result<Mesh> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
    if head.trim_start().starts_with("solid") && head.contains("facet") {
        parse_ascii_stl(&String::from_utf8_lossy(bytes))
    } else {
        parse_binary_stl(bytes)
    }
}

fn parse_binary_stl(bytes: &[u8]) -> Result<Mesh> {
    if bytes.len() < 84 {
        return Err(PrinternizerError::ProcessingFailed(
            "binary STL shorter than its header".into(),
        ));
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = 84 + count * 50;
    if bytes.len() < expected {
        return Err(PrinternizerError::ProcessingFailed(format!(
            "binary STL truncated: {count} triangles need {expected} bytes, got {}",
            bytes.len()
        )));
    }

    let mut mesh = Mesh::default();
    mesh.vertices.reserve(count * 3);
    mesh.triangles.reserve(count);

    for i in 0..count {
        // 12 bytes of normal (recomputed at render time), then 3 vertices.
        let base = 84 + i * 50 + 12;
        let mut indices = [0u32; 3];
        for (v, index) in indices.iter_mut().enumerate() {
            let offset = base + v * 12;
            let read = |o: usize| {
                f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
            };
            *index = mesh.vertices.len() as u32;
            mesh.vertices
                .push([read(offset), read(offset + 4), read(offset + 8)]);
        }
        mesh.triangles.push(indices);
    }
    debug!(triangles = mesh.triangles.len(), "parsed binary STL");
    Ok(mesh)
}

fn parse_ascii_stl(text: &str) -> Result<Mesh> {
    let mut mesh = Mesh::default();
    let mut pending: Vec<u32> = Vec::with_capacity(3);

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("vertex") {
            let mut coords = rest.split_whitespace().filter_map(|t| t.parse::<f32>().ok());
            let (Some(x), Some(y), Some(z)) = (coords.next(), coords.next(), coords.next())
            else {
                return Err(PrinternizerError::ProcessingFailed(format!(
                    "unparseable STL vertex line: {line}"
                )));
            };
            pending.push(mesh.vertices.len() as u32);
            mesh.vertices.push([x, y, z]);
            if pending.len() == 3 {
                mesh.triangles.push([pending[0], pending[1], pending[2]]);
                pending.clear();
            }
        }
    }
    debug!(triangles = mesh.triangles.len(), "parsed ASCII STL");
    Ok(mesh)
}

/// Wavefront OBJ: `v x y z` vertices and `f a b c …` faces (1-based, fan-
/// triangulated; `a/b/c` index tuples keep only the vertex index).
pub fn parse_obj(text: &str) -> Result<Mesh> {
    let mut mesh = Mesh::default();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("v ") {
            let mut coords = rest.split_whitespace().filter_map(|t| t.parse::<f32>().ok());
            if let (Some(x), Some(y), Some(z)) = (coords.next(), coords.next(), coords.next()) {
                mesh.vertices.push([x, y, z]);
            }
        } else if let Some(rest) = line.strip_prefix("f ") {
            let indices: Vec<u32> = rest
                .split_whitespace()
                .filter_map(|token| {
                    let vertex_part = token.split('/').next()?;
                    let index: i64 = vertex_part.parse().ok()?;
                    let resolved = if index < 0 {
                        mesh.vertices.len() as i64 + index
                    } else {
                        index - 1
                    };
                    (resolved >= 0 && (resolved as usize) < mesh.vertices.len())
                        .then_some(resolved as u32)
                })
                .collect();
            for i in 1..indices.len().saturating_sub(1) {
                mesh.triangles.push([indices[0], indices[i], indices[i + 1]]);
            }
        }
    }
    debug!(
        vertices = mesh.vertices.len(),
        triangles = mesh.triangles.len(),
        "parsed OBJ"
    );
    Ok(mesh)
}

// ---------------------------------------------------------------------------
// Rasterization
// ---------------------------------------------------------------------------

/// Render one frame: rotate the mesh around Z by `angle`, tilt it toward the
/// camera, scale to fit, and rasterize with a depth buffer and per-triangle
/// lambertian shading.
fn render_frame(mesh: &Mesh, size: u32, angle: f32) -> RgbaImage {
    let (sin_a, cos_a) = angle.sin_cos();
    let (sin_t, cos_t) = CAMERA_TILT.sin_cos();

    // Rotate about the model centroid so spinning does not wobble.
    let centroid = {
        let n = mesh.vertices.len().max(1) as f32;
        let mut c = [0.0f32; 3];
        for v in &mesh.vertices {
            c[0] += v[0];
            c[1] += v[1];
            c[2] += v[2];
        }
        [c[0] / n, c[1] / n, c[2] / n]
    };

    let transformed: Vec<[f32; 3]> = mesh
        .vertices
        .iter()
        .map(|v| {
            let x = v[0] - centroid[0];
            let y = v[1] - centroid[1];
            let z = v[2] - centroid[2];
            // Z-rotation, then X-tilt.
            let (rx, ry) = (x * cos_a - y * sin_a, x * sin_a + y * cos_a);
            let (ty, tz) = (ry * cos_t - z * sin_t, ry * sin_t + z * cos_t);
            [rx, ty, tz]
        })
        .collect();

    // Fit the projected bounds into the canvas.
    let mut min = [f32::MAX; 2];
    let mut max = [f32::MIN; 2];
    for p in &transformed {
        min[0] = min[0].min(p[0]);
        min[1] = min[1].min(p[1]);
        max[0] = max[0].max(p[0]);
        max[1] = max[1].max(p[1]);
    }
    let span = (max[0] - min[0]).max(max[1] - min[1]).max(f32::EPSILON);
    let usable = size as f32 * (1.0 - 2.0 * MARGIN);
    let scale = usable / span;
    let offset_x = (size as f32 - (max[0] - min[0]) * scale) / 2.0 - min[0] * scale;
    let offset_y = (size as f32 - (max[1] - min[1]) * scale) / 2.0 - min[1] * scale;

    let project = |p: &[f32; 3]| -> (f32, f32, f32) {
        (
            p[0] * scale + offset_x,
            // Flip Y so models stand upright on screen.
            size as f32 - (p[1] * scale + offset_y),
            p[2],
        )
    };

    let mut canvas = RgbaImage::from_pixel(size, size, BACKGROUND);
    let mut depth = vec![f32::MIN; (size * size) as usize];

    for triangle in &mesh.triangles {
        let a = project(&transformed[triangle[0] as usize]);
        let b = project(&transformed[triangle[1] as usize]);
        let c = project(&transformed[triangle[2] as usize]);

        // Screen-space normal z for shading; the light sits at the camera.
        let ab = (b.0 - a.0, b.1 - a.1, b.2 - a.2);
        let ac = (c.0 - a.0, c.1 - a.1, c.2 - a.2);
        let normal = (
            ab.1 * ac.2 - ab.2 * ac.1,
            ab.2 * ac.0 - ab.0 * ac.2,
            ab.0 * ac.1 - ab.1 * ac.0,
        );
        let len =
            (normal.0 * normal.0 + normal.1 * normal.1 + normal.2 * normal.2).sqrt();
        if len <= f32::EPSILON {
            continue;
        }
        let shade = 0.25 + 0.75 * (normal.2 / len).abs();
        let pixel = Rgba([
            (MODEL_BASE[0] * shade) as u8,
            (MODEL_BASE[1] * shade) as u8,
            (MODEL_BASE[2] * shade) as u8,
            255,
        ]);

        fill_triangle(&mut canvas, &mut depth, size, a, b, c, pixel);
    }

    canvas
}

#[allow(clippy::too_many_arguments)]
fn fill_triangle(
    canvas: &mut RgbaImage,
    depth: &mut [f32],
    size: u32,
    a: (f32, f32, f32),
    b: (f32, f32, f32),
    c: (f32, f32, f32),
    pixel: Rgba<u8>,
) {
    let min_x = a.0.min(b.0).min(c.0).floor().max(0.0) as u32;
    let max_x = (a.0.max(b.0).max(c.0).ceil() as u32).min(size.saturating_sub(1));
    let min_y = a.1.min(b.1).min(c.1).floor().max(0.0) as u32;
    let max_y = (a.1.max(b.1).max(c.1).ceil() as u32).min(size.saturating_sub(1));

    let area = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
    if area.abs() <= f32::EPSILON {
        return;
    }

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let w0 = ((b.0 - a.0) * (py - a.1) - (b.1 - a.1) * (px - a.0)) / area;
            let w1 = ((c.0 - b.0) * (py - b.1) - (c.1 - b.1) * (px - b.0)) / area;
            let w2 = ((a.0 - c.0) * (py - c.1) - (a.1 - c.1) * (px - c.0)) / area;
            let inside = (w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0)
                || (w0 <= 0.0 && w1 <= 0.0 && w2 <= 0.0);
            if !inside {
                continue;
            }
            // Barycentric weights are w1 (vs a), w2 (vs b), w0 (vs c).
            let z = a.2 * w1.abs() + b.2 * w2.abs() + c.2 * w0.abs();
            let index = (y * size + x) as usize;
            if z > depth[index] {
                depth[index] = z;
                canvas.put_pixel(x, y, pixel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A unit tetrahedron, enough geometry for any render path.
    fn tetrahedron() -> Mesh {
        Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.5, 1.0, 0.0],
                [0.5, 0.5, 1.0],
            ],
            triangles: vec![[0, 1, 2], [0, 1, 3], [1, 2, 3], [0, 2, 3]],
        }
    }

    fn ascii_stl() -> String {
        let mesh = tetrahedron();
        let mut out = String::from("solid test\n");
        for t in &mesh.triangles {
            out.push_str("facet normal 0 0 0\nouter loop\n");
            for &i in t {
                let v = mesh.vertices[i as usize];
                out.push_str(&format!("vertex {} {} {}\n", v[0], v[1], v[2]));
            }
            out.push_str("endloop\nendfacet\n");
        }
        out.push_str("endsolid test\n");
        out
    }

    fn binary_stl() -> Vec<u8> {
        let mesh = tetrahedron();
        let mut out = vec![0u8; 80];
        out.extend((mesh.triangles.len() as u32).to_le_bytes());
        for t in &mesh.triangles {
            out.extend([0u8; 12]); // normal
            for &i in t {
                for coord in mesh.vertices[i as usize] {
                    out.extend(coord.to_le_bytes());
                }
            }
            out.extend([0u8; 2]); // attribute byte count
        }
        out
    }

    #[test]
    fn ascii_stl_parses() {
        let mesh = parse_stl(ascii_stl().as_bytes()).expect("parse");
        assert_eq!(mesh.triangles.len(), 4);
        assert_eq!(mesh.vertices.len(), 12);
    }

    #[test]
    fn binary_stl_parses() {
        let mesh = parse_stl(&binary_stl()).expect("parse");
        assert_eq!(mesh.triangles.len(), 4);
    }

    #[test]
    fn truncated_binary_stl_errors() {
        let mut bytes = binary_stl();
        bytes.truncate(100);
        assert!(parse_stl(&bytes).is_err());
    }

    #[test]
    fn obj_parses_with_index_tuples_and_fans() {
        let obj = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1/1/1 2/2/2 3/3/3 4/4/4\n";
        let mesh = parse_obj(obj).expect("parse");
        assert_eq!(mesh.vertices.len(), 4);
        // Quad fan-triangulates into two triangles.
        assert_eq!(mesh.triangles.len(), 2);
    }

    #[test]
    fn obj_negative_indices_resolve_from_end() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n";
        let mesh = parse_obj(obj).expect("parse");
        assert_eq!(mesh.triangles, vec![[0, 1, 2]]);
    }

    #[test]
    fn render_produces_decodable_png_of_requested_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tetra.stl");
        std::fs::write(&path, binary_stl()).expect("write");

        let renderer = PreviewRenderer::new();
        let png = renderer
            .render_preview(&path, FileKind::Stl, 200)
            .expect("render");
        let decoded = image::load_from_memory(&png).expect("decode");
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 200);
    }

    #[test]
    fn rendered_model_differs_from_background() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tetra.stl");
        std::fs::write(&path, binary_stl()).expect("write");

        let png = PreviewRenderer::new()
            .render_preview(&path, FileKind::Stl, 64)
            .expect("render");
        let decoded = image::load_from_memory(&png).expect("decode").to_rgba8();
        let non_background = decoded
            .pixels()
            .filter(|p| p.0 != BACKGROUND.0)
            .count();
        assert!(non_background > 100, "model should cover pixels, got {non_background}");
    }

    #[test]
    fn animated_preview_is_a_gif() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tetra.stl");
        std::fs::write(&path, binary_stl()).expect("write");

        let gif = PreviewRenderer::new()
            .render_animated_preview(&path, FileKind::Stl, 48)
            .expect("render");
        assert_eq!(&gif[..6], b"GIF89a");
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, b"G28\n").expect("write");
        let err = PreviewRenderer::new().render_preview(&path, FileKind::Gcode, 200);
        assert!(err.is_err());
    }
}
