//! Quad mesh buffers for tile grids
//!
//! A tile is drawn as a `grid_width` x `grid_height` grid of quads. Vertices
//! are stored row-major, `(grid_width + 1) * (grid_height + 1)` of them. A
//! single quad is drawn directly as a 4 vertex triangle strip; larger grids
//! use an index buffer that stitches rows together with degenerate triangles.

/// Texture coordinates, vertex positions and indices for one grid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshBuffers {
    pub grid_width: u32,
    pub grid_height: u32,
    pub tex_coords: Vec<[f32; 2]>,
    pub vertices: Vec<[f64; 3]>,
    pub indices: Option<Vec<u16>>,
}

impl MeshBuffers {
    /// Buffers for a grid covering `[0, extent]` of a texture
    pub fn new(grid_width: u32, grid_height: u32, extent: [f32; 2]) -> Self {
        let vertex_count = num_vertices(grid_width, grid_height);
        Self {
            grid_width,
            grid_height,
            tex_coords: quad_tex_coords([0.0, 0.0], extent, grid_width, grid_height),
            vertices: Vec::with_capacity(vertex_count),
            indices: (vertex_count > 4).then(|| strip_indices(grid_width, grid_height)),
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        num_vertices(self.grid_width, self.grid_height)
    }

    #[inline]
    pub fn index_count(&self) -> usize {
        self.indices.as_ref().map_or(0, Vec::len)
    }

    /// Approximate memory held by the buffers
    pub fn size_bytes(&self) -> usize {
        self.tex_coords.len() * std::mem::size_of::<[f32; 2]>()
            + self.vertices.len() * std::mem::size_of::<[f64; 3]>()
            + self.index_count() * std::mem::size_of::<u16>()
    }
}

#[inline]
pub fn num_vertices(grid_width: u32, grid_height: u32) -> usize {
    (grid_width as usize + 1) * (grid_height as usize + 1)
}

/// Index count of a triangle strip covering the grid
#[inline]
pub fn num_indices(grid_width: u32, grid_height: u32) -> usize {
    if grid_height == 0 {
        return 0;
    }
    let w = grid_width as usize + 1;
    let h = grid_height as usize;
    2 * w * h + 2 * (h - 1)
}

/// Row-major texture coordinates interpolated between `min` and `max`
pub fn quad_tex_coords(
    min: [f32; 2],
    max: [f32; 2],
    grid_width: u32,
    grid_height: u32,
) -> Vec<[f32; 2]> {
    let gw = grid_width.max(1);
    let gh = grid_height.max(1);
    let mut coords = Vec::with_capacity(num_vertices(gw, gh));
    for i in 0..=gh {
        let v = min[1] + (max[1] - min[1]) * (i as f32 / gh as f32);
        for j in 0..=gw {
            let u = min[0] + (max[0] - min[0]) * (j as f32 / gw as f32);
            coords.push([u, v]);
        }
    }
    coords
}

/// Triangle strip indices over a row-major vertex grid
pub fn strip_indices(grid_width: u32, grid_height: u32) -> Vec<u16> {
    let w = grid_width as u16 + 1;
    let mut indices = Vec::with_capacity(num_indices(grid_width, grid_height));
    for row in 0..grid_height as u16 {
        if row > 0 {
            // degenerate join from the end of the previous row
            indices.push(row * w + (w - 1));
            indices.push(row * w);
        }
        for col in 0..w {
            indices.push(row * w + col);
            indices.push((row + 1) * w + col);
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_quad_has_no_indices() {
        let mesh = MeshBuffers::new(1, 1, [1.0, 1.0]);
        assert_eq!(mesh.vertex_count(), 4);
        assert!(mesh.indices.is_none());
        assert_eq!(
            mesh.tex_coords,
            vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]
        );
    }

    #[test]
    fn test_grid_indices() {
        let mesh = MeshBuffers::new(2, 2, [0.5, 0.5]);
        assert_eq!(mesh.vertex_count(), 9);
        assert_eq!(mesh.index_count(), num_indices(2, 2));
        let indices = mesh.indices.as_ref().unwrap();
        assert_eq!(indices.len(), 14);
        assert_eq!(&indices[..6], &[0, 3, 1, 4, 2, 5]);
        // Degenerate stitch between the rows
        assert_eq!(&indices[6..8], &[5, 3]);
        assert_eq!(&indices[8..], &[3, 6, 4, 7, 5, 8]);
        assert!(indices.iter().all(|&i| (i as usize) < mesh.vertex_count()));
    }

    #[test]
    fn test_tex_coords_span_extent() {
        let coords = quad_tex_coords([0.25, 0.5], [0.75, 1.0], 2, 1);
        assert_eq!(coords.len(), 6);
        assert_eq!(coords[0], [0.25, 0.5]);
        assert_eq!(coords[1], [0.5, 0.5]);
        assert_eq!(coords[5], [0.75, 1.0]);
    }
}
