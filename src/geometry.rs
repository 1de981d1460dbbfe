//! Geometry substrates
//!
//! A geometry is what the overlay is painted on. Each one gets a process
//! unique id so mappings can be checked against the geometry they were
//! computed for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryId(u64);

/// Regular voxel grid spanning `[0, size]` on each axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGrid {
    pub lengths: [usize; 3],
    pub size: [f32; 3],
}

impl VolumeGrid {
    pub fn new(lengths: [usize; 3], size: [f32; 3]) -> Self {
        Self { lengths, size }
    }

    pub fn voxel_count(&self) -> usize {
        self.lengths.iter().product()
    }

    /// Flat index of voxel (x, y, z)
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        let [lx, ly, _] = self.lengths;
        z * lx * ly + y * lx + x
    }

    pub fn voxel_size(&self, axis: usize) -> f32 {
        self.size[axis] / self.lengths[axis] as f32
    }

    /// Center of voxel `i` along `axis`
    pub fn center(&self, axis: usize, i: usize) -> f32 {
        (i as f32 + 0.5) * self.voxel_size(axis)
    }
}

#[derive(Debug, Clone)]
pub enum Substrate {
    /// Mesh vertices
    Surface { positions: Arc<Vec<[f32; 3]>> },
    /// Pixel grid, samples at pixel centers, row-major from the top row
    Image { width: u32, height: u32 },
    Volume(VolumeGrid),
}

#[derive(Debug, Clone)]
pub struct Geometry {
    id: GeometryId,
    substrate: Substrate,
    base_colors: Option<Arc<Vec<[f32; 3]>>>,
}

impl Geometry {
    fn with_substrate(substrate: Substrate, base_colors: Option<Vec<[f32; 3]>>) -> Self {
        Self {
            id: GeometryId(NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed)),
            substrate,
            base_colors: base_colors.map(Arc::new),
        }
    }

    pub fn surface(positions: Vec<[f32; 3]>) -> Self {
        Self::with_substrate(
            Substrate::Surface {
                positions: Arc::new(positions),
            },
            None,
        )
    }

    /// `base_colors`, if given, holds one color per pixel
    pub fn image(width: u32, height: u32, base_colors: Option<Vec<[f32; 3]>>) -> Self {
        Self::with_substrate(Substrate::Image { width, height }, base_colors)
    }

    pub fn volume(grid: VolumeGrid) -> Self {
        Self::with_substrate(Substrate::Volume(grid), None)
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    pub fn kind(&self) -> &'static str {
        match self.substrate {
            Substrate::Surface { .. } => "surface",
            Substrate::Image { .. } => "image",
            Substrate::Volume(_) => "volume",
        }
    }

    /// Vertices, pixels or voxels
    pub fn primitive_count(&self) -> usize {
        match &self.substrate {
            Substrate::Surface { positions } => positions.len(),
            Substrate::Image { width, height } => *width as usize * *height as usize,
            Substrate::Volume(grid) => grid.voxel_count(),
        }
    }

    /// Per-primitive base colors, only used when their count matches
    pub fn base_colors(&self) -> Option<&[[f32; 3]]> {
        self.base_colors
            .as_deref()
            .map(Vec::as_slice)
            .filter(|colors| colors.len() == self.primitive_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_indexing() {
        let grid = VolumeGrid::new([4, 3, 2], [8.0, 3.0, 1.0]);
        assert_eq!(grid.voxel_count(), 24);
        assert_eq!(grid.index(0, 0, 0), 0);
        assert_eq!(grid.index(3, 0, 0), 3);
        assert_eq!(grid.index(0, 1, 0), 4);
        assert_eq!(grid.index(0, 0, 1), 12);
        assert_eq!(grid.index(3, 2, 1), 23);
        assert_eq!(grid.center(0, 0), 1.0);
        assert_eq!(grid.center(2, 1), 0.75);
    }

    #[test]
    fn test_primitive_counts_and_ids() {
        let surface = Geometry::surface(vec![[0.0; 3]; 5]);
        let image = Geometry::image(4, 3, None);
        assert_eq!(surface.primitive_count(), 5);
        assert_eq!(image.primitive_count(), 12);
        assert_ne!(surface.id(), image.id());
        assert_eq!(surface.clone().id(), surface.id());
    }

    #[test]
    fn test_mismatched_base_colors_are_ignored() {
        let image = Geometry::image(2, 2, Some(vec![[1.0; 3]; 3]));
        assert!(image.base_colors().is_none());
        let image = Geometry::image(2, 2, Some(vec![[1.0; 3]; 4]));
        assert_eq!(image.base_colors().map(<[_]>::len), Some(4));
    }
}
