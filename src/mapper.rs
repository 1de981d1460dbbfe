//! Spatial mapper
//!
//! Assigns every geometry sample to a spot.
//!
//! Point mode (surfaces, images): nearest spot by radius-normalized distance,
//! accepted when the distance is at most 1. Images use pixel centers and
//! ignore z.
//!
//! Volume mode: each cuboid is rasterized into the voxel grid, distance is
//! the normalized Chebyshev distance to the cuboid center. Overlaps go to the
//! nearest center, ties to the lower spot index.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::geometry::{Geometry, GeometryId, Substrate, VolumeGrid};
use crate::scheduler::{Executor, ExecutorPort, TaskType};
use crate::spots::SpotShape;

/// Index stored for samples no spot covers
pub const UNMAPPED: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    /// Spot index per sample, or [`UNMAPPED`]
    pub closest_index: Vec<i32>,
    /// Normalized distance per sample in [0,1]; 1.0 when unmapped
    pub closest_distance: Vec<f32>,
    pub spots_generation: u64,
    pub geometry_id: GeometryId,
    /// Copied from [`MapRequest::request`]
    pub request: u64,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.closest_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closest_index.is_empty()
    }

    pub fn mapped_count(&self) -> usize {
        self.closest_index.iter().filter(|&&i| i != UNMAPPED).count()
    }
}

/// Mapper input. Cheap to clone, large arrays are shared.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub geometry: Arc<Geometry>,
    pub shapes: Arc<Vec<SpotShape>>,
    /// Global size scale applied on top of per-spot scale
    pub scale: f32,
    pub spots_generation: u64,
    /// Caller-assigned sequence number, echoed on the mapping
    pub request: u64,
}

pub struct SpatialMapper<'a> {
    request: &'a MapRequest,
}

impl<'a> SpatialMapper<'a> {
    pub fn new(request: &'a MapRequest) -> Self {
        Self { request }
    }

    /// Computes the mapping. `on_progress` gets a percentage each time it
    /// changes and can abort the run by returning an error.
    pub fn run<F>(&self, mut on_progress: F) -> anyhow::Result<Mapping>
    where
        F: FnMut(u32) -> anyhow::Result<()>,
    {
        let geometry = &self.request.geometry;
        let count = geometry.primitive_count();
        let mut closest_index = vec![UNMAPPED; count];
        let mut closest_distance = vec![1.0f32; count];

        match geometry.substrate() {
            Substrate::Surface { positions } => self.map_points(
                |i| positions[i],
                false,
                &mut closest_index,
                &mut closest_distance,
                &mut on_progress,
            )?,
            Substrate::Image { width, .. } => {
                let width = (*width as usize).max(1);
                self.map_points(
                    |i| [(i % width) as f32 + 0.5, (i / width) as f32 + 0.5, 0.0],
                    true,
                    &mut closest_index,
                    &mut closest_distance,
                    &mut on_progress,
                )?
            }
            Substrate::Volume(grid) => self.map_volume(
                grid,
                &mut closest_index,
                &mut closest_distance,
                &mut on_progress,
            )?,
        }

        let mapping = Mapping {
            closest_index,
            closest_distance,
            spots_generation: self.request.spots_generation,
            geometry_id: geometry.id(),
            request: self.request.request,
        };
        debug!(
            "Mapped {} of {} {} samples to {} spots",
            mapping.mapped_count(),
            count,
            geometry.kind(),
            self.request.shapes.len()
        );
        Ok(mapping)
    }

    fn map_points<S, F>(
        &self,
        sample: S,
        planar: bool,
        closest_index: &mut [i32],
        closest_distance: &mut [f32],
        on_progress: &mut F,
    ) -> anyhow::Result<()>
    where
        S: Fn(usize) -> [f32; 3],
        F: FnMut(u32) -> anyhow::Result<()>,
    {
        let spots: Vec<([f32; 3], f32)> = self
            .request
            .shapes
            .iter()
            .map(|s| (s.position, s.extent.radius() * self.request.scale))
            .collect();

        let count = closest_index.len();
        let mut reported = None;
        for i in 0..count {
            let percent = (i * 100 / count) as u32;
            if reported != Some(percent) {
                on_progress(percent)?;
                reported = Some(percent);
            }

            let p = sample(i);
            let mut best: Option<(usize, f32)> = None;
            for (j, (center, radius)) in spots.iter().enumerate() {
                if *radius <= 0.0 {
                    continue;
                }
                let dx = p[0] - center[0];
                let dy = p[1] - center[1];
                let dz = if planar { 0.0 } else { p[2] - center[2] };
                let d = (dx * dx + dy * dy + dz * dz).sqrt() / radius;
                if d <= 1.0 && best.map_or(true, |(_, b)| d < b) {
                    best = Some((j, d));
                }
            }
            if let Some((j, d)) = best {
                closest_index[i] = j as i32;
                closest_distance[i] = d;
            }
        }
        Ok(())
    }

    fn map_volume<F>(
        &self,
        grid: &VolumeGrid,
        closest_index: &mut [i32],
        closest_distance: &mut [f32],
        on_progress: &mut F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(u32) -> anyhow::Result<()>,
    {
        let shapes = &self.request.shapes;
        let mut reported = None;

        for (j, shape) in shapes.iter().enumerate() {
            let percent = (j * 100 / shapes.len()) as u32;
            if reported != Some(percent) {
                on_progress(percent)?;
                reported = Some(percent);
            }

            let half = shape.extent.half_sides().map(|h| h * self.request.scale);
            if half.iter().any(|&h| h.is_nan() || h <= 0.0) {
                debug!("Skipping degenerate spot {}", j);
                continue;
            }

            let mut ranges = [(0usize, 0usize); 3];
            let mut clipped = false;
            let mut empty = false;
            for axis in 0..3 {
                let voxel = grid.voxel_size(axis);
                let c = shape.position[axis];
                let lo = ((c - half[axis]) / voxel - 0.5).ceil();
                let hi = ((c + half[axis]) / voxel - 0.5).floor();
                let last = grid.lengths[axis] as f32 - 1.0;
                if lo < 0.0 || hi > last {
                    clipped = true;
                }
                let (lo, hi) = (lo.max(0.0), hi.min(last));
                if lo > hi {
                    empty = true;
                    break;
                }
                ranges[axis] = (lo as usize, hi as usize);
            }
            if empty {
                continue;
            }
            if clipped {
                warn!("Spot {} reaches outside the volume, clipped", j);
            }

            for z in ranges[2].0..=ranges[2].1 {
                let dz = (grid.center(2, z) - shape.position[2]).abs() / half[2];
                for y in ranges[1].0..=ranges[1].1 {
                    let dy = (grid.center(1, y) - shape.position[1]).abs() / half[1];
                    for x in ranges[0].0..=ranges[0].1 {
                        let dx = (grid.center(0, x) - shape.position[0]).abs() / half[0];
                        let d = dx.max(dy).max(dz).min(1.0);
                        let index = grid.index(x, y, z);
                        if closest_index[index] == UNMAPPED || d < closest_distance[index] {
                            closest_index[index] = j as i32;
                            closest_distance[index] = d;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct MapperExecutor;

impl Executor for MapperExecutor {
    type Payload = MapRequest;
    type Output = Mapping;

    fn execute(
        &mut self,
        request: MapRequest,
        port: &ExecutorPort<Mapping>,
    ) -> anyhow::Result<Mapping> {
        SpatialMapper::new(&request).run(|percent| {
            port.check_cancelled()?;
            port.progress(format!("Mapping: {}%", percent));
            Ok(())
        })
    }
}

pub const MAP: TaskType<MapperExecutor> = TaskType {
    key: "map",
    factory: || MapperExecutor,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskScheduler;
    use crate::spots::Extent;
    use approx::assert_relative_eq;

    fn request(geometry: Geometry, shapes: Vec<SpotShape>, scale: f32) -> MapRequest {
        MapRequest {
            geometry: Arc::new(geometry),
            shapes: Arc::new(shapes),
            scale,
            spots_generation: 7,
            request: 3,
        }
    }

    fn sphere(position: [f32; 3], r: f32) -> SpotShape {
        SpotShape {
            position,
            extent: Extent::Radius(r),
        }
    }

    fn cuboid(position: [f32; 3], sides: [f32; 3]) -> SpotShape {
        SpotShape {
            position,
            extent: Extent::Cuboid(sides),
        }
    }

    fn run(request: &MapRequest) -> Mapping {
        SpatialMapper::new(request).run(|_| Ok(())).unwrap()
    }

    fn line(n: usize) -> Geometry {
        Geometry::surface((0..n).map(|i| [i as f32, 0.0, 0.0]).collect())
    }

    #[test]
    fn test_indices_and_distances_in_range() {
        let req = request(
            line(50),
            vec![sphere([5.0, 0.0, 0.0], 4.0), sphere([30.0, 1.0, 0.0], 6.0)],
            1.0,
        );
        let mapping = run(&req);

        assert_eq!(mapping.len(), 50);
        assert_eq!(mapping.closest_distance.len(), 50);
        for (&index, &distance) in mapping.closest_index.iter().zip(&mapping.closest_distance) {
            assert!((-1..2).contains(&index));
            assert!((0.0..=1.0).contains(&distance));
            if index == UNMAPPED {
                assert_eq!(distance, 1.0);
            }
        }
        assert_eq!(mapping.closest_index[5], 0);
        assert_eq!(mapping.closest_distance[5], 0.0);
        assert_eq!(mapping.closest_index[20], UNMAPPED);
        assert_eq!(mapping.spots_generation, 7);
        assert_eq!(mapping.request, 3);
        assert_eq!(mapping.geometry_id, req.geometry.id());
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let req = request(
            line(40),
            vec![sphere([10.0, 0.0, 0.0], 8.0), sphere([16.0, 0.0, 0.0], 8.0)],
            1.0,
        );
        assert_eq!(run(&req), run(&req));
    }

    #[test]
    fn test_ties_go_to_lower_index() {
        // Sample 5 is exactly halfway between both spots
        let req = request(
            line(11),
            vec![sphere([3.0, 0.0, 0.0], 4.0), sphere([7.0, 0.0, 0.0], 4.0)],
            1.0,
        );
        let mapping = run(&req);
        assert_eq!(mapping.closest_index[5], 0);
        assert_eq!(mapping.closest_index[6], 1);
    }

    #[test]
    fn test_radius_normalized_distance_picks_spot() {
        // Closer in absolute terms to spot 0, but relatively closer to the large spot 1
        let req = request(
            line(1),
            vec![sphere([2.0, 0.0, 0.0], 2.5), sphere([-4.0, 0.0, 0.0], 10.0)],
            1.0,
        );
        let mapping = run(&req);
        assert_eq!(mapping.closest_index[0], 1);
        assert_relative_eq!(mapping.closest_distance[0], 0.4);
    }

    #[test]
    fn test_no_spots_leaves_everything_unmapped() {
        let mapping = run(&request(line(8), Vec::new(), 1.0));
        assert!(mapping.closest_index.iter().all(|&i| i == UNMAPPED));
        assert!(mapping.closest_distance.iter().all(|&d| d == 1.0));
    }

    #[test]
    fn test_global_scale_changes_coverage() {
        let shapes = vec![sphere([0.0, 0.0, 0.0], 2.0)];
        let normal = run(&request(line(10), shapes.clone(), 1.0));
        let doubled = run(&request(line(10), shapes.clone(), 2.0));
        let hidden = run(&request(line(10), shapes, 0.0));

        assert_eq!(normal.mapped_count(), 3);
        assert_eq!(doubled.mapped_count(), 5);
        assert_eq!(hidden.mapped_count(), 0);
    }

    #[test]
    fn test_cuboid_uses_half_largest_side_on_surfaces() {
        let mapping = run(&request(
            line(10),
            vec![cuboid([0.0, 0.0, 0.0], [1.0, 6.0, 1.0])],
            1.0,
        ));
        assert_eq!(mapping.mapped_count(), 4);
    }

    #[test]
    fn test_image_samples_pixel_centers_in_2d() {
        // 4x2 image, spot centered on pixel (1, 0) with z far away
        let req = request(
            Geometry::image(4, 2, None),
            vec![sphere([1.5, 0.5, 100.0], 0.6)],
            1.0,
        );
        let mapping = run(&req);
        assert_eq!(mapping.closest_index, vec![-1, 0, -1, -1, -1, -1, -1, -1]);
        assert_eq!(mapping.closest_distance[1], 0.0);
    }

    #[test]
    fn test_volume_rasterizes_cuboid() {
        let grid = VolumeGrid::new([4, 4, 4], [4.0, 4.0, 4.0]);
        // Covers voxel centers 1.5 and 2.5 on x, only 1.5 on y and z
        let req = request(
            Geometry::volume(grid),
            vec![cuboid([2.0, 1.5, 1.5], [2.0, 1.0, 1.0])],
            1.0,
        );
        let mapping = run(&req);

        assert_eq!(mapping.mapped_count(), 2);
        assert_eq!(mapping.closest_index[grid.index(1, 1, 1)], 0);
        assert_eq!(mapping.closest_index[grid.index(2, 1, 1)], 0);
        assert_relative_eq!(mapping.closest_distance[grid.index(1, 1, 1)], 0.5);
    }

    #[test]
    fn test_volume_overlap_goes_to_nearest_center() {
        let grid = VolumeGrid::new([8, 1, 1], [8.0, 1.0, 1.0]);
        let req = request(
            Geometry::volume(grid),
            vec![
                cuboid([3.0, 0.5, 0.5], [4.0, 2.0, 2.0]),
                cuboid([5.0, 0.5, 0.5], [4.0, 2.0, 2.0]),
            ],
            1.0,
        );
        let mapping = run(&req);
        // x = 3.5 and 4.5 are covered by both spots
        assert_eq!(mapping.closest_index, vec![-1, 0, 0, 0, 1, 1, 1, -1]);
    }

    #[test]
    fn test_volume_equal_distance_prefers_lower_index() {
        let grid = VolumeGrid::new([2, 1, 1], [2.0, 1.0, 1.0]);
        let shapes = vec![
            cuboid([1.0, 0.5, 0.5], [2.0, 2.0, 2.0]),
            cuboid([1.0, 0.5, 0.5], [2.0, 2.0, 2.0]),
        ];
        let mapping = run(&request(Geometry::volume(grid), shapes, 1.0));
        assert_eq!(mapping.closest_index, vec![0, 0]);
    }

    #[test]
    fn test_volume_clips_and_skips_degenerate() {
        let grid = VolumeGrid::new([4, 1, 1], [4.0, 1.0, 1.0]);
        let shapes = vec![
            cuboid([0.0, 0.5, 0.5], [3.0, 1.0, 1.0]),
            cuboid([3.5, 0.5, 0.5], [0.0, 1.0, 1.0]),
            cuboid([-10.0, 0.5, 0.5], [1.0, 1.0, 1.0]),
        ];
        let mapping = run(&request(Geometry::volume(grid), shapes, 1.0));
        assert_eq!(mapping.closest_index, vec![0, 0, -1, -1]);
    }

    #[tokio::test]
    async fn test_map_task_reports_progress() {
        let scheduler = TaskScheduler::new();
        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        scheduler.subscribe(move |event| {
            if let crate::scheduler::SchedulerEvent::StatusChanged(s) = event {
                sink.lock().unwrap().push(s.clone());
            }
        });

        let req = request(line(200), vec![sphere([50.0, 0.0, 0.0], 10.0)], 1.0);
        let mapping = scheduler.run_task(MAP, req).await.unwrap();

        assert_eq!(mapping.mapped_count(), 21);
        let statuses = statuses.lock().unwrap();
        assert!(statuses.iter().any(|s| s == "Mapping: 0%"));
        assert!(statuses.iter().any(|s| s == "Mapping: 99%"));
    }
}
