//! Scene: geometry, its current mapping and the color buffer painted on it

use std::sync::Arc;

use tracing::{debug, warn};

use crate::geometry::Geometry;
use crate::mapper::Mapping;
use crate::recolor::{BaseColor, BlendParams, RecolorEngine, RecolorMode};
use crate::spots::SpotsController;

pub const DEFAULT_BASE_COLOR: [f32; 3] = [1.0, 1.0, 1.0];

pub struct Scene {
    geometry: Option<Arc<Geometry>>,
    mapping: Option<Mapping>,
    base_color: [f32; 3],
    engine: RecolorEngine,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            geometry: None,
            mapping: None,
            base_color: DEFAULT_BASE_COLOR,
            engine: RecolorEngine::new(),
        }
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn geometry(&self) -> Option<&Arc<Geometry>> {
        self.geometry.as_ref()
    }

    /// Replaces the geometry; any mapping is dropped
    pub fn set_geometry(&mut self, geometry: Option<Arc<Geometry>>) {
        self.geometry = geometry;
        self.mapping = None;
        self.engine.reset();
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }

    pub fn base_color(&self) -> [f32; 3] {
        self.base_color
    }

    pub fn set_base_color(&mut self, color: [f32; 3]) {
        self.base_color = color;
    }

    /// Installs a mapping computed for the current spots and geometry.
    /// Returns false and keeps the old state otherwise.
    pub fn set_mapping(&mut self, mapping: Mapping, spots: &SpotsController) -> bool {
        if spots.spots().is_empty() {
            debug!("Ignoring mapping: no spots");
            return false;
        }
        let Some(geometry) = &self.geometry else {
            warn!("Potential programming error: mapping without geometry");
            return false;
        };
        if mapping.geometry_id != geometry.id()
            || mapping.spots_generation != spots.generation()
            || mapping.len() != geometry.primitive_count()
        {
            warn!("Potential programming error: mapping does not match spots or geometry");
            return false;
        }
        self.mapping = Some(mapping);
        true
    }

    pub fn invalidate_mapping(&mut self) {
        self.mapping = None;
    }

    /// Repaints the color buffer. Does nothing without geometry.
    pub fn recolor(&mut self, mode: RecolorMode, spots: &mut SpotsController) {
        let Some(geometry) = &self.geometry else {
            return;
        };
        let params = BlendParams {
            color_map: spots.color_map(),
            border: spots.spot_border(),
            global_opacity: spots.global_spot_opacity(),
        };
        let base = match geometry.base_colors() {
            Some(colors) => BaseColor::PerPrimitive(colors),
            None => BaseColor::Uniform(self.base_color),
        };
        self.engine.recolor(
            mode,
            spots.spots_mut(),
            self.mapping.as_ref(),
            geometry.primitive_count(),
            base,
            &params,
        );
    }

    /// RGB floats, three per primitive
    pub fn colors(&self) -> Option<&[f32]> {
        self.engine.colors()
    }

    /// Spot index painted on `primitive`, if any
    pub fn spot_at(&self, primitive: usize) -> Option<usize> {
        let index = *self.mapping.as_ref()?.closest_index.get(primitive)?;
        usize::try_from(index).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{MapRequest, SpatialMapper};
    use crate::spots::{Extent, Measure, Spot};

    fn setup() -> (Scene, SpotsController) {
        let mut spots = SpotsController::new();
        spots.set_spots(vec![
            Spot::new("a", [0.0, 0.0, 0.0], Extent::Radius(1.0)),
            Spot::new("b", [4.0, 0.0, 0.0], Extent::Radius(1.0)),
        ]);
        spots.set_measures(vec![Measure {
            name: "m".to_string(),
            values: vec![1.0, 2.0],
        }]);
        spots.select_measure(0).unwrap();

        let mut scene = Scene::new();
        scene.set_geometry(Some(Arc::new(Geometry::surface(
            (0..6).map(|i| [i as f32, 0.0, 0.0]).collect(),
        ))));
        (scene, spots)
    }

    fn compute(scene: &Scene, spots: &SpotsController) -> Mapping {
        let request = MapRequest {
            geometry: Arc::clone(scene.geometry().unwrap()),
            shapes: Arc::new(spots.shapes()),
            scale: spots.global_spot_scale(),
            spots_generation: spots.generation(),
            request: 0,
        };
        SpatialMapper::new(&request).run(|_| Ok(())).unwrap()
    }

    #[test]
    fn test_mapping_and_picking() {
        let (mut scene, mut spots) = setup();
        let mapping = compute(&scene, &spots);
        assert!(scene.set_mapping(mapping, &spots));

        assert_eq!(scene.spot_at(0), Some(0));
        assert_eq!(scene.spot_at(2), None);
        assert_eq!(scene.spot_at(4), Some(1));
        assert_eq!(scene.spot_at(99), None);

        scene.recolor(RecolorMode::Full, &mut spots);
        let colors = scene.colors().unwrap();
        assert_eq!(colors.len(), 18);
        assert_eq!(&colors[6..9], &DEFAULT_BASE_COLOR);
    }

    #[test]
    fn test_stale_mapping_is_rejected() {
        let (mut scene, mut spots) = setup();
        let stale = compute(&scene, &spots);
        spots.set_spots(vec![Spot::new("c", [0.0; 3], Extent::Radius(1.0))]);

        assert!(!scene.set_mapping(stale, &spots));
        assert!(scene.mapping().is_none());
    }

    #[test]
    fn test_mapping_ignored_without_spots() {
        let (mut scene, mut spots) = setup();
        let mapping = compute(&scene, &spots);
        spots.set_spots(Vec::new());
        assert!(!scene.set_mapping(mapping, &spots));
    }

    #[test]
    fn test_new_geometry_drops_mapping() {
        let (mut scene, spots) = setup();
        let mapping = compute(&scene, &spots);
        assert!(scene.set_mapping(mapping, &spots));

        scene.set_geometry(Some(Arc::new(Geometry::image(2, 2, None))));
        assert!(scene.mapping().is_none());
        assert!(scene.colors().is_none());
    }
}
