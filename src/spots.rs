//! Spots controller
//!
//! Owns spots, measures, the intensity normalizer and every per-spot and
//! global overlay attribute. Setters queue [`SpotsEvent`]s; the owner drains
//! them with [`SpotsController::drain_events`] and routes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::colormap::{self, ColorMap};
use crate::normalize::{data_dependent_opacity, Bounds, IntensityNormalizer, Scale};

pub const DEFAULT_SPOT_BORDER: f32 = 0.05;

static NEXT_SPOTS_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Extent {
    Radius(f32),
    /// Full side lengths
    Cuboid([f32; 3]),
}

impl Extent {
    pub fn scaled(self, factor: f32) -> Extent {
        match self {
            Extent::Radius(r) => Extent::Radius(r * factor),
            Extent::Cuboid([x, y, z]) => Extent::Cuboid([x * factor, y * factor, z * factor]),
        }
    }

    /// Acceptance radius for point mapping
    pub fn radius(self) -> f32 {
        match self {
            Extent::Radius(r) => r,
            Extent::Cuboid([x, y, z]) => x.max(y).max(z) / 2.0,
        }
    }

    /// Half side lengths for volume rasterization
    pub fn half_sides(self) -> [f32; 3] {
        match self {
            Extent::Radius(r) => [r; 3],
            Extent::Cuboid([x, y, z]) => [x / 2.0, y / 2.0, z / 2.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub name: String,
    pub position: [f32; 3],
    pub extent: Extent,
    /// [0,1] or NaN
    pub intensity: f32,
    pub color: [f32; 3],
    pub opacity: f32,
    pub scale: f32,
}

impl Spot {
    pub fn new(name: impl Into<String>, position: [f32; 3], extent: Extent) -> Self {
        Self {
            name: name.into(),
            position,
            extent,
            intensity: f32::NAN,
            color: [1.0, 1.0, 1.0],
            opacity: 1.0,
            scale: 1.0,
        }
    }

    pub fn shape(&self) -> SpotShape {
        SpotShape {
            position: self.position,
            extent: self.extent.scaled(self.scale),
        }
    }
}

/// What the mapper needs from a spot: center and per-spot scaled extent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotShape {
    pub position: [f32; 3],
    pub extent: Extent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub name: String,
    /// Parallel to spots, NaN for missing values
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotsEvent {
    SpotsChanged,
    /// Global or per-spot size scale
    ScaleChanged,
    /// Opacity, colors or border
    AttrChanged,
    /// Colormap, scale function or bounds
    MappingChanged,
    AutoMappingChanged,
    IntensitiesLoaded,
    IntensitiesChanged,
    BorderChanged,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpotsError {
    #[error("Unknown scale: {0}")]
    UnknownScale(String),
    #[error("Unknown color map: {0}")]
    UnknownColorMap(String),
    #[error("Unknown measure: {0}")]
    UnknownMeasure(String),
    #[error("Measure index {index} out of range ({count} measures)")]
    MeasureIndex { index: usize, count: usize },
}

pub struct SpotsController {
    spots: Vec<Spot>,
    generation: u64,
    measures: Vec<Measure>,
    active_measure: Option<usize>,
    normalizer: IntensityNormalizer,
    color_map: ColorMap,
    spot_border: f32,
    global_spot_opacity: f32,
    global_spot_scale: f32,
    data_dependent_opacity: bool,
    pending: Vec<SpotsEvent>,
}

impl Default for SpotsController {
    fn default() -> Self {
        Self {
            spots: Vec::new(),
            generation: 0,
            measures: Vec::new(),
            active_measure: None,
            normalizer: IntensityNormalizer::new(),
            color_map: colormap::VIRIDIS,
            spot_border: DEFAULT_SPOT_BORDER,
            global_spot_opacity: 1.0,
            global_spot_scale: 1.0,
            data_dependent_opacity: false,
            pending: Vec::new(),
        }
    }
}

impl SpotsController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    pub fn spots_mut(&mut self) -> &mut [Spot] {
        &mut self.spots
    }

    /// Identity stamp of the current spot list
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn shapes(&self) -> Vec<SpotShape> {
        self.spots.iter().map(Spot::shape).collect()
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn active_measure(&self) -> Option<&Measure> {
        self.active_measure.and_then(|i| self.measures.get(i))
    }

    pub fn scale(&self) -> Scale {
        self.normalizer.scale()
    }

    pub fn bounds(&self) -> Bounds {
        self.normalizer.bounds()
    }

    pub fn hotspot_quantile(&self) -> f64 {
        self.normalizer.quantile()
    }

    pub fn auto_min_max(&self) -> bool {
        self.normalizer.auto_min_max()
    }

    pub fn color_map(&self) -> ColorMap {
        self.color_map
    }

    pub fn spot_border(&self) -> f32 {
        self.spot_border
    }

    pub fn global_spot_opacity(&self) -> f32 {
        self.global_spot_opacity
    }

    pub fn global_spot_scale(&self) -> f32 {
        self.global_spot_scale
    }

    pub fn data_dependent_opacity(&self) -> bool {
        self.data_dependent_opacity
    }

    pub fn drain_events(&mut self) -> Vec<SpotsEvent> {
        std::mem::take(&mut self.pending)
    }

    fn emit(&mut self, event: SpotsEvent) {
        self.pending.push(event);
    }

    /// Replace the spot list; starts a new generation
    pub fn set_spots(&mut self, spots: Vec<Spot>) {
        self.spots = spots;
        self.generation = NEXT_SPOTS_GENERATION.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Spots replaced: {} spots, generation {}",
            self.spots.len(),
            self.generation
        );
        self.emit(SpotsEvent::SpotsChanged);
    }

    /// Replace measures; no measure is active afterwards
    pub fn set_measures(&mut self, measures: Vec<Measure>) {
        self.measures = measures;
        self.active_measure = None;
        self.emit(SpotsEvent::IntensitiesLoaded);
    }

    pub fn select_measure(&mut self, index: usize) -> Result<(), SpotsError> {
        if index >= self.measures.len() {
            return Err(SpotsError::MeasureIndex {
                index,
                count: self.measures.len(),
            });
        }
        self.active_measure = Some(index);
        if self.normalizer.auto_min_max() {
            self.update_bounds();
        }
        self.update_intensities();
        Ok(())
    }

    pub fn select_measure_by_name(&mut self, name: &str) -> Result<(), SpotsError> {
        let index = self
            .measures
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| SpotsError::UnknownMeasure(name.to_string()))?;
        self.select_measure(index)
    }

    pub fn set_scale_id(&mut self, id: &str) -> Result<(), SpotsError> {
        let scale = Scale::from_id(id).ok_or_else(|| SpotsError::UnknownScale(id.to_string()))?;
        if scale == self.normalizer.scale() {
            return Ok(());
        }
        self.normalizer.set_scale(scale);
        if self.normalizer.auto_min_max() {
            self.update_bounds();
        }
        self.update_intensities();
        self.emit(SpotsEvent::MappingChanged);
        Ok(())
    }

    pub fn set_hotspot_quantile(&mut self, quantile: f64) {
        if quantile == self.normalizer.quantile() {
            return;
        }
        self.normalizer.set_quantile(quantile);
        if self.normalizer.auto_min_max() {
            self.update_bounds();
            self.update_intensities();
        } else {
            warn!("Potential programming error: hotspot quantile changed with auto min/max disabled");
        }
    }

    /// Stores the quantile without recomputing bounds. Used when restoring
    /// settings, where auto min/max is switched afterwards.
    pub fn store_hotspot_quantile(&mut self, quantile: f64) {
        self.normalizer.set_quantile(quantile);
    }

    pub fn set_auto_min_max(&mut self, auto: bool) {
        self.normalizer.set_auto_min_max(auto);
        if auto {
            self.update_bounds();
            self.update_intensities();
        }
        self.emit(SpotsEvent::AutoMappingChanged);
    }

    /// Ignored while auto min/max is on
    pub fn set_min_value(&mut self, min: f64) {
        if self.normalizer.auto_min_max() {
            debug!("Ignoring min value {} with auto min/max enabled", min);
            return;
        }
        self.normalizer.set_min(min);
        self.update_intensities();
        self.emit(SpotsEvent::MappingChanged);
    }

    /// Ignored while auto min/max is on
    pub fn set_max_value(&mut self, max: f64) {
        if self.normalizer.auto_min_max() {
            debug!("Ignoring max value {} with auto min/max enabled", max);
            return;
        }
        self.normalizer.set_max(max);
        self.update_intensities();
        self.emit(SpotsEvent::MappingChanged);
    }

    pub fn set_color_map(&mut self, id: &str) -> Result<(), SpotsError> {
        let map = colormap::by_id(id).ok_or_else(|| SpotsError::UnknownColorMap(id.to_string()))?;
        self.color_map = map;
        self.emit(SpotsEvent::MappingChanged);
        Ok(())
    }

    pub fn set_spot_border(&mut self, border: f32) {
        let border = border.clamp(0.0, 1.0);
        if border == self.spot_border {
            return;
        }
        self.spot_border = border;
        self.emit(SpotsEvent::BorderChanged);
        self.emit(SpotsEvent::AttrChanged);
    }

    pub fn set_global_spot_opacity(&mut self, opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        if opacity == self.global_spot_opacity {
            return;
        }
        self.global_spot_opacity = opacity;
        self.emit(SpotsEvent::AttrChanged);
    }

    /// Unchanged values emit nothing, so no remap is triggered
    pub fn set_global_spot_scale(&mut self, scale: f32) {
        let scale = scale.max(0.0);
        if scale == self.global_spot_scale {
            return;
        }
        self.global_spot_scale = scale;
        self.emit(SpotsEvent::ScaleChanged);
    }

    /// Per-spot opacity by name, clamped to [0,1]. Unknown names are ignored.
    pub fn set_spot_opacity(&mut self, opacity: &HashMap<String, f32>) {
        for spot in &mut self.spots {
            if let Some(&value) = opacity.get(&spot.name) {
                spot.opacity = value.clamp(0.0, 1.0);
            }
        }
        self.emit(SpotsEvent::AttrChanged);
    }

    /// Per-spot size scale by name, negative values become 0
    pub fn set_spot_scale(&mut self, scale: &HashMap<String, f32>) {
        for spot in &mut self.spots {
            if let Some(&value) = scale.get(&spot.name) {
                spot.scale = value.max(0.0);
            }
        }
        self.emit(SpotsEvent::ScaleChanged);
    }

    pub fn set_spot_colors(&mut self, colors: &HashMap<String, [f32; 3]>) {
        for spot in &mut self.spots {
            if let Some(&color) = colors.get(&spot.name) {
                spot.color = color;
            }
        }
        self.emit(SpotsEvent::AttrChanged);
    }

    pub fn set_data_dependent_opacity(&mut self, enabled: bool) {
        self.data_dependent_opacity = enabled;
        self.update_opacities();
        self.emit(SpotsEvent::AttrChanged);
    }

    fn update_bounds(&mut self) {
        let changed = match self.active_measure.and_then(|i| self.measures.get(i)) {
            Some(measure) => self.normalizer.update_bounds(&measure.values),
            None => self.normalizer.update_bounds(&[]),
        };
        if changed {
            let bounds = self.normalizer.bounds();
            debug!("Bounds updated: min {} max {}", bounds.min, bounds.max);
            self.emit(SpotsEvent::AutoMappingChanged);
            self.emit(SpotsEvent::MappingChanged);
        }
    }

    fn update_intensities(&mut self) {
        let values = self
            .active_measure
            .and_then(|i| self.measures.get(i))
            .map(|m| m.values.as_slice())
            .unwrap_or(&[]);
        for (i, spot) in self.spots.iter_mut().enumerate() {
            spot.intensity = values
                .get(i)
                .map_or(f32::NAN, |&raw| self.normalizer.intensity(raw));
        }
        if self.data_dependent_opacity {
            self.update_opacities();
        }
        self.emit(SpotsEvent::IntensitiesChanged);
    }

    fn update_opacities(&mut self) {
        let enabled = self.data_dependent_opacity;
        for spot in &mut self.spots {
            spot.opacity = if enabled {
                data_dependent_opacity(spot.intensity)
            } else {
                1.0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn controller_with(values: &[f32]) -> SpotsController {
        let mut controller = SpotsController::new();
        let spots = (0..values.len())
            .map(|i| Spot::new(format!("s{}", i), [i as f32, 0.0, 0.0], Extent::Radius(1.0)))
            .collect();
        controller.set_spots(spots);
        controller.set_measures(vec![
            Measure {
                name: "m1".to_string(),
                values: values.to_vec(),
            },
            Measure {
                name: "m2".to_string(),
                values: values.iter().map(|v| v * 2.0).collect(),
            },
        ]);
        controller.drain_events();
        controller
    }

    #[test]
    fn test_defaults() {
        let controller = SpotsController::new();
        assert_eq!(controller.spot_border(), 0.05);
        assert_eq!(controller.color_map().id, "VIRIDIS");
        assert_eq!(controller.scale(), Scale::Linear);
        assert_eq!(controller.hotspot_quantile(), 1.0);
        assert!(controller.auto_min_max());
        assert_eq!(controller.global_spot_opacity(), 1.0);
        assert_eq!(controller.global_spot_scale(), 1.0);
    }

    #[test]
    fn test_select_measure_updates_intensities() {
        let mut controller = controller_with(&[0.0, 5.0, 10.0, f32::NAN]);
        controller.select_measure(0).unwrap();

        let intensities: Vec<f32> = controller.spots().iter().map(|s| s.intensity).collect();
        assert_eq!(intensities[0], 0.0);
        assert_relative_eq!(intensities[1], 0.5);
        assert_eq!(intensities[2], 1.0);
        assert!(intensities[3].is_nan());

        let events = controller.drain_events();
        assert!(events.contains(&SpotsEvent::MappingChanged));
        assert_eq!(events.last(), Some(&SpotsEvent::IntensitiesChanged));
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let mut controller = controller_with(&[1.0]);
        assert_eq!(
            controller.set_scale_id("sqrt"),
            Err(SpotsError::UnknownScale("sqrt".to_string()))
        );
        assert!(controller.set_color_map("RAINBOW").is_err());
        assert!(controller.select_measure_by_name("nope").is_err());
        assert!(controller.select_measure(7).is_err());
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_manual_bounds_only_when_auto_is_off() {
        let mut controller = controller_with(&[0.0, 5.0, 10.0]);
        controller.select_measure(0).unwrap();

        controller.set_max_value(100.0);
        assert_eq!(controller.bounds().max, 10.0);

        controller.set_auto_min_max(false);
        controller.set_max_value(20.0);
        assert_eq!(controller.bounds().max, 20.0);
        assert_relative_eq!(controller.spots()[2].intensity, 0.5);

        // Turning auto back on recomputes from the data
        controller.set_auto_min_max(true);
        assert_eq!(controller.bounds().max, 10.0);
    }

    #[test]
    fn test_border_and_global_attrs_are_clamped() {
        let mut controller = SpotsController::new();
        controller.set_spot_border(3.0);
        assert_eq!(controller.spot_border(), 1.0);
        assert_eq!(
            controller.drain_events(),
            vec![SpotsEvent::BorderChanged, SpotsEvent::AttrChanged]
        );

        controller.set_global_spot_opacity(-0.5);
        assert_eq!(controller.global_spot_opacity(), 0.0);
        controller.set_global_spot_scale(-2.0);
        assert_eq!(controller.global_spot_scale(), 0.0);
        assert_eq!(
            controller.drain_events(),
            vec![SpotsEvent::AttrChanged, SpotsEvent::ScaleChanged]
        );
    }

    #[test]
    fn test_unchanged_attrs_emit_nothing() {
        let mut controller = SpotsController::new();
        controller.set_spot_border(2.0);
        controller.drain_events();
        controller.set_spot_border(2.0);
        controller.set_spot_border(1.0);
        controller.set_global_spot_opacity(1.0);
        controller.set_global_spot_opacity(4.0);
        controller.set_global_spot_scale(1.0);
        assert!(controller.drain_events().is_empty());

        controller.set_global_spot_scale(-1.0);
        controller.drain_events();
        controller.set_global_spot_scale(-3.0);
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_stored_quantile_keeps_manual_bounds() {
        let mut controller = controller_with(&[0.0, 5.0, 10.0]);
        controller.select_measure(0).unwrap();
        controller.set_auto_min_max(false);
        controller.set_max_value(40.0);
        controller.drain_events();

        controller.store_hotspot_quantile(0.5);
        assert_eq!(controller.hotspot_quantile(), 0.5);
        assert_eq!(controller.bounds().max, 40.0);
        assert!(controller.drain_events().is_empty());

        controller.set_auto_min_max(true);
        assert_eq!(controller.bounds().max, 5.0);
    }

    #[test]
    fn test_per_spot_attributes_by_name() {
        let mut controller = controller_with(&[1.0, 2.0]);
        let opacity = HashMap::from([("s1".to_string(), 1.5), ("ghost".to_string(), 0.2)]);
        controller.set_spot_opacity(&opacity);
        let scale = HashMap::from([("s0".to_string(), -1.0)]);
        controller.set_spot_scale(&scale);

        assert_eq!(controller.spots()[1].opacity, 1.0);
        assert_eq!(controller.spots()[0].scale, 0.0);
        assert_eq!(controller.shapes()[0].extent, Extent::Radius(0.0));
        assert_eq!(
            controller.drain_events(),
            vec![SpotsEvent::AttrChanged, SpotsEvent::ScaleChanged]
        );
    }

    #[test]
    fn test_data_dependent_opacity_follows_intensity() {
        let mut controller = controller_with(&[0.0, 10.0, f32::NAN]);
        controller.select_measure(0).unwrap();
        controller.set_data_dependent_opacity(true);

        let opacity: Vec<f32> = controller.spots().iter().map(|s| s.opacity).collect();
        assert_relative_eq!(opacity[0], 0.1, epsilon = 1e-6);
        assert_relative_eq!(opacity[1], 1.0, epsilon = 1e-6);
        assert_relative_eq!(opacity[2], 0.1, epsilon = 1e-6);

        controller.set_data_dependent_opacity(false);
        assert!(controller.spots().iter().all(|s| s.opacity == 1.0));
    }

    #[test]
    fn test_set_spots_bumps_generation() {
        let mut controller = controller_with(&[1.0]);
        let before = controller.generation();
        controller.set_spots(vec![Spot::new("a", [0.0; 3], Extent::Radius(1.0))]);
        assert_ne!(controller.generation(), before);
        assert_eq!(controller.drain_events(), vec![SpotsEvent::SpotsChanged]);
    }

    #[test]
    fn test_cuboid_extent_helpers() {
        let extent = Extent::Cuboid([2.0, 6.0, 4.0]);
        assert_eq!(extent.radius(), 3.0);
        assert_eq!(extent.half_sides(), [1.0, 3.0, 2.0]);
        assert_eq!(Extent::Radius(2.0).half_sides(), [2.0; 3]);
        assert_eq!(extent.scaled(0.5), Extent::Cuboid([1.0, 3.0, 2.0]));
    }
}
