//! Intensity normalization
//!
//! Raw measure values become intensities in [0,1] or NaN under a scale
//! function. Upper bound comes from a hotspot quantile so a few extreme spots
//! do not flatten the rest of the colormap.

use serde::{Deserialize, Serialize};

pub const DATA_DEPENDENT_OPACITY_MIN: f32 = 0.1;
pub const DATA_DEPENDENT_OPACITY_MAX: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    Linear,
    Log,
}

impl Scale {
    pub const ALL: [Scale; 2] = [Scale::Linear, Scale::Log];

    pub fn id(self) -> &'static str {
        match self {
            Scale::Linear => "linear",
            Scale::Log => "log",
        }
    }

    pub fn from_id(id: &str) -> Option<Scale> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// Axis label for legends
    pub fn legend(self) -> &'static str {
        match self {
            Scale::Linear => "value",
            Scale::Log => "log10(value)",
        }
    }

    pub fn transform(self, x: f64) -> f64 {
        match self {
            Scale::Linear => x,
            Scale::Log => x.log10(),
        }
    }

    pub fn in_domain(self, x: f64) -> bool {
        match self {
            Scale::Linear => x.is_finite(),
            Scale::Log => x.is_finite() && x > 0.0,
        }
    }
}

/// Bounds in transformed space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    /// `min` is the smallest in-domain value, `max` the value at the
    /// quantile position of the sorted in-domain values. Both 0 when nothing
    /// is in domain.
    pub fn from_values(values: &[f32], scale: Scale, quantile: f64) -> Bounds {
        let mut sorted: Vec<f64> = values
            .iter()
            .map(|&v| f64::from(v))
            .filter(|&v| scale.in_domain(v))
            .collect();
        if sorted.is_empty() {
            return Bounds::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let last = sorted.len() - 1;
        let position = ((last as f64) * quantile.clamp(0.0, 1.0)).ceil() as usize;
        Bounds {
            min: scale.transform(sorted[0]),
            max: scale.transform(sorted[position.min(last)]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntensityNormalizer {
    scale: Scale,
    quantile: f64,
    auto_min_max: bool,
    bounds: Bounds,
}

impl Default for IntensityNormalizer {
    fn default() -> Self {
        Self {
            scale: Scale::Linear,
            quantile: 1.0,
            auto_min_max: true,
            bounds: Bounds::default(),
        }
    }
}

impl IntensityNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn set_scale(&mut self, scale: Scale) {
        self.scale = scale;
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Clamped to [0,1]
    pub fn set_quantile(&mut self, quantile: f64) {
        self.quantile = if quantile.is_nan() {
            1.0
        } else {
            quantile.clamp(0.0, 1.0)
        };
    }

    pub fn auto_min_max(&self) -> bool {
        self.auto_min_max
    }

    pub fn set_auto_min_max(&mut self, auto: bool) {
        self.auto_min_max = auto;
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn set_min(&mut self, min: f64) {
        self.bounds.min = min;
    }

    pub fn set_max(&mut self, max: f64) {
        self.bounds.max = max;
    }

    /// Recompute bounds from `values` in auto mode. Returns true if they moved.
    pub fn update_bounds(&mut self, values: &[f32]) -> bool {
        if !self.auto_min_max {
            return false;
        }
        let bounds = Bounds::from_values(values, self.scale, self.quantile);
        let changed = bounds != self.bounds;
        self.bounds = bounds;
        changed
    }

    pub fn intensity(&self, raw: f32) -> f32 {
        let raw = f64::from(raw);
        if !self.scale.in_domain(raw) {
            return f32::NAN;
        }
        let t = self.scale.transform(raw);
        let Bounds { min, max } = self.bounds;
        if t >= max {
            1.0
        } else if t >= min {
            ((t - min) / (max - min)) as f32
        } else {
            f32::NAN
        }
    }
}

/// Opacity for a spot when data-dependent opacity is enabled
pub fn data_dependent_opacity(intensity: f32) -> f32 {
    if intensity.is_nan() {
        DATA_DEPENDENT_OPACITY_MIN
    } else {
        DATA_DEPENDENT_OPACITY_MIN
            + (DATA_DEPENDENT_OPACITY_MAX - DATA_DEPENDENT_OPACITY_MIN) * intensity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log_scale_with_hotspot_quantile() {
        let mut normalizer = IntensityNormalizer::new();
        normalizer.set_scale(Scale::Log);
        normalizer.set_quantile(0.8);
        normalizer.update_bounds(&[1.0, 2.0, 3.0, 4.0, 100.0]);

        let bounds = normalizer.bounds();
        assert_relative_eq!(bounds.max, 2.0);
        assert_relative_eq!(bounds.min, 0.0);
        assert_relative_eq!(normalizer.intensity(4.0), 0.30103, epsilon = 1e-5);
        assert_eq!(normalizer.intensity(100.0), 1.0);
        assert!(normalizer.intensity(0.0).is_nan());
        assert!(normalizer.intensity(-3.0).is_nan());
    }

    #[test]
    fn test_linear_full_quantile() {
        let values = [5.0, 7.5, 10.0, f32::NAN];
        let mut normalizer = IntensityNormalizer::new();
        normalizer.update_bounds(&values);

        assert_eq!(normalizer.intensity(10.0), 1.0);
        assert_eq!(normalizer.intensity(5.0), 0.0);
        assert_relative_eq!(normalizer.intensity(7.5), 0.5);
        assert!(normalizer.intensity(f32::NAN).is_nan());
        assert!(normalizer.intensity(4.9).is_nan());

        for intensity in values.iter().map(|&v| normalizer.intensity(v)) {
            assert!(intensity.is_nan() || (0.0..=1.0).contains(&intensity));
        }
    }

    #[test]
    fn test_quantile_is_monotone() {
        let values: Vec<f32> = (1..=50).map(|v| (v * v) as f32).collect();
        let mut previous = f64::NEG_INFINITY;
        for step in 0..=10 {
            let bounds = Bounds::from_values(&values, Scale::Linear, step as f64 / 10.0);
            assert!(bounds.max >= previous);
            previous = bounds.max;
        }
    }

    #[test]
    fn test_manual_bounds_are_kept() {
        let mut normalizer = IntensityNormalizer::new();
        normalizer.set_auto_min_max(false);
        normalizer.set_min(0.0);
        normalizer.set_max(4.0);

        assert!(!normalizer.update_bounds(&[10.0, 20.0]));
        assert_eq!(normalizer.bounds(), Bounds { min: 0.0, max: 4.0 });
        assert_relative_eq!(normalizer.intensity(1.0), 0.25);
    }

    #[test]
    fn test_empty_values_give_zero_bounds() {
        let bounds = Bounds::from_values(&[], Scale::Log, 0.5);
        assert_eq!(bounds, Bounds { min: 0.0, max: 0.0 });
        let bounds = Bounds::from_values(&[-1.0, 0.0], Scale::Log, 1.0);
        assert_eq!(bounds, Bounds { min: 0.0, max: 0.0 });
    }

    #[test]
    fn test_quantile_is_clamped() {
        let mut normalizer = IntensityNormalizer::new();
        normalizer.set_quantile(3.0);
        assert_eq!(normalizer.quantile(), 1.0);
        normalizer.set_quantile(-1.0);
        assert_eq!(normalizer.quantile(), 0.0);
    }

    #[test]
    fn test_data_dependent_opacity() {
        assert_eq!(data_dependent_opacity(f32::NAN), DATA_DEPENDENT_OPACITY_MIN);
        assert_relative_eq!(data_dependent_opacity(0.0), 0.1, epsilon = 1e-6);
        assert_relative_eq!(data_dependent_opacity(1.0), 1.0, epsilon = 1e-6);
        assert_relative_eq!(data_dependent_opacity(0.5), 0.55, epsilon = 1e-6);
    }

    #[test]
    fn test_scale_ids() {
        assert_eq!(Scale::from_id("log"), Some(Scale::Log));
        assert_eq!(Scale::from_id("linear"), Some(Scale::Linear));
        assert_eq!(Scale::from_id("sqrt"), None);
    }
}
