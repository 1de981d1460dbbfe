//! Recolor engine
//!
//! Blends spot colors onto per-primitive base colors. Full recomputes the
//! spot colors from intensities first; Cheap reuses the cached ones.

use tracing::warn;

use crate::colormap::ColorMap;
use crate::mapper::Mapping;
use crate::spots::Spot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecolorMode {
    Full,
    Cheap,
}

impl RecolorMode {
    /// Combine two pending requests; Full wins
    pub fn merge(self, other: RecolorMode) -> RecolorMode {
        if self == RecolorMode::Full || other == RecolorMode::Full {
            RecolorMode::Full
        } else {
            RecolorMode::Cheap
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlendParams {
    pub color_map: ColorMap,
    /// Relative alpha left at the spot edge
    pub border: f32,
    pub global_opacity: f32,
}

#[derive(Debug, Clone, Copy)]
pub enum BaseColor<'a> {
    Uniform([f32; 3]),
    PerPrimitive(&'a [[f32; 3]]),
}

impl BaseColor<'_> {
    fn at(&self, i: usize) -> [f32; 3] {
        match self {
            BaseColor::Uniform(color) => *color,
            BaseColor::PerPrimitive(colors) => colors[i],
        }
    }
}

/// Owns the RGB buffer, three floats per primitive
#[derive(Debug, Default)]
pub struct RecolorEngine {
    buffer: Option<Vec<f32>>,
}

impl RecolorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn colors(&self) -> Option<&[f32]> {
        self.buffer.as_deref()
    }

    pub fn reset(&mut self) {
        self.buffer = None;
    }

    pub fn recolor(
        &mut self,
        mode: RecolorMode,
        spots: &mut [Spot],
        mapping: Option<&Mapping>,
        primitive_count: usize,
        base: BaseColor<'_>,
        params: &BlendParams,
    ) -> &[f32] {
        if mode == RecolorMode::Full {
            for spot in spots.iter_mut() {
                if !spot.intensity.is_nan() {
                    spot.color = params.color_map.map(spot.intensity);
                }
            }
        }

        let len = primitive_count * 3;
        let buffer = self.buffer.get_or_insert_with(Vec::new);
        if buffer.len() != len {
            *buffer = vec![0.0; len];
        }

        for i in 0..primitive_count {
            buffer[i * 3..i * 3 + 3].copy_from_slice(&base.at(i));
        }

        match mapping {
            Some(mapping) if mapping.len() != primitive_count => {
                warn!(
                    "Mapping covers {} samples but geometry has {}, blend skipped",
                    mapping.len(),
                    primitive_count
                );
            }
            Some(mapping) => blend(buffer, spots, mapping, params),
            None => {}
        }
        buffer
    }
}

fn blend(buffer: &mut [f32], spots: &[Spot], mapping: &Mapping, params: &BlendParams) {
    let edge = 1.0 - params.border;
    for (i, (&index, &distance)) in mapping
        .closest_index
        .iter()
        .zip(&mapping.closest_distance)
        .enumerate()
    {
        let Some(spot) = usize::try_from(index).ok().and_then(|j| spots.get(j)) else {
            continue;
        };
        if spot.intensity.is_nan() {
            continue;
        }
        let alpha = (1.0 - edge * distance) * spot.opacity * params.global_opacity;
        let pixel = &mut buffer[i * 3..i * 3 + 3];
        for (channel, spot_channel) in pixel.iter_mut().zip(spot.color) {
            *channel = *channel * (1.0 - alpha) + spot_channel * alpha;
        }
    }
}
