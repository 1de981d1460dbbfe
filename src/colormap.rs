//! Colormaps
//!
//! Piecewise-linear maps over evenly spaced color stops.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorMap {
    pub id: &'static str,
    /// 0xRRGGBB stops at i / (len - 1)
    stops: &'static [u32],
}

pub const VIRIDIS: ColorMap = ColorMap {
    id: "VIRIDIS",
    stops: &[
        0x440154, 0x472D7B, 0x3B528B, 0x2C728E, 0x21918C, 0x28AE80, 0x5EC962, 0xADDC30, 0xFDE725,
    ],
};

pub const JET: ColorMap = ColorMap {
    id: "JET",
    stops: &[
        0x00007F, 0x0000FF, 0x007FFF, 0x00FFFF, 0x7FFF7F, 0xFFFF00, 0xFF7F00, 0xFF0000, 0x7F0000,
    ],
};

pub const HOT: ColorMap = ColorMap {
    id: "HOT",
    stops: &[0x000000, 0xFF0000, 0xFFFF00, 0xFFFFFF],
};

pub const GRAY: ColorMap = ColorMap {
    id: "GRAY",
    stops: &[0x000000, 0xFFFFFF],
};

pub const ALL: [ColorMap; 4] = [VIRIDIS, JET, HOT, GRAY];

pub fn by_id(id: &str) -> Option<ColorMap> {
    ALL.into_iter().find(|m| m.id == id)
}

fn rgb(hex: u32) -> [f32; 3] {
    [
        ((hex >> 16) & 0xFF) as f32 / 255.0,
        ((hex >> 8) & 0xFF) as f32 / 255.0,
        (hex & 0xFF) as f32 / 255.0,
    ]
}

impl ColorMap {
    /// Color for an intensity, clamped to the end stops
    pub fn map(&self, intensity: f32) -> [f32; 3] {
        let last = self.stops.len() - 1;
        if intensity.is_nan() || intensity <= 0.0 {
            return rgb(self.stops[0]);
        }
        if intensity >= 1.0 {
            return rgb(self.stops[last]);
        }

        let position = intensity * last as f32;
        let index = (position.floor() as usize).min(last - 1);
        let alpha = position - index as f32;
        let (from, to) = (rgb(self.stops[index]), rgb(self.stops[index + 1]));
        [
            from[0] + (to[0] - from[0]) * alpha,
            from[1] + (to[1] - from[1]) * alpha,
            from[2] + (to[2] - from[2]) * alpha,
        ]
    }

    /// Stop list for legends: ("12.5%", "#472d7b")
    pub fn gradient(&self) -> Vec<(String, String)> {
        let last = (self.stops.len() - 1) as f64;
        self.stops
            .iter()
            .enumerate()
            .map(|(i, hex)| {
                let stop = 100.0 * i as f64 / last;
                (format!("{}%", stop), format!("#{:06x}", hex))
            })
            .collect()
    }
}
