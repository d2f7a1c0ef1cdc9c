//! Agent color palette and per-type color assignment.
//!
//! The palette and the `type_id -> palette index` map are kept apart so that
//! recoloring a type is a single map write.

use std::collections::HashMap;

use crate::agent::TypeId;

/// Saturation multiplier applied to agents outside the highlight set.
pub const DESATURATION: f32 = 0.25;

/// Opacity of desaturated agents.
pub const DESATURATED_ALPHA: f32 = 0.4;

/// Maximum palette entries uploaded to the GPU.
pub const MAX_PALETTE_COLORS: usize = 128;

/// Parse `#RRGGBB` (or `RRGGBB`) into linear 0..1 channels.
pub fn parse_hex_color(s: &str) -> Option<[f32; 3]> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok().map(|v| v as f32 / 255.0);
    Some([channel(0)?, channel(2)?, channel(4)?])
}

fn rgb_to_hsl(c: [f32; 3]) -> [f32; 3] {
    let max = c[0].max(c[1]).max(c[2]);
    let min = c[0].min(c[1]).min(c[2]);
    let l = (max + min) / 2.0;
    if (max - min).abs() < f32::EPSILON {
        return [0.0, 0.0, l];
    }
    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == c[0] {
        (c[1] - c[2]) / d + if c[1] < c[2] { 6.0 } else { 0.0 }
    } else if max == c[1] {
        (c[2] - c[0]) / d + 2.0
    } else {
        (c[0] - c[1]) / d + 4.0
    };
    [h / 6.0, s, l]
}

fn hsl_to_rgb(hsl: [f32; 3]) -> [f32; 3] {
    let [h, s, l] = hsl;
    if s == 0.0 {
        return [l, l, l];
    }
    let hue = |p: f32, q: f32, mut t: f32| {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    [hue(p, q, h + 1.0 / 3.0), hue(p, q, h), hue(p, q, h - 1.0 / 3.0)]
}

/// Scale the HSL saturation of `color` by [`DESATURATION`].
pub fn desaturate(color: [f32; 3]) -> [f32; 3] {
    let mut hsl = rgb_to_hsl(color);
    hsl[1] *= DESATURATION;
    hsl_to_rgb(hsl)
}

/// Encode a palette index and highlight state as the signed float the shaders read.
///
/// Index 0 must stay distinguishable from background, so the value is offset by one.
pub fn signed_type_color(color_index: usize, full_saturation: bool) -> f32 {
    let v = (color_index + 1) as f32;
    if full_saturation {
        v
    } else {
        -v
    }
}

#[derive(Debug, Clone)]
pub struct ColorTable {
    palette: Vec<[f32; 3]>,
    type_to_index: HashMap<TypeId, usize>,
}

impl ColorTable {
    /// Build a table from hex strings. Entries that fail to parse are skipped with a warning.
    pub fn from_hex(colors: &[String]) -> Self {
        let mut palette = Vec::with_capacity(colors.len());
        for c in colors {
            if palette.len() == MAX_PALETTE_COLORS {
                log::warn!(
                    "Palette has more than {} colors, ignoring the rest",
                    MAX_PALETTE_COLORS
                );
                break;
            }
            match parse_hex_color(c) {
                Some(rgb) => palette.push(rgb),
                None => log::warn!("Ignoring invalid palette color '{}'", c),
            }
        }
        if palette.is_empty() {
            palette.push([1.0, 1.0, 1.0]);
        }
        Self {
            palette,
            type_to_index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.palette.len()
    }

    pub fn is_empty(&self) -> bool {
        self.palette.is_empty()
    }

    /// Append a color, returning its palette index. Existing colors are reused.
    ///
    /// Once the palette holds [`MAX_PALETTE_COLORS`] entries the closest
    /// existing color is returned instead.
    pub fn add_color(&mut self, color: [f32; 3]) -> usize {
        if let Some(i) = self.palette.iter().position(|c| *c == color) {
            return i;
        }
        if self.palette.len() >= MAX_PALETTE_COLORS {
            let target = glam::Vec3::from(color);
            let nearest = self
                .palette
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = glam::Vec3::from(**a).distance_squared(target);
                    let db = glam::Vec3::from(**b).distance_squared(target);
                    da.total_cmp(&db)
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            log::warn!(
                "Palette is full ({} colors), using entry {} for {:?}",
                MAX_PALETTE_COLORS,
                nearest,
                color
            );
            return nearest;
        }
        self.palette.push(color);
        self.palette.len() - 1
    }

    /// Point every type in `ids` at palette entry `index`.
    pub fn set_color_for_ids(&mut self, ids: &[TypeId], index: usize) {
        if index >= self.palette.len() {
            log::warn!("Palette index {} out of range ({} colors)", index, self.palette.len());
            return;
        }
        for id in ids {
            self.type_to_index.insert(*id, index);
        }
    }

    /// Palette index for a type. Unassigned types cycle through the palette by id.
    pub fn color_index(&self, type_id: TypeId) -> usize {
        match self.type_to_index.get(&type_id) {
            Some(i) => *i,
            None => type_id.unsigned_abs() as usize % self.palette.len(),
        }
    }

    pub fn color(&self, index: usize) -> [f32; 3] {
        self.palette[index % self.palette.len()]
    }

    pub fn color_for_type(&self, type_id: TypeId) -> [f32; 3] {
        self.color(self.color_index(type_id))
    }

    /// Palette laid out for the composite shader: entry `2i` is color `i`,
    /// entry `2i + 1` its desaturated variant with reduced alpha.
    pub fn gpu_palette(&self) -> Vec<[f32; 4]> {
        let mut out = Vec::with_capacity(MAX_PALETTE_COLORS * 2);
        for c in self.palette.iter().take(MAX_PALETTE_COLORS) {
            let d = desaturate(*c);
            out.push([c[0], c[1], c[2], 1.0]);
            out.push([d[0], d[1], d[2], DESATURATED_ALPHA]);
        }
        out.resize(MAX_PALETTE_COLORS * 2, [1.0; 4]);
        out
    }

    /// Drop per-type overrides, keeping the palette.
    pub fn clear_assignments(&mut self) {
        self.type_to_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff0000"), Some([1.0, 0.0, 0.0]));
        assert_eq!(parse_hex_color("00ff00"), Some([0.0, 1.0, 0.0]));
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(parse_hex_color("#gg0000"), None);
    }

    #[test]
    fn test_parse_hex_color_rejects_non_ascii() {
        // Six bytes, but a char boundary falls inside a channel
        assert_eq!(parse_hex_color("#aééb"), None);
        assert_eq!(parse_hex_color("ff00é"), None);
    }

    #[test]
    fn test_add_color_stops_at_gpu_palette_size() {
        let mut table = ColorTable::from_hex(&["#000000".into()]);
        for i in 1..MAX_PALETTE_COLORS {
            let v = i as f32 / MAX_PALETTE_COLORS as f32;
            assert_eq!(table.add_color([v, 0.0, 0.0]), i);
        }
        assert_eq!(table.len(), MAX_PALETTE_COLORS);

        // Full: the nearest existing entry is reused
        assert_eq!(table.add_color([0.0, 0.0, 0.01]), 0);
        assert_eq!(table.len(), MAX_PALETTE_COLORS);
        assert!(table.color_index(1000) < MAX_PALETTE_COLORS);
    }

    #[test]
    fn test_from_hex_truncates_long_palettes() {
        let colors: Vec<String> = (0..200).map(|i| format!("#{:06x}", i)).collect();
        let table = ColorTable::from_hex(&colors);
        assert_eq!(table.len(), MAX_PALETTE_COLORS);
    }

    #[test]
    fn test_desaturate_keeps_lightness() {
        let red = [1.0, 0.0, 0.0];
        let d = desaturate(red);
        assert_relative_eq!(rgb_to_hsl(d)[2], 0.5, epsilon = 1e-5);
        assert_relative_eq!(rgb_to_hsl(d)[1], 0.25, epsilon = 1e-5);
        assert_eq!(desaturate([0.5, 0.5, 0.5]), [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_hsl_round_trip() {
        let c = [0.2, 0.6, 0.9];
        let back = hsl_to_rgb(rgb_to_hsl(c));
        for i in 0..3 {
            assert_relative_eq!(back[i], c[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_type_assignment_independent_of_palette() {
        let mut table = ColorTable::from_hex(&["#ff0000".into(), "#00ff00".into(), "#0000ff".into()]);
        assert_eq!(table.color_index(4), 1);
        table.set_color_for_ids(&[4, 5], 2);
        assert_eq!(table.color_index(4), 2);
        assert_eq!(table.color_for_type(5), [0.0, 0.0, 1.0]);
        table.set_color_for_ids(&[4], 9);
        assert_eq!(table.color_index(4), 2);
    }

    #[test]
    fn test_signed_type_color() {
        assert_eq!(signed_type_color(0, true), 1.0);
        assert_eq!(signed_type_color(0, false), -1.0);
        assert_eq!(signed_type_color(4, false), -5.0);
    }

    #[test]
    fn test_gpu_palette_layout() {
        let table = ColorTable::from_hex(&["#ff0000".into()]);
        let gpu = table.gpu_palette();
        assert_eq!(gpu.len(), MAX_PALETTE_COLORS * 2);
        assert_eq!(gpu[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(gpu[1][3], DESATURATED_ALPHA);
    }
}
