//! 512-byte palette blocks: 256 colors, 2 bytes each, in the console's
//! 15-bit BGR layout. A raw value of zero marks an index as fully
//! transparent, which the background compositor must skip rather than
//! paint black.

use crate::{u16_le, Error, Result};

/// One 512-byte on-disk palette block.
pub const PALETTE_BLOCK_SIZE: usize = 512;
pub const COLORS_PER_PALETTE: usize = 256;

/// Which on-disk flavour a palette block came from. The two flavours
/// share the 16-bit color layout; PC palettes additionally carry their
/// transparency in a separate alpha flag stream applied after decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteFormat {
    Pc,
    Ps,
}

/// A decoded palette: packed 0xAARRGGBB colors plus the transparent-index
/// flags the compositor consults before writing a pixel.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: Vec<u32>,
    is_zero: Vec<bool>,
}

/// Expands one 5-bit channel to 8 bits with rounding (255/31 scale).
#[inline]
fn expand5(c: u16) -> u32 {
    ((c as u32 * 255 + 15) / 31) & 0xFF
}

/// Converts a 15-bit BGR color halfword to packed 0xAARRGGBB.
pub fn from_ps_color(color: u16) -> u32 {
    let r = expand5(color & 0x1F);
    let g = expand5((color >> 5) & 0x1F);
    let b = expand5((color >> 10) & 0x1F);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}

impl Palette {
    /// Decodes a 512-byte palette block. Both formats flag raw-zero
    /// entries transparent; PC blocks refine that via
    /// [`Palette::apply_alpha_flags`] once the alpha stream is read.
    pub fn decode(data: &[u8], format: PaletteFormat) -> Result<Palette> {
        if data.len() < PALETTE_BLOCK_SIZE {
            return Err(Error::TruncatedSection(format!(
                "palette block is {} bytes, expected {}",
                data.len(),
                PALETTE_BLOCK_SIZE
            )));
        }

        let mut colors = Vec::with_capacity(COLORS_PER_PALETTE);
        let mut is_zero = Vec::with_capacity(COLORS_PER_PALETTE);
        for i in 0..COLORS_PER_PALETTE {
            let raw = u16_le(data, i * 2)?;
            colors.push(from_ps_color(raw));
            let zero = match format {
                PaletteFormat::Ps => raw == 0,
                // PC blocks start from the same rule; the alpha stream,
                // when present, then clears flags per index.
                PaletteFormat::Pc => raw == 0,
            };
            is_zero.push(zero);
        }

        Ok(Palette { colors, is_zero })
    }

    /// Overrides the transparent flags from a PC alpha stream: one byte
    /// per color, nonzero meaning the index is visible even when its raw
    /// color is zero.
    pub fn apply_alpha_flags(&mut self, flags: &[u8]) {
        for (i, &flag) in flags.iter().take(COLORS_PER_PALETTE).enumerate() {
            if flag != 0 {
                self.is_zero[i] = false;
            }
        }
    }

    pub fn color(&self, index: u8) -> u32 {
        self.colors[index as usize]
    }

    pub fn is_zero(&self, index: u8) -> bool {
        self.is_zero[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::{from_ps_color, Palette, PaletteFormat, PALETTE_BLOCK_SIZE};

    #[test]
    fn expands_15_bit_channels() {
        // Pure red, max intensity: 5-bit 31 -> 8-bit 255.
        assert_eq!(from_ps_color(0x001F), 0xFFFF0000);
        // Pure blue sits in the high bits on disk.
        assert_eq!(from_ps_color(0x7C00), 0xFF0000FF);
        // Mid grey rounds rather than truncates: 16*255/31 = 131.6 -> 132.
        let grey = from_ps_color(0x4210); // 16,16,16
        assert_eq!(grey, 0xFF848484);
    }

    #[test]
    fn flags_zero_entries_transparent() {
        let mut block = vec![0u8; PALETTE_BLOCK_SIZE];
        // Entry 1 = opaque black (alpha-ish bit set, channels zero).
        block[2] = 0x00;
        block[3] = 0x80;
        let pal = Palette::decode(&block, PaletteFormat::Ps).unwrap();
        assert!(pal.is_zero(0));
        assert!(!pal.is_zero(1));
        assert_eq!(pal.color(1) & 0x00FF_FFFF, 0);
    }

    #[test]
    fn pc_alpha_flags_override_zero_detection() {
        let block = vec![0u8; PALETTE_BLOCK_SIZE];
        let mut pal = Palette::decode(&block, PaletteFormat::Pc).unwrap();
        assert!(pal.is_zero(5));
        let mut flags = vec![0u8; 256];
        flags[5] = 1;
        pal.apply_alpha_flags(&flags);
        assert!(!pal.is_zero(5));
        assert!(pal.is_zero(6));
    }

    #[test]
    fn rejects_short_block() {
        assert!(Palette::decode(&[0u8; 100], PaletteFormat::Ps).is_err());
    }
}
