//! PS background compositor. A field background is split across two
//! members: the MIM (palettes plus one or two texture pages) and the
//! field DAT, whose third section holds the tile map. Tiles come in
//! three record shapes (8, 14 and 10 bytes); a marker stream ahead of
//! them records where one texture page's or one tile layer's run ends.
//!
//! Compositing walks the accepted tiles in draw order and paints them
//! into an RGBA buffer sized to their bounding box. Any read past the
//! end of either buffer aborts the whole render; a garbled half-image
//! is worse than none.

use std::collections::HashMap;

use crate::field::HEADER_SIZE;
use crate::palette::{self, Palette, PaletteFormat, PALETTE_BLOCK_SIZE};
use crate::{i16_le, u16_le, u32_le, Error, Result};
use image::RgbaImage;

/// Game-state flags gating parametric tiles: `param -> state bits`.
pub type ActiveParams = HashMap<u8, u8>;

/// Marker closing a tile layer in the marker stream.
const LAYER_SENTINEL: i16 = 0x7FFF;
/// Marker closing a texture-page run.
const TEXTURE_SENTINEL: i16 = 0x7FFE;
/// Target coordinates at or past this magnitude are placeholders.
const COORD_LIMIT: i32 = 1000;

/// One 12-byte texture page header. `w` is stored halved on disk.
#[derive(Debug, Clone, Copy)]
struct PageHeader {
    size: u32,
    x: u16,
    w: u16,
}

fn parse_page_header(data: &[u8], pos: usize) -> Result<PageHeader> {
    Ok(PageHeader {
        size: u32_le(data, pos)?,
        x: u16_le(data, pos + 4)?,
        w: u16_le(data, pos + 8)?,
    })
}

/// Texture selector halfword carried by 14-byte tiles and by the flat
/// list the other layers walk: page coordinates, transparency type and
/// pixel depth packed into the low 9 bits.
#[derive(Debug, Clone, Copy, Default)]
struct TextureInfo {
    page_x: u8,
    page_y: u8,
    trans_type: u8,
    depth: u8,
}

impl TextureInfo {
    fn decode(v: u16) -> TextureInfo {
        TextureInfo {
            page_x: (v & 0x0F) as u8,
            page_y: ((v >> 4) & 0x01) as u8,
            trans_type: ((v >> 5) & 0x03) as u8,
            depth: ((v >> 7) & 0x03) as u8,
        }
    }
}

/// The 8-byte position prefix shared by all three tile record shapes.
#[derive(Debug, Clone, Copy)]
struct TilePrefix {
    dst_x: i16,
    dst_y: i16,
    src_x: u16,
    src_y: u16,
    palette_id: u16,
}

fn parse_prefix(data: &[u8], pos: usize) -> Result<TilePrefix> {
    Ok(TilePrefix {
        dst_x: i16_le(data, pos)?,
        dst_y: i16_le(data, pos + 2)?,
        src_x: *data.get(pos + 4).ok_or_else(|| range_err(pos + 4, data.len()))? as u16,
        src_y: *data.get(pos + 5).ok_or_else(|| range_err(pos + 5, data.len()))? as u16,
        palette_id: u16_le(data, pos + 6)?,
    })
}

fn range_err(pos: usize, len: usize) -> Error {
    Error::TruncatedSection(format!("tile record at {} exceeds buffer of {} bytes", pos, len))
}

impl TilePrefix {
    fn in_window(&self) -> bool {
        (self.dst_x as i32).abs() < COORD_LIMIT || (self.dst_y as i32).abs() < COORD_LIMIT
    }
}

/// A tile accepted for rendering, in the unified shape all layers share.
#[derive(Debug, Clone, Copy)]
struct Tile {
    prefix: TilePrefix,
    tex: TextureInfo,
    blend: bool,
    size: u16,
}

/// Sub-offsets of the background section inside the DAT payload:
/// `base` is where the section starts, `o1..o4` are relative to it,
/// `o5` is the section length.
struct BgLayout {
    base: usize,
    o: [u32; 5],
}

fn background_layout(dat: &[u8]) -> Result<BgLayout> {
    let toc0 = u32_le(dat, 0)?;
    let toc2 = u32_le(dat, 8)?;
    let toc3 = u32_le(dat, 12)?;

    let base = (toc2
        .checked_sub(toc0)
        .ok_or_else(|| {
            Error::UnsupportedFormat("background section offset below section 1".to_string())
        })?
        + HEADER_SIZE) as usize;

    let o = [
        u32_le(dat, base)?,
        u32_le(dat, base + 4)?,
        u32_le(dat, base + 8)?,
        u32_le(dat, base + 12)?,
        toc3.checked_sub(toc2).ok_or_else(|| {
            Error::UnsupportedFormat("camera section offset below background".to_string())
        })?,
    ];

    if o[0] < 16 {
        return Err(Error::UnsupportedFormat(format!(
            "tile sub-offset table overlaps itself (first offset {})",
            o[0]
        )));
    }
    for i in 1..o.len() {
        if o[i] < o[i - 1] {
            return Err(Error::UnsupportedFormat(format!(
                "tile sub-offsets decrease at index {} ({} < {})",
                i,
                o[i],
                o[i - 1]
            )));
        }
    }

    match base.checked_add(o[4] as usize) {
        Some(end) if end <= dat.len() => Ok(BgLayout { base, o }),
        _ => Err(Error::TruncatedSection(format!(
            "background section {}..{} exceeds payload of {} bytes",
            base,
            base as u64 + o[4] as u64,
            dat.len()
        ))),
    }
}

/// Walks the marker stream between the sub-offset table and the first
/// tile array, recovering the cumulative tile counts at which a texture
/// page run or a tile layer ends.
fn scan_markers(dat: &[u8], layout: &BgLayout) -> Result<(Vec<u32>, Vec<u32>)> {
    let base = layout.base;
    let mut tex_bounds = Vec::new();
    let mut layer_bounds = Vec::new();

    let mut tile_pos: u16 = 0;
    let mut tile_count: u16 = 0;

    let mut i = 16usize;
    while (i as u32) < layout.o[0] {
        let marker = i16_le(dat, base + i)?;

        if marker == LAYER_SENTINEL {
            layer_bounds.push(tile_pos as u32 + tile_count as u32);
        } else {
            if marker == TEXTURE_SENTINEL {
                // Counts precede the sentinel.
                tile_pos = u16_le(dat, base + i - 4)?;
                tile_count = u16_le(dat, base + i - 2)?;
                tex_bounds.push(tile_pos as u32 + tile_count as u32);
            } else {
                tile_pos = u16_le(dat, base + i + 2)?;
                tile_count = u16_le(dat, base + i + 4)?;
            }
            i += 4;
        }
        i += 2;
    }

    Ok((tex_bounds, layer_bounds))
}

/// Scans the parametric tile arrays and ORs together every `state` bit
/// seen per `param`; also reports which of the three parametric layers
/// hold any in-window tiles.
pub fn used_params(dat: &[u8]) -> Result<(HashMap<u8, u8>, [bool; 3])> {
    let layout = background_layout(dat)?;
    let (_, layer_bounds) = scan_markers(dat, &layout)?;
    let base = layout.base;
    let [o1, o2, o3, o4, o5] = layout.o;

    let mut params: HashMap<u8, u8> = HashMap::new();
    let mut layer_exists = [false; 3];

    let mut tile_id = (o2 - o1) as u64 / 8;

    let count = (o4 - o3) / 14;
    layer_exists[0] = count > 0;
    for i in 0..count as usize {
        let rec = base + o3 as usize + i * 14;
        let prefix = parse_prefix(dat, rec)?;
        if prefix.in_window() {
            let param = *dat.get(rec + 12).ok_or_else(|| range_err(rec + 12, dat.len()))?;
            let state = *dat.get(rec + 13).ok_or_else(|| range_err(rec + 13, dat.len()))?;
            if param != 0 {
                *params.entry(param).or_insert(0) |= state;
            }
        }
        tile_id += 1;
    }

    let mut layer_id = 2usize;
    let count = (o5 - o4) / 10;
    for i in 0..count as usize {
        let rec = base + o4 as usize + i * 10;
        let prefix = parse_prefix(dat, rec)?;
        if prefix.in_window() {
            let extra = *dat.get(rec + 8).ok_or_else(|| range_err(rec + 8, dat.len()))?;
            let state = *dat.get(rec + 9).ok_or_else(|| range_err(rec + 9, dat.len()))?;
            let param = extra & 0x7F;
            if param != 0 {
                *params.entry(param).or_insert(0) |= state;
            }

            if layer_id + 1 < layer_bounds.len() && tile_id >= layer_bounds[layer_id] as u64 {
                layer_id += 1;
            }
            if layer_id - 1 < 3 {
                layer_exists[layer_id - 1] = true;
            }
        }
        tile_id += 1;
    }

    Ok((params, layer_exists))
}

fn passes_params(param: u8, state: u8, active: &ActiveParams) -> bool {
    param == 0 || active.get(&param).copied().unwrap_or(0) & state != 0
}

/// Blends a freshly decoded tile pixel over the existing destination,
/// per the console's semi-transparency modes.
fn blend_color(trans_type: u8, dst: u32, src: u32) -> u32 {
    let (dr, dg, db) = ((dst >> 16) & 0xFF, (dst >> 8) & 0xFF, dst & 0xFF);
    let (sr, sg, sb) = ((src >> 16) & 0xFF, (src >> 8) & 0xFF, src & 0xFF);

    let (r, g, b) = match trans_type {
        1 => (
            (dr + sr).min(255),
            (dg + sg).min(255),
            (db + sb).min(255),
        ),
        2 => (
            dr.saturating_sub(sr),
            dg.saturating_sub(sg),
            db.saturating_sub(sb),
        ),
        3 => (
            (dr + sr / 4).min(255),
            (dg + sg / 4).min(255),
            (db + sb / 4).min(255),
        ),
        _ => ((dr + sr) / 2, (dg + sg) / 2, (db + sb) / 2),
    };

    0xFF00_0000 | (r << 16) | (g << 8) | b
}

/// Reconstructs the background image.
///
/// `active_params` carries the game-state bits that switch parametric
/// tiles on. `z_override` forces the draw order of the two 32-size
/// layers when not `-1`. `layer_filter`, when given, drops whole layers
/// (base, parametric, and the two large-tile layers).
///
/// Returns `Ok(None)` when the tile map holds no visible tiles.
pub fn composite(
    mim: &[u8],
    dat: &[u8],
    active_params: &ActiveParams,
    z_override: [i16; 2],
    layer_filter: Option<[bool; 4]>,
) -> Result<Option<RgbaImage>> {
    if mim.is_empty() || dat.is_empty() {
        return Ok(None);
    }

    // Texture side: palette page, image page, optional effect page.
    let header_pal = parse_page_header(mim, 0)?;
    let pal_count = u16_le(mim, 10)? as usize;

    let mut palettes = Vec::with_capacity(pal_count);
    for i in 0..pal_count {
        let start = 12 + i * PALETTE_BLOCK_SIZE;
        let block = mim
            .get(start..start + PALETTE_BLOCK_SIZE)
            .ok_or_else(|| range_err(start, mim.len()))?;
        palettes.push(Palette::decode(block, PaletteFormat::Ps)?);
    }

    let mut header_img = parse_page_header(mim, header_pal.size as usize)?;
    header_img.w *= 2;

    let effect_pos = (header_pal.size + header_img.size) as usize;
    let header_effect = if effect_pos + 12 < mim.len() {
        let mut h = parse_page_header(mim, effect_pos)?;
        h.w *= 2;
        h
    } else {
        PageHeader { size: 4, x: 0, w: 0 }
    };

    // Tile side.
    let layout = background_layout(dat)?;
    let (tex_bounds, layer_bounds) = scan_markers(dat, &layout)?;
    let base = layout.base;
    let [o1, o2, o3, o4, o5] = layout.o;

    let tex_count = (o3 - o2) as usize / 2;
    let mut tex_infos = Vec::with_capacity(tex_count);
    for i in 0..tex_count {
        tex_infos.push(TextureInfo::decode(u16_le(dat, base + o2 as usize + i * 2)?));
    }
    if tex_infos.is_empty() {
        return Ok(None);
    }

    // (draw key, tile) pairs; a stable sort keeps insertion order for
    // equal keys.
    let mut tiles: Vec<(i32, Tile)> = Vec::new();
    let mut tile_id: u64 = 0;
    let mut tex_id: usize = 0;

    // Layer 0: 8-byte records, no param gating, bottom group.
    let count = (o2 - o1) as usize / 8;
    for i in 0..count {
        let prefix = parse_prefix(dat, base + o1 as usize + i * 8)?;
        if prefix.in_window() {
            if tex_id + 1 < tex_infos.len()
                && tex_id + 1 < tex_bounds.len()
                && tile_id >= tex_bounds[tex_id] as u64
            {
                tex_id += 1;
            }

            if layer_filter.map_or(true, |f| f[0]) {
                tiles.push((
                    4096 - 4095,
                    Tile {
                        prefix,
                        tex: tex_infos[tex_id],
                        blend: false,
                        size: 16,
                    },
                ));
            }
        }
        tile_id += 1;
    }

    // Layer 1: 14-byte records carrying their own texture halfword and
    // the param/state/blend/group block.
    let count = (o4 - o3) as usize / 14;
    for i in 0..count {
        let rec = base + o3 as usize + i * 14;
        let prefix = parse_prefix(dat, rec)?;
        if prefix.in_window() {
            let tex = TextureInfo::decode(u16_le(dat, rec + 8)?);
            let group = *dat.get(rec + 10).ok_or_else(|| range_err(rec + 10, dat.len()))?;
            let flags = *dat.get(rec + 11).ok_or_else(|| range_err(rec + 11, dat.len()))?;
            let param = *dat.get(rec + 12).ok_or_else(|| range_err(rec + 12, dat.len()))?;
            let state = *dat.get(rec + 13).ok_or_else(|| range_err(rec + 13, dat.len()))?;

            if passes_params(param, state, active_params) && layer_filter.map_or(true, |f| f[1]) {
                tiles.push((
                    4096 - group as i32,
                    Tile {
                        prefix,
                        tex,
                        blend: flags & 1 != 0,
                        size: 16,
                    },
                ));
            }
        }
        tile_id += 1;
    }

    // Layers 2 and 3: 10-byte records, 32-unit tiles. Texture info and
    // layer id advance as the running tile index crosses the boundary
    // lists recovered from the marker stream.
    let mut layer_id = 2usize;
    let count = (o5 - o4) as usize / 10;
    for i in 0..count {
        let rec = base + o4 as usize + i * 10;
        let prefix = parse_prefix(dat, rec)?;
        if prefix.in_window() {
            let extra = *dat.get(rec + 8).ok_or_else(|| range_err(rec + 8, dat.len()))?;
            let state = *dat.get(rec + 9).ok_or_else(|| range_err(rec + 9, dat.len()))?;
            let param = extra & 0x7F;
            let blend = extra & 0x80 != 0;

            if tex_id + 1 < tex_infos.len()
                && tex_id + 1 < tex_bounds.len()
                && tile_id >= tex_bounds[tex_id] as u64
            {
                tex_id += 1;
            }
            if layer_id + 1 < layer_bounds.len() && tile_id >= layer_bounds[layer_id] as u64 {
                layer_id += 1;
            }

            if passes_params(param, state, active_params) {
                let group: i32 = if layer_id == 2 { 4096 } else { 0 };
                let z = z_override[usize::from(layer_id != 2)];
                let key = 4096 - if z != -1 { z as i32 } else { group };

                if layer_filter.map_or(true, |f| layer_id > 3 || f[layer_id]) {
                    tiles.push((
                        key,
                        Tile {
                            prefix,
                            tex: tex_infos[tex_id],
                            blend,
                            size: 32,
                        },
                    ));
                }
            }
        }
        tile_id += 1;
    }

    if tiles.is_empty() {
        return Ok(None);
    }

    // Bounding box over the accepted tiles. Positive excursions of the
    // large tiles reach 16 units further; the final +16 covers the rest
    // of every tile's extent.
    let (mut pos_x, mut neg_x, mut pos_y, mut neg_y) = (0i32, 0i32, 0i32, 0i32);
    for (_, tile) in &tiles {
        let overhang = if tile.size == 32 { 16 } else { 0 };
        let x = tile.prefix.dst_x as i32;
        let y = tile.prefix.dst_y as i32;
        if x >= 0 {
            pos_x = pos_x.max(x + overhang);
        } else {
            neg_x = neg_x.max(-x);
        }
        if y >= 0 {
            pos_y = pos_y.max(y + overhang);
        } else {
            neg_y = neg_y.max(-y);
        }
    }

    let width = (neg_x + pos_x + 16) as usize;
    let height = (neg_y + pos_y + 16) as usize;
    let mut pixels = vec![0xFF00_0000u32; width * height];

    tiles.sort_by_key(|&(key, _)| key);

    for (_, tile) in &tiles {
        let effect = tile.tex.page_y != 0;
        let page = if effect { &header_effect } else { &header_img };
        let page_width = page.w as usize;
        if page_width == 0 {
            return Err(Error::TruncatedSection(
                "tile addresses a texture page with zero width".to_string(),
            ));
        }

        let page_index = tile.tex.page_x as i64 - (page.x / 64) as i64;
        let depth = tile.tex.depth as usize;
        let origin = header_pal.size as i64
            + 12
            + if effect { header_img.size as i64 } else { 0 }
            + tile.prefix.src_y as i64 * page_width as i64
            + tile.prefix.src_x as i64 * depth as i64
            + page_index * 128;
        if origin < 0 {
            return Err(Error::TruncatedSection(
                "tile texture origin is before the start of the image data".to_string(),
            ));
        }
        let origin = origin as usize;

        let size = tile.size as usize;
        let dst_x = (neg_x + tile.prefix.dst_x as i32) as usize;
        let dst_y = (neg_y + tile.prefix.dst_y as i32) as usize;

        match depth {
            2 => {
                for row in 0..size {
                    let src_row = origin + row * page_width;
                    let dst_row = (dst_y + row) * width + dst_x;
                    for col in 0..size {
                        let color = u16_le(mim, src_row + col * 2)?;
                        if color != 0 {
                            if let Some(px) = pixels.get_mut(dst_row + col) {
                                *px = palette::from_ps_color(color);
                            }
                        }
                    }
                }
            }
            1 => {
                let palette = palettes
                    .get(tile.prefix.palette_id as usize)
                    .ok_or(Error::PaletteIndexOutOfRange {
                        index: tile.prefix.palette_id,
                        loaded: palettes.len(),
                    })?;

                for row in 0..size {
                    let src_row = origin + row * page_width;
                    let dst_row = (dst_y + row) * width + dst_x;
                    for col in 0..size {
                        let index = *mim
                            .get(src_row + col)
                            .ok_or_else(|| range_err(src_row + col, mim.len()))?;
                        if palette.is_zero(index) {
                            continue;
                        }
                        if let Some(px) = pixels.get_mut(dst_row + col) {
                            *px = if tile.blend {
                                blend_color(tile.tex.trans_type, *px, palette.color(index))
                            } else {
                                palette.color(index)
                            };
                        }
                    }
                }
            }
            other => {
                return Err(Error::UnsupportedFormat(format!(
                    "tile pixel depth {} is not renderable",
                    other
                )));
            }
        }
    }

    let mut image = RgbaImage::new(width as u32, height as u32);
    for (i, px) in image.pixels_mut().enumerate() {
        let argb = pixels[i];
        *px = image::Rgba([
            ((argb >> 16) & 0xFF) as u8,
            ((argb >> 8) & 0xFF) as u8,
            (argb & 0xFF) as u8,
            ((argb >> 24) & 0xFF) as u8,
        ]);
    }

    Ok(Some(image))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One tile's worth of input to the fixture builder.
    struct TestTile {
        layer: u8,
        dst: (i16, i16),
        src: (u16, u16),
        palette_id: u16,
        tex: u16,
        group: u8,
        blend: bool,
        param: u8,
        state: u8,
    }

    impl TestTile {
        fn base(layer: u8, dst: (i16, i16)) -> TestTile {
            TestTile {
                layer,
                dst,
                src: (0, 0),
                palette_id: 0,
                // page_x = 0, page_y = 0, trans 0, depth 1 (8-bit).
                tex: 1 << 7,
                group: 0,
                blend: false,
                param: 0,
                state: 0,
            }
        }
    }

    fn prefix_bytes(t: &TestTile) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&t.dst.0.to_le_bytes());
        out.extend_from_slice(&t.dst.1.to_le_bytes());
        out.push(t.src.0 as u8);
        out.push(t.src.1 as u8);
        out.extend_from_slice(&t.palette_id.to_le_bytes());
        out
    }

    /// Builds a MIM: one or more palettes, then a 64-byte-wide image
    /// page with the given pixel rows.
    fn build_mim(palettes: &[Vec<u16>], img_data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let pal_size = 12 + palettes.len() * PALETTE_BLOCK_SIZE;
        out.extend_from_slice(&(pal_size as u32).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // x
        out.extend_from_slice(&0u16.to_le_bytes()); // y
        out.extend_from_slice(&0u16.to_le_bytes()); // w
        out.extend_from_slice(&(palettes.len() as u16).to_le_bytes()); // h

        for pal in palettes {
            let mut block = vec![0u8; PALETTE_BLOCK_SIZE];
            for (i, &c) in pal.iter().enumerate() {
                block[i * 2..i * 2 + 2].copy_from_slice(&c.to_le_bytes());
            }
            out.extend_from_slice(&block);
        }

        out.extend_from_slice(&((12 + img_data.len()) as u32).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // x: page index 0
        out.extend_from_slice(&0u16.to_le_bytes()); // y
        out.extend_from_slice(&32u16.to_le_bytes()); // w halved: 64 bytes
        out.extend_from_slice(&1u16.to_le_bytes()); // h
        out.extend_from_slice(img_data);
        out
    }

    /// Builds a DAT whose background section holds the given tiles.
    /// The marker stream declares one texture run and one layer bound,
    /// both far past the tile count so no mid-list advance fires.
    fn build_dat(tiles: &[TestTile]) -> Vec<u8> {
        let mut layer0 = Vec::new();
        let mut layer1 = Vec::new();
        let mut layer23 = Vec::new();
        let mut tex_halfword = 1u16 << 7;

        for t in tiles {
            match t.layer {
                0 => {
                    tex_halfword = t.tex;
                    layer0.extend_from_slice(&prefix_bytes(t));
                }
                1 => {
                    layer1.extend_from_slice(&prefix_bytes(t));
                    layer1.extend_from_slice(&t.tex.to_le_bytes());
                    layer1.push(t.group);
                    layer1.push(t.blend as u8);
                    layer1.push(t.param);
                    layer1.push(t.state);
                }
                _ => {
                    tex_halfword = t.tex;
                    layer23.extend_from_slice(&prefix_bytes(t));
                    layer23.push((t.param & 0x7F) | ((t.blend as u8) << 7));
                    layer23.push(t.state);
                }
            }
        }

        // Marker stream: one plain marker announcing a huge run (so no
        // mid-list advance fires), a texture sentinel that reads those
        // counts back from the bytes before it and skips the next four,
        // then end-of-layer.
        let mut markers = Vec::new();
        markers.extend_from_slice(&1i16.to_le_bytes());
        markers.extend_from_slice(&1000u16.to_le_bytes());
        markers.extend_from_slice(&0u16.to_le_bytes());
        markers.extend_from_slice(&TEXTURE_SENTINEL.to_le_bytes());
        markers.extend_from_slice(&0u32.to_le_bytes()); // skipped
        markers.extend_from_slice(&LAYER_SENTINEL.to_le_bytes());

        let o1 = 16 + markers.len() as u32;
        let o2 = o1 + layer0.len() as u32;
        let o3 = o2 + 2; // single texture halfword
        let o4 = o3 + layer1.len() as u32;
        let o5 = o4 + layer23.len() as u32;

        let mut section = Vec::new();
        section.extend_from_slice(&o1.to_le_bytes());
        section.extend_from_slice(&o2.to_le_bytes());
        section.extend_from_slice(&o3.to_le_bytes());
        section.extend_from_slice(&o4.to_le_bytes());
        section.extend_from_slice(&markers);
        section.extend_from_slice(&layer0);
        section.extend_from_slice(&tex_halfword.to_le_bytes());
        section.extend_from_slice(&layer1);
        section.extend_from_slice(&layer23);

        // DAT payload: directory plus two dummy sections so the
        // background sits at toc[2].
        let s1 = b"scripts".to_vec();
        let s2 = b"mesh".to_vec();
        let mut toc = [0u32; 7];
        toc[0] = HEADER_SIZE;
        toc[1] = toc[0] + s1.len() as u32;
        toc[2] = toc[1] + s2.len() as u32;
        toc[3] = toc[2] + o5;
        let toc3 = toc[3];
        for slot in toc.iter_mut().skip(4) {
            *slot = toc3;
        }

        let mut dat = Vec::new();
        for offset in toc {
            dat.extend_from_slice(&offset.to_le_bytes());
        }
        dat.extend_from_slice(&s1);
        dat.extend_from_slice(&s2);
        dat.extend_from_slice(&section);
        dat
    }

    /// Palette 0: index 0 transparent, index 1 pure red, index 2 blue.
    fn default_palettes() -> Vec<Vec<u16>> {
        vec![vec![0x0000, 0x001F, 0x7C00]]
    }

    /// 64-byte-wide, 32-row 8-bit page filled with palette index `index`.
    fn flat_page(index: u8) -> Vec<u8> {
        vec![index; 64 * 32]
    }

    fn rgba(image: &RgbaImage, x: u32, y: u32) -> [u8; 4] {
        image.get_pixel(x, y).0
    }

    #[test]
    fn renders_a_single_opaque_tile() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let dat = build_dat(&[TestTile::base(0, (0, 0))]);

        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        assert_eq!(image.dimensions(), (16, 16));
        assert_eq!(rgba(&image, 0, 0), [255, 0, 0, 255]);
        assert_eq!(rgba(&image, 15, 15), [255, 0, 0, 255]);
    }

    #[test]
    fn param_gating_follows_active_state_bits() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let mut tile = TestTile::base(1, (0, 0));
        tile.param = 5;
        tile.state = 0b0010;
        let dat = build_dat(&[tile]);

        let mut active = ActiveParams::new();
        active.insert(5, 0b0010);
        assert!(composite(&mim, &dat, &active, [-1, -1], None)
            .unwrap()
            .is_some());

        let mut inactive = ActiveParams::new();
        inactive.insert(5, 0b0001);
        assert!(composite(&mim, &dat, &inactive, [-1, -1], None)
            .unwrap()
            .is_none());
        assert!(composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn param_zero_tiles_always_render() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let mut tile = TestTile::base(1, (0, 0));
        tile.param = 0;
        tile.state = 0b1000;
        let dat = build_dat(&[tile]);

        assert!(composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn bounding_box_from_excursions() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let dat = build_dat(&[
            TestTile::base(1, (10, 10)),
            TestTile::base(1, (-20, 5)),
            TestTile::base(1, (0, -30)),
        ]);

        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        // width = 20 + 10 + 16, height = 30 + 10 + 16.
        assert_eq!(image.dimensions(), (46, 56));
    }

    #[test]
    fn out_of_window_tiles_are_placeholders() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let dat = build_dat(&[
            TestTile::base(0, (0, 0)),
            TestTile::base(0, (5000, 5000)),
        ]);
        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        assert_eq!(image.dimensions(), (16, 16));
    }

    #[test]
    fn zero_palette_indices_leave_destination_untouched() {
        // Page filled with index 0, whose raw color is zero.
        let mim = build_mim(&default_palettes(), &flat_page(0));
        let dat = build_dat(&[TestTile::base(0, (0, 0))]);

        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        // Fill color is opaque black.
        assert_eq!(rgba(&image, 8, 8), [0, 0, 0, 255]);
    }

    #[test]
    fn depth_two_copies_nonzero_direct_color() {
        // 16-bit page: rows of 0x001F (red) halfwords, one zero hole.
        let mut page = Vec::new();
        for row in 0..32 {
            for col in 0..32 {
                let halfword: u16 = if row == 0 && col == 1 { 0 } else { 0x001F };
                page.extend_from_slice(&halfword.to_le_bytes());
            }
        }
        let mim = build_mim(&default_palettes(), &page);
        let mut tile = TestTile::base(0, (0, 0));
        tile.tex = 2 << 7; // depth 2
        let dat = build_dat(&[tile]);

        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        assert_eq!(rgba(&image, 0, 0), [255, 0, 0, 255]);
        // The zero halfword leaves the fill color through.
        assert_eq!(rgba(&image, 1, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn blended_tiles_combine_with_destination() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        // Bottom: opaque red base tile. Top: blending additive tile of
        // the same red source.
        let bottom = TestTile::base(0, (0, 0));
        let mut top = TestTile::base(1, (0, 0));
        top.blend = true;
        top.tex = (1 << 7) | (1 << 5); // depth 1, trans type 1
        let dat = build_dat(&[bottom, top]);

        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        // red + red saturates at 255; stays pure red.
        assert_eq!(rgba(&image, 3, 3), [255, 0, 0, 255]);
    }

    #[test]
    fn blend_color_modes() {
        let grey = 0xFF80_8080;
        let red = 0xFFFF_0000;
        assert_eq!(blend_color(0, grey, red), 0xFFBF_4040);
        assert_eq!(blend_color(1, grey, red), 0xFFFF_8080);
        assert_eq!(blend_color(2, grey, red), 0xFF00_8080);
        assert_eq!(blend_color(3, grey, red), 0xFFBF_8080);
    }

    #[test]
    fn z_override_reorders_large_layers() {
        // Palette 0 paints red, palette 1 paints blue, both from the
        // same page of 1s: the small base tile is red, the large
        // layer-2 tile is blue.
        let palettes = vec![vec![0x0000, 0x001F], vec![0x0000, 0x7C00]];
        let mim = build_mim(&palettes, &flat_page(1));

        let mut large = TestTile::base(2, (0, 0));
        large.palette_id = 1;
        let dat = build_dat(&[TestTile::base(0, (0, 0)), large]);

        // Natural order: the layer-2 group (4096) keys below layer 0,
        // so red wins on the overlap and blue fills the rest.
        let image = composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .unwrap();
        // 32-unit tile at the origin: 16 overhang + the final 16.
        assert_eq!(image.dimensions(), (32, 32));
        assert_eq!(rgba(&image, 2, 2), [255, 0, 0, 255]);
        assert_eq!(rgba(&image, 20, 20), [0, 0, 255, 255]);

        // Forcing z = 0 keys the large layer above everything.
        let forced = composite(&mim, &dat, &ActiveParams::new(), [0, -1], None)
            .unwrap()
            .unwrap();
        assert_eq!(rgba(&forced, 2, 2), [0, 0, 255, 255]);
    }

    #[test]
    fn missing_palette_is_a_typed_error() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let mut tile = TestTile::base(0, (0, 0));
        tile.palette_id = 7;
        let dat = build_dat(&[tile]);

        match composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None) {
            Err(Error::PaletteIndexOutOfRange { index: 7, loaded: 1 }) => {}
            other => panic!("expected palette error, got {:?}", other.err()),
        }
    }

    #[test]
    fn truncated_tile_section_aborts_the_render() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let mut dat = build_dat(&[TestTile::base(0, (0, 0))]);
        // Push the camera offset (toc[3]) far out so the background
        // section claims more tile bytes than the payload holds.
        let bigger = u32_le(&dat, 12).unwrap() + 500;
        dat[12..16].copy_from_slice(&bigger.to_le_bytes());

        assert!(matches!(
            composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None),
            Err(Error::TruncatedSection(_))
        ));
    }

    #[test]
    fn empty_texture_list_yields_no_image() {
        let mim = build_mim(&default_palettes(), &flat_page(1));
        let mut dat = build_dat(&[TestTile::base(0, (0, 0))]);
        // Collapse o3 onto o2: zero texture halfwords.
        let base_o2 = u32_le(&dat, 8).unwrap(); // toc[2]
        let toc0 = u32_le(&dat, 0).unwrap();
        let base = (base_o2 - toc0 + HEADER_SIZE) as usize;
        let o2 = u32_le(&dat, base + 4).unwrap();
        dat[base + 8..base + 12].copy_from_slice(&o2.to_le_bytes());
        // o4 must stay ordered; collapse it too so layer 1 is empty.
        dat[base + 12..base + 16].copy_from_slice(&o2.to_le_bytes());

        assert!(composite(&mim, &dat, &ActiveParams::new(), [-1, -1], None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn marker_stream_boundaries() {
        let dat = build_dat(&[TestTile::base(0, (0, 0))]);
        let layout = background_layout(&dat).unwrap();
        let (tex_bounds, layer_bounds) = scan_markers(&dat, &layout).unwrap();
        assert_eq!(tex_bounds, vec![1000]);
        assert_eq!(layer_bounds, vec![1000]);
    }

    #[test]
    fn used_params_collects_state_bits() {
        let mut a = TestTile::base(1, (0, 0));
        a.param = 3;
        a.state = 0b0001;
        let mut b = TestTile::base(1, (4, 0));
        b.param = 3;
        b.state = 0b0100;
        let mut c = TestTile::base(2, (0, 16));
        c.param = 9;
        c.state = 0b0010;
        let dat = build_dat(&[a, b, c]);

        let (params, layer_exists) = used_params(&dat).unwrap();
        assert_eq!(params.get(&3), Some(&0b0101));
        assert_eq!(params.get(&9), Some(&0b0010));
        assert!(layer_exists[0]);
        assert!(layer_exists[1]);
        assert!(!layer_exists[2]);
    }
}
