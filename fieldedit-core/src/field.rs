//! PS field files: `[u32 compressed size][LZS payload]`, where the
//! decompressed payload opens with seven little-endian u32 section
//! offsets (scripts+text, walkmesh, background tile map, camera,
//! triggers, encounters, model loader) followed by the section bytes.
//!
//! The offsets are stored relative to the start of the file as burned
//! onto the disc, while payload bytes begin right after the 28-byte
//! directory; `pad = toc[0] - 28` bridges the two. Saving rebuilds the
//! directory from running section lengths, copying untouched sections
//! verbatim so that a no-edit save is byte-identical.

use std::collections::HashMap;

use crate::background::{self, ActiveParams};
use crate::{lzs, u16_le, u32_le, Error, Result};
use image::RgbaImage;

/// Sections of a field file, in on-disk order.
pub const SECTION_COUNT: usize = 7;
/// The section directory occupies the first 28 bytes of the payload.
pub const HEADER_SIZE: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Scripts = 0,
    Walkmesh = 1,
    Background = 2,
    Camera = 3,
    Triggers = 4,
    Encounters = 5,
    ModelLoader = 6,
}

/// The parsed section directory: seven file-start-relative offsets.
#[derive(Debug, Clone)]
pub struct SectionDirectory {
    toc: [u32; SECTION_COUNT],
}

impl SectionDirectory {
    /// Reads seven offsets from the head of a decompressed payload and
    /// validates them against the buffer they describe.
    pub fn parse(buf: &[u8]) -> Result<SectionDirectory> {
        let mut toc = [0u32; SECTION_COUNT];
        for (i, slot) in toc.iter_mut().enumerate() {
            *slot = u32_le(buf, i * 4)?;
        }

        if toc[0] < HEADER_SIZE {
            return Err(Error::UnsupportedFormat(format!(
                "first section offset {} is below the {}-byte directory",
                toc[0], HEADER_SIZE
            )));
        }
        for i in 1..SECTION_COUNT {
            if toc[i] < toc[i - 1] {
                return Err(Error::UnsupportedFormat(format!(
                    "section offsets decrease at index {} ({} < {})",
                    i,
                    toc[i],
                    toc[i - 1]
                )));
            }
        }

        let pad = toc[0] - HEADER_SIZE;
        let last = toc[SECTION_COUNT - 1] - pad;
        if last as usize > buf.len() {
            return Err(Error::TruncatedSection(format!(
                "section 7 starts at {} but the payload is {} bytes",
                last,
                buf.len()
            )));
        }

        Ok(SectionDirectory { toc })
    }

    pub fn offsets(&self) -> &[u32; SECTION_COUNT] {
        &self.toc
    }

    /// Disc-relative bias between stored offsets and payload positions.
    pub fn pad(&self) -> u32 {
        self.toc[0] - HEADER_SIZE
    }

    /// The byte range of section `index` inside the decompressed payload.
    /// The last section runs to end of buffer.
    pub fn slice_section<'a>(&self, buf: &'a [u8], index: usize) -> Result<&'a [u8]> {
        if index >= SECTION_COUNT {
            return Err(Error::TruncatedSection(format!(
                "section index {} out of range",
                index
            )));
        }
        let pad = self.pad();
        let start = (self.toc[index] - pad) as usize;
        let end = if index + 1 < SECTION_COUNT {
            (self.toc[index + 1] - pad) as usize
        } else {
            buf.len()
        };
        buf.get(start..end).ok_or_else(|| {
            Error::TruncatedSection(format!(
                "section {} range {}..{} exceeds payload of {} bytes",
                index,
                start,
                end,
                buf.len()
            ))
        })
    }

    /// Rebuilds a payload from replacement sections, recomputing each
    /// offset as a running total over the preserved `pad`.
    pub fn rebuild(&self, sections: &[Vec<u8>; SECTION_COUNT]) -> (SectionDirectory, Vec<u8>) {
        let pad = self.pad();
        let mut toc = [0u32; SECTION_COUNT];
        toc[0] = self.toc[0];

        let total: usize = sections.iter().map(Vec::len).sum();
        let mut body = Vec::with_capacity(HEADER_SIZE as usize + total);
        body.resize(HEADER_SIZE as usize, 0);

        for (i, section) in sections.iter().enumerate() {
            if i > 0 {
                toc[i] = HEADER_SIZE + (body.len() as u32 - HEADER_SIZE) + pad;
            }
            body.extend_from_slice(section);
        }

        for (i, offset) in toc.iter().enumerate() {
            body[i * 4..i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
        }

        (SectionDirectory { toc }, body)
    }
}

/// An editable sub-section (walkmesh, camera, triggers, encounters).
/// Holds the replacement bytes once an editor pushed them; until then
/// `save` yields nothing and the original bytes are copied verbatim.
#[derive(Debug, Clone, Default)]
pub struct RawSection {
    data: Option<Vec<u8>>,
}

impl RawSection {
    pub fn is_modified(&self) -> bool {
        self.data.is_some()
    }

    pub fn save(&self) -> Option<Vec<u8>> {
        self.data.clone()
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.data = Some(bytes);
    }

    pub fn clear(&mut self) {
        self.data = None;
    }
}

/// Directory of the 3D models a field references (section 7). Only the
/// per-model animation counts matter to background texture resolution;
/// geometry decoding lives outside this crate.
#[derive(Debug, Clone)]
pub struct ModelLoader {
    anim_counts: Vec<u8>,
}

impl ModelLoader {
    fn parse(dat: &[u8]) -> Result<ModelLoader> {
        let toc0 = u32_le(dat, 0)?;
        let toc6 = u32_le(dat, 24)?;
        let base = (toc6
            .checked_sub(toc0)
            .ok_or_else(|| {
                Error::UnsupportedFormat("model section offset below section 1".to_string())
            })?
            + HEADER_SIZE) as usize;

        let model_count = u16_le(dat, base + 2)? as usize;
        let mut anim_counts = Vec::with_capacity(model_count);
        for i in 0..model_count {
            let rec = base + 4 + i * 8;
            if rec + 8 > dat.len() {
                return Err(Error::TruncatedSection(format!(
                    "model record {} exceeds payload of {} bytes",
                    i,
                    dat.len()
                )));
            }
            anim_counts.push(dat[rec + 3]);
        }

        Ok(ModelLoader { anim_counts })
    }

    pub fn model_count(&self) -> usize {
        self.anim_counts.len()
    }

    pub fn anim_count(&self, model: usize) -> Option<u8> {
        self.anim_counts.get(model).copied()
    }
}

/// One field file, opened from its compressed on-disk form.
pub struct FieldFile {
    raw: Vec<u8>,
    section1_prefix: Vec<u8>,
    pub walkmesh: RawSection,
    pub camera: RawSection,
    pub triggers: RawSection,
    pub encounters: RawSection,
    model_loader: Option<ModelLoader>,
}

impl FieldFile {
    /// Validates the `[u32 size][payload]` framing and decompresses only
    /// far enough to cover the first section. The compressed bytes are
    /// retained for [`FieldFile::save`].
    pub fn open(file_data: Vec<u8>) -> Result<FieldFile> {
        let payload = compressed_payload(&file_data)?;

        // Two directory entries are enough to size section 1.
        let head = lzs::decompress(payload, 8)?;
        if head.len() < 8 {
            return Err(Error::TruncatedSection(
                "payload too short for a section directory".to_string(),
            ));
        }
        let toc0 = u32_le(&head, 0)?;
        let toc1 = u32_le(&head, 4)?;
        let extent = toc1
            .checked_sub(toc0)
            .ok_or_else(|| {
                Error::UnsupportedFormat("section offsets decrease at index 1".to_string())
            })?
            + HEADER_SIZE;

        let section1_prefix = lzs::decompress(payload, extent as usize)?;

        Ok(FieldFile {
            raw: file_data,
            section1_prefix,
            walkmesh: RawSection::default(),
            camera: RawSection::default(),
            triggers: RawSection::default(),
            encounters: RawSection::default(),
            model_loader: None,
        })
    }

    /// The decompressed prefix spanning the directory and section 1.
    pub fn section1_prefix(&self) -> &[u8] {
        &self.section1_prefix
    }

    /// Fully decompresses the original payload.
    pub fn decompress_all(&self) -> Result<Vec<u8>> {
        lzs::decompress(compressed_payload(&self.raw)?, 0)
    }

    /// Parses the model directory on first use and returns it.
    pub fn ensure_model_loader(&mut self, dat: &[u8]) -> Result<&ModelLoader> {
        if self.model_loader.is_none() {
            self.model_loader = Some(ModelLoader::parse(dat)?);
        }
        Ok(self.model_loader.as_ref().unwrap())
    }

    pub fn model_loader(&self) -> Option<&ModelLoader> {
        self.model_loader.as_ref()
    }

    /// Loads the model directory if needed, then composites the
    /// background out of the MIM texture data and this file's tile map.
    pub fn open_model_and_background(
        &mut self,
        mim_dec: &[u8],
        dat_dec: &[u8],
        active_params: &ActiveParams,
        z_override: [i16; 2],
    ) -> Result<Option<RgbaImage>> {
        if mim_dec.is_empty() || dat_dec.is_empty() {
            return Ok(None);
        }
        self.ensure_model_loader(dat_dec)?;
        background::composite(mim_dec, dat_dec, active_params, z_override, None)
    }

    /// Re-encodes the file. Sections whose editors report modifications
    /// are replaced by their `save` output; everything else is copied
    /// verbatim from the original decompressed payload, so a save with
    /// zero edits reproduces the input byte-for-byte.
    pub fn save(&self, compress: bool) -> Result<Vec<u8>> {
        let decompressed = self.decompress_all()?;
        let dir = SectionDirectory::parse(&decompressed)?;

        let mut sections: [Vec<u8>; SECTION_COUNT] = Default::default();
        for (i, slot) in sections.iter_mut().enumerate() {
            let editor = match i {
                i if i == SectionId::Walkmesh as usize => Some(&self.walkmesh),
                i if i == SectionId::Camera as usize => Some(&self.camera),
                i if i == SectionId::Triggers as usize => Some(&self.triggers),
                i if i == SectionId::Encounters as usize => Some(&self.encounters),
                _ => None,
            };
            let replaced = editor
                .filter(|e| e.is_modified())
                .and_then(|e| e.save());
            *slot = match replaced {
                Some(bytes) => bytes,
                None => dir.slice_section(&decompressed, i)?.to_vec(),
            };
        }

        let (_, body) = dir.rebuild(&sections);

        if compress {
            let packed = lzs::compress(&body);
            let mut out = Vec::with_capacity(4 + packed.len());
            out.extend_from_slice(&(packed.len() as u32).to_le_bytes());
            out.extend_from_slice(&packed);
            Ok(out)
        } else {
            Ok(body)
        }
    }

    /// Scans the background tile arrays and reports, per param, the OR
    /// of every `state` bit seen, plus which parametric layers contain
    /// any in-window tiles. Editors use this to offer layer toggles.
    pub fn used_params(dat_dec: &[u8]) -> Result<(HashMap<u8, u8>, [bool; 3])> {
        background::used_params(dat_dec)
    }
}

fn compressed_payload(file_data: &[u8]) -> Result<&[u8]> {
    let declared = u32_le(file_data, 0)?;
    if declared as u64 + 4 != file_data.len() as u64 {
        return Err(Error::SizeMismatch {
            declared,
            actual: file_data.len() as u64,
        });
    }
    Ok(&file_data[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a decompressed payload with the given per-section bodies
    /// and a directory biased by `pad`.
    fn build_payload(sections: &[&[u8]; SECTION_COUNT], pad: u32) -> Vec<u8> {
        let mut body = Vec::new();
        let mut toc = [0u32; SECTION_COUNT];
        let mut running = HEADER_SIZE;
        for (i, s) in sections.iter().enumerate() {
            toc[i] = running + pad;
            running += s.len() as u32;
        }
        for offset in toc {
            body.extend_from_slice(&offset.to_le_bytes());
        }
        for s in sections {
            body.extend_from_slice(s);
        }
        body
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let packed = lzs::compress(payload);
        let mut out = (packed.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&packed);
        out
    }

    fn sample_sections() -> [&'static [u8]; SECTION_COUNT] {
        [
            b"scripts-and-text-section-padding-padding",
            b"walkmesh-data",
            b"background-tilemap",
            b"camera-matrix",
            b"trigger-zones",
            b"encounter-rates",
            b"model-loader-tail",
        ]
    }

    #[test]
    fn slices_cover_the_whole_payload() {
        for pad in [0u32, 72] {
            let payload = build_payload(&sample_sections(), pad);
            let dir = SectionDirectory::parse(&payload).unwrap();
            assert_eq!(dir.pad(), pad);

            let mut rebuilt = payload[..HEADER_SIZE as usize].to_vec();
            for i in 0..SECTION_COUNT {
                rebuilt.extend_from_slice(dir.slice_section(&payload, i).unwrap());
            }
            assert_eq!(rebuilt, payload);
        }
    }

    #[test]
    fn open_reads_just_enough_for_section_one() {
        let payload = build_payload(&sample_sections(), 12);
        let field = FieldFile::open(frame(&payload)).unwrap();
        let prefix = field.section1_prefix();
        assert!(prefix.len() >= HEADER_SIZE as usize + sample_sections()[0].len());
        assert_eq!(&payload[..prefix.len()], prefix);
    }

    #[test]
    fn no_edit_save_is_byte_identical() {
        let payload = build_payload(&sample_sections(), 72);
        let original = frame(&payload);

        let field = FieldFile::open(original.clone()).unwrap();
        assert_eq!(field.save(false).unwrap(), payload);
        assert_eq!(field.save(true).unwrap(), original);
    }

    #[test]
    fn modified_walkmesh_shifts_later_offsets() {
        let payload = build_payload(&sample_sections(), 0);
        let mut field = FieldFile::open(frame(&payload)).unwrap();

        let replacement = b"walkmesh-data-but-longer-now".to_vec();
        field.walkmesh.set_bytes(replacement.clone());
        let saved = field.save(false).unwrap();

        let dir = SectionDirectory::parse(&saved).unwrap();
        assert_eq!(
            dir.slice_section(&saved, SectionId::Walkmesh as usize).unwrap(),
            &replacement[..]
        );
        // Untouched sections survive the shift.
        assert_eq!(
            dir.slice_section(&saved, SectionId::Camera as usize).unwrap(),
            sample_sections()[SectionId::Camera as usize]
        );
        assert_eq!(
            dir.slice_section(&saved, SectionId::ModelLoader as usize).unwrap(),
            sample_sections()[SectionId::ModelLoader as usize]
        );

        let grown = replacement.len() as u32 - sample_sections()[1].len() as u32;
        let original_dir = SectionDirectory::parse(&payload).unwrap();
        assert_eq!(
            dir.offsets()[2],
            original_dir.offsets()[2] + grown
        );
    }

    #[test]
    fn clearing_an_editor_restores_identity() {
        let payload = build_payload(&sample_sections(), 0);
        let mut field = FieldFile::open(frame(&payload)).unwrap();
        field.camera.set_bytes(b"temporary".to_vec());
        field.camera.clear();
        assert_eq!(field.save(false).unwrap(), payload);
    }

    #[test]
    fn rejects_bad_declared_size() {
        let payload = build_payload(&sample_sections(), 0);
        let mut framed = frame(&payload);
        framed[0] ^= 0x01;
        match FieldFile::open(framed) {
            Err(Error::SizeMismatch { .. }) => {}
            other => panic!("expected size mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn rejects_decreasing_directory() {
        let mut payload = build_payload(&sample_sections(), 0);
        // Swap sections 3 and 4 offsets.
        let a = payload[12..16].to_vec();
        let b = payload[16..20].to_vec();
        payload[12..16].copy_from_slice(&b);
        payload[16..20].copy_from_slice(&a);
        assert!(SectionDirectory::parse(&payload).is_err());
    }

    #[test]
    fn rejects_directory_past_end_of_buffer() {
        let payload = build_payload(&sample_sections(), 0);
        let truncated = &payload[..40];
        assert!(SectionDirectory::parse(truncated).is_err());
    }

    #[test]
    fn parses_model_directory() {
        // Directory with section 7 holding two 8-byte model records.
        let mut model = Vec::new();
        model.extend_from_slice(&20u16.to_le_bytes()); // section size word
        model.extend_from_slice(&2u16.to_le_bytes()); // model count
        model.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 0]); // 5 anims
        model.extend_from_slice(&[0, 0, 0, 9, 0, 0, 0, 0]); // 9 anims
        let sections: [&[u8]; SECTION_COUNT] = [
            b"s1", b"s2", b"s3", b"s4", b"s5", b"s6", &model,
        ];
        let payload = build_payload(&sections, 40);

        let loader = ModelLoader::parse(&payload).unwrap();
        assert_eq!(loader.model_count(), 2);
        assert_eq!(loader.anim_count(0), Some(5));
        assert_eq!(loader.anim_count(1), Some(9));
        assert_eq!(loader.anim_count(2), None);
    }
}
