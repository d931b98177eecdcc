//! Locate and parse the FMAP section index embedded in firmware images.
//!
//! The FMAP is a small table that names every region of the flash by
//! `(name, offset, size)`. Firmware tools find it by scanning the image for
//! its signature; all section lookups of the updater go through it.

use crate::util;

pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
const FMAP_VER_MAJOR: u8 = 1;
const FMAP_HEADER_SIZE: usize = 56;
const FMAP_AREA_SIZE: usize = 42;
const FMAP_NAME_LEN: usize = 32;
// The signature is guaranteed to sit on a 4-byte boundary
const FMAP_SEARCH_STRIDE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmapArea {
    pub offset: u32,
    pub size: u32,
    pub name: String,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmap {
    pub base: u64,
    pub size: u32,
    pub name: String,
    pub areas: Vec<FmapArea>,
}

impl Fmap {
    /// Parse an FMAP whose signature starts at `offset` in `data`.
    ///
    /// `data` is the whole firmware image; an FMAP describing any area that
    /// does not fit inside it is rejected, so every area of a successfully
    /// parsed map is a valid sub-range of the image.
    pub fn parse_at(data: &[u8], offset: usize) -> Option<Fmap> {
        let header = data.get(offset..offset.checked_add(FMAP_HEADER_SIZE)?)?;
        if &header[..FMAP_SIGNATURE.len()] != FMAP_SIGNATURE {
            return None;
        }
        if header[8] != FMAP_VER_MAJOR {
            return None;
        }
        let base = util::read_le64(header, 10)?;
        let size = util::read_le32(header, 18)?;
        let name = util::read_asciiz(&header[22..22 + FMAP_NAME_LEN]);
        let nareas = util::read_le16(header, 54)? as usize;

        let mut areas = Vec::with_capacity(nareas);
        let mut pos = offset + FMAP_HEADER_SIZE;
        for _ in 0..nareas {
            let raw = data.get(pos..pos.checked_add(FMAP_AREA_SIZE)?)?;
            let area = FmapArea {
                offset: util::read_le32(raw, 0)?,
                size: util::read_le32(raw, 4)?,
                name: util::read_asciiz(&raw[8..8 + FMAP_NAME_LEN]),
                flags: util::read_le16(raw, 40)?,
            };
            if area.offset as u64 + area.size as u64 > data.len() as u64 {
                return None;
            }
            areas.push(area);
            pos += FMAP_AREA_SIZE;
        }

        Some(Fmap {
            base,
            size,
            name,
            areas,
        })
    }

    /// Scan `data` for an FMAP signature and parse the table.
    /// Returns the offset of the signature and the parsed map.
    pub fn find(data: &[u8]) -> Option<(usize, Fmap)> {
        if data.len() < FMAP_HEADER_SIZE {
            return None;
        }
        for offset in (0..=data.len() - FMAP_HEADER_SIZE).step_by(FMAP_SEARCH_STRIDE) {
            if &data[offset..offset + FMAP_SIGNATURE.len()] == FMAP_SIGNATURE {
                if let Some(fmap) = Fmap::parse_at(data, offset) {
                    return Some((offset, fmap));
                }
            }
        }
        None
    }

    pub fn area(&self, name: &str) -> Option<&FmapArea> {
        self.areas.iter().find(|area| area.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_name(blob: &mut Vec<u8>, name: &str) {
        let mut raw = [0u8; FMAP_NAME_LEN];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        blob.extend_from_slice(&raw);
    }

    fn build_fmap(areas: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(FMAP_SIGNATURE);
        blob.push(FMAP_VER_MAJOR);
        blob.push(1);
        blob.extend_from_slice(&0u64.to_le_bytes());
        blob.extend_from_slice(&0x1000u32.to_le_bytes());
        push_name(&mut blob, "FMAP");
        blob.extend_from_slice(&(areas.len() as u16).to_le_bytes());
        for (name, offset, size) in areas {
            blob.extend_from_slice(&offset.to_le_bytes());
            blob.extend_from_slice(&size.to_le_bytes());
            push_name(&mut blob, name);
            blob.extend_from_slice(&0u16.to_le_bytes());
        }
        blob
    }

    #[test]
    fn finds_fmap_at_aligned_offset() {
        let mut image = vec![0u8; 0x1000];
        let blob = build_fmap(&[("RO_FRID", 0x100, 0x40), ("RW_SECTION_A", 0x200, 0x100)]);
        image[0x800..0x800 + blob.len()].copy_from_slice(&blob);

        let (offset, fmap) = Fmap::find(&image).unwrap();
        assert_eq!(offset, 0x800);
        assert_eq!(fmap.areas.len(), 2);
        let area = fmap.area("RW_SECTION_A").unwrap();
        assert_eq!((area.offset, area.size), (0x200, 0x100));
        assert!(fmap.area("RW_SECTION_B").is_none());
    }

    #[test]
    fn rejects_area_outside_image() {
        let mut image = vec![0u8; 0x400];
        let blob = build_fmap(&[("RW_SECTION_A", 0x300, 0x200)]);
        image[0x100..0x100 + blob.len()].copy_from_slice(&blob);
        assert!(Fmap::find(&image).is_none());
    }

    #[test]
    fn rejects_wrong_major_version() {
        let mut image = vec![0u8; 0x200];
        let mut blob = build_fmap(&[]);
        blob[8] = 2;
        image[..blob.len()].copy_from_slice(&blob);
        assert!(Fmap::find(&image).is_none());
    }

    #[test]
    fn no_signature() {
        assert!(Fmap::find(&[0u8; 0x100]).is_none());
        assert!(Fmap::find(&[0u8; 8]).is_none());
    }
}
