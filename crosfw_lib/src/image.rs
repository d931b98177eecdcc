//! Firmware image model and operations on its named FMAP sections.

use std::path::Path;

use log::{debug, error, warn};

use crate::fmap::Fmap;
use crate::util;

/* FMAP section names. */
pub const FMAP_RO_FRID: &str = "RO_FRID";
pub const FMAP_RO_SECTION: &str = "RO_SECTION";
pub const FMAP_RO_GBB: &str = "GBB";
pub const FMAP_RO_PRESERVE: &str = "RO_PRESERVE";
pub const FMAP_RO_VPD: &str = "RO_VPD";
pub const FMAP_RO_FSG: &str = "RO_FSG";
pub const FMAP_RW_VPD: &str = "RW_VPD";
pub const FMAP_RW_VBLOCK_A: &str = "VBLOCK_A";
pub const FMAP_RW_SECTION_A: &str = "RW_SECTION_A";
pub const FMAP_RW_SECTION_B: &str = "RW_SECTION_B";
pub const FMAP_RW_FWID: &str = "RW_FWID";
pub const FMAP_RW_FWID_A: &str = "RW_FWID_A";
pub const FMAP_RW_FWID_B: &str = "RW_FWID_B";
pub const FMAP_RW_SHARED: &str = "RW_SHARED";
pub const FMAP_RW_NVRAM: &str = "RW_NVRAM";
pub const FMAP_RW_ELOG: &str = "RW_ELOG";
pub const FMAP_RW_PRESERVE: &str = "RW_PRESERVE";
pub const FMAP_RW_LEGACY: &str = "RW_LEGACY";
pub const FMAP_RW_SMMSTORE: &str = "SMMSTORE";
pub const FMAP_SI_DESC: &str = "SI_DESC";
pub const FMAP_SI_ME: &str = "SI_ME";

#[derive(Debug, PartialEq, Eq)]
pub enum ImageError {
    Read(String),
    MissingFmap,
    MissingSection(String),
    NotVbootImage,
}

/// A non-owning view into a named section of an image.
/// Always a valid sub-range of the image it was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRange {
    pub offset: usize,
    pub size: usize,
}

/// One flat firmware blob with its parsed FMAP index and version strings.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    pub file_name: String,
    /// flashrom programmer used to read or write this image
    pub programmer: String,
    pub ro_version: String,
    pub rw_version_a: String,
    pub rw_version_b: String,
    fmap: Fmap,
}

impl FirmwareImage {
    /// Parses a firmware image from raw bytes.
    /// The image is valid iff it carries an FMAP and an `RO_FRID` section.
    pub fn from_bytes(
        data: Vec<u8>,
        file_name: &str,
        programmer: &str,
    ) -> Result<FirmwareImage, ImageError> {
        debug!("Image size: {}", data.len());
        let (_, fmap) = Fmap::find(&data).ok_or_else(|| {
            error!("Invalid image file (missing FMAP): {}", file_name);
            ImageError::MissingFmap
        })?;
        let mut image = FirmwareImage {
            data,
            file_name: file_name.to_string(),
            programmer: programmer.to_string(),
            ro_version: String::new(),
            rw_version_a: String::new(),
            rw_version_b: String::new(),
            fmap,
        };
        if !image.has_section(FMAP_RO_FRID) {
            error!("Does not look like vboot firmware image: {}", file_name);
            return Err(ImageError::NotVbootImage);
        }
        image.ro_version = image.version_from(FMAP_RO_FRID);
        if image.has_section(FMAP_RW_FWID_A) {
            image.rw_version_a = image.version_from(FMAP_RW_FWID_A);
            image.rw_version_b = image.version_from(FMAP_RW_FWID_B);
        } else if image.has_section(FMAP_RW_FWID) {
            image.rw_version_a = image.version_from(FMAP_RW_FWID);
            image.rw_version_b = image.version_from(FMAP_RW_FWID);
        } else {
            error!("Unsupported vboot firmware (no RW ID): {}", file_name);
        }
        Ok(image)
    }

    pub fn from_file(path: &Path, programmer: &str) -> Result<FirmwareImage, ImageError> {
        debug!("Load image file from {}...", path.display());
        let data = std::fs::read(path)
            .map_err(|err| ImageError::Read(format!("{}: {}", path.display(), err)))?;
        FirmwareImage::from_bytes(data, &path.to_string_lossy(), programmer)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn find_section(&self, name: &str) -> Option<SectionRange> {
        let area = self.fmap.area(name)?;
        Some(SectionRange {
            offset: area.offset as usize,
            size: area.size as usize,
        })
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.find_section(name).is_some()
    }

    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        self.find_section(name).map(|range| self.range_data(range))
    }

    pub fn section_data_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let range = self.find_section(name)?;
        Some(&mut self.data[range.offset..range.offset + range.size])
    }

    pub fn range_data(&self, range: SectionRange) -> &[u8] {
        &self.data[range.offset..range.offset + range.size]
    }

    pub fn range_data_mut(&mut self, range: SectionRange) -> &mut [u8] {
        &mut self.data[range.offset..range.offset + range.size]
    }

    /// Pads the image with `fill` up to `new_size`. FMAP areas keep their
    /// offsets so existing section handles stay valid.
    pub fn grow(&mut self, new_size: usize, fill: u8) {
        if new_size > self.data.len() {
            self.data.resize(new_size, fill);
        }
    }

    fn version_from(&self, name: &str) -> String {
        self.section_data(name)
            .map(util::read_asciiz)
            .unwrap_or_default()
    }
}

/// Preserves (copies) the given section (by name) from `from` to `to`.
/// The offsets may differ between the images. If the source section is
/// larger, the copy is truncated; if it is smaller, the remaining area of
/// the destination is not modified. Fails only when either image lacks the
/// section.
pub fn preserve_section(
    from: &FirmwareImage,
    to: &mut FirmwareImage,
    name: &str,
) -> Result<(), ImageError> {
    let src = from
        .find_section(name)
        .ok_or_else(|| ImageError::MissingSection(name.to_string()))?;
    let dst = to
        .find_section(name)
        .ok_or_else(|| ImageError::MissingSection(name.to_string()))?;
    if src.size > dst.size {
        warn!("Section {} is truncated after update.", name);
    }
    let count = src.size.min(dst.size);
    to.range_data_mut(dst)[..count]
        .copy_from_slice(&from.range_data(src)[..count]);
    Ok(())
}

/// Returns true if the images differ (an update is needed) in the given
/// section, or in the whole image when `section` is `None`. A section
/// missing from both images compares as equal.
pub fn section_needs_update(
    from: &FirmwareImage,
    to: &FirmwareImage,
    section: Option<&str>,
) -> bool {
    let Some(name) = section else {
        return from.data() != to.data();
    };
    match (from.section_data(name), to.section_data(name)) {
        (Some(a), Some(b)) => a != b,
        (None, None) => false,
        _ => true,
    }
}

/// Checks if a section is entirely filled with the given byte.
/// An empty section reports false.
pub fn section_is_filled_with(data: &[u8], value: u8) -> bool {
    !data.is_empty() && data.iter().all(|&b| b == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    #[test]
    fn versions_come_from_fwid_sections() {
        let image = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"Google_Snow.2695.90.0\0")
            .fill(FMAP_RW_FWID_A, b"Google_Snow.2695.90.1\0")
            .fill(FMAP_RW_FWID_B, b"Google_Snow.2695.90.2\0")
            .build_image();
        assert_eq!(image.ro_version, "Google_Snow.2695.90.0");
        assert_eq!(image.rw_version_a, "Google_Snow.2695.90.1");
        assert_eq!(image.rw_version_b, "Google_Snow.2695.90.2");
    }

    #[test]
    fn image_without_frid_is_rejected() {
        let data = ImageBuilder::minimal(&[("RW_SECTION_A", 0x100, 0x100)]);
        assert_eq!(
            FirmwareImage::from_bytes(data, "test", "host").unwrap_err(),
            ImageError::NotVbootImage
        );
    }

    #[test]
    fn image_without_fmap_is_rejected() {
        assert_eq!(
            FirmwareImage::from_bytes(vec![0u8; 0x1000], "test", "host").unwrap_err(),
            ImageError::MissingFmap
        );
    }

    #[test]
    fn load_round_trips() {
        let image = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"Google_Snow.2695.90.0\0")
            .build_image();
        let reloaded =
            FirmwareImage::from_bytes(image.data().to_vec(), &image.file_name, "host").unwrap();
        assert_eq!(reloaded.data(), image.data());
        assert_eq!(reloaded.ro_version, image.ro_version);
        assert_eq!(reloaded.rw_version_a, image.rw_version_a);
        assert_eq!(reloaded.rw_version_b, image.rw_version_b);
    }

    #[test]
    fn section_handles_stay_in_bounds() {
        let image = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"Google_Snow.2695.90.0\0")
            .build_image();
        for name in [FMAP_RO_FRID, FMAP_RO_GBB, FMAP_RW_SECTION_A, FMAP_RW_LEGACY] {
            let range = image.find_section(name).unwrap();
            assert!(range.offset + range.size <= image.size());
        }
    }

    #[test]
    fn preserve_copies_between_different_offsets() {
        let from = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .fill(FMAP_RO_VPD, &[0xaa; 0x100])
            .build_image();
        let mut to = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .fill(FMAP_RO_VPD, &[0x55; 0x100])
            .build_image();

        preserve_section(&from, &mut to, FMAP_RO_VPD).unwrap();
        assert_eq!(to.section_data(FMAP_RO_VPD).unwrap(), &[0xaa; 0x100][..]);
    }

    #[test]
    fn preserve_truncates_larger_source() {
        let from = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .section("PRESERVE_ME", 0x5000, 0x100)
            .fill("PRESERVE_ME", &[0xaa; 0x100])
            .build_image();
        let mut to = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .section("PRESERVE_ME", 0x5800, 0x80)
            .fill("PRESERVE_ME", &[0x55; 0x80])
            .build_image();

        preserve_section(&from, &mut to, "PRESERVE_ME").unwrap();
        assert_eq!(
            to.section_data("PRESERVE_ME").unwrap(),
            &[0xaa; 0x80][..]
        );
    }

    #[test]
    fn preserve_smaller_source_leaves_destination_tail() {
        let from = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .section("PRESERVE_ME", 0x5000, 0x40)
            .fill("PRESERVE_ME", &[0xbb; 0x40])
            .build_image();
        let mut to = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .section("PRESERVE_ME", 0x5800, 0x80)
            .fill("PRESERVE_ME", &[0x55; 0x80])
            .build_image();

        preserve_section(&from, &mut to, "PRESERVE_ME").unwrap();
        let dst = to.section_data("PRESERVE_ME").unwrap();
        assert_eq!(&dst[..0x40], &[0xbb; 0x40][..]);
        assert_eq!(&dst[0x40..], &[0x55; 0x40][..]);
    }

    #[test]
    fn preserve_missing_section_fails() {
        let from = ImageBuilder::new().fill(FMAP_RO_FRID, b"A.1\0").build_image();
        let mut to = ImageBuilder::new().fill(FMAP_RO_FRID, b"A.1\0").build_image();
        assert_eq!(
            preserve_section(&from, &mut to, "NO_SUCH_SECTION").unwrap_err(),
            ImageError::MissingSection("NO_SUCH_SECTION".to_string())
        );
    }

    #[test]
    fn compare_section_detects_changes() {
        let a = ImageBuilder::new()
            .fill(FMAP_RO_FRID, b"A.1\0")
            .fill(FMAP_RW_SECTION_A, &[1, 2, 3])
            .build_image();
        let mut b = a.clone();

        assert!(!section_needs_update(&a, &b, Some(FMAP_RW_SECTION_A)));
        assert!(!section_needs_update(&a, &b, None));

        b.section_data_mut(FMAP_RW_SECTION_A).unwrap()[0] = 9;
        assert!(section_needs_update(&a, &b, Some(FMAP_RW_SECTION_A)));
        assert!(section_needs_update(&a, &b, None));
        // Missing from both images counts as equal.
        assert!(!section_needs_update(&a, &b, Some("NO_SUCH_SECTION")));
    }

    #[test]
    fn filled_detection() {
        assert!(section_is_filled_with(&[0xff; 16], 0xff));
        assert!(!section_is_filled_with(&[0xff, 0xfe], 0xff));
        assert!(!section_is_filled_with(&[], 0xff));
    }

    #[test]
    fn grow_pads_with_fill_byte() {
        let mut image = ImageBuilder::new().fill(FMAP_RO_FRID, b"A.1\0").build_image();
        let old_size = image.size();
        image.grow(old_size + 4, 0xff);
        assert_eq!(image.size(), old_size + 4);
        assert_eq!(&image.data()[old_size..], &[0xff; 4][..]);
        image.grow(old_size, 0xff);
        assert_eq!(image.size(), old_size + 4);
    }
}
