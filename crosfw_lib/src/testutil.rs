//! Builders and fakes shared by the unit tests: synthetic FMAP images,
//! signed keyblocks, and recording Flasher/SystemEnv implementations.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::crossystem::SystemEnv;
use crate::flashrom::{Flasher, FlashromError, WpStatus};
use crate::image::{
    FirmwareImage, FMAP_RO_FRID, FMAP_RO_GBB, FMAP_RW_VBLOCK_A,
};
use crate::vboot::{FW_PREAMBLE_SIZE, KEYBLOCK_HEADER_SIZE, KEYBLOCK_MAGIC};

lazy_static! {
    static ref KEY_A: RsaPrivateKey =
        RsaPrivateKey::new(&mut StdRng::seed_from_u64(0x5eed_0001), 2048).unwrap();
    static ref KEY_B: RsaPrivateKey =
        RsaPrivateKey::new(&mut StdRng::seed_from_u64(0x5eed_0002), 2048).unwrap();
}

pub fn test_key() -> &'static RsaPrivateKey {
    &KEY_A
}

pub fn other_test_key() -> &'static RsaPrivateKey {
    &KEY_B
}

/// Serialize an RSA public key into the vboot packed key format
/// (RSA-2048 / SHA-256).
pub fn pack_key(key: &RsaPrivateKey, version: u32) -> Vec<u8> {
    let public = RsaPublicKey::from(key);
    let mut n = public.n().to_bytes_le();
    n.resize(256, 0);

    let mut body = Vec::new();
    body.extend_from_slice(&64u32.to_le_bytes()); // modulus words
    body.extend_from_slice(&0u32.to_le_bytes()); // n0inv, unused by the verifier
    body.extend_from_slice(&n);
    body.extend_from_slice(&[0u8; 256]); // RR, unused by the verifier

    let mut packed = Vec::new();
    packed.extend_from_slice(&16u32.to_le_bytes()); // key data follows the header
    packed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    packed.extend_from_slice(&4u32.to_le_bytes()); // RSA-2048 / SHA-256
    packed.extend_from_slice(&version.to_le_bytes());
    packed.extend_from_slice(&body);
    packed
}

/// Build a VBLOCK section: a keyblock signed with `signing`, carrying
/// `data_key`, followed by a firmware preamble.
pub fn make_vblock(
    signing: &RsaPrivateKey,
    data_key: &RsaPrivateKey,
    data_key_version: u32,
    firmware_version: u32,
) -> Vec<u8> {
    let packed = pack_key(data_key, data_key_version);
    let signed_size = 48 + packed.len();
    let sig_size = 256usize;
    let keyblock_size = signed_size + sig_size;

    let mut block = vec![0u8; signed_size];
    block[..8].copy_from_slice(KEYBLOCK_MAGIC);
    block[8..12].copy_from_slice(&2u32.to_le_bytes()); // header version 2.1
    block[12..16].copy_from_slice(&1u32.to_le_bytes());
    block[16..20].copy_from_slice(&(keyblock_size as u32).to_le_bytes());
    // keyblock signature descriptor, offsets relative to the descriptor
    block[20..24].copy_from_slice(&((signed_size - 20) as u32).to_le_bytes());
    block[24..28].copy_from_slice(&(sig_size as u32).to_le_bytes());
    block[28..32].copy_from_slice(&(signed_size as u32).to_le_bytes());
    block[48..48 + packed.len()].copy_from_slice(&packed);

    let digest = Sha256::digest(&block);
    let sig = signing.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
    assert_eq!(sig.len(), sig_size);
    block.extend_from_slice(&sig);

    let mut preamble = vec![0u8; FW_PREAMBLE_SIZE];
    preamble[..4].copy_from_slice(&(FW_PREAMBLE_SIZE as u32).to_le_bytes());
    preamble[24..28].copy_from_slice(&firmware_version.to_le_bytes());
    block.extend_from_slice(&preamble);

    assert!(block.len() >= KEYBLOCK_HEADER_SIZE + FW_PREAMBLE_SIZE);
    block
}

/// Build a GBB section with the given flags, HWID, and packed root key.
pub fn make_gbb(flags: u32, hwid: &str, rootkey: &[u8], size: usize) -> Vec<u8> {
    const HWID_OFFSET: usize = 128;
    const HWID_SIZE: usize = 256;
    const ROOTKEY_OFFSET: usize = 384;
    assert!(size >= ROOTKEY_OFFSET + rootkey.len());
    assert!(hwid.len() < HWID_SIZE);

    let mut gbb = vec![0u8; size];
    gbb[..4].copy_from_slice(b"$GBB");
    gbb[4..6].copy_from_slice(&1u16.to_le_bytes());
    gbb[6..8].copy_from_slice(&1u16.to_le_bytes());
    gbb[8..12].copy_from_slice(&128u32.to_le_bytes());
    gbb[12..16].copy_from_slice(&flags.to_le_bytes());
    gbb[16..20].copy_from_slice(&(HWID_OFFSET as u32).to_le_bytes());
    gbb[20..24].copy_from_slice(&(HWID_SIZE as u32).to_le_bytes());
    gbb[24..28].copy_from_slice(&(ROOTKEY_OFFSET as u32).to_le_bytes());
    gbb[28..32].copy_from_slice(&(rootkey.len() as u32).to_le_bytes());
    gbb[HWID_OFFSET..HWID_OFFSET + hwid.len()].copy_from_slice(hwid.as_bytes());
    gbb[ROOTKEY_OFFSET..ROOTKEY_OFFSET + rootkey.len()].copy_from_slice(rootkey);
    gbb
}

const IMAGE_SIZE: usize = 0x8000;
const FMAP_OFFSET: usize = 0x7000;
const FMAP_NAME_LEN: usize = 32;

/// The default section layout used by tests. VBLOCK_A and the FWID areas
/// sit inside their RW sections, like on real images.
fn default_layout() -> Vec<(String, usize, usize)> {
    [
        ("RO_SECTION", 0x0000, 0x1800),
        ("RO_FRID", 0x0100, 0x0040),
        ("GBB", 0x0400, 0x1000),
        ("RO_VPD", 0x1800, 0x0100),
        ("RW_VPD", 0x1900, 0x0100),
        ("RW_SECTION_A", 0x2000, 0x1000),
        ("VBLOCK_A", 0x2000, 0x0800),
        ("RW_FWID_A", 0x2f00, 0x0040),
        ("RW_SECTION_B", 0x3000, 0x1000),
        ("RW_FWID_B", 0x3f00, 0x0040),
        ("RW_SHARED", 0x4000, 0x0100),
        ("RW_LEGACY", 0x4800, 0x0800),
        ("FMAP", FMAP_OFFSET, 0x0800),
    ]
    .into_iter()
    .map(|(name, offset, size)| (name.to_string(), offset, size))
    .collect()
}

fn fmap_blob(areas: &[(String, usize, usize)]) -> Vec<u8> {
    fn push_name(blob: &mut Vec<u8>, name: &str) {
        let mut raw = [0u8; FMAP_NAME_LEN];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        blob.extend_from_slice(&raw);
    }
    let mut blob = Vec::new();
    blob.extend_from_slice(b"__FMAP__");
    blob.push(1);
    blob.push(1);
    blob.extend_from_slice(&0u64.to_le_bytes());
    blob.extend_from_slice(&(IMAGE_SIZE as u32).to_le_bytes());
    push_name(&mut blob, "TEST_FMAP");
    blob.extend_from_slice(&(areas.len() as u16).to_le_bytes());
    for (name, offset, size) in areas {
        blob.extend_from_slice(&(*offset as u32).to_le_bytes());
        blob.extend_from_slice(&(*size as u32).to_le_bytes());
        push_name(&mut blob, name);
        blob.extend_from_slice(&0u16.to_le_bytes());
    }
    blob
}

pub struct ImageBuilder {
    areas: Vec<(String, usize, usize)>,
    fills: Vec<(String, usize, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            areas: default_layout(),
            fills: Vec::new(),
        }
    }

    /// Add an extra FMAP area on top of the default layout.
    pub fn section(mut self, name: &str, offset: usize, size: usize) -> ImageBuilder {
        self.areas.push((name.to_string(), offset, size));
        self
    }

    /// Write `data` at the start of a section. Later fills win on overlap.
    pub fn fill(self, name: &str, data: &[u8]) -> ImageBuilder {
        self.fill_at(name, 0, data)
    }

    /// Write `data` at an offset inside a section.
    pub fn fill_at(mut self, name: &str, offset: usize, data: &[u8]) -> ImageBuilder {
        self.fills.push((name.to_string(), offset, data.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut data = vec![0u8; IMAGE_SIZE];
        let blob = fmap_blob(&self.areas);
        data[FMAP_OFFSET..FMAP_OFFSET + blob.len()].copy_from_slice(&blob);
        for (name, offset, bytes) in &self.fills {
            let (_, base, size) = self
                .areas
                .iter()
                .find(|(n, _, _)| n == name)
                .unwrap_or_else(|| panic!("no area {name}"));
            assert!(offset + bytes.len() <= *size, "fill overflows {name}");
            data[base + offset..base + offset + bytes.len()].copy_from_slice(bytes);
        }
        data
    }

    pub fn build_image(self) -> FirmwareImage {
        FirmwareImage::from_bytes(self.build(), "test.bin", "host").unwrap()
    }

    /// A bare image with only the given areas, for negative tests.
    pub fn minimal(areas: &[(&str, u32, u32)]) -> Vec<u8> {
        let areas: Vec<(String, usize, usize)> = areas
            .iter()
            .map(|(name, offset, size)| (name.to_string(), *offset as usize, *size as usize))
            .collect();
        let mut data = vec![0u8; IMAGE_SIZE];
        let blob = fmap_blob(&areas);
        data[FMAP_OFFSET..FMAP_OFFSET + blob.len()].copy_from_slice(&blob);
        data
    }
}

/// An AP image skeleton with RO version, GBB, and VBLOCK_A in place.
pub fn ap_image(ro_version: &str, gbb: &[u8], vblock_a: &[u8]) -> ImageBuilder {
    let frid = format!("{}\0", ro_version);
    ImageBuilder::new()
        .fill(FMAP_RO_FRID, frid.as_bytes())
        .fill(FMAP_RO_GBB, gbb)
        .fill(FMAP_RW_VBLOCK_A, vblock_a)
}

#[derive(Debug, Default)]
pub struct EnvState {
    /// Recorded (name, value) pairs of every property setter call.
    pub cookies: Vec<(String, String)>,
    pub fail_cookies: bool,
}

/// A SystemEnv with canned answers that records setter calls.
pub struct FakeEnv {
    pub mainfw_act: Option<String>,
    pub tpm_fwver: i32,
    pub fw_vboot2: i32,
    pub wpsw: i32,
    pub platform_version: i32,
    /// Whether both legacy sections report the auto-update CBFS tag.
    pub cbfs_tag: bool,
    pub state: Rc<RefCell<EnvState>>,
}

impl Default for FakeEnv {
    fn default() -> FakeEnv {
        FakeEnv {
            mainfw_act: None,
            tpm_fwver: 0,
            fw_vboot2: 1,
            wpsw: 0,
            platform_version: 1,
            cbfs_tag: false,
            state: Rc::new(RefCell::new(EnvState::default())),
        }
    }
}

impl SystemEnv for FakeEnv {
    fn mainfw_act(&self) -> Option<String> {
        self.mainfw_act.clone()
    }
    fn tpm_fwver(&self) -> i32 {
        self.tpm_fwver
    }
    fn fw_vboot2(&self) -> i32 {
        self.fw_vboot2
    }
    fn wpsw_cur(&self) -> i32 {
        self.wpsw
    }
    fn wpsw_boot(&self) -> i32 {
        self.wpsw
    }
    fn platform_version(&self) -> i32 {
        self.platform_version
    }
    fn set_fw_try_next(&self, slot: &str) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fail_cookies {
            return false;
        }
        state.cookies.push(("fw_try_next".to_string(), slot.to_string()));
        true
    }
    fn set_fw_try_count(&self, count: i32) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fail_cookies {
            return false;
        }
        state.cookies.push(("fw_try_count".to_string(), count.to_string()));
        true
    }
    fn set_fwb_tries(&self, count: i32) -> bool {
        self.state
            .borrow_mut()
            .cookies
            .push(("fwb_tries".to_string(), count.to_string()));
        true
    }
    fn cbfs_has_entry(&self, _image: &Path, _region: &str, _name: &str) -> bool {
        self.cbfs_tag
    }
    fn cbfs_extract(&self, _image: &Path, _region: &str, _name: &str, _output: &Path) -> bool {
        false
    }
    fn cbfs_add_raw(&self, _image: &Path, _region: &str, _name: &str, _input: &Path) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub programmer: String,
    pub section: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct FlashState {
    pub writes: Vec<WriteRecord>,
    /// Contents handed out by read_flash; empty means the read fails.
    pub flash: Vec<u8>,
    pub wp: WpStatus,
    pub fail_write: bool,
}

impl Default for FlashState {
    fn default() -> FlashState {
        FlashState {
            writes: Vec::new(),
            flash: Vec::new(),
            wp: WpStatus::Disabled,
            fail_write: false,
        }
    }
}

/// A Flasher that serves reads from a buffer and records every write.
pub struct FakeFlasher {
    pub state: Rc<RefCell<FlashState>>,
}

impl Flasher for FakeFlasher {
    fn read_flash(&self, out: &Path, _programmer: &str) -> Result<(), FlashromError> {
        let state = self.state.borrow();
        if state.flash.is_empty() {
            return Err(FlashromError::Exit(1));
        }
        std::fs::write(out, &state.flash).map_err(|err| FlashromError::Spawn(err.to_string()))
    }

    fn write_flash(
        &self,
        input: &Path,
        programmer: &str,
        section: Option<&str>,
    ) -> Result<(), FlashromError> {
        let data =
            std::fs::read(input).map_err(|err| FlashromError::Spawn(err.to_string()))?;
        let mut state = self.state.borrow_mut();
        if state.fail_write {
            return Err(FlashromError::Exit(1));
        }
        state.writes.push(WriteRecord {
            programmer: programmer.to_string(),
            section: section.map(str::to_string),
            data,
        });
        Ok(())
    }

    fn wp_status(&self, _programmer: &str) -> WpStatus {
        self.state.borrow().wp
    }
}
