//! Verified-boot data structures: GBB header, packed public keys,
//! keyblocks, and firmware preambles.
//!
//! All parsers copy their fixed headers out of the image buffer and keep
//! explicit offsets, so verification never aliases or mutates image data.

use log::{debug, error};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::image::{FirmwareImage, SectionRange, FMAP_RO_GBB};
use crate::util;

pub const GBB_SIGNATURE: &[u8; 4] = b"$GBB";
pub const GBB_HEADER_SIZE: usize = 128;
const GBB_MAJOR_VER: u16 = 1;
/// Offset of the flags word inside the GBB header.
pub const GBB_FLAGS_OFFSET: usize = 12;

pub const KEYBLOCK_MAGIC: &[u8; 8] = b"CHROMEOS";
pub const KEYBLOCK_HEADER_SIZE: usize = 64;
// Field offsets inside the keyblock header.
const KB_SIZE_OFFSET: usize = 16;
const KB_SIGNATURE_OFFSET: usize = 20;
const KB_FLAGS_OFFSET: usize = 44;
const KB_DATA_KEY_OFFSET: usize = 48;

pub const FW_PREAMBLE_SIZE: usize = 60;
const PREAMBLE_FW_VERSION_OFFSET: usize = 24;
const PREAMBLE_FLAGS_OFFSET: usize = 56;

// Largest supported modulus (RSA-8192).
const RSA_MAX_KEY_BYTES: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum VbootError {
    NoGbb,
    InvalidKey,
    InvalidKeyblock,
    InvalidPreamble,
    Unsigned,
    UnsupportedAlgorithm(u32),
    SignatureMismatch,
    HwidTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha512,
}

/// Decode a vboot crypto algorithm id into RSA modulus bits and hash.
fn algorithm_params(algorithm: u32) -> Option<(u32, HashAlg)> {
    let params = match algorithm {
        0 => (1024, HashAlg::Sha1),
        1 => (1024, HashAlg::Sha256),
        2 => (1024, HashAlg::Sha512),
        3 => (2048, HashAlg::Sha1),
        4 => (2048, HashAlg::Sha256),
        5 => (2048, HashAlg::Sha512),
        6 => (4096, HashAlg::Sha1),
        7 => (4096, HashAlg::Sha256),
        8 => (4096, HashAlg::Sha512),
        9 => (8192, HashAlg::Sha1),
        10 => (8192, HashAlg::Sha256),
        11 => (8192, HashAlg::Sha512),
        _ => return None,
    };
    Some(params)
}

/// The Google Binary Block header. Lives at the start of the `GBB` FMAP
/// section and locates the HWID, flags, and the firmware root key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbbHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: u32,
    pub hwid_offset: u32,
    pub hwid_size: u32,
    pub rootkey_offset: u32,
    pub rootkey_size: u32,
    pub bmpfv_offset: u32,
    pub bmpfv_size: u32,
    pub recovery_key_offset: u32,
    pub recovery_key_size: u32,
}

impl GbbHeader {
    /// Parses and validates a GBB header from the GBB section contents.
    /// The HWID and root key areas must lie inside the section.
    pub fn parse(data: &[u8]) -> Option<GbbHeader> {
        if data.len() < GBB_HEADER_SIZE || &data[..GBB_SIGNATURE.len()] != GBB_SIGNATURE {
            return None;
        }
        let header = GbbHeader {
            major_version: util::read_le16(data, 4)?,
            minor_version: util::read_le16(data, 6)?,
            header_size: util::read_le32(data, 8)?,
            flags: util::read_le32(data, GBB_FLAGS_OFFSET)?,
            hwid_offset: util::read_le32(data, 16)?,
            hwid_size: util::read_le32(data, 20)?,
            rootkey_offset: util::read_le32(data, 24)?,
            rootkey_size: util::read_le32(data, 28)?,
            bmpfv_offset: util::read_le32(data, 32)?,
            bmpfv_size: util::read_le32(data, 36)?,
            recovery_key_offset: util::read_le32(data, 40)?,
            recovery_key_size: util::read_le32(data, 44)?,
        };
        if header.major_version != GBB_MAJOR_VER {
            return None;
        }
        let hsize = header.header_size as usize;
        if hsize < GBB_HEADER_SIZE || hsize > data.len() {
            return None;
        }
        if !range_ok(header.hwid_offset, header.hwid_size, data.len())
            || !range_ok(header.rootkey_offset, header.rootkey_size, data.len())
        {
            return None;
        }
        Some(header)
    }

    /// The NUL-terminated hardware id stored in the GBB section.
    pub fn hwid(&self, gbb_data: &[u8]) -> String {
        let start = self.hwid_offset as usize;
        let end = start + self.hwid_size as usize;
        util::read_asciiz(&gbb_data[start..end])
    }
}

fn range_ok(offset: u32, size: u32, len: usize) -> bool {
    offset as u64 + size as u64 <= len as u64
}

/// Finds and validates the GBB in the RO region of a firmware image.
pub fn find_gbb(image: &FirmwareImage) -> Result<(SectionRange, GbbHeader), VbootError> {
    let range = image.find_section(FMAP_RO_GBB).ok_or(VbootError::NoGbb)?;
    match GbbHeader::parse(image.range_data(range)) {
        Some(header) => Ok((range, header)),
        None => {
            error!("Cannot find GBB in image: {}.", image.file_name);
            Err(VbootError::NoGbb)
        }
    }
}

/// A packed public key: a 16-byte header followed by the raw RSA key data
/// (modulus word count, n0inv, modulus, and the Montgomery helper RR).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedKey {
    pub algorithm: u32,
    pub key_version: u32,
    key: Vec<u8>,
}

impl PackedKey {
    pub fn parse(data: &[u8]) -> Option<PackedKey> {
        let key_offset = util::read_le32(data, 0)? as usize;
        let key_size = util::read_le32(data, 4)? as usize;
        let algorithm = util::read_le32(data, 8)?;
        let key_version = util::read_le32(data, 12)?;
        let (bits, _) = algorithm_params(algorithm)?;
        let key = data.get(key_offset..key_offset.checked_add(key_size)?)?.to_vec();
        let words = util::read_le32(&key, 0)? as usize;
        if words as u64 * 32 != bits as u64 || key.len() < 8 + words * 8 {
            return None;
        }
        Some(PackedKey {
            algorithm,
            key_version,
            key,
        })
    }

    pub fn key_data(&self) -> &[u8] {
        &self.key
    }

    /// Hex SHA-1 digest of the key data, as printed in diagnostics.
    pub fn sha1_fingerprint(&self) -> String {
        Sha1::digest(&self.key)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn unpack(&self) -> Result<(RsaPublicKey, HashAlg), VbootError> {
        let (bits, hash) = algorithm_params(self.algorithm)
            .ok_or(VbootError::UnsupportedAlgorithm(self.algorithm))?;
        let n_bytes = bits as usize / 8;
        let n = BigUint::from_bytes_le(&self.key[8..8 + n_bytes]);
        let e = BigUint::from_bytes_le(&[0x01, 0x00, 0x01]);
        let key = RsaPublicKey::new_with_max_size(n, e, RSA_MAX_KEY_BYTES)
            .map_err(|_| VbootError::InvalidKey)?;
        Ok((key, hash))
    }
}

/// A keyblock binding a data key to a root key signature. The signed prefix
/// and the signature bytes are copied at parse time, so [`Keyblock::verify`]
/// works on its own buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyblock {
    pub keyblock_size: u32,
    pub flags: u32,
    pub data_key: PackedKey,
    signed_data: Vec<u8>,
    signature: Vec<u8>,
}

impl Keyblock {
    pub fn parse(data: &[u8]) -> Result<Keyblock, VbootError> {
        if data.len() < KEYBLOCK_HEADER_SIZE || &data[..KEYBLOCK_MAGIC.len()] != KEYBLOCK_MAGIC {
            return Err(VbootError::InvalidKeyblock);
        }
        let keyblock_size =
            util::read_le32(data, KB_SIZE_OFFSET).ok_or(VbootError::InvalidKeyblock)? as usize;
        if keyblock_size < KEYBLOCK_HEADER_SIZE || keyblock_size > data.len() {
            return Err(VbootError::InvalidKeyblock);
        }
        let block = &data[..keyblock_size];

        let sig_offset = util::read_le32(block, KB_SIGNATURE_OFFSET)
            .ok_or(VbootError::InvalidKeyblock)? as usize;
        let sig_size = util::read_le32(block, KB_SIGNATURE_OFFSET + 4)
            .ok_or(VbootError::InvalidKeyblock)? as usize;
        let signed_size = util::read_le32(block, KB_SIGNATURE_OFFSET + 8)
            .ok_or(VbootError::InvalidKeyblock)? as usize;
        let flags =
            util::read_le32(block, KB_FLAGS_OFFSET).ok_or(VbootError::InvalidKeyblock)?;

        let data_key = PackedKey::parse(&block[KB_DATA_KEY_OFFSET..])
            .ok_or(VbootError::InvalidKeyblock)?;

        if signed_size > keyblock_size {
            return Err(VbootError::InvalidKeyblock);
        }
        let signed_data = block[..signed_size].to_vec();

        let signature = if sig_size == 0 {
            Vec::new()
        } else {
            // The signature offset is relative to the signature descriptor.
            let start = KB_SIGNATURE_OFFSET
                .checked_add(sig_offset)
                .ok_or(VbootError::InvalidKeyblock)?;
            let end = start.checked_add(sig_size).ok_or(VbootError::InvalidKeyblock)?;
            block
                .get(start..end)
                .ok_or(VbootError::InvalidKeyblock)?
                .to_vec()
        };

        Ok(Keyblock {
            keyblock_size: keyblock_size as u32,
            flags,
            data_key,
            signed_data,
            signature,
        })
    }

    /// Verifies that this keyblock is signed with the given key.
    pub fn verify(&self, sign_key: &PackedKey) -> Result<(), VbootError> {
        if self.signature.is_empty() {
            error!("Keyblock is not signed.");
            return Err(VbootError::Unsigned);
        }
        let (key, hash) = sign_key.unpack().map_err(|err| {
            error!("Invalid signing key.");
            err
        })?;
        let result = match hash {
            HashAlg::Sha1 => key.verify(
                Pkcs1v15Sign::new::<Sha1>(),
                &Sha1::digest(&self.signed_data),
                &self.signature,
            ),
            HashAlg::Sha256 => key.verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(&self.signed_data),
                &self.signature,
            ),
            HashAlg::Sha512 => key.verify(
                Pkcs1v15Sign::new::<Sha512>(),
                &Sha512::digest(&self.signed_data),
                &self.signature,
            ),
        };
        result.map_err(|_| {
            error!("Failed verifying key block.");
            VbootError::SignatureMismatch
        })
    }
}

/// The firmware preamble that follows the keyblock in a VBLOCK section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwPreamble {
    pub preamble_size: u32,
    pub firmware_version: u32,
    pub flags: u32,
}

impl FwPreamble {
    pub fn parse(data: &[u8]) -> Option<FwPreamble> {
        if data.len() < FW_PREAMBLE_SIZE {
            return None;
        }
        Some(FwPreamble {
            preamble_size: util::read_le32(data, 0)?,
            firmware_version: util::read_le32(data, PREAMBLE_FW_VERSION_OFFSET)?,
            flags: util::read_le32(data, PREAMBLE_FLAGS_OFFSET)?,
        })
    }
}

/// Decodes the keyblock and the firmware preamble immediately after it from
/// a VBLOCK section.
pub fn decode_vblock(section: &[u8]) -> Result<(Keyblock, FwPreamble), VbootError> {
    if section.len() < KEYBLOCK_HEADER_SIZE + FW_PREAMBLE_SIZE {
        error!("Section too small for keyblock and preamble.");
        return Err(VbootError::InvalidKeyblock);
    }
    let keyblock = Keyblock::parse(section)?;
    let preamble = section
        .get(keyblock.keyblock_size as usize..)
        .and_then(FwPreamble::parse)
        .ok_or(VbootError::InvalidPreamble)?;
    debug!(
        "data key version = {}, firmware version = {}",
        keyblock.data_key.key_version, preamble.firmware_version
    );
    Ok((keyblock, preamble))
}

/// Extracts the root key stored in the GBB.
pub fn get_root_key(gbb_data: &[u8], header: &GbbHeader) -> Result<PackedKey, VbootError> {
    let start = header.rootkey_offset as usize;
    let end = start + header.rootkey_size as usize;
    match PackedKey::parse(&gbb_data[start..end]) {
        Some(key) => Ok(key),
        None => {
            error!("Invalid root key.");
            Err(VbootError::InvalidKey)
        }
    }
}
