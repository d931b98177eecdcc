//! The AP firmware update engine.
//!
//! Given a candidate image and the firmware currently on the system, the
//! engine decides which regions to overwrite, verifies the candidate
//! against the chain of trust rooted in the RO region and the TPM
//! anti-rollback versions, carries device-specific data across the
//! rewrite, and issues the flash writes in an order that keeps the device
//! bootable if power is lost mid-update: the inactive RW slot is written
//! first and the active slot is never touched within a single run.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use num_derive::FromPrimitive;

use crate::archive::Archive;
use crate::crossystem::{SysProp, SystemEnv, SystemProperties, SLOT_A, SLOT_B, WP_DISABLED};
use crate::flashrom::{Flasher, PROG_EC, PROG_HOST, PROG_PD};
use crate::image::{
    self, FirmwareImage, SectionRange, FMAP_RO_FSG, FMAP_RO_PRESERVE, FMAP_RO_SECTION,
    FMAP_RO_VPD, FMAP_RW_ELOG, FMAP_RW_LEGACY, FMAP_RW_NVRAM, FMAP_RW_PRESERVE,
    FMAP_RW_SECTION_A, FMAP_RW_SECTION_B, FMAP_RW_SHARED, FMAP_RW_SMMSTORE, FMAP_RW_VBLOCK_A,
    FMAP_RW_VPD, FMAP_SI_DESC, FMAP_SI_ME,
};
use crate::quirks::{self, Quirk, QuirkTable};
use crate::util;
use crate::vboot::{self, VbootError};

/// CBFS file marking a legacy payload as safe to auto-update.
const CBFS_AUTO_UPDATE_TAG: &str = "cros_allow_auto_update";
/// CBFS file holding the SMM store on boards without an SMMSTORE region.
const CBFS_SMM_STORE: &str = "smm_store";

/// Reboots granted to the new slot before vboot falls back.
const TRY_COUNT: i32 = 6;
/// EC software sync needs a few more reboots.
const TRY_COUNT_EC_EXTRA: i32 = 2;

// Flash master entries in the descriptor; all-ones grants full access.
const FLMSTR_OFFSET: usize = 0x80;
const FLMSTR_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum UpdateError {
    Done = 0,
    NeedRoUpdate,
    NoImage,
    SystemImage,
    InvalidImage,
    SetCookies,
    WriteFirmware,
    Platform,
    Target,
    RootKey,
    TpmRollback,
    Unknown,
}

impl UpdateError {
    /// Stable human readable explanation, also used by the CLI layer.
    pub fn message(self) -> &'static str {
        match self {
            UpdateError::Done => "Done (no error)",
            UpdateError::NeedRoUpdate => "RO changed and no WP. Need full update.",
            UpdateError::NoImage => "No image to update; try specify with -i.",
            UpdateError::SystemImage => "Cannot load system active firmware.",
            UpdateError::InvalidImage => "The given firmware image is not valid.",
            UpdateError::SetCookies => "Failed writing system flags to try update.",
            UpdateError::WriteFirmware => "Failed writing firmware.",
            UpdateError::Platform => "Your system platform is not compatible.",
            UpdateError::Target => "No valid RW target to update. Abort.",
            UpdateError::RootKey => "RW not signed by same RO root key",
            UpdateError::TpmRollback => "RW not usable due to TPM anti-rollback.",
            UpdateError::Unknown => "Unknown error.",
        }
    }
}

/// Temporary files created during one update run. Dropping the registry
/// removes every file.
#[derive(Default)]
pub struct TempFiles {
    files: Vec<tempfile::TempPath>,
}

impl TempFiles {
    pub fn create(&mut self) -> std::io::Result<PathBuf> {
        let file = tempfile::Builder::new().prefix("fwupdater.").tempfile()?;
        let path = file.into_temp_path();
        let result = path.to_path_buf();
        debug!("Created new temporary file: {}.", result.display());
        self.files.push(path);
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwTarget {
    /// The slot the system booted from, used for content checks.
    Check,
    /// The inactive slot that receives the update.
    Update,
}

/// Decides which RW section to manipulate. In vboot1 the updater always
/// writes B and checks A; in vboot2 the inactive slot is written. An
/// unknown active slot yields no target.
fn decide_rw_target(slot: i32, target: RwTarget, is_vboot2: bool) -> Option<&'static str> {
    let (a, b) = (FMAP_RW_SECTION_A, FMAP_RW_SECTION_B);
    if !is_vboot2 {
        return Some(if target == RwTarget::Update { b } else { a });
    }
    match slot {
        SLOT_A => Some(if target == RwTarget::Update { b } else { a }),
        SLOT_B => Some(if target == RwTarget::Update { a } else { b }),
        _ => None,
    }
}

/// Command line level configuration for [`UpdaterConfig::setup`].
#[derive(Debug, Default)]
pub struct UpdaterArgs {
    pub image: Option<String>,
    pub ec_image: Option<String>,
    pub pd_image: Option<String>,
    pub archive: Option<String>,
    pub quirks: Option<String>,
    pub mode: Option<String>,
    pub programmer: Option<String>,
    pub emulation: Option<String>,
    pub sys_props: Option<String>,
    pub write_protection: Option<String>,
    pub is_factory: bool,
    pub try_update: bool,
    pub force_update: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SetupError {
    InvalidMode(String),
    Archive(String),
    Image(String),
    /// EC/PD images cannot be combined with a custom programmer or
    /// emulation.
    SingleImageOnly,
    FactoryNeedsWpDisabled,
    UnknownQuirks(String),
}

/// Everything one update run owns: the images, the property cache, the
/// quirk table, the archive, and the injected host interfaces.
pub struct UpdaterConfig {
    pub image: Option<FirmwareImage>,
    pub image_current: Option<FirmwareImage>,
    pub ec_image: Option<FirmwareImage>,
    pub pd_image: Option<FirmwareImage>,
    pub props: SystemProperties,
    pub quirks: QuirkTable,
    pub archive: Option<Archive>,
    pub tempfiles: TempFiles,
    pub try_update: bool,
    pub force_update: bool,
    pub legacy_update: bool,
    pub emulation: Option<PathBuf>,
    /// Programmer for the main (AP) flash.
    pub programmer: String,
    system: Box<dyn SystemEnv>,
    flasher: Box<dyn Flasher>,
}

impl UpdaterConfig {
    pub fn new(system: Box<dyn SystemEnv>, flasher: Box<dyn Flasher>) -> UpdaterConfig {
        UpdaterConfig {
            image: None,
            image_current: None,
            ec_image: None,
            pd_image: None,
            props: SystemProperties::new(),
            quirks: QuirkTable::default(),
            archive: None,
            tempfiles: TempFiles::default(),
            try_update: false,
            force_update: false,
            legacy_update: false,
            emulation: None,
            programmer: PROG_HOST.to_string(),
            system,
            flasher,
        }
    }

    pub fn system_property(&mut self, prop: SysProp) -> i32 {
        self.props.get(prop, &*self.system, &*self.flasher)
    }

    pub fn snapshot_properties(&mut self) -> Vec<i32> {
        self.props.snapshot(&*self.system, &*self.flasher)
    }

    /// Hardware write protect off means disabled; otherwise the software
    /// state decides, and probe errors count as enabled.
    pub fn is_write_protection_enabled(&mut self) -> bool {
        if self.system_property(SysProp::WpHw) == WP_DISABLED {
            return false;
        }
        self.system_property(SysProp::WpSw) != WP_DISABLED
    }

    /// Applies command line arguments: update mode, property overrides,
    /// archive, images, and quirks.
    pub fn setup(&mut self, args: &UpdaterArgs) -> Result<(), SetupError> {
        if args.force_update {
            self.force_update = true;
        }
        if args.try_update {
            self.try_update = true;
        }
        let mut is_factory = args.is_factory;
        let mut check_single_image = false;
        if let Some(mode) = &args.mode {
            match mode.as_str() {
                "autoupdate" => self.try_update = true,
                "recovery" => self.try_update = false,
                "legacy" => self.legacy_update = true,
                "factory" | "factory_install" => is_factory = true,
                _ => return Err(SetupError::InvalidMode(mode.clone())),
            }
        }
        // Factory must win over any mode set before it.
        if is_factory {
            self.try_update = false;
        }

        if let Some(programmer) = &args.programmer {
            check_single_image = true;
            self.programmer = programmer.clone();
            debug!("AP (host) programmer changed to {}.", programmer);
        }
        if let Some(list) = &args.sys_props {
            self.props.override_from_list(list);
        }
        if let Some(wp) = &args.write_protection {
            // Overrides both switches, after any sys_props list.
            let value = wp.parse::<i32>().unwrap_or(0);
            self.props.override_value(SysProp::WpHw, value);
            self.props.override_value(SysProp::WpSw, value);
        }

        if let Some(emulation) = &args.emulation {
            check_single_image = true;
            debug!("Using file {} for emulation.", emulation);
            let image = FirmwareImage::from_file(Path::new(emulation), &self.programmer)
                .map_err(|err| SetupError::Image(format!("{}: {:?}", emulation, err)))?;
            self.image_current = Some(image);
            self.emulation = Some(PathBuf::from(emulation));
        }

        let archive_path = args.archive.clone().unwrap_or_else(|| ".".to_string());
        let archive = Archive::open(Path::new(&archive_path))
            .map_err(|err| SetupError::Archive(format!("{}: {:?}", archive_path, err)))?;
        self.archive = Some(archive);

        if self.image.is_none() {
            if let Some(name) = &args.image {
                let image = self.load_image(name, &self.programmer.clone())?;
                self.image = Some(image);
            }
        }
        if self.emulation.is_none() {
            if self.ec_image.is_none() {
                if let Some(name) = &args.ec_image {
                    let image = self.load_image(name, PROG_EC)?;
                    self.ec_image = Some(image);
                }
            }
            if self.pd_image.is_none() {
                if let Some(name) = &args.pd_image {
                    let image = self.load_image(name, PROG_PD)?;
                    self.pd_image = Some(image);
                }
            }
        }

        // Defaults depend on the loaded image, and must be applied first so
        // the user list can override them.
        if let Some(to) = &self.image {
            if let Some(defaults) = quirks::default_quirks(&to.ro_version) {
                debug!("Default quirks: {}", defaults);
                let _ = self.quirks.setup_from_list(defaults);
            }
        }
        if let Some(list) = &args.quirks {
            self.quirks
                .setup_from_list(list)
                .map_err(SetupError::UnknownQuirks)?;
        }

        if check_single_image && (self.ec_image.is_some() || self.pd_image.is_some()) {
            error!("EC/PD images are not supported in current mode.");
            return Err(SetupError::SingleImageOnly);
        }
        if is_factory && self.is_write_protection_enabled() {
            error!("Factory mode needs WP disabled.");
            return Err(SetupError::FactoryNeedsWpDisabled);
        }
        Ok(())
    }

    fn load_image(&mut self, name: &str, programmer: &str) -> Result<FirmwareImage, SetupError> {
        debug!("Load image file from {}...", name);
        let path = Path::new(name);
        let data = match self.archive.as_mut() {
            Some(archive) if !path.is_absolute() => {
                if !archive.has_entry(name) {
                    error!("Does not exist: {}", name);
                    return Err(SetupError::Image(name.to_string()));
                }
                archive
                    .read_file(name)
                    .map_err(|err| SetupError::Image(format!("{}: {:?}", name, err)))?
            }
            _ => fs::read(path)
                .map_err(|err| SetupError::Image(format!("{}: {}", name, err)))?,
        };
        FirmwareImage::from_bytes(data, name, programmer)
            .map_err(|err| SetupError::Image(format!("{}: {:?}", name, err)))
    }

    /// Reads the active system firmware through the flasher.
    fn load_system_firmware(&mut self) -> Result<FirmwareImage, UpdateError> {
        let tmp = self
            .tempfiles
            .create()
            .map_err(|_| UpdateError::SystemImage)?;
        self.flasher
            .read_flash(&tmp, &self.programmer)
            .map_err(|err| {
                error!("Failed reading system firmware: {:?}", err);
                UpdateError::SystemImage
            })?;
        FirmwareImage::from_file(&tmp, &self.programmer).map_err(|_| UpdateError::SystemImage)
    }
}

/// Writes an image to a temporary file for tools that need a path.
fn materialize(
    tempfiles: &mut TempFiles,
    image: &FirmwareImage,
) -> std::io::Result<PathBuf> {
    let path = tempfiles.create()?;
    fs::write(&path, image.data())?;
    Ok(path)
}

/// Copies a section (or the whole buffer) into the emulation image file
/// instead of touching any flash.
fn emulate_write_firmware(
    emulation: &Path,
    image: &FirmwareImage,
    section: Option<&str>,
) -> Result<(), UpdateError> {
    let mut to_image = FirmwareImage::from_file(emulation, &image.programmer).map_err(|_| {
        error!("Cannot load image from {}.", emulation.display());
        UpdateError::WriteFirmware
    })?;

    match section {
        Some(name) => {
            let src = image.section_data(name).ok_or_else(|| {
                error!("No section {} in source image {}.", name, image.file_name);
                UpdateError::WriteFirmware
            })?;
            let dst = to_image.section_data_mut(name).ok_or_else(|| {
                error!("No section {} in destination image {}.", name, emulation.display());
                UpdateError::WriteFirmware
            })?;
            let count = src.len().min(dst.len());
            debug!("Writing {} bytes", count);
            dst[..count].copy_from_slice(&src[..count]);
        }
        None => {
            if image.size() != to_image.size() {
                error!(
                    "Image size is different ({}:{} != {}:{})",
                    image.file_name,
                    image.size(),
                    to_image.file_name,
                    to_image.size()
                );
                return Err(UpdateError::WriteFirmware);
            }
            debug!("Writing {} bytes", image.size());
            let whole = SectionRange {
                offset: 0,
                size: image.size(),
            };
            to_image.range_data_mut(whole).copy_from_slice(image.data());
        }
    }

    fs::write(emulation, to_image.data()).map_err(|err| {
        error!("Failed writing to file {}: {}", emulation.display(), err);
        UpdateError::WriteFirmware
    })
}

/// Writes a section (or the whole image when `section` is `None`) to the
/// system firmware.
fn write_firmware(
    tempfiles: &mut TempFiles,
    flasher: &dyn Flasher,
    emulation: Option<&Path>,
    image: &FirmwareImage,
    section: Option<&str>,
) -> Result<(), UpdateError> {
    if let Some(emulation) = emulation {
        println!(
            "(emulation) Writing {} from {} to {}.",
            section.unwrap_or("whole image"),
            image.file_name,
            emulation.display()
        );
        return emulate_write_firmware(emulation, image, section);
    }
    let tmp = materialize(tempfiles, image).map_err(|err| {
        error!("Cannot write temporary file for output: {}", err);
        UpdateError::WriteFirmware
    })?;
    flasher
        .write_flash(&tmp, &image.programmer, section)
        .map_err(|err| {
            error!("Failed writing firmware: {:?}", err);
            UpdateError::WriteFirmware
        })
}

/// Like [`write_firmware`] but silently succeeds when there is no image,
/// or when the named section does not exist in it.
fn write_optional_firmware(
    tempfiles: &mut TempFiles,
    flasher: &dyn Flasher,
    emulation: Option<&Path>,
    image: Option<&FirmwareImage>,
    section: Option<&str>,
) -> Result<(), UpdateError> {
    let Some(image) = image else {
        debug!("No optional image to write.");
        return Ok(());
    };
    if let Some(name) = section {
        if !image.has_section(name) {
            debug!(
                "Image {}<{}> does not have section {}.",
                image.file_name, image.programmer, name
            );
            return Ok(());
        }
    }
    write_firmware(tempfiles, flasher, emulation, image, section)
}

/// Sets the properties that make vboot try the new slot on the next boot.
fn set_try_cookies(
    system: &dyn SystemEnv,
    emulation: bool,
    ec_staged: bool,
    target: &str,
    is_vboot2: bool,
) -> Result<(), UpdateError> {
    let mut tries = TRY_COUNT;
    if ec_staged {
        tries += TRY_COUNT_EC_EXTRA;
    }
    let slot = if target == FMAP_RW_SECTION_A {
        "A"
    } else if target == FMAP_RW_SECTION_B {
        "B"
    } else {
        error!("Unknown target: {}", target);
        return Err(UpdateError::SetCookies);
    };

    if emulation {
        println!(
            "(emulation) Setting try_next to {}, try_count to {}.",
            slot, tries
        );
        return Ok(());
    }
    if is_vboot2 && !system.set_fw_try_next(slot) {
        error!("Failed to set fw_try_next to {}.", slot);
        return Err(UpdateError::SetCookies);
    }
    if !system.set_fw_try_count(tries) {
        error!("Failed to set fw_try_count to {}.", tries);
        return Err(UpdateError::SetCookies);
    }
    Ok(())
}

/// Copies GBB flags and the HWID string from the current image into the
/// candidate. Fails without mutating anything when either GBB is missing
/// or the HWID does not fit.
fn preserve_gbb(from: &FirmwareImage, to: &mut FirmwareImage) -> Result<(), VbootError> {
    let (from_range, from_gbb) = vboot::find_gbb(from)?;
    let (to_range, to_gbb) = vboot::find_gbb(to)?;

    let hwid = from_gbb.hwid(from.range_data(from_range));
    if hwid.len() + 1 > to_gbb.hwid_size as usize {
        return Err(VbootError::HwidTooLong);
    }

    let to_data = to.range_data_mut(to_range);
    util::write_le32(to_data, vboot::GBB_FLAGS_OFFSET, from_gbb.flags);
    // Zero the whole area so there is no garbage after the NUL.
    let start = to_gbb.hwid_offset as usize;
    let end = start + to_gbb.hwid_size as usize;
    to_data[start..end].fill(0);
    to_data[start..start + hwid.len()].copy_from_slice(hwid.as_bytes());
    Ok(())
}

/// Preserves the regions locked by the management engine. A descriptor
/// reading all 0xFF means the ME has locked the region down, so the
/// current descriptor must survive; otherwise the unlock quirk may apply.
fn preserve_management_engine(
    unlock_me: i32,
    from: &FirmwareImage,
    to: &mut FirmwareImage,
) -> Result<(), UpdateError> {
    let Some(me) = from.section_data(FMAP_SI_ME) else {
        debug!("Skipped because no section {}.", FMAP_SI_ME);
        return Ok(());
    };
    if image::section_is_filled_with(me, 0xff) {
        debug!("ME is probably locked - preserving {}.", FMAP_SI_DESC);
        return image::preserve_section(from, to, FMAP_SI_DESC)
            .map_err(|_| UpdateError::Unknown);
    }
    if unlock_me != 0 {
        debug!("Applying quirk <{}>.", Quirk::UnlockMeForUpdate.name());
        return quirk_unlock_me_for_update(to);
    }
    Ok(())
}

/// Best-effort preservation of device data before a full update. Returns
/// the number of sections that could not be preserved.
fn preserve_images(cfg: &mut UpdaterConfig) -> usize {
    let unlock_me = cfg.quirks.value(Quirk::UnlockMeForUpdate);
    let (from, to) = match (&cfg.image_current, &mut cfg.image) {
        (Some(from), Some(to)) => (from, to),
        _ => return 1,
    };
    let mut errors = 0;
    if let Err(err) = preserve_gbb(from, to) {
        warn!("Failed to preserve GBB: {:?}", err);
        errors += 1;
    }
    if preserve_management_engine(unlock_me, from, to).is_err() {
        warn!("Failed to preserve management engine regions.");
        errors += 1;
    }
    for name in [FMAP_RO_VPD, FMAP_RW_VPD] {
        if image::preserve_section(from, to, name).is_err() {
            warn!("Failed to preserve {}.", name);
            errors += 1;
        }
    }
    let optional_sections = [
        FMAP_RO_PRESERVE,
        FMAP_RW_PRESERVE,
        FMAP_RW_NVRAM,
        FMAP_RW_ELOG,
        FMAP_RW_SMMSTORE,
        FMAP_RO_FSG,
    ];
    for name in optional_sections {
        if !from.has_section(name) {
            continue;
        }
        if image::preserve_section(from, to, name).is_err() {
            warn!("Failed to preserve {}.", name);
            errors += 1;
        }
    }
    errors
}

/// The platform is the part of the RO version up to and including the
/// first dot; RO may only be replaced by a same-platform image.
fn check_compatible_platform(
    from: &FirmwareImage,
    to: &FirmwareImage,
) -> Result<(), UpdateError> {
    let len = match (from.ro_version.find('.'), to.ro_version.find('.')) {
        (Some(dot), Some(_)) => dot + 1,
        (from_dot, to_dot) => {
            debug!("Missing dot (from={:?}, to={:?})", from_dot, to_dot);
            return Err(UpdateError::Platform);
        }
    };
    debug!("Platform: {}", &from.ro_version[..len]);
    if to.ro_version.len() < len
        || from.ro_version.as_bytes()[..len] != to.ro_version.as_bytes()[..len]
    {
        return Err(UpdateError::Platform);
    }
    Ok(())
}

/// Checks that the root key in the RO image verifies the keyblock at the
/// start of the candidate's VBLOCK_A. On failure prints key fingerprints
/// to tell a wrong signing key apart from a corrupted payload.
fn check_compatible_root_key(
    ro_image: &FirmwareImage,
    rw_image: &FirmwareImage,
) -> Result<(), UpdateError> {
    let (range, gbb) = vboot::find_gbb(ro_image).map_err(|_| UpdateError::RootKey)?;
    let rootkey =
        vboot::get_root_key(ro_image.range_data(range), &gbb).map_err(|_| UpdateError::RootKey)?;

    let section = rw_image.section_data(FMAP_RW_VBLOCK_A).ok_or_else(|| {
        error!(
            "Cannot find section {} on firmware image: {}",
            FMAP_RW_VBLOCK_A, rw_image.file_name
        );
        UpdateError::RootKey
    })?;
    // VBLOCK_A and VBLOCK_B are assumed to be signed the same way.
    let keyblock = match vboot::Keyblock::parse(section) {
        Ok(keyblock) => keyblock,
        Err(err) => {
            error!("Invalid section {}: {:?}", FMAP_RW_VBLOCK_A, err);
            return Err(UpdateError::RootKey);
        }
    };
    if keyblock.verify(&rootkey).is_ok() {
        return Ok(());
    }

    // Try harder to provide more info.
    let rootkey_rw = vboot::find_gbb(rw_image)
        .ok()
        .and_then(|(range, gbb)| vboot::get_root_key(rw_image.range_data(range), &gbb).ok());
    print!("Current (RO) image root key is {}, ", rootkey.sha1_fingerprint());
    if rootkey_rw.as_ref() == Some(&rootkey) {
        println!("same with target (RW) image. Maybe RW corrupted?");
    } else {
        println!(
            "target (RW) image is signed with rootkey {}.",
            rootkey_rw
                .map(|key| key.sha1_fingerprint())
                .unwrap_or_else(|| "<invalid>".to_string())
        );
    }
    Err(UpdateError::RootKey)
}

/// The candidate is rollback-safe iff both its data key version and its
/// firmware version are at least the versions stored in the TPM.
fn do_check_compatible_tpm_keys(
    rw_image: &FirmwareImage,
    tpm_fwver: i32,
) -> Result<(), UpdateError> {
    let section = rw_image
        .section_data(FMAP_RW_VBLOCK_A)
        .ok_or(UpdateError::TpmRollback)?;
    let (keyblock, preamble) =
        vboot::decode_vblock(section).map_err(|_| UpdateError::TpmRollback)?;

    // The stored tpm_fwver may legitimately be 0, but never negative.
    if tpm_fwver < 0 {
        error!("Invalid tpm_fwver: {}.", tpm_fwver);
        return Err(UpdateError::TpmRollback);
    }
    let tpm_data_key_version = (tpm_fwver as u32) >> 16;
    let tpm_firmware_version = (tpm_fwver as u32) & 0xffff;
    debug!(
        "TPM: data_key_version = {}, firmware_version = {}",
        tpm_data_key_version, tpm_firmware_version
    );
    if tpm_data_key_version > keyblock.data_key.key_version {
        error!(
            "Data key version rollback detected ({}->{}).",
            tpm_data_key_version, keyblock.data_key.key_version
        );
        return Err(UpdateError::TpmRollback);
    }
    if tpm_firmware_version > preamble.firmware_version {
        error!(
            "Firmware version rollback detected ({}->{}).",
            tpm_firmware_version, preamble.firmware_version
        );
        return Err(UpdateError::TpmRollback);
    }
    Ok(())
}

fn check_compatible_tpm_keys(
    rw_image: &FirmwareImage,
    tpm_fwver: i32,
    force: bool,
) -> Result<(), UpdateError> {
    match do_check_compatible_tpm_keys(rw_image, tpm_fwver) {
        Ok(()) => Ok(()),
        Err(_) if force => {
            println!("TPM KEYS CHECK IS WAIVED BY --force. YOU ARE ON YOUR OWN.");
            Ok(())
        }
        Err(err) => {
            error!("Add --force if you want to waive TPM checks.");
            Err(err)
        }
    }
}

/// The legacy payload is only rewritten when both the current and the
/// candidate carry the auto-update tag and the contents differ.
fn legacy_needs_update(
    tempfiles: &mut TempFiles,
    system: &dyn SystemEnv,
    from: &FirmwareImage,
    to: &FirmwareImage,
) -> bool {
    debug!("Checking {} contents...", FMAP_RW_LEGACY);
    let (from_path, to_path) = match (
        materialize(tempfiles, from),
        materialize(tempfiles, to),
    ) {
        (Ok(from_path), Ok(to_path)) => (from_path, to_path),
        _ => {
            error!("Failed to create temporary file for image contents.");
            return false;
        }
    };

    let has_from = system.cbfs_has_entry(&from_path, FMAP_RW_LEGACY, CBFS_AUTO_UPDATE_TAG);
    let has_to = system.cbfs_has_entry(&to_path, FMAP_RW_LEGACY, CBFS_AUTO_UPDATE_TAG);
    if !has_from || !has_to {
        debug!(
            "Current legacy firmware has{} updater tag and target firmware has{} updater tag, won't update.",
            if has_from { "" } else { " no" },
            if has_to { "" } else { " no" }
        );
        return false;
    }

    image::section_needs_update(from, to, Some(FMAP_RW_LEGACY))
}

fn quirk_enlarge_image(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    let current_size = match &cfg.image_current {
        Some(image) => image.size(),
        None => return Err(UpdateError::SystemImage),
    };
    let Some(to) = cfg.image.as_mut() else {
        return Err(UpdateError::SystemImage);
    };
    if to.size() < current_size {
        debug!("Resizing image from {} to {}.", to.size(), current_size);
        to.grow(current_size, 0xff);
    }
    Ok(())
}

fn quirk_min_platform_version(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    let required = cfg.quirks.value(Quirk::MinPlatformVersion);
    let version = cfg.system_property(SysProp::PlatformVer);
    if version < required {
        error!(
            "Platform version {} is older than required {}.",
            version, required
        );
        return Err(UpdateError::Platform);
    }
    Ok(())
}

fn quirk_unlock_me_for_update(to: &mut FirmwareImage) -> Result<(), UpdateError> {
    let Some(desc) = to.section_data_mut(FMAP_SI_DESC) else {
        error!("Cannot find section {} to unlock.", FMAP_SI_DESC);
        return Err(UpdateError::InvalidImage);
    };
    if desc.len() < FLMSTR_OFFSET + FLMSTR_COUNT * 4 {
        error!("Flash descriptor is too small to unlock.");
        return Err(UpdateError::InvalidImage);
    }
    for index in 0..FLMSTR_COUNT {
        util::write_le32(desc, FLMSTR_OFFSET + index * 4, 0xffff_ffff);
    }
    warn!("Flash descriptor unlocked; {} becomes writable.", FMAP_SI_ME);
    Ok(())
}

fn quirk_daisy_snow_dual_model(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    let version = cfg.system_property(SysProp::PlatformVer);
    if version < 0 {
        error!("Cannot identify the model on a dual-model platform.");
        return Err(UpdateError::Platform);
    }
    debug!("Dual-model platform, board revision {}.", version);
    Ok(())
}

/// Boards that shipped without an SMMSTORE region keep the SMM store as a
/// CBFS file in the legacy region; carry it into the candidate.
fn quirk_eve_smm_store(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    let to_has_region = match &cfg.image {
        Some(image) => image.has_section(FMAP_RW_SMMSTORE),
        None => return Err(UpdateError::InvalidImage),
    };
    if to_has_region {
        // Normal preservation handles a real SMMSTORE region.
        return Ok(());
    }
    let Some(from) = cfg.image_current.as_ref() else {
        return Ok(());
    };
    let from_path = match materialize(&mut cfg.tempfiles, from) {
        Ok(path) => path,
        Err(_) => return Err(UpdateError::InvalidImage),
    };
    let store_path = match cfg.tempfiles.create() {
        Ok(path) => path,
        Err(_) => return Err(UpdateError::InvalidImage),
    };
    if !cfg
        .system
        .cbfs_extract(&from_path, FMAP_RW_LEGACY, CBFS_SMM_STORE, &store_path)
    {
        debug!("No {} in the current image.", CBFS_SMM_STORE);
        return Ok(());
    }

    let (to_path, file_name, programmer) = match &cfg.image {
        Some(to) => (
            materialize(&mut cfg.tempfiles, to)
                .map_err(|_| UpdateError::InvalidImage)?,
            to.file_name.clone(),
            to.programmer.clone(),
        ),
        None => return Err(UpdateError::InvalidImage),
    };
    if !cfg
        .system
        .cbfs_add_raw(&to_path, FMAP_RW_LEGACY, CBFS_SMM_STORE, &store_path)
    {
        error!("Failed to store {} in the new image.", CBFS_SMM_STORE);
        return Err(UpdateError::InvalidImage);
    }
    let data = fs::read(&to_path).map_err(|_| UpdateError::InvalidImage)?;
    let image = FirmwareImage::from_bytes(data, &file_name, &programmer)
        .map_err(|_| UpdateError::InvalidImage)?;
    cfg.image = Some(image);
    Ok(())
}

/// Applies a quirk if its configured value is non-zero.
fn try_apply_quirk(cfg: &mut UpdaterConfig, quirk: Quirk) -> Result<(), UpdateError> {
    if cfg.quirks.value(quirk) == 0 {
        return Ok(());
    }
    debug!("Applying quirk <{}>.", quirk.name());
    match quirk {
        Quirk::EnlargeImage => quirk_enlarge_image(cfg),
        Quirk::MinPlatformVersion => quirk_min_platform_version(cfg),
        Quirk::UnlockMeForUpdate => match cfg.image.as_mut() {
            Some(to) => quirk_unlock_me_for_update(to),
            None => Err(UpdateError::InvalidImage),
        },
        Quirk::DaisySnowDualModel => quirk_daisy_snow_dual_model(cfg),
        Quirk::EveSmmStore => quirk_eve_smm_store(cfg),
    }
}

/// Try-RW update: write the inactive slot and schedule a trial boot.
fn update_try_rw_firmware(
    cfg: &mut UpdaterConfig,
    wp_enabled: bool,
) -> Result<(), UpdateError> {
    let is_vboot2 = cfg.system_property(SysProp::FwVboot2) == 1;
    let slot = cfg.system_property(SysProp::MainfwAct);
    let tpm_fwver = cfg.system_property(SysProp::TpmFwver);
    let force = cfg.force_update;

    // Keep HWID and GBB flags even if the trial write lands in RO-adjacent
    // sections later.
    {
        let (from, to) = match (&cfg.image_current, &mut cfg.image) {
            (Some(from), Some(to)) => (from, to),
            _ => return Err(UpdateError::Unknown),
        };
        if let Err(err) = preserve_gbb(from, to) {
            warn!("Failed to preserve GBB: {:?}", err);
        }
    }

    let (from, to) = match (&cfg.image_current, &cfg.image) {
        (Some(from), Some(to)) => (from, to),
        _ => return Err(UpdateError::Unknown),
    };

    if !wp_enabled && image::section_needs_update(from, to, Some(FMAP_RO_SECTION)) {
        return Err(UpdateError::NeedRoUpdate);
    }

    println!("Checking compatibility...");
    check_compatible_root_key(from, to)?;
    check_compatible_tpm_keys(to, tpm_fwver, force)?;

    debug!("Firmware {} vboot2.", if is_vboot2 { "is" } else { "is NOT" });
    let check_target = match decide_rw_target(slot, RwTarget::Check, is_vboot2) {
        Some(target) => target,
        None => {
            error!("TRY-RW update needs system to boot in RW firmware.");
            return Err(UpdateError::Target);
        }
    };

    println!("Checking {} contents...", check_target);
    if !to.has_section(check_target) {
        error!(
            "Cannot find section '{}' on firmware image: {}",
            check_target, to.file_name
        );
        return Err(UpdateError::InvalidImage);
    }
    let mut has_update = true;
    if !force {
        has_update = image::section_needs_update(from, to, Some(check_target));
    }

    if has_update {
        let target = match decide_rw_target(slot, RwTarget::Update, is_vboot2) {
            Some(target) => target,
            None => return Err(UpdateError::Target),
        };
        println!(">> TRY-RW UPDATE: Updating {} to try on reboot.", target);
        write_firmware(
            &mut cfg.tempfiles,
            &*cfg.flasher,
            cfg.emulation.as_deref(),
            to,
            Some(target),
        )?;
        set_try_cookies(
            &*cfg.system,
            cfg.emulation.is_some(),
            cfg.ec_image.is_some(),
            target,
            is_vboot2,
        )?;
    } else if !is_vboot2 && cfg.emulation.is_none() {
        // Clear trial cookies for vboot1.
        let _ = cfg.system.set_fwb_tries(0);
    }

    // Do not fail on updating legacy.
    if legacy_needs_update(&mut cfg.tempfiles, &*cfg.system, from, to) {
        has_update = true;
        println!(">> LEGACY UPDATE: Updating {}.", FMAP_RW_LEGACY);
        let _ = write_firmware(
            &mut cfg.tempfiles,
            &*cfg.flasher,
            cfg.emulation.as_deref(),
            to,
            Some(FMAP_RW_LEGACY),
        );
    }

    if !has_update {
        println!(">> No need to update.");
    }
    Ok(())
}

/// RW-only update under write protection: rewrite every RW section that
/// differs, in a fixed order.
fn update_rw_firmware(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    println!(
        ">> RW UPDATE: Updating RW sections ({}, {}, {}, and {}).",
        FMAP_RW_SECTION_A, FMAP_RW_SECTION_B, FMAP_RW_SHARED, FMAP_RW_LEGACY
    );
    let tpm_fwver = cfg.system_property(SysProp::TpmFwver);
    let force = cfg.force_update;

    let (from, to) = match (&cfg.image_current, &cfg.image) {
        (Some(from), Some(to)) => (from, to),
        _ => return Err(UpdateError::Unknown),
    };

    println!("Checking compatibility...");
    check_compatible_root_key(from, to)?;
    check_compatible_tpm_keys(to, tpm_fwver, force)?;

    for name in [FMAP_RW_SECTION_A, FMAP_RW_SECTION_B, FMAP_RW_SHARED] {
        if !force && !image::section_needs_update(from, to, Some(name)) {
            debug!("Section {} is up to date.", name);
            continue;
        }
        write_firmware(
            &mut cfg.tempfiles,
            &*cfg.flasher,
            cfg.emulation.as_deref(),
            to,
            Some(name),
        )?;
    }
    if to.has_section(FMAP_RW_LEGACY)
        && (force || image::section_needs_update(from, to, Some(FMAP_RW_LEGACY)))
    {
        write_optional_firmware(
            &mut cfg.tempfiles,
            &*cfg.flasher,
            cfg.emulation.as_deref(),
            Some(to),
            Some(FMAP_RW_LEGACY),
        )?;
    }
    Ok(())
}

/// Legacy-only update.
fn update_legacy_firmware(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    println!(">> LEGACY UPDATE: Updating firmware {}.", FMAP_RW_LEGACY);
    let Some(to) = cfg.image.as_ref() else {
        return Err(UpdateError::NoImage);
    };
    write_firmware(
        &mut cfg.tempfiles,
        &*cfg.flasher,
        cfg.emulation.as_deref(),
        to,
        Some(FMAP_RW_LEGACY),
    )
}

/// Full update: preserve device data, then rewrite the whole flash. The
/// FMAP may differ between the images, so section-wise writes are unsafe
/// here.
fn update_whole_firmware(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    println!(">> FULL UPDATE: Updating whole firmware image(s), RO+RW.");
    let errors = preserve_images(cfg);
    if errors > 0 {
        debug!("Failed to preserve {} section(s) - ignore.", errors);
    }

    println!("Checking compatibility...");
    let tpm_fwver = cfg.system_property(SysProp::TpmFwver);
    let force = cfg.force_update;
    let Some(to) = cfg.image.as_ref() else {
        return Err(UpdateError::NoImage);
    };
    check_compatible_tpm_keys(to, tpm_fwver, force)?;

    write_firmware(
        &mut cfg.tempfiles,
        &*cfg.flasher,
        cfg.emulation.as_deref(),
        to,
        None,
    )?;
    write_optional_firmware(
        &mut cfg.tempfiles,
        &*cfg.flasher,
        cfg.emulation.as_deref(),
        cfg.ec_image.as_ref(),
        None,
    )?;
    write_optional_firmware(
        &mut cfg.tempfiles,
        &*cfg.flasher,
        cfg.emulation.as_deref(),
        cfg.pd_image.as_ref(),
        None,
    )?;
    Ok(())
}

/// The main updater. Returns [`UpdateError::Done`] on success.
pub fn update_firmware(cfg: &mut UpdaterConfig) -> UpdateError {
    match run_update(cfg) {
        Ok(()) => UpdateError::Done,
        Err(err) => err,
    }
}

fn run_update(cfg: &mut UpdaterConfig) -> Result<(), UpdateError> {
    if cfg.image.is_none() {
        return Err(UpdateError::NoImage);
    }
    try_apply_quirk(cfg, Quirk::DaisySnowDualModel).map_err(|_| UpdateError::Platform)?;

    if let Some(to) = &cfg.image {
        println!(
            ">> Target image: {} (RO:{}, RW/A:{}, RW/B:{}).",
            to.file_name, to.ro_version, to.rw_version_a, to.rw_version_b
        );
    }
    try_apply_quirk(cfg, Quirk::MinPlatformVersion)?;

    if cfg.image_current.is_none() {
        println!("Loading current system firmware...");
        let image = cfg.load_system_firmware()?;
        cfg.image_current = Some(image);
    }
    {
        let (from, to) = match (&cfg.image_current, &cfg.image) {
            (Some(from), Some(to)) => (from, to),
            _ => return Err(UpdateError::Unknown),
        };
        println!(
            ">> Current system: {} (RO:{}, RW/A:{}, RW/B:{}).",
            from.file_name, from.ro_version, from.rw_version_a, from.rw_version_b
        );
        check_compatible_platform(from, to)?;
    }

    let wp_enabled = cfg.is_write_protection_enabled();
    println!(
        ">> Write protection: {} ({}; HW={}, SW={}).",
        wp_enabled as i32,
        if wp_enabled { "enabled" } else { "disabled" },
        cfg.system_property(SysProp::WpHw),
        cfg.system_property(SysProp::WpSw)
    );

    try_apply_quirk(cfg, Quirk::EnlargeImage).map_err(|_| UpdateError::SystemImage)?;
    try_apply_quirk(cfg, Quirk::EveSmmStore).map_err(|_| UpdateError::InvalidImage)?;

    if log::log_enabled!(log::Level::Debug) {
        debug!("Scanning system properties...");
        println!("System properties: {:?}", cfg.snapshot_properties());
    }

    if cfg.legacy_update {
        return update_legacy_firmware(cfg);
    }

    if cfg.try_update {
        match update_try_rw_firmware(cfg, wp_enabled) {
            Err(UpdateError::NeedRoUpdate) => {
                println!("Warning: {}", UpdateError::NeedRoUpdate.message());
            }
            result => return result,
        }
    }

    if wp_enabled {
        update_rw_firmware(cfg)
    } else {
        update_whole_firmware(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossystem::SLOT_UNKNOWN;
    use crate::image::{FMAP_RO_FRID, FMAP_RO_GBB};
    use crate::testutil::{
        ap_image, make_gbb, make_vblock, other_test_key, pack_key, test_key, EnvState,
        FakeEnv, FakeFlasher, FlashState,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build_cfg(env: FakeEnv) -> (UpdaterConfig, Rc<RefCell<FlashState>>, Rc<RefCell<EnvState>>) {
        let env_state = env.state.clone();
        let flash_state = Rc::new(RefCell::new(FlashState::default()));
        let flasher = FakeFlasher {
            state: flash_state.clone(),
        };
        let cfg = UpdaterConfig::new(Box::new(env), Box::new(flasher));
        (cfg, flash_state, env_state)
    }

    /// (mainfw_act, tpm_fwver, fw_vboot2, platform_ver, wp_hw, wp_sw)
    fn seed_props(cfg: &mut UpdaterConfig, props: [i32; 6]) {
        for (prop, value) in SysProp::ALL.iter().zip(props) {
            cfg.props.override_value(*prop, value);
        }
    }

    fn standard_gbb() -> Vec<u8> {
        make_gbb(0, "TESTHWID", &pack_key(test_key(), 1), 0x1000)
    }

    fn good_vblock() -> Vec<u8> {
        make_vblock(test_key(), test_key(), 1, 1)
    }

    fn sections(state: &Rc<RefCell<FlashState>>) -> Vec<Option<String>> {
        state
            .borrow()
            .writes
            .iter()
            .map(|record| record.section.clone())
            .collect()
    }

    #[test]
    fn slot_selector() {
        // vboot1 always updates B and checks A.
        for slot in [SLOT_A, SLOT_B, SLOT_UNKNOWN] {
            assert_eq!(
                decide_rw_target(slot, RwTarget::Update, false),
                Some(FMAP_RW_SECTION_B)
            );
            assert_eq!(
                decide_rw_target(slot, RwTarget::Check, false),
                Some(FMAP_RW_SECTION_A)
            );
        }
        // vboot2 updates the inactive slot.
        assert_eq!(
            decide_rw_target(SLOT_A, RwTarget::Update, true),
            Some(FMAP_RW_SECTION_B)
        );
        assert_eq!(
            decide_rw_target(SLOT_A, RwTarget::Check, true),
            Some(FMAP_RW_SECTION_A)
        );
        assert_eq!(
            decide_rw_target(SLOT_B, RwTarget::Update, true),
            Some(FMAP_RW_SECTION_A)
        );
        assert_eq!(
            decide_rw_target(SLOT_B, RwTarget::Check, true),
            Some(FMAP_RW_SECTION_B)
        );
        assert_eq!(decide_rw_target(SLOT_UNKNOWN, RwTarget::Update, true), None);
        // Check and update never point at the same slot.
        for vboot2 in [false, true] {
            for slot in [SLOT_A, SLOT_B] {
                assert_ne!(
                    decide_rw_target(slot, RwTarget::Update, vboot2),
                    decide_rw_target(slot, RwTarget::Check, vboot2)
                );
            }
        }
    }

    #[test]
    fn write_protection_truth_table() {
        for (hw, sw, expected) in [
            (0, 1, false),
            (-1, 0, false),
            (1, -1, true),
            (1, 1, true),
            (1, 0, false),
            (0, 0, false),
        ] {
            let (mut cfg, _, _) = build_cfg(FakeEnv::default());
            seed_props(&mut cfg, [0, 0, 1, 1, hw, sw]);
            assert_eq!(
                cfg.is_write_protection_enabled(),
                expected,
                "HW={} SW={}",
                hw,
                sw
            );
        }
    }

    #[test]
    fn tpm_check_boundaries() {
        let image = ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build_image();
        // Candidate carries data key version 1, firmware version 1.
        assert!(do_check_compatible_tpm_keys(&image, 0x00010001).is_ok());
        assert_eq!(
            do_check_compatible_tpm_keys(&image, 0x00020001),
            Err(UpdateError::TpmRollback)
        );
        assert_eq!(
            do_check_compatible_tpm_keys(&image, 0x00010002),
            Err(UpdateError::TpmRollback)
        );
        assert_eq!(
            do_check_compatible_tpm_keys(&image, -1),
            Err(UpdateError::TpmRollback)
        );
        // force waives the failure.
        assert!(check_compatible_tpm_keys(&image, 0x00020001, true).is_ok());
        assert_eq!(
            check_compatible_tpm_keys(&image, 0x00020001, false),
            Err(UpdateError::TpmRollback)
        );
    }

    #[test]
    fn hwid_preservation_boundaries() {
        let nine = "123456789";
        let from = ap_image("A.1", &make_gbb(0x5, nine, &pack_key(test_key(), 1), 0x1000), &good_vblock())
            .build_image();
        let mut to = ap_image("A.1", &make_gbb(0, "X", &pack_key(test_key(), 1), 0x1000), &good_vblock())
            .build_image();

        // Exactly strlen+1 bytes of capacity succeeds.
        to.section_data_mut(FMAP_RO_GBB).unwrap()[20..24]
            .copy_from_slice(&10u32.to_le_bytes());
        preserve_gbb(&from, &mut to).unwrap();
        let (range, gbb) = vboot::find_gbb(&to).unwrap();
        assert_eq!(gbb.hwid(to.range_data(range)), nine);
        assert_eq!(gbb.flags, 0x5);

        // One byte short fails with no mutation.
        let mut to = ap_image("A.1", &make_gbb(0, "X", &pack_key(test_key(), 1), 0x1000), &good_vblock())
            .build_image();
        to.section_data_mut(FMAP_RO_GBB).unwrap()[20..24]
            .copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            preserve_gbb(&from, &mut to).unwrap_err(),
            VbootError::HwidTooLong
        );
        let (range, gbb) = vboot::find_gbb(&to).unwrap();
        assert_eq!(gbb.hwid(to.range_data(range)), "X");
        assert_eq!(gbb.flags, 0);
    }

    #[test]
    fn try_rw_updates_inactive_slot_and_sets_cookies() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[0xcc; 16])
            .build_image();

        let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
        flash.borrow_mut().flash = cur.data().to_vec();
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        let state = flash.borrow();
        assert_eq!(state.writes.len(), 1);
        assert_eq!(state.writes[0].section.as_deref(), Some(FMAP_RW_SECTION_B));
        assert_eq!(state.writes[0].programmer, PROG_HOST);
        assert_eq!(
            env.borrow().cookies,
            vec![
                ("fw_try_next".to_string(), "B".to_string()),
                ("fw_try_count".to_string(), "6".to_string()),
            ]
        );
    }

    #[test]
    fn try_rw_with_staged_ec_needs_more_tries() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[0xcc; 16])
            .build_image();
        let ec = FirmwareImage::from_bytes(
            ap_image("ec.1.0", &gbb, &good_vblock()).build(),
            "ec.bin",
            PROG_EC,
        )
        .unwrap();

        let (mut cfg, _, env) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.ec_image = Some(ec);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert_eq!(
            env.borrow().cookies.last(),
            Some(&("fw_try_count".to_string(), "8".to_string()))
        );
    }

    #[test]
    fn try_rw_from_slot_b_updates_slot_a() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_B, 0x100, &[0xdd; 8])
            .build_image();

        let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_B, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert_eq!(sections(&flash), vec![Some(FMAP_RW_SECTION_A.to_string())]);
        assert_eq!(env.borrow().cookies[0].1, "A");
    }

    #[test]
    fn try_rw_unknown_slot_fails() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[0xcc; 16])
            .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_UNKNOWN, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Target);
        assert!(flash.borrow().writes.is_empty());
    }

    #[test]
    fn try_rw_needs_ro_update_falls_back_to_full() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.2.0", &gbb, &good_vblock()).build_image();

        let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 0, 0]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        // One whole-image write, no slot writes, no trial cookies.
        assert_eq!(sections(&flash), vec![None]);
        assert!(env.borrow().cookies.is_empty());
    }

    #[test]
    fn rollback_is_detected_and_force_waives_it() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &make_vblock(test_key(), test_key(), 1, 2))
            .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur.clone());
        cfg.image = Some(new.clone());
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010003, 1, 1, 1, 1]);
        assert_eq!(update_firmware(&mut cfg), UpdateError::TpmRollback);
        assert!(flash.borrow().writes.is_empty());

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        cfg.force_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010003, 1, 1, 1, 1]);
        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert!(!flash.borrow().writes.is_empty());
    }

    #[test]
    fn wrong_root_key_is_rejected() {
        let cur = ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build_image();
        // Candidate signed by a different root, and carrying that root in
        // its own GBB.
        let other_gbb = make_gbb(0, "TESTHWID", &pack_key(other_test_key(), 1), 0x1000);
        let new = ap_image(
            "Google_Test.1.0",
            &other_gbb,
            &make_vblock(other_test_key(), test_key(), 1, 1),
        )
        .fill_at(FMAP_RW_SECTION_A, 0x900, &[0xcc; 16])
        .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::RootKey);
        assert!(flash.borrow().writes.is_empty());
    }

    #[test]
    fn full_update_preserves_gbb_and_vpd() {
        let cur_gbb = make_gbb(0x39, "FOO A1B-C", &pack_key(test_key(), 1), 0x1000);
        let cur = ap_image("Google_Test.1.0", &cur_gbb, &good_vblock())
            .fill(FMAP_RO_VPD, &[0xa5; 0x40])
            .build_image();
        let new = ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 0, 0]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        let state = flash.borrow();
        assert_eq!(state.writes.len(), 1);
        assert_eq!(state.writes[0].section, None);

        let written =
            FirmwareImage::from_bytes(state.writes[0].data.clone(), "written", "host").unwrap();
        let (range, gbb) = vboot::find_gbb(&written).unwrap();
        assert_eq!(gbb.flags, 0x39);
        assert_eq!(gbb.hwid(written.range_data(range)), "FOO A1B-C");
        assert_eq!(written.section_data(FMAP_RO_VPD).unwrap()[0], 0xa5);
    }

    #[test]
    fn platform_mismatch_aborts() {
        let cur = ap_image("SNOW.1.2", &standard_gbb(), &good_vblock()).build_image();
        let new = ap_image("DAISY.1.2", &standard_gbb(), &good_vblock()).build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 0, 0]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Platform);
        assert!(flash.borrow().writes.is_empty());
    }

    #[test]
    fn ro_version_without_dot_fails_platform_check() {
        let cur = ap_image("NODOTS", &standard_gbb(), &good_vblock()).build_image();
        let new = ap_image("NODOTS", &standard_gbb(), &good_vblock()).build_image();
        assert_eq!(
            check_compatible_platform(&cur, &new),
            Err(UpdateError::Platform)
        );
    }

    #[test]
    fn rw_update_writes_in_fixed_order() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[1; 4])
            .fill_at(FMAP_RW_SECTION_B, 0x100, &[2; 4])
            .fill(FMAP_RW_SHARED, &[3; 4])
            .fill(FMAP_RW_LEGACY, &[4; 4])
            .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert_eq!(
            sections(&flash),
            vec![
                Some(FMAP_RW_SECTION_A.to_string()),
                Some(FMAP_RW_SECTION_B.to_string()),
                Some(FMAP_RW_SHARED.to_string()),
                Some(FMAP_RW_LEGACY.to_string()),
            ]
        );
    }

    #[test]
    fn rw_update_aborts_on_write_failure() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[1; 4])
            .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        flash.borrow_mut().fail_write = true;
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::WriteFirmware);
    }

    #[test]
    fn identical_images_are_idempotent() {
        let gbb = standard_gbb();
        // Try-RW mode first, then the RW-only strategy.
        for (try_update, wp) in [(true, 1), (false, 1)] {
            let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
            let new = cur.clone();
            let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
            cfg.image_current = Some(cur);
            cfg.image = Some(new);
            cfg.try_update = try_update;
            seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, wp, wp]);

            assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
            assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
            assert!(flash.borrow().writes.is_empty());
            assert!(env.borrow().cookies.is_empty());
        }
    }

    #[test]
    fn legacy_mode_writes_only_the_legacy_section() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill(FMAP_RW_LEGACY, &[7; 8])
            .build_image();

        let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.legacy_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert_eq!(sections(&flash), vec![Some(FMAP_RW_LEGACY.to_string())]);
        assert!(env.borrow().cookies.is_empty());
    }

    #[test]
    fn try_rw_also_updates_tagged_legacy() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill(FMAP_RW_LEGACY, &[9; 8])
            .build_image();

        let env = FakeEnv {
            cbfs_tag: true,
            ..FakeEnv::default()
        };
        let (mut cfg, flash, envst) = build_cfg(env);
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        // Slots match, so the only write is the legacy payload and no
        // trial cookies are set.
        assert_eq!(sections(&flash), vec![Some(FMAP_RW_LEGACY.to_string())]);
        assert!(envst.borrow().cookies.is_empty());
    }

    #[test]
    fn cookie_failure_reports_set_cookies() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill_at(FMAP_RW_SECTION_A, 0x900, &[0xcc; 16])
            .build_image();

        let env = FakeEnv::default();
        env.state.borrow_mut().fail_cookies = true;
        let (mut cfg, flash, _) = build_cfg(env);
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::SetCookies);
        // The slot write happened before the cookie step failed.
        assert_eq!(flash.borrow().writes.len(), 1);
    }

    #[test]
    fn vboot1_clears_trial_counter_when_nothing_to_do() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = cur.clone();

        let (mut cfg, flash, env) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.try_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 0, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert!(flash.borrow().writes.is_empty());
        assert_eq!(
            env.borrow().cookies,
            vec![("fwb_tries".to_string(), "0".to_string())]
        );
    }

    #[test]
    fn emulation_redirects_writes_to_the_file() {
        let gbb = standard_gbb();
        let cur_data = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .fill(FMAP_RW_LEGACY, &[0x77; 16])
            .build_image();

        let dir = tempfile::tempdir().unwrap();
        let emulation = dir.path().join("emu.bin");
        fs::write(&emulation, &cur_data).unwrap();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current =
            Some(FirmwareImage::from_bytes(cur_data, "emu.bin", PROG_HOST).unwrap());
        cfg.image = Some(new);
        cfg.emulation = Some(emulation.clone());
        cfg.legacy_update = true;
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        assert!(flash.borrow().writes.is_empty());
        let updated = FirmwareImage::from_file(&emulation, PROG_HOST).unwrap();
        assert_eq!(
            &updated.section_data(FMAP_RW_LEGACY).unwrap()[..16],
            &[0x77; 16]
        );
    }

    #[test]
    fn missing_candidate_fails_early() {
        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        assert_eq!(update_firmware(&mut cfg), UpdateError::NoImage);
        assert!(flash.borrow().writes.is_empty());
    }

    #[test]
    fn unreadable_system_firmware_aborts() {
        let (mut cfg, _, _) = build_cfg(FakeEnv::default());
        cfg.image =
            Some(ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build_image());
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 1, 1]);
        // The fake flasher has no backing flash contents, so the read fails.
        assert_eq!(update_firmware(&mut cfg), UpdateError::SystemImage);
    }

    #[test]
    fn setup_loads_image_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let data = ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build();
        fs::write(dir.path().join("bios.bin"), &data).unwrap();

        let (mut cfg, _, _) = build_cfg(FakeEnv::default());
        let args = UpdaterArgs {
            image: Some("bios.bin".to_string()),
            archive: Some(dir.path().to_string_lossy().to_string()),
            try_update: true,
            ..UpdaterArgs::default()
        };
        cfg.setup(&args).unwrap();
        assert!(cfg.try_update);
        assert_eq!(cfg.image.unwrap().ro_version, "Google_Test.1.0");
    }

    #[test]
    fn setup_rejects_factory_with_wp_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cfg, _, _) = build_cfg(FakeEnv::default());
        let args = UpdaterArgs {
            mode: Some("factory".to_string()),
            archive: Some(dir.path().to_string_lossy().to_string()),
            write_protection: Some("1".to_string()),
            ..UpdaterArgs::default()
        };
        assert_eq!(
            cfg.setup(&args).unwrap_err(),
            SetupError::FactoryNeedsWpDisabled
        );
    }

    #[test]
    fn setup_rejects_unknown_mode_and_quirks() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().to_string_lossy().to_string();

        let (mut cfg, _, _) = build_cfg(FakeEnv::default());
        let args = UpdaterArgs {
            mode: Some("bogus".to_string()),
            archive: Some(archive.clone()),
            ..UpdaterArgs::default()
        };
        assert_eq!(
            cfg.setup(&args).unwrap_err(),
            SetupError::InvalidMode("bogus".to_string())
        );

        let (mut cfg, _, _) = build_cfg(FakeEnv::default());
        let args = UpdaterArgs {
            quirks: Some("no_such_quirk".to_string()),
            archive: Some(archive),
            ..UpdaterArgs::default()
        };
        assert_eq!(
            cfg.setup(&args).unwrap_err(),
            SetupError::UnknownQuirks("no_such_quirk".to_string())
        );
    }

    #[test]
    fn min_platform_version_quirk_gates_old_boards() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let new = cur.clone();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.quirks.set(Quirk::MinPlatformVersion, 4);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 2, 1, 1]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Platform);
        assert!(flash.borrow().writes.is_empty());
    }

    #[test]
    fn enlarge_image_quirk_pads_candidate() {
        let gbb = standard_gbb();
        let mut cur = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        cur.grow(cur.size() + 0x100, 0x00);
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock()).build_image();
        let grown_size = cur.size();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        cfg.quirks.set(Quirk::EnlargeImage, 1);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 0, 0]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        let state = flash.borrow();
        assert_eq!(state.writes[0].data.len(), grown_size);
        assert!(state.writes[0].data[grown_size - 0x100..]
            .iter()
            .all(|&b| b == 0xff));
    }

    #[test]
    fn me_descriptor_is_preserved_when_locked() {
        let gbb = standard_gbb();
        let cur = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .section(FMAP_SI_DESC, 0x5000, 0x100)
            .section(FMAP_SI_ME, 0x5100, 0x100)
            .fill(FMAP_SI_DESC, &[0x11; 0x100])
            .fill(FMAP_SI_ME, &[0xff; 0x100])
            .build_image();
        let new = ap_image("Google_Test.1.0", &gbb, &good_vblock())
            .section(FMAP_SI_DESC, 0x5000, 0x100)
            .section(FMAP_SI_ME, 0x5100, 0x100)
            .fill(FMAP_SI_DESC, &[0x22; 0x100])
            .build_image();

        let (mut cfg, flash, _) = build_cfg(FakeEnv::default());
        cfg.image_current = Some(cur);
        cfg.image = Some(new);
        seed_props(&mut cfg, [SLOT_A, 0x00010001, 1, 1, 0, 0]);

        assert_eq!(update_firmware(&mut cfg), UpdateError::Done);
        let state = flash.borrow();
        let written =
            FirmwareImage::from_bytes(state.writes[0].data.clone(), "written", "host").unwrap();
        assert_eq!(written.section_data(FMAP_SI_DESC).unwrap(), &[0x11; 0x100]);
    }

    #[test]
    fn frid_section_resolves_inside_image() {
        let image = ap_image("Google_Test.1.0", &standard_gbb(), &good_vblock()).build_image();
        let range = image.find_section(FMAP_RO_FRID).unwrap();
        assert!(range.offset + range.size <= image.size());
    }
}
