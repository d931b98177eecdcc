//! Board-specific quirks applied to the update before writing.
//!
//! The set of quirks is a closed enumeration; the value of an entry is an
//! integer setting (0 means off). The apply logic lives in the update
//! engine, this module owns the table, the list syntax, and the defaults.

use log::{debug, error};
use num_derive::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Quirk {
    EnlargeImage = 0,
    MinPlatformVersion,
    UnlockMeForUpdate,
    DaisySnowDualModel,
    EveSmmStore,
}

pub const QUIRK_COUNT: usize = 5;

impl Quirk {
    pub const ALL: [Quirk; QUIRK_COUNT] = [
        Quirk::EnlargeImage,
        Quirk::MinPlatformVersion,
        Quirk::UnlockMeForUpdate,
        Quirk::DaisySnowDualModel,
        Quirk::EveSmmStore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quirk::EnlargeImage => "enlarge_image",
            Quirk::MinPlatformVersion => "min_platform_version",
            Quirk::UnlockMeForUpdate => "unlock_me_for_update",
            Quirk::DaisySnowDualModel => "daisy_snow_dual_model",
            Quirk::EveSmmStore => "eve_smm_store",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Quirk::EnlargeImage => {
                "Pad the update image with 0xFF to match the size of the system flash."
            }
            Quirk::MinPlatformVersion => {
                "Refuse to update when the board revision is below the given value."
            }
            Quirk::UnlockMeForUpdate => {
                "Open the flash descriptor so the ME region can be rewritten."
            }
            Quirk::DaisySnowDualModel => {
                "Resolve the shared daisy/snow image to the model actually present."
            }
            Quirk::EveSmmStore => {
                "Carry the SMM store over when the new image has no SMMSTORE region."
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct QuirkTable {
    values: [i32; QUIRK_COUNT],
}

impl QuirkTable {
    pub fn value(&self, quirk: Quirk) -> i32 {
        self.values[quirk as usize]
    }

    pub fn set(&mut self, quirk: Quirk, value: i32) {
        self.values[quirk as usize] = value;
    }

    /// Applies settings from a `NAME[=VALUE]` list, separated by comma or
    /// space. A missing value defaults to 1. Unknown names are an error.
    pub fn setup_from_list(&mut self, list: &str) -> Result<(), String> {
        let mut unknown = Vec::new();
        for token in list.split([',', ' ']).filter(|t| !t.is_empty()) {
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name, value.parse::<i32>().unwrap_or(0)),
                None => (token, 1),
            };
            debug!("Looking for quirk <{}={}>.", name, value);
            match Quirk::ALL.iter().find(|quirk| quirk.name() == name) {
                Some(&quirk) => {
                    self.set(quirk, value);
                    debug!("Set quirk {} to {}.", quirk.name(), value);
                }
                None => {
                    error!("Unknown quirk: {}", name);
                    unknown.push(name.to_string());
                }
            }
        }
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(unknown.join(", "))
        }
    }
}

/// Prints the name and description of all supported quirks.
pub fn print_supported(table: &QuirkTable) {
    println!("Supported quirks:");
    for quirk in Quirk::ALL {
        println!(
            " '{}': {} (default: {})",
            quirk.name(),
            quirk.help(),
            table.value(quirk)
        );
    }
}

/// Default quirk list for an image, decided by the platform prefix of its
/// RO version string.
pub fn default_quirks(ro_version: &str) -> Option<&'static str> {
    let platform = ro_version
        .split('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if platform.ends_with("eve") {
        return Some("eve_smm_store");
    }
    if platform.ends_with("daisy") || platform.ends_with("snow") {
        return Some("daisy_snow_dual_model");
    }
    None
}
