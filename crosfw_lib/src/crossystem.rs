//! Query and set vboot runtime properties through the host tools.
//!
//! Wraps crossystem(1) for NVRAM-backed properties, mosys for the platform
//! version, and cbfstool for CBFS payload inspection. Everything sits
//! behind the [`SystemEnv`] trait so the update engine can run against
//! fakes in tests. Property values are cached in [`SystemProperties`];
//! once computed (or overridden) a value sticks for the whole run.

use std::path::Path;
use std::process::Command;

use lazy_static::lazy_static;
use log::{debug, error};
use num_derive::FromPrimitive;
use regex::Regex;

use crate::flashrom::{Flasher, WpStatus, PROG_HOST};
use crate::util;

/* Slot values of the mainfw_act property. */
pub const SLOT_UNKNOWN: i32 = -1;
pub const SLOT_A: i32 = 0;
pub const SLOT_B: i32 = 1;

/* Write protection states. */
pub const WP_DISABLED: i32 = 0;
pub const WP_ENABLED: i32 = 1;

/// Runtime system properties, one getter per capability. Real systems
/// shell out; tests provide canned values.
pub trait SystemEnv {
    /// Active main firmware slot, `"A"` or `"B"`.
    fn mainfw_act(&self) -> Option<String>;
    /// Packed TPM firmware version (negative on error).
    fn tpm_fwver(&self) -> i32;
    /// 1 when the device boots with vboot2.
    fn fw_vboot2(&self) -> i32;
    /// Current hardware write protect switch state.
    fn wpsw_cur(&self) -> i32;
    /// Write protect switch state at boot.
    fn wpsw_boot(&self) -> i32;
    /// Board revision reported by mosys (negative when unknown).
    fn platform_version(&self) -> i32;
    fn set_fw_try_next(&self, slot: &str) -> bool;
    fn set_fw_try_count(&self, count: i32) -> bool;
    /// vboot1 trial counter.
    fn set_fwb_tries(&self, count: i32) -> bool;
    /// True if the named file exists in a CBFS region of the image file.
    fn cbfs_has_entry(&self, image: &Path, region: &str, name: &str) -> bool;
    fn cbfs_extract(&self, image: &Path, region: &str, name: &str, output: &Path) -> bool;
    fn cbfs_add_raw(&self, image: &Path, region: &str, name: &str, input: &Path) -> bool;
}

/// The real host environment.
pub struct HostEnv;

impl HostEnv {
    fn crossystem_get(&self, name: &str) -> String {
        util::host_shell(&format!("crossystem {}", name))
    }

    fn crossystem_get_int(&self, name: &str) -> i32 {
        let value = self.crossystem_get(name);
        value.parse::<i32>().unwrap_or(-1)
    }

    fn crossystem_set(&self, name: &str, value: &str) -> bool {
        Command::new("crossystem")
            .arg(format!("{}={}", name, value))
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

lazy_static! {
    static ref MOSYS_REV: Regex = Regex::new(r"^rev(\d+)$").unwrap();
}

impl SystemEnv for HostEnv {
    fn mainfw_act(&self) -> Option<String> {
        let value = self.crossystem_get("mainfw_act");
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    fn tpm_fwver(&self) -> i32 {
        self.crossystem_get_int("tpm_fwver")
    }

    fn fw_vboot2(&self) -> i32 {
        self.crossystem_get_int("fw_vboot2")
    }

    fn wpsw_cur(&self) -> i32 {
        self.crossystem_get_int("wpsw_cur")
    }

    fn wpsw_boot(&self) -> i32 {
        self.crossystem_get_int("wpsw_boot")
    }

    fn platform_version(&self) -> i32 {
        let result = util::host_shell("mosys platform version");
        let rev = MOSYS_REV
            .captures(&result)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .unwrap_or(-1);
        debug!("Raw data = [{}], parsed version is {}", result, rev);
        rev
    }

    fn set_fw_try_next(&self, slot: &str) -> bool {
        self.crossystem_set("fw_try_next", slot)
    }

    fn set_fw_try_count(&self, count: i32) -> bool {
        self.crossystem_set("fw_try_count", &count.to_string())
    }

    fn set_fwb_tries(&self, count: i32) -> bool {
        self.crossystem_set("fwb_tries", &count.to_string())
    }

    fn cbfs_has_entry(&self, image: &Path, region: &str, name: &str) -> bool {
        // grep is needed because host_shell only returns one line.
        util::host_shell_ok(&format!(
            "cbfstool '{}' print -r {} 2>/dev/null | grep -q '^{} '",
            image.display(),
            region,
            name
        ))
    }

    fn cbfs_extract(&self, image: &Path, region: &str, name: &str, output: &Path) -> bool {
        Command::new("cbfstool")
            .arg(image)
            .args(["extract", "-r", region, "-n", name, "-f"])
            .arg(output)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn cbfs_add_raw(&self, image: &Path, region: &str, name: &str, input: &Path) -> bool {
        Command::new("cbfstool")
            .arg(image)
            .args(["add", "-r", region, "-n", name, "-t", "raw", "-f"])
            .arg(input)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SysProp {
    MainfwAct = 0,
    TpmFwver,
    FwVboot2,
    PlatformVer,
    WpHw,
    WpSw,
}

pub const SYS_PROP_COUNT: usize = 6;

impl SysProp {
    pub const ALL: [SysProp; SYS_PROP_COUNT] = [
        SysProp::MainfwAct,
        SysProp::TpmFwver,
        SysProp::FwVboot2,
        SysProp::PlatformVer,
        SysProp::WpHw,
        SysProp::WpSw,
    ];
}

/// Lazily computed property cache. Values are fetched once per run through
/// the injected environment and flasher; overrides pre-seed the cache.
#[derive(Debug, Default)]
pub struct SystemProperties {
    values: [Option<i32>; SYS_PROP_COUNT],
}

impl SystemProperties {
    pub fn new() -> SystemProperties {
        SystemProperties::default()
    }

    pub fn get(&mut self, prop: SysProp, env: &dyn SystemEnv, flasher: &dyn Flasher) -> i32 {
        if let Some(value) = self.values[prop as usize] {
            return value;
        }
        let value = match prop {
            SysProp::MainfwAct => match env.mainfw_act().as_deref() {
                Some("A") => SLOT_A,
                Some("B") => SLOT_B,
                _ => SLOT_UNKNOWN,
            },
            SysProp::TpmFwver => env.tpm_fwver(),
            SysProp::FwVboot2 => env.fw_vboot2(),
            SysProp::PlatformVer => env.platform_version(),
            SysProp::WpHw => {
                // wpsw_cur may be unavailable, especially in recovery mode.
                let cur = env.wpsw_cur();
                if cur < 0 {
                    env.wpsw_boot()
                } else {
                    cur
                }
            }
            SysProp::WpSw => match flasher.wp_status(PROG_HOST) {
                WpStatus::Disabled => WP_DISABLED,
                WpStatus::Enabled => WP_ENABLED,
                WpStatus::Error => -1,
            },
        };
        self.values[prop as usize] = Some(value);
        value
    }

    /// After this call the next `get` for the property returns `value`.
    pub fn override_value(&mut self, prop: SysProp, value: i32) {
        self.values[prop as usize] = Some(value);
    }

    /// Overrides properties from a list of integers separated by comma
    /// and/or space. Skipping entries needs a comma: `"1, ,3"` overrides
    /// the first and the third property only. Mostly useful for testing.
    pub fn override_from_list(&mut self, list: &str) {
        debug!("Input is <{}>", list);
        let mut index = 0;
        for group in list.split(',') {
            let values: Vec<&str> = group.split_whitespace().collect();
            if values.is_empty() {
                index += 1;
                continue;
            }
            for value in values {
                if index >= SYS_PROP_COUNT {
                    error!("Too many fields (max is {}): {}.", SYS_PROP_COUNT, list);
                    return;
                }
                if let Ok(parsed) = value.parse::<i32>() {
                    debug!("property[{}].value = {}", index, parsed);
                    if let Some(prop) = num_traits::FromPrimitive::from_usize(index) {
                        self.override_value(prop, parsed);
                    }
                }
                index += 1;
            }
        }
    }

    /// Fetches and returns every property, in enum order.
    pub fn snapshot(&mut self, env: &dyn SystemEnv, flasher: &dyn Flasher) -> Vec<i32> {
        SysProp::ALL
            .iter()
            .map(|&prop| self.get(prop, env, flasher))
            .collect()
    }
}
