//! Read, write, and query the SPI flash through flashrom(8).

use std::path::Path;
use std::process::{Command, Stdio};

use log::debug;

/* flashrom programmers. */
pub const PROG_HOST: &str = "host";
pub const PROG_EC: &str = "ec";
pub const PROG_PD: &str = "ec:dev=1";

const WP_PATTERN: &str = "write protect is ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpStatus {
    Disabled,
    Enabled,
    /// Status could not be determined; callers treat this as enabled.
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlashromError {
    Spawn(String),
    Exit(i32),
}

/// Flash access, one method per capability so tests can inject fakes.
pub trait Flasher {
    /// Dump the flash selected by `programmer` into `out`.
    fn read_flash(&self, out: &Path, programmer: &str) -> Result<(), FlashromError>;
    /// Write `input` to the flash, restricted to one FMAP section when
    /// `section` is given.
    fn write_flash(
        &self,
        input: &Path,
        programmer: &str,
        section: Option<&str>,
    ) -> Result<(), FlashromError>;
    fn wp_status(&self, programmer: &str) -> WpStatus;
}

/// The real flashrom(8) command line tool.
pub struct Flashrom {
    pub verbosity: u8,
}

impl Flashrom {
    fn run(&self, args: &[&str]) -> Result<(), FlashromError> {
        let mut command = Command::new("flashrom");
        command.args(args);
        for _ in 0..self.verbosity.min(3) {
            command.arg("-V");
        }
        if self.verbosity == 0 {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            println!("Executing: flashrom {}", args.join(" "));
        }
        let status = command
            .status()
            .map_err(|err| FlashromError::Spawn(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(FlashromError::Exit(status.code().unwrap_or(-1)))
        }
    }
}

impl Flasher for Flashrom {
    fn read_flash(&self, out: &Path, programmer: &str) -> Result<(), FlashromError> {
        let out = out.to_string_lossy();
        self.run(&["-r", &*out, "-p", programmer])
    }

    fn write_flash(
        &self,
        input: &Path,
        programmer: &str,
        section: Option<&str>,
    ) -> Result<(), FlashromError> {
        let input = input.to_string_lossy();
        let mut args = vec!["-w", &*input, "-p", programmer];
        if let Some(name) = section {
            args.push("-i");
            args.push(name);
        }
        self.run(&args)
    }

    fn wp_status(&self, programmer: &str) -> WpStatus {
        let output = Command::new("flashrom")
            .args(["--wp-status", "-p", programmer])
            .output();
        match output {
            Ok(output) => {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let status = parse_wp_output(&text);
                debug!("wp-status: {:?}", status);
                status
            }
            Err(err) => {
                debug!("wp-status failed: {}", err);
                WpStatus::Error
            }
        }
    }
}

/// Decide the write protection state from flashrom output. The exact
/// substrings are part of flashrom's interface.
pub fn parse_wp_output(output: &str) -> WpStatus {
    let enabled = format!("{}enabled", WP_PATTERN);
    let disabled = format!("{}disabled", WP_PATTERN);
    if output.contains(&enabled) {
        WpStatus::Enabled
    } else if output.contains(&disabled) {
        WpStatus::Disabled
    } else {
        WpStatus::Error
    }
}
