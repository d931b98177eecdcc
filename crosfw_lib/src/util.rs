use std::process::Command;

use log::debug;

/// Executes a command through the shell and returns the first line of its
/// output with trailing whitespace removed.
/// If the command failed (exit code is not zero), returns an empty string.
pub fn host_shell(command: &str) -> String {
    debug!("{}", command);
    let output = match Command::new("sh").arg("-c").arg(command).output() {
        Ok(output) => output,
        Err(err) => {
            debug!("Execution error for {}: {}", command, err);
            return String::new();
        }
    };
    if !output.status.success() {
        debug!(
            "Execution failure with exit code {:?}: {}",
            output.status.code(),
            command
        );
        // Discard all output if the command failed, for example command
        // syntax failure may lead to garbage in stdout.
        return String::new();
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().unwrap_or("").trim_end().to_string()
}

/// Executes a command through the shell and reports only whether it exited
/// with status zero.
pub fn host_shell_ok(command: &str) -> bool {
    debug!("{}", command);
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Decode a NUL-terminated string from a fixed-size buffer.
/// Bytes after the first NUL (or the whole buffer if there is none) are
/// ignored.
pub fn read_asciiz(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

pub fn read_le16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

pub fn write_le32(data: &mut [u8], offset: usize, value: u32) -> bool {
    match data.get_mut(offset..offset + 4) {
        Some(bytes) => {
            bytes.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asciiz_stops_at_nul() {
        assert_eq!(read_asciiz(b"Google_Snow.2695.90.0\0garbage"), "Google_Snow.2695.90.0");
        assert_eq!(read_asciiz(b"no terminator"), "no terminator");
        assert_eq!(read_asciiz(b"\0"), "");
        assert_eq!(read_asciiz(b""), "");
    }

    #[test]
    fn le_readers_bounds() {
        let data = [0x78, 0x56, 0x34, 0x12, 0xff];
        assert_eq!(read_le32(&data, 0), Some(0x12345678));
        assert_eq!(read_le16(&data, 3), Some(0xff12));
        assert_eq!(read_le32(&data, 2), None);
        assert_eq!(read_le64(&data, 0), None);
    }

    #[test]
    fn le_writer() {
        let mut data = [0u8; 6];
        assert!(write_le32(&mut data, 1, 0xaabbccdd));
        assert_eq!(data, [0, 0xdd, 0xcc, 0xbb, 0xaa, 0]);
        assert!(!write_le32(&mut data, 3, 0));
    }
}
