//! Optional TOML configuration with defaults for the command line tool.

use log::{debug, warn};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ToolConfig {
    /// Default archive path when none is given on the command line.
    pub archive: Option<String>,
    /// Default programmer for the main flash.
    pub programmer: Option<String>,
    /// Default quirk list, same syntax as --quirks.
    pub quirks: Option<String>,
}

const CONFIG_FILE: &str = "crosfw_tool.toml";

fn read_config_file() -> Option<String> {
    let mut path = std::env::current_exe().ok()?;
    path.pop();
    path.push(CONFIG_FILE);

    if let Ok(contents) = std::fs::read_to_string(&path) {
        return Some(contents);
    }
    std::fs::read_to_string(CONFIG_FILE).ok()
}

pub fn load_config() -> Option<ToolConfig> {
    let contents = read_config_file()?;
    match toml::from_str::<ToolConfig>(&contents) {
        Ok(config) => {
            debug!("{:?}", config);
            Some(config)
        }
        Err(err) => {
            warn!("Ignoring invalid {}: {}", CONFIG_FILE, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let config: ToolConfig =
            toml::from_str("archive = \"/usr/share/firmware\"\nquirks = \"enlarge_image\"")
                .unwrap();
        assert_eq!(config.archive.as_deref(), Some("/usr/share/firmware"));
        assert_eq!(config.programmer, None);
        assert_eq!(config.quirks.as_deref(), Some("enlarge_image"));
    }

    #[test]
    fn empty_config_is_valid() {
        let config: ToolConfig = toml::from_str("").unwrap();
        assert!(config.archive.is_none());
    }
}
