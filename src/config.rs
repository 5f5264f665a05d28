use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::EncodingError;

pub const DEFAULT_PORT: u16 = 4005;
pub const DEFAULT_CONFIG_FILE: &str = "swankd.toml";
const SECRET_FILE_NAME: &str = ".slime-secret";

/// Threading strategy for accepting and serving connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationStyle {
    /// Dedicated accept task; every connection gets its own actors.
    Spawn,
    /// Serve on the caller; `listen` returns once serving is finished.
    None,
}

impl CommunicationStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::None => "nil",
        }
    }
}

impl fmt::Display for CommunicationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character encoding negotiated for message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum CodingSystem {
    #[serde(rename = "utf-8-unix")]
    #[value(name = "utf-8-unix")]
    Utf8Unix,
    #[serde(rename = "iso-latin-1-unix")]
    #[value(name = "iso-latin-1-unix")]
    IsoLatin1Unix,
}

impl CodingSystem {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8Unix => "utf-8-unix",
            Self::IsoLatin1Unix => "iso-latin-1-unix",
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            Self::Utf8Unix => Ok(text.as_bytes().to_vec()),
            Self::IsoLatin1Unix => text
                .chars()
                .map(|ch| {
                    u8::try_from(u32::from(ch)).map_err(|_| EncodingError::Unrepresentable {
                        ch,
                        coding: self.name(),
                    })
                })
                .collect(),
        }
    }

    /// `None` when the bytes are not valid in this coding system.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8Unix => std::str::from_utf8(bytes).ok().map(str::to_owned),
            Self::IsoLatin1Unix => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_file: Option<PathBuf>,
    pub style: CommunicationStyle,
    pub keep_listening: bool,
    pub coding_system: CodingSystem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_file: Option<PathBuf>,
    pub dedicated_output: bool,
    pub source_paths: Vec<PathBuf>,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            port_file: None,
            style: CommunicationStyle::Spawn,
            keep_listening: false,
            coding_system: CodingSystem::Utf8Unix,
            secret_file: dirs::home_dir().map(|home| home.join(SECRET_FILE_NAME)),
            dedicated_output: false,
            source_paths: Vec::new(),
            log_filter: "swankd=info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Reads `path` when given (it must exist), otherwise `swankd.toml` if
    /// present, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let (config_file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !config_file.exists() {
            if required {
                anyhow::bail!("config file {} not found", config_file.display());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_file)
            .with_context(|| format!("reading {}", config_file.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", config_file.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::info!("Wrote configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_rejects_wide_characters() {
        let coding = CodingSystem::IsoLatin1Unix;
        assert_eq!(coding.encode("caf\u{e9}").expect("latin-1 text"), b"caf\xe9");
        assert!(matches!(
            coding.encode("\u{3bb}"),
            Err(EncodingError::Unrepresentable { ch: '\u{3bb}', .. })
        ));
        assert_eq!(coding.decode(b"caf\xe9").as_deref(), Some("caf\u{e9}"));
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert_eq!(CodingSystem::Utf8Unix.decode(&[0xff, 0xfe]), None);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("swankd.toml");
        let config = ServerConfig {
            port: 0,
            style: CommunicationStyle::None,
            coding_system: CodingSystem::IsoLatin1Unix,
            keep_listening: true,
            ..ServerConfig::default()
        };
        config.save(&path).expect("save config");

        let loaded = ServerConfig::load_or_default(Some(&path)).expect("load config");
        assert_eq!(loaded.port, 0);
        assert_eq!(loaded.style, CommunicationStyle::None);
        assert_eq!(loaded.coding_system, CodingSystem::IsoLatin1Unix);
        assert!(loaded.keep_listening);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "port = 7777\nstyle = \"spawn\"\n").expect("write config");

        let loaded = ServerConfig::load_or_default(Some(&path)).expect("load config");
        assert_eq!(loaded.port, 7777);
        assert_eq!(loaded.host, "127.0.0.1");
        assert_eq!(loaded.coding_system, CodingSystem::Utf8Unix);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.toml");
        assert!(ServerConfig::load_or_default(Some(&missing)).is_err());
    }
}
