//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RFB server configuration
    pub server: ServerConfig,
    /// Frame capture configuration
    pub capture: CaptureConfig,
    /// Input injection configuration
    pub input: InputConfig,
    /// Renderer configuration
    pub render: RenderConfig,
}

/// RFB server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub address: String,
    /// Listen port
    pub port: u16,
    /// Desktop name announced to viewers
    pub name: String,
    /// Pre-shared secret for VNC Authentication; unset disables auth
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 5900,
            name: "wayrfb".to_string(),
            password: None,
        }
    }
}

/// Frame capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Backend selection: `auto`, `screencopy` or `dmabuf`
    pub backend: String,
    /// Prefer the dmabuf backend when `backend = "auto"`
    pub prefer_dmabuf: bool,
    /// Maximum sustained capture frequency in Hz
    pub rate_limit_hz: f64,
    /// Delay-smoother time constant in seconds
    pub smoother_time_constant: f64,
    /// Ask the compositor to composite the cursor into captured frames
    pub overlay_cursor: bool,
    /// Output to capture; unset selects the first
    pub output: Option<String>,
    /// Seat for input injection; unset selects the first
    pub seat: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            prefer_dmabuf: true,
            rate_limit_hz: crate::capture::RATE_LIMIT,
            smoother_time_constant: crate::capture::DELAY_SMOOTHER_TIME_CONSTANT,
            overlay_cursor: false,
            output: None,
            seat: None,
        }
    }
}

/// Input injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// XKB layout name; empty selects the system default
    pub layout: String,
    /// XKB layout variant
    pub variant: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            layout: String::new(),
            variant: String::new(),
        }
    }
}

/// Renderer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// FourCC (e.g. `XR24`) to assume for shared-memory frames whose wire
    /// format is not recognised; unset falls back to BGRA uploads
    pub shm_upload_format: Option<String>,
}

/// Parse a four-character FourCC string
pub fn parse_fourcc(code: &str) -> Option<u32> {
    let bytes = code.as_bytes();
    if bytes.len() != 4 {
        return None;
    }
    Some(
        (bytes[0] as u32)
            | (bytes[1] as u32) << 8
            | (bytes[2] as u32) << 16
            | (bytes[3] as u32) << 24,
    )
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.capture.backend.as_str() {
            "auto" | "screencopy" | "dmabuf" => {}
            other => anyhow::bail!("Invalid capture backend: {}", other),
        }

        if !(self.capture.rate_limit_hz > 0.0) {
            anyhow::bail!("rate_limit_hz must be positive");
        }
        if !(self.capture.smoother_time_constant > 0.0) {
            anyhow::bail!("smoother_time_constant must be positive");
        }

        if let Some(code) = &self.render.shm_upload_format {
            if parse_fourcc(code).is_none() {
                anyhow::bail!("Invalid FourCC: {}", code);
            }
        }

        if let Some(password) = &self.server.password {
            if password.is_empty() {
                anyhow::bail!("password must not be empty when set");
            }
        }

        Ok(())
    }

    /// Override config with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        address: Option<String>,
        port: Option<u16>,
        backend: Option<String>,
        output: Option<String>,
        seat: Option<String>,
        layout: Option<String>,
        overlay_cursor: bool,
    ) -> Self {
        if let Some(address) = address {
            self.server.address = address;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(backend) = backend {
            self.capture.backend = backend;
        }
        if let Some(output) = output {
            self.capture.output = Some(output);
        }
        if let Some(seat) = seat {
            self.capture.seat = Some(seat);
        }
        if let Some(layout) = layout {
            // `layout` or `layout-variant`
            match layout.split_once('-') {
                Some((layout, variant)) => {
                    self.input.layout = layout.to_string();
                    self.input.variant = variant.to_string();
                }
                None => self.input.layout = layout,
            }
        }
        if overlay_cursor {
            self.capture.overlay_cursor = true;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 5900);
        assert_eq!(config.capture.backend, "auto");
        assert!(config.capture.prefer_dmabuf);
        assert_eq!(config.capture.rate_limit_hz, 20.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 5901
            password = "hunter2"

            [capture]
            backend = "screencopy"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 5901);
        assert_eq!(config.server.password.as_deref(), Some("hunter2"));
        assert_eq!(config.capture.backend, "screencopy");
        // Unspecified sections keep their defaults.
        assert_eq!(config.capture.rate_limit_hz, 20.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_backend() {
        let mut config = Config::default();
        config.capture.backend = "pipewire".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_rate() {
        let mut config = Config::default();
        config.capture.rate_limit_hz = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_fourcc() {
        let mut config = Config::default();
        config.render.shm_upload_format = Some("XRGB8888".to_string());
        assert!(config.validate().is_err());

        config.render.shm_upload_format = Some("XR24".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_fourcc() {
        assert_eq!(parse_fourcc("XR24"), Some(crate::capture::DRM_FORMAT_XRGB8888));
        assert_eq!(parse_fourcc("AB24"), Some(crate::capture::DRM_FORMAT_ABGR8888));
        assert_eq!(parse_fourcc("bad"), None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().with_overrides(
            Some("0.0.0.0".to_string()),
            Some(5999),
            Some("dmabuf".to_string()),
            Some("DP-1".to_string()),
            None,
            Some("de-nodeadkeys".to_string()),
            true,
        );

        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 5999);
        assert_eq!(config.capture.backend, "dmabuf");
        assert_eq!(config.capture.output.as_deref(), Some("DP-1"));
        assert_eq!(config.input.layout, "de");
        assert_eq!(config.input.variant, "nodeadkeys");
        assert!(config.capture.overlay_cursor);
    }
}
