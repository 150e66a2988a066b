//! Configuration management for the verification engine
//!
//! Settings are loaded from a TOML file, overridden from the environment and
//! validated before use. Secrets (login token, provider API key) are never
//! serialized back out.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::VerificationType;

/// Configuration errors
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Which directions of tool traffic are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanMode {
    None,
    RequestOnly,
    ResponseOnly,
    #[default]
    RequestResponse,
}

impl ScanMode {
    /// Whether operations in this direction must be verified.
    pub fn verifies(&self, kind: VerificationType) -> bool {
        match (self, kind) {
            (ScanMode::RequestResponse, _) => true,
            (ScanMode::RequestOnly, VerificationType::ToolCall) => true,
            (ScanMode::ResponseOnly, VerificationType::ToolResponse) => true,
            _ => false,
        }
    }

    /// Reason recorded when verification is skipped for a direction.
    pub fn skip_reason(&self, kind: VerificationType) -> Option<String> {
        if self.verifies(kind) {
            return None;
        }
        let reason = match (self, kind) {
            (ScanMode::None, _) => {
                "Verification skipped: scan mode is NONE, no tool traffic is verified".to_string()
            }
            (_, VerificationType::ToolCall) => format!(
                "Verification skipped: scan mode is {}, tool calls are not verified",
                self
            ),
            (_, VerificationType::ToolResponse) => format!(
                "Verification skipped: scan mode is {}, tool responses are not verified",
                self
            ),
        };
        Some(reason)
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMode::None => write!(f, "NONE"),
            ScanMode::RequestOnly => write!(f, "REQUEST_ONLY"),
            ScanMode::ResponseOnly => write!(f, "RESPONSE_ONLY"),
            ScanMode::RequestResponse => write!(f, "REQUEST_RESPONSE"),
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(ScanMode::None),
            "REQUEST_ONLY" => Ok(ScanMode::RequestOnly),
            "RESPONSE_ONLY" => Ok(ScanMode::ResponseOnly),
            "REQUEST_RESPONSE" => Ok(ScanMode::RequestResponse),
            other => Err(ConfigError::InvalidValue {
                key: "scan_mode".to_string(),
                reason: format!("Unknown scan mode '{}'", other),
            }),
        }
    }
}

/// LLM provider used for signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    /// Hosted verification backend, authenticated with the login token
    #[default]
    Backend,
    OpenAI,
    Anthropic,
    OpenRouter,
}

impl LlmProviderKind {
    /// Environment variable holding the API key for a direct provider.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            LlmProviderKind::Backend => None,
            LlmProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            LlmProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            LlmProviderKind::Backend => None,
            LlmProviderKind::OpenAI => Some("https://api.openai.com/v1"),
            LlmProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
            LlmProviderKind::OpenRouter => Some("https://openrouter.ai/api/v1"),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProviderKind::Backend => "backend",
            LlmProviderKind::OpenAI => "gpt-4o",
            LlmProviderKind::Anthropic => "claude-sonnet-4-5-20250514",
            LlmProviderKind::OpenRouter => "anthropic/claude-sonnet-4",
        }
    }
}

impl std::fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderKind::Backend => write!(f, "backend"),
            LlmProviderKind::OpenAI => write!(f, "openai"),
            LlmProviderKind::Anthropic => write!(f, "anthropic"),
            LlmProviderKind::OpenRouter => write!(f, "openrouter"),
        }
    }
}

impl std::str::FromStr for LlmProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backend" => Ok(LlmProviderKind::Backend),
            "openai" => Ok(LlmProviderKind::OpenAI),
            "anthropic" => Ok(LlmProviderKind::Anthropic),
            "openrouter" => Ok(LlmProviderKind::OpenRouter),
            other => Err(ConfigError::InvalidValue {
                key: "llm.provider".to_string(),
                reason: format!("Unknown LLM provider '{}'", other),
            }),
        }
    }
}

/// Top-level settings consumed by the verification engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scan-mode policy
    pub scan_mode: ScanMode,
    /// Login token for the hosted backend (securely handled)
    #[serde(skip_serializing)]
    pub login_token: Option<String>,
    /// Signature ids switched off by the user
    pub disabled_signatures: HashSet<String>,
    /// Directory holding `deterministic/<file>` predicates
    pub signatures_dir: Option<PathBuf>,
    /// LLM verifier configuration
    pub llm: LlmSettings,
    /// Hosted backend configuration
    pub backend: BackendSettings,
    /// Application identity reported to the backend
    pub app: AppSettings,
    /// Human escalation configuration
    pub escalation: EscalationSettings,
}

/// LLM verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    /// Model override, provider default when unset
    pub model: Option<String>,
    /// Direct provider API key (securely handled)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Base URL override for the direct provider
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

/// Hosted backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Base URL of the hosted verification backend
    pub url: Option<String>,
}

/// Application identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub version: String,
    pub platform: String,
}

/// Human escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    /// Allow a human to override blocked verdicts
    pub enabled: bool,
    /// Seconds to wait for a decision before denying
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            model: None,
            api_key: None,
            base_url: None,
            temperature: 0.1,
            max_tokens: 4096,
            request_timeout_secs: 60,
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: env::consts::OS.to_string(),
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
        }
    }
}

impl LlmSettings {
    /// Model name, falling back to the provider default.
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }
}

impl Settings {
    /// Load settings from defaults and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Apply environment overrides on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(mode) = env::var("TOOLWARDEN_SCAN_MODE") {
            self.scan_mode = mode.parse()?;
        }

        if let Ok(token) = env::var("TOOLWARDEN_LOGIN_TOKEN") {
            let token = token.trim();
            if !token.is_empty() {
                self.login_token = Some(token.to_string());
            }
        }

        if let Ok(provider) = env::var("TOOLWARDEN_LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }

        if let Ok(model) = env::var("TOOLWARDEN_LLM_MODEL") {
            self.llm.model = Some(model);
        }

        if let Ok(url) = env::var("TOOLWARDEN_BACKEND_URL") {
            self.backend.url = Some(url);
        }

        if let Ok(dir) = env::var("TOOLWARDEN_SIGNATURES_DIR") {
            self.signatures_dir = Some(PathBuf::from(dir));
        }

        if self.llm.api_key.is_none() {
            if let Some(var) = self.llm.provider.api_key_var() {
                if let Ok(key) = env::var(var) {
                    self.llm.api_key = Some(key);
                }
            }
        }

        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::InvalidValue {
                key: "llm.temperature".to_string(),
                reason: "Must be between 0.0 and 2.0".to_string(),
            });
        }

        if self.llm.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm.max_tokens".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if self.llm.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm.request_timeout_secs".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if self.escalation.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "escalation.timeout_secs".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if self.llm.provider == LlmProviderKind::Backend
            && self.login_token.is_some()
            && self.backend.url.is_none()
        {
            return Err(ConfigError::MissingRequired {
                key: "backend.url".to_string(),
            });
        }

        Ok(())
    }

    /// Whether a signature is enabled
    pub fn is_signature_enabled(&self, signature_id: &str) -> bool {
        !self.disabled_signatures.contains(signature_id)
    }

    /// Switch a signature on or off
    pub fn set_signature_enabled(&mut self, signature_id: &str, enabled: bool) {
        if enabled {
            self.disabled_signatures.remove(signature_id);
        } else {
            self.disabled_signatures.insert(signature_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for var in [
            "TOOLWARDEN_SCAN_MODE",
            "TOOLWARDEN_LOGIN_TOKEN",
            "TOOLWARDEN_LLM_PROVIDER",
            "TOOLWARDEN_LLM_MODEL",
            "TOOLWARDEN_BACKEND_URL",
            "TOOLWARDEN_SIGNATURES_DIR",
            "OPENAI_API_KEY",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.scan_mode, ScanMode::RequestResponse);
        assert_eq!(settings.escalation.timeout_secs, 30);
        assert!(settings.escalation.enabled);
        assert!(settings.llm.temperature < 0.5);
    }

    #[test]
    fn test_scan_mode_policy() {
        use VerificationType::*;
        assert!(ScanMode::RequestResponse.verifies(ToolCall));
        assert!(ScanMode::RequestResponse.verifies(ToolResponse));
        assert!(ScanMode::RequestOnly.verifies(ToolCall));
        assert!(!ScanMode::RequestOnly.verifies(ToolResponse));
        assert!(!ScanMode::ResponseOnly.verifies(ToolCall));
        assert!(ScanMode::ResponseOnly.verifies(ToolResponse));
        assert!(!ScanMode::None.verifies(ToolCall));
        assert!(!ScanMode::None.verifies(ToolResponse));
    }

    #[test]
    fn test_skip_reason_names_mode() {
        let reason = ScanMode::RequestOnly
            .skip_reason(VerificationType::ToolResponse)
            .unwrap();
        assert!(reason.contains("REQUEST_ONLY"));
        assert!(reason.contains("responses"));
        assert!(ScanMode::RequestOnly
            .skip_reason(VerificationType::ToolCall)
            .is_none());
    }

    #[test]
    fn test_scan_mode_parse() {
        assert_eq!("request_only".parse::<ScanMode>().unwrap(), ScanMode::RequestOnly);
        assert!("sometimes".parse::<ScanMode>().is_err());
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolwarden.toml");
        std::fs::write(
            &path,
            r#"
scan_mode = "RESPONSE_ONLY"
disabled_signatures = ["sig-3"]

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key = "sk-test"

[escalation]
timeout_secs = 5
"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.scan_mode, ScanMode::ResponseOnly);
        assert_eq!(settings.llm.provider, LlmProviderKind::OpenAI);
        assert_eq!(settings.llm.model_name(), "gpt-4o-mini");
        assert_eq!(settings.escalation.timeout_secs, 5);
        assert!(settings.escalation.enabled);
        assert!(!settings.is_signature_enabled("sig-3"));
        assert!(settings.is_signature_enabled("sig-1"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut settings = Settings::default();
        settings.login_token = Some("login-secret".to_string());
        settings.llm.api_key = Some("sk-secret".to_string());
        let rendered = toml::to_string(&settings).unwrap();
        assert!(!rendered.contains("login-secret"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_backend_requires_url() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.login_token = Some("token".to_string());
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_toggle_signature() {
        let mut settings = Settings::default();
        settings.set_signature_enabled("sig-1", false);
        assert!(!settings.is_signature_enabled("sig-1"));
        settings.set_signature_enabled("sig-1", true);
        assert!(settings.is_signature_enabled("sig-1"));
    }

    #[test]
    fn test_invalid_temperature() {
        let mut settings = Settings::default();
        settings.llm.provider = LlmProviderKind::OpenAI;
        settings.llm.temperature = 3.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        clear_env();
        env::set_var("TOOLWARDEN_SCAN_MODE", "REQUEST_ONLY");
        env::set_var("TOOLWARDEN_LLM_PROVIDER", "openai");
        env::set_var("OPENAI_API_KEY", "sk-from-env");
        env::set_var("TOOLWARDEN_LOGIN_TOKEN", "   ");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.scan_mode, ScanMode::RequestOnly);
        assert_eq!(settings.llm.provider, LlmProviderKind::OpenAI);
        assert_eq!(settings.llm.api_key.as_deref(), Some("sk-from-env"));
        assert!(settings.login_token.is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_scan_mode_env() {
        clear_env();
        env::set_var("TOOLWARDEN_SCAN_MODE", "ALWAYS");
        assert!(Settings::from_env().is_err());
        clear_env();
    }
}
