pub mod schema;

pub use schema::{ArchiveConfig, Config, GatewayConfig, RealtimeConfig, SessionConfig};

use anyhow::Context;
use directories::UserDirs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".lingocall";

/// `~/.lingocall`
pub fn default_config_dir() -> anyhow::Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(CONFIG_DIR))
}

impl Config {
    /// Load `path` (or `~/.lingocall/config.toml`), apply environment
    /// overrides and validate. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_dir()?.join("config.toml"),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            Self::from_toml(&contents)?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default()
        };
        config.config_path = config_path;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))
    }

    /// `OPENAI_API_KEY` and `LINGOCALL_ISSUER_URL` win over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.gateway.api_key = Some(key.trim().to_string());
        }
        if let Some(url) = lookup("LINGOCALL_ISSUER_URL").filter(|u| !u.trim().is_empty()) {
            self.session.issuer_url = url.trim().to_string();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.issuance_attempts == 0 {
            anyhow::bail!("session.issuance_attempts must be at least 1");
        }
        if self.session.negotiation_timeout_secs == 0 {
            anyhow::bail!("session.negotiation_timeout_secs must be greater than 0");
        }
        if self.session.http_timeout_secs == 0 {
            anyhow::bail!("session.http_timeout_secs must be greater than 0");
        }
        if self.realtime.ice_servers.is_empty() {
            anyhow::bail!("realtime.ice_servers must list at least one STUN server");
        }
        if self.realtime.model.trim().is_empty() {
            anyhow::bail!("realtime.model must not be empty");
        }
        Ok(())
    }

    pub fn archive_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.archive.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(default_config_dir()?.join("conversations")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::Voice;
    use std::time::Duration;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.session.refresh_margin_secs, 10);
        assert_eq!(config.session.issuance_attempts, 3);
        assert_eq!(config.realtime.data_channel_label, "oai-events");
        assert_eq!(config.gateway.port, 8787);
        config.validate().unwrap();
    }

    #[test]
    fn sections_parse() {
        let toml_str = r#"
[realtime]
model = "gpt-4o-mini-realtime-preview"
ice_servers = ["stun:stun.example.org:3478"]

[session]
voice = "verse"
instructions = "Speak slowly, in Spanish."
refresh_margin_secs = 20

[gateway]
port = 9090
rate_limit_per_minute = 0

[archive]
dir = "/tmp/lingocall"
"#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.realtime.model, "gpt-4o-mini-realtime-preview");
        assert_eq!(config.session.voice, Voice::Verse);
        assert_eq!(config.session.refresh_margin_secs, 20);
        assert_eq!(config.gateway.port, 9090);
        assert_eq!(config.archive_dir().unwrap(), PathBuf::from("/tmp/lingocall"));

        let coordinator = crate::voice::CoordinatorConfig::from_config(&config);
        assert_eq!(coordinator.refresh_margin, Duration::from_secs(20));
        assert_eq!(coordinator.instructions.as_deref(), Some("Speak slowly, in Spanish."));
    }

    #[test]
    fn transcription_model_defaults_agree() {
        use crate::voice::events::{SessionSettings, DEFAULT_TRANSCRIPTION_MODEL};

        let config = Config::default();
        assert_eq!(config.realtime.transcription_model, DEFAULT_TRANSCRIPTION_MODEL);
        assert_eq!(
            crate::voice::CoordinatorConfig::default().transcription_model,
            DEFAULT_TRANSCRIPTION_MODEL
        );
        let settings = SessionSettings::new(Voice::Alloy);
        assert_eq!(
            settings.input_audio_transcription.map(|t| t.model).as_deref(),
            Some(DEFAULT_TRANSCRIPTION_MODEL)
        );
    }

    #[test]
    fn forwarded_headers_are_untrusted_by_default() {
        assert!(!Config::default().gateway.trust_forwarded_headers);
        let config = Config::from_toml("[gateway]\ntrust_forwarded_headers = true\n").unwrap();
        assert!(config.gateway.trust_forwarded_headers);
    }

    #[test]
    fn unknown_voice_is_rejected() {
        let err = Config::from_toml("[session]\nvoice = \"robot\"\n").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "OPENAI_API_KEY" => Some(" sk-test ".to_string()),
            "LINGOCALL_ISSUER_URL" => Some("https://issuer.example.com".to_string()),
            _ => None,
        });
        assert_eq!(config.gateway.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.session.issuer_url, "https://issuer.example.com");
    }

    #[test]
    fn validate_rejects_zero_attempts_and_empty_stun() {
        let mut config = Config::default();
        config.session.issuance_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.realtime.ice_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = Config::default();
        config.gateway.api_key = Some("sk-secret".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 7000\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 7000);
        assert_eq!(config.config_path, path);
    }
}
