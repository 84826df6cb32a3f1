use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TribridgeConfig {
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub qq: QqConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QqConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gateway_url")]
    pub url: String,
    /// The gateway account's own numeric id, used to filter echoed events.
    #[serde(default)]
    pub self_id: i64,
    #[serde(default)]
    pub group_id: i64,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:8080/gateway".to_string()
}

impl Default for QqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_gateway_url(),
            self_id: 0,
            group_id: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub channel_id: u64,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("enabled", &self.enabled)
            .field("token", &mask_secret(&self.token))
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: i64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("enabled", &self.enabled)
            .field("token", &mask_secret(&self.token))
            .field("chat_id", &self.chat_id)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            chat_id: 0,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    #[serde(default = "default_retention_mins")]
    pub retention_mins: u64,
    /// Download directory. Defaults to a tribridge folder in the system
    /// temp directory.
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_retention_mins() -> u64 {
    30
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            retention_mins: default_retention_mins(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_buffer_size() -> usize {
    256
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_command_timeout() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            dedup_capacity: default_dedup_capacity(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tribridge")
}

impl TribridgeConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Enforce config file permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                // Refuse to start if group or other can read (mode & 0o077 != 0)
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `tribridge init` first.",
                path.display()
            )
        })?;

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        // Check for hardcoded tokens
        if !config.channels.discord.token.is_empty()
            && !config.channels.discord.token.contains("${")
        {
            warn!(
                "Discord token is hardcoded in config file. For security, use environment variables: token = \"${{DISCORD_BOT_TOKEN}}\""
            );
        }

        if !config.channels.telegram.token.is_empty()
            && !config.channels.telegram.token.contains("${")
        {
            warn!(
                "Telegram token is hardcoded in config file. For security, use environment variables: token = \"${{TELEGRAM_BOT_TOKEN}}\""
            );
        }

        Ok(config)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "DISCORD_BOT_TOKEN",
    "TELEGRAM_BOT_TOKEN",
    "TRIBRIDGE_GATEWAY_URL",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        if let Some(start) = result[pos..].find("${") {
            let abs_start = pos + start;
            if let Some(end) = result[abs_start..].find('}') {
                let var_name = result[abs_start + 2..abs_start + end].to_string();

                // Only expand variables in the allowlist
                let value = if ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
                    std::env::var(&var_name).unwrap_or_default()
                } else {
                    warn!(
                        "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                        var_name
                    );
                    // Leave the ${VAR} unexpanded so it's obvious
                    pos = abs_start + end + 1;
                    continue;
                };

                let value_len = value.len();
                result = format!(
                    "{}{}{}",
                    &result[..abs_start],
                    value,
                    &result[abs_start + end + 1..]
                );
                pos = abs_start + value_len; // Skip past the expanded value
            } else {
                break;
            }
        } else {
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let raw = include_str!("../../../config/default.toml");
        let cfg: TribridgeConfig = toml::from_str(raw).expect("default config");
        assert!(!cfg.channels.qq.enabled);
        assert_eq!(cfg.relay.dedup_capacity, 1000);
        assert_eq!(cfg.attachments.retention_mins, 30);
        assert_eq!(cfg.channels.telegram.poll_timeout_secs, 30);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("abcdefghijkl"), "abc...ijkl");
    }

    #[test]
    fn test_expand_env_vars_respects_allowlist() {
        unsafe {
            std::env::set_var("DISCORD_BOT_TOKEN", "tok123");
        }
        let expanded = expand_env_vars("token = \"${DISCORD_BOT_TOKEN}\"");
        assert_eq!(expanded, "token = \"tok123\"");

        let kept = expand_env_vars("token = \"${NOT_ALLOWED_VAR}\"");
        assert_eq!(kept, "token = \"${NOT_ALLOWED_VAR}\"");
    }
}
