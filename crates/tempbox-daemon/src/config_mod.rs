use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use tempbox_core::DEFAULT_ALIAS_TTL;
use tempbox_mail::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_POLL_INTERVAL, ImapConfig, IngestSettings, RetryPolicy,
};

pub(crate) const CONFIG_FILE_NAME: &str = "tempbox.toml";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DaemonConfig {
    pub(crate) imap: ImapConfig,
    pub(crate) alias: AliasConfig,
    pub(crate) ingest: IngestConfig,
    pub(crate) db_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AliasConfig {
    pub(crate) domain: String,
    pub(crate) ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IngestConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) reconnect_interval: Duration,
    pub(crate) cleanup_interval: Duration,
}

impl DaemonConfig {
    pub(crate) fn ingest_settings(&self) -> IngestSettings {
        let retry = RetryPolicy::forever(self.ingest.reconnect_interval);
        IngestSettings {
            connection: self.imap.connection_settings(retry),
            poll_interval: self.ingest.poll_interval,
            cleanup_interval: self.ingest.cleanup_interval,
        }
    }
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub(crate) fn default_config_path() -> PathBuf {
    xdg_config_dir().join("tempbox").join(CONFIG_FILE_NAME)
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![PathBuf::from(CONFIG_FILE_NAME), default_config_path()]
}

/// Loads the config from `explicit`, or from the first search path that
/// exists. When nothing is found a template is written and an error returned.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<DaemonConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path_candidates().into_iter().find(|p| p.exists()) {
            Some(path) => path,
            None => {
                let path = default_config_path();
                write_text_atomic(&path, default_config_template())?;
                return Err(anyhow!(
                    "no config found; wrote a template to {}, fill in [imap] and [alias]",
                    path.display()
                ));
            }
        },
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut config =
        parse_config(&content).with_context(|| format!("parsing config {}", path.display()))?;
    config.db_path = resolve_db_path(&config.db_path);
    Ok(config)
}

pub(crate) fn parse_config(content: &str) -> Result<DaemonConfig> {
    let value: toml::Value = toml::from_str(content)?;
    let imap = value
        .get("imap")
        .ok_or_else(|| anyhow!("missing [imap] table"))?;
    let alias = value
        .get("alias")
        .ok_or_else(|| anyhow!("missing [alias] table"))?;
    let empty = toml::Value::Table(Default::default());
    let ingest = value.get("ingest").unwrap_or(&empty);
    let store = value.get("store").unwrap_or(&empty);

    Ok(DaemonConfig {
        imap: parse_imap_table(imap)?,
        alias: AliasConfig {
            domain: required_str(alias, "alias", "domain")?,
            ttl: seconds(alias, "ttl_secs").unwrap_or(DEFAULT_ALIAS_TTL),
        },
        ingest: IngestConfig {
            poll_interval: seconds(ingest, "poll_interval_secs").unwrap_or(DEFAULT_POLL_INTERVAL),
            reconnect_interval: seconds(ingest, "reconnect_interval_secs")
                .unwrap_or(RetryPolicy::DEFAULT_INTERVAL),
            cleanup_interval: seconds(ingest, "cleanup_interval_secs")
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL),
        },
        db_path: store
            .get("db_path")
            .and_then(|v| v.as_str())
            .unwrap_or("tempbox.db")
            .to_string(),
    })
}

fn parse_imap_table(imap: &toml::Value) -> Result<ImapConfig> {
    Ok(ImapConfig {
        host: required_str(imap, "imap", "host")?,
        port: parse_port(imap)?,
        username: required_str(imap, "imap", "username")?,
        password: required_str(imap, "imap", "password")?,
        mailbox: imap
            .get("mailbox")
            .and_then(|v| v.as_str())
            .unwrap_or("INBOX")
            .to_string(),
        skip_tls_verify: imap
            .get("skip_tls_verify")
            .and_then(parse_bool)
            .unwrap_or(false),
        fetch_chunk_size: imap
            .get("fetch_chunk_size")
            .and_then(|v| v.as_integer())
            .map(|v| v.clamp(1, 50) as usize)
            .unwrap_or(10),
        timeout_secs: imap
            .get("timeout_secs")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(60),
    })
}

fn parse_port(imap: &toml::Value) -> Result<u16> {
    let Some(raw) = imap.get("port").and_then(|v| v.as_integer()) else {
        return Ok(993);
    };
    u16::try_from(raw)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| anyhow!("imap.port {} is out of range", raw))
}

fn required_str(table: &toml::Value, section: &str, key: &str) -> Result<String> {
    table
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("missing {}.{}", section, key))
}

fn seconds(table: &toml::Value, key: &str) -> Option<Duration> {
    let secs = table.get(key)?.as_integer()?;
    Some(Duration::from_secs(secs.max(1) as u64))
}

fn parse_bool(value: &toml::Value) -> Option<bool> {
    value.as_bool().or_else(|| {
        value
            .as_str()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
    })
}

fn resolve_db_path(raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() || raw.starts_with("sqlite:") {
        return raw.to_string();
    }
    let dir = xdg_state_dir().join("tempbox");
    let _ = std::fs::create_dir_all(&dir);
    dir.join(path).to_string_lossy().to_string()
}

pub(crate) fn default_config_template() -> &'static str {
    r#"# Auto-generated by tempbox.
# Fill in the upstream catch-all mailbox and the alias domain.

[imap]
host = "imap.example.com"
port = 993
username = "catchall@example.com"
password = ""
mailbox = "INBOX"
skip_tls_verify = false
fetch_chunk_size = 10
timeout_secs = 60

[alias]
domain = "example.com"
ttl_secs = 300

[ingest]
poll_interval_secs = 2
reconnect_interval_secs = 5
cleanup_interval_secs = 600

[store]
# Relative paths land in $XDG_STATE_HOME/tempbox.
db_path = "tempbox.db"
"#
}

pub(crate) fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    if path.exists() {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        return Ok(());
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
