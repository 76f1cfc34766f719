//! Daemon configuration (ambient, C0).
//!
//! The embedded default below is the bundled router's configuration
//! fragment (§6): a flat `key=value`/`limit key=value` text format, not
//! XML — parsing the wider AllJoyn configuration XML is out of scope
//! (§1). An optional on-disk JSON override, deserialized with `serde`,
//! can patch individual fields (interface selector, address-family
//! enablement, listen port) without requiring a full fragment rewrite.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// The embedded default configuration fragment (§6).
pub const DEFAULT_CONFIG_FRAGMENT: &str = "\
listen=tcp:r4addr=0.0.0.0,r4port=0
limit auth_timeout=5000
limit max_incomplete_connections=4
limit max_completed_connections=16
limit max_untrusted_clients=0
ip_name_service.interfaces=*
ip_name_service.enable_ipv4=true
ip_name_service.enable_ipv6=true
";

/// A parsed `listen=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub transport: String,
    pub r4addr: String,
    pub r4port: u16,
}

/// The parsed `ip_name_service.*` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsConfig {
    pub interfaces: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

/// The fully resolved daemon configuration, after merging the embedded
/// default, any on-disk override, and CLI overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub listen: ListenSpec,
    pub auth_timeout_ms: u64,
    pub max_incomplete_connections: u32,
    pub max_completed_connections: u32,
    pub max_untrusted_clients: u32,
    pub ip_name_service: NsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        parse_fragment(DEFAULT_CONFIG_FRAGMENT).expect("embedded default config fragment is well-formed")
    }
}

/// The subset of [`DaemonConfig`] an on-disk JSON file may override. Every
/// field is optional; absent fields keep the embedded default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverride {
    pub interfaces: Option<String>,
    pub enable_ipv4: Option<bool>,
    pub enable_ipv6: Option<bool>,
    pub r4port: Option<u16>,
}

/// Parse the `key=value` / `limit key=value` fragment format (§6).
pub fn parse_fragment(text: &str) -> Result<DaemonConfig> {
    let mut config = DaemonConfig {
        listen: ListenSpec {
            transport: "tcp".into(),
            r4addr: "0.0.0.0".into(),
            r4port: 0,
        },
        auth_timeout_ms: 0,
        max_incomplete_connections: 0,
        max_completed_connections: 0,
        max_untrusted_clients: 0,
        ip_name_service: NsConfig {
            interfaces: "*".into(),
            enable_ipv4: true,
            enable_ipv6: true,
        },
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("listen=") {
            config.listen = parse_listen_spec(rest)?;
        } else if let Some(rest) = line.strip_prefix("limit ") {
            let (key, value) = split_once_eq(rest)?;
            match key {
                "auth_timeout" => config.auth_timeout_ms = parse_u64(value)?,
                "max_incomplete_connections" => config.max_incomplete_connections = parse_u32(value)?,
                "max_completed_connections" => config.max_completed_connections = parse_u32(value)?,
                "max_untrusted_clients" => config.max_untrusted_clients = parse_u32(value)?,
                other => return Err(Error::BusBadXml(format!("unknown limit {other:?}"))),
            }
        } else if let Some(rest) = line.strip_prefix("ip_name_service.") {
            let (key, value) = split_once_eq(rest)?;
            match key {
                "interfaces" => config.ip_name_service.interfaces = value.to_string(),
                "enable_ipv4" => config.ip_name_service.enable_ipv4 = parse_bool(value)?,
                "enable_ipv6" => config.ip_name_service.enable_ipv6 = parse_bool(value)?,
                other => return Err(Error::BusBadXml(format!("unknown ip_name_service key {other:?}"))),
            }
        } else {
            return Err(Error::BusBadXml(format!("unrecognised config line {line:?}")));
        }
    }

    Ok(config)
}

fn parse_listen_spec(rest: &str) -> Result<ListenSpec> {
    let (transport, fields) = rest
        .split_once(':')
        .ok_or_else(|| Error::BusBadXml(format!("malformed listen spec {rest:?}")))?;

    let mut spec = ListenSpec {
        transport: transport.to_string(),
        r4addr: "0.0.0.0".to_string(),
        r4port: 0,
    };
    for field in fields.split(',') {
        let (key, value) = split_once_eq(field)?;
        match key {
            "r4addr" => spec.r4addr = value.to_string(),
            "r4port" => spec.r4port = parse_u16(value)?,
            other => return Err(Error::BusBadXml(format!("unknown listen field {other:?}"))),
        }
    }
    Ok(spec)
}

fn split_once_eq(field: &str) -> Result<(&str, &str)> {
    field
        .split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| Error::BusBadXml(format!("missing '=' in {field:?}")))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::BusBadXml(format!("expected true/false, got {other:?}"))),
    }
}

fn parse_u16(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::BusBadXml(format!("expected a port number, got {value:?}")))
}

fn parse_u32(value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::BusBadXml(format!("expected an integer, got {value:?}")))
}

fn parse_u64(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::BusBadXml(format!("expected an integer, got {value:?}")))
}

/// Load the daemon configuration: start from the embedded default, apply an
/// optional on-disk JSON override, then apply the `--interfaces` CLI flag
/// if present (taking precedence over both).
pub fn load(override_path: Option<&Path>, interfaces_cli: Option<&str>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::default();

    if let Some(path) = override_path {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoSuchFile(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let over: ConfigOverride = serde_json::from_str(&contents)
            .map_err(|e| Error::ParseError(format!("{}: {e}", path.display())))?;
        apply_override(&mut config, over);
    }

    if let Some(interfaces) = interfaces_cli {
        config.ip_name_service.interfaces = interfaces.to_string();
    }

    Ok(config)
}

fn apply_override(config: &mut DaemonConfig, over: ConfigOverride) {
    if let Some(interfaces) = over.interfaces {
        config.ip_name_service.interfaces = interfaces;
    }
    if let Some(enable_ipv4) = over.enable_ipv4 {
        config.ip_name_service.enable_ipv4 = enable_ipv4;
    }
    if let Some(enable_ipv6) = over.enable_ipv6 {
        config.ip_name_service.enable_ipv6 = enable_ipv6;
    }
    if let Some(r4port) = over.r4port {
        config.listen.r4port = r4port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_embedded_fragment() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen.r4addr, "0.0.0.0");
        assert_eq!(config.listen.r4port, 0);
        assert_eq!(config.auth_timeout_ms, 5000);
        assert_eq!(config.max_incomplete_connections, 4);
        assert_eq!(config.max_completed_connections, 16);
        assert_eq!(config.max_untrusted_clients, 0);
        assert_eq!(config.ip_name_service.interfaces, "*");
        assert!(config.ip_name_service.enable_ipv4);
        assert!(config.ip_name_service.enable_ipv6);
    }

    #[test]
    fn rejects_unknown_limit_key() {
        let err = parse_fragment("limit bogus=1\n").unwrap_err();
        assert!(matches!(err, Error::BusBadXml(_)));
    }

    #[test]
    fn rejects_malformed_listen_spec() {
        let err = parse_fragment("listen=tcp\n").unwrap_err();
        assert!(matches!(err, Error::BusBadXml(_)));
    }

    #[test]
    fn json_override_patches_selected_fields() {
        let dir = std::env::temp_dir().join(format!("busd-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("busd.json");
        std::fs::write(&path, r#"{"interfaces": "eth0", "enable_ipv6": false}"#).unwrap();

        let config = load(Some(&path), None).unwrap();
        assert_eq!(config.ip_name_service.interfaces, "eth0");
        assert!(!config.ip_name_service.enable_ipv6);
        assert!(config.ip_name_service.enable_ipv4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cli_interfaces_flag_takes_precedence_over_json_override() {
        let dir = std::env::temp_dir().join(format!("busd-config-test-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("busd.json");
        std::fs::write(&path, r#"{"interfaces": "eth0"}"#).unwrap();

        let config = load(Some(&path), Some("wlan0")).unwrap();
        assert_eq!(config.ip_name_service.interfaces, "wlan0");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_override_file_is_no_such_file() {
        let path = Path::new("/nonexistent/busd-config-test.json");
        let err = load(Some(path), None).unwrap_err();
        assert!(matches!(err, Error::NoSuchFile(_)));
    }
}
