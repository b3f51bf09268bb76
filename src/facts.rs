//! System fact gathering.
//!
//! Facts become the node's automatic attributes. The first gather in a
//! process collects everything; later gathers only refresh the facts that can
//! change while the process runs.

use crate::error::Result;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

/// Collects facts about the machine a run executes on.
pub trait FactGatherer {
    fn gather(&mut self) -> Result<Map<String, Value>>;
}

/// Facts read from the running system.
pub struct SystemFacts {
    os_release: PathBuf,
    data: Map<String, Value>,
    gathered: bool,
}

impl Default for SystemFacts {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemFacts {
    pub fn new() -> Self {
        Self::with_os_release("/etc/os-release")
    }

    /// Read platform information from another os-release file.
    pub fn with_os_release(path: impl Into<PathBuf>) -> Self {
        Self {
            os_release: path.into(),
            data: Map::new(),
            gathered: false,
        }
    }

    fn collect_all(&mut self) {
        self.data.insert("os".into(), json!(std::env::consts::OS));
        self.data.insert("arch".into(), json!(std::env::consts::ARCH));

        let release = std::fs::read_to_string(&self.os_release)
            .map(|content| parse_os_release(&content))
            .unwrap_or_default();
        let (platform, version) = platform_and_version(&release);
        self.data.insert("platform".into(), json!(platform));
        self.data.insert("platform_version".into(), json!(version));

        self.refresh();
    }

    fn refresh(&mut self) {
        for (key, value) in [("hostname", hostname()), ("fqdn", fqdn())] {
            match value {
                Some(v) => self.data.insert(key.into(), json!(v)),
                None => self.data.remove(key),
            };
        }
    }
}

impl FactGatherer for SystemFacts {
    fn gather(&mut self) -> Result<Map<String, Value>> {
        if self.gathered {
            log::debug!("Refreshing system facts");
            self.refresh();
        } else {
            log::debug!("Gathering system facts");
            self.collect_all();
            self.gathered = true;
        }
        Ok(self.data.clone())
    }
}

/// Node identity from facts: the fqdn if known, else the short hostname.
pub fn node_name_from_facts(facts: &Map<String, Value>) -> Option<String> {
    ["fqdn", "hostname"]
        .into_iter()
        .filter_map(|key| facts.get(key)?.as_str())
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

fn hostname() -> Option<String> {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    command_output("hostname", &[])
}

fn fqdn() -> Option<String> {
    command_output("hostname", &["-f"]).filter(|name| name.contains('.'))
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// `KEY=value` pairs from an os-release file, quotes stripped.
fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.trim_matches('"').trim_matches('\'').to_string()))
        })
        .collect()
}

fn platform_and_version(release: &BTreeMap<String, String>) -> (String, String) {
    let platform = release
        .get("ID")
        .cloned()
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let version = release.get("VERSION_ID").cloned().unwrap_or_default();
    (platform, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_os_release() {
        let release = parse_os_release(
            "# comment\nNAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"24.04\"\n",
        );
        assert_eq!(
            platform_and_version(&release),
            ("ubuntu".to_string(), "24.04".to_string())
        );
    }

    #[test]
    fn test_platform_falls_back_to_os() {
        let (platform, version) = platform_and_version(&BTreeMap::new());
        assert_eq!(platform, std::env::consts::OS);
        assert!(version.is_empty());
    }

    #[test]
    fn test_gather_reads_os_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("os-release");
        std::fs::write(&path, "ID=debian\nVERSION_ID=12\n").unwrap();

        let mut facts = SystemFacts::with_os_release(&path);
        let first = facts.gather().unwrap();
        assert_eq!(first["platform"], "debian");
        assert_eq!(first["platform_version"], "12");
        assert_eq!(first["arch"], std::env::consts::ARCH);

        // A refresh keeps what it does not re-read.
        std::fs::write(&path, "ID=changed\n").unwrap();
        let second = facts.gather().unwrap();
        assert_eq!(second["platform"], "debian");
    }

    #[test]
    fn test_node_name_prefers_fqdn() {
        let mut facts = Map::new();
        facts.insert("hostname".into(), json!("web1"));
        assert_eq!(node_name_from_facts(&facts).as_deref(), Some("web1"));

        facts.insert("fqdn".into(), json!("web1.example.com"));
        assert_eq!(node_name_from_facts(&facts).as_deref(), Some("web1.example.com"));

        assert_eq!(node_name_from_facts(&Map::new()), None);
    }
}
