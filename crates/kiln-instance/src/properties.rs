//! Reading and rewriting `server.properties`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_protocol::InstanceConfiguration;

use crate::BindingEndpoint;

pub const PROPERTIES_FILE: &str = "server.properties";

/// An ordered `key=value` file. Keys keep their first position; later
/// sets overwrite the value in place.
#[derive(Debug, Clone)]
pub struct ServerProperties {
    path: PathBuf,
    entries: Vec<(String, String)>,
}

impl ServerProperties {
    /// Loads `path`, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let mut properties = Self {
            path,
            entries: Vec::new(),
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    properties.set(key, value.trim());
                }
            }
        }
        Ok(properties)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Applies the instance settings on top of whatever the package
    /// shipped. Typed settings win over `extra`, and the binding wins
    /// over both.
    pub fn apply(&mut self, configuration: &InstanceConfiguration, binding: &BindingEndpoint) {
        self.set("snooper-enabled", false);
        for (key, value) in &configuration.extra {
            self.set(key, value);
        }
        self.set("motd", &configuration.motd);
        self.set("enable-command-block", configuration.enable_command_blocks);
        self.set("max-players", configuration.max_players);
        self.set(
            "announce-player-achievements",
            configuration.announce_player_achievements,
        );
        self.set("server-ip", binding.server_ip());
        self.set("server-port", binding.port);
    }

    pub fn save(&self) -> io::Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut text = format!("#Minecraft server properties\n#Written by kiln at unix time {stamp}\n");
        for (key, value) in &self.entries {
            text.push_str(key);
            text.push('=');
            text.push_str(value);
            text.push('\n');
        }
        fs::write(&self.path, text)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_order_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROPERTIES_FILE);
        fs::write(
            &path,
            "#comment\n  motd = Package MOTD \nserver-port=1\nlevel-seed=42\nbroken line\n",
        )
        .unwrap();

        let mut configuration = InstanceConfiguration::default();
        configuration.motd = "Kiln".into();
        configuration.max_players = 8;
        configuration.extra.insert("level-seed".into(), "7".into());
        configuration.extra.insert("motd".into(), "ignored".into());

        let mut props = ServerProperties::load(&path).unwrap();
        props.apply(&configuration, &"0.0.0.0:25570".parse().unwrap());
        props.save().unwrap();

        let reloaded = ServerProperties::load(&path).unwrap();
        assert_eq!(reloaded.get("motd"), Some("Kiln"));
        assert_eq!(reloaded.get("level-seed"), Some("7"));
        assert_eq!(reloaded.get("max-players"), Some("8"));
        assert_eq!(reloaded.get("snooper-enabled"), Some("false"));
        assert_eq!(reloaded.get("server-ip"), Some(""));
        assert_eq!(reloaded.get("server-port"), Some("25570"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#Minecraft server properties\n"));
        // Package keys keep their original position.
        assert!(text.find("motd=").unwrap() < text.find("level-seed=").unwrap());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let props = ServerProperties::load(dir.path().join(PROPERTIES_FILE)).unwrap();
        assert_eq!(props.get("motd"), None);
    }
}
