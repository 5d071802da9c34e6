//! Shared wire types: instance status, instance configuration and the
//! per-instance summary carried by `List`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BufferError, ByteBuffer, ProtocolError};

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a supervised instance.
///
/// ```text
/// Idle → Starting → Running → Stopping → Stopped
///           │          │          │
///           └──────────┴──────────┴────→ Error
/// ```
///
/// `Starting` may also go straight to `Stopping` or `Stopped` when the
/// process is asked to stop, or exits, before it reports ready.
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum InstanceStatus {
    #[default]
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Error = 5,
}

impl InstanceStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns `true` while commands, shutdown and terminate are accepted.
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Returns `true` if moving from `self` to `target` is a legal step.
    pub fn can_transition_to(self, target: Self) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Running | Stopping | Stopped | Error)
                | (Running, Stopping | Stopped | Error)
                | (Stopping, Stopped | Error)
        )
    }
}

impl TryFrom<i32> for InstanceStatus {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, ProtocolError> {
        use InstanceStatus::*;
        let status = match value {
            0 => Idle,
            1 => Starting,
            2 => Running,
            3 => Stopping,
            4 => Stopped,
            5 => Error,
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unknown instance status {other}"
                )));
            }
        };
        Ok(status)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// InstanceConfiguration
// ---------------------------------------------------------------------------

/// Per-instance settings chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfiguration {
    pub motd: String,
    pub enable_command_blocks: bool,
    /// 1..=32
    pub max_players: i32,
    pub announce_player_achievements: bool,
    pub java_executable: String,
    /// 1..=32768
    pub java_initial_memory_mb: i32,
    /// 1..=32768
    pub java_maximum_memory_mb: i32,
    pub jar_filename: String,
    /// Extra `server.properties` entries. Typed fields override these.
    pub extra: BTreeMap<String, String>,
}

impl InstanceConfiguration {
    pub const MAX_PLAYERS: std::ops::RangeInclusive<i32> = 1..=32;
    pub const MEMORY_MB: std::ops::RangeInclusive<i32> = 1..=32768;

    /// Defaults with the given Java executable.
    pub fn with_java(java_executable: impl Into<String>) -> Self {
        Self {
            motd: "Minecraft".to_string(),
            enable_command_blocks: true,
            max_players: 20,
            announce_player_achievements: true,
            java_executable: java_executable.into(),
            java_initial_memory_mb: 256,
            java_maximum_memory_mb: 1024,
            jar_filename: "server.jar".to_string(),
            extra: BTreeMap::new(),
        }
    }

    /// Checks required fields and numeric ranges.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |msg: String| Err(ProtocolError::InvalidConfiguration(msg));

        if self.motd.is_empty() {
            return invalid("motd is required".into());
        }
        if self.java_executable.is_empty() {
            return invalid("java_executable is required".into());
        }
        if self.jar_filename.is_empty() {
            return invalid("jar_filename is required".into());
        }
        if !Self::MAX_PLAYERS.contains(&self.max_players) {
            return invalid(format!(
                "max_players {} is outside {:?}",
                self.max_players,
                Self::MAX_PLAYERS
            ));
        }
        for (name, value) in [
            ("java_initial_memory_mb", self.java_initial_memory_mb),
            ("java_maximum_memory_mb", self.java_maximum_memory_mb),
        ] {
            if !Self::MEMORY_MB.contains(&value) {
                return invalid(format!("{name} {value} is outside {:?}", Self::MEMORY_MB));
            }
        }
        if self.java_initial_memory_mb > self.java_maximum_memory_mb {
            return invalid("java_initial_memory_mb exceeds java_maximum_memory_mb".into());
        }
        if self
            .extra
            .keys()
            .any(|key| key.is_empty() || key.contains(['=', '\n', '\r']))
        {
            return invalid("extra keys must be non-empty and contain no '=' or line breaks".into());
        }
        Ok(())
    }

    /// Serializes in field order, then the extras as a count and pairs.
    pub fn write_to(&self, buf: &mut ByteBuffer) -> Result<(), BufferError> {
        buf.write_str(&self.motd)?;
        buf.write_bool(self.enable_command_blocks)?;
        buf.write_i32(self.max_players)?;
        buf.write_bool(self.announce_player_achievements)?;
        buf.write_str(&self.java_executable)?;
        buf.write_i32(self.java_initial_memory_mb)?;
        buf.write_i32(self.java_maximum_memory_mb)?;
        buf.write_str(&self.jar_filename)?;

        let count = i32::try_from(self.extra.len()).map_err(|_| BufferError::Overflow {
            requested: self.extra.len(),
            max: i32::MAX as usize,
        })?;
        buf.write_i32(count)?;
        for (key, value) in &self.extra {
            buf.write_str(key)?;
            buf.write_str(value)?;
        }
        Ok(())
    }

    pub fn read_from(buf: &mut ByteBuffer) -> Result<Self, BufferError> {
        let motd = buf.read_string()?;
        let enable_command_blocks = buf.read_bool()?;
        let max_players = buf.read_i32()?;
        let announce_player_achievements = buf.read_bool()?;
        let java_executable = buf.read_string()?;
        let java_initial_memory_mb = buf.read_i32()?;
        let java_maximum_memory_mb = buf.read_i32()?;
        let jar_filename = buf.read_string()?;

        let count = buf.read_i32()?;
        if count < 0 {
            return Err(BufferError::NegativeLength(count));
        }
        let mut extra = BTreeMap::new();
        for _ in 0..count {
            let key = buf.read_string()?;
            let value = buf.read_string()?;
            extra.insert(key, value);
        }

        Ok(Self {
            motd,
            enable_command_blocks,
            max_players,
            announce_player_achievements,
            java_executable,
            java_initial_memory_mb,
            java_maximum_memory_mb,
            jar_filename,
            extra,
        })
    }
}

impl Default for InstanceConfiguration {
    fn default() -> Self {
        Self::with_java("java")
    }
}

// ---------------------------------------------------------------------------
// InstanceSummary
// ---------------------------------------------------------------------------

/// One entry of a `List` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    pub status: InstanceStatus,
    pub package_name: String,
    pub configuration: InstanceConfiguration,
}

impl InstanceSummary {
    pub fn write_to(&self, buf: &mut ByteBuffer) -> Result<(), BufferError> {
        buf.write_str(&self.id)?;
        buf.write_i32(self.status.as_i32())?;
        buf.write_str(&self.package_name)?;
        self.configuration.write_to(buf)
    }

    pub fn read_from(buf: &mut ByteBuffer) -> Result<Self, ProtocolError> {
        let id = buf.read_string()?;
        let status = InstanceStatus::try_from(buf.read_i32()?)?;
        let package_name = buf.read_string()?;
        let configuration = InstanceConfiguration::read_from(buf)?;
        Ok(Self {
            id,
            status,
            package_name,
            configuration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_values() {
        assert_eq!(InstanceStatus::Idle.as_i32(), 0);
        assert_eq!(InstanceStatus::Starting.as_i32(), 1);
        assert_eq!(InstanceStatus::Error.as_i32(), 5);
        assert_eq!(InstanceStatus::try_from(3).unwrap(), InstanceStatus::Stopping);
        assert!(InstanceStatus::try_from(6).is_err());
    }

    #[test]
    fn test_status_transitions() {
        use InstanceStatus::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(!Idle.can_transition_to(Running));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Stopped));
    }

    #[test]
    fn test_status_accepts_commands() {
        use InstanceStatus::*;
        assert!(!Idle.accepts_commands());
        assert!(Starting.accepts_commands());
        assert!(Running.accepts_commands());
        assert!(!Stopping.accepts_commands());
        assert!(!Stopped.accepts_commands());
        assert!(!Error.accepts_commands());
        assert!(Stopped.is_terminal() && Error.is_terminal());
    }

    #[test]
    fn test_configuration_defaults_are_valid() {
        let config = InstanceConfiguration::with_java("/usr/bin/java");
        assert_eq!(config.motd, "Minecraft");
        assert_eq!(config.max_players, 20);
        assert_eq!(config.java_initial_memory_mb, 256);
        assert_eq!(config.java_maximum_memory_mb, 1024);
        assert_eq!(config.jar_filename, "server.jar");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_validation_rules() {
        let base = InstanceConfiguration::default();

        let mut c = base.clone();
        c.motd.clear();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.max_players = 33;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.max_players = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.java_maximum_memory_mb = 40000;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.java_initial_memory_mb = 2048;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.jar_filename.clear();
        assert!(c.validate().is_err());

        let mut c = base;
        c.extra.insert("bad=key".into(), "x".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_configuration_wire_layout() {
        let mut config = InstanceConfiguration::default();
        config.extra.insert("difficulty".into(), "hard".into());

        let mut buf = ByteBuffer::new();
        config.write_to(&mut buf).unwrap();

        let mut expected = ByteBuffer::new();
        expected.write_str("Minecraft").unwrap();
        expected.write_bool(true).unwrap();
        expected.write_i32(20).unwrap();
        expected.write_bool(true).unwrap();
        expected.write_str("java").unwrap();
        expected.write_i32(256).unwrap();
        expected.write_i32(1024).unwrap();
        expected.write_str("server.jar").unwrap();
        expected.write_i32(1).unwrap();
        expected.write_str("difficulty").unwrap();
        expected.write_str("hard").unwrap();
        assert_eq!(buf.as_slice(), expected.as_slice());

        assert_eq!(InstanceConfiguration::read_from(&mut buf).unwrap(), config);
    }

    #[test]
    fn test_truncated_configuration_underflows() {
        let mut buf = ByteBuffer::new();
        buf.write_str("Minecraft").unwrap();
        assert!(matches!(
            InstanceConfiguration::read_from(&mut buf),
            Err(BufferError::Underflow { .. })
        ));
    }
}
