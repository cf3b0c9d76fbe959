//! Environment channel between process generations.
//!
//! The environment is the only control-plane IPC between an old and a new
//! generation. Every key lives under a caller-chosen prefix:
//!
//! - `<PREFIX>_LISTENER_FD_<NAME>` — inherited descriptor for listener `<NAME>`
//!   (absent or `0` means bind fresh)
//! - `<PREFIX>_TRANSITIONAL` — present in a Transitional generation
//! - `<PREFIX>_TRANSITIONAL_PID` — pid the new Primary must signal and reap
//! - `<PREFIX>_READY_FD` — socket a Transitional writes to once it is serving
//!
//! Lookups are independent per key; no ordering is implied.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Role of the running generation, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationRole {
    /// Accepts fresh connections and owns the restart sequence.
    Primary,
    /// Serves the hand-off window, then drains and exits. Never re-execs.
    Transitional,
}

impl fmt::Display for GenerationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationRole::Primary => write!(f, "primary"),
            GenerationRole::Transitional => write!(f, "transitional"),
        }
    }
}

/// Descriptor numbers and pids carried from one generation to the next.
///
/// Listener entries are keyed by their environment suffix (see
/// [`listener_suffix`]). Numbers only mean something inside the receiving
/// process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffEnvelope {
    listeners: BTreeMap<String, RawFd>,
    transitional_pid: Option<i32>,
    ready_fd: Option<RawFd>,
}

impl HandoffEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_listener(&mut self, name: &str, fd: RawFd) {
        self.listeners.insert(listener_suffix(name), fd);
    }

    pub fn listener(&self, name: &str) -> Option<RawFd> {
        self.listeners.get(&listener_suffix(name)).copied()
    }

    /// Listener entries as `(suffix, fd)` pairs.
    pub fn listeners(&self) -> impl Iterator<Item = (&str, RawFd)> {
        self.listeners.iter().map(|(k, fd)| (k.as_str(), *fd))
    }

    pub fn transitional_pid(&self) -> Option<i32> {
        self.transitional_pid
    }

    pub fn set_transitional_pid(&mut self, pid: Option<i32>) {
        self.transitional_pid = pid;
    }

    pub fn ready_fd(&self) -> Option<RawFd> {
        self.ready_fd
    }

    pub fn set_ready_fd(&mut self, fd: Option<RawFd>) {
        self.ready_fd = fd;
    }

    /// True when nothing was inherited (cold start).
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.transitional_pid.is_none() && self.ready_fd.is_none()
    }
}

/// What a process learns about itself from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub role: GenerationRole,
    pub envelope: HandoffEnvelope,
}

/// Map a listener name onto its environment key suffix.
///
/// `public` becomes `PUBLIC`, `xmpp-c2s` becomes `XMPP_C2S`.
pub fn listener_suffix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Encodes and decodes [`HandoffEnvelope`]s into environment tables.
#[derive(Debug, Clone)]
pub struct EnvironmentChannel {
    prefix: String,
}

impl EnvironmentChannel {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn listener_prefix(&self) -> String {
        format!("{}_LISTENER_FD_", self.prefix)
    }

    pub fn listener_key(&self, name: &str) -> String {
        format!("{}{}", self.listener_prefix(), listener_suffix(name))
    }

    pub fn transitional_key(&self) -> String {
        format!("{}_TRANSITIONAL", self.prefix)
    }

    pub fn transitional_pid_key(&self) -> String {
        format!("{}_TRANSITIONAL_PID", self.prefix)
    }

    pub fn ready_key(&self) -> String {
        format!("{}_READY_FD", self.prefix)
    }

    fn is_channel_key(&self, key: &str) -> bool {
        key.starts_with(&self.listener_prefix())
            || key == self.transitional_key()
            || key == self.transitional_pid_key()
            || key == self.ready_key()
    }

    /// Decode the current process environment.
    ///
    /// Entries that are not valid UTF-8 cannot belong to the channel and are
    /// skipped.
    pub fn decode_process_env(&self) -> Result<Generation> {
        self.decode(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Decode a generation from `(key, value)` pairs.
    ///
    /// Absent keys decode to "absent"; a malformed number is an error.
    pub fn decode<I, K, V>(&self, vars: I) -> Result<Generation>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let listener_prefix = self.listener_prefix();
        let transitional_key = self.transitional_key();
        let pid_key = self.transitional_pid_key();
        let ready_key = self.ready_key();

        let mut role = GenerationRole::Primary;
        let mut envelope = HandoffEnvelope::new();

        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            if let Some(suffix) = key.strip_prefix(&listener_prefix) {
                if let Some(fd) = parse_optional(key, value)? {
                    envelope.listeners.insert(suffix.to_string(), fd);
                }
            } else if key == transitional_key {
                role = GenerationRole::Transitional;
            } else if key == pid_key {
                envelope.transitional_pid = parse_optional(key, value)?;
            } else if key == ready_key {
                envelope.ready_fd = parse_optional(key, value)?;
            }
        }

        Ok(Generation { role, envelope })
    }

    /// Encode `envelope` for a generation that will run as `role`.
    pub fn encode(&self, envelope: &HandoffEnvelope, role: GenerationRole) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = envelope
            .listeners
            .iter()
            .map(|(suffix, fd)| (format!("{}{}", self.listener_prefix(), suffix), fd.to_string()))
            .collect();

        if role == GenerationRole::Transitional {
            vars.push((self.transitional_key(), "1".to_string()));
        }
        if let Some(pid) = envelope.transitional_pid {
            vars.push((self.transitional_pid_key(), pid.to_string()));
        }
        if let Some(fd) = envelope.ready_fd {
            vars.push((self.ready_key(), fd.to_string()));
        }

        vars
    }

    /// Build the full environment for the next generation: `base` with every
    /// inherited channel key removed, plus the encoded `envelope`.
    pub fn merge<I>(
        &self,
        base: I,
        envelope: &HandoffEnvelope,
        role: GenerationRole,
    ) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut env: Vec<(OsString, OsString)> = base
            .into_iter()
            .filter(|(k, _)| !k.to_str().is_some_and(|k| self.is_channel_key(k)))
            .collect();
        env.extend(
            self.encode(envelope, role)
                .into_iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        env
    }
}

fn parse_optional(key: &str, value: &str) -> Result<Option<i32>> {
    let malformed = || Error::Environment {
        key: key.to_string(),
        value: value.to_string(),
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<i32>() {
        Ok(0) => Ok(None),
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> EnvironmentChannel {
        EnvironmentChannel::new("LINK_TRACKER")
    }

    #[test]
    fn test_cold_start_is_primary_with_nothing_inherited() {
        let generation = channel()
            .decode([("PATH", "/usr/bin"), ("HOME", "/root")])
            .unwrap();

        assert_eq!(generation.role, GenerationRole::Primary);
        assert!(generation.envelope.is_empty());
        assert_eq!(generation.envelope.listener("public"), None);
        assert_eq!(generation.envelope.listener("api"), None);
    }

    #[test]
    fn test_zero_descriptor_means_bind_fresh() {
        let generation = channel()
            .decode([("LINK_TRACKER_LISTENER_FD_PUBLIC", "0")])
            .unwrap();
        assert_eq!(generation.envelope.listener("public"), None);
    }

    #[test]
    fn test_transitional_marker_sets_role() {
        let generation = channel()
            .decode([
                ("LINK_TRACKER_TRANSITIONAL", "1"),
                ("LINK_TRACKER_LISTENER_FD_PUBLIC", "7"),
                ("LINK_TRACKER_READY_FD", "9"),
            ])
            .unwrap();

        assert_eq!(generation.role, GenerationRole::Transitional);
        assert_eq!(generation.envelope.listener("public"), Some(7));
        assert_eq!(generation.envelope.ready_fd(), Some(9));
        assert_eq!(generation.envelope.transitional_pid(), None);
    }

    #[test]
    fn test_malformed_descriptor_is_rejected() {
        let err = channel()
            .decode([("LINK_TRACKER_LISTENER_FD_PUBLIC", "seven")])
            .unwrap_err();
        assert!(matches!(err, Error::Environment { ref key, .. } if key == "LINK_TRACKER_LISTENER_FD_PUBLIC"));

        let err = channel()
            .decode([("LINK_TRACKER_TRANSITIONAL_PID", "-4")])
            .unwrap_err();
        assert!(matches!(err, Error::Environment { .. }));
    }

    #[test]
    fn test_listener_names_map_to_env_suffix() {
        assert_eq!(listener_suffix("public"), "PUBLIC");
        assert_eq!(listener_suffix("xmpp-c2s"), "XMPP_C2S");
        assert_eq!(
            channel().listener_key("admin.api"),
            "LINK_TRACKER_LISTENER_FD_ADMIN_API"
        );
    }

    #[test]
    fn test_encode_for_transitional_and_primary() {
        let mut envelope = HandoffEnvelope::new();
        envelope.insert_listener("public", 11);
        envelope.set_ready_fd(Some(12));

        let vars = channel().encode(&envelope, GenerationRole::Transitional);
        assert!(vars.contains(&("LINK_TRACKER_LISTENER_FD_PUBLIC".into(), "11".into())));
        assert!(vars.contains(&("LINK_TRACKER_TRANSITIONAL".into(), "1".into())));
        assert!(vars.contains(&("LINK_TRACKER_READY_FD".into(), "12".into())));

        let mut envelope = HandoffEnvelope::new();
        envelope.insert_listener("public", 14);
        envelope.set_transitional_pid(Some(4242));

        let vars = channel().encode(&envelope, GenerationRole::Primary);
        assert!(!vars.iter().any(|(k, _)| k == "LINK_TRACKER_TRANSITIONAL"));
        assert!(vars.contains(&("LINK_TRACKER_TRANSITIONAL_PID".into(), "4242".into())));

        let decoded = channel().decode(vars).unwrap();
        assert_eq!(decoded.role, GenerationRole::Primary);
        assert_eq!(decoded.envelope, envelope);
    }

    #[test]
    fn test_merge_replaces_stale_channel_keys() {
        let base = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (
                OsString::from("LINK_TRACKER_TRANSITIONAL_PID"),
                OsString::from("100"),
            ),
            (
                OsString::from("LINK_TRACKER_LISTENER_FD_API"),
                OsString::from("5"),
            ),
            (
                OsString::from("LINK_TRACKER_PUBLIC_ADDR"),
                OsString::from(":8080"),
            ),
        ];

        let mut envelope = HandoffEnvelope::new();
        envelope.insert_listener("public", 20);

        let merged = channel().merge(base, &envelope, GenerationRole::Transitional);
        let keys: Vec<&str> = merged.iter().filter_map(|(k, _)| k.to_str()).collect();

        assert!(keys.contains(&"PATH"));
        assert!(keys.contains(&"LINK_TRACKER_PUBLIC_ADDR"));
        assert!(keys.contains(&"LINK_TRACKER_LISTENER_FD_PUBLIC"));
        assert!(keys.contains(&"LINK_TRACKER_TRANSITIONAL"));
        assert!(!keys.contains(&"LINK_TRACKER_TRANSITIONAL_PID"));
        assert!(!keys.contains(&"LINK_TRACKER_LISTENER_FD_API"));
    }
}
