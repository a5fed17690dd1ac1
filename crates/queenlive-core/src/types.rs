use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Audience,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Audience => "audience",
        }
    }

    pub fn is_host(self) -> bool {
        self == Role::Host
    }

    /// Display name used in chat for a participant joining with this role.
    pub fn username_for(self, uid: Uid) -> String {
        match self {
            Role::Host => "Host".to_string(),
            Role::Audience => format!("User {uid}"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Role::Host),
            "audience" => Ok(Role::Audience),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A remote peer's published media presence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub uid: Uid,
    pub role: Role,
    pub has_video: bool,
    pub has_audio: bool,
}

impl Participant {
    /// Remote publishers are hosts: audience members never publish.
    pub fn publisher(uid: Uid) -> Self {
        Self {
            uid,
            role: Role::Host,
            has_video: false,
            has_audio: false,
        }
    }

    pub fn mark(&mut self, kind: MediaKind, on: bool) {
        match kind {
            MediaKind::Audio => self.has_audio = on,
            MediaKind::Video => self.has_video = on,
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.has_audio || self.has_video
    }
}

/// One client's active membership in a media room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub local_uid: Uid,
    pub role: Role,
    pub joined: bool,
    pub stream_id: StreamId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Membership lifecycle: `Idle -> Joining -> Joined -> Leaving -> Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Joining,
    Joined,
    Leaving,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Joining => "joining",
            SessionPhase::Joined => "joined",
            SessionPhase::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_and_display() {
        assert_eq!("host".parse::<Role>().unwrap(), Role::Host);
        assert_eq!("audience".parse::<Role>().unwrap(), Role::Audience);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(Role::Audience.to_string(), "audience");
    }

    #[test]
    fn usernames_follow_role() {
        assert_eq!(Role::Host.username_for(Uid(1)), "Host");
        assert_eq!(Role::Audience.username_for(Uid(42)), "User 42");
    }

    #[test]
    fn participant_capability_flags() {
        let mut p = Participant::publisher(Uid(555));
        assert!(!p.is_publishing());

        p.mark(MediaKind::Video, true);
        assert!(p.has_video);
        assert!(!p.has_audio);
        assert!(p.is_publishing());

        p.mark(MediaKind::Video, false);
        assert!(!p.is_publishing());
    }

    #[test]
    fn phase_serde_is_snake_case() {
        let json = serde_json::to_string(&SessionPhase::Joining).unwrap();
        assert_eq!(json, "\"joining\"");
    }
}
