use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidIdSnafu, InvalidSessionNameSnafu, StorageError, StorageResult};

/// Unique key of a session. Sessions have no separate numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(String);

impl SessionName {
    /// Accepts any name that is not empty after trimming. The name itself is kept verbatim.
    pub fn parse(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();
        ensure!(
            !raw.trim().is_empty(),
            InvalidSessionNameSnafu {
                stage: "parse-session-name",
                raw,
            }
        );
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionName {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Store-assigned identifier of one appended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-message-id",
            id_type: "message-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
