//! Identity and status types shared across the crate.

use crate::error::CoreError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a mandelbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MandelboxId(Uuid);

/// Identity used by the runtime warm-up pass.
const PLACEHOLDER_WARMUP: Uuid = Uuid::from_u128(0x1111_1111_1111_1111_1111_1111_1111_1111);

impl MandelboxId {
    /// Create a new random mandelbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The fixed identity of warm-up mandelboxes. Those never touch the
    /// state store.
    pub fn placeholder() -> Self {
        Self(PLACEHOLDER_WARMUP)
    }

    /// Whether this is the warm-up placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.0 == PLACEHOLDER_WARMUP
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MandelboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MandelboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MandelboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for MandelboxId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidArgument(format!("invalid mandelbox id {s:?}: {e}")))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the value is empty (unset).
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of the user a mandelbox is assigned to.
    UserId
);
string_id!(
    /// Client session identifier, forwarded into the container.
    SessionId
);
string_id!(
    /// Application the container runs, e.g. `browsers/chrome`.
    AppName
);
string_id!(
    /// Per-mandelbox symmetric key shared with the client.
    SessionKey
);

impl SessionKey {
    /// 16 random bytes, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }
}

/// Secret the user's config archive is encrypted with.
///
/// `Debug` only shows the token hash.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigEncryptionToken(String);

impl ConfigEncryptionToken {
    /// Wrap a token.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no token is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex SHA-256 of the token.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for ConfigEncryptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "ConfigEncryptionToken(<unset>)")
        } else {
            write!(f, "ConfigEncryptionToken(sha256:{})", self.hash())
        }
    }
}

impl From<&str> for ConfigEncryptionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a mandelbox, as recorded in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MandelboxStatus {
    /// Created and running, not yet assigned to a user.
    Waiting,
    /// Matched to a user by the scheduler.
    Allocated,
    /// Client handshake in progress.
    Connecting,
    /// Client connected, application live.
    Running,
    /// Teardown in progress.
    Dying,
}

impl MandelboxStatus {
    /// Whether a client handshake can still be accepted in this status.
    pub fn awaits_client(&self) -> bool {
        matches!(self, Self::Waiting | Self::Allocated)
    }
}

impl fmt::Display for MandelboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Allocated => write!(f, "ALLOCATED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Dying => write!(f, "DYING"),
        }
    }
}

impl FromStr for MandelboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "ALLOCATED" => Ok(Self::Allocated),
            "CONNECTING" => Ok(Self::Connecting),
            "RUNNING" => Ok(Self::Running),
            "DYING" => Ok(Self::Dying),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown mandelbox status: {other}"
            ))),
        }
    }
}
