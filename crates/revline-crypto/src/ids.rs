//! Strongly typed identifiers for session table keys.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// The remote party of a pairwise session.
    RemoteUserId
);
string_id!(
    /// A group conversation.
    RoomId
);
string_id!(
    /// The author of messages in a room.
    SenderId
);

/// Key of an inbound group session: one per sender per room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboundGroupKey {
    pub room: RoomId,
    pub sender: SenderId,
}

impl InboundGroupKey {
    pub fn new(room: RoomId, sender: SenderId) -> Self {
        Self { room, sender }
    }
}

impl fmt::Display for InboundGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room, self.sender)
    }
}

/// Identifier of a one-time pre-key, unique within one account.
pub type PreKeyId = u32;
