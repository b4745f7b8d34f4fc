//! Wire protocol spoken with the DG-Lab app.
//!
//! - [`message`]: the JSON envelope and its text-frame codec.
//! - [`payload`]: typed parsing of `msg` bodies.

pub mod message;
pub mod payload;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use message::{decode, encode, MessageType, WireMessage};
pub use payload::{FeedbackButton, MsgPayload, StrengthInfo, StrengthMode, StrengthReport};

/// Return codes carried in `message` for bind/heartbeat/break frames
pub mod ret_code {
    pub const SUCCESS: &str = "200";
    pub const CLIENT_DISCONNECTED: &str = "209";
    pub const INVALID_CLIENT_ID: &str = "210";
    pub const SERVER_DELAY: &str = "211";
    pub const ID_ALREADY_BOUND: &str = "400";
    pub const TARGET_CLIENT_NOT_FOUND: &str = "401";
    pub const INCOMPATIBLE_RELATIONSHIP: &str = "402";
    pub const NON_JSON_CONTENT: &str = "403";
    pub const RECIPIENT_NOT_FOUND: &str = "404";
    pub const MESSAGE_TOO_LONG: &str = "405";
    pub const SERVER_INTERNAL_ERROR: &str = "500";
}

/// Heads used as the first segment of `message`
pub mod data_head {
    pub const TARGET_ID: &str = "targetId";
    pub const DG_LAB: &str = "DGLAB";
    pub const STRENGTH: &str = "strength";
    pub const PULSE: &str = "pulse";
    pub const CLEAR: &str = "clear";
    pub const FEEDBACK: &str = "feedback";
}

/// Output channel of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    /// Numeric id used by strength and clear commands
    pub fn number(self) -> u8 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
        }
    }

    /// Letter id used by pulse commands
    pub fn letter(self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }

    /// Accepts either the numeric or the letter form
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1" | "A" | "a" => Some(Channel::A),
            "2" | "B" | "b" => Some(Channel::B),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}
