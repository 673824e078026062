//! Stage outcome tags and client-visible reason codes.

use std::fmt;

/// Coarse outcome of a stage request. `Error` retries the batch; everything
/// finer-grained travels in the [`ReasonCode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    Success,
    Error,
}

impl Reason {
    pub fn is_success(self) -> bool {
        matches!(self, Reason::Success)
    }
}

/// Client-visible verdict carried by sendack packets. Wire values are fixed
/// by the client protocol.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    #[default]
    Success = 1,
    SystemError = 2,
    Ban = 3,
    Disband = 4,
    InBlacklist = 5,
    SubscriberNotExist = 6,
    NotInWhitelist = 7,
}

impl ReasonCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ReasonCode::Success),
            2 => Some(ReasonCode::SystemError),
            3 => Some(ReasonCode::Ban),
            4 => Some(ReasonCode::Disband),
            5 => Some(ReasonCode::InBlacklist),
            6 => Some(ReasonCode::SubscriberNotExist),
            7 => Some(ReasonCode::NotInWhitelist),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReasonCode::Success)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasonCode::Success => "success",
            ReasonCode::SystemError => "system_error",
            ReasonCode::Ban => "ban",
            ReasonCode::Disband => "disband",
            ReasonCode::InBlacklist => "in_blacklist",
            ReasonCode::SubscriberNotExist => "subscriber_not_exist",
            ReasonCode::NotInWhitelist => "not_in_whitelist",
        };
        write!(f, "{name}")
    }
}
