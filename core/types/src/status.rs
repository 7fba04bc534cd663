use std::fmt;

/// Result codes returned in the response frame header.
///
/// List commands encode success as the negated entry count instead; any
/// strictly positive return code is one of these errors, zero is [`Status::Ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    VersionMismatch = 1,
    UnknownInterface = 2,
    InterfaceAlreadyRegistered = 3,
    InvalidServerId = 4,
    InvalidClientId = 5,
    InvalidNotificationId = 6,
    BadArgument = 7,
    BadFoundationVersion = 8,
    RegularExpression = 9,
    AccessDenied = 10,
    UnknownCommand = 11,
    InternalError = 12,
}

impl Status {
    pub fn from_code(code: i32) -> Option<Status> {
        use Status::*;
        Some(match code {
            0 => Ok,
            1 => VersionMismatch,
            2 => UnknownInterface,
            3 => InterfaceAlreadyRegistered,
            4 => InvalidServerId,
            5 => InvalidClientId,
            6 => InvalidNotificationId,
            7 => BadArgument,
            8 => BadFoundationVersion,
            9 => RegularExpression,
            10 => AccessDenied,
            11 => UnknownCommand,
            12 => InternalError,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
