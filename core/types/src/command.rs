use std::fmt;

/// Request opcodes.
///
/// The numbering is a stable property of the protocol; the gaps mirror the
/// historic command space of the original middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    RegisterInterface = 0,
    UnregisterInterface = 1,
    AttachInterface = 2,
    DetachInterface = 3,
    NotifyServerDisconnect = 4,
    NotifyServerAvailable = 5,
    NotifyClientDetach = 6,
    ClearNotification = 7,
    GetInterfaceList = 8,
    NotifyInterfaceListChange = 9,
    MatchInterfaceList = 10,
    NotifyInterfaceListMatch = 11,
    RegisterInterfaceEx = 12,
    RegisterInterfaceGroupId = 13,
    RegisterMasterInterfaceEx = 30,
    MasterPing = 31,
    MasterPingId = 32,
    AttachInterfaceExtended = 35,
    NotifyServerAvailableEx = 36,
    GetServerInformation = 37,
}

impl Command {
    pub fn from_opcode(opcode: u32) -> Option<Command> {
        use Command::*;
        Some(match opcode {
            0 => RegisterInterface,
            1 => UnregisterInterface,
            2 => AttachInterface,
            3 => DetachInterface,
            4 => NotifyServerDisconnect,
            5 => NotifyServerAvailable,
            6 => NotifyClientDetach,
            7 => ClearNotification,
            8 => GetInterfaceList,
            9 => NotifyInterfaceListChange,
            10 => MatchInterfaceList,
            11 => NotifyInterfaceListMatch,
            12 => RegisterInterfaceEx,
            13 => RegisterInterfaceGroupId,
            30 => RegisterMasterInterfaceEx,
            31 => MasterPing,
            32 => MasterPingId,
            35 => AttachInterfaceExtended,
            36 => NotifyServerAvailableEx,
            37 => GetServerInformation,
            _ => return None,
        })
    }

    pub fn opcode(self) -> u32 {
        self as u32
    }

    /// List commands answer with `-count` on success and need their master
    /// return codes normalized differently than plain requests.
    pub fn is_list(self) -> bool {
        matches!(self, Command::GetInterfaceList | Command::MatchInterfaceList)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for cmd in [
            Command::RegisterInterface,
            Command::RegisterMasterInterfaceEx,
            Command::MasterPingId,
            Command::AttachInterfaceExtended,
            Command::NotifyServerAvailableEx,
            Command::GetServerInformation,
        ] {
            assert_eq!(Command::from_opcode(cmd.opcode()), Some(cmd));
        }
        assert_eq!(Command::from_opcode(14), None);
    }
}
