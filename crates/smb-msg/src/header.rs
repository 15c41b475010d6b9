//! Plain message header, command codes and NT status values.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_msg_derive::smb_request_response;

use crate::{Result, SmbMsgError};

/// SMB2 protocol command codes.
///
/// Reference: MS-SMB2 2.2.1.2
#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[brw(repr(u16))]
#[repr(u16)]
pub enum Command {
    Negotiate = 0,
    SessionSetup = 1,
    Logoff = 2,
    TreeConnect = 3,
    TreeDisconnect = 4,
    Create = 5,
    Close = 6,
    Flush = 7,
    Read = 8,
    Write = 9,
    Lock = 0xA,
    Ioctl = 0xB,
    Cancel = 0xC,
    Echo = 0xD,
    QueryDirectory = 0xE,
    ChangeNotify = 0xF,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
}

impl Command {
    /// Commands whose second application changes server state, so a resend after
    /// a disconnect must carry the replay flag.
    pub fn is_non_idempotent(&self) -> bool {
        matches!(self, Command::Create | Command::SetInfo | Command::Lock)
    }
}

impl TryFrom<u16> for Command {
    type Error = SmbMsgError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0 => Command::Negotiate,
            1 => Command::SessionSetup,
            2 => Command::Logoff,
            3 => Command::TreeConnect,
            4 => Command::TreeDisconnect,
            5 => Command::Create,
            6 => Command::Close,
            7 => Command::Flush,
            8 => Command::Read,
            9 => Command::Write,
            0xA => Command::Lock,
            0xB => Command::Ioctl,
            0xC => Command::Cancel,
            0xD => Command::Echo,
            0xE => Command::QueryDirectory,
            0xF => Command::ChangeNotify,
            0x10 => Command::QueryInfo,
            0x11 => Command::SetInfo,
            0x12 => Command::OplockBreak,
            _ => return Err(SmbMsgError::UnknownCommand(value)),
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message_as_string = match self {
            Command::Negotiate => "Negotiate",
            Command::SessionSetup => "Session Setup",
            Command::Logoff => "Logoff",
            Command::TreeConnect => "Tree Connect",
            Command::TreeDisconnect => "Tree Disconnect",
            Command::Create => "Create",
            Command::Close => "Close",
            Command::Flush => "Flush",
            Command::Read => "Read",
            Command::Write => "Write",
            Command::Lock => "Lock",
            Command::Ioctl => "Ioctl",
            Command::Cancel => "Cancel",
            Command::Echo => "Echo",
            Command::QueryDirectory => "Query Directory",
            Command::ChangeNotify => "Change Notify",
            Command::QueryInfo => "Query Info",
            Command::SetInfo => "Set Info",
            Command::OplockBreak => "Oplock Break",
        };
        write!(f, "{} ({:#x})", message_as_string, *self as u16)
    }
}

macro_rules! make_status {
    (
        $($name:ident = $value:literal: $description:literal, )+
    ) => {

/// NT status codes seen on the wire.
///
/// Every code also has a U32 constant, e.g. [`Status::U32_END_OF_FILE`] is `0xC0000011`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u32)]
pub enum Status {
    $(
        #[doc = concat!($description, " (", stringify!($value), ")")]
        $name = $value,
    )+
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message_as_string = match self {
            $(
                Status::$name => $description,
            )+
        };
        write!(f, "{} ({:#x})", message_as_string, *self as u32)
    }
}

impl Status {
    pastey::paste! {
        $(
            #[doc = concat!("[`", stringify!($name), "`][Self::", stringify!($name), "] as u32")]
            pub const [<U32_ $name:snake:upper>]: u32 = $value;
        )+
    }

    /// Formats `value` as a known status, or as hex when it has no definition here.
    pub fn try_display_as_status(value: u32) -> String {
        match Self::try_from(value) {
            Ok(status) => format!("{}", status),
            Err(_) => format!("{:#010x}", value),
        }
    }
}

impl TryFrom<u32> for Status {
    type Error = SmbMsgError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            $(
                $value => Ok(Status::$name),
            )+
            _ => Err(SmbMsgError::MissingErrorCodeDefinition(value)),
        }
    }
}
    };
}

make_status! {
    Success = 0x00000000: "Success",
    Pending = 0x00000103: "Pending",
    NotifyCleanup = 0x0000010B: "Notify Cleanup",
    NotifyEnumDir = 0x0000010C: "Notify Enum Dir",
    BufferOverflow = 0x80000005: "Buffer Overflow",
    NoMoreFiles = 0x80000006: "No More Files",
    StoppedOnSymlink = 0x8000002D: "Stopped on Symlink",
    NotImplemented = 0xC0000002: "Not Implemented",
    InvalidInfoClass = 0xC0000003: "Invalid Info Class",
    InfoLengthMismatch = 0xC0000004: "Info Length Mismatch",
    InvalidHandle = 0xC0000008: "Invalid Handle",
    InvalidParameter = 0xC000000D: "Invalid Parameter",
    NoSuchFile = 0xC000000F: "No Such File",
    InvalidDeviceRequest = 0xC0000010: "Invalid Device Request",
    EndOfFile = 0xC0000011: "End of File",
    MoreProcessingRequired = 0xC0000016: "More Processing Required",
    AccessDenied = 0xC0000022: "Access Denied",
    BufferTooSmall = 0xC0000023: "Buffer Too Small",
    ObjectNameInvalid = 0xC0000033: "Object Name Invalid",
    ObjectNameNotFound = 0xC0000034: "Object Name Not Found",
    ObjectNameCollision = 0xC0000035: "Object Name Collision",
    ObjectPathNotFound = 0xC000003A: "Object Path Not Found",
    SharingViolation = 0xC0000043: "Sharing Violation",
    FileLockConflict = 0xC0000054: "File Lock Conflict",
    LockNotGranted = 0xC0000055: "Lock Not Granted",
    DeletePending = 0xC0000056: "Delete Pending",
    LogonFailure = 0xC000006D: "Logon Failure",
    RangeNotLocked = 0xC000007E: "Range Not Locked",
    InsufficientResources = 0xC000009A: "Insufficient Resources",
    IoTimeout = 0xC00000B5: "I/O Timeout",
    FileIsADirectory = 0xC00000BA: "File is a Directory",
    NotSupported = 0xC00000BB: "Not Supported",
    NetworkNameDeleted = 0xC00000C9: "Network Name Deleted",
    BadNetworkName = 0xC00000CC: "Bad Network Name",
    RequestNotAccepted = 0xC00000D0: "Request Not Accepted",
    DirectoryNotEmpty = 0xC0000101: "Directory Not Empty",
    NotADirectory = 0xC0000103: "Not a Directory",
    Cancelled = 0xC0000120: "Cancelled",
    FileClosed = 0xC0000128: "File Closed",
    UserSessionDeleted = 0xC0000203: "User Session Deleted",
    ConnectionDisconnected = 0xC000020C: "Connection Disconnected",
    ConnectionReset = 0xC000020D: "Connection Reset",
    NotFound = 0xC0000225: "Not Found",
    UserAccountLockedOut = 0xC0000234: "User Account Locked Out",
    PathNotCovered = 0xC0000257: "Path Not Covered",
    NetworkSessionExpired = 0xC000035C: "Network Session Expired",
    FileNotAvailable = 0xC0000467: "File Not Available",
    DeviceFeatureNotSupported = 0xC0000463: "Device Feature Not Supported",
}

/// SMB2 header flags.
///
/// Reference: MS-SMB2 2.2.1.2
#[smb_dtyp::mbitfield]
pub struct HeaderFlags {
    pub server_to_redir: bool,
    pub async_command: bool,
    pub related_operations: bool,
    pub signed: bool,
    pub priority_mask: B3,
    #[skip]
    __: B21,
    pub dfs_operation: bool,
    /// Set on a request resent after a reconnect.
    pub replay_operation: bool,
    #[skip]
    __: B2,
}

/// SMB2 packet header, synchronous or asynchronous form.
///
/// Reference: MS-SMB2 2.2.1.1, 2.2.1.2
#[smb_request_response(size = 64)]
#[brw(magic(b"\xfeSMB"), little)]
pub struct Header {
    pub credit_charge: u16,
    /// NT status on responses; channel sequence (low 16 bits) on 3.x requests.
    pub status: u32,
    pub command: Command,
    pub credit_request: u16,
    pub flags: HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,

    #[brw(if(!flags.async_command()))]
    #[bw(calc = 0)]
    _reserved: u32,
    /// Present when `flags.async_command()` is clear.
    #[br(if(!flags.async_command()))]
    #[bw(assert(tree_id.is_some() != flags.async_command()))]
    pub tree_id: Option<u32>,

    /// Present when `flags.async_command()` is set.
    #[brw(if(flags.async_command()))]
    #[bw(assert(async_id.is_some() == flags.async_command()))]
    pub async_id: Option<u64>,

    pub session_id: u64,
    pub signature: u128,
}

impl Header {
    pub const STRUCT_SIZE: usize = 64;
    pub const PROTOCOL_ID: [u8; 4] = *b"\xfeSMB";
    /// Byte offset of `next_command` inside the header.
    pub const NEXT_COMMAND_OFFSET: usize = 20;
    /// Byte offset of the signature inside the header.
    pub const SIGNATURE_OFFSET: usize = 48;

    /// A fresh synchronous request header.
    pub fn new(command: Command) -> Self {
        Header {
            credit_charge: 0,
            status: 0,
            command,
            credit_request: 0,
            flags: HeaderFlags::new(),
            next_command: 0,
            message_id: 0,
            tree_id: Some(0),
            async_id: None,
            session_id: 0,
            signature: 0,
        }
    }

    pub fn status(&self) -> Result<Status> {
        self.status.try_into()
    }

    /// Switches to the asynchronous form with the given id.
    pub fn to_async(&mut self, async_id: u64) {
        self.flags.set_async_command(true);
        self.tree_id = None;
        self.async_id = Some(async_id);
    }

    /// Reads a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Header> {
        Ok(Header::read(&mut std::io::Cursor::new(buf))?)
    }
}

#[cfg(test)]
mod tests {
    use smb_tests::*;

    use super::*;

    fn async_header() -> Header {
        Header {
            credit_charge: 0,
            status: Status::Pending as u32,
            command: Command::ChangeNotify,
            credit_request: 1,
            flags: HeaderFlags::new()
                .with_async_command(true)
                .with_server_to_redir(true)
                .with_priority_mask(1),
            next_command: 0,
            message_id: 8,
            tree_id: None,
            async_id: Some(8),
            session_id: 0x00000000085327d7,
            signature: u128::from_le_bytes(u128::to_be_bytes(
                0x63f825deae02952fa3d8c8aaf46e7c99,
            )),
        }
    }

    const ASYNC_HEADER: &str = "fe534d4240000000030100000f000100130000000000000008000000000000000800000000000000d72753080000000063f825deae02952fa3d8c8aaf46e7c99";

    test_binrw! {
        Header => async_form: async_header() => ASYNC_HEADER
    }

    #[test]
    fn test_sync_header_tree_id() {
        let mut header = Header::new(Command::Create);
        header.tree_id = Some(0x11223344);
        header.message_id = 3;
        let mut cursor = std::io::Cursor::new(Vec::new());
        header.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), Header::STRUCT_SIZE);
        assert_eq!(&bytes[32..40], &[0, 0, 0, 0, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(Header::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_protocol_id() {
        let mut data = hex_to_u8_array!(ASYNC_HEADER);
        data[0] = 0xfd;
        assert!(matches!(
            Header::parse(&data),
            Err(SmbMsgError::BinRw(err)) if matches!(err.root_cause(), binrw::Error::BadMagic { pos: 0, .. })
        ));
    }

    #[test]
    fn test_bad_structure_size() {
        let mut data = hex_to_u8_array!(ASYNC_HEADER);
        data[4] = 0x41;
        let err = Header::parse(&data).unwrap_err();
        assert!(matches!(
            err,
            SmbMsgError::BadStructureSize {
                name: "Header",
                expected: 64,
                actual: 0x41,
            }
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut data = hex_to_u8_array!(ASYNC_HEADER);
        data[12] = 0x40;
        assert!(matches!(Header::parse(&data), Err(SmbMsgError::BinRw(_))));
        assert!(matches!(
            Command::try_from(0x40),
            Err(SmbMsgError::UnknownCommand(0x40))
        ));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::U32_END_OF_FILE, 0xC0000011);
        assert_eq!(
            Status::try_display_as_status(0xC0000011),
            "End of File (0xc0000011)"
        );
        assert_eq!(Status::try_display_as_status(0xC0001234), "0xc0001234");
    }
}
