//! Plain (untransformed) messages: header plus body, and compound framing.

use binrw::io::Cursor;
use binrw::prelude::*;
use smb_msg_derive::*;

use crate::*;

/// Generates the conversions shared by [`RequestContent`] and [`ResponseContent`].
macro_rules! make_content_impl {
    (
        @accessors $struct_name:ident,
        $({$variant:ident, $struct_type:ty},)+
    ) => {
        pastey::paste! {

impl $struct_name {
    /// Returns the name of the content value.
    pub fn content_name(&self) -> &'static str {
        match self {
            $(
                $struct_name::$variant(_) => stringify!($variant),
            )+
        }
    }

    $(
        pub fn [<to_ $variant:snake>](self) -> crate::Result<$struct_type> {
            match self {
                $struct_name::$variant(content) => Ok(content),
                _ => Err(crate::SmbMsgError::UnexpectedContent {
                    expected: stringify!($variant),
                    actual: self.content_name(),
                }),
            }
        }

        pub fn [<as_ $variant:snake>](&self) -> crate::Result<&$struct_type> {
            match self {
                $struct_name::$variant(content) => Ok(content),
                _ => Err(crate::SmbMsgError::UnexpectedContent {
                    expected: stringify!($variant),
                    actual: self.content_name(),
                }),
            }
        }
    )+
}
        }
    };
    (
        $struct_name:ident,
        $({$variant:ident, $struct_type:ty},)+
        $(; $({$alias_variant:ident, $alias_type:ty},)+)?
    ) => {
        make_content_impl!(@accessors $struct_name, $({$variant, $struct_type},)+ $($({$alias_variant, $alias_type},)+)?);

$(
    impl From<$struct_type> for $struct_name {
        fn from(value: $struct_type) -> Self {
            $struct_name::$variant(value)
        }
    }
)+
    };
}

/// Generates the request and response content enums for every regular command.
macro_rules! make_content {
    (
        $({$cmd:ident, $req:ty, $resp:ty},)+
    ) => {

/// Body of a plain request, chosen by the header's command.
///
/// The two OPLOCK_BREAK acknowledgments are told apart by their structure size.
#[smb_request_binrw]
#[br(import(command: &Command))]
pub enum RequestContent {
    $(
        #[br(pre_assert(matches!(command, Command::$cmd)))]
        $cmd($req),
    )+
    #[br(pre_assert(matches!(command, Command::Cancel)))]
    Cancel(CancelRequest),
    #[br(pre_assert(matches!(command, Command::OplockBreak)))]
    OplockBreakAck(OplockBreakAck),
    #[br(pre_assert(matches!(command, Command::OplockBreak)))]
    LeaseBreakAck(LeaseBreakAck),
}

/// Body of a plain response, chosen by the header's command and status.
///
/// A status that does not allow the command's own body selects [`ResponseContent::Error`].
/// So does a body whose structure size does not match the command, when the status is
/// not a success.
#[smb_response_binrw]
#[br(import(header: &Header))]
pub enum ResponseContent {
    $(
        #[br(pre_assert(
            matches!(header.command, Command::$cmd)
                && status_allows_command_body(header.command, header.status)
        ))]
        $cmd($resp),
    )+
    #[br(pre_assert(matches!(header.command, Command::OplockBreak) && header.status == Status::U32_SUCCESS))]
    LeaseBreakNotify(LeaseBreakNotify),
    #[br(pre_assert(matches!(header.command, Command::OplockBreak) && header.status == Status::U32_SUCCESS))]
    LeaseBreak(LeaseBreakResponse),
    /// Unsolicited, so it carries the all-ones message id.
    #[br(pre_assert(
        matches!(header.command, Command::OplockBreak)
            && header.status == Status::U32_SUCCESS
            && header.message_id == u64::MAX
    ))]
    OplockBreakNotify(OplockBreakNotify),
    #[br(pre_assert(
        matches!(header.command, Command::OplockBreak)
            && header.status == Status::U32_SUCCESS
            && header.message_id != u64::MAX
    ))]
    OplockBreak(OplockBreakResponse),
    /// Sent in place of the command body on failure, and with interim STATUS_PENDING.
    #[br(pre_assert(header.status != Status::U32_SUCCESS))]
    Error(ErrorResponse),
}

impl RequestContent {
    pub fn associated_cmd(&self) -> Command {
        match self {
            $(RequestContent::$cmd(_) => Command::$cmd,)+
            RequestContent::Cancel(_) => Command::Cancel,
            RequestContent::OplockBreakAck(_) | RequestContent::LeaseBreakAck(_) => {
                Command::OplockBreak
            }
        }
    }
}

impl ResponseContent {
    /// The command this content answers; `None` for an error body.
    pub fn associated_cmd(&self) -> Option<Command> {
        match self {
            $(ResponseContent::$cmd(_) => Some(Command::$cmd),)+
            ResponseContent::OplockBreakNotify(_)
            | ResponseContent::LeaseBreakNotify(_)
            | ResponseContent::OplockBreak(_)
            | ResponseContent::LeaseBreak(_) => Some(Command::OplockBreak),
            ResponseContent::Error(_) => None,
        }
    }
}

make_content_impl! {
    RequestContent,
    $({$cmd, $req},)+
    {Cancel, CancelRequest},
    {OplockBreakAck, OplockBreakAck},
    {LeaseBreakAck, LeaseBreakAck},
}

make_content_impl! {
    ResponseContent,
    $({$cmd, $resp},)+
    {OplockBreakNotify, OplockBreakNotify},
    {LeaseBreakNotify, LeaseBreakNotify},
    {Error, ErrorResponse},
    ;
    {OplockBreak, OplockBreakResponse},
    {LeaseBreak, LeaseBreakResponse},
}
    };
}

make_content! {
    {Negotiate, NegotiateRequest, NegotiateResponse},
    {SessionSetup, SessionSetupRequest, SessionSetupResponse},
    {Logoff, LogoffRequest, LogoffResponse},
    {TreeConnect, TreeConnectRequest, TreeConnectResponse},
    {TreeDisconnect, TreeDisconnectRequest, TreeDisconnectResponse},
    {Create, CreateRequest, CreateResponse},
    {Close, CloseRequest, CloseResponse},
    {Flush, FlushRequest, FlushResponse},
    {Read, ReadRequest, ReadResponse},
    {Write, WriteRequest, WriteResponse},
    {Lock, LockRequest, LockResponse},
    {Ioctl, IoctlRequest, IoctlResponse},
    {Echo, EchoRequest, EchoResponse},
    {QueryDirectory, QueryDirectoryRequest, QueryDirectoryResponse},
    {ChangeNotify, ChangeNotifyRequest, ChangeNotifyResponse},
    {QueryInfo, QueryInfoRequest, QueryInfoResponse},
    {SetInfo, SetInfoRequest, SetInfoResponse},
}

/// Whether a response to `command` with `status` may carry the command's own body
/// rather than an SMB2 ERROR body.
///
/// Reference: MS-SMB2 3.2.5.1.7
pub fn status_allows_command_body(command: Command, status: u32) -> bool {
    match status {
        Status::U32_SUCCESS => true,
        Status::U32_MORE_PROCESSING_REQUIRED => command == Command::SessionSetup,
        Status::U32_BUFFER_OVERFLOW => matches!(
            command,
            Command::Read
                | Command::QueryInfo
                | Command::Ioctl
                | Command::QueryDirectory
                | Command::ChangeNotify
        ),
        // Copychunk limits come back in a full IOCTL body; anything else is an error body.
        Status::U32_INVALID_PARAMETER => command == Command::Ioctl,
        Status::U32_NOTIFY_ENUM_DIR => command == Command::ChangeNotify,
        _ => false,
    }
}

/// A plain request: header, then body.
#[smb_request_binrw]
#[brw(little)]
pub struct PlainRequest {
    #[brw(assert(!header.flags.server_to_redir()))]
    pub header: Header,
    #[br(args(&header.command))]
    pub content: RequestContent,
}

/// A plain response: header, then body.
#[smb_response_binrw]
#[brw(little)]
pub struct PlainResponse {
    #[brw(assert(header.flags.server_to_redir()))]
    pub header: Header,
    #[br(args(&header))]
    pub content: ResponseContent,
}

macro_rules! make_plain_codec {
    ($($plain:ident),+) => {
        $(
impl $plain {
    /// Serializes header and body into one message buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(Header::STRUCT_SIZE + 64));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(buf))?)
    }
}
        )+
    };
}

make_plain_codec!(PlainRequest, PlainResponse);

impl PlainRequest {
    pub fn new(content: RequestContent) -> PlainRequest {
        let command = content.associated_cmd();
        Self::new_with_command(content, command)
    }

    /// A sync request header for `command`, ahead of `content`.
    pub fn new_with_command(content: RequestContent, command: Command) -> PlainRequest {
        PlainRequest {
            header: Header::new(command),
            content,
        }
    }
}

impl PlainResponse {
    pub fn new_with_command(content: ResponseContent, command: Command) -> PlainResponse {
        let mut header = Header::new(command);
        header.flags.set_server_to_redir(true);
        PlainResponse { header, content }
    }

    /// Interim async reply: the real answer arrives later under the same message id.
    pub fn is_interim(&self) -> bool {
        self.header.status == Status::U32_PENDING && self.header.flags.async_command()
    }
}

/// Joins already-encoded messages into one compound chain.
///
/// Every member but the last is padded to 8 bytes, and its `NextCommand` is set to
/// the padded length.
pub fn encode_compound(messages: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let count = messages.len();
    let mut out = Vec::new();
    for (i, mut message) in messages.into_iter().enumerate() {
        if message.len() < Header::STRUCT_SIZE {
            return Err(SmbMsgError::Truncated {
                offset: 0,
                needed: Header::STRUCT_SIZE,
                available: message.len(),
            });
        }
        let next = if i + 1 < count {
            let padded = message.len().div_ceil(8) * 8;
            message.resize(padded, 0);
            u32::try_from(padded).map_err(|_| SmbMsgError::InvalidCompoundOffset(u32::MAX))?
        } else {
            0
        };
        message[Header::NEXT_COMMAND_OFFSET..Header::NEXT_COMMAND_OFFSET + 4]
            .copy_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&message);
    }
    Ok(out)
}

/// Splits a compound chain into its member messages, each starting at a header.
pub fn split_compound(buf: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut start = 0usize;
    loop {
        let rest = &buf[start..];
        let next_bytes: [u8; 4] = rest
            .get(Header::NEXT_COMMAND_OFFSET..Header::NEXT_COMMAND_OFFSET + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(SmbMsgError::Truncated {
                offset: start,
                needed: Header::STRUCT_SIZE,
                available: buf.len(),
            })?;
        let next = u32::from_le_bytes(next_bytes);
        if next == 0 {
            out.push(rest);
            return Ok(out);
        }
        let next_usize = next as usize;
        if next_usize < Header::STRUCT_SIZE || next_usize % 8 != 0 || next_usize >= rest.len() {
            return Err(SmbMsgError::InvalidCompoundOffset(next));
        }
        out.push(&rest[..next_usize]);
        start += next_usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_header(command: Command, status: Status) -> Header {
        let mut header = Header::new(command);
        header.status = status as u32;
        header.flags.set_server_to_redir(true);
        header
    }

    #[test]
    fn test_error_body_on_failure() {
        let response = PlainResponse {
            header: response_header(Command::Create, Status::ObjectNameNotFound),
            content: ErrorResponse::default().into(),
        };
        let bytes = response.encode().unwrap();
        let parsed = PlainResponse::decode(&bytes).unwrap();
        assert_eq!(parsed, response);
        assert!(parsed.content.as_create().is_err());
    }

    #[test]
    fn test_buffer_overflow_keeps_read_body() {
        let response = PlainResponse {
            header: response_header(Command::Read, Status::BufferOverflow),
            content: ReadResponse {
                buffer: b"partial".to_vec(),
            }
            .into(),
        };
        let parsed = PlainResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(parsed.content.to_read().unwrap().buffer, b"partial");
    }

    #[test]
    fn test_invalid_parameter_ioctl_error_body() {
        assert!(status_allows_command_body(
            Command::Ioctl,
            Status::U32_INVALID_PARAMETER
        ));
        assert!(!status_allows_command_body(
            Command::Create,
            Status::U32_MORE_PROCESSING_REQUIRED
        ));
        // Not a copychunk reply: the 9-byte body fails the IOCTL size check.
        let response = PlainResponse {
            header: response_header(Command::Ioctl, Status::InvalidParameter),
            content: ErrorResponse::default().into(),
        };
        let parsed = PlainResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(parsed.content, ResponseContent::Error(ErrorResponse::default()));
    }

    #[test]
    fn test_success_with_bad_size_rejected() {
        let mut bytes = PlainResponse {
            header: response_header(Command::Close, Status::Success),
            content: CloseResponse::default().into(),
        }
        .encode()
        .unwrap();
        bytes[Header::STRUCT_SIZE] = 59;
        assert!(matches!(
            PlainResponse::decode(&bytes),
            Err(SmbMsgError::BadStructureSize {
                name: "CloseResponse",
                expected: 60,
                actual: 59
            })
        ));
    }

    #[test]
    fn test_lease_break_ack_dispatch_by_size() {
        let ack = LeaseBreakAck {
            lease_key: smb_dtyp::Guid::from(9u128),
            lease_state: LeaseState::new().with_read_caching(true),
        };
        let request = PlainRequest::new(RequestContent::LeaseBreakAck(ack));
        let parsed = PlainRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(parsed.content, RequestContent::LeaseBreakAck(ack));
    }

    #[test]
    fn test_interim_pending() {
        let mut header = response_header(Command::ChangeNotify, Status::Pending);
        header.to_async(7);
        let response = PlainResponse {
            header,
            content: ErrorResponse::default().into(),
        };
        let parsed = PlainResponse::decode(&response.encode().unwrap()).unwrap();
        assert!(parsed.is_interim());
        assert_eq!(parsed.header.async_id, Some(7));
    }

    #[test]
    fn test_lease_break_dispatch_by_size() {
        let mut header = response_header(Command::OplockBreak, Status::Success);
        header.message_id = u64::MAX;
        let notify = LeaseBreakNotify {
            new_epoch: 1,
            flags: LeaseBreakFlags::new(),
            lease_key: smb_dtyp::Guid::from(5u128),
            current_lease_state: LeaseState::rwh(),
            new_lease_state: LeaseState::NONE,
        };
        let response = PlainResponse {
            header: header.clone(),
            content: notify.clone().into(),
        };
        let parsed = PlainResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(parsed.content, ResponseContent::LeaseBreakNotify(notify));

        let oplock = OplockBreakMsg {
            oplock_level: OplockLevel::None,
            file_id: FileId::FULL,
        };
        let response = PlainResponse {
            header,
            content: ResponseContent::OplockBreakNotify(oplock),
        };
        let parsed = PlainResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(parsed.content, ResponseContent::OplockBreakNotify(oplock));
    }

    #[test]
    fn test_compound_round_trip() {
        let create = PlainRequest::new(
            CreateRequest {
                requested_oplock_level: OplockLevel::None,
                impersonation_level: ImpersonationLevel::Impersonation,
                desired_access: FileAccessMask::new().with_file_read_attributes(true),
                file_attributes: FileAttributes::new(),
                share_access: ShareAccessFlags::new().with_read(true),
                create_disposition: CreateDisposition::Open,
                create_options: CreateOptions::new(),
                name: "a.txt".into(),
                contexts: vec![],
            }
            .into(),
        );
        let mut close = PlainRequest::new(
            CloseRequest {
                flags: CloseFlags::new().with_postquery_attrib(true),
                file_id: FileId::FULL,
            }
            .into(),
        );
        close.header.flags.set_related_operations(true);

        let chain = encode_compound(vec![create.encode().unwrap(), close.encode().unwrap()]).unwrap();
        let parts = split_compound(&chain).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len() % 8, 0);

        let first = PlainRequest::decode(parts[0]).unwrap();
        assert_eq!(first.header.next_command as usize, parts[0].len());
        assert_eq!(first.content, create.content);
        let second = PlainRequest::decode(parts[1]).unwrap();
        assert_eq!(second.header.next_command, 0);
        assert_eq!(second.content, close.content);
    }

    #[test]
    fn test_compound_bad_offset() {
        let echo = PlainRequest::new(EchoRequest::default().into());
        let mut bytes = echo.encode().unwrap();
        bytes[Header::NEXT_COMMAND_OFFSET] = 0x48;
        assert!(matches!(
            split_compound(&bytes),
            Err(SmbMsgError::InvalidCompoundOffset(0x48))
        ));
    }
}
