//! Wire messages for the resource-manager protocol
//!
//! The manager parses positionally: every request carries the bus member
//! name, the numeric kind tag, the session id and a request sequence number,
//! followed by the kind-specific fields. Integers are big-endian 32-bit;
//! strings are a u32 length followed by UTF-8 bytes. Field order and width
//! are fixed by the wire schema and must not be reordered.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size in either direction
pub const MAX_FRAME_SIZE: usize = 4096;

/// Numeric message-kind tags fixed by the wire schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Register = 0,
    Unregister = 1,
    Update = 2,
    Acquire = 3,
    Release = 4,
    Grant = 5,
    Advice = 6,
    Audio = 7,
    Video = 8,
}

impl MessageKind {
    /// Numeric wire tag
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::Register),
            1 => Some(Self::Unregister),
            2 => Some(Self::Update),
            3 => Some(Self::Acquire),
            4 => Some(Self::Release),
            5 => Some(Self::Grant),
            6 => Some(Self::Advice),
            7 => Some(Self::Audio),
            8 => Some(Self::Video),
            _ => None,
        }
    }

    /// Bus member name the manager dispatches on
    pub fn member(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Update => "update",
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::Grant => "grant",
            Self::Advice => "advice",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Bit-set of shared hardware capabilities
///
/// The bit assignments are fixed by the manager's schema; bit 7 is
/// unassigned and stays unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const AUDIO_PLAYBACK: Self = Self(1 << 0);
    pub const VIDEO_PLAYBACK: Self = Self(1 << 1);
    pub const AUDIO_RECORDING: Self = Self(1 << 2);
    pub const VIDEO_RECORDING: Self = Self(1 << 3);
    pub const VIBRA: Self = Self(1 << 4);
    pub const LEDS: Self = Self(1 << 5);
    pub const BACKLIGHT: Self = Self(1 << 6);
    pub const SYSTEM_BUTTON: Self = Self(1 << 8);
    pub const LOCK_BUTTON: Self = Self(1 << 9);
    pub const SCALE_BUTTON: Self = Self(1 << 10);
    pub const SNAP_BUTTON: Self = Self(1 << 11);
    pub const LENS_COVER: Self = Self(1 << 12);
    pub const HEADSET_BUTTONS: Self = Self(1 << 13);
    pub const LARGE_SCREEN: Self = Self(1 << 14);

    const NAMES: [(Capabilities, &'static str); 14] = [
        (Self::AUDIO_PLAYBACK, "audio-playback"),
        (Self::VIDEO_PLAYBACK, "video-playback"),
        (Self::AUDIO_RECORDING, "audio-recording"),
        (Self::VIDEO_RECORDING, "video-recording"),
        (Self::VIBRA, "vibra"),
        (Self::LEDS, "leds"),
        (Self::BACKLIGHT, "backlight"),
        (Self::SYSTEM_BUTTON, "system-button"),
        (Self::LOCK_BUTTON, "lock-button"),
        (Self::SCALE_BUTTON, "scale-button"),
        (Self::SNAP_BUTTON, "snap-button"),
        (Self::LENS_COVER, "lens-cover"),
        (Self::HEADSET_BUTTONS, "headset-buttons"),
        (Self::LARGE_SCREEN, "large-screen"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Look up a capability by its configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(cap, _)| *cap)
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (cap, name) in Self::NAMES {
            if self.contains(cap) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Client-originated requests with their positional payloads
///
/// `Register` carries the full resource-set quad (all/opt/share/mask); only
/// the `all` field is populated from [`Capabilities`], the rest are zero in
/// this protocol revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        caps: Capabilities,
        class: String,
        mode: u32,
    },
    Unregister,
    Update {
        caps: Capabilities,
    },
    Acquire,
    Release,
    Audio {
        group: String,
        pid: u32,
    },
    Video {
        pid: u32,
    },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register { .. } => MessageKind::Register,
            Self::Unregister => MessageKind::Unregister,
            Self::Update { .. } => MessageKind::Update,
            Self::Acquire => MessageKind::Acquire,
            Self::Release => MessageKind::Release,
            Self::Audio { .. } => MessageKind::Audio,
            Self::Video { .. } => MessageKind::Video,
        }
    }
}

/// Reply envelope from the manager
///
/// `granted` is meaningful only on `Grant` replies; it carries the granted
/// capability subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: MessageKind,
    pub id: u32,
    pub reqno: u32,
    pub status: i32,
    pub granted: Capabilities,
}

/// Envelope that does not match the expected wire shape
#[derive(Debug, Error)]
#[error("malformed envelope: {0}")]
pub struct MalformedReply(pub String);

/// Encode a request payload (the frame length prefix is added by
/// [`write_frame`])
pub fn encode_request(req: &Request, id: u32, reqno: u32) -> Bytes {
    let kind = req.kind();
    let mut payload = BytesMut::with_capacity(64);
    put_str(&mut payload, kind.member());
    payload.put_i32(kind.tag());
    payload.put_u32(id);
    payload.put_u32(reqno);
    match req {
        Request::Register { caps, class, mode } => {
            payload.put_u32(caps.bits()); // rset.all
            payload.put_u32(0); // rset.opt
            payload.put_u32(0); // rset.share
            payload.put_u32(0); // rset.mask
            put_str(&mut payload, class);
            payload.put_u32(*mode);
        }
        Request::Update { caps } => {
            payload.put_u32(caps.bits());
            payload.put_u32(0);
            payload.put_u32(0);
            payload.put_u32(0);
        }
        Request::Unregister | Request::Acquire | Request::Release => {}
        Request::Audio { group, pid } => {
            put_str(&mut payload, group);
            payload.put_u32(*pid);
        }
        Request::Video { pid } => {
            payload.put_u32(*pid);
        }
    }
    payload.freeze()
}

/// Decode a request payload; the manager-side half of the codec, also used
/// by the test fixtures standing in for the manager
pub fn decode_request(payload: &[u8]) -> Result<(Request, u32, u32), MalformedReply> {
    let mut buf = payload;
    let member = get_str(&mut buf, "member name")?;
    need(&buf, 12, "request header")?;
    let tag = buf.get_i32();
    let kind = MessageKind::from_tag(tag)
        .ok_or_else(|| MalformedReply(format!("unknown kind tag {tag}")))?;
    if kind.member() != member {
        return Err(MalformedReply(format!(
            "member '{member}' does not match kind {kind:?}"
        )));
    }
    let id = buf.get_u32();
    let reqno = buf.get_u32();

    let request = match kind {
        MessageKind::Register => {
            need(&buf, 16, "resource set")?;
            let all = buf.get_u32();
            let _opt = buf.get_u32();
            let _share = buf.get_u32();
            let _mask = buf.get_u32();
            let class = get_str(&mut buf, "class")?;
            need(&buf, 4, "mode")?;
            let mode = buf.get_u32();
            Request::Register {
                caps: Capabilities::from_bits(all),
                class,
                mode,
            }
        }
        MessageKind::Update => {
            need(&buf, 16, "resource set")?;
            let all = buf.get_u32();
            let _opt = buf.get_u32();
            let _share = buf.get_u32();
            let _mask = buf.get_u32();
            Request::Update {
                caps: Capabilities::from_bits(all),
            }
        }
        MessageKind::Unregister => Request::Unregister,
        MessageKind::Acquire => Request::Acquire,
        MessageKind::Release => Request::Release,
        MessageKind::Audio => {
            let group = get_str(&mut buf, "group")?;
            need(&buf, 4, "pid")?;
            Request::Audio {
                group,
                pid: buf.get_u32(),
            }
        }
        MessageKind::Video => {
            need(&buf, 4, "pid")?;
            Request::Video { pid: buf.get_u32() }
        }
        MessageKind::Grant | MessageKind::Advice => {
            return Err(MalformedReply(format!("{kind:?} is not a request kind")));
        }
    };

    if buf.has_remaining() {
        return Err(MalformedReply(format!(
            "{} trailing bytes after {kind:?}",
            buf.remaining()
        )));
    }
    Ok((request, id, reqno))
}

/// Encode a reply envelope; the manager-side half of the codec
pub fn encode_reply(reply: &Reply) -> Bytes {
    let mut payload = BytesMut::with_capacity(20);
    payload.put_i32(reply.kind.tag());
    payload.put_u32(reply.id);
    payload.put_u32(reply.reqno);
    payload.put_i32(reply.status);
    if reply.kind == MessageKind::Grant {
        payload.put_u32(reply.granted.bits());
    }
    payload.freeze()
}

/// Decode a reply envelope
pub fn decode_reply(payload: &[u8]) -> Result<Reply, MalformedReply> {
    let mut buf = payload;
    need(&buf, 16, "reply envelope")?;
    let tag = buf.get_i32();
    let kind = MessageKind::from_tag(tag)
        .ok_or_else(|| MalformedReply(format!("unknown kind tag {tag}")))?;
    let id = buf.get_u32();
    let reqno = buf.get_u32();
    let status = buf.get_i32();
    let granted = if kind == MessageKind::Grant {
        need(&buf, 4, "granted set")?;
        Capabilities::from_bits(buf.get_u32())
    } else {
        Capabilities::empty()
    };
    if buf.has_remaining() {
        return Err(MalformedReply(format!(
            "{} trailing bytes after {kind:?} reply",
            buf.remaining()
        )));
    }
    Ok(Reply {
        kind,
        id,
        reqno,
        status,
        granted,
    })
}

/// Write a length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read a length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8], what: &str) -> Result<String, MalformedReply> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MalformedReply(format!(
            "{what} length {len} exceeds frame bound"
        )));
    }
    need(buf, len, what)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MalformedReply(format!("{what} is not valid UTF-8")))
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), MalformedReply> {
    if buf.remaining() < n {
        return Err(MalformedReply(format!("truncated {what}")));
    }
    Ok(())
}
