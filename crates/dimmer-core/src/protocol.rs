//! Host ↔ worker wire protocol
//!
//! Every message starts with a one-byte tag. The payload that follows has a
//! fixed shape for each tag; integers are little-endian. The only variable
//! payload is the module name reply, which is length-prefixed.
//!
//! | Request          | Payload              | Success reply payload           |
//! |------------------|----------------------|---------------------------------|
//! | ARE_YOU_ALIVE    | –                    | worker id (u32)                 |
//! | PLEASE_DIE       | –                    | –                               |
//! | QUERY_DEVMODS    | –                    | backend count (u32)             |
//! | QUERY_DEVMODNAME | index (u32)          | len (u8) + name bytes           |
//! | DEVICE_EXISTS    | index (u32)          | –                               |
//! | INIT_DEVICE      | index (u32)          | –                               |
//! | DEINIT_DEVICE    | –                    | –                               |
//! | QUERY_DEVICE     | –                    | channels (u32), outputs (u32), duplexed (u8), duplex capable (u8) |
//! | SET_DUPLEX       | enabled (u8)         | –                               |
//! | SET_CHANNEL      | channel (u32), level (u8) | no reply                   |
//!
//! Replies are COMPLIANCE (+ payload) or NON_COMPLIANCE. I_AM_ALIVE shares
//! the COMPLIANCE tag value, so a reply can only be decoded knowing which
//! request it answers.

use crate::types::DeviceDescriptor;
use std::io::{self, Read, Write};

/// Well-known name of the host → worker endpoint
pub const REQUEST_ENDPOINT: &str = ".dimmerfifo1";
/// Well-known name of the worker → host endpoint
pub const RESPONSE_ENDPOINT: &str = ".dimmerfifo2";

/// Longest module name that fits the u8 length prefix
pub const MAX_MODULE_NAME: usize = u8::MAX as usize;

/// Message tag, the first byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Null = 0,
    AreYouAlive = 1,
    Compliance = 2,
    NonCompliance = 3,
    PleaseDie = 4,
    QueryDevice = 5,
    DeviceExists = 6,
    SetChannel = 7,
    InitDevice = 8,
    DeinitDevice = 9,
    SetDuplex = 10,
    QueryDevMods = 11,
    QueryDevModName = 12,
}

impl Tag {
    /// Handshake reply; same wire value as [`Tag::Compliance`]
    pub const I_AM_ALIVE: Tag = Tag::Compliance;
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Tag::Null,
            1 => Tag::AreYouAlive,
            2 => Tag::Compliance,
            3 => Tag::NonCompliance,
            4 => Tag::PleaseDie,
            5 => Tag::QueryDevice,
            6 => Tag::DeviceExists,
            7 => Tag::SetChannel,
            8 => Tag::InitDevice,
            9 => Tag::DeinitDevice,
            10 => Tag::SetDuplex,
            11 => Tag::QueryDevMods,
            12 => Tag::QueryDevModName,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// Wire-level failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Control channel closed")]
    Disconnected,

    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("Unexpected reply tag {tag} to {request:?}")]
    UnexpectedReply { request: Tag, tag: u8 },

    #[error("Tag {0:?} is not a request")]
    NotARequest(Tag),

    #[error("Liveness handshake failed: {0}")]
    Handshake(String),

    #[error("Control channel I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ProtocolError::Disconnected,
            _ => ProtocolError::Io(e),
        }
    }
}

/// Host → worker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AreYouAlive,
    PleaseDie,
    QueryDevMods,
    QueryDevModName(u32),
    DeviceExists(u32),
    InitDevice(u32),
    DeinitDevice,
    QueryDevice,
    SetDuplex(bool),
    SetChannel { channel: u32, level: u8 },
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::AreYouAlive => Tag::AreYouAlive,
            Request::PleaseDie => Tag::PleaseDie,
            Request::QueryDevMods => Tag::QueryDevMods,
            Request::QueryDevModName(_) => Tag::QueryDevModName,
            Request::DeviceExists(_) => Tag::DeviceExists,
            Request::InitDevice(_) => Tag::InitDevice,
            Request::DeinitDevice => Tag::DeinitDevice,
            Request::QueryDevice => Tag::QueryDevice,
            Request::SetDuplex(_) => Tag::SetDuplex,
            Request::SetChannel { .. } => Tag::SetChannel,
        }
    }

    /// Whether the worker answers this request
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::SetChannel { .. })
    }

    /// Append the encoded message to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag() as u8);
        match *self {
            Request::QueryDevModName(index)
            | Request::DeviceExists(index)
            | Request::InitDevice(index) => out.extend_from_slice(&index.to_le_bytes()),
            Request::SetDuplex(enabled) => out.push(u8::from(enabled)),
            Request::SetChannel { channel, level } => {
                out.extend_from_slice(&channel.to_le_bytes());
                out.push(level);
            }
            Request::AreYouAlive
            | Request::PleaseDie
            | Request::QueryDevMods
            | Request::DeinitDevice
            | Request::QueryDevice => {}
        }
    }

    /// Write the message as a single chunk
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let mut buf = Vec::with_capacity(6);
        self.encode(&mut buf);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one request
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, ProtocolError> {
        let tag = Tag::try_from(read_u8(reader)?)?;
        Ok(match tag {
            Tag::AreYouAlive => Request::AreYouAlive,
            Tag::PleaseDie => Request::PleaseDie,
            Tag::QueryDevMods => Request::QueryDevMods,
            Tag::QueryDevModName => Request::QueryDevModName(read_u32(reader)?),
            Tag::DeviceExists => Request::DeviceExists(read_u32(reader)?),
            Tag::InitDevice => Request::InitDevice(read_u32(reader)?),
            Tag::DeinitDevice => Request::DeinitDevice,
            Tag::QueryDevice => Request::QueryDevice,
            Tag::SetDuplex => Request::SetDuplex(read_u8(reader)? != 0),
            Tag::SetChannel => {
                let channel = read_u32(reader)?;
                let level = read_u8(reader)?;
                Request::SetChannel { channel, level }
            }
            Tag::Null | Tag::Compliance | Tag::NonCompliance => {
                return Err(ProtocolError::NotARequest(tag))
            }
        })
    }
}

/// Worker → host message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// I_AM_ALIVE with the worker's process/task id
    Alive { worker_id: u32 },
    /// COMPLIANCE without payload
    Compliance,
    /// COMPLIANCE to QUERY_DEVMODS
    ModuleCount(u32),
    /// COMPLIANCE to QUERY_DEVMODNAME
    ModuleName(String),
    /// COMPLIANCE to QUERY_DEVICE
    Device(DeviceDescriptor),
    NonCompliance,
}

impl Response {
    pub fn is_compliance(&self) -> bool {
        !matches!(self, Response::NonCompliance)
    }

    /// Append the encoded message to `out`
    ///
    /// Module names longer than [`MAX_MODULE_NAME`] bytes are truncated.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Response::NonCompliance => out.push(Tag::NonCompliance as u8),
            Response::Compliance => out.push(Tag::Compliance as u8),
            Response::Alive { worker_id } => {
                out.push(Tag::I_AM_ALIVE as u8);
                out.extend_from_slice(&worker_id.to_le_bytes());
            }
            Response::ModuleCount(count) => {
                out.push(Tag::Compliance as u8);
                out.extend_from_slice(&count.to_le_bytes());
            }
            Response::ModuleName(name) => {
                let bytes = &name.as_bytes()[..name.len().min(MAX_MODULE_NAME)];
                out.push(Tag::Compliance as u8);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            Response::Device(desc) => {
                out.push(Tag::Compliance as u8);
                out.extend_from_slice(&desc.channel_count.to_le_bytes());
                out.extend_from_slice(&desc.output_count.to_le_bytes());
                out.push(u8::from(desc.duplexed));
                out.push(u8::from(desc.duplex_capable));
            }
        }
    }

    /// Write the message as a single chunk
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let mut buf = Vec::with_capacity(16);
        self.encode(&mut buf);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the reply to a request carrying `request` as its tag
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, request: Tag) -> Result<Self, ProtocolError> {
        let raw = read_u8(reader)?;
        let unexpected = || ProtocolError::UnexpectedReply { request, tag: raw };

        match Tag::try_from(raw).map_err(|_| unexpected())? {
            Tag::NonCompliance => Ok(Response::NonCompliance),
            Tag::Compliance => Ok(match request {
                Tag::AreYouAlive => Response::Alive {
                    worker_id: read_u32(reader)?,
                },
                Tag::QueryDevMods => Response::ModuleCount(read_u32(reader)?),
                Tag::QueryDevModName => {
                    let len = read_u8(reader)? as usize;
                    let mut name = vec![0u8; len];
                    reader.read_exact(&mut name)?;
                    Response::ModuleName(String::from_utf8_lossy(&name).into_owned())
                }
                Tag::QueryDevice => {
                    let channel_count = read_u32(reader)?;
                    let output_count = read_u32(reader)?;
                    let duplexed = read_u8(reader)? != 0;
                    let duplex_capable = read_u8(reader)? != 0;
                    Response::Device(DeviceDescriptor {
                        channel_count,
                        output_count,
                        duplexed,
                        duplex_capable,
                    })
                }
                _ => Response::Compliance,
            }),
            _ => Err(unexpected()),
        }
    }
}

fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, ProtocolError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
