//! Wire protocol shared by DSM clients, the per-host arbiter and the
//! session daemon: a closed set of message kinds carried in fixed-size
//! frames. Packing and unpacking are pure functions over byte buffers of
//! exactly [`DSM_MSG_SIZE`]; integers are big-endian, names are
//! fixed-width and null-padded.

use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

pub mod framed;

/// Size of every frame on the wire: a 16-byte header area followed by up
/// to one page of payload.
pub const DSM_MSG_SIZE: usize = 16 + DSM_PAGE_SIZE;

/// Unit of coherence. Clients verify the OS page size matches at init.
pub const DSM_PAGE_SIZE: usize = 4096;

/// Width of a semaphore name on the wire: 31 chars + NUL.
pub const DSM_SEM_NAME_SIZE: usize = 32;

/// Loopback port the arbiter listens on for local clients.
pub const DSM_ARB_PORT: u16 = 4800;

/// Conventional port of the global session daemon.
pub const DSM_DAEMON_PORT: u16 = 4200;

/// Directory holding the per-session shared files.
pub const DSM_SHM_DIR: &str = "/dev/shm";

/// Path of the backing file for session `sid`. Created and truncated by
/// the arbiter only; clients open it pre-existing.
pub fn shared_file_path(sid: &str) -> PathBuf {
    PathBuf::from(DSM_SHM_DIR).join(format!("dsm_{sid}"))
}

/// Protocol violation: malformed or unexpected bytes on the wire.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
    #[error("page payload of {0} bytes exceeds a page")]
    OversizedPayload(usize),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}

/// Fixed-width, null-padded semaphore name. Longer names are silently
/// truncated to 31 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemName([u8; DSM_SEM_NAME_SIZE]);

impl SemName {
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; DSM_SEM_NAME_SIZE];
        let bytes = name.as_bytes();
        let n = bytes.len().min(DSM_SEM_NAME_SIZE - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        SemName(buf)
    }

    pub fn from_wire(raw: [u8; DSM_SEM_NAME_SIZE]) -> Result<Self, ProtocolError> {
        if raw[DSM_SEM_NAME_SIZE - 1] != 0 {
            return Err(ProtocolError::BadFrame("semaphore name not terminated"));
        }
        Ok(SemName(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DSM_SEM_NAME_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl std::fmt::Display for SemName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl std::fmt::Debug for SemName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SemName({self})")
    }
}

impl From<&str> for SemName {
    fn from(s: &str) -> Self {
        SemName::new(s)
    }
}

/// One protocol message. The variant set is closed; every variant packs
/// into (and unpacks from) a single [`DSM_MSG_SIZE`] frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Frame {
    /// Client check-in, client -> arbiter (relayed to the daemon).
    AddPid { pid: u32 },
    /// Gid assignment and session-start signal, arbiter -> client.
    SetGid { pid: u32, gid: u32 },
    /// Barrier hit, client -> arbiter (relayed to the daemon).
    HitBar { pid: u32 },
    /// Semaphore down. Client -> arbiter -> daemon.
    WaitSem { pid: u32, name: SemName },
    /// Semaphore up, and in the reverse direction the wake.
    PostSem { pid: u32, name: SemName },
    /// Dirty bytes of one written page.
    WriteData { offset: u64, data: Bytes },
    /// Write-intent announcement opening a coherence round.
    SynReq { pid: u32 },
    /// Round grant / round completion handshake.
    SynAck { pid: u32 },
    /// Pause all participants for the duration of a round.
    StopAll,
    /// Resume: closes a round, releases a barrier, or (before session
    /// start) signals cohort-ready. Disambiguated by connection state.
    ContAll,
    /// Goodbye.
    Exit,
}

mod tag {
    pub const ADD_PID: u8 = 1;
    pub const SET_GID: u8 = 2;
    pub const HIT_BAR: u8 = 3;
    pub const WAIT_SEM: u8 = 4;
    pub const POST_SEM: u8 = 5;
    pub const WRT_DATA: u8 = 6;
    pub const SYN_REQ: u8 = 7;
    pub const SYN_ACK: u8 = 8;
    pub const STP_ALL: u8 = 9;
    pub const CNT_ALL: u8 = 10;
    pub const EXIT: u8 = 11;
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::AddPid { .. } => tag::ADD_PID,
            Frame::SetGid { .. } => tag::SET_GID,
            Frame::HitBar { .. } => tag::HIT_BAR,
            Frame::WaitSem { .. } => tag::WAIT_SEM,
            Frame::PostSem { .. } => tag::POST_SEM,
            Frame::WriteData { .. } => tag::WRT_DATA,
            Frame::SynReq { .. } => tag::SYN_REQ,
            Frame::SynAck { .. } => tag::SYN_ACK,
            Frame::StopAll => tag::STP_ALL,
            Frame::ContAll => tag::CNT_ALL,
            Frame::Exit => tag::EXIT,
        }
    }

    /// Pack into a fresh zeroed frame.
    pub fn pack(&self) -> Result<Box<[u8; DSM_MSG_SIZE]>, ProtocolError> {
        let mut buf = Box::new([0u8; DSM_MSG_SIZE]);
        self.pack_into(&mut *buf)?;
        Ok(buf)
    }

    /// Pack into `buf`, which must be exactly one frame long. Bytes not
    /// covered by the payload are zeroed so a frame is a pure function
    /// of the message.
    pub fn pack_into(&self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if buf.len() != DSM_MSG_SIZE {
            return Err(ProtocolError::BadFrame("pack buffer is not one frame"));
        }
        buf.fill(0);
        buf[0] = self.tag();
        match self {
            Frame::AddPid { pid }
            | Frame::HitBar { pid }
            | Frame::SynReq { pid }
            | Frame::SynAck { pid } => {
                BigEndian::write_u32(&mut buf[4..8], *pid);
            }
            Frame::SetGid { pid, gid } => {
                BigEndian::write_u32(&mut buf[4..8], *pid);
                BigEndian::write_u32(&mut buf[8..12], *gid);
            }
            Frame::WaitSem { pid, name } | Frame::PostSem { pid, name } => {
                BigEndian::write_u32(&mut buf[4..8], *pid);
                buf[8..8 + DSM_SEM_NAME_SIZE].copy_from_slice(name.as_bytes());
            }
            Frame::WriteData { offset, data } => {
                if data.len() > DSM_PAGE_SIZE {
                    return Err(ProtocolError::OversizedPayload(data.len()));
                }
                BigEndian::write_u32(&mut buf[4..8], data.len() as u32);
                BigEndian::write_u64(&mut buf[8..16], *offset);
                buf[16..16 + data.len()].copy_from_slice(data);
            }
            Frame::StopAll | Frame::ContAll | Frame::Exit => {}
        }
        Ok(())
    }

    /// Unpack one frame. `buf` must be exactly [`DSM_MSG_SIZE`] bytes.
    pub fn unpack(buf: &[u8]) -> Result<Frame, ProtocolError> {
        if buf.len() != DSM_MSG_SIZE {
            return Err(ProtocolError::BadFrame("frame is not DSM_MSG_SIZE bytes"));
        }
        let pid = BigEndian::read_u32(&buf[4..8]);
        let frame = match buf[0] {
            tag::ADD_PID => Frame::AddPid { pid },
            tag::SET_GID => Frame::SetGid {
                pid,
                gid: BigEndian::read_u32(&buf[8..12]),
            },
            tag::HIT_BAR => Frame::HitBar { pid },
            tag::WAIT_SEM => Frame::WaitSem {
                pid,
                name: unpack_name(buf)?,
            },
            tag::POST_SEM => Frame::PostSem {
                pid,
                name: unpack_name(buf)?,
            },
            tag::WRT_DATA => {
                let len = pid as usize; // bytes 4..8 carry the length here
                if len > DSM_PAGE_SIZE {
                    return Err(ProtocolError::OversizedPayload(len));
                }
                Frame::WriteData {
                    offset: BigEndian::read_u64(&buf[8..16]),
                    data: Bytes::copy_from_slice(&buf[16..16 + len]),
                }
            }
            tag::SYN_REQ => Frame::SynReq { pid },
            tag::SYN_ACK => Frame::SynAck { pid },
            tag::STP_ALL => Frame::StopAll,
            tag::CNT_ALL => Frame::ContAll,
            tag::EXIT => Frame::Exit,
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        Ok(frame)
    }
}

fn unpack_name(buf: &[u8]) -> Result<SemName, ProtocolError> {
    let mut raw = [0u8; DSM_SEM_NAME_SIZE];
    raw.copy_from_slice(&buf[8..8 + DSM_SEM_NAME_SIZE]);
    SemName::from_wire(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let buf = frame.pack().expect("pack");
        let back = Frame::unpack(&buf[..]).expect("unpack");
        assert_eq!(frame, back);
    }

    #[test]
    fn roundtrip_every_kind() {
        roundtrip(Frame::AddPid { pid: 1234 });
        roundtrip(Frame::SetGid { pid: 1234, gid: 3 });
        roundtrip(Frame::HitBar { pid: u32::MAX });
        roundtrip(Frame::WaitSem {
            pid: 7,
            name: SemName::new("sem_zero"),
        });
        roundtrip(Frame::PostSem {
            pid: 7,
            name: SemName::new("mutex"),
        });
        roundtrip(Frame::WriteData {
            offset: 8192,
            data: Bytes::from_static(b"\x01\x02\x03\x04"),
        });
        roundtrip(Frame::WriteData {
            offset: 0,
            data: Bytes::from(vec![0xab; DSM_PAGE_SIZE]),
        });
        roundtrip(Frame::SynReq { pid: 99 });
        roundtrip(Frame::SynAck { pid: 99 });
        roundtrip(Frame::StopAll);
        roundtrip(Frame::ContAll);
        roundtrip(Frame::Exit);
    }

    #[test]
    fn unknown_kind_is_protocol_error() {
        let mut buf = [0u8; DSM_MSG_SIZE];
        buf[0] = 0xfe;
        assert!(matches!(
            Frame::unpack(&buf),
            Err(ProtocolError::UnknownKind(0xfe))
        ));
    }

    #[test]
    fn short_buffer_is_protocol_error() {
        assert!(Frame::unpack(&[0u8; 16]).is_err());
        let mut buf = [0u8; 16];
        assert!(Frame::Exit.pack_into(&mut buf).is_err());
    }

    #[test]
    fn oversized_page_payload_rejected() {
        let frame = Frame::WriteData {
            offset: 0,
            data: Bytes::from(vec![0; DSM_PAGE_SIZE + 1]),
        };
        assert!(matches!(
            frame.pack(),
            Err(ProtocolError::OversizedPayload(_))
        ));

        let mut buf = [0u8; DSM_MSG_SIZE];
        buf[0] = 6; // WRT_DATA
        BigEndian::write_u32(&mut buf[4..8], (DSM_PAGE_SIZE + 1) as u32);
        assert!(matches!(
            Frame::unpack(&buf),
            Err(ProtocolError::OversizedPayload(_))
        ));
    }

    #[test]
    fn long_names_truncate_to_31_bytes() {
        let long = "x".repeat(64);
        let name = SemName::new(&long);
        assert_eq!(name.to_string(), "x".repeat(31));
        // Wire form stays terminated.
        assert_eq!(name.as_bytes()[DSM_SEM_NAME_SIZE - 1], 0);
    }

    #[test]
    fn unterminated_wire_name_rejected() {
        let mut buf = [0u8; DSM_MSG_SIZE];
        buf[0] = 4; // WAIT_SEM
        buf[8..40].fill(b'a');
        assert!(matches!(
            Frame::unpack(&buf),
            Err(ProtocolError::BadFrame(_))
        ));
    }

    #[test]
    fn packing_is_deterministic() {
        let frame = Frame::WaitSem {
            pid: 42,
            name: SemName::new("abc"),
        };
        assert_eq!(frame.pack().unwrap(), frame.pack().unwrap());
    }
}
