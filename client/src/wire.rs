//! Synchronous framing over the control socket: the client API blocks,
//! so frames are read with an incremental one-frame buffer driven by
//! poll readiness rather than an async stream.

use std::io::{self, ErrorKind, Read};

use dsm_proto::framed::ConnectionError;
use dsm_proto::{Frame, DSM_MSG_SIZE};

/// Accumulates bytes until a whole frame is buffered. One `read` is
/// issued per call, so a caller polling for readiness never blocks
/// longer than the transport makes it.
pub(crate) struct FrameBuf {
    buf: Box<[u8; DSM_MSG_SIZE]>,
    filled: usize,
}

impl FrameBuf {
    pub fn new() -> FrameBuf {
        FrameBuf {
            buf: Box::new([0u8; DSM_MSG_SIZE]),
            filled: 0,
        }
    }

    /// Read once; `Ok(Some(frame))` when that read completed a frame.
    /// EOF is an error: the arbiter never half-closes mid-frame or
    /// mid-session from the client's point of view.
    pub fn read_some<R: Read>(&mut self, stream: &mut R) -> Result<Option<Frame>, ConnectionError> {
        let n = stream.read(&mut self.buf[self.filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "arbiter closed the control socket",
            )
            .into());
        }
        self.filled += n;
        if self.filled < DSM_MSG_SIZE {
            return Ok(None);
        }
        self.filled = 0;
        let frame = Frame::unpack(&self.buf[..])?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_proto::SemName;

    /// Reader that trickles bytes out in fixed-size chunks.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(out.len()).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn frames_reassemble_from_partial_reads() {
        let first = Frame::SetGid { pid: 7, gid: 1 };
        let second = Frame::PostSem {
            pid: 7,
            name: SemName::new("sem_zero"),
        };
        let mut data = first.pack().unwrap().to_vec();
        data.extend_from_slice(&second.pack().unwrap()[..]);
        let mut stream = Trickle {
            data,
            pos: 0,
            chunk: 1000,
        };

        let mut fb = FrameBuf::new();
        let mut got = Vec::new();
        while got.len() < 2 {
            if let Some(frame) = fb.read_some(&mut stream).unwrap() {
                got.push(frame);
            }
        }
        assert_eq!(got, vec![first, second]);
    }

    #[test]
    fn eof_mid_frame_errors() {
        let mut stream = Trickle {
            data: vec![1u8; 100],
            pos: 0,
            chunk: 100,
        };
        let mut fb = FrameBuf::new();
        assert!(fb.read_some(&mut stream).unwrap().is_none());
        assert!(matches!(
            fb.read_some(&mut stream),
            Err(ConnectionError::Io(_))
        ));
    }
}
