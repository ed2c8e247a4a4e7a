//! Provides `Framed` -- writing/flushing and reading fixed-size DSM
//! frames to/from the async stream, buffered with BytesMut. All
//! functions are cancellation safe.
//!
//! `FramedReader` and `FramedWriter` halves can be used separately in
//! different tasks without going through futures::stream splitting
//! (which boxes in polling); tokio::io::split is used instead.

use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{Frame, ProtocolError, DSM_MSG_SIZE};

const INITIAL_CAPACITY: usize = 2 * DSM_MSG_SIZE;

/// Error on a DSM connection: either IO (physical transport error) or
/// protocol violation.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    pub fn into_io_error(self) -> io::Error {
        match self {
            ConnectionError::Io(io) => io,
            ConnectionError::Protocol(pe) => io::Error::new(io::ErrorKind::Other, pe.to_string()),
        }
    }
}

/// Wraps async io `stream`, providing frames to write/flush + read.
pub struct Framed<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Framed<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            write_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> Framed<S> {
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }
}

impl<S: AsyncWrite + Unpin> Framed<S> {
    /// Write next frame to the output buffer; doesn't flush.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        write_frame(&mut self.write_buf, frame)
    }

    /// Flush out the buffer. This function is cancellation safe: it can
    /// be interrupted and flushing will be continued in the next call.
    pub async fn flush(&mut self) -> Result<(), io::Error> {
        flush(&mut self.stream, &mut self.write_buf).await
    }

    /// Flush out the buffer and shutdown the stream.
    pub async fn shutdown(&mut self) -> Result<(), io::Error> {
        shutdown(&mut self.stream, &mut self.write_buf).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framed<S> {
    /// Split into owned read and write parts for use in separate tasks.
    pub fn split(self) -> (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let reader = FramedReader {
            stream: read_half,
            read_buf: self.read_buf,
        };
        let writer = FramedWriter {
            stream: write_half,
            write_buf: self.write_buf,
        };
        (reader, writer)
    }

    /// Join read and write parts back.
    pub fn unsplit(reader: FramedReader<ReadHalf<S>>, writer: FramedWriter<WriteHalf<S>>) -> Self {
        Self {
            stream: reader.stream.unsplit(writer.stream),
            read_buf: reader.read_buf,
            write_buf: writer.write_buf,
        }
    }
}

/// Read-only version of `Framed`.
pub struct FramedReader<S> {
    stream: S,
    read_buf: BytesMut,
}

impl<S: AsyncRead + Unpin> FramedReader<S> {
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }
}

/// Write-only version of `Framed`.
pub struct FramedWriter<S> {
    stream: S,
    write_buf: BytesMut,
}

impl<S: AsyncWrite + Unpin> FramedWriter<S> {
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        write_frame(&mut self.write_buf, frame)
    }

    pub async fn flush(&mut self) -> Result<(), io::Error> {
        flush(&mut self.stream, &mut self.write_buf).await
    }

    pub async fn shutdown(&mut self) -> Result<(), io::Error> {
        shutdown(&mut self.stream, &mut self.write_buf).await
    }
}

/// Read the next frame from the stream. Returns Ok(None) on a clean EOF
/// at a frame boundary. Cancellation safe: an incomplete read is
/// finished by the next call.
async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_buf: &mut BytesMut,
) -> Result<Option<Frame>, ConnectionError> {
    loop {
        if read_buf.len() >= DSM_MSG_SIZE {
            let frame = Frame::unpack(&read_buf[..DSM_MSG_SIZE])?;
            read_buf.advance(DSM_MSG_SIZE);
            return Ok(Some(frame));
        }
        // Not a whole frame yet; read more. Reserve at least one byte so
        // we don't get a spurious 0 that looks like EOF.
        read_buf.reserve(DSM_MSG_SIZE - read_buf.len());
        if stream.read_buf(read_buf).await? == 0 {
            if read_buf.has_remaining() {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "EOF in the middle of a frame",
                )
                .into());
            } else {
                return Ok(None); // clean EOF
            }
        }
    }
}

fn write_frame(write_buf: &mut BytesMut, frame: &Frame) -> Result<(), ProtocolError> {
    let start = write_buf.len();
    write_buf.resize(start + DSM_MSG_SIZE, 0);
    frame.pack_into(&mut write_buf[start..])
}

async fn flush<S: AsyncWrite + Unpin>(
    stream: &mut S,
    write_buf: &mut BytesMut,
) -> Result<(), io::Error> {
    while write_buf.has_remaining() {
        let bytes_written = stream.write(write_buf.chunk()).await?;
        if bytes_written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "failed to write frame"));
        }
        write_buf.advance(bytes_written);
    }
    write_buf.clear();
    stream.flush().await
}

async fn shutdown<S: AsyncWrite + Unpin>(
    stream: &mut S,
    write_buf: &mut BytesMut,
) -> Result<(), io::Error> {
    flush(stream, write_buf).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SemName;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(DSM_MSG_SIZE / 3);
        let mut tx = Framed::new(client);
        let mut rx = Framed::new(server);

        let sent = vec![
            Frame::AddPid { pid: 11 },
            Frame::WaitSem {
                pid: 11,
                name: SemName::new("sem_one"),
            },
            Frame::Exit,
        ];
        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for frame in &to_send {
                tx.write_frame(frame).unwrap();
            }
            tx.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        while let Some(frame) = rx.read_frame().await.unwrap() {
            got.push(frame);
        }
        writer.await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut rx = Framed::new(server);
        {
            let mut tx = client;
            tx.write_all(&[0u8; 100]).await.unwrap();
            tx.shutdown().await.unwrap();
        }
        assert!(matches!(
            rx.read_frame().await,
            Err(ConnectionError::Io(_))
        ));
    }
}
