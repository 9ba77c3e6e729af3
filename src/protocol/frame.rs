//! Read and write message frames from the wire.
//!
//! Every message is preceded by a 4-byte big-endian length.

use std::io::{Cursor, Read, Write};

use thiserror::Error;

use super::{
    primitives::Int32,
    traits::{ReadType, WriteType},
};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Cannot read data: {0}")]
    IO(#[from] std::io::Error),

    #[error("Negative message size: {size}")]
    NegativeMessageSize { size: i32 },

    #[error("Message too large: {size} exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

pub trait MessageRead {
    /// Read one length-prefixed message, rejecting anything larger than
    /// `max_message_size`.
    fn read_message(&mut self, max_message_size: usize) -> Result<Vec<u8>, ReadError>;
}

impl<R> MessageRead for R
where
    R: Read,
{
    fn read_message(&mut self, max_message_size: usize) -> Result<Vec<u8>, ReadError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let len = Int32::read(&mut Cursor::new(len_buf))
            .expect("reading Int32 from an in-memory buffer cannot fail");

        if len.0 < 0 {
            return Err(ReadError::NegativeMessageSize { size: len.0 });
        }
        let len = len.0 as usize;
        if len > max_message_size {
            return Err(ReadError::MessageTooLarge {
                size: len,
                limit: max_message_size,
            });
        }

        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Cannot write data: {0}")]
    IO(#[from] std::io::Error),

    #[error("Message too large: {size}")]
    TooLarge { size: usize },
}

pub trait MessageWrite {
    fn write_message(&mut self, msg: &[u8]) -> Result<(), WriteError>;
}

impl<W> MessageWrite for W
where
    W: Write,
{
    fn write_message(&mut self, msg: &[u8]) -> Result<(), WriteError> {
        let len = Int32(i32::try_from(msg.len()).map_err(|_| WriteError::TooLarge {
            size: msg.len(),
        })?);

        let mut len_buf = Vec::with_capacity(4);
        len.write(&mut len_buf)
            .expect("Int32 is always writable to an in-memory buffer");

        self.write_all(&len_buf)?;
        self.write_all(msg)?;
        Ok(())
    }
}

/// Frame a complete message, length prefix included.
pub fn frame_message(msg: &[u8]) -> Result<Vec<u8>, WriteError> {
    let mut out = Vec::with_capacity(msg.len() + 4);
    out.write_message(msg)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_roundtrip() {
        let mut stream = Cursor::new(vec![]);
        stream.write_message(b"hello").unwrap();
        stream.set_position(0);
        assert_eq!(stream.read_message(1024).unwrap(), b"hello");
    }

    #[test]
    fn test_read_too_large() {
        let mut stream = Cursor::new(vec![]);
        stream.write_message(&vec![0u8; 100]).unwrap();
        stream.set_position(0);
        let err = stream.read_message(10).unwrap_err();
        assert_matches!(err, ReadError::MessageTooLarge { size: 100, limit: 10 });
    }

    #[test]
    fn test_read_negative_size() {
        let mut stream = Cursor::new((-1i32).to_be_bytes().to_vec());
        let err = stream.read_message(10).unwrap_err();
        assert_matches!(err, ReadError::NegativeMessageSize { size: -1 });
    }
}
