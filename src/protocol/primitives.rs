//! Primitive wire types.
//!
//! Integers are encoded in network byte order (big-endian). Strings and
//! arrays carry a leading length; a length of `-1` marks a null value where
//! the type permits one.

use std::io::{Read, Write};

use super::traits::{ReadError, ReadType, WriteError, WriteType};

/// Upper bound for decoded array lengths.
///
/// Frames are already size-limited, so any length beyond this is corruption,
/// not data.
const MAX_ARRAY_LEN: i32 = 1_000_000;

/// Represents a boolean.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Boolean(pub bool);

impl<R> ReadType<R> for Boolean
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        match buf[0] {
            0 => Ok(Self(false)),
            _ => Ok(Self(true)),
        }
    }
}

impl<W> WriteType<W> for Boolean
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match self.0 {
            true => Ok(writer.write_all(&[1])?),
            false => Ok(writer.write_all(&[0])?),
        }
    }
}

/// Represents an integer between `-2^15` and `2^15-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Int16(pub i16);

impl<R> ReadType<R> for Int16
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        Ok(Self(i16::from_be_bytes(buf)))
    }
}

impl<W> WriteType<W> for Int16
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.0.to_be_bytes())?;
        Ok(())
    }
}

/// Represents an integer between `-2^31` and `2^31-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Int32(pub i32);

impl<R> ReadType<R> for Int32
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(Self(i32::from_be_bytes(buf)))
    }
}

impl<W> WriteType<W> for Int32
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.0.to_be_bytes())?;
        Ok(())
    }
}

/// Represents an integer between `-2^63` and `2^63-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Int64(pub i64);

impl<R> ReadType<R> for Int64
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(Self(i64::from_be_bytes(buf)))
    }
}

impl<W> WriteType<W> for Int64
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.0.to_be_bytes())?;
        Ok(())
    }
}

/// Represents a sequence of characters.
///
/// First the length N is given as an INT16, then N bytes of UTF-8. The
/// length must not be negative.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct String_(pub String);

impl<R> ReadType<R> for String_
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int16::read(reader)?;
        if len.0 < 0 {
            return Err(ReadError::Malformed(
                format!("Invalid negative length for string: {}", len.0).into(),
            ));
        }
        let mut buf = vec![0; len.0 as usize];
        reader.read_exact(&mut buf)?;
        let s = String::from_utf8(buf).map_err(|e| ReadError::Malformed(Box::new(e)))?;
        Ok(Self(s))
    }
}

impl<W> WriteType<W> for String_
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let l = i16::try_from(self.0.len())?;
        Int16(l).write(writer)?;
        writer.write_all(self.0.as_bytes())?;
        Ok(())
    }
}

/// Represents a sequence of characters or null.
///
/// A null value is encoded with a length of -1 and no following bytes.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct NullableString(pub Option<String>);

impl<R> ReadType<R> for NullableString
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int16::read(reader)?;
        match len.0 {
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for nullable string: {}", l).into(),
            )),
            -1 => Ok(Self(None)),
            l => {
                let mut buf = vec![0; l as usize];
                reader.read_exact(&mut buf)?;
                let s = String::from_utf8(buf).map_err(|e| ReadError::Malformed(Box::new(e)))?;
                Ok(Self(Some(s)))
            }
        }
    }
}

impl<W> WriteType<W> for NullableString
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match &self.0 {
            Some(s) => {
                let l = i16::try_from(s.len())?;
                Int16(l).write(writer)?;
                writer.write_all(s.as_bytes())?;
                Ok(())
            }
            None => Int16(-1).write(writer),
        }
    }
}

/// Represents a sequence of objects of a given type, or null.
///
/// First the length N is given as an INT32, then N instances of the element
/// type. A null array is encoded with a length of -1.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Array<T>(pub Option<Vec<T>>);

impl<R, T> ReadType<R> for Array<T>
where
    R: Read,
    T: ReadType<R>,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int32::read(reader)?;
        match len.0 {
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for array: {}", l).into(),
            )),
            l if l > MAX_ARRAY_LEN => Err(ReadError::Malformed(
                format!("Array length {} exceeds limit", l).into(),
            )),
            -1 => Ok(Self(None)),
            l => {
                let mut res = Vec::with_capacity(l as usize);
                for _ in 0..l {
                    res.push(T::read(reader)?);
                }
                Ok(Self(Some(res)))
            }
        }
    }
}

impl<W, T> WriteType<W> for Array<T>
where
    W: Write,
    T: WriteType<W>,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match &self.0 {
            Some(inner) => {
                let l = i32::try_from(inner.len())?;
                Int32(l).write(writer)?;
                for element in inner {
                    element.write(writer)?;
                }
                Ok(())
            }
            None => Int32(-1).write(writer),
        }
    }
}
