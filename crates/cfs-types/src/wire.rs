//! Little-endian primitives shared by every persisted record.
//!
//! Strings are stored with a 32-bit byte-length prefix followed by the raw
//! code units and zero padding up to the next 4-byte boundary. The padding
//! is not counted in the prefix.
//!
//! Writers return the number of bytes produced so callers can account for
//! record sizes. Readers treat a premature end of input as corruption.

use std::io::{self, Read, Write};

use crate::error::{StorageError, StorageResult};

/// Upper bound for a length-prefixed UTF-16 string on disk.
pub const MAX_UTF16_STRING_BYTES: usize = 64 * 1024;

/// Bytes of zero padding needed to reach the next 4-byte boundary.
pub fn padding_for(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn read_array<R: Read + ?Sized, const N: usize>(
    reader: &mut R,
    what: &str,
) -> StorageResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what))?;
    Ok(buf)
}

fn truncated(err: io::Error, what: &str) -> StorageError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        StorageError::corrupt(format!("truncated {what}"))
    } else {
        StorageError::from_io(err)
    }
}

pub fn write_i32<W: Write + ?Sized>(writer: &mut W, value: i32) -> StorageResult<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(4)
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> StorageResult<i32> {
    Ok(i32::from_le_bytes(read_array(reader, "i32 field")?))
}

pub fn write_u16<W: Write + ?Sized>(writer: &mut W, value: u16) -> StorageResult<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(2)
}

pub fn read_u16<R: Read + ?Sized>(reader: &mut R) -> StorageResult<u16> {
    Ok(u16::from_le_bytes(read_array(reader, "u16 field")?))
}

pub fn write_i64<W: Write + ?Sized>(writer: &mut W, value: i64) -> StorageResult<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(8)
}

pub fn read_i64<R: Read + ?Sized>(reader: &mut R) -> StorageResult<i64> {
    Ok(i64::from_le_bytes(read_array(reader, "i64 field")?))
}

/// Read a non-negative i32 length field.
pub fn read_length<R: Read + ?Sized>(reader: &mut R, what: &str) -> StorageResult<usize> {
    let value = read_i32(reader)?;
    usize::try_from(value)
        .map_err(|_| StorageError::corrupt(format!("negative {what}: {value}")))
}

/// Skip `count` bytes of input, failing on early end of input.
pub fn skip_bytes<R: Read + ?Sized>(
    reader: &mut R,
    count: usize,
    what: &str,
) -> StorageResult<()> {
    let copied = io::copy(&mut reader.take(count as u64), &mut io::sink())?;
    if copied != count as u64 {
        return Err(StorageError::corrupt(format!("truncated {what}")));
    }
    Ok(())
}

/// Read exactly `count` bytes.
///
/// The buffer grows with the input actually present, so a corrupt length
/// field cannot force a large allocation.
pub fn read_bytes<R: Read + ?Sized>(
    reader: &mut R,
    count: usize,
    what: &str,
) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    Read::take(&mut *reader, count as u64)
        .read_to_end(&mut buf)
        .map_err(StorageError::from_io)?;
    if buf.len() != count {
        return Err(StorageError::corrupt(format!(
            "truncated {what}: {} of {count} bytes",
            buf.len()
        )));
    }
    Ok(buf)
}

fn write_padded<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> StorageResult<usize> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| StorageError::Argument(format!("string of {} bytes", bytes.len())))?;
    let pad = padding_for(bytes.len());
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)?;
    writer.write_all(&[0u8; 3][..pad])?;
    Ok(4 + bytes.len() + pad)
}

/// On-disk size of a length-prefixed UTF-16 string, padding included.
pub fn utf16_string_size(value: &str) -> usize {
    let bytes = value.encode_utf16().count() * 2;
    4 + bytes + padding_for(bytes)
}

pub fn write_utf16_string<W: Write + ?Sized>(
    writer: &mut W,
    value: &str,
) -> StorageResult<usize> {
    let bytes: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
    write_padded(writer, &bytes)
}

/// Read a length-prefixed UTF-16 string. Returns the string and bytes consumed.
pub fn read_utf16_string<R: Read + ?Sized>(reader: &mut R) -> StorageResult<(String, usize)> {
    let len = read_length(reader, "string length")?;
    if len % 2 != 0 {
        return Err(StorageError::corrupt(format!(
            "UTF-16 string has odd byte length {len}"
        )));
    }
    if len > MAX_UTF16_STRING_BYTES {
        return Err(StorageError::corrupt(format!(
            "UTF-16 string of {len} bytes exceeds {MAX_UTF16_STRING_BYTES}"
        )));
    }
    let bytes = read_bytes(reader, len, "UTF-16 string")?;
    let pad = padding_for(len);
    skip_bytes(reader, pad, "string padding")?;

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let value = String::from_utf16(&units)
        .map_err(|_| StorageError::corrupt("invalid UTF-16 string"))?;
    Ok((value, 4 + len + pad))
}

pub fn write_utf8_string<W: Write + ?Sized>(writer: &mut W, value: &str) -> StorageResult<usize> {
    write_padded(writer, value.as_bytes())
}

/// Read a length-prefixed UTF-8 string of at most `max_bytes` bytes.
pub fn read_utf8_string<R: Read + ?Sized>(
    reader: &mut R,
    max_bytes: usize,
) -> StorageResult<(String, usize)> {
    let len = read_length(reader, "string length")?;
    if len > max_bytes {
        return Err(StorageError::corrupt(format!(
            "UTF-8 string of {len} bytes exceeds {max_bytes}"
        )));
    }
    let bytes = read_bytes(reader, len, "UTF-8 string")?;
    let pad = padding_for(len);
    skip_bytes(reader, pad, "string padding")?;
    let value =
        String::from_utf8(bytes).map_err(|_| StorageError::corrupt("invalid UTF-8 string"))?;
    Ok((value, 4 + len + pad))
}
