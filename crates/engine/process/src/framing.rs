//! Length-prefixed record framing
//!
//! Every record exchanged with a native process uses the same encoding: a
//! 4-byte big-endian field count, then for each field a 4-byte big-endian
//! byte length followed by the UTF-8 bytes of the field.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest field accepted by the reader (1 GiB)
pub const MAX_FIELD_LEN: u32 = 1 << 30;

/// Largest field count accepted by the reader
pub const MAX_FIELD_COUNT: u32 = 1_000_000;

/// Encode one record into a byte buffer
pub fn encode_record<S: AsRef<str>>(fields: &[S], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for field in fields {
        let bytes = field.as_ref().as_bytes();
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
    }
}

/// Writes framed records to a process input
#[derive(Debug)]
pub struct FramedRecordWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FramedRecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Write one record; it is not guaranteed to reach the process until
    /// [`flush`](Self::flush)
    pub async fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        self.buf.clear();
        encode_record(fields, &mut self.buf);
        self.inner.write_all(&self.buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    /// Flush and close the stream; the process sees end of input
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

/// Reads framed records from a process output
#[derive(Debug)]
pub struct FramedRecordReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` on a clean end of stream at a record boundary. A
    /// stream that ends inside a record is an `UnexpectedEof` error.
    pub async fn read_record(&mut self) -> io::Result<Option<Vec<String>>> {
        let Some(count) = self.read_count().await? else {
            return Ok(None);
        };
        if count > MAX_FIELD_COUNT {
            return Err(corrupt(format!("record claims {count} fields")));
        }

        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = self.inner.read_u32().await?;
            if len > MAX_FIELD_LEN {
                return Err(corrupt(format!("field claims {len} bytes")));
            }
            let mut bytes = vec![0u8; len as usize];
            self.inner.read_exact(&mut bytes).await?;
            let field = String::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
            fields.push(field);
        }
        Ok(Some(fields))
    }

    /// The field count, or `None` if the stream ended before any byte of it
    async fn read_count(&mut self) -> io::Result<Option<u32>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record header",
                ));
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(header)))
    }
}

fn corrupt(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encoding_layout() {
        let mut buf = Vec::new();
        encode_record(&["ab", ""], &mut buf);
        assert_eq!(buf, vec![0, 0, 0, 2, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_reader_sees_clean_end() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedRecordWriter::new(client);
        writer.write_record(&["time", "airline", "."]).await.unwrap();
        writer.write_record(&["1400000000", "AAL", ""]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FramedRecordReader::new(server);
        assert_eq!(
            reader.read_record().await.unwrap().unwrap(),
            vec!["time", "airline", "."]
        );
        assert_eq!(
            reader.read_record().await.unwrap().unwrap(),
            vec!["1400000000", "AAL", ""]
        );
        assert!(reader.read_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_record_is_an_error() {
        let mut buf = Vec::new();
        encode_record(&["flush", "17"], &mut buf);
        buf.truncate(buf.len() - 1);

        let mut reader = FramedRecordReader::new(buf.as_slice());
        let err = reader.read_record().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let bytes = [0u8, 0];
        let mut reader = FramedRecordReader::new(&bytes[..]);
        let err = reader.read_record().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_field_count_rejected() {
        let bytes = (MAX_FIELD_COUNT + 1).to_be_bytes();
        let mut reader = FramedRecordReader::new(&bytes[..]);
        let err = reader.read_record().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    proptest! {
        #[test]
        fn prop_fields_survive_framing(fields in proptest::collection::vec(".*", 0..8)) {
            let mut buf = Vec::new();
            encode_record(&fields, &mut buf);

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt.block_on(async {
                FramedRecordReader::new(buf.as_slice()).read_record().await
            });
            prop_assert_eq!(decoded.unwrap(), Some(fields));
        }
    }
}
