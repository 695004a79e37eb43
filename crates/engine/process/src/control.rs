//! Control messages interleaved with data records
//!
//! A control message is a record as wide as the upload header whose fields
//! are all empty except the trailing control field. The first character of
//! that field selects the operation.

use crate::framing::FramedRecordWriter;
use engine_types::TimeRange;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWrite;

/// Name of the trailing control field in the upload header
pub const CONTROL_FIELD_NAME: &str = ".";

const FLUSH: char = 'f';
const INTERIM: char = 'i';
const RESET_BUCKETS: char = 'r';
const ADVANCE_TIME: char = 't';
const UPDATE_CONFIG: char = 'u';

static FLUSH_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next flush id; unique for the lifetime of the process
pub fn next_flush_id() -> String {
    FLUSH_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_string()
}

/// Operation carried in the control field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Echo this id once all earlier input has been processed
    Flush(String),
    /// Compute interim results, optionally restricted to a range
    CalcInterim(Option<TimeRange>),
    /// Discard and recompute buckets in the range
    ResetBuckets(TimeRange),
    /// Treat time as having reached this epoch second
    AdvanceTime(i64),
    /// Apply a configuration change
    UpdateConfig(String),
}

impl ControlMessage {
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Flush(id) => format!("{FLUSH}{id}"),
            ControlMessage::CalcInterim(None) => INTERIM.to_string(),
            ControlMessage::CalcInterim(Some(range)) => format!("{INTERIM}{range}"),
            ControlMessage::ResetBuckets(range) => format!("{RESET_BUCKETS}{range}"),
            ControlMessage::AdvanceTime(epoch) => format!("{ADVANCE_TIME}{epoch}"),
            ControlMessage::UpdateConfig(config) => format!("{UPDATE_CONFIG}{config}"),
        }
    }

    /// Decode a control field value; `None` for data rows and header rows
    pub fn parse(value: &str) -> Option<Self> {
        let mut chars = value.chars();
        let tag = chars.next()?;
        let rest = chars.as_str();
        match tag {
            FLUSH => Some(ControlMessage::Flush(rest.to_string())),
            INTERIM if rest.trim().is_empty() => Some(ControlMessage::CalcInterim(None)),
            INTERIM => parse_range(rest).map(|r| ControlMessage::CalcInterim(Some(r))),
            RESET_BUCKETS => parse_range(rest).map(ControlMessage::ResetBuckets),
            ADVANCE_TIME => rest.trim().parse().ok().map(ControlMessage::AdvanceTime),
            UPDATE_CONFIG => Some(ControlMessage::UpdateConfig(rest.to_string())),
            _ => None,
        }
    }
}

fn parse_range(value: &str) -> Option<TimeRange> {
    let mut parts = value.split_whitespace();
    let start = parts.next()?.parse().ok()?;
    let end = parts.next()?.parse().ok()?;
    Some(TimeRange::new(start, end))
}

/// Writes control messages padded to the header width
pub struct ControlMsgWriter<'a, W> {
    writer: &'a mut FramedRecordWriter<W>,
    num_fields: usize,
}

impl<'a, W: AsyncWrite + Unpin> ControlMsgWriter<'a, W> {
    /// `num_fields` is the header width, control field included
    pub fn new(writer: &'a mut FramedRecordWriter<W>, num_fields: usize) -> Self {
        Self {
            writer,
            num_fields: num_fields.max(1),
        }
    }

    /// Write and flush a single control message
    pub async fn write(&mut self, message: &ControlMessage) -> io::Result<()> {
        let mut record = vec![String::new(); self.num_fields];
        if let Some(last) = record.last_mut() {
            *last = message.encode();
        }
        self.writer.write_record(&record).await?;
        self.writer.flush().await
    }

    /// Request a flush and return the id the process will echo
    pub async fn write_flush(&mut self) -> io::Result<String> {
        let id = next_flush_id();
        self.write(&ControlMessage::Flush(id.clone())).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FramedRecordReader;

    #[test]
    fn test_encodings() {
        assert_eq!(ControlMessage::Flush("7".into()).encode(), "f7");
        assert_eq!(ControlMessage::CalcInterim(None).encode(), "i");
        assert_eq!(
            ControlMessage::CalcInterim(Some(TimeRange::new(0, 3600))).encode(),
            "i0 3600"
        );
        assert_eq!(
            ControlMessage::ResetBuckets(TimeRange::new(3600, 7200)).encode(),
            "r3600 7200"
        );
        assert_eq!(ControlMessage::AdvanceTime(1000).encode(), "t1000");
        assert_eq!(
            ControlMessage::UpdateConfig("[modelDebugConfig]".into()).encode(),
            "u[modelDebugConfig]"
        );
    }

    #[test]
    fn test_parse_inverts_encode() {
        for message in [
            ControlMessage::Flush("12".into()),
            ControlMessage::CalcInterim(None),
            ControlMessage::CalcInterim(Some(TimeRange::new(10, 20))),
            ControlMessage::ResetBuckets(TimeRange::new(10, 20)),
            ControlMessage::AdvanceTime(99),
        ] {
            assert_eq!(ControlMessage::parse(&message.encode()), Some(message));
        }
        assert_eq!(ControlMessage::parse(""), None);
        assert_eq!(ControlMessage::parse(CONTROL_FIELD_NAME), None);
    }

    #[test]
    fn test_flush_ids_are_unique() {
        let a = next_flush_id();
        let b = next_flush_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_control_record_padded_to_header_width() {
        let (client, server) = tokio::io::duplex(1024);
        let mut framed = FramedRecordWriter::new(client);
        let id = ControlMsgWriter::new(&mut framed, 4)
            .write_flush()
            .await
            .unwrap();

        let record = FramedRecordReader::new(server)
            .read_record()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.len(), 4);
        assert!(record[..3].iter().all(String::is_empty));
        assert_eq!(record[3], format!("f{id}"));
    }
}
