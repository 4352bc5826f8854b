//! Size-bounded telemetry envelopes.
//!
//! An envelope is `{"timestamp": .., "payload": [record, ..]}` serialized
//! compactly. Records are appended one at a time while keeping track of
//! the serialized size, so the full document is only rendered once per
//! envelope.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

use beacon_queue::QueuedRecord;

#[derive(Serialize)]
struct Entry<'a> {
    timestamp: String,
    ip: &'a str,
    response: &'a str,
    method: &'a str,
}

/// A serialized envelope ready to send
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    body: String,
    records: Vec<i64>,
}

impl Envelope {
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Ids of the queued records carried by this envelope
    pub fn records(&self) -> &[i64] {
        &self.records
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Outcome of splitting records into envelopes
#[derive(Debug, Default)]
pub struct Batch {
    pub envelopes: Vec<Envelope>,

    /// Records that do not fit in an envelope on their own
    pub dropped: Vec<i64>,
}

struct Builder<'a> {
    header: &'a str,
    entries: Vec<String>,
    records: Vec<i64>,
    size: usize,
}

const FOOTER: &str = "]}";

impl<'a> Builder<'a> {
    fn new(header: &'a str) -> Self {
        Self {
            header,
            entries: Vec::new(),
            records: Vec::new(),
            size: header.len() + FOOTER.len(),
        }
    }

    /// Size after adding an entry of `len` bytes
    fn size_with(&self, len: usize) -> usize {
        let separator = usize::from(!self.entries.is_empty());
        self.size + separator + len
    }

    fn push(&mut self, id: i64, entry: String) {
        self.size = self.size_with(entry.len());
        self.entries.push(entry);
        self.records.push(id);
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn seal(self) -> Envelope {
        let mut body = String::with_capacity(self.size);
        body.push_str(self.header);
        body.push_str(&self.entries.join(","));
        body.push_str(FOOTER);
        Envelope {
            body,
            records: self.records,
        }
    }
}

/// Split records into envelopes whose serialized size does not exceed
/// `max_size` bytes
///
/// Record order is preserved. A record that exceeds the limit on its own
/// cannot be sent and is reported in [`Batch::dropped`].
pub fn batch(
    records: &[QueuedRecord],
    timestamp: DateTime<Utc>,
    max_size: usize,
) -> serde_json::Result<Batch> {
    let header = format!(
        r#"{{"timestamp":{},"payload":["#,
        serde_json::to_string(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))?
    );

    let mut sealed = Vec::new();
    let mut current = Builder::new(&header);
    for record in records {
        let entry = serde_json::to_string(&Entry {
            timestamp: record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ip: &record.address,
            response: &record.response,
            method: &record.method,
        })?;

        if !current.is_empty() && current.size_with(entry.len()) > max_size {
            sealed.push(std::mem::replace(&mut current, Builder::new(&header)).seal());
        }
        current.push(record.id, entry);
    }
    if !current.is_empty() {
        sealed.push(current.seal());
    }

    let mut batch = Batch::default();
    for envelope in sealed {
        if envelope.size() > max_size {
            warn!(
                size = envelope.size(),
                max_size, "record does not fit in a message, dropping it"
            );
            batch.dropped.extend_from_slice(&envelope.records);
        } else {
            batch.envelopes.push(envelope);
        }
    }
    Ok(batch)
}
