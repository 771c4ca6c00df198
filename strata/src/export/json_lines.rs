//! JSON Lines export
//!
//! One JSON object per record, one record per line. Inherited branches are
//! flattened root to leaf; when an attribute occurs several times along a
//! branch (nested regions), its values are joined with `/`:
//!
//! ```text
//! {"gpu.activity":"KernelExecution","gpu.activity.duration":500,"region":"main/solve","gpu.api":"LaunchKernel"}
//! ```

use log::warn;
use serde_json::{Map, Value as JsonValue};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attribute::Value;
use crate::channel::Channel;
use crate::domain::ExportError;
use crate::snapshot::{Entry, SnapshotView};

/// Flatten `record` into a JSON object
pub fn record_to_json(record: SnapshotView<'_>) -> Result<Map<String, JsonValue>, ExportError> {
    let mut object = Map::new();

    for entry in record.iter() {
        match entry {
            Entry::Immediate(attr, value) => {
                object.insert(attr.name().to_string(), serde_json::to_value(value)?);
            }
            Entry::Reference(node) => {
                let mut grouped: Vec<(&str, Vec<&Value>)> = Vec::new();
                let path = node.path();
                for n in &path {
                    let name = n.attribute().name();
                    match grouped.iter_mut().find(|(g, _)| *g == name) {
                        Some((_, values)) => values.push(n.value()),
                        None => grouped.push((name, vec![n.value()])),
                    }
                }
                for (name, values) in grouped {
                    let json = match values.as_slice() {
                        [single] => serde_json::to_value(single)?,
                        many => JsonValue::String(many.iter().map(ToString::to_string).collect::<Vec<_>>().join("/")),
                    };
                    object.insert(name.to_string(), json);
                }
            }
        }
    }

    Ok(object)
}

struct WriterShared<W> {
    out: Mutex<W>,
    written: AtomicU64,
    errors: AtomicU64,
}

impl<W> WriterShared<W> {
    fn out(&self) -> MutexGuard<'_, W> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writes every processed record of a channel as a JSON line
pub struct JsonLinesWriter<W> {
    shared: Arc<WriterShared<W>>,
}

impl<W> Clone for JsonLinesWriter<W> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<W: Write + Send + 'static> JsonLinesWriter<W> {
    #[must_use]
    pub fn new(out: W) -> Self {
        Self { shared: Arc::new(WriterShared { out: Mutex::new(out), written: AtomicU64::new(0), errors: AtomicU64::new(0) }) }
    }

    /// Create a writer and attach it to `channel`; output is flushed on `finish`
    pub fn register(channel: &Channel, out: W) -> Self {
        let writer = Self::new(out);
        {
            let writer = writer.clone();
            channel.events().on_process_snapshot(move |ch, record| {
                if let Err(e) = writer.write_record(record) {
                    writer.note_error(ch, &e);
                }
            });
        }
        {
            let writer = writer.clone();
            channel.events().on_finish(move |ch| {
                if let Err(e) = writer.flush() {
                    writer.note_error(ch, &e);
                }
            });
        }
        writer
    }

    fn note_error(&self, channel: &Channel, e: &ExportError) {
        if self.shared.errors.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("{}: json export: {e}", channel.name());
        }
    }

    /// Serialize one record
    pub fn write_record(&self, record: SnapshotView<'_>) -> Result<(), ExportError> {
        let object = record_to_json(record)?;
        let mut out = self.shared.out();
        serde_json::to_writer(&mut *out, &object)?;
        out.write_all(b"\n")?;
        self.shared.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ExportError> {
        self.shared.out().flush()?;
        Ok(())
    }

    /// Records written
    #[must_use]
    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    /// Failed writes and flushes
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    /// Run `f` on the underlying output
    pub fn with_output<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.shared.out())
    }
}
