use crate::scheme::DataRecord;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque per-subscription object carried next to records.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// One record: its type, symbol and field values.
///
/// Subscription batches use the same type; there the fields are empty
/// except for the time words of timed records.
#[derive(Clone)]
pub struct RecordCursor {
    record: Arc<DataRecord>,
    cipher: i32,
    symbol: Option<Arc<str>>,
    ints: Vec<i32>,
    objs: Vec<Option<Arc<str>>>,
    attachment: Option<Attachment>,
    remove: bool,
}

impl RecordCursor {
    pub fn new(record: Arc<DataRecord>, cipher: i32, symbol: Option<Arc<str>>) -> Self {
        let ints = vec![0; record.int_field_count()];
        let objs = vec![None; record.obj_field_count()];
        Self {
            record,
            cipher,
            symbol,
            ints,
            objs,
            attachment: None,
            remove: false,
        }
    }

    pub fn record(&self) -> &Arc<DataRecord> {
        &self.record
    }

    pub fn cipher(&self) -> i32 {
        self.cipher
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn symbol_arc(&self) -> Option<&Arc<str>> {
        self.symbol.as_ref()
    }

    pub fn int(&self, index: usize) -> i32 {
        self.ints.get(index).copied().unwrap_or(0)
    }

    pub fn set_int(&mut self, index: usize, value: i32) {
        if let Some(slot) = self.ints.get_mut(index) {
            *slot = value;
        }
    }

    pub fn ints(&self) -> &[i32] {
        &self.ints
    }

    pub fn obj(&self, index: usize) -> Option<&Arc<str>> {
        self.objs.get(index).and_then(|o| o.as_ref())
    }

    pub fn set_obj(&mut self, index: usize, value: Option<Arc<str>>) {
        if let Some(slot) = self.objs.get_mut(index) {
            *slot = value;
        }
    }

    /// Time of a timed record, `0` for records without time.
    pub fn time(&self) -> i64 {
        if !self.record.has_time() {
            return 0;
        }
        ((self.int(0) as i64) << 32) | (self.int(1) as u32 as i64)
    }

    pub fn set_time(&mut self, time: i64) {
        if self.record.has_time() {
            self.set_int(0, (time >> 32) as i32);
            self.set_int(1, time as i32);
        }
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.set_time(time);
        self
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn set_attachment(&mut self, attachment: Option<Attachment>) {
        self.attachment = attachment;
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Marks a subscription entry as a removal.
    pub fn is_remove(&self) -> bool {
        self.remove
    }

    pub fn set_remove(&mut self, remove: bool) {
        self.remove = remove;
    }

    /// True when both cursors carry the same field values.
    pub fn same_data(&self, other: &RecordCursor) -> bool {
        self.ints == other.ints && self.objs == other.objs
    }

    /// Copies field values from `other` (same record type expected).
    pub fn copy_data_from(&mut self, other: &RecordCursor) {
        self.ints.clone_from(&other.ints);
        self.objs.clone_from(&other.objs);
    }
}

impl fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCursor")
            .field("record", &self.record.name())
            .field("cipher", &format_args!("{:#x}", self.cipher))
            .field("symbol", &self.symbol)
            .field("ints", &self.ints)
            .field("objs", &self.objs)
            .field("attachment", &self.attachment.is_some())
            .field("remove", &self.remove)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::scheme::DataScheme;

    #[test]
    fn time_is_stored_high_word_first() {
        let scheme = DataScheme::builder().timed_record("Candle", 4, 0).build();
        let candle = scheme.record(0).unwrap().clone();
        let mut c = scheme.cursor(&candle, "IBM");
        c.set_time(0x0000_0001_8000_0002);
        assert_eq!(c.int(0), 1);
        assert_eq!(c.int(1), 0x8000_0002_u32 as i32);
        assert_eq!(c.time(), 0x0000_0001_8000_0002);
        c.set_time(-5);
        assert_eq!(c.time(), -5);
    }

    #[test]
    fn untimed_record_reports_zero_time() {
        let scheme = DataScheme::builder().record("Quote", 2, 0).build();
        let quote = scheme.record(0).unwrap().clone();
        let c = scheme.cursor(&quote, "IBM").with_time(100);
        assert_eq!(c.time(), 0);
        assert_eq!(c.ints(), &[0, 0]);
    }

    #[test]
    fn out_of_range_fields_are_ignored() {
        let scheme = DataScheme::builder().record("Quote", 1, 1).build();
        let quote = scheme.record(0).unwrap().clone();
        let mut c = scheme.cursor(&quote, "IBM");
        c.set_int(5, 7);
        assert_eq!(c.int(5), 0);
        c.set_obj(0, Some("x".into()));
        assert_eq!(c.obj(0).map(|s| &**s), Some("x"));
    }
}
