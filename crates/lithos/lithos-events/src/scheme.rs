use crate::codec::SymbolCodec;
use crate::cursor::RecordCursor;
use std::sync::Arc;

/// Field layout of one record type.
///
/// Records with `has_time` keep their 64-bit time in the first two int
/// fields, high word first.
#[derive(Debug, PartialEq, Eq)]
pub struct DataRecord {
    id: i32,
    name: String,
    int_fields: usize,
    obj_fields: usize,
    has_time: bool,
}

impl DataRecord {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn int_field_count(&self) -> usize {
        self.int_fields
    }

    pub fn obj_field_count(&self) -> usize {
        self.obj_fields
    }

    pub fn has_time(&self) -> bool {
        self.has_time
    }
}

/// The set of record types a collector serves, plus the symbol codec.
#[derive(Debug)]
pub struct DataScheme {
    records: Vec<Arc<DataRecord>>,
    codec: SymbolCodec,
}

#[derive(Debug, Default)]
pub struct SchemeBuilder {
    records: Vec<Arc<DataRecord>>,
}

impl SchemeBuilder {
    /// Adds a record type. Ids are assigned in declaration order.
    pub fn record(mut self, name: &str, int_fields: usize, obj_fields: usize) -> Self {
        self.push(name, int_fields, obj_fields, false);
        self
    }

    /// Adds a record type whose first two int fields hold its time.
    pub fn timed_record(mut self, name: &str, int_fields: usize, obj_fields: usize) -> Self {
        self.push(name, int_fields.max(2), obj_fields, true);
        self
    }

    fn push(&mut self, name: &str, int_fields: usize, obj_fields: usize, has_time: bool) {
        let id = self.records.len() as i32;
        self.records.push(Arc::new(DataRecord {
            id,
            name: name.to_string(),
            int_fields,
            obj_fields,
            has_time,
        }));
    }

    pub fn build(self) -> Arc<DataScheme> {
        Arc::new(DataScheme {
            records: self.records,
            codec: SymbolCodec::new(),
        })
    }
}

impl DataScheme {
    pub fn builder() -> SchemeBuilder {
        SchemeBuilder::default()
    }

    pub fn codec(&self) -> &SymbolCodec {
        &self.codec
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, rid: i32) -> Option<&Arc<DataRecord>> {
        usize::try_from(rid).ok().and_then(|i| self.records.get(i))
    }

    pub fn find_record(&self, name: &str) -> Option<&Arc<DataRecord>> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn records(&self) -> &[Arc<DataRecord>] {
        &self.records
    }

    /// True when `record` is the instance owned by this scheme.
    pub fn owns(&self, record: &Arc<DataRecord>) -> bool {
        self.record(record.id)
            .is_some_and(|r| Arc::ptr_eq(r, record))
    }

    /// Builds an empty cursor for `record`/`symbol`, packing the symbol when possible.
    pub fn cursor(&self, record: &Arc<DataRecord>, symbol: &str) -> RecordCursor {
        let cipher = self.codec.encode(symbol);
        let symbol = (cipher == 0).then(|| Arc::<str>::from(symbol));
        RecordCursor::new(record.clone(), cipher, symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_declaration_order() {
        let scheme = DataScheme::builder()
            .record("Quote", 4, 0)
            .timed_record("Trade", 3, 1)
            .build();
        assert_eq!(scheme.record_count(), 2);
        let trade = scheme.find_record("Trade").unwrap();
        assert_eq!(trade.id(), 1);
        assert!(trade.has_time());
        assert!(scheme.owns(trade));
        assert!(scheme.record(2).is_none());
        assert!(scheme.record(-1).is_none());
    }

    #[test]
    fn cursor_keeps_unencodable_symbol_as_string() {
        let scheme = DataScheme::builder().record("Quote", 2, 0).build();
        let quote = scheme.record(0).unwrap().clone();
        let packed = scheme.cursor(&quote, "IBM");
        assert_ne!(packed.cipher(), 0);
        assert!(packed.symbol().is_none());
        let long = scheme.cursor(&quote, "VERYLONGSYMBOL");
        assert_eq!(long.cipher(), 0);
        assert_eq!(long.symbol(), Some("VERYLONGSYMBOL"));
    }
}
