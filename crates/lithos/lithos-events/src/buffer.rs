use crate::cursor::RecordCursor;

/// Destination for batched records.
pub trait RecordSink {
    fn has_capacity(&self) -> bool {
        true
    }

    fn append(&mut self, cursor: &RecordCursor);
}

/// Growable batch of records with a read position.
///
/// Records in `[0, position)` have been consumed but stay addressable by
/// position until [`RecordBuffer::clear`] or [`RecordBuffer::compact`].
#[derive(Debug, Default, Clone)]
pub struct RecordBuffer {
    cursors: Vec<RecordCursor>,
    position: usize,
    capacity_limit: Option<usize>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer whose [`RecordSink::has_capacity`] turns false after `limit` records.
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            capacity_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn from_cursors(cursors: impl IntoIterator<Item = RecordCursor>) -> Self {
        Self {
            cursors: cursors.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn set_capacity_limit(&mut self, limit: Option<usize>) {
        self.capacity_limit = limit;
    }

    pub fn add(&mut self, cursor: RecordCursor) {
        self.cursors.push(cursor);
    }

    /// Total number of records, consumed or not.
    pub fn limit(&self) -> usize {
        self.cursors.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of records not yet consumed.
    pub fn size(&self) -> usize {
        self.cursors.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn has_next(&self) -> bool {
        self.position < self.cursors.len()
    }

    pub fn next(&mut self) -> Option<&RecordCursor> {
        let cursor = self.cursors.get(self.position)?;
        self.position += 1;
        Some(cursor)
    }

    /// Advances past the next record and returns its position.
    pub fn next_position(&mut self) -> Option<usize> {
        self.has_next().then(|| {
            self.position += 1;
            self.position - 1
        })
    }

    pub fn cursor_at(&self, position: usize) -> Option<&RecordCursor> {
        self.cursors.get(position)
    }

    pub fn cursor_at_mut(&mut self, position: usize) -> Option<&mut RecordCursor> {
        self.cursors.get_mut(position)
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
        self.position = 0;
    }

    /// Drops consumed records so that the first unread one is at position 0.
    pub fn compact(&mut self) {
        self.cursors.drain(..self.position);
        self.position = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordCursor> {
        self.cursors[self.position..].iter()
    }

    pub fn into_vec(self) -> Vec<RecordCursor> {
        self.cursors
    }
}

impl RecordSink for RecordBuffer {
    fn has_capacity(&self) -> bool {
        self.capacity_limit.is_none_or(|limit| self.cursors.len() < limit)
    }

    fn append(&mut self, cursor: &RecordCursor) {
        self.cursors.push(cursor.clone());
    }
}
