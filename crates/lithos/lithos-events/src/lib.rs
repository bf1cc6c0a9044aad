pub mod buffer;
pub mod codec;
pub mod cursor;
pub mod scheme;

pub use buffer::{RecordBuffer, RecordSink};
pub use codec::{SymbolCodec, ENCODED_CIPHER, VALID_CIPHER};
pub use cursor::{Attachment, RecordCursor};
pub use scheme::{DataRecord, DataScheme, SchemeBuilder};

// Records flow through the collector as owned cursors. A cursor names its
// record type, its symbol (either packed into a cipher or carried as a
// string) and the int/obj field values of one event.
