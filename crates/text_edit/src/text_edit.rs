mod buffer;
mod edit;
mod source;

pub use buffer::{BufferEvent, BufferSnapshot, TextBuffer};
pub use edit::{Patch, Replacement};
pub use source::EditSource;
