pub mod cursors;
pub mod flush;
