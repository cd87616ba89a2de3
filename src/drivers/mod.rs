//! Driver implementations for a hosted Linux gadget.

pub mod hosted;
pub mod image_file;
pub mod linux;
