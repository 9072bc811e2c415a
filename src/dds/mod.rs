//! C1 — DDS layout descriptor.

pub mod header;
pub mod layout;

pub use header::{build_header, parse_header, DDS_MAGIC};
pub use layout::{DdsFormat, DdsLayout, MipmapSlot, DDS_HEADER_SIZE};
