//! Mipmap pyramid layout math (C1).
//!
//! `DdsLayout` is the oracle every other component consults for where
//! a given mipmap's bytes live inside a DDS artifact. It has no I/O
//! and no mutable state.

/// Block-compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DdsFormat {
    Bc1,
    Bc3,
}

impl DdsFormat {
    pub fn block_size(self) -> u64 {
        match self {
            DdsFormat::Bc1 => 8,
            DdsFormat::Bc3 => 16,
        }
    }

    /// The four-character-code a DDS reader expects in the pixel format block.
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            DdsFormat::Bc1 => b"DXT1",
            DdsFormat::Bc3 => b"DXT5",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            DdsFormat::Bc1 => "BC1",
            DdsFormat::Bc3 => "BC3",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "BC1" => Some(DdsFormat::Bc1),
            "BC3" => Some(DdsFormat::Bc3),
            _ => None,
        }
    }
}

pub const DDS_HEADER_SIZE: u64 = 128;

/// One level of the mipmap pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipmapSlot {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub startpos: u64,
    pub length: u64,
    pub endpos: u64,
}

/// Immutable layout descriptor for a (width, height, format) DDS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdsLayout {
    pub width: u32,
    pub height: u32,
    pub format: DdsFormat,
    pub mipmaps: Vec<MipmapSlot>,
    pub total_size: u64,
}

impl DdsLayout {
    pub fn new(width: u32, height: u32, format: DdsFormat) -> Self {
        let blocksize = format.block_size();
        let mut mipmaps = Vec::new();
        let mut pos = DDS_HEADER_SIZE;
        let mut i: u32 = 0;
        loop {
            let raw_w = width >> i;
            let raw_h = height >> i;
            if raw_w == 0 && raw_h == 0 {
                break;
            }
            let w = raw_w.max(1);
            let h = raw_h.max(1);
            let blocks = ((w as u64) * (h as u64)) >> 4;
            let length = blocks.max(1) * blocksize;
            mipmaps.push(MipmapSlot {
                index: i,
                width: w,
                height: h,
                startpos: pos,
                length,
                endpos: pos + length,
            });
            pos += length;
            i += 1;
        }
        Self {
            width,
            height,
            format,
            mipmaps,
            total_size: pos,
        }
    }

    pub fn mipmap_count(&self) -> u32 {
        self.mipmaps.len() as u32
    }

    pub fn mipmap(&self, index: u32) -> Option<&MipmapSlot> {
        self.mipmaps.get(index as usize)
    }
}
