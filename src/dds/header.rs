//! The canonical 128-byte DDS header (C1).

use super::layout::{DdsFormat, DdsLayout};

pub const DDS_MAGIC: &[u8; 4] = b"DDS ";
const HEADER_SIZE_FIELD: u32 = 124; // size of the DDS_HEADER struct, excluding the magic
const DDPF_FOURCC: u32 = 0x4;
const DDSCAPS_TEXTURE: u32 = 0x1000;
const DDSCAPS_MIPMAP: u32 = 0x400000;
const DDSCAPS_COMPLEX: u32 = 0x8;
const DDSD_CAPS: u32 = 0x1;
const DDSD_HEIGHT: u32 = 0x2;
const DDSD_WIDTH: u32 = 0x4;
const DDSD_PIXELFORMAT: u32 = 0x1000;
const DDSD_MIPMAPCOUNT: u32 = 0x20000;
const DDSD_LINEARSIZE: u32 = 0x80000;

/// Build the 128-byte header for a block-compressed DDS with the given
/// layout. Field values follow the standard DDS_HEADER layout closely
/// enough for any conforming reader; exact byte offsets are the only
/// thing that matters here, not full parity with every optional field.
pub fn build_header(layout: &DdsLayout) -> [u8; 128] {
    let mut buf = [0u8; 128];
    buf[0..4].copy_from_slice(DDS_MAGIC);
    write_u32(&mut buf, 4, HEADER_SIZE_FIELD);
    write_u32(
        &mut buf,
        8,
        DDSD_CAPS | DDSD_HEIGHT | DDSD_WIDTH | DDSD_PIXELFORMAT | DDSD_MIPMAPCOUNT | DDSD_LINEARSIZE,
    );
    write_u32(&mut buf, 12, layout.height);
    write_u32(&mut buf, 16, layout.width);
    let mm0_len = layout.mipmaps.first().map(|m| m.length).unwrap_or(0);
    write_u32(&mut buf, 20, mm0_len as u32); // pitch or linear size
    write_u32(&mut buf, 24, 0); // depth
    write_u32(&mut buf, 28, layout.mipmap_count());

    // pixel format block at offset 76, 32 bytes
    write_u32(&mut buf, 76, 32);
    write_u32(&mut buf, 80, DDPF_FOURCC);
    buf[84..88].copy_from_slice(layout.format.fourcc());

    write_u32(
        &mut buf,
        108,
        DDSCAPS_TEXTURE | DDSCAPS_MIPMAP | DDSCAPS_COMPLEX,
    );
    buf
}

fn write_u32(buf: &mut [u8; 128], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Parse format and mipmap count back out of a header, for
/// sanity-checking an on-disk artifact against its DDM.
pub fn parse_header(buf: &[u8; 128]) -> Option<(DdsFormat, u32, u32, u32)> {
    if &buf[0..4] != DDS_MAGIC {
        return None;
    }
    let height = read_u32(buf, 12);
    let width = read_u32(buf, 16);
    let mipmap_count = read_u32(buf, 28);
    let fourcc = &buf[84..88];
    let format = if fourcc == b"DXT1" {
        DdsFormat::Bc1
    } else if fourcc == b"DXT5" {
        DdsFormat::Bc3
    } else {
        return None;
    };
    Some((format, width, height, mipmap_count))
}
