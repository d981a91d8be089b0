//! Minimal DDS container reader
//!
//! Reads the top mip level of block-compressed (BC1/BC4/BC5/BC7) and 32-bit
//! RGBA surfaces. Legacy FourCC headers and the DX10 extended header are
//! supported; cube maps, arrays and volume textures are not.

use std::path::Path;

use super::TileFormat;
use crate::{RendererError, RendererResult};

const MAGIC: &[u8; 4] = b"DDS ";
const HEADER_END: usize = 128;
const DX10_HEADER_END: usize = 148;

const OFFSET_HEIGHT: usize = 12;
const OFFSET_WIDTH: usize = 16;
const OFFSET_PF_FLAGS: usize = 80;
const OFFSET_FOURCC: usize = 84;
const OFFSET_RGB_BIT_COUNT: usize = 88;
const OFFSET_R_MASK: usize = 92;
const OFFSET_A_MASK: usize = 104;
const OFFSET_DXGI_FORMAT: usize = 128;

const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;

/// Top mip level of a DDS file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdsImage {
    pub width: u32,
    pub height: u32,
    pub format: TileFormat,
    pub data: Vec<u8>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn format_from_fourcc(fourcc: &[u8]) -> Option<TileFormat> {
    match fourcc {
        b"DXT1" => Some(TileFormat::Bc1),
        b"ATI1" | b"BC4U" => Some(TileFormat::Bc4),
        b"ATI2" | b"BC5U" => Some(TileFormat::Bc5),
        _ => None,
    }
}

fn format_from_dxgi(dxgi: u32) -> Option<TileFormat> {
    match dxgi {
        71 => Some(TileFormat::Bc1),
        72 => Some(TileFormat::Bc1Srgb),
        80 => Some(TileFormat::Bc4),
        83 => Some(TileFormat::Bc5),
        98 => Some(TileFormat::Bc7),
        99 => Some(TileFormat::Bc7Srgb),
        _ => None,
    }
}

/// Parse a DDS file held in memory
pub fn parse(bytes: &[u8]) -> RendererResult<DdsImage> {
    if bytes.len() < HEADER_END || &bytes[..4] != MAGIC {
        return Err(RendererError::InvalidDds("missing DDS header".into()));
    }

    let height = read_u32(bytes, OFFSET_HEIGHT);
    let width = read_u32(bytes, OFFSET_WIDTH);
    if width == 0 || height == 0 {
        return Err(RendererError::InvalidDds(format!("invalid extent {}x{}", width, height)));
    }

    let pf_flags = read_u32(bytes, OFFSET_PF_FLAGS);
    let (format, data_start) = if pf_flags & DDPF_FOURCC != 0 {
        let fourcc = &bytes[OFFSET_FOURCC..OFFSET_FOURCC + 4];
        if fourcc == b"DX10" {
            if bytes.len() < DX10_HEADER_END {
                return Err(RendererError::InvalidDds("truncated DX10 header".into()));
            }
            let dxgi = read_u32(bytes, OFFSET_DXGI_FORMAT);
            let format = format_from_dxgi(dxgi).ok_or_else(|| {
                RendererError::InvalidDds(format!("unsupported DXGI format {}", dxgi))
            })?;
            (format, DX10_HEADER_END)
        } else {
            let format = format_from_fourcc(fourcc).ok_or_else(|| {
                RendererError::InvalidDds(format!(
                    "unsupported FourCC {:?}",
                    String::from_utf8_lossy(fourcc)
                ))
            })?;
            (format, HEADER_END)
        }
    } else if pf_flags & DDPF_RGB != 0
        && read_u32(bytes, OFFSET_RGB_BIT_COUNT) == 32
        && read_u32(bytes, OFFSET_R_MASK) == 0x0000_00FF
        && read_u32(bytes, OFFSET_A_MASK) == 0xFF00_0000
    {
        (TileFormat::Rgba8, HEADER_END)
    } else {
        return Err(RendererError::InvalidDds("unsupported pixel format".into()));
    };

    let size = format.data_size(width, height);
    let Some(data) = bytes.get(data_start..data_start + size) else {
        return Err(RendererError::InvalidDds(format!(
            "expected {} bytes of {:?} data, file has {}",
            size,
            format,
            bytes.len().saturating_sub(data_start)
        )));
    };

    Ok(DdsImage {
        width,
        height,
        format,
        data: data.to_vec(),
    })
}

/// Read and parse a DDS file
pub fn load(path: impl AsRef<Path>) -> RendererResult<DdsImage> {
    let bytes = std::fs::read(path)?;
    parse(&bytes)
}
