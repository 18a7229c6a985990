//! Resource payload container
//!
//! Every blob stored in a packed file (or loose on disk) starts with a small
//! header: a 4-byte magic identifying the resource kind, a flags word, and
//! four kind-specific shape words. The body follows, optionally LZ4
//! compressed with its size prepended.
//!
//! ```text
//! [u8;4] magic | u32 flags | u32 p0 | u32 p1 | u32 p2 | u32 p3 | body...
//! ```

use crate::core::{Error, Result};
use crate::device::{IndexFormat, TextureDesc, TextureFormat};

pub const TEXTURE_MAGIC: [u8; 4] = *b"TEX1";
pub const VERTEX_MAGIC: [u8; 4] = *b"VBF1";
pub const INDEX_MAGIC: [u8; 4] = *b"IBF1";
pub const MESH_MAGIC: [u8; 4] = *b"MSH1";

/// Body is LZ4 compressed with a prepended size
pub const FLAG_LZ4: u32 = 1;

pub const HEADER_SIZE: usize = 24;

/// Shape described by a payload header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadShape {
    Texture(TextureDesc),
    Vertex { stride: u32, count: u32 },
    Index { format: IndexFormat, count: u32 },
    Mesh {
        vertex_stride: u32,
        vertex_count: u32,
        index_format: IndexFormat,
        index_count: u32,
    },
}

impl PayloadShape {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            PayloadShape::Texture(_) => TEXTURE_MAGIC,
            PayloadShape::Vertex { .. } => VERTEX_MAGIC,
            PayloadShape::Index { .. } => INDEX_MAGIC,
            PayloadShape::Mesh { .. } => MESH_MAGIC,
        }
    }

    /// Exact body length this shape requires once decompressed
    pub fn body_len(&self) -> u64 {
        match *self {
            PayloadShape::Texture(desc) => desc.footprint(),
            PayloadShape::Vertex { stride, count } => stride as u64 * count as u64,
            PayloadShape::Index { format, count } => format.size() * count as u64,
            PayloadShape::Mesh { vertex_stride, vertex_count, index_format, index_count } => {
                vertex_stride as u64 * vertex_count as u64 + index_format.size() * index_count as u64
            }
        }
    }

    fn params(&self) -> [u32; 4] {
        match *self {
            PayloadShape::Texture(desc) => [desc.width, desc.height, desc.mip_levels, desc.format.to_id()],
            PayloadShape::Vertex { stride, count } => [stride, count, 0, 0],
            PayloadShape::Index { format, count } => [format.to_id(), count, 0, 0],
            PayloadShape::Mesh { vertex_stride, vertex_count, index_format, index_count } => {
                [vertex_stride, vertex_count, index_format.to_id(), index_count]
            }
        }
    }

    fn from_parts(magic: [u8; 4], p: [u32; 4]) -> Result<Self> {
        match magic {
            TEXTURE_MAGIC => {
                if p[2] == 0 || p[2] > TextureDesc::full_mip_count(p[0], p[1]) {
                    return Err(Error::InvalidData(format!(
                        "{} mip levels for a {}x{} texture",
                        p[2], p[0], p[1]
                    )));
                }
                Ok(PayloadShape::Texture(TextureDesc::new(
                    p[0],
                    p[1],
                    p[2],
                    TextureFormat::from_id(p[3])?,
                )))
            }
            VERTEX_MAGIC => Ok(PayloadShape::Vertex { stride: p[0], count: p[1] }),
            INDEX_MAGIC => Ok(PayloadShape::Index {
                format: IndexFormat::from_id(p[0])?,
                count: p[1],
            }),
            MESH_MAGIC => Ok(PayloadShape::Mesh {
                vertex_stride: p[0],
                vertex_count: p[1],
                index_format: IndexFormat::from_id(p[2])?,
                index_count: p[3],
            }),
            found => Err(Error::BadMagic { expected: TEXTURE_MAGIC, found }),
        }
    }
}

/// Encode a payload. `body` must already match the shape's length.
pub fn encode(shape: PayloadShape, body: &[u8], compress: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&shape.magic());
    out.extend_from_slice(&(if compress { FLAG_LZ4 } else { 0 }).to_le_bytes());
    for word in shape.params() {
        out.extend_from_slice(&word.to_le_bytes());
    }
    if compress {
        out.extend_from_slice(&lz4_flex::compress_prepend_size(body));
    } else {
        out.extend_from_slice(body);
    }
    out
}

/// Read the magic without validating anything else
pub fn peek_magic(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).map(|m| [m[0], m[1], m[2], m[3]])
}

/// Upper bound of the LZ4 block format's expansion ratio
const LZ4_MAX_RATIO: u64 = 255;

/// Inflate a payload's body if it is compressed.
///
/// Returns `None` when the payload is stored uncompressed and can be used as
/// is; otherwise an uncompressed copy with the header flag cleared. The shape
/// is parsed first and the stored size must match it before anything is
/// inflated. The magic is not checked against an expected kind; see [`decode`].
pub fn decompress(data: &[u8]) -> Result<Option<Vec<u8>>> {
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidData(format!(
            "payload of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let flags = read_u32(data, 4);
    if flags & FLAG_LZ4 == 0 {
        return Ok(None);
    }

    let shape = read_shape(data)?;
    let expected = shape.body_len();
    let compressed = &data[HEADER_SIZE..];
    if compressed.len() < 4 {
        return Err(Error::InvalidData("compressed body has no size prefix".into()));
    }
    let stored = read_u32(compressed, 0) as u64;
    if stored != expected {
        return Err(Error::InvalidData(format!(
            "compressed body declares {} bytes, shape {:?} needs {}",
            stored, shape, expected
        )));
    }
    let block = &compressed[4..];
    if expected > (block.len() as u64).saturating_mul(LZ4_MAX_RATIO).saturating_add(16) {
        return Err(Error::InvalidData(format!(
            "{} compressed bytes cannot inflate to {}",
            block.len(),
            expected
        )));
    }

    let body = lz4_flex::decompress(block, expected as usize)
        .map_err(|e| Error::InvalidData(format!("LZ4 decompression failed: {}", e)))?;
    if body.len() as u64 != expected {
        return Err(Error::InvalidData(format!(
            "compressed body inflated to {} bytes, expected {}",
            body.len(),
            expected
        )));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&data[..4]);
    out.extend_from_slice(&(flags & !FLAG_LZ4).to_le_bytes());
    out.extend_from_slice(&data[8..HEADER_SIZE]);
    out.extend_from_slice(&body);
    Ok(Some(out))
}

/// Parse an uncompressed payload and check its magic and body length.
///
/// Returns the shape and a view of the body.
pub fn decode(data: &[u8], expected_magic: [u8; 4]) -> Result<(PayloadShape, &[u8])> {
    let found = peek_magic(data)
        .ok_or_else(|| Error::InvalidData("empty payload".into()))?;
    if found != expected_magic {
        return Err(Error::BadMagic { expected: expected_magic, found });
    }
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidData("truncated payload header".into()));
    }
    if read_u32(data, 4) & FLAG_LZ4 != 0 {
        return Err(Error::InvalidData("payload body is still compressed".into()));
    }

    let shape = read_shape(data)?;
    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != shape.body_len() {
        return Err(Error::InvalidData(format!(
            "payload body is {} bytes, shape {:?} needs {}",
            body.len(),
            shape,
            shape.body_len()
        )));
    }
    Ok((shape, body))
}

// Caller checks the header is present
fn read_shape(data: &[u8]) -> Result<PayloadShape> {
    let magic = [data[0], data[1], data[2], data[3]];
    let params = [read_u32(data, 8), read_u32(data, 12), read_u32(data, 16), read_u32(data, 20)];
    PayloadShape::from_parts(magic, params)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
