// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The `FGEO` binary mesh container.

All integers are little-endian.

```text
magic          b"FGEO"
version        u32 (1)
index_count    u32
index_stride   u32   0 (no indices), 2 or 4
vertex_count   u32
stream_count   u32
streams        stream_count x { semantic: u32, element_size: u32 }
index data     index_count * index_stride bytes
stream data    for each stream, vertex_count * element_size bytes
```

Vertex streams are deinterleaved; the loader interleaves them into the caller's layout.

```
use bytes_in_flight::containers::mesh::{MeshFile, VertexSemantic};

let positions: Vec<u8> = [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    .iter()
    .flat_map(|f| f.to_le_bytes())
    .collect();
let mesh = MeshFile::new(3)
    .with_indices_u16(&[0, 1, 2])
    .with_stream(VertexSemantic::Position, 12, positions);
let parsed = MeshFile::parse(&mesh.to_bytes()).unwrap();
assert_eq!(parsed, mesh);
```
*/

use crate::error::RequestError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const MAGIC: &[u8; 4] = b"FGEO";
pub const VERSION: u32 = 1;

/// What a vertex stream holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Tangent,
    Color,
    TexCoord0,
    TexCoord1,
    Joints,
    Weights,
}

impl VertexSemantic {
    pub const fn code(self) -> u32 {
        match self {
            VertexSemantic::Position => 0,
            VertexSemantic::Normal => 1,
            VertexSemantic::Tangent => 2,
            VertexSemantic::Color => 3,
            VertexSemantic::TexCoord0 => 4,
            VertexSemantic::TexCoord1 => 5,
            VertexSemantic::Joints => 6,
            VertexSemantic::Weights => 7,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => VertexSemantic::Position,
            1 => VertexSemantic::Normal,
            2 => VertexSemantic::Tangent,
            3 => VertexSemantic::Color,
            4 => VertexSemantic::TexCoord0,
            5 => VertexSemantic::TexCoord1,
            6 => VertexSemantic::Joints,
            7 => VertexSemantic::Weights,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshStream {
    pub semantic: VertexSemantic,
    pub element_size: u32,
    pub data: Vec<u8>,
}

/// A parsed (or to-be-written) mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshFile {
    pub vertex_count: u32,
    pub index_count: u32,
    /// 0 when the mesh is not indexed.
    pub index_stride: u32,
    pub indices: Vec<u8>,
    pub streams: Vec<MeshStream>,
}

impl MeshFile {
    pub fn new(vertex_count: u32) -> Self {
        MeshFile {
            vertex_count,
            index_count: 0,
            index_stride: 0,
            indices: Vec::new(),
            streams: Vec::new(),
        }
    }

    pub fn with_indices_u16(mut self, indices: &[u16]) -> Self {
        self.index_count = indices.len() as u32;
        self.index_stride = 2;
        self.indices = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        self
    }

    pub fn with_indices_u32(mut self, indices: &[u32]) -> Self {
        self.index_count = indices.len() as u32;
        self.index_stride = 4;
        self.indices = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        self
    }

    /// Adds a stream; `data` holds `vertex_count * element_size` bytes.
    pub fn with_stream(mut self, semantic: VertexSemantic, element_size: u32, data: Vec<u8>) -> Self {
        self.streams.push(MeshStream {
            semantic,
            element_size,
            data,
        });
        self
    }

    pub fn stream(&self, semantic: VertexSemantic) -> Option<&MeshStream> {
        self.streams.iter().find(|s| s.semantic == semantic)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        //writes into a Vec can't fail
        let mut put = |value: u32| out.write_u32::<LittleEndian>(value).unwrap_or(());
        put(VERSION);
        put(self.index_count);
        put(self.index_stride);
        put(self.vertex_count);
        put(self.streams.len() as u32);
        for stream in &self.streams {
            put(stream.semantic.code());
            put(stream.element_size);
        }
        out.extend_from_slice(&self.indices);
        for stream in &self.streams {
            out.extend_from_slice(&stream.data);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RequestError> {
        if !bytes.starts_with(MAGIC) {
            return Err(RequestError::BadMagic { container: "mesh" });
        }
        let mut reader = Cursor::new(&bytes[MAGIC.len()..]);
        let read = |reader: &mut Cursor<&[u8]>| -> Result<u32, RequestError> {
            reader.read_u32::<LittleEndian>().map_err(|_| RequestError::Truncated {
                container: "mesh",
                needed: 4,
                available: (reader.get_ref().len() as u64).saturating_sub(reader.position()),
            })
        };
        let version = read(&mut reader)?;
        if version != VERSION {
            return Err(RequestError::UnsupportedFormat(format!(
                "mesh version {version}"
            )));
        }
        let index_count = read(&mut reader)?;
        let index_stride = read(&mut reader)?;
        let vertex_count = read(&mut reader)?;
        let stream_count = read(&mut reader)?;
        if !matches!(index_stride, 0 | 2 | 4) {
            return Err(RequestError::UnsupportedFormat(format!(
                "mesh index stride {index_stride}"
            )));
        }
        let mut descs = Vec::with_capacity(stream_count.min(64) as usize);
        for _ in 0..stream_count {
            let code = read(&mut reader)?;
            let semantic = VertexSemantic::from_code(code).ok_or_else(|| {
                RequestError::UnsupportedFormat(format!("mesh vertex semantic {code}"))
            })?;
            let element_size = read(&mut reader)?;
            descs.push((semantic, element_size));
        }
        //vertex data is the only thing that bounds vertex_count by the file's size
        if vertex_count > 0 && !descs.iter().any(|&(_, element_size)| element_size > 0) {
            return Err(RequestError::UnsupportedFormat(format!(
                "mesh declares {vertex_count} vertices but has no vertex data"
            )));
        }
        let index_count = if index_stride == 0 { 0 } else { index_count };
        let indices = read_exact(&mut reader, index_count as u64 * index_stride as u64)?;
        let mut streams = Vec::with_capacity(descs.len());
        for (semantic, element_size) in descs {
            let data = read_exact(&mut reader, vertex_count as u64 * element_size as u64)?;
            streams.push(MeshStream {
                semantic,
                element_size,
                data,
            });
        }
        Ok(MeshFile {
            vertex_count,
            index_count,
            index_stride,
            indices,
            streams,
        })
    }
}

fn read_exact(reader: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<u8>, RequestError> {
    let available = (reader.get_ref().len() as u64).saturating_sub(reader.position());
    if len > available {
        return Err(RequestError::Truncated {
            container: "mesh",
            needed: len,
            available,
        });
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}
