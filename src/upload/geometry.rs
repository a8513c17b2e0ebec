// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Geometry loads.

A mesh file stores one stream per vertex semantic.  The loader interleaves those streams into the
caller's [VertexLayout], one vertex buffer per binding, and uploads the result either into buffers
owned by the [Geometry] or into chunks of a shared [GeometryBuffer].
*/

use super::upload_bytes;
use crate::bittricks::lcm;
use crate::containers::mesh::{MeshFile, VertexSemantic};
use crate::copy_engine::CopyEngine;
use crate::device::{
    Buffer, BufferDesc, Device, MemoryUsage, NodeIndex, ResourceBarrier, ResourceState,
};
use crate::error::RequestError;
use crate::geometry_buffer::{Chunk, GeometryArena, GeometryBuffer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Where one attribute lives inside an interleaved vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub binding: u32,
    /// Byte offset within the binding's vertex.
    pub offset: u32,
    /// Bytes per element; must match the mesh stream's element size.
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub attributes: Vec<VertexAttribute>,
    /// Vertex stride of each binding.
    pub strides: Vec<u32>,
}

impl VertexLayout {
    /// Packs `attributes` back to back into binding 0.
    pub fn interleaved(attributes: &[(VertexSemantic, u32)]) -> Self {
        let mut offset = 0;
        let attributes = attributes
            .iter()
            .map(|&(semantic, size)| {
                let attribute = VertexAttribute {
                    semantic,
                    binding: 0,
                    offset,
                    size,
                };
                offset += size;
                attribute
            })
            .collect();
        VertexLayout {
            attributes,
            strides: vec![offset],
        }
    }

    pub fn binding_count(&self) -> usize {
        self.strides.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometrySource {
    File(PathBuf),
    Memory(Vec<u8>),
}

/// Exact chunks to place a mesh at, instead of letting the allocator choose.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeometryReservation {
    pub index: Option<Chunk>,
    /// One chunk per vertex binding.
    pub vertex: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub enum GeometryTarget {
    /// Create dedicated index and vertex buffers.
    OwnBuffers,
    /// Suballocate from a shared geometry buffer.
    Arena {
        buffer: Arc<GeometryBuffer>,
        reservation: Option<GeometryReservation>,
    },
}

#[derive(Debug, Clone)]
pub struct GeometryLoadDesc {
    pub source: GeometrySource,
    pub layout: VertexLayout,
    pub target: GeometryTarget,
    pub node_index: NodeIndex,
}

impl GeometryLoadDesc {
    pub fn new(source: GeometrySource, layout: VertexLayout) -> Self {
        GeometryLoadDesc {
            source,
            layout,
            target: GeometryTarget::OwnBuffers,
            node_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryIndex {
    pub buffer: Buffer,
    pub offset: u64,
    pub count: u32,
    /// 2 or 4.
    pub stride: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBinding {
    pub buffer: Buffer,
    pub offset: u64,
    pub stride: u32,
    pub size: u64,
}

#[derive(Debug)]
enum Placement {
    Own,
    Arena {
        buffer: Arc<GeometryBuffer>,
        chunks: Vec<(ArenaSlot, Chunk)>,
    },
}

#[derive(Debug, Clone, Copy)]
enum ArenaSlot {
    Index,
    Vertex(usize),
}

impl ArenaSlot {
    fn arena(self, buffer: &GeometryBuffer) -> Option<&GeometryArena> {
        match self {
            ArenaSlot::Index => buffer.index(),
            ArenaSlot::Vertex(binding) => buffer.vertex(binding),
        }
    }
}

/// A loaded mesh.
#[derive(Debug)]
pub struct Geometry {
    index: Option<GeometryIndex>,
    vertex: Vec<VertexBinding>,
    vertex_count: u32,
    node_index: NodeIndex,
    placement: Placement,
    released: AtomicBool,
}

impl Geometry {
    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn index(&self) -> Option<&GeometryIndex> {
        self.index.as_ref()
    }

    pub fn vertex_bindings(&self) -> &[VertexBinding] {
        &self.vertex
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// True when the mesh lives in a shared [GeometryBuffer].
    pub fn is_in_arena(&self) -> bool {
        matches!(self.placement, Placement::Arena { .. })
    }

    /// Frees the mesh's buffers or chunks.  Only the first call does anything.
    pub(crate) fn release(&self, device: &dyn Device) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.placement {
            Placement::Own => {
                for buffer in self
                    .index
                    .iter()
                    .map(|i| &i.buffer)
                    .chain(self.vertex.iter().map(|v| &v.buffer))
                {
                    device.remove_buffer(buffer);
                }
            }
            Placement::Arena { buffer, chunks } => release_chunks(buffer, chunks),
        }
    }
}

/// A mesh that is created when its load executes.
#[derive(Debug, Clone, Default)]
pub struct GeometrySlot(Arc<OnceLock<Geometry>>);

impl GeometrySlot {
    pub fn get(&self) -> Option<&Geometry> {
        self.0.get()
    }
}

#[derive(Debug)]
pub(crate) struct GeometryLoad {
    pub source: GeometrySource,
    pub layout: VertexLayout,
    pub target: GeometryTarget,
    pub slot: GeometrySlot,
}

/// Bytes of each binding of `layout` holding `mesh`'s vertices.
pub(crate) fn binding_sizes(mesh: &MeshFile, layout: &VertexLayout) -> Result<Vec<u64>, RequestError> {
    layout
        .strides
        .iter()
        .map(|&stride| {
            (mesh.vertex_count as u64)
                .checked_mul(stride as u64)
                .filter(|size| usize::try_from(*size).is_ok())
                .ok_or_else(|| {
                    RequestError::LayoutMismatch(format!(
                        "{count} vertices of {stride} bytes overflow a buffer",
                        count = mesh.vertex_count
                    ))
                })
        })
        .collect()
}

/// Interleaves `mesh`'s streams into one buffer per binding of `layout`.
pub(crate) fn interleave(
    mesh: &MeshFile,
    layout: &VertexLayout,
) -> Result<Vec<Vec<u8>>, RequestError> {
    let mut bindings: Vec<Vec<u8>> = binding_sizes(mesh, layout)?
        .into_iter()
        .map(|size| vec![0u8; size as usize])
        .collect();
    for attribute in &layout.attributes {
        let stride = *layout
            .strides
            .get(attribute.binding as usize)
            .ok_or_else(|| {
                RequestError::LayoutMismatch(format!(
                    "{:?} uses binding {} of {}",
                    attribute.semantic,
                    attribute.binding,
                    layout.strides.len()
                ))
            })? as usize;
        let (offset, size) = (attribute.offset as usize, attribute.size as usize);
        if offset + size > stride {
            return Err(RequestError::LayoutMismatch(format!(
                "{:?} at offset {offset} size {size} exceeds stride {stride}",
                attribute.semantic
            )));
        }
        let Some(stream) = mesh.stream(attribute.semantic) else {
            logwise::warn_sync!(
                "mesh has no {semantic} stream; filling with zeros",
                semantic = logwise::privacy::LogIt(&attribute.semantic)
            );
            continue;
        };
        if stream.element_size as usize != size {
            return Err(RequestError::LayoutMismatch(format!(
                "{:?} is {} bytes in the mesh and {size} in the layout",
                attribute.semantic, stream.element_size
            )));
        }
        if size == 0 {
            continue;
        }
        let out = &mut bindings[attribute.binding as usize];
        for (vertex, element) in stream.data.chunks_exact(size).enumerate() {
            let start = vertex * stride + offset;
            out[start..start + size].copy_from_slice(element);
        }
    }
    Ok(bindings)
}

fn release_chunks(buffer: &GeometryBuffer, chunks: &[(ArenaSlot, Chunk)]) {
    for (slot, chunk) in chunks {
        if let Some(arena) = slot.arena(buffer) {
            arena.release(*chunk);
        }
    }
}

/// Takes one chunk per slot, giving back everything on failure.
fn allocate_chunks(
    buffer: &GeometryBuffer,
    wanted: &[(ArenaSlot, u64, u64, Option<Chunk>)],
) -> Result<Vec<(ArenaSlot, Chunk)>, RequestError> {
    let mut taken = Vec::with_capacity(wanted.len());
    for &(slot, size, alignment, reserved) in wanted {
        let chunk = slot.arena(buffer).and_then(|arena| match reserved {
            Some(chunk) if chunk.size >= size => arena.allocate_at(chunk),
            Some(_) => None,
            None => arena.allocate(size, alignment),
        });
        match chunk {
            Some(chunk) => taken.push((slot, chunk)),
            None => {
                release_chunks(buffer, &taken);
                return Err(RequestError::ChunkAllocation { size });
            }
        }
    }
    Ok(taken)
}

pub(crate) fn load_geometry(engine: &mut CopyEngine, load: GeometryLoad) -> Result<(), RequestError> {
    let bytes = match load.source {
        GeometrySource::File(path) => std::fs::read(path)?,
        GeometrySource::Memory(bytes) => bytes,
    };
    let mesh = MeshFile::parse(&bytes)?;
    if mesh.vertex_count == 0 {
        return Err(RequestError::LayoutMismatch("mesh has no vertices".to_owned()));
    }
    if let GeometryTarget::Arena { buffer, .. } = &load.target {
        //a binding larger than its arena can never be placed, so don't build it
        for (binding, size) in binding_sizes(&mesh, &load.layout)?.into_iter().enumerate() {
            let capacity = buffer.vertex(binding).map_or(0, |arena| arena.buffer().size());
            if size > capacity {
                return Err(RequestError::ChunkAllocation { size });
            }
        }
    }
    let vertex_data = interleave(&mesh, &load.layout)?;
    let index_stride = mesh.index_stride;

    let (index, vertex, placement) = match load.target {
        GeometryTarget::Arena {
            buffer,
            reservation,
        } => {
            let reservation = reservation.unwrap_or_default();
            let mut wanted = Vec::with_capacity(vertex_data.len() + 1);
            if !mesh.indices.is_empty() {
                wanted.push((
                    ArenaSlot::Index,
                    mesh.indices.len() as u64,
                    lcm(index_stride as u64, 4),
                    reservation.index,
                ));
            }
            for (binding, data) in vertex_data.iter().enumerate() {
                wanted.push((
                    ArenaSlot::Vertex(binding),
                    data.len() as u64,
                    lcm(load.layout.strides[binding].max(1) as u64, 4),
                    reservation.vertex.get(binding).copied(),
                ));
            }
            let chunks = allocate_chunks(&buffer, &wanted)?;
            let mut index = None;
            let mut vertex = Vec::with_capacity(vertex_data.len());
            for (slot, chunk) in &chunks {
                //allocate_chunks only succeeds for slots that have an arena
                let Some(arena) = slot.arena(&buffer) else {
                    continue;
                };
                match slot {
                    ArenaSlot::Index => {
                        index = Some(GeometryIndex {
                            buffer: arena.buffer().clone(),
                            offset: chunk.offset,
                            count: mesh.index_count,
                            stride: index_stride,
                        })
                    }
                    ArenaSlot::Vertex(binding) => vertex.push(VertexBinding {
                        buffer: arena.buffer().clone(),
                        offset: chunk.offset,
                        stride: load.layout.strides[*binding],
                        size: vertex_data[*binding].len() as u64,
                    }),
                }
            }
            (index, vertex, Placement::Arena { buffer, chunks })
        }
        GeometryTarget::OwnBuffers => {
            let device = engine.device().clone();
            let node_index = engine.node_index();
            let create = |size: u64| {
                device.add_buffer(&BufferDesc {
                    start_state: ResourceState::CopyDest,
                    node_index,
                    ..BufferDesc::new(size, MemoryUsage::GpuOnly)
                })
            };
            let sizes = std::iter::once(mesh.indices.len() as u64)
                .filter(|size| *size > 0)
                .chain(vertex_data.iter().map(|data| data.len() as u64));
            let mut created = Vec::with_capacity(vertex_data.len() + 1);
            for size in sizes {
                match create(size) {
                    Ok(buffer) => created.push(buffer),
                    Err(e) => {
                        for buffer in &created {
                            device.remove_buffer(buffer);
                        }
                        return Err(e.into());
                    }
                }
            }
            let mut created = created.into_iter();
            let index = if mesh.indices.is_empty() {
                None
            } else {
                created.next().map(|buffer| GeometryIndex {
                    buffer,
                    offset: 0,
                    count: mesh.index_count,
                    stride: index_stride,
                })
            };
            let vertex: Vec<VertexBinding> = created
                .zip(&vertex_data)
                .zip(&load.layout.strides)
                .map(|((buffer, data), &stride)| VertexBinding {
                    buffer,
                    offset: 0,
                    stride,
                    size: data.len() as u64,
                })
                .collect();
            (index, vertex, Placement::Own)
        }
    };

    let own = matches!(placement, Placement::Own);
    let geometry = Geometry {
        index: index.clone(),
        vertex: vertex.clone(),
        vertex_count: mesh.vertex_count,
        node_index: engine.node_index(),
        placement,
        released: AtomicBool::new(false),
    };
    if let Err(geometry) = load.slot.0.set(geometry) {
        //nothing can reach a geometry that never made it into its slot
        geometry.release(&**engine.device());
        return Err(RequestError::LayoutMismatch(
            "geometry slot was already filled".to_owned(),
        ));
    }

    if let Some(index) = &index {
        upload_bytes(engine, &index.buffer, index.offset, &mesh.indices)?;
    }
    for (binding, data) in vertex.iter().zip(&vertex_data) {
        upload_bytes(engine, &binding.buffer, binding.offset, data)?;
    }
    if own {
        let barriers: Vec<ResourceBarrier> = index
            .iter()
            .map(|i| ResourceBarrier::Buffer {
                buffer: i.buffer.clone(),
                from: ResourceState::CopyDest,
                to: ResourceState::IndexBuffer,
            })
            .chain(vertex.iter().map(|v| ResourceBarrier::Buffer {
                buffer: v.buffer.clone(),
                from: ResourceState::CopyDest,
                to: ResourceState::VertexAndConstantBuffer,
            }))
            .collect();
        let cmd = engine.acquire_cmd()?;
        engine.device().cmd_resource_barrier(&cmd, &barriers)?;
    }
    Ok(())
}
