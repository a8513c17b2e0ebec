// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Texture loads, barriers, updates and readback copies.

Subresources are staged one at a time in the container's storage order.  Each staged subresource
starts at an offset aligned to both the device's texture placement alignment and the format's
block size, and each row starts at a multiple of the device's row pitch alignment.
*/

use super::{UploadBuffer, staging_range};
use crate::bittricks::{checked_round_up, lcm};
use crate::containers::{ContainerKind, TextureHeader, TextureStream};
use crate::copy_engine::CopyEngine;
use crate::device::{
    Buffer, BufferTextureLayout, Device, DeviceCaps, DeviceError, NodeIndex, QueueType,
    ResourceBarrier, ResourceState, Semaphore, Subresource, Texture, TextureDesc,
};
use crate::error::RequestError;
use crate::pixel_formats::{ImageFormat, mip_extent};
use crate::staging::MappedMemoryRange;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Where a texture's contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    File(PathBuf),
    Memory {
        bytes: Vec<u8>,
        container: ContainerKind,
    },
    /// Tightly packed texels, each layer holding its full mip chain.
    Raw {
        header: TextureHeader,
        bytes: Vec<u8>,
    },
    /// No contents; the texture is created and transitioned to its final state.
    Empty(TextureDesc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureLoadDesc {
    pub source: TextureSource,
    /// Sample through the format's sRGB variant.  Fails the load if there is none.
    pub srgb: bool,
    pub final_state: ResourceState,
    pub node_index: NodeIndex,
    pub name: Option<String>,
}

impl TextureLoadDesc {
    pub fn new(source: TextureSource) -> Self {
        TextureLoadDesc {
            source,
            srgb: false,
            final_state: ResourceState::ShaderResource,
            node_index: 0,
            name: None,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(TextureSource::File(path.into()))
    }

    pub fn from_memory(bytes: Vec<u8>) -> Self {
        Self::new(TextureSource::Memory {
            bytes,
            container: ContainerKind::Detect,
        })
    }
}

/**
A texture that is created when its load executes.

Clones share the same slot.  Once the load's token completes, [TextureSlot::get] returns the
texture, unless the load failed before the texture could be created.
*/
#[derive(Debug, Clone, Default)]
pub struct TextureSlot(Arc<OnceLock<Texture>>);

impl TextureSlot {
    pub(crate) fn filled(texture: Texture) -> Self {
        let slot = TextureSlot::default();
        slot.fill(texture);
        slot
    }

    fn fill(&self, texture: Texture) {
        if self.0.set(texture).is_err() {
            logwise::warn_sync!("texture slot filled twice");
        }
    }

    pub fn get(&self) -> Option<&Texture> {
        self.0.get()
    }
}

/// Describes a [crate::ResourceLoader::begin_update_texture] window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureUpdateDesc {
    pub texture: Texture,
    pub subresource: Subresource,
    /// The state the subresource is in now, and returns to after the update.
    pub current_state: ResourceState,
}

/// Padded layout of one subresource in upload memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceLayout {
    /// Tightly packed bytes per block row.
    pub row_bytes: u64,
    pub rows: u32,
    pub depth: u32,
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

impl SubresourceLayout {
    pub fn new(
        caps: &DeviceCaps,
        format: ImageFormat,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Option<Self> {
        let row_bytes = format.row_bytes(width);
        let rows = format.row_count(height);
        let row_pitch = checked_round_up(row_bytes, caps.upload_buffer_texture_row_alignment.max(1))?;
        let slice_pitch = row_pitch.checked_mul(rows as u64)?;
        slice_pitch.checked_mul(depth as u64)?;
        Some(SubresourceLayout {
            row_bytes,
            rows,
            depth,
            row_pitch,
            slice_pitch,
        })
    }

    pub fn for_subresource(
        caps: &DeviceCaps,
        desc: &TextureDesc,
        subresource: Subresource,
    ) -> Option<Self> {
        Self::new(
            caps,
            desc.format,
            mip_extent(desc.width, subresource.mip),
            mip_extent(desc.height, subresource.mip),
            mip_extent(desc.depth, subresource.mip),
        )
    }

    pub fn total_bytes(&self) -> u64 {
        self.slice_pitch * self.depth as u64
    }

    /// Byte offset of block row `row` in depth slice `slice`.
    pub fn row_offset(&self, slice: u32, row: u32) -> u64 {
        slice as u64 * self.slice_pitch + row as u64 * self.row_pitch
    }

    fn at(&self, offset: u64) -> BufferTextureLayout {
        BufferTextureLayout {
            offset,
            row_pitch: self.row_pitch,
            slice_pitch: self.slice_pitch,
        }
    }
}

/// Alignment of a staged subresource's first byte.
pub(crate) fn subresource_alignment(caps: &DeviceCaps, format: ImageFormat) -> u64 {
    lcm(
        caps.upload_buffer_texture_alignment.max(1),
        format.bytes_per_block() as u64,
    )
}

/**
An open texture update for one subresource.

Rows are written at [SubresourceLayout::row_offset]; the padding between rows is ignored.
*/
#[derive(Debug)]
#[must_use = "an update does nothing until passed to end_update_texture"]
pub struct TextureUpdate {
    pub(crate) desc: TextureUpdateDesc,
    pub(crate) layout: SubresourceLayout,
    pub(crate) range: MappedMemoryRange,
    pub(crate) upload: UploadBuffer,
}

impl TextureUpdate {
    pub fn layout(&self) -> &SubresourceLayout {
        &self.layout
    }

    pub fn range(&self) -> &MappedMemoryRange {
        &self.range
    }

    /// Writes one tightly packed block row.
    pub fn write_row(&self, slice: u32, row: u32, bytes: &[u8]) -> Result<(), DeviceError> {
        if bytes.len() as u64 > self.layout.row_bytes {
            return Err(DeviceError::OutOfRange {
                offset: 0,
                size: bytes.len() as u64,
                len: self.layout.row_bytes,
            });
        }
        self.range.write_at(self.layout.row_offset(slice, row), bytes)
    }
}

#[derive(Debug)]
pub(crate) enum TextureLoadSource {
    Stream(TextureSource),
    Update {
        upload: Buffer,
        layout: SubresourceLayout,
    },
}

#[derive(Debug)]
pub(crate) struct TextureLoad {
    pub source: TextureLoadSource,
    pub srgb: bool,
    pub final_state: ResourceState,
    pub node_index: NodeIndex,
    pub name: Option<String>,
    /// Filled when the texture is created.  Updates carry the existing texture here.
    pub slot: TextureSlot,
    pub update: Option<TextureUpdateDesc>,
}

#[derive(Debug)]
pub(crate) struct TextureBarrierRequest {
    pub texture: Texture,
    pub from: ResourceState,
    pub to: ResourceState,
}

/// Describes a [crate::ResourceLoader::copy_resource] readback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureCopyDesc {
    pub texture: Texture,
    pub subresource: Subresource,
    /// Receives rows at the device's row pitch alignment.
    pub buffer: Buffer,
    pub buffer_offset: u64,
    /// The copy waits on this semaphore, e.g. the one signaled by the pass that wrote the texture.
    pub wait_semaphore: Option<Semaphore>,
    /// Queue that owns the texture; ownership moves to the copy queue and back.
    pub owner_queue: QueueType,
    /// State of the texture on the owner queue.
    pub texture_state: ResourceState,
}

impl TextureCopyDesc {
    pub fn new(texture: Texture, subresource: Subresource, buffer: Buffer) -> Self {
        TextureCopyDesc {
            texture,
            subresource,
            buffer,
            buffer_offset: 0,
            wait_semaphore: None,
            owner_queue: QueueType::Graphics,
            texture_state: ResourceState::ShaderResource,
        }
    }
}

pub(crate) fn open_source(source: TextureSource) -> Result<TextureStream, RequestError> {
    match source {
        TextureSource::File(path) => {
            let bytes = std::fs::read(&path)?;
            crate::containers::open(bytes, ContainerKind::Detect)
        }
        TextureSource::Memory { bytes, container } => crate::containers::open(bytes, container),
        TextureSource::Raw { header, bytes } => {
            header.validate("raw", bytes.len() as u64)?;
            Ok(TextureStream::raw(header, bytes))
        }
        TextureSource::Empty(_) => Err(RequestError::UnsupportedFormat(
            "empty texture has no stream".to_owned(),
        )),
    }
}

pub(crate) fn load_texture(engine: &mut CopyEngine, load: TextureLoad) -> Result<(), RequestError> {
    match load.source {
        TextureLoadSource::Stream(source) => {
            let mut stream = open_source(source)?;
            if load.srgb {
                let format = stream.header().format;
                let srgb = format
                    .srgb_variant()
                    .ok_or(RequestError::NoSrgbVariant(format))?;
                stream.set_format(srgb);
            }
            let header = stream.header().clone();
            let texture = engine.device().add_texture(&TextureDesc {
                width: header.width,
                height: header.height,
                depth: header.depth,
                mip_levels: header.mip_levels,
                array_layers: header.array_layers,
                format: header.format,
                cubemap: header.cubemap,
                start_state: ResourceState::Undefined,
                node_index: load.node_index,
                name: load.name,
            })?;
            load.slot.fill(texture.clone());
            stream_subresources(engine, &texture, &mut stream)?;
            let cmd = engine.acquire_cmd()?;
            engine.device().cmd_resource_barrier(
                &cmd,
                &[ResourceBarrier::Texture {
                    texture,
                    from: ResourceState::CopyDest,
                    to: load.final_state,
                    subresource: None,
                    acquire_from: None,
                    release_to: None,
                }],
            )?;
            Ok(())
        }
        TextureLoadSource::Update { upload, layout } => {
            let update = load.update.ok_or(RequestError::UnsupportedFormat(
                "texture update without a target".to_owned(),
            ))?;
            let cmd = engine.acquire_cmd();
            engine.defer_destroy(upload.clone());
            let cmd = cmd?;
            let device = engine.device();
            let barrier = |from, to| ResourceBarrier::Texture {
                texture: update.texture.clone(),
                from,
                to,
                subresource: Some(update.subresource),
                acquire_from: None,
                release_to: None,
            };
            device.cmd_resource_barrier(
                &cmd,
                &[barrier(update.current_state, ResourceState::CopyDest)],
            )?;
            device.cmd_copy_buffer_to_texture(
                &cmd,
                &update.texture,
                update.subresource,
                &upload,
                layout.at(0),
            )?;
            device.cmd_resource_barrier(
                &cmd,
                &[barrier(ResourceState::CopyDest, update.current_state)],
            )?;
            Ok(())
        }
    }
}

fn stream_subresources(
    engine: &mut CopyEngine,
    texture: &Texture,
    stream: &mut TextureStream,
) -> Result<(), RequestError> {
    let caps = engine.caps();
    let desc = texture.desc().clone();
    let alignment = subresource_alignment(&caps, desc.format);
    let mut transitioned = false;
    for subresource in stream.subresources() {
        stream.begin_subresource(subresource)?;
        let layout = SubresourceLayout::for_subresource(&caps, &desc, subresource)
            .ok_or(DeviceError::OutOfMemory { requested: u64::MAX })?;
        let range = staging_range(engine, layout.total_bytes(), alignment)?;
        range.with_slice_mut(|staged| -> Result<(), RequestError> {
            for slice in 0..layout.depth {
                for row in 0..layout.rows {
                    let start = layout.row_offset(slice, row) as usize;
                    let src = stream.read_row(layout.row_bytes)?;
                    staged[start..start + src.len()].copy_from_slice(src);
                }
            }
            Ok(())
        })??;
        let cmd = engine.acquire_cmd()?;
        if !transitioned {
            engine.device().cmd_resource_barrier(
                &cmd,
                &[ResourceBarrier::Texture {
                    texture: texture.clone(),
                    from: ResourceState::Undefined,
                    to: ResourceState::CopyDest,
                    subresource: None,
                    acquire_from: None,
                    release_to: None,
                }],
            )?;
            transitioned = true;
        }
        engine.device().cmd_copy_buffer_to_texture(
            &cmd,
            texture,
            subresource,
            range.buffer(),
            layout.at(range.offset()),
        )?;
    }
    Ok(())
}

pub(crate) fn barrier_texture(
    engine: &mut CopyEngine,
    request: TextureBarrierRequest,
) -> Result<(), RequestError> {
    let cmd = engine.acquire_cmd()?;
    engine.device().cmd_resource_barrier(
        &cmd,
        &[ResourceBarrier::Texture {
            texture: request.texture,
            from: request.from,
            to: request.to,
            subresource: None,
            acquire_from: None,
            release_to: None,
        }],
    )?;
    Ok(())
}

/// Records a texture to buffer copy with queue ownership transfers around it.
pub(crate) fn copy_texture(
    engine: &mut CopyEngine,
    copy: TextureCopyDesc,
) -> Result<(), RequestError> {
    let caps = engine.caps();
    let layout = SubresourceLayout::for_subresource(&caps, copy.texture.desc(), copy.subresource)
        .ok_or(DeviceError::OutOfMemory { requested: u64::MAX })?;
    let end = copy
        .buffer_offset
        .checked_add(layout.total_bytes())
        .ok_or(DeviceError::OutOfMemory { requested: u64::MAX })?;
    if end > copy.buffer.size() {
        return Err(DeviceError::OutOfRange {
            offset: copy.buffer_offset,
            size: layout.total_bytes(),
            len: copy.buffer.size(),
        }
        .into());
    }
    if let Some(semaphore) = copy.wait_semaphore.clone() {
        engine.add_wait_semaphore(semaphore);
    }
    let copy_queue = engine.queue_type();
    let cmd = engine.acquire_cmd()?;
    let device = engine.device();
    device.cmd_resource_barrier(
        &cmd,
        &[ResourceBarrier::Texture {
            texture: copy.texture.clone(),
            from: copy.texture_state,
            to: ResourceState::CopySource,
            subresource: Some(copy.subresource),
            acquire_from: Some(copy.owner_queue),
            release_to: None,
        }],
    )?;
    device.cmd_copy_texture_to_buffer(
        &cmd,
        &copy.buffer,
        layout.at(copy.buffer_offset),
        &copy.texture,
        copy.subresource,
    )?;
    device.cmd_resource_barrier(
        &cmd,
        &[ResourceBarrier::Texture {
            texture: copy.texture.clone(),
            from: ResourceState::CopySource,
            to: copy.texture_state,
            subresource: Some(copy.subresource),
            acquire_from: None,
            release_to: Some(copy.owner_queue),
        }],
    )?;
    logwise::trace_sync!(
        "texture readback recorded on {queue}",
        queue = logwise::privacy::LogIt(&copy_queue)
    );
    Ok(())
}
