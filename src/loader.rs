// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The [ResourceLoader] facade.

Every `add_*`, `end_update_*` and `copy_resource` call queues a request and returns its
[SyncToken].  The resource handle is usable by the GPU once the token completes.  Calls that
finish their work synchronously return [COMPLETED_TOKEN].
*/

use crate::config::ResourceLoaderDesc;
use crate::copy_engine::SubmittedWork;
use crate::device::{
    Buffer, BufferDesc, Device, DeviceError, MemoryUsage, NodeIndex, ResourceState, Semaphore,
    Subresource, Texture, TextureDesc,
};
use crate::error::Error;
use crate::geometry_buffer::{GeometryBuffer, GeometryBufferDesc};
use crate::request::RequestKind;
use crate::staging::MappedMemoryRange;
use crate::streamer::StreamerCore;
use crate::streamer::scheduler::{InlineScheduler, Scheduler, ThreadedScheduler};
use crate::token::{COMPLETED_TOKEN, SyncToken};
use crate::upload::UploadBuffer;
use crate::upload::buffer::{
    BufferData, BufferLoad, BufferLoadDesc, BufferSource, BufferUpdate, BufferUpdateDesc,
};
use crate::upload::geometry::{Geometry, GeometryLoad, GeometryLoadDesc, GeometrySlot, GeometryTarget};
use crate::upload::texture::{
    SubresourceLayout, TextureBarrierRequest, TextureCopyDesc, TextureLoad, TextureLoadDesc,
    TextureLoadSource, TextureSlot, TextureSource, TextureUpdate, TextureUpdateDesc,
};
use std::sync::Arc;

/// A resource and the token that completes when its contents are on the device.
#[derive(Debug, Clone)]
pub struct Loading<T> {
    pub resource: T,
    pub token: SyncToken,
}

/**
Streams buffers, textures and geometry to one or more devices.

```
# #[cfg(feature = "backend_software")] {
use bytes_in_flight::device::{BufferDesc, Device, MemoryUsage};
use bytes_in_flight::imp::software::{CompletionMode, SoftwareDevice};
use bytes_in_flight::{BufferData, BufferLoadDesc, ResourceLoader, ResourceLoaderDesc};
use std::sync::Arc;

let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
let devices = vec![device.clone() as Arc<dyn Device>];
let loader = ResourceLoader::new(devices, ResourceLoaderDesc::default()).unwrap();
let loading = loader
    .add_buffer(BufferLoadDesc::new(
        BufferDesc::new(4, MemoryUsage::GpuOnly),
        BufferData::Bytes(vec![1, 2, 3, 4]),
    ))
    .unwrap();
loader.wait_for_token(loading.token);
assert_eq!(device.read_buffer(&loading.resource).unwrap(), vec![1, 2, 3, 4]);
# }
```
*/
#[derive(Debug)]
pub struct ResourceLoader {
    core: Arc<StreamerCore>,
    scheduler: Box<dyn Scheduler>,
}

impl ResourceLoader {
    /// Creates a loader with one upload engine per device.  Device `i` is node `i`.
    pub fn new(devices: Vec<Arc<dyn Device>>, desc: ResourceLoaderDesc) -> Result<Self, Error> {
        if devices.is_empty() {
            return Err(Error::InvalidDesc("no devices"));
        }
        if desc.buffer_size == 0 {
            return Err(Error::InvalidDesc("staging buffer size is zero"));
        }
        let node_count = devices.len();
        let core = Arc::new(StreamerCore::new(devices, &desc)?);
        let scheduler: Box<dyn Scheduler> = if desc.single_threaded {
            Box::new(InlineScheduler::new(core.clone()))
        } else {
            Box::new(ThreadedScheduler::new(core.clone())?)
        };
        logwise::info_sync!(
            "resource loader: {nodes} nodes, {count} sets of {size} bytes, single threaded {single}",
            nodes = node_count,
            count = desc.clamped_buffer_count(),
            size = desc.buffer_size,
            single = desc.single_threaded
        );
        Ok(ResourceLoader { core, scheduler })
    }

    fn device(&self, node: NodeIndex) -> Result<&Arc<dyn Device>, Error> {
        let devices = self.core.devices();
        devices.get(node as usize).ok_or(Error::NodeOutOfRange {
            node,
            count: devices.len(),
        })
    }

    fn enqueue(&self, node: NodeIndex, kind: RequestKind) -> SyncToken {
        let token = self.core.enqueue(node, kind);
        self.scheduler.enqueued();
        token
    }

    /**
    Creates a buffer and fills it.

    Buffers the CPU can write are filled before this returns, with [COMPLETED_TOKEN].  Otherwise
    the contents go through staging memory and the returned token completes once they land.
    */
    pub fn add_buffer(&self, load: BufferLoadDesc) -> Result<Loading<Buffer>, Error> {
        let BufferLoadDesc {
            mut desc,
            data,
            force_reset,
            final_state,
        } = load;
        let device = self.device(desc.node_index)?;
        let size = desc.size;
        let source = match data {
            BufferData::None if force_reset => Some(BufferSource::Zeroed { size }),
            BufferData::None => None,
            BufferData::Bytes(bytes) if bytes.len() as u64 > size => {
                return Err(Error::InvalidDesc("buffer data is larger than the buffer"));
            }
            BufferData::Bytes(mut bytes) => {
                if force_reset {
                    bytes.resize(size as usize, 0);
                }
                Some(BufferSource::Bytes(bytes))
            }
            BufferData::Buffer { buffer, offset } => {
                if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
                    return Err(Error::InvalidDesc("source buffer is too small"));
                }
                Some(BufferSource::UploadBuffer {
                    buffer,
                    offset,
                    size,
                    owned: false,
                })
            }
        };
        let mappable = desc.memory_usage.is_host_visible() || device.caps().unified_memory;
        let direct = mappable && !matches!(source, Some(BufferSource::UploadBuffer { .. }));
        if source.is_some() && !direct {
            desc.start_state = ResourceState::CopyDest;
        }
        let buffer = device.add_buffer(&desc)?;
        let Some(source) = source else {
            return Ok(Loading {
                resource: buffer,
                token: COMPLETED_TOKEN,
            });
        };
        if direct && let Some(memory) = device.map_buffer(&buffer) {
            match &source {
                BufferSource::Bytes(bytes) => memory.write(0, bytes)?,
                BufferSource::Zeroed { size } => memory.write(0, &vec![0; *size as usize])?,
                BufferSource::UploadBuffer { .. } => {}
            }
            return Ok(Loading {
                resource: buffer,
                token: COMPLETED_TOKEN,
            });
        }
        let token = self.enqueue(
            desc.node_index,
            RequestKind::LoadBuffer(BufferLoad {
                buffer: buffer.clone(),
                dst_offset: 0,
                source,
                final_state,
            }),
        );
        Ok(Loading {
            resource: buffer,
            token,
        })
    }

    /**
    Loads a texture.

    Except for [TextureSource::Empty], the texture is created when the request executes; the slot
    is filled by the time the token completes.  If the load fails, the failure is logged, the
    token still completes, and the slot may stay empty.
    */
    pub fn add_texture(&self, load: TextureLoadDesc) -> Result<Loading<TextureSlot>, Error> {
        let TextureLoadDesc {
            source,
            srgb,
            final_state,
            node_index,
            name,
        } = load;
        let device = self.device(node_index)?;
        let mut desc = match source {
            TextureSource::Empty(desc) => desc,
            source => {
                let slot = TextureSlot::default();
                let token = self.enqueue(
                    node_index,
                    RequestKind::LoadTexture(TextureLoad {
                        source: TextureLoadSource::Stream(source),
                        srgb,
                        final_state,
                        node_index,
                        name,
                        slot: slot.clone(),
                        update: None,
                    }),
                );
                return Ok(Loading {
                    resource: slot,
                    token,
                });
            }
        };
        if srgb {
            desc.format = desc
                .format
                .srgb_variant()
                .ok_or(Error::InvalidDesc("texture format has no sRGB variant"))?;
        }
        desc.start_state = ResourceState::Undefined;
        desc.node_index = node_index;
        if name.is_some() {
            desc.name = name;
        }
        let texture = device.add_texture(&desc)?;
        let token = if final_state == ResourceState::Undefined {
            COMPLETED_TOKEN
        } else {
            self.enqueue(
                node_index,
                RequestKind::TextureBarrier(TextureBarrierRequest {
                    texture: texture.clone(),
                    from: ResourceState::Undefined,
                    to: final_state,
                }),
            )
        };
        Ok(Loading {
            resource: TextureSlot::filled(texture),
            token,
        })
    }

    /// Loads a mesh into its own buffers or into a [GeometryBuffer].
    pub fn add_geometry(&self, load: GeometryLoadDesc) -> Result<Loading<GeometrySlot>, Error> {
        let GeometryLoadDesc {
            source,
            layout,
            target,
            node_index,
        } = load;
        self.device(node_index)?;
        if layout.strides.is_empty() {
            return Err(Error::InvalidDesc("vertex layout has no bindings"));
        }
        if let GeometryTarget::Arena { buffer, .. } = &target {
            if buffer.node_index() != node_index {
                return Err(Error::InvalidDesc("geometry buffer is on another node"));
            }
            if buffer.vertex_bindings() < layout.binding_count() {
                return Err(Error::InvalidDesc(
                    "geometry buffer has fewer vertex buffers than the layout has bindings",
                ));
            }
        }
        let slot = GeometrySlot::default();
        let token = self.enqueue(
            node_index,
            RequestKind::LoadGeometry(GeometryLoad {
                source,
                layout,
                target,
                slot: slot.clone(),
            }),
        );
        Ok(Loading {
            resource: slot,
            token,
        })
    }

    /// Creates the shared buffers meshes can be suballocated from.
    pub fn add_geometry_buffer(&self, desc: GeometryBufferDesc) -> Result<Arc<GeometryBuffer>, Error> {
        let device = self.device(desc.node_index)?;
        if desc.index_size == 0 && desc.vertex_sizes.is_empty() {
            return Err(Error::InvalidDesc("geometry buffer has no buffers"));
        }
        let mut created: Vec<Buffer> = Vec::with_capacity(desc.vertex_sizes.len() + 1);
        let mut create = |size: u64, name: String| -> Result<Buffer, DeviceError> {
            let buffer = device.add_buffer(&BufferDesc {
                node_index: desc.node_index,
                name: Some(name),
                ..BufferDesc::new(size, MemoryUsage::GpuOnly)
            })?;
            created.push(buffer.clone());
            Ok(buffer)
        };
        let result = (|| {
            let index = if desc.index_size == 0 {
                None
            } else {
                Some(create(desc.index_size, "geometry index".to_string())?)
            };
            let vertex = desc
                .vertex_sizes
                .iter()
                .enumerate()
                .map(|(binding, size)| create(*size, format!("geometry vertex {binding}")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, DeviceError>((index, vertex))
        })();
        match result {
            Ok((index, vertex)) => Ok(Arc::new(GeometryBuffer::new(
                device.clone(),
                desc.node_index,
                index,
                vertex,
            ))),
            Err(e) => {
                for buffer in &created {
                    device.remove_buffer(buffer);
                }
                Err(e.into())
            }
        }
    }

    /**
    Opens a CPU write window onto part of a buffer.

    If the buffer is host visible the window is the buffer itself.  Otherwise it is a dedicated
    upload buffer, copied into place by [Self::end_update_buffer].
    */
    pub fn begin_update_buffer(&self, desc: BufferUpdateDesc) -> Result<BufferUpdate, Error> {
        if desc.size == 0 {
            return Err(Error::InvalidDesc("update size is zero"));
        }
        if desc
            .dst_offset
            .checked_add(desc.size)
            .is_none_or(|end| end > desc.buffer.size())
        {
            return Err(Error::InvalidDesc("update range exceeds the buffer"));
        }
        let device = self.device(desc.buffer.node_index())?;
        if let Some(memory) = device.map_buffer(&desc.buffer) {
            let range = MappedMemoryRange::new(memory, desc.buffer.clone(), desc.dst_offset, desc.size);
            return Ok(BufferUpdate {
                desc,
                range,
                upload: None,
            });
        }
        let (upload, range) = self.upload_buffer(device, desc.size, desc.buffer.node_index())?;
        Ok(BufferUpdate {
            desc,
            range,
            upload: Some(upload),
        })
    }

    fn upload_buffer(
        &self,
        device: &Arc<dyn Device>,
        size: u64,
        node_index: NodeIndex,
    ) -> Result<(UploadBuffer, MappedMemoryRange), Error> {
        let upload = device.add_buffer(&BufferDesc {
            start_state: ResourceState::GenericRead,
            node_index,
            name: Some("update upload".to_string()),
            ..BufferDesc::new(size, MemoryUsage::CpuToGpu)
        })?;
        let Some(memory) = device.map_buffer(&upload) else {
            device.remove_buffer(&upload);
            return Err(DeviceError::InvalidDesc("upload buffer is not host visible").into());
        };
        let range = MappedMemoryRange::new(memory, upload.clone(), 0, size);
        Ok((UploadBuffer::new(device.clone(), upload), range))
    }

    /// Finishes an update.  Direct updates return [COMPLETED_TOKEN].
    pub fn end_update_buffer(&self, update: BufferUpdate) -> SyncToken {
        let BufferUpdate {
            desc,
            range: _,
            upload,
        } = update;
        let Some(upload) = upload.map(UploadBuffer::into_buffer) else {
            return COMPLETED_TOKEN;
        };
        let node = desc.buffer.node_index();
        self.enqueue(
            node,
            RequestKind::LoadBuffer(BufferLoad {
                buffer: desc.buffer,
                dst_offset: desc.dst_offset,
                source: BufferSource::UploadBuffer {
                    buffer: upload,
                    offset: 0,
                    size: desc.size,
                    owned: true,
                },
                final_state: desc.final_state,
            }),
        )
    }

    /// Opens a CPU write window for one subresource of a texture.
    pub fn begin_update_texture(&self, desc: TextureUpdateDesc) -> Result<TextureUpdate, Error> {
        let texture_desc = desc.texture.desc();
        check_subresource(texture_desc, desc.subresource)?;
        let device = self.device(texture_desc.node_index)?;
        let layout = SubresourceLayout::for_subresource(&device.caps(), texture_desc, desc.subresource)
            .ok_or(Error::InvalidDesc("texture subresource is too large"))?;
        let (upload, range) =
            self.upload_buffer(device, layout.total_bytes(), texture_desc.node_index)?;
        Ok(TextureUpdate {
            desc,
            layout,
            range,
            upload,
        })
    }

    /// Queues the copy from an update's upload buffer into the texture.
    pub fn end_update_texture(&self, update: TextureUpdate) -> SyncToken {
        let TextureUpdate {
            desc,
            layout,
            range: _,
            upload,
        } = update;
        let node = desc.texture.desc().node_index;
        self.enqueue(
            node,
            RequestKind::LoadTexture(TextureLoad {
                source: TextureLoadSource::Update {
                    upload: upload.into_buffer(),
                    layout,
                },
                srgb: false,
                final_state: desc.current_state,
                node_index: node,
                name: None,
                slot: TextureSlot::filled(desc.texture.clone()),
                update: Some(desc),
            }),
        )
    }

    /**
    Copies a texture subresource into a buffer on the node's copy queue.

    Rows land at the device's row pitch alignment; see
    [crate::upload::texture::SubresourceLayout].
    */
    pub fn copy_resource(&self, desc: TextureCopyDesc) -> Result<SyncToken, Error> {
        let texture_desc = desc.texture.desc();
        check_subresource(texture_desc, desc.subresource)?;
        let node = texture_desc.node_index;
        self.device(node)?;
        if desc.buffer.node_index() != node {
            return Err(Error::InvalidDesc("readback buffer is on another node"));
        }
        Ok(self.enqueue(node, RequestKind::CopyTexture(desc)))
    }

    /// Blocks until `token` completes.  Tokens never handed out are clamped to the latest one.
    pub fn wait_for_token(&self, token: SyncToken) {
        let token = token.min(self.core.tokens().counter());
        if token == COMPLETED_TOKEN {
            return;
        }
        self.scheduler.wait_for_token(token);
    }

    /// Blocks until `token` has been handed to the device.
    pub fn wait_for_token_submitted(&self, token: SyncToken) {
        let token = token.min(self.core.tokens().counter());
        if token == COMPLETED_TOKEN {
            return;
        }
        self.scheduler.wait_for_token_submitted(token);
    }

    pub fn is_token_completed(&self, token: SyncToken) -> bool {
        self.last_token_completed() >= token
    }

    pub fn is_token_submitted(&self, token: SyncToken) -> bool {
        self.last_token_submitted() >= token
    }

    pub fn last_token_completed(&self) -> SyncToken {
        self.scheduler.poll();
        self.core.tokens().completed()
    }

    pub fn last_token_submitted(&self) -> SyncToken {
        self.core.tokens().submitted()
    }

    /// Blocks until everything queued so far has completed.
    pub fn wait_for_all_resource_loads(&self) {
        self.wait_for_token(self.core.tokens().counter());
    }

    pub fn all_resource_loads_completed(&self) -> bool {
        self.is_token_completed(self.core.tokens().counter())
    }

    /**
    Resolves once `token` completes.

    With a background streamer this needs nothing else.  In single threaded mode completions are
    observed by calls into the loader, so something must keep calling it (or block in
    [Self::wait_for_token]).
    */
    pub async fn token_completed(&self, token: SyncToken) {
        let token = token.min(self.core.tokens().counter());
        self.scheduler.poll();
        self.core.tokens().completed_async(token).await;
    }

    /**
    Submits everything queued so far and returns the node's latest upload submission.

    Another queue can wait on the returned semaphore instead of blocking the CPU on a token.
    */
    pub fn flush_resource_updates(&self, node: NodeIndex) -> Result<Option<SubmittedWork>, Error> {
        self.device(node)?;
        self.scheduler.flush();
        Ok(self.core.last_submitted(node))
    }

    /// Semaphore signaled by the node's latest upload submission.
    pub fn last_submitted_semaphore(&self, node: NodeIndex) -> Option<Semaphore> {
        self.core.last_submitted(node).map(|work| work.semaphore)
    }

    /// Destroys a buffer.  Its loads must have completed.
    pub fn remove_buffer(&self, buffer: &Buffer) -> Result<(), Error> {
        self.device(buffer.node_index())?.remove_buffer(buffer);
        Ok(())
    }

    /// Destroys a texture.  Its loads must have completed.
    pub fn remove_texture(&self, texture: &Texture) -> Result<(), Error> {
        self.device(texture.desc().node_index)?.remove_texture(texture);
        Ok(())
    }

    /// Frees a mesh's buffers, or returns its chunks to the geometry buffer.
    pub fn remove_geometry(&self, geometry: &Geometry) -> Result<(), Error> {
        let device = self.device(geometry.node_index())?;
        geometry.release(device.as_ref());
        Ok(())
    }

    /// Destroys a geometry buffer.  Meshes still placed in it become invalid.
    pub fn remove_geometry_buffer(&self, buffer: Arc<GeometryBuffer>) {
        buffer.destroy();
    }
}

fn check_subresource(desc: &TextureDesc, subresource: Subresource) -> Result<(), Error> {
    if subresource.mip >= desc.mip_levels || subresource.layer >= desc.array_layers {
        return Err(Error::InvalidDesc("subresource out of range"));
    }
    Ok(())
}

impl Drop for ResourceLoader {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.core.shutdown();
    }
}

#[cfg(all(test, feature = "backend_software"))]
mod tests {
    use super::*;
    use crate::imp::software::{CompletionMode, SoftwareDevice};

    fn loader(single_threaded: bool) -> (Arc<SoftwareDevice>, ResourceLoader) {
        let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
        let loader = ResourceLoader::new(
            vec![device.clone() as Arc<dyn Device>],
            ResourceLoaderDesc {
                buffer_size: 4096,
                single_threaded,
                ..Default::default()
            },
        )
        .unwrap();
        (device, loader)
    }

    #[test]
    fn rejects_bad_descriptors() {
        assert!(matches!(
            ResourceLoader::new(Vec::new(), ResourceLoaderDesc::default()),
            Err(Error::InvalidDesc(_))
        ));
        let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
        assert!(matches!(
            ResourceLoader::new(
                vec![device as Arc<dyn Device>],
                ResourceLoaderDesc {
                    buffer_size: 0,
                    ..Default::default()
                }
            ),
            Err(Error::InvalidDesc(_))
        ));
        let (_device, loader) = loader(true);
        let mut desc = BufferDesc::new(4, MemoryUsage::GpuOnly);
        desc.node_index = 3;
        assert!(matches!(
            loader.add_buffer(BufferLoadDesc::new(desc, BufferData::None)),
            Err(Error::NodeOutOfRange { node: 3, count: 1 })
        ));
    }

    #[test]
    fn host_visible_buffers_are_written_directly() {
        let (device, loader) = loader(false);
        let loading = loader
            .add_buffer(BufferLoadDesc::new(
                BufferDesc::new(4, MemoryUsage::CpuToGpu),
                BufferData::Bytes(vec![4, 3, 2, 1]),
            ))
            .unwrap();
        assert_eq!(loading.token, COMPLETED_TOKEN);
        assert_eq!(device.read_buffer(&loading.resource).unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn force_reset_pads_with_zeros() {
        let (device, loader) = loader(true);
        let loading = loader
            .add_buffer(BufferLoadDesc {
                force_reset: true,
                ..BufferLoadDesc::new(
                    BufferDesc::new(8, MemoryUsage::GpuOnly),
                    BufferData::Bytes(vec![9, 9]),
                )
            })
            .unwrap();
        loader.wait_for_token(loading.token);
        assert_eq!(
            device.read_buffer(&loading.resource).unwrap(),
            vec![9, 9, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn oversized_data_is_rejected() {
        let (_device, loader) = loader(true);
        assert!(matches!(
            loader.add_buffer(BufferLoadDesc::new(
                BufferDesc::new(2, MemoryUsage::GpuOnly),
                BufferData::Bytes(vec![0; 3]),
            )),
            Err(Error::InvalidDesc(_))
        ));
    }

    #[test]
    fn abandoned_updates_free_their_upload_buffers() {
        let (device, loader) = loader(true);
        let buffer = device
            .add_buffer(&BufferDesc::new(16, MemoryUsage::GpuOnly))
            .unwrap();
        let texture = device
            .add_texture(&TextureDesc::new_2d(4, 4, crate::pixel_formats::ImageFormat::Rgba8Unorm))
            .unwrap();
        let before = device.live_buffer_count();

        let update = loader
            .begin_update_buffer(BufferUpdateDesc {
                buffer: buffer.clone(),
                dst_offset: 0,
                size: 16,
                final_state: None,
            })
            .unwrap();
        assert_eq!(device.live_buffer_count(), before + 1);
        drop(update);
        assert_eq!(device.live_buffer_count(), before);

        let update = loader
            .begin_update_texture(TextureUpdateDesc {
                texture,
                subresource: Subresource { mip: 0, layer: 0 },
                current_state: ResourceState::ShaderResource,
            })
            .unwrap();
        assert_eq!(device.live_buffer_count(), before + 1);
        drop(update);
        assert_eq!(device.live_buffer_count(), before);

        //an ended update hands its buffer to the copy, which removes it once done
        let update = loader
            .begin_update_buffer(BufferUpdateDesc {
                buffer: buffer.clone(),
                dst_offset: 0,
                size: 16,
                final_state: None,
            })
            .unwrap();
        update.write(&[5; 16]).unwrap();
        let token = loader.end_update_buffer(update);
        loader.wait_for_token(token);
        assert_eq!(device.read_buffer(&buffer).unwrap(), vec![5; 16]);
    }

    #[test]
    fn wait_clamps_unknown_tokens() {
        let (_device, loader) = loader(false);
        loader.wait_for_token(1_000);
        loader.wait_for_token_submitted(1_000);
        assert!(loader.all_resource_loads_completed());
    }
}
