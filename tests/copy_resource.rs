// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
#![cfg(feature = "backend_software")]

use bytes_in_flight::device::{
    Buffer, BufferDesc, Device, MemoryUsage, QueueType, ResourceBarrier, ResourceState,
    Subresource, Texture, TextureDesc,
};
use bytes_in_flight::imp::software::{CompletionMode, ExecutedCommand, SoftwareDevice};
use bytes_in_flight::pixel_formats::ImageFormat;
use bytes_in_flight::upload::texture::SubresourceLayout;
use bytes_in_flight::{
    ResourceLoader, ResourceLoaderDesc, TextureCopyDesc, TextureLoadDesc, TextureSource,
};
use std::sync::Arc;

const MIP0: Subresource = Subresource { mip: 0, layer: 0 };

fn loader() -> (Arc<SoftwareDevice>, ResourceLoader) {
    let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
    let loader = ResourceLoader::new(
        vec![device.clone() as Arc<dyn Device>],
        ResourceLoaderDesc::default(),
    )
    .unwrap();
    (device, loader)
}

/// A 3x2 RGBA8 texture in `ShaderResource`, with texel bytes 0..24.
fn rendered_texture(device: &SoftwareDevice, loader: &ResourceLoader) -> Texture {
    let loaded = loader
        .add_texture(TextureLoadDesc::new(TextureSource::Empty(TextureDesc::new_2d(
            3,
            2,
            ImageFormat::Rgba8Unorm,
        ))))
        .unwrap();
    loader.wait_for_token(loaded.token);
    let texture = loaded.resource.get().unwrap().clone();
    device.write_texture(&texture, MIP0, &(0..24).collect::<Vec<u8>>());
    texture
}

fn readback(device: &SoftwareDevice, size: u64) -> Buffer {
    device
        .add_buffer(&BufferDesc::new(size, MemoryUsage::GpuToCpu))
        .unwrap()
}

#[test]
fn rows_land_at_the_aligned_pitch() {
    let (device, loader) = loader();
    let texture = rendered_texture(&device, &loader);
    let layout = SubresourceLayout::for_subresource(&device.caps(), texture.desc(), MIP0).unwrap();
    assert_eq!(layout.row_pitch, 256);
    let buffer = readback(&device, layout.total_bytes());

    let rendered = device.add_semaphore().unwrap();
    let token = loader
        .copy_resource(TextureCopyDesc {
            wait_semaphore: Some(rendered.clone()),
            ..TextureCopyDesc::new(texture.clone(), MIP0, buffer.clone())
        })
        .unwrap();
    loader.wait_for_token(token);

    let contents = device.read_buffer(&buffer).unwrap();
    for row in 0..2u64 {
        let start = layout.row_offset(0, row as u32) as usize;
        let expected: Vec<u8> = (row as u8 * 12..row as u8 * 12 + 12).collect();
        assert_eq!(&contents[start..start + 12], expected.as_slice());
    }

    let submissions = device.submissions();
    let copy = submissions.last().unwrap();
    assert_eq!(copy.wait_semaphores, vec![rendered.id()]);
    assert_eq!(copy.queue_type, QueueType::Transfer);
    //the readback runs on its own queue, not the upload queue that transitioned the texture
    assert_ne!(copy.queue, submissions[0].queue);
}

#[test]
fn ownership_moves_to_the_copy_queue_and_back() {
    let (device, loader) = loader();
    let texture = rendered_texture(&device, &loader);
    let layout = SubresourceLayout::for_subresource(&device.caps(), texture.desc(), MIP0).unwrap();
    let buffer = readback(&device, layout.total_bytes() + 512);
    let token = loader
        .copy_resource(TextureCopyDesc {
            buffer_offset: 512,
            ..TextureCopyDesc::new(texture.clone(), MIP0, buffer.clone())
        })
        .unwrap();
    loader.wait_for_token(token);

    let commands = device.executed_commands();
    let copy_at = commands
        .iter()
        .position(|command| matches!(command, ExecutedCommand::CopyTextureToBuffer { .. }))
        .unwrap();
    assert_eq!(
        commands[copy_at],
        ExecutedCommand::CopyTextureToBuffer {
            dst: buffer.id(),
            offset: 512,
            src: texture.id(),
            subresource: MIP0,
        }
    );
    let ExecutedCommand::Barrier(before) = &commands[copy_at - 1] else {
        panic!("no barrier before the copy");
    };
    let ExecutedCommand::Barrier(after) = &commands[copy_at + 1] else {
        panic!("no barrier after the copy");
    };
    assert_eq!(
        before[0],
        ResourceBarrier::Texture {
            texture: texture.clone(),
            from: ResourceState::ShaderResource,
            to: ResourceState::CopySource,
            subresource: Some(MIP0),
            acquire_from: Some(QueueType::Graphics),
            release_to: None,
        }
    );
    assert_eq!(
        after[0],
        ResourceBarrier::Texture {
            texture,
            from: ResourceState::CopySource,
            to: ResourceState::ShaderResource,
            subresource: Some(MIP0),
            acquire_from: None,
            release_to: Some(QueueType::Graphics),
        }
    );
}

#[test]
fn too_small_buffer_fails_the_copy() {
    let (device, loader) = loader();
    let texture = rendered_texture(&device, &loader);
    let buffer = readback(&device, 64);
    let token = loader
        .copy_resource(TextureCopyDesc::new(texture, MIP0, buffer))
        .unwrap();
    loader.wait_for_token(token);
    assert!(loader.is_token_completed(token));
    assert!(
        !device
            .executed_commands()
            .iter()
            .any(|command| matches!(command, ExecutedCommand::CopyTextureToBuffer { .. }))
    );
}

#[test]
fn subresource_must_exist() {
    let (device, loader) = loader();
    let texture = rendered_texture(&device, &loader);
    let buffer = readback(&device, 4096);
    let result = loader.copy_resource(TextureCopyDesc::new(
        texture,
        Subresource { mip: 0, layer: 1 },
        buffer,
    ));
    assert!(result.is_err());
}
