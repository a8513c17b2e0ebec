// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
#![cfg(feature = "backend_software")]

use bytes_in_flight::containers::TextureHeader;
use bytes_in_flight::device::{BufferDesc, Device, MemoryUsage, Subresource};
use bytes_in_flight::imp::software::{CompletionMode, ExecutedCommand, SoftwareDevice};
use bytes_in_flight::pixel_formats::ImageFormat;
use bytes_in_flight::{
    BufferData, BufferLoadDesc, ResourceLoader, ResourceLoaderDesc, TextureLoadDesc, TextureSource,
};
use std::sync::Arc;

const RING: u64 = 4096;

fn loader(flush_on_overflow: bool) -> (Arc<SoftwareDevice>, ResourceLoader) {
    let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
    let loader = ResourceLoader::new(
        vec![device.clone() as Arc<dyn Device>],
        ResourceLoaderDesc {
            buffer_size: RING,
            buffer_count: 2,
            single_threaded: true,
            flush_on_overflow,
            ..Default::default()
        },
    )
    .unwrap();
    (device, loader)
}

fn gpu_buffer(size: u64, value: u8) -> BufferLoadDesc {
    BufferLoadDesc::new(
        BufferDesc::new(size, MemoryUsage::GpuOnly),
        BufferData::Bytes(vec![value; size as usize]),
    )
}

fn copy_source(device: &SoftwareDevice, buffer_id: u64) -> (u64, u64) {
    device
        .executed_commands()
        .into_iter()
        .find_map(|command| match command {
            ExecutedCommand::CopyBuffer {
                dst,
                src,
                src_offset,
                ..
            } if dst == buffer_id => Some((src, src_offset)),
            _ => None,
        })
        .unwrap()
}

/// R8 256x8 with five mips.  Padded to the row and subresource alignment, the first four mips
/// fill a 4 KiB ring exactly.
fn five_mip_texture() -> TextureSource {
    let header = TextureHeader {
        width: 256,
        height: 8,
        depth: 1,
        mip_levels: 5,
        array_layers: 1,
        format: ImageFormat::R8Unorm,
        cubemap: false,
    };
    let mut bytes = Vec::new();
    for mip in 0..5 {
        bytes.extend(std::iter::repeat_n(mip as u8 + 1, header.subresource_bytes(mip) as usize));
    }
    TextureSource::Raw { header, bytes }
}

#[test]
fn oversized_request_gets_a_dedicated_buffer() {
    let (device, loader) = loader(true);
    let small = loader.add_buffer(gpu_buffer(1024, 1)).unwrap();
    let large = loader.add_buffer(gpu_buffer(RING + 1024, 2)).unwrap();
    let after = loader.add_buffer(gpu_buffer(1024, 3)).unwrap();
    loader.wait_for_all_resource_loads();

    assert_eq!(device.read_buffer(&small.resource).unwrap(), vec![1; 1024]);
    assert_eq!(
        device.read_buffer(&large.resource).unwrap(),
        vec![2; (RING + 1024) as usize]
    );
    assert_eq!(device.read_buffer(&after.resource).unwrap(), vec![3; 1024]);

    let (small_src, small_offset) = copy_source(&device, small.resource.id());
    let (large_src, large_offset) = copy_source(&device, large.resource.id());
    let (after_src, _) = copy_source(&device, after.resource.id());
    //the first and third loads share a ring; the second bypassed both
    assert_eq!(small_src, after_src);
    assert_eq!(small_offset, 0);
    assert_ne!(large_src, small_src);
    assert_eq!(large_offset, 0);
    assert_eq!(device.submission_count(), 3);

    //the dedicated buffer lives until its set is reused, which the next load does
    let before = device.live_buffer_count();
    let next = loader.add_buffer(gpu_buffer(16, 4)).unwrap();
    loader.wait_for_token(next.token);
    assert_eq!(device.live_buffer_count(), before);
    let (next_src, _) = copy_source(&device, next.resource.id());
    assert_ne!(next_src, small_src);
    assert_ne!(next_src, large_src);
}

#[test]
fn request_spills_into_the_next_set() {
    let (device, loader) = loader(true);
    let loaded = loader.add_texture(TextureLoadDesc::new(five_mip_texture())).unwrap();
    loader.wait_for_token(loaded.token);
    assert_eq!(device.submission_count(), 2);

    let texture = loaded.resource.get().unwrap();
    for mip in 0..5 {
        let contents = device
            .read_texture(texture, Subresource { mip, layer: 0 })
            .unwrap();
        assert!(!contents.is_empty());
        assert!(contents.iter().all(|byte| *byte == mip as u8 + 1), "mip {mip}");
    }
}

#[test]
fn overflow_without_flushing_drops_the_rest() {
    let (device, loader) = loader(false);
    let loaded = loader.add_texture(TextureLoadDesc::new(five_mip_texture())).unwrap();
    loader.wait_for_token(loaded.token);
    assert!(loader.is_token_completed(loaded.token));
    //what was recorded before the ring filled still went out, in one submission
    assert_eq!(device.submission_count(), 1);

    let texture = loaded.resource.get().unwrap();
    let first = device
        .read_texture(texture, Subresource { mip: 0, layer: 0 })
        .unwrap();
    assert!(first.iter().all(|byte| *byte == 1));
    let last = device
        .read_texture(texture, Subresource { mip: 4, layer: 0 })
        .unwrap();
    assert!(last.iter().all(|byte| *byte == 0));

    //later requests are unaffected
    let buffer = loader.add_buffer(gpu_buffer(64, 9)).unwrap();
    loader.wait_for_token(buffer.token);
    assert_eq!(device.read_buffer(&buffer.resource).unwrap(), vec![9; 64]);
}
