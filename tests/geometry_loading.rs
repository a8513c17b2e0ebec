// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
#![cfg(feature = "backend_software")]

use bytes_in_flight::containers::mesh::{MeshFile, VertexSemantic};
use bytes_in_flight::device::{Device, ResourceBarrier, ResourceState};
use bytes_in_flight::geometry_buffer::Chunk;
use bytes_in_flight::imp::software::{CompletionMode, ExecutedCommand, SoftwareDevice};
use bytes_in_flight::upload::geometry::GeometryReservation;
use bytes_in_flight::{
    GeometryBufferDesc, GeometryLoadDesc, GeometrySource, GeometryTarget, ResourceLoader,
    ResourceLoaderDesc, VertexLayout,
};
use std::sync::Arc;

fn loader() -> (Arc<SoftwareDevice>, ResourceLoader) {
    let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
    let loader = ResourceLoader::new(
        vec![device.clone() as Arc<dyn Device>],
        ResourceLoaderDesc {
            buffer_size: 64 * 1024,
            ..Default::default()
        },
    )
    .unwrap();
    (device, loader)
}

fn positions() -> Vec<u8> {
    (0..36).collect()
}

fn uvs() -> Vec<u8> {
    (100..124).collect()
}

/// A triangle with positions and texture coordinates.
fn triangle() -> Vec<u8> {
    MeshFile::new(3)
        .with_indices_u16(&[0, 1, 2])
        .with_stream(VertexSemantic::Position, 12, positions())
        .with_stream(VertexSemantic::TexCoord0, 8, uvs())
        .to_bytes()
}

fn layout() -> VertexLayout {
    VertexLayout::interleaved(&[(VertexSemantic::Position, 12), (VertexSemantic::TexCoord0, 8)])
}

fn interleaved() -> Vec<u8> {
    let (positions, uvs) = (positions(), uvs());
    (0..3)
        .flat_map(|v| {
            positions[v * 12..v * 12 + 12]
                .iter()
                .chain(&uvs[v * 8..v * 8 + 8])
                .copied()
                .collect::<Vec<_>>()
        })
        .collect()
}

fn index_bytes() -> Vec<u8> {
    [0u16, 1, 2].iter().flat_map(|i| i.to_le_bytes()).collect()
}

fn arena(loader: &ResourceLoader, index_size: u64, vertex_size: u64) -> Arc<bytes_in_flight::GeometryBuffer> {
    loader
        .add_geometry_buffer(GeometryBufferDesc {
            index_size,
            vertex_sizes: vec![vertex_size],
            node_index: 0,
        })
        .unwrap()
}

fn slice(device: &SoftwareDevice, buffer: &bytes_in_flight::device::Buffer, offset: u64, len: u64) -> Vec<u8> {
    device.read_buffer(buffer).unwrap()[offset as usize..(offset + len) as usize].to_vec()
}

#[test]
fn own_buffers() {
    let (device, loader) = loader();
    let loaded = loader
        .add_geometry(GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout()))
        .unwrap();
    loader.wait_for_token(loaded.token);
    let geometry = loaded.resource.get().unwrap();
    assert!(!geometry.is_in_arena());
    assert_eq!(geometry.vertex_count(), 3);

    let index = geometry.index().unwrap();
    assert_eq!((index.count, index.stride, index.offset), (3, 2, 0));
    assert_eq!(device.read_buffer(&index.buffer).unwrap(), index_bytes());
    let binding = &geometry.vertex_bindings()[0];
    assert_eq!(binding.stride, 20);
    assert_eq!(device.read_buffer(&binding.buffer).unwrap(), interleaved());

    let transitions: Vec<_> = device
        .executed_commands()
        .into_iter()
        .filter_map(|command| match command {
            ExecutedCommand::Barrier(barriers) => Some(barriers),
            _ => None,
        })
        .flatten()
        .filter_map(|barrier| match barrier {
            ResourceBarrier::Buffer { buffer, to, .. } => Some((buffer.id(), to)),
            _ => None,
        })
        .collect();
    assert!(transitions.contains(&(index.buffer.id(), ResourceState::IndexBuffer)));
    assert!(transitions.contains(&(binding.buffer.id(), ResourceState::VertexAndConstantBuffer)));

    let before = device.live_buffer_count();
    loader.remove_geometry(geometry).unwrap();
    assert_eq!(device.live_buffer_count(), before - 2);
    loader.remove_geometry(geometry).unwrap();
    assert_eq!(device.live_buffer_count(), before - 2);
}

#[test]
fn meshes_share_an_arena() {
    let (device, loader) = loader();
    let arena = arena(&loader, 1024, 4096);
    let load = |_: u32| {
        loader
            .add_geometry(GeometryLoadDesc {
                target: GeometryTarget::Arena {
                    buffer: arena.clone(),
                    reservation: None,
                },
                ..GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout())
            })
            .unwrap()
    };
    let first = load(0);
    let second = load(1);
    loader.wait_for_token(second.token);
    let (first, second) = (first.resource.get().unwrap(), second.resource.get().unwrap());
    assert!(first.is_in_arena() && second.is_in_arena());

    let (a, b) = (&first.vertex_bindings()[0], &second.vertex_bindings()[0]);
    assert_eq!(a.buffer, b.buffer);
    assert!(b.offset >= a.offset + a.size);
    assert_eq!(b.offset % 20, 0);
    assert_eq!(slice(&device, &b.buffer, b.offset, b.size), interleaved());
    let index = second.index().unwrap();
    assert_eq!(index.offset % 4, 0);
    assert_eq!(slice(&device, &index.buffer, index.offset, 6), index_bytes());

    let vertex_arena = arena.vertex(0).unwrap();
    assert_eq!(vertex_arena.allocator().used_chunk_count(), 2);
    loader.remove_geometry(first).unwrap();
    assert_eq!(vertex_arena.allocator().used_chunk_count(), 1);
    assert_eq!(arena.index().unwrap().allocator().used_chunk_count(), 1);
    //a second release must not free the chunk twice
    loader.remove_geometry(first).unwrap();
    assert_eq!(vertex_arena.allocator().used_chunk_count(), 1);

    let before = device.live_buffer_count();
    loader.remove_geometry(second).unwrap();
    loader.remove_geometry_buffer(arena);
    assert_eq!(device.live_buffer_count(), before - 2);
}

#[test]
fn reservation_places_the_mesh_exactly() {
    let (device, loader) = loader();
    let arena = arena(&loader, 1024, 4096);
    let reservation = GeometryReservation {
        index: Some(Chunk {
            offset: 512,
            size: 64,
        }),
        vertex: vec![Chunk {
            offset: 1000,
            size: 60,
        }],
    };
    let loaded = loader
        .add_geometry(GeometryLoadDesc {
            target: GeometryTarget::Arena {
                buffer: arena.clone(),
                reservation: Some(reservation),
            },
            ..GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout())
        })
        .unwrap();
    loader.wait_for_token(loaded.token);
    let geometry = loaded.resource.get().unwrap();
    assert_eq!(geometry.index().unwrap().offset, 512);
    let binding = &geometry.vertex_bindings()[0];
    assert_eq!(binding.offset, 1000);
    assert_eq!(slice(&device, &binding.buffer, 1000, 60), interleaved());
}

#[test]
fn missing_attribute_is_zero_filled() {
    let (device, loader) = loader();
    let layout = VertexLayout::interleaved(&[
        (VertexSemantic::Position, 12),
        (VertexSemantic::Normal, 12),
    ]);
    let loaded = loader
        .add_geometry(GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout))
        .unwrap();
    loader.wait_for_token(loaded.token);
    let geometry = loaded.resource.get().unwrap();
    let vertices = device
        .read_buffer(&geometry.vertex_bindings()[0].buffer)
        .unwrap();
    assert_eq!(vertices.len(), 72);
    let positions = positions();
    for (v, vertex) in vertices.chunks(24).enumerate() {
        assert_eq!(&vertex[..12], &positions[v * 12..v * 12 + 12]);
        assert!(vertex[12..].iter().all(|byte| *byte == 0));
    }
}

#[test]
fn mismatched_layout_fails_the_load() {
    let (_device, loader) = loader();
    let arena = arena(&loader, 1024, 4096);
    //the file stores 12 byte positions
    let layout = VertexLayout::interleaved(&[(VertexSemantic::Position, 16)]);
    let loaded = loader
        .add_geometry(GeometryLoadDesc {
            target: GeometryTarget::Arena {
                buffer: arena.clone(),
                reservation: None,
            },
            ..GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout)
        })
        .unwrap();
    loader.wait_for_token(loaded.token);
    assert!(loader.is_token_completed(loaded.token));
    assert!(loaded.resource.get().is_none());
    assert_eq!(arena.vertex(0).unwrap().allocator().used_chunk_count(), 0);
}

#[test]
fn exhausted_arena_releases_partial_allocations() {
    let (_device, loader) = loader();
    let arena = arena(&loader, 1024, 32);
    let loaded = loader
        .add_geometry(GeometryLoadDesc {
            target: GeometryTarget::Arena {
                buffer: arena.clone(),
                reservation: None,
            },
            ..GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout())
        })
        .unwrap();
    loader.wait_for_token(loaded.token);
    assert!(loaded.resource.get().is_none());
    assert_eq!(arena.index().unwrap().allocator().used_chunk_count(), 0);
    assert_eq!(arena.vertex(0).unwrap().allocator().used_chunk_count(), 0);
}

#[test]
fn layout_must_fit_the_arena() {
    let (_device, loader) = loader();
    let arena = arena(&loader, 1024, 4096);
    let layout = VertexLayout {
        strides: vec![12, 8],
        ..layout()
    };
    let result = loader.add_geometry(GeometryLoadDesc {
        target: GeometryTarget::Arena {
            buffer: arena,
            reservation: None,
        },
        ..GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout)
    });
    assert!(result.is_err());
}

#[test]
fn vertex_count_without_vertex_data_fails_the_load() {
    let (device, loader) = loader();
    let before = device.live_buffer_count();
    //24 bytes claiming four billion vertices
    let bogus = loader
        .add_geometry(GeometryLoadDesc::new(
            GeometrySource::Memory(MeshFile::new(u32::MAX).to_bytes()),
            VertexLayout::interleaved(&[(VertexSemantic::Position, 64)]),
        ))
        .unwrap();
    let after = loader
        .add_geometry(GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout()))
        .unwrap();
    loader.wait_for_token(after.token);

    assert!(loader.is_token_completed(bogus.token));
    assert!(bogus.resource.get().is_none());
    let geometry = after.resource.get().unwrap();
    assert_eq!(
        device.read_buffer(&geometry.vertex_bindings()[0].buffer).unwrap(),
        interleaved()
    );
    assert_eq!(device.live_buffer_count(), before + 2);
}

#[test]
fn failed_buffer_creation_removes_the_buffers_already_made() {
    let (device, loader) = loader();
    let before = device.live_buffer_count();
    //the second binding holds nothing, and a zero sized buffer can't be created
    let layout = VertexLayout {
        strides: vec![20, 0],
        ..layout()
    };
    let loaded = loader
        .add_geometry(GeometryLoadDesc::new(GeometrySource::Memory(triangle()), layout))
        .unwrap();
    loader.wait_for_token(loaded.token);
    assert!(loader.is_token_completed(loaded.token));
    assert!(loaded.resource.get().is_none());
    assert_eq!(device.live_buffer_count(), before);
}
