// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Geometry buffer arenas.

A [GeometryBuffer] is one index buffer plus a set of vertex buffers shared by many meshes.  Each
buffer is carved up by its own [ChunkAllocator], a first-fit free list kept sorted by offset.
Allocation is rare (mesh load time), so a linear scan is fine.
*/

use crate::bittricks::checked_round_up;
use crate::device::{Buffer, Device, NodeIndex};
use std::sync::{Arc, Mutex};

/// A byte range within a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn contains(&self, other: &Chunk) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }
}

/// First-fit free-list allocator over one buffer.
#[derive(Debug, Clone)]
pub struct ChunkAllocator {
    size: u64,
    free: Vec<Chunk>,
    used_chunk_count: u32,
}

impl ChunkAllocator {
    pub fn new(size: u64) -> Self {
        let free = if size == 0 {
            Vec::new()
        } else {
            vec![Chunk { offset: 0, size }]
        };
        ChunkAllocator {
            size,
            free,
            used_chunk_count: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free_chunks(&self) -> &[Chunk] {
        &self.free
    }

    pub fn used_chunk_count(&self) -> u32 {
        self.used_chunk_count
    }

    /// The first free chunk that can hold `size` bytes at `alignment`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<Chunk> {
        if size == 0 {
            return None;
        }
        let alignment = alignment.max(1);
        let (index, offset) = self.free.iter().enumerate().find_map(|(index, chunk)| {
            let offset = checked_round_up(chunk.offset, alignment)?;
            let end = offset.checked_add(size)?;
            (end <= chunk.end()).then_some((index, offset))
        })?;
        let allocated = Chunk { offset, size };
        self.split(index, allocated);
        Some(allocated)
    }

    /// Allocates exactly `chunk`, which must lie within one free chunk.
    pub fn allocate_at(&mut self, chunk: Chunk) -> Option<Chunk> {
        if chunk.size == 0 {
            return None;
        }
        let index = self.free.iter().position(|free| free.contains(&chunk))?;
        self.split(index, chunk);
        Some(chunk)
    }

    /// Replaces free chunk `index` with whatever is left around `allocated`.
    fn split(&mut self, index: usize, allocated: Chunk) {
        let free = self.free[index];
        let leading = Chunk {
            offset: free.offset,
            size: allocated.offset - free.offset,
        };
        let trailing = Chunk {
            offset: allocated.end(),
            size: free.end() - allocated.end(),
        };
        let remainder: Vec<Chunk> = [leading, trailing]
            .into_iter()
            .filter(|c| c.size > 0)
            .collect();
        self.free.splice(index..=index, remainder);
        self.used_chunk_count += 1;
    }

    /// Returns `chunk` to the free list, merging it with adjacent free chunks.
    pub fn release(&mut self, chunk: Chunk) {
        debug_assert!(chunk.end() <= self.size, "released chunk outside the buffer");
        debug_assert!(self.used_chunk_count > 0, "release without allocation");
        let index = self.free.partition_point(|free| free.offset < chunk.offset);
        let merges_prev = index > 0 && self.free[index - 1].end() == chunk.offset;
        let merges_next = index < self.free.len() && chunk.end() == self.free[index].offset;
        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += chunk.size + next.size;
            }
            (true, false) => self.free[index - 1].size += chunk.size,
            (false, true) => {
                let next = &mut self.free[index];
                next.offset = chunk.offset;
                next.size += chunk.size;
            }
            (false, false) => self.free.insert(index, chunk),
        }
        self.used_chunk_count = self.used_chunk_count.saturating_sub(1);
    }
}

/// Sizes of a [GeometryBuffer]'s buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryBufferDesc {
    /// Bytes in the index buffer; 0 for none.
    pub index_size: u64,
    /// Bytes in each vertex buffer, one per binding.
    pub vertex_sizes: Vec<u64>,
    pub node_index: NodeIndex,
}

/// One arena buffer and its allocator.
#[derive(Debug)]
pub struct GeometryArena {
    buffer: Buffer,
    allocator: Mutex<ChunkAllocator>,
}

impl GeometryArena {
    pub(crate) fn new(buffer: Buffer) -> Self {
        let size = buffer.size();
        GeometryArena {
            buffer,
            allocator: Mutex::new(ChunkAllocator::new(size)),
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn allocate(&self, size: u64, alignment: u64) -> Option<Chunk> {
        self.allocator.lock().unwrap().allocate(size, alignment)
    }

    pub fn allocate_at(&self, chunk: Chunk) -> Option<Chunk> {
        self.allocator.lock().unwrap().allocate_at(chunk)
    }

    pub fn release(&self, chunk: Chunk) {
        self.allocator.lock().unwrap().release(chunk)
    }

    /// A snapshot of the allocator, for inspection.
    pub fn allocator(&self) -> ChunkAllocator {
        self.allocator.lock().unwrap().clone()
    }
}

/// Index and vertex buffers shared by many meshes.
#[derive(Debug)]
pub struct GeometryBuffer {
    device: Arc<dyn Device>,
    node_index: NodeIndex,
    index: Option<GeometryArena>,
    vertex: Vec<GeometryArena>,
}

impl GeometryBuffer {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        node_index: NodeIndex,
        index: Option<Buffer>,
        vertex: Vec<Buffer>,
    ) -> Self {
        GeometryBuffer {
            device,
            node_index,
            index: index.map(GeometryArena::new),
            vertex: vertex.into_iter().map(GeometryArena::new).collect(),
        }
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn index(&self) -> Option<&GeometryArena> {
        self.index.as_ref()
    }

    pub fn vertex(&self, binding: usize) -> Option<&GeometryArena> {
        self.vertex.get(binding)
    }

    pub fn vertex_bindings(&self) -> usize {
        self.vertex.len()
    }

    pub(crate) fn destroy(&self) {
        for arena in self.index.iter().chain(&self.vertex) {
            self.device.remove_buffer(&arena.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_with_alignment_padding() {
        let mut allocator = ChunkAllocator::new(100);
        let a = allocator.allocate(10, 1).unwrap();
        assert_eq!(a, Chunk { offset: 0, size: 10 });
        let b = allocator.allocate(8, 16).unwrap();
        assert_eq!(b.offset, 16);
        //padding [10,16) stays free and is found first for a small allocation
        assert_eq!(
            allocator.free_chunks(),
            &[Chunk { offset: 10, size: 6 }, Chunk { offset: 24, size: 76 }]
        );
        let c = allocator.allocate(4, 2).unwrap();
        assert_eq!(c.offset, 10);
        assert_eq!(allocator.used_chunk_count(), 3);
    }

    #[test]
    fn exhausted_allocator_fails() {
        let mut allocator = ChunkAllocator::new(16);
        assert!(allocator.allocate(16, 4).is_some());
        assert!(allocator.allocate(1, 1).is_none());
        assert!(allocator.free_chunks().is_empty());
    }

    #[test]
    fn allocate_at_splits_around_the_range() {
        let mut allocator = ChunkAllocator::new(64);
        let chunk = Chunk { offset: 16, size: 16 };
        assert_eq!(allocator.allocate_at(chunk), Some(chunk));
        assert_eq!(
            allocator.free_chunks(),
            &[Chunk { offset: 0, size: 16 }, Chunk { offset: 32, size: 32 }]
        );
        //overlaps the used range
        assert_eq!(allocator.allocate_at(Chunk { offset: 24, size: 16 }), None);
        //spans two free chunks
        assert_eq!(allocator.allocate_at(Chunk { offset: 8, size: 32 }), None);
    }

    #[test]
    fn balanced_sequence_coalesces_fully() {
        let mut allocator = ChunkAllocator::new(1000);
        let sizes = [100u64, 7, 250, 33, 64, 1, 90];
        let mut chunks: Vec<Chunk> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| allocator.allocate(*size, 1 << (i % 4)).unwrap())
            .collect();
        //release in a scrambled order, reallocating along the way
        let second = chunks.remove(1);
        allocator.release(second);
        let fifth = chunks.remove(3);
        allocator.release(fifth);
        chunks.push(allocator.allocate(5, 8).unwrap());
        chunks.push(allocator.allocate_at(Chunk { offset: 900, size: 50 }).unwrap());
        for index in [3, 0, 5, 1, 0, 1, 0] {
            let chunk = chunks.remove(index.min(chunks.len() - 1));
            allocator.release(chunk);
        }
        assert!(chunks.is_empty());
        assert_eq!(allocator.used_chunk_count(), 0);
        assert_eq!(allocator.free_chunks(), &[Chunk { offset: 0, size: 1000 }]);
    }
}
