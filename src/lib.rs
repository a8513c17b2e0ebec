// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! bytes_in_flight streams buffers, textures and geometry to the GPU without stalling the
threads that ask for them.

You hand a [ResourceLoader] a description of what to load.  It returns the resource handle right
away, along with a [SyncToken].  A streamer (a background thread, or the calling thread in
single threaded mode) copies the contents through per-queue staging rings and submits them on
copy queues.  The token completes once the device has finished.

# Moving parts

| Piece                      | Role                                                                    |
|----------------------------|-------------------------------------------------------------------------|
| [ResourceLoader]           | Facade.  Validates, queues requests, answers token queries              |
| request queue              | One FIFO per device node; tokens handed out in queue order               |
| streamer                   | Drains the queue, runs handlers, submits, publishes completed tokens    |
| copy engine                | One queue plus a ring of resource sets (cmd, fence, semaphore, staging) |
| [staging]                  | Bump allocation inside a resource set's staging buffer                   |
| [geometry_buffer]          | Shared index/vertex arenas with a first-fit chunk allocator             |
| [containers]               | KTX, DDS, PNG and `FGEO` mesh readers                                    |
| [device]                   | The backend seam.  [imp::software] runs everything on the CPU            |

# Tokens

Tokens increase in the order requests were queued.  `completed <= submitted <= counter` always
holds, and token 0 ([COMPLETED_TOKEN]) is complete from the start.  Waiting on a token also waits
on every token before it.

# Staging reuse

A resource set's staging memory is only rewritten after the fence of its previous submission has
signaled.  With [ResourceLoaderDesc::flush_on_overflow], a request larger than what is left in the
ring submits the set early and continues in the next one; a request larger than the whole ring
gets a dedicated upload buffer that lives as long as the set's submission.
*/

logwise::declare_logging_domain!();

pub mod config;
pub mod containers;
pub mod device;
pub mod error;
pub mod geometry_buffer;
pub mod imp;
pub mod pixel_formats;
pub mod staging;
pub mod token;
pub mod upload;

mod bittricks;
mod copy_engine;
mod loader;
mod request;
mod streamer;

pub use config::ResourceLoaderDesc;
pub use copy_engine::SubmittedWork;
pub use error::{Error, RequestError};
pub use geometry_buffer::{GeometryBuffer, GeometryBufferDesc};
pub use loader::{Loading, ResourceLoader};
pub use staging::MappedMemoryRange;
pub use token::{COMPLETED_TOKEN, SyncToken};
pub use upload::buffer::{BufferData, BufferLoadDesc, BufferUpdate, BufferUpdateDesc};
pub use upload::geometry::{
    Geometry, GeometryLoadDesc, GeometrySlot, GeometrySource, GeometryTarget, VertexLayout,
};
pub use upload::texture::{
    TextureCopyDesc, TextureLoadDesc, TextureSlot, TextureSource, TextureUpdate,
    TextureUpdateDesc,
};
