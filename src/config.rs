// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Loader configuration.

use std::time::Duration;

/// Upper bound on resource sets per copy engine.
pub const MAX_BUFFER_COUNT: u32 = 4;
/// Lower bound on resource sets per copy engine; one set records while another is in flight.
pub const MIN_BUFFER_COUNT: u32 = 2;

/// Minimum alignment of any staging allocation.
pub const RESOURCE_BUFFER_ALIGNMENT: u64 = 4;

/**
Configures a [crate::ResourceLoader].

```
use bytes_in_flight::ResourceLoaderDesc;

let desc = ResourceLoaderDesc {
    buffer_size: 1 << 20,
    single_threaded: true,
    ..Default::default()
};
assert_eq!(desc.buffer_count, 2);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLoaderDesc {
    /// Bytes in each resource set's staging ring.
    pub buffer_size: u64,
    /// Resource sets per copy engine.  Clamped to `MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT`.
    pub buffer_count: u32,
    /// Run the streamer on the calling thread instead of a background thread.
    pub single_threaded: bool,
    /// When the staging ring can't fit an allocation, submit and rotate to a fresh set instead of
    /// failing the request.
    pub flush_on_overflow: bool,
    /// How often the streamer polls fences while submissions are in flight and no new work
    /// arrives.
    pub idle_poll_interval: Duration,
}

impl Default for ResourceLoaderDesc {
    fn default() -> Self {
        ResourceLoaderDesc {
            buffer_size: 8 * 1024 * 1024,
            buffer_count: 2,
            single_threaded: false,
            flush_on_overflow: true,
            idle_poll_interval: Duration::from_millis(1),
        }
    }
}

impl ResourceLoaderDesc {
    pub(crate) fn clamped_buffer_count(&self) -> u32 {
        self.buffer_count.clamp(MIN_BUFFER_COUNT, MAX_BUFFER_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_count_is_clamped() {
        let mut desc = ResourceLoaderDesc::default();
        desc.buffer_count = 0;
        assert_eq!(desc.clamped_buffer_count(), MIN_BUFFER_COUNT);
        desc.buffer_count = 9;
        assert_eq!(desc.clamped_buffer_count(), MAX_BUFFER_COUNT);
        desc.buffer_count = 3;
        assert_eq!(desc.clamped_buffer_count(), 3);
    }
}
