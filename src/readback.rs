//! Row-pitch compaction of mapped GPU memory into tightly packed host
//! buffers.
//!
//! Staging textures are mapped with a driver-chosen row pitch that may be
//! wider than `width * 4`. Readback strips that padding so published
//! buffers always have a stride of exactly `width * 4`. Large padded
//! frames are compacted on a small rayon pool.

use std::sync::OnceLock;

use rayon::prelude::*;

use crate::error::{BridgeError, BridgeResult};
use crate::frame::FrameDescriptor;

/// Frames with at least this many pixels are compacted in parallel.
const PARALLEL_MIN_PIXELS: usize = 1920 * 1080;
/// Minimum number of rows handed to one worker.
const PARALLEL_MIN_ROWS_PER_WORKER: usize = 64;
const MAX_READBACK_WORKERS: usize = 4;

/// A mapped staging texture: `data` starts at row 0 and spans at least
/// `row_pitch * (height - 1) + width * 4` bytes.
#[derive(Clone, Copy, Debug)]
pub struct MappedSurface<'a> {
    pub data: &'a [u8],
    pub row_pitch: usize,
}

/// Minimum number of mapped bytes needed to read `desc` with `row_pitch`.
pub fn required_mapped_len(desc: &FrameDescriptor, row_pitch: usize) -> BridgeResult<usize> {
    let row_bytes = desc.row_bytes()?;
    if desc.height == 0 {
        return Ok(0);
    }
    row_pitch
        .checked_mul(desc.height as usize - 1)
        .and_then(|base| base.checked_add(row_bytes))
        .ok_or(BridgeError::BufferOverflow)
}

/// Copies `mapped` into `dst` as a tightly packed `width * 4 * height`
/// buffer. `dst` is resized in place, so its capacity only ever grows.
pub fn compact_rows(
    mapped: MappedSurface<'_>,
    desc: &FrameDescriptor,
    dst: &mut Vec<u8>,
) -> BridgeResult<()> {
    let row_bytes = desc.row_bytes()?;
    let total = desc.byte_len()?;
    if mapped.row_pitch < row_bytes {
        return Err(BridgeError::BufferOverflow);
    }
    if mapped.data.len() < required_mapped_len(desc, mapped.row_pitch)? {
        return Err(BridgeError::BufferOverflow);
    }

    dst.resize(total, 0);
    if total == 0 {
        return Ok(());
    }

    if mapped.row_pitch == row_bytes {
        dst.copy_from_slice(&mapped.data[..total]);
        return Ok(());
    }

    let pixel_count = (desc.width as usize).saturating_mul(desc.height as usize);
    let copy_row = |(y, row): (usize, &mut [u8])| {
        let start = y * mapped.row_pitch;
        row.copy_from_slice(&mapped.data[start..start + row_bytes]);
    };

    if should_parallelize(pixel_count, desc.height as usize) {
        install_readback_pool(|| {
            dst.par_chunks_mut(row_bytes).enumerate().for_each(copy_row);
        });
    } else {
        dst.chunks_mut(row_bytes).enumerate().for_each(copy_row);
    }
    Ok(())
}

#[inline]
fn should_parallelize(pixel_count: usize, rows: usize) -> bool {
    let workers = readback_workers();
    workers > 1
        && pixel_count >= PARALLEL_MIN_PIXELS
        && rows >= PARALLEL_MIN_ROWS_PER_WORKER.saturating_mul(workers)
}

fn readback_workers() -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    *WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_READBACK_WORKERS)
    })
}

/// Runs `job` on the dedicated readback pool, or inline when a pool could
/// not be built.
fn install_readback_pool<F>(job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(readback_workers())
            .thread_name(|index| format!("snow-bridge-readback-{index}"))
            .build()
            .ok()
    });
    match pool {
        Some(pool) => pool.install(job),
        None => job(),
    }
}
