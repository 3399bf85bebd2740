//! Reads the primary display through zero-copy leases from several threads
//! and reports how often the producer had to drop frames.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use snow_bridge::{CaptureTarget, Session};
use tracing::info;
use tracing_subscriber::EnvFilter;

const READERS: usize = 3;
const RUN_FOR: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let session = Arc::new(
        Session::builder(CaptureTarget::PrimaryMonitor)
            .max_resolution(1280, 720)
            .build()
            .context("failed to start primary display capture")?,
    );

    let begin = Instant::now();
    let handles: Vec<_> = (0..READERS)
        .map(|reader| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let mut leases = 0u64;
                let mut checksum = 0u64;
                while begin.elapsed() < RUN_FOR {
                    if let Ok(frame) = session.acquire_latest_frame() {
                        // Hold the lease briefly to exercise the drop path.
                        let sampled: u64 = frame.iter().step_by(4096).map(|b| *b as u64).sum();
                        checksum = checksum.wrapping_add(sampled);
                        leases += 1;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                info!(reader, leases, checksum, "reader finished");
                leases
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.join().map_err(|_| anyhow::anyhow!("reader thread panicked"))?;
    }

    println!(
        "{} frames published, {total} leases taken, {} readers outstanding",
        session.frame_count(),
        session.reader_count()
    );
    Ok(())
}
