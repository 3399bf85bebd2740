//! Captures a window (or the primary display) and reports frame stats.
//!
//! Usage: `cargo run --example capture_window -- [HWND] [MAX_W MAX_H]`
//! where `HWND` is decimal or `0x`-prefixed hex. Without it the primary
//! display is captured.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use snow_bridge::{BridgeError, CaptureTarget, Session, WindowId};
use tracing_subscriber::EnvFilter;

fn parse_handle(raw: &str) -> Result<isize> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => isize::from_str_radix(hex, 16),
        None => raw.parse::<isize>(),
    };
    parsed.with_context(|| format!("invalid window handle: {raw}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let target = match args.first() {
        Some(raw) => CaptureTarget::Window(WindowId::from_raw_handle(parse_handle(raw)?)),
        None => CaptureTarget::PrimaryMonitor,
    };
    let (max_width, max_height) = match (args.get(1), args.get(2)) {
        (Some(w), Some(h)) => (
            w.parse().context("invalid max width")?,
            h.parse().context("invalid max height")?,
        ),
        _ => (0, 0),
    };

    let session = Session::builder(target)
        .max_resolution(max_width, max_height)
        .build()
        .with_context(|| format!("failed to start capture of {}", target.describe()))?;

    let mut buffer = Vec::new();
    let begin = Instant::now();
    let mut last_count = 0;
    while begin.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(100));
        let count = session.frame_count();
        if count == last_count {
            continue;
        }
        last_count = count;

        match session.copy_latest_frame(&mut buffer) {
            Ok(desc) => println!("frame {count}: {}x{}", desc.width, desc.height),
            Err(BridgeError::BufferTooSmall { required, .. }) => {
                buffer.resize(required, 0);
                let desc = session.copy_latest_frame(&mut buffer)?;
                println!("frame {count}: {}x{} (buffer grown)", desc.width, desc.height);
            }
            Err(err) => return Err(err.into()),
        }
    }

    let fps = last_count as f64 / begin.elapsed().as_secs_f64();
    println!("published {last_count} frames ({fps:.1} fps)");
    session.close();
    Ok(())
}
