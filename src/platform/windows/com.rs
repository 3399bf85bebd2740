use std::cell::Cell;

use anyhow::{Context, Result};
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx};

thread_local! {
    static APARTMENT_READY: Cell<bool> = const { Cell::new(false) };
}

/// Joins the calling thread to the multithreaded apartment, once per thread.
///
/// A thread that already belongs to an apartment (of either kind) counts
/// as initialized. The apartment is never torn down here because the thread
/// belongs to the caller.
pub(crate) fn ensure_multithreaded_apartment() -> Result<()> {
    if APARTMENT_READY.with(Cell::get) {
        return Ok(());
    }

    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr != RPC_E_CHANGED_MODE {
        // S_OK and S_FALSE both succeed here.
        hr.ok()
            .context("failed to initialize COM with CoInitializeEx(COINIT_MULTITHREADED)")?;
    }
    APARTMENT_READY.with(|ready| ready.set(true));
    Ok(())
}
