use std::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Context;
use tracing::{debug, info, trace, warn};
use windows::Foundation::Metadata::ApiInformation;
use windows::Foundation::{EventRegistrationToken, TypedEventHandler};
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem,
    GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::Foundation::{HWND, POINT};
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Texture2D};
use windows::Win32::Graphics::Gdi::{HMONITOR, MONITOR_DEFAULTTOPRIMARY, MonitorFromPoint};
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::Win32::UI::WindowsAndMessaging::IsWindow;
use windows::core::{IInspectable, Interface, h};

use crate::CaptureTarget;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::SourceFrame;
use crate::pipeline::{BridgeState, FrameOutcome, FramePipeline, FrameSource};
use crate::session::{SessionBackend, SessionConfig};

use super::com;
use super::d3d11;
use super::gpu::{D3d11Gpu, GpuTexture};
use super::vrr::VrrPresenter;

const PIXEL_FORMAT: DirectXPixelFormat = DirectXPixelFormat::B8G8R8A8UIntNormalized;

/// Whether the running system exposes a given optional capture API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Capability {
    Present,
    Absent,
}

impl Capability {
    fn probe(type_name: &windows::core::HSTRING, property: &windows::core::HSTRING) -> Self {
        match ApiInformation::IsPropertyPresent(type_name, property) {
            Ok(true) => Self::Present,
            Ok(false) | Err(_) => Self::Absent,
        }
    }

    fn is_present(self) -> bool {
        self == Self::Present
    }
}

fn border_capability() -> Capability {
    static CAPABILITY: OnceLock<Capability> = OnceLock::new();
    *CAPABILITY.get_or_init(|| {
        let capability = Capability::probe(
            h!("Windows.Graphics.Capture.GraphicsCaptureSession"),
            h!("IsBorderRequired"),
        );
        debug!(?capability, "capture border control probed");
        capability
    })
}

fn cursor_capability() -> Capability {
    static CAPABILITY: OnceLock<Capability> = OnceLock::new();
    *CAPABILITY.get_or_init(|| {
        Capability::probe(
            h!("Windows.Graphics.Capture.GraphicsCaptureSession"),
            h!("IsCursorCaptureEnabled"),
        )
    })
}

fn validate_support() -> BridgeResult<()> {
    let supported = GraphicsCaptureSession::IsSupported()
        .context("GraphicsCaptureSession::IsSupported failed")
        .map_err(BridgeError::Platform)?;
    if supported {
        Ok(())
    } else {
        Err(BridgeError::BackendUnavailable(
            "Windows Graphics Capture is not supported on this system".into(),
        ))
    }
}

fn create_capture_item(target: &CaptureTarget) -> BridgeResult<GraphicsCaptureItem> {
    let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
        .context("failed to get IGraphicsCaptureItemInterop factory")
        .map_err(BridgeError::Platform)?;

    match target {
        CaptureTarget::Window(window) => {
            let hwnd = HWND(window.raw_handle() as *mut c_void);
            if window.is_null() || !unsafe { IsWindow(hwnd) }.as_bool() {
                return Err(BridgeError::InvalidTarget(target.describe()));
            }
            unsafe { interop.CreateForWindow(hwnd) }
                .context("IGraphicsCaptureItemInterop::CreateForWindow failed")
                .map_err(BridgeError::Platform)
        }
        CaptureTarget::Monitor(monitor) => {
            if monitor.is_null() {
                return Err(BridgeError::InvalidTarget(target.describe()));
            }
            let hmonitor = HMONITOR(monitor.raw_handle() as *mut c_void);
            unsafe { interop.CreateForMonitor(hmonitor) }
                .map_err(|_| BridgeError::InvalidTarget(target.describe()))
        }
        CaptureTarget::PrimaryMonitor => {
            let hmonitor =
                unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };
            if hmonitor.is_invalid() {
                return Err(BridgeError::InvalidTarget(target.describe()));
            }
            unsafe { interop.CreateForMonitor(hmonitor) }
                .context("IGraphicsCaptureItemInterop::CreateForMonitor failed")
                .map_err(BridgeError::Platform)
        }
    }
}

/// Hands a pool buffer back to the capture service when dropped.
struct FrameGuard(Direct3D11CaptureFrame);

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let _ = self.0.Close();
    }
}

/// Frames queued in one pool during a single notification.
struct WgcFrameSource<'a> {
    pool: &'a Direct3D11CaptureFramePool,
    /// Content size of the newest frame seen.
    content_size: Option<SizeInt32>,
}

impl<'a> WgcFrameSource<'a> {
    fn new(pool: &'a Direct3D11CaptureFramePool) -> Self {
        Self {
            pool,
            content_size: None,
        }
    }
}

impl FrameSource for WgcFrameSource<'_> {
    type Texture = GpuTexture;
    type Guard = FrameGuard;

    fn try_next_frame(&mut self) -> BridgeResult<Option<(SourceFrame<GpuTexture>, FrameGuard)>> {
        let Ok(frame) = self.pool.TryGetNextFrame() else {
            return Ok(None);
        };
        let guard = FrameGuard(frame);

        if let Ok(size) = guard.0.ContentSize() {
            self.content_size = Some(size);
        }

        let surface = guard
            .0
            .Surface()
            .context("Direct3D11CaptureFrame::Surface failed")
            .map_err(BridgeError::Platform)?;
        let access: IDirect3DDxgiInterfaceAccess = surface
            .cast()
            .context("failed to cast frame surface to IDirect3DDxgiInterfaceAccess")
            .map_err(BridgeError::Platform)?;
        let texture: ID3D11Texture2D = unsafe { access.GetInterface() }
            .context("IDirect3DDxgiInterfaceAccess::GetInterface failed")
            .map_err(BridgeError::Platform)?;

        let texture = GpuTexture::from_texture(texture)?;
        let (width, height) = texture.dimensions();
        Ok(Some((
            SourceFrame {
                texture,
                width,
                height,
            },
            guard,
        )))
    }
}

/// Everything the frame-arrived handler touches.
struct FrameCallback {
    pipeline: FramePipeline<D3d11Gpu>,
    winrt_device: IDirect3DDevice,
    pool_buffers: i32,
    pool_size: Mutex<SizeInt32>,
    presenter: Option<VrrPresenter>,
}

// SAFETY: the WinRT device is agile and all D3D11 work goes through a
// multithread-protected device under the pipeline's worker lock.
unsafe impl Send for FrameCallback {}
unsafe impl Sync for FrameCallback {}

impl FrameCallback {
    fn on_frame_arrived(&self, pool: &Direct3D11CaptureFramePool) {
        let mut source = WgcFrameSource::new(pool);
        let outcome = self.pipeline.on_frame_arrived(&mut source);
        trace!(?outcome, "frame notification handled");

        match outcome {
            FrameOutcome::Closing | FrameOutcome::Busy | FrameOutcome::NoFrame => return,
            FrameOutcome::Rejected { .. }
            | FrameOutcome::ReadbackFailed
            | FrameOutcome::Published { .. }
            | FrameOutcome::Dropped { .. } => {}
        }

        if let Some(size) = source.content_size {
            self.recreate_pool_if_needed(pool, size);
        }

        if let Some(presenter) = &self.presenter {
            presenter.present(self.pipeline.state().settings.vrr_enabled());
        }
    }

    fn recreate_pool_if_needed(&self, pool: &Direct3D11CaptureFramePool, content_size: SizeInt32) {
        if content_size.Width <= 0 || content_size.Height <= 0 {
            return;
        }
        let mut pool_size = match self.pool_size.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *pool_size == content_size || self.pipeline.state().is_closing() {
            return;
        }

        match pool.Recreate(
            &self.winrt_device,
            PIXEL_FORMAT,
            self.pool_buffers,
            content_size,
        ) {
            Ok(()) => {
                debug!(
                    width = content_size.Width,
                    height = content_size.Height,
                    "frame pool recreated for new content size"
                );
                *pool_size = content_size;
            }
            Err(err) => warn!(error = %err, "Direct3D11CaptureFramePool::Recreate failed"),
        }
    }
}

/// Undo steps for a partially started session, run newest first on drop.
#[derive(Default)]
struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    fn disarm(&mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Live WGC capture for one target.
pub(crate) struct WgcSession {
    device: ID3D11Device,
    item: GraphicsCaptureItem,
    frame_pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    frame_arrived_token: EventRegistrationToken,
    closed_token: EventRegistrationToken,
    callback: Arc<FrameCallback>,
}

// SAFETY: WGC objects used here are agile and the D3D11 device is
// multithread protected; see `FrameCallback`.
unsafe impl Send for WgcSession {}
unsafe impl Sync for WgcSession {}

impl WgcSession {
    pub(crate) fn open(
        target: &CaptureTarget,
        config: &SessionConfig,
        state: &Arc<BridgeState>,
    ) -> BridgeResult<Self> {
        com::ensure_multithreaded_apartment().map_err(BridgeError::Platform)?;
        validate_support()?;

        let item = create_capture_item(target)?;
        let (device, context) = d3d11::create_protected_device().map_err(BridgeError::Platform)?;
        let winrt_device = d3d11::create_winrt_device(&device).map_err(BridgeError::Platform)?;

        let presenter = match target {
            CaptureTarget::Window(window) if config.vrr_swap_chain => {
                let hwnd = HWND(window.raw_handle() as *mut c_void);
                match VrrPresenter::new(&device, hwnd) {
                    Ok(presenter) => Some(presenter),
                    Err(err) => {
                        warn!(error = %err, "VRR swap chain unavailable; continuing without it");
                        None
                    }
                }
            }
            _ => None,
        };

        let pool_size = item
            .Size()
            .context("GraphicsCaptureItem::Size failed")
            .map_err(BridgeError::Platform)?;
        debug!(
            width = pool_size.Width,
            height = pool_size.Height,
            buffers = config.frame_pool_buffers,
            "creating frame pool"
        );
        let frame_pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            &winrt_device,
            PIXEL_FORMAT,
            config.frame_pool_buffers,
            pool_size,
        )
        .context("Direct3D11CaptureFramePool::CreateFreeThreaded failed")
        .map_err(BridgeError::Platform)?;

        let callback = Arc::new(FrameCallback {
            pipeline: FramePipeline::new(D3d11Gpu::new(device.clone(), context), Arc::clone(state)),
            winrt_device,
            pool_buffers: config.frame_pool_buffers,
            pool_size: Mutex::new(pool_size),
            presenter,
        });

        let started = Self::start(target, config, device, item, frame_pool.clone(), callback);
        if started.is_err() {
            let _ = frame_pool.Close();
        }
        started
    }

    fn start(
        target: &CaptureTarget,
        config: &SessionConfig,
        device: ID3D11Device,
        item: GraphicsCaptureItem,
        frame_pool: Direct3D11CaptureFramePool,
        callback: Arc<FrameCallback>,
    ) -> BridgeResult<Self> {
        let mut rollback = Rollback::default();
        let callback_for_frames = Arc::clone(&callback);
        let frame_arrived_token = frame_pool
            .FrameArrived(
                &TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new(
                    move |sender, _| {
                        if let Some(pool) = sender {
                            callback_for_frames.on_frame_arrived(pool);
                        }
                        Ok(())
                    },
                ),
            )
            .context("Direct3D11CaptureFramePool::FrameArrived registration failed")
            .map_err(BridgeError::Platform)?;
        let pool_for_rollback = frame_pool.clone();
        rollback.push(move || {
            let _ = pool_for_rollback.RemoveFrameArrived(frame_arrived_token);
        });

        let described = target.describe();
        let closed_token = item
            .Closed(
                &TypedEventHandler::<GraphicsCaptureItem, IInspectable>::new(move |_, _| {
                    info!(capture = %described, "capture item closed by the system");
                    Ok(())
                }),
            )
            .context("GraphicsCaptureItem::Closed registration failed")
            .map_err(BridgeError::Platform)?;
        let item_for_rollback = item.clone();
        rollback.push(move || {
            let _ = item_for_rollback.RemoveClosed(closed_token);
        });

        let session = frame_pool
            .CreateCaptureSession(&item)
            .context("Direct3D11CaptureFramePool::CreateCaptureSession failed")
            .map_err(BridgeError::Platform)?;

        if cursor_capability().is_present()
            && let Err(err) = session.SetIsCursorCaptureEnabled(config.capture_cursor)
        {
            debug!(error = %err, "cursor capture toggle rejected");
        }
        if border_capability().is_present()
            && let Err(err) = session.SetIsBorderRequired(config.border_required)
        {
            debug!(error = %err, "capture border toggle rejected");
        }

        // From here on `Drop for WgcSession` owns the registrations.
        rollback.disarm();
        let backend = Self {
            device,
            item,
            frame_pool,
            session,
            frame_arrived_token,
            closed_token,
            callback,
        };

        backend
            .session
            .StartCapture()
            .context("GraphicsCaptureSession::StartCapture failed")
            .map_err(BridgeError::Platform)?;
        info!(capture = %target.describe(), "capture started");
        Ok(backend)
    }

    fn teardown(&self) {
        let _ = self.frame_pool.RemoveFrameArrived(self.frame_arrived_token);
        let _ = self.item.RemoveClosed(self.closed_token);
        let _ = self.session.Close();
        let _ = self.frame_pool.Close();
    }
}

impl SessionBackend for WgcSession {
    fn set_border_required(&self, required: bool) -> bool {
        if !border_capability().is_present() {
            return false;
        }
        match self.session.SetIsBorderRequired(required) {
            Ok(()) => {
                debug!(required, "capture border updated");
                true
            }
            Err(err) => {
                debug!(error = %err, "capture border toggle rejected");
                false
            }
        }
    }

    fn device_ptr(&self) -> *mut c_void {
        self.device.as_raw()
    }

    fn latest_texture_ptr(&self) -> *mut c_void {
        self.callback
            .pipeline
            .latest_texture()
            .map_or(std::ptr::null_mut(), |texture| texture.as_raw())
    }

    fn shared_handle(&self) -> *mut c_void {
        self.callback
            .pipeline
            .latest_texture()
            .map_or(std::ptr::null_mut(), |texture| texture.shared_handle())
    }

    fn close(&self) {
        self.teardown();
    }
}

impl Drop for WgcSession {
    fn drop(&mut self) {
        if !self.callback.pipeline.state().is_closing() {
            self.callback.pipeline.state().begin_close();
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn recorder() -> (Log, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let for_steps = Rc::clone(&log);
        let step = move |name: &'static str| -> Box<dyn FnOnce()> {
            let log = Rc::clone(&for_steps);
            Box::new(move || log.borrow_mut().push(name))
        };
        (log, step)
    }

    #[test]
    fn failed_start_unregisters_handlers_newest_first() {
        let (log, step) = recorder();
        {
            let mut rollback = Rollback::default();
            rollback.push(step("frame_arrived"));
            rollback.push(step("closed"));
        }
        assert_eq!(*log.borrow(), ["closed", "frame_arrived"]);
    }

    #[test]
    fn started_session_keeps_its_handlers() {
        let (log, step) = recorder();
        {
            let mut rollback = Rollback::default();
            rollback.push(step("frame_arrived"));
            rollback.disarm();
        }
        assert!(log.borrow().is_empty());
    }
}
