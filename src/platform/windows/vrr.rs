use anyhow::{Context, Result};
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_ALPHA_MODE_UNSPECIFIED, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_PRESENT, DXGI_PRESENT_ALLOW_TEARING, DXGI_SCALING_STRETCH, DXGI_SWAP_CHAIN_DESC1,
    DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING, DXGI_SWAP_EFFECT_FLIP_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIAdapter, IDXGIDevice2, IDXGIFactory2, IDXGISwapChain1,
};
use windows::core::Interface;

const SWAP_CHAIN_EDGE: u32 = 16;

/// Tiny flip-model swap chain bound to the captured window. It is never
/// drawn into; presenting on it after each frame feeds the frame cadence to
/// the compositor so variable refresh displays can follow it.
pub(crate) struct VrrPresenter {
    swap_chain: IDXGISwapChain1,
}

// SAFETY: `Present` is only called from the frame callback, which the
// pipeline serializes, and the device is multithread protected.
unsafe impl Send for VrrPresenter {}
unsafe impl Sync for VrrPresenter {}

impl VrrPresenter {
    pub(crate) fn new(device: &ID3D11Device, window: HWND) -> Result<Self> {
        let dxgi_device: IDXGIDevice2 = device
            .cast()
            .context("failed to cast ID3D11Device to IDXGIDevice2")?;
        let adapter: IDXGIAdapter =
            unsafe { dxgi_device.GetAdapter() }.context("IDXGIDevice::GetAdapter failed")?;
        let factory: IDXGIFactory2 =
            unsafe { adapter.GetParent() }.context("failed to get IDXGIFactory2 from adapter")?;

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: SWAP_CHAIN_EDGE,
            Height: SWAP_CHAIN_EDGE,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            Stereo: false.into(),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 2,
            Scaling: DXGI_SCALING_STRETCH,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            AlphaMode: DXGI_ALPHA_MODE_UNSPECIFIED,
            Flags: DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING.0 as u32,
        };
        let swap_chain =
            unsafe { factory.CreateSwapChainForHwnd(device, window, &desc, None, None) }
                .context("IDXGIFactory2::CreateSwapChainForHwnd failed")?;
        Ok(Self { swap_chain })
    }

    /// Presents with tearing allowed when `vrr_enabled`, otherwise as a
    /// plain flip.
    pub(crate) fn present(&self, vrr_enabled: bool) {
        let flags = if vrr_enabled {
            DXGI_PRESENT_ALLOW_TEARING
        } else {
            DXGI_PRESENT(0)
        };
        let _ = unsafe { self.swap_chain.Present(0, flags) };
    }
}
