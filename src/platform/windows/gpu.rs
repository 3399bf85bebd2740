use std::ffi::c_void;
use std::sync::OnceLock;

use anyhow::Context;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_VERTEX_BUFFER, D3D11_BOX,
    D3D11_BUFFER_DESC, D3D11_COMPARISON_NEVER, D3D11_CPU_ACCESS_READ,
    D3D11_FILTER_MIN_MAG_MIP_LINEAR,
    D3D11_FLOAT32_MAX, D3D11_INPUT_ELEMENT_DESC, D3D11_INPUT_PER_VERTEX_DATA,
    D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_RESOURCE_MISC_SHARED, D3D11_SAMPLER_DESC,
    D3D11_SUBRESOURCE_DATA, D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_DEFAULT, D3D11_USAGE_IMMUTABLE, D3D11_USAGE_STAGING, D3D11_VIEWPORT, ID3D11Buffer,
    ID3D11Device, ID3D11DeviceContext, ID3D11InputLayout, ID3D11PixelShader,
    ID3D11RenderTargetView, ID3D11Resource, ID3D11SamplerState, ID3D11ShaderResourceView,
    ID3D11Texture2D, ID3D11VertexShader,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R32G32_FLOAT, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::IDXGIResource;
use windows::core::{Interface, s};

use crate::error::{BridgeError, BridgeResult};
use crate::frame::FrameDescriptor;
use crate::geometry::CropRect;
use crate::pipeline::{FrameGpu, TexturePurpose};
use crate::readback::{MappedSurface, required_mapped_len};

// Shader bytecode is compiled by build.rs when fxc.exe is available and
// embedded here; otherwise it is compiled at runtime on first use.

#[cfg(has_precompiled_scale_vs)]
const PRECOMPILED_VS: &[u8] = include_bytes!(env!("SCALE_VS_CSO_PATH"));

#[cfg(has_precompiled_scale_ps)]
const PRECOMPILED_PS: &[u8] = include_bytes!(env!("SCALE_PS_CSO_PATH"));

fn cached_vertex_bytecode() -> &'static BridgeResult<Vec<u8>> {
    static BYTECODE: OnceLock<BridgeResult<Vec<u8>>> = OnceLock::new();
    BYTECODE.get_or_init(|| {
        #[cfg(has_precompiled_scale_vs)]
        {
            Ok(PRECOMPILED_VS.to_vec())
        }
        #[cfg(not(has_precompiled_scale_vs))]
        {
            compile_shader_runtime(b"vs_main\0", b"vs_4_0\0")
        }
    })
}

fn cached_pixel_bytecode() -> &'static BridgeResult<Vec<u8>> {
    static BYTECODE: OnceLock<BridgeResult<Vec<u8>>> = OnceLock::new();
    BYTECODE.get_or_init(|| {
        #[cfg(has_precompiled_scale_ps)]
        {
            Ok(PRECOMPILED_PS.to_vec())
        }
        #[cfg(not(has_precompiled_scale_ps))]
        {
            compile_shader_runtime(b"ps_main\0", b"ps_4_0\0")
        }
    })
}

/// Borrows cached bytecode. A cached failure is re-reported by message.
fn bytecode(cached: &'static BridgeResult<Vec<u8>>) -> BridgeResult<&'static [u8]> {
    match cached {
        Ok(bytes) => Ok(bytes),
        Err(err) => Err(BridgeError::BackendUnavailable(err.to_string())),
    }
}

#[cfg(any(not(has_precompiled_scale_vs), not(has_precompiled_scale_ps)))]
fn compile_shader_runtime(entry: &[u8], target: &[u8]) -> BridgeResult<Vec<u8>> {
    use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
    use windows::core::PCSTR;

    let source = include_str!("scale_quad.hlsl").as_bytes();
    let mut blob = None;
    let mut errors = None;

    let hr = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            PCSTR::from_raw(entry.as_ptr()),
            PCSTR::from_raw(target.as_ptr()),
            0,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = hr {
        let msg = errors
            .map(|b| {
                let ptr = unsafe { b.GetBufferPointer() } as *const u8;
                let len = unsafe { b.GetBufferSize() };
                let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
                String::from_utf8_lossy(slice).to_string()
            })
            .unwrap_or_default();
        return Err(BridgeError::Platform(
            anyhow::anyhow!("HLSL compile failed: {msg}").context(e.to_string()),
        ));
    }

    let blob =
        blob.ok_or_else(|| BridgeError::Platform(anyhow::anyhow!("D3DCompile returned no blob")))?;
    let ptr = unsafe { blob.GetBufferPointer() } as *const u8;
    let len = unsafe { blob.GetBufferSize() };
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
}

#[repr(C)]
#[derive(Clone, Copy)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

/// Two triangles covering clip space, with texture coordinates flipped on Y.
const QUAD_VERTICES: [QuadVertex; 6] = [
    QuadVertex {
        position: [-1.0, -1.0],
        uv: [0.0, 1.0],
    },
    QuadVertex {
        position: [-1.0, 1.0],
        uv: [0.0, 0.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        uv: [1.0, 0.0],
    },
    QuadVertex {
        position: [-1.0, -1.0],
        uv: [0.0, 1.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        uv: [1.0, 0.0],
    },
    QuadVertex {
        position: [1.0, -1.0],
        uv: [1.0, 1.0],
    },
];

/// A D3D11 texture together with the views the pipeline needs for it.
#[derive(Clone)]
pub(crate) struct GpuTexture {
    texture: ID3D11Texture2D,
    resource: ID3D11Resource,
    rtv: Option<ID3D11RenderTargetView>,
    width: u32,
    height: u32,
}

// SAFETY: the device is created with multithread protection, and textures
// are only used through that device's immediate context.
unsafe impl Send for GpuTexture {}
unsafe impl Sync for GpuTexture {}

impl GpuTexture {
    /// Wraps a texture owned by the capture service.
    pub(crate) fn from_texture(texture: ID3D11Texture2D) -> BridgeResult<Self> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        let resource = texture
            .cast::<ID3D11Resource>()
            .context("failed to cast texture to ID3D11Resource")
            .map_err(BridgeError::Platform)?;
        Ok(Self {
            texture,
            resource,
            rtv: None,
            width: desc.Width,
            height: desc.Height,
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Raw `ID3D11Texture2D*`, not add-ref'd.
    pub(crate) fn as_raw(&self) -> *mut c_void {
        self.texture.as_raw()
    }

    /// Legacy DXGI shared handle. Null for textures created without
    /// `D3D11_RESOURCE_MISC_SHARED`.
    pub(crate) fn shared_handle(&self) -> *mut c_void {
        self.texture
            .cast::<IDXGIResource>()
            .and_then(|resource| unsafe { resource.GetSharedHandle() })
            .map_or(std::ptr::null_mut(), |handle: HANDLE| handle.0)
    }
}

/// Quad pipeline used for downscaling.
pub(crate) struct QuadScaler {
    vs: ID3D11VertexShader,
    ps: ID3D11PixelShader,
    layout: ID3D11InputLayout,
    vertex_buffer: ID3D11Buffer,
    sampler: ID3D11SamplerState,
}

// SAFETY: see `GpuTexture`.
unsafe impl Send for QuadScaler {}

pub(crate) struct D3d11Gpu {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    /// SRV for the last scale source, keyed by its raw COM pointer.
    cached_srv: Option<(usize, ID3D11ShaderResourceView)>,
}

// SAFETY: see `GpuTexture`.
unsafe impl Send for D3d11Gpu {}

impl D3d11Gpu {
    pub(crate) fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> Self {
        Self {
            device,
            context,
            cached_srv: None,
        }
    }

    fn source_view(&mut self, src: &GpuTexture) -> BridgeResult<ID3D11ShaderResourceView> {
        let key = src.texture.as_raw() as usize;
        if let Some((cached_key, srv)) = &self.cached_srv
            && *cached_key == key
        {
            return Ok(srv.clone());
        }

        let mut srv: Option<ID3D11ShaderResourceView> = None;
        unsafe {
            self.device
                .CreateShaderResourceView(&src.texture, None, Some(&mut srv))
        }
        .context("CreateShaderResourceView for scale source failed")
        .map_err(BridgeError::Platform)?;
        let srv = srv
            .context("CreateShaderResourceView returned None")
            .map_err(BridgeError::Platform)?;
        self.cached_srv = Some((key, srv.clone()));
        Ok(srv)
    }
}

fn texture_desc(purpose: TexturePurpose, width: u32, height: u32) -> D3D11_TEXTURE2D_DESC {
    let (usage, bind_flags, cpu_access, misc_flags) = match purpose {
        TexturePurpose::Crop => (
            D3D11_USAGE_DEFAULT,
            D3D11_BIND_SHADER_RESOURCE.0 as u32,
            0,
            D3D11_RESOURCE_MISC_SHARED.0 as u32,
        ),
        TexturePurpose::ScaleTarget => (
            D3D11_USAGE_DEFAULT,
            (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            0,
            D3D11_RESOURCE_MISC_SHARED.0 as u32,
        ),
        TexturePurpose::Staging => (
            D3D11_USAGE_STAGING,
            0,
            D3D11_CPU_ACCESS_READ.0 as u32,
            0,
        ),
    };

    D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Usage: usage,
        BindFlags: bind_flags,
        CPUAccessFlags: cpu_access,
        MiscFlags: misc_flags,
    }
}

impl FrameGpu for D3d11Gpu {
    type Texture = GpuTexture;
    type Scaler = QuadScaler;

    fn create_texture(
        &mut self,
        purpose: TexturePurpose,
        width: u32,
        height: u32,
    ) -> BridgeResult<GpuTexture> {
        let desc = texture_desc(purpose, width, height);
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .with_context(|| format!("CreateTexture2D ({}) failed", purpose.as_str()))
            .map_err(BridgeError::Platform)?;
        let texture = texture
            .context("CreateTexture2D returned None")
            .map_err(BridgeError::Platform)?;

        let mut wrapped = GpuTexture::from_texture(texture)?;
        if purpose == TexturePurpose::ScaleTarget {
            let mut rtv: Option<ID3D11RenderTargetView> = None;
            unsafe {
                self.device
                    .CreateRenderTargetView(&wrapped.texture, None, Some(&mut rtv))
            }
            .context("CreateRenderTargetView failed")
            .map_err(BridgeError::Platform)?;
            wrapped.rtv = Some(
                rtv.context("CreateRenderTargetView returned None")
                    .map_err(BridgeError::Platform)?,
            );
        }
        Ok(wrapped)
    }

    fn copy_region(
        &mut self,
        dst: &GpuTexture,
        src: &GpuTexture,
        rect: CropRect,
    ) -> BridgeResult<()> {
        let source_box = D3D11_BOX {
            left: rect.x,
            top: rect.y,
            front: 0,
            right: rect.right(),
            bottom: rect.bottom(),
            back: 1,
        };
        unsafe {
            self.context.CopySubresourceRegion(
                &dst.resource,
                0,
                0,
                0,
                0,
                &src.resource,
                0,
                Some(&source_box),
            );
        }
        Ok(())
    }

    fn build_scaler(&mut self) -> BridgeResult<QuadScaler> {
        let vs_bytecode = bytecode(cached_vertex_bytecode())?;
        let ps_bytecode = bytecode(cached_pixel_bytecode())?;

        let mut vs: Option<ID3D11VertexShader> = None;
        unsafe { self.device.CreateVertexShader(vs_bytecode, None, Some(&mut vs)) }
            .context("CreateVertexShader failed")
            .map_err(BridgeError::Platform)?;
        let vs = vs
            .context("CreateVertexShader returned None")
            .map_err(BridgeError::Platform)?;

        let mut ps: Option<ID3D11PixelShader> = None;
        unsafe { self.device.CreatePixelShader(ps_bytecode, None, Some(&mut ps)) }
            .context("CreatePixelShader failed")
            .map_err(BridgeError::Platform)?;
        let ps = ps
            .context("CreatePixelShader returned None")
            .map_err(BridgeError::Platform)?;

        let elements = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 8,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];
        let mut layout: Option<ID3D11InputLayout> = None;
        unsafe {
            self.device
                .CreateInputLayout(&elements, vs_bytecode, Some(&mut layout))
        }
        .context("CreateInputLayout failed")
        .map_err(BridgeError::Platform)?;
        let layout = layout
            .context("CreateInputLayout returned None")
            .map_err(BridgeError::Platform)?;

        let buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of_val(&QUAD_VERTICES) as u32,
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: QUAD_VERTICES.as_ptr() as *const c_void,
            SysMemPitch: 0,
            SysMemSlicePitch: 0,
        };
        let mut vertex_buffer: Option<ID3D11Buffer> = None;
        unsafe {
            self.device
                .CreateBuffer(&buffer_desc, Some(&initial), Some(&mut vertex_buffer))
        }
        .context("CreateBuffer for quad vertices failed")
        .map_err(BridgeError::Platform)?;
        let vertex_buffer = vertex_buffer
            .context("CreateBuffer returned None")
            .map_err(BridgeError::Platform)?;

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: D3D11_FLOAT32_MAX,
        };
        let mut sampler: Option<ID3D11SamplerState> = None;
        unsafe { self.device.CreateSamplerState(&sampler_desc, Some(&mut sampler)) }
            .context("CreateSamplerState failed")
            .map_err(BridgeError::Platform)?;
        let sampler = sampler
            .context("CreateSamplerState returned None")
            .map_err(BridgeError::Platform)?;

        Ok(QuadScaler {
            vs,
            ps,
            layout,
            vertex_buffer,
            sampler,
        })
    }

    fn render_scaled(
        &mut self,
        scaler: &QuadScaler,
        src: &GpuTexture,
        dst: &GpuTexture,
        width: u32,
        height: u32,
    ) -> BridgeResult<()> {
        let rtv = dst
            .rtv
            .clone()
            .context("scale target has no render target view")
            .map_err(BridgeError::Platform)?;
        let srv = self.source_view(src)?;

        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: width as f32,
            Height: height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let stride = std::mem::size_of::<QuadVertex>() as u32;
        let offset = 0u32;
        let vertex_buffer = Some(scaler.vertex_buffer.clone());

        unsafe {
            let context = &self.context;
            context.OMSetRenderTargets(Some(&[Some(rtv)]), None);
            context.RSSetViewports(Some(&[viewport]));
            context.IASetInputLayout(&scaler.layout);
            context.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.IASetVertexBuffers(
                0,
                1,
                Some(&vertex_buffer as *const _),
                Some(&stride as *const _),
                Some(&offset as *const _),
            );
            context.VSSetShader(&scaler.vs, None);
            context.PSSetShader(&scaler.ps, None);
            context.PSSetShaderResources(0, Some(&[Some(srv)]));
            context.PSSetSamplers(0, Some(&[Some(scaler.sampler.clone())]));
            context.Draw(QUAD_VERTICES.len() as u32, 0);
            // The source may be a capture-pool surface; release the binding.
            context.PSSetShaderResources(0, Some(&[None]));
        }
        Ok(())
    }

    fn copy_resource(&mut self, dst: &GpuTexture, src: &GpuTexture) -> BridgeResult<()> {
        unsafe { self.context.CopyResource(&dst.resource, &src.resource) };
        Ok(())
    }

    fn flush(&mut self) {
        unsafe { self.context.Flush() };
    }

    fn read_mapped<R, F>(&mut self, staging: &GpuTexture, read: F) -> BridgeResult<R>
    where
        F: FnOnce(MappedSurface<'_>) -> BridgeResult<R>,
    {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&staging.resource, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .context("failed to map staging texture")
        .map_err(BridgeError::Platform)?;

        let result = (|| {
            if mapped.pData.is_null() {
                return Err(BridgeError::Platform(anyhow::anyhow!(
                    "mapped staging texture has no data pointer"
                )));
            }
            let row_pitch = mapped.RowPitch as usize;
            let desc = FrameDescriptor::bgra(staging.width, staging.height);
            let len = required_mapped_len(&desc, row_pitch)?;
            // SAFETY: the mapping covers `row_pitch` bytes for every row up
            // to the last, which holds at least `width * 4` bytes. It stays
            // valid until the Unmap below.
            let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
            read(MappedSurface { data, row_pitch })
        })();

        unsafe { self.context.Unmap(&staging.resource, 0) };
        result
    }
}
