//! Programmable-pipeline backend on wgpu.
//!
//! Draws are recorded as ops and replayed in issue order when the frame is
//! presented. Discard locks of dynamic buffers copy their vertices into a
//! per-frame arena, so each recorded draw keeps the data it was issued with.
//!
//! Texture uploads are the exception: they go through `Queue::write_texture`
//! at the time of the call, which the queue applies before the frame's
//! command buffer. A texture updated in the middle of a frame is therefore
//! seen by draws issued earlier in that frame as well. Upload textures before
//! the first draw that samples them.

use crate::core::gfx::{
    DrawCall, FogFunc, GfxResourceId, MatrixType, PackedCol, VertexFormat,
    backends::{
        Backend, BackendCaps, BufferUsage, HandleAlloc, LockMode, PresentParams, PresentStatus,
        TextureDesc, view_proj,
    },
    bitmap::TexelRect,
    error::{NativeError, NativeResult},
    state::{ColorMask, StateChange},
};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use image::RgbaImage;
use log::{debug, info, warn};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use rustc_hash::FxHashMap;
use std::{
    borrow::Cow,
    error::Error,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
};
use wgpu::util::DeviceExt;
use winit::window::Window;

const E_FAIL: u32 = 0x8000_4005;
const E_INVALIDARG: u32 = 0x8007_0057;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
/// Texel memory is B,G,R,A, the same as `BitmapCol` on little-endian hosts.
const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Bgra8Unorm;
const UNIFORM_BYTES: u64 = size_of::<Uniforms>() as u64;
const SHADER: &str = include_str!("../shaders/fixed_function.wgsl");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Api {
    Auto,
    Vulkan,
    OpenGL,
    #[cfg(target_os = "windows")]
    DirectX,
}

impl Api {
    #[inline(always)]
    const fn name(self) -> &'static str {
        match self {
            Self::Auto => "wgpu",
            Self::Vulkan => "Vulkan",
            Self::OpenGL => "OpenGL",
            #[cfg(target_os = "windows")]
            Self::DirectX => "DirectX",
        }
    }

    #[inline(always)]
    const fn backends(self) -> wgpu::Backends {
        match self {
            Self::Auto => wgpu::Backends::PRIMARY,
            Self::Vulkan => wgpu::Backends::VULKAN,
            Self::OpenGL => wgpu::Backends::GL,
            #[cfg(target_os = "windows")]
            Self::DirectX => wgpu::Backends::DX12,
        }
    }
}

struct OwnedWindowHandle(pub Arc<Window>);

impl HasWindowHandle for OwnedWindowHandle {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.0.window_handle()
    }
}
impl HasDisplayHandle for OwnedWindowHandle {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.0.display_handle()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Uniforms {
    mvp: [[f32; 4]; 4],
    view_z: [f32; 4],
    params: [f32; 4],
    fog_col: [f32; 4],
    fog: [f32; 4],
}

impl Uniforms {
    fn new(st: &FixedState, view: &Mat4, projection: &Mat4, tex_offset: Option<(f32, f32)>) -> Self {
        let (ox, oy) = tex_offset.unwrap_or((0.0, 0.0));
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let mode = match st.fog_mode {
            FogFunc::Linear => 0.0,
            FogFunc::Exp => 1.0,
            FogFunc::Exp2 => 2.0,
        };
        Self {
            mvp: view_proj(view, projection).to_cols_array_2d(),
            view_z: view.row(2).to_array(),
            params: [ox, oy, flag(st.alpha_test), flag(st.alpha_arg_blend)],
            fog_col: st.fog_col.to_f32(),
            fog: [flag(st.fog), mode, st.fog_density, st.fog_end],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FixedState {
    face_culling: bool,
    fog: bool,
    fog_col: PackedCol,
    fog_density: f32,
    fog_end: f32,
    fog_mode: FogFunc,
    alpha_test: bool,
    alpha_blending: bool,
    alpha_arg_blend: bool,
    depth_test: bool,
    depth_write: bool,
    write_mask: ColorMask,
}

impl Default for FixedState {
    fn default() -> Self {
        Self {
            face_culling: false,
            fog: false,
            fog_col: PackedCol::BLACK,
            fog_density: 1.0,
            fog_end: 1.0,
            fog_mode: FogFunc::Linear,
            alpha_test: false,
            alpha_blending: false,
            alpha_arg_blend: false,
            depth_test: true,
            depth_write: true,
            write_mask: ColorMask::all(),
        }
    }
}

/// Everything that forces a distinct `wgpu::RenderPipeline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    format: VertexFormat,
    lines: bool,
    blend: bool,
    depth_test: bool,
    depth_write: bool,
    cull: bool,
    mask: ColorMask,
}

impl PipelineKey {
    const fn new(st: &FixedState, format: VertexFormat, lines: bool) -> Self {
        Self {
            format,
            lines,
            blend: st.alpha_blending,
            depth_test: st.depth_test,
            depth_write: st.depth_write,
            cull: st.face_culling,
            mask: st.write_mask,
        }
    }

    /// A disabled depth test also disables depth writes.
    fn depth_state(self) -> wgpu::DepthStencilState {
        wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: Some(self.depth_test && self.depth_write),
            depth_compare: if self.depth_test {
                Some(wgpu::CompareFunction::GreaterEqual)
            } else {
                Some(wgpu::CompareFunction::Always)
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    /// Indexed by whether mipmap filtering is on.
    groups: [wgpu::BindGroup; 2],
    levels: u32,
}

struct GpuVb {
    buffer: wgpu::Buffer,
    capacity: usize,
    usage: BufferUsage,
    staging: Vec<u32>,
    pending: Option<LockMode>,
    /// Where this frame's discard upload lives in the frame arena.
    arena_offset: Option<u64>,
}

enum VertexSource {
    Buffer(wgpu::Buffer),
    Arena(u64),
}

struct DrawOp {
    key: PipelineKey,
    source: VertexSource,
    indices: Option<wgpu::Buffer>,
    call: DrawCall,
    texture: Option<wgpu::BindGroup>,
    uniform: u32,
}

enum Op {
    Clear(PackedCol),
    Draw(DrawOp),
}

#[derive(Default)]
struct Frame {
    ops: Vec<Op>,
    uniforms: Vec<Uniforms>,
    arena: Vec<u32>,
}

struct GpuDevice {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    can_capture: bool,
    depth_view: wgpu::TextureView,
    shader: wgpu::ShaderModule,
    texture_layout: wgpu::BindGroupLayout,
    coloured_layout: wgpu::PipelineLayout,
    textured_layout: wgpu::PipelineLayout,
    samplers: [wgpu::Sampler; 2],
    white: [wgpu::BindGroup; 2],
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    uniform_layout: wgpu::BindGroupLayout,
    uniform_stride: u64,
    uniform_capacity: usize,
    uniform_buffer: wgpu::Buffer,
    uniform_group: wgpu::BindGroup,
    arena_buffer: wgpu::Buffer,
    arena_capacity: u64,
    lost: Arc<AtomicBool>,
}

pub struct WgpuBackend {
    api: Api,
    window: Arc<Window>,
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    gpu: Option<GpuDevice>,
    handles: HandleAlloc,
    textures: FxHashMap<GfxResourceId, GpuTexture>,
    vbs: FxHashMap<GfxResourceId, GpuVb>,
    ibs: FxHashMap<GfxResourceId, wgpu::Buffer>,
    bound_tex: GfxResourceId,
    bound_vb: GfxResourceId,
    bound_ib: GfxResourceId,
    format: VertexFormat,
    fixed: FixedState,
    view: Mat4,
    projection: Mat4,
    tex_offset: Option<(f32, f32)>,
    mipmaps: bool,
    frame: Frame,
    vsync: bool,
    screenshot_requested: bool,
    captured: Option<RgbaImage>,
}

impl WgpuBackend {
    /// Creates the instance and window surface. The device is created by
    /// `Backend::create_device`.
    pub fn new(api: Api, window: Arc<Window>, gfx_debug: bool) -> Result<Self, Box<dyn Error>> {
        info!("Initializing {} (wgpu) backend...", api.name());
        let flags = if gfx_debug {
            info!("{} (wgpu) validation/debug is enabled.", api.name());
            wgpu::InstanceFlags::debugging()
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: api.backends(),
            flags,
            memory_budget_thresholds: Default::default(),
            backend_options: Default::default(),
            display: None,
        });
        let surface = instance
            .create_surface(OwnedWindowHandle(window.clone()))
            .map_err(|e| format!("Failed to create wgpu surface: {e}"))?;

        Ok(Self {
            api,
            window,
            instance,
            surface,
            gpu: None,
            handles: HandleAlloc::default(),
            textures: FxHashMap::default(),
            vbs: FxHashMap::default(),
            ibs: FxHashMap::default(),
            bound_tex: GfxResourceId::NULL,
            bound_vb: GfxResourceId::NULL,
            bound_ib: GfxResourceId::NULL,
            format: VertexFormat::Coloured,
            fixed: FixedState::default(),
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            tex_offset: None,
            mipmaps: false,
            frame: Frame::default(),
            vsync: true,
            screenshot_requested: false,
            captured: None,
        })
    }

    fn create_gpu(&self, params: &PresentParams) -> Result<GpuDevice, Box<dyn Error>> {
        let name = self.api.name();
        let adapter = pollster::block_on(self.instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&self.surface),
                force_fallback_adapter: false,
            },
        ))
        .map_err(|e| format!("No suitable {name} adapter found: {e}"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("cubegfx wgpu device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: Default::default(),
            experimental_features: Default::default(),
        }))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, msg| {
            warn!("wgpu device lost ({reason:?}): {msg}");
            flag.store(true, Ordering::Release);
        });

        let caps = self.surface.get_capabilities(&adapter);
        if caps.formats.is_empty() {
            return Err(format!("{name} adapter cannot present to this window").into());
        }
        let can_capture = caps.usages.contains(wgpu::TextureUsages::COPY_SRC);
        let usage = if can_capture {
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT
        };
        let config = wgpu::SurfaceConfiguration {
            usage,
            format: pick_format(&caps),
            width: params.width.max(1),
            height: params.height.max(1),
            present_mode: pick_present_mode(&caps.present_modes, params.vsync),
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Opaque),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        self.surface.configure(&device, &config);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cubegfx fixed-function shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SHADER)),
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubegfx uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(UNIFORM_BYTES),
                },
                count: None,
            }],
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubegfx texture layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let coloured_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubegfx coloured layout"),
            bind_group_layouts: &[Some(&uniform_layout)],
            immediate_size: 0,
        });
        let textured_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubegfx textured layout"),
            bind_group_layouts: &[Some(&uniform_layout), Some(&texture_layout)],
            immediate_size: 0,
        });

        let samplers = [
            device.create_sampler(&sampler_descriptor(false)),
            device.create_sampler(&sampler_descriptor(true)),
        ];

        let white_tex = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("cubegfx white texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TEXTURE_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[0xFF; 4],
        );
        let white_view = white_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let white = [
            texture_group(&device, &texture_layout, &samplers[0], &white_view),
            texture_group(&device, &texture_layout, &samplers[1], &white_view),
        ];

        let align = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let uniform_stride = align_to(UNIFORM_BYTES, align);
        let uniform_capacity = 64usize;
        let (uniform_buffer, uniform_group) =
            uniform_storage(&device, &uniform_layout, uniform_stride, uniform_capacity);

        let arena_capacity = 64 * 1024;
        let arena_buffer = arena_storage(&device, arena_capacity);
        let depth_view = depth_target(&device, config.width, config.height);

        let info = adapter.get_info();
        info!(
            "{name} (wgpu) device created on {} ({:?}, {:?}).",
            info.name, info.backend, info.device_type
        );

        Ok(GpuDevice {
            adapter,
            device,
            queue,
            config,
            can_capture,
            depth_view,
            shader,
            texture_layout,
            coloured_layout,
            textured_layout,
            samplers,
            white,
            pipelines: FxHashMap::default(),
            uniform_layout,
            uniform_stride,
            uniform_capacity,
            uniform_buffer,
            uniform_group,
            arena_buffer,
            arena_capacity,
            lost,
        })
    }

    fn reset_device_state(&mut self, vsync: bool) {
        self.vsync = vsync;
        self.bound_tex = GfxResourceId::NULL;
        self.bound_vb = GfxResourceId::NULL;
        self.bound_ib = GfxResourceId::NULL;
        self.fixed = FixedState::default();
        self.view = Mat4::IDENTITY;
        self.projection = Mat4::IDENTITY;
        self.tex_offset = None;
        self.mipmaps = false;
        self.frame = Frame::default();
        self.captured = None;
    }

    fn drop_resources(&mut self) -> usize {
        let live = self.textures.len() + self.vbs.len() + self.ibs.len();
        self.textures.clear();
        self.vbs.clear();
        self.ibs.clear();
        live
    }

    fn push_uniforms(&mut self) -> u32 {
        let u = Uniforms::new(&self.fixed, &self.view, &self.projection, self.tex_offset);
        if self.frame.uniforms.last() != Some(&u) {
            self.frame.uniforms.push(u);
        }
        (self.frame.uniforms.len() - 1) as u32
    }

    fn finish_frame(&mut self) {
        self.frame.ops.clear();
        self.frame.uniforms.clear();
        self.frame.arena.clear();
        for vb in self.vbs.values_mut() {
            vb.arena_offset = None;
        }
    }

    fn render_frame(&mut self) -> NativeResult<PresentStatus> {
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(NativeError::DeviceLost);
        };
        if gpu.lost.load(Ordering::Acquire) {
            return Err(NativeError::DeviceLost);
        }
        if self.window.is_minimized() == Some(true) {
            return Ok(PresentStatus::Occluded);
        }

        let output = match self.surface.get_current_texture() {
            wgpu::CurrentSurfaceTexture::Success(f) | wgpu::CurrentSurfaceTexture::Suboptimal(f) => f,
            wgpu::CurrentSurfaceTexture::Lost | wgpu::CurrentSurfaceTexture::Outdated => {
                self.surface.configure(&gpu.device, &gpu.config);
                return Ok(PresentStatus::Occluded);
            }
            wgpu::CurrentSurfaceTexture::Timeout => return Ok(PresentStatus::Occluded),
            wgpu::CurrentSurfaceTexture::Occluded | wgpu::CurrentSurfaceTexture::Validation => {
                return Ok(PresentStatus::Occluded);
            }
        };

        for op in &self.frame.ops {
            if let Op::Draw(d) = op
                && !gpu.pipelines.contains_key(&d.key)
            {
                let pipeline = build_pipeline(gpu, d.key);
                gpu.pipelines.insert(d.key, pipeline);
            }
        }

        upload_uniforms(gpu, &self.frame.uniforms);
        if !self.frame.arena.is_empty() {
            let bytes: &[u8] = bytemuck::cast_slice(&self.frame.arena);
            ensure_arena_capacity(gpu, bytes.len() as u64);
            gpu.queue.write_buffer(&gpu.arena_buffer, 0, bytes);
        }

        let target = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cubegfx frame encoder"),
            });

        // Every clear starts a new pass; draws before the first clear load
        // whatever the target held.
        let mut ops = self.frame.ops.as_slice();
        loop {
            let (clear, rest) = match ops.split_first() {
                Some((Op::Clear(col), rest)) => (Some(*col), rest),
                _ => (None, ops),
            };
            let end = rest
                .iter()
                .position(|op| matches!(op, Op::Clear(_)))
                .unwrap_or(rest.len());
            let (draws, next) = rest.split_at(end);
            encode_pass(gpu, &mut encoder, &target, clear, draws);
            if next.is_empty() {
                break;
            }
            ops = next;
        }

        let readback = if self.screenshot_requested && gpu.can_capture {
            self.screenshot_requested = false;
            Some(start_readback(gpu, &mut encoder, &output.texture))
        } else {
            None
        };

        gpu.queue.submit(Some(encoder.finish()));
        output.present();

        if let Some(rb) = readback {
            self.captured = finish_readback(gpu, rb);
        }
        Ok(PresentStatus::Presented)
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        self.api.name()
    }

    fn caps(&self) -> BackendCaps {
        BackendCaps {
            managed_textures: false,
            strict_pow2: false,
            custom_mipmap_levels: false,
            half_pixel_offset: false,
            depth_bits: 32,
            max_texture_size: self
                .gpu
                .as_ref()
                .map_or(wgpu::Limits::default().max_texture_dimension_2d, |g| {
                    g.device.limits().max_texture_dimension_2d
                }),
        }
    }

    fn create_device(&mut self, params: &PresentParams) -> NativeResult<()> {
        match self.create_gpu(params) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                self.reset_device_state(params.vsync);
                Ok(())
            }
            Err(e) => {
                warn!("{} (wgpu) device creation failed: {e}", self.api.name());
                Err(NativeError::Fault(E_FAIL))
            }
        }
    }

    fn restore_device(&mut self, params: &PresentParams) -> NativeResult<bool> {
        let live = self.drop_resources();
        if live > 0 {
            warn!("{live} resources were still alive at reset; dropping them.");
        }
        self.gpu = None;
        match self.create_gpu(params) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                self.reset_device_state(params.vsync);
                Ok(true)
            }
            Err(e) => {
                debug!("{} (wgpu) device not ready yet: {e}", self.api.name());
                Ok(false)
            }
        }
    }

    fn reset_swapchain(&mut self, params: &PresentParams) -> NativeResult<()> {
        self.vsync = params.vsync;
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(NativeError::DeviceLost);
        };
        if params.width == 0 || params.height == 0 {
            return Ok(());
        }
        let caps = self.surface.get_capabilities(&gpu.adapter);
        let format = pick_format(&caps);
        if format != gpu.config.format {
            gpu.pipelines.clear();
        }
        gpu.config.format = format;
        gpu.config.present_mode = pick_present_mode(&caps.present_modes, params.vsync);
        gpu.config.width = params.width;
        gpu.config.height = params.height;
        self.surface.configure(&gpu.device, &gpu.config);
        gpu.depth_view = scoped_alloc(&gpu.device, || {
            depth_target(&gpu.device, params.width, params.height)
        })?;
        self.captured = None;
        Ok(())
    }

    fn release_device(&mut self) {
        self.drop_resources();
        self.frame = Frame::default();
        self.gpu = None;
        info!("{} (wgpu) backend cleanup complete.", self.api.name());
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> NativeResult<GfxResourceId> {
        let Some(gpu) = self.gpu.as_ref() else {
            return Err(NativeError::DeviceLost);
        };
        let max = gpu.device.limits().max_texture_dimension_2d;
        if desc.width > max || desc.height > max {
            return Err(NativeError::Fault(E_INVALIDARG));
        }
        let (texture, groups) = scoped_alloc(&gpu.device, || {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("cubegfx texture"),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: desc.levels.max(1),
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TEXTURE_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let groups = [
                texture_group(&gpu.device, &gpu.texture_layout, &gpu.samplers[0], &view),
                texture_group(&gpu.device, &gpu.texture_layout, &gpu.samplers[1], &view),
            ];
            (texture, groups)
        })?;

        let id = self.handles.next();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                groups,
                levels: desc.levels.max(1),
            },
        );
        Ok(id)
    }

    fn write_texture(
        &mut self,
        tex: GfxResourceId,
        level: u32,
        rect: &TexelRect<'_>,
    ) -> NativeResult<()> {
        let (Some(gpu), Some(t)) = (self.gpu.as_ref(), self.textures.get(&tex)) else {
            return Ok(());
        };
        if rect.width == 0 || rect.height == 0 {
            return Ok(());
        }
        let level_w = (t.texture.width() >> level).max(1);
        let level_h = (t.texture.height() >> level).max(1);
        let needed = ((rect.height - 1) * rect.row_width + rect.width) as usize;
        if level >= t.levels
            || rect.x + rect.width > level_w
            || rect.y + rect.height > level_h
            || rect.pixels.len() < needed
        {
            return Err(NativeError::Fault(E_INVALIDARG));
        }

        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: level,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&rect.pixels[..needed]),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * rect.row_width),
                rows_per_image: Some(rect.height),
            },
            wgpu::Extent3d {
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn bind_texture(&mut self, tex: GfxResourceId) {
        self.bound_tex = tex;
    }

    fn delete_texture(&mut self, tex: GfxResourceId) -> u32 {
        self.textures.remove(&tex);
        0
    }

    fn set_mipmap_filter(&mut self, enabled: bool) {
        self.mipmaps = enabled;
    }

    fn create_ib(&mut self, indices: &[u16]) -> NativeResult<GfxResourceId> {
        let Some(gpu) = self.gpu.as_ref() else {
            return Err(NativeError::DeviceLost);
        };
        let buffer = scoped_alloc(&gpu.device, || {
            gpu.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("cubegfx index buffer"),
                    contents: bytemuck::cast_slice(indices),
                    usage: wgpu::BufferUsages::INDEX,
                })
        })?;
        let id = self.handles.next();
        self.ibs.insert(id, buffer);
        Ok(id)
    }

    fn bind_ib(&mut self, ib: GfxResourceId) {
        self.bound_ib = ib;
    }

    fn delete_ib(&mut self, ib: GfxResourceId) -> u32 {
        self.ibs.remove(&ib);
        0
    }

    fn create_vb(
        &mut self,
        fmt: VertexFormat,
        count: usize,
        usage: BufferUsage,
    ) -> NativeResult<GfxResourceId> {
        let Some(gpu) = self.gpu.as_ref() else {
            return Err(NativeError::DeviceLost);
        };
        let capacity = fmt.stride() * count;
        let buffer = scoped_alloc(&gpu.device, || {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(match usage {
                    BufferUsage::Static => "cubegfx static vertex buffer",
                    BufferUsage::Dynamic => "cubegfx dynamic vertex buffer",
                }),
                size: align_to(capacity.max(4) as u64, wgpu::COPY_BUFFER_ALIGNMENT),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        let id = self.handles.next();
        self.vbs.insert(
            id,
            GpuVb {
                buffer,
                capacity,
                usage,
                staging: Vec::new(),
                pending: None,
                arena_offset: None,
            },
        );
        Ok(id)
    }

    fn lock_vb(
        &mut self,
        vb: GfxResourceId,
        len: usize,
        mode: LockMode,
    ) -> NativeResult<Option<&mut [u8]>> {
        let Some(buffer) = self.vbs.get_mut(&vb) else {
            return Ok(None);
        };
        if len > buffer.capacity {
            return Err(NativeError::Fault(E_INVALIDARG));
        }
        buffer.pending = Some(mode);
        buffer.staging.clear();
        buffer.staging.resize(len.div_ceil(4), 0);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buffer.staging.as_mut_slice());
        Ok(Some(&mut bytes[..len]))
    }

    fn unlock_vb(&mut self, vb: GfxResourceId) -> NativeResult<()> {
        let (Some(gpu), Some(buffer)) = (self.gpu.as_ref(), self.vbs.get_mut(&vb)) else {
            return Ok(());
        };
        let Some(mode) = buffer.pending.take() else {
            return Ok(());
        };
        if buffer.staging.is_empty() {
            return Ok(());
        }
        gpu.queue
            .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&buffer.staging));
        // Draws recorded earlier this frame must keep seeing their own data,
        // so discarded contents also go to a fresh range of the frame arena.
        if mode == LockMode::Discard {
            buffer.arena_offset = Some((self.frame.arena.len() * 4) as u64);
            self.frame.arena.extend_from_slice(&buffer.staging);
        }
        if buffer.usage == BufferUsage::Static {
            buffer.staging = Vec::new();
        }
        Ok(())
    }

    fn bind_vb(&mut self, vb: GfxResourceId) {
        self.bound_vb = vb;
    }

    fn delete_vb(&mut self, vb: GfxResourceId) -> u32 {
        self.vbs.remove(&vb);
        0
    }

    fn set_vertex_format(&mut self, fmt: VertexFormat) {
        self.format = fmt;
    }

    fn apply_state(&mut self, change: StateChange) {
        let f = &mut self.fixed;
        match change {
            StateChange::FaceCulling(v) => f.face_culling = v,
            StateChange::Fog(v) => f.fog = v,
            StateChange::FogCol(c) => f.fog_col = c,
            StateChange::FogDensity(v) => f.fog_density = v,
            StateChange::FogEnd(v) => f.fog_end = v,
            StateChange::FogMode(m) => f.fog_mode = m,
            StateChange::AlphaTest(v) => f.alpha_test = v,
            StateChange::AlphaBlending(v) => f.alpha_blending = v,
            StateChange::AlphaArgBlend(v) => f.alpha_arg_blend = v,
            StateChange::DepthTest(v) => f.depth_test = v,
            StateChange::DepthWrite(v) => f.depth_write = v,
            StateChange::ColWriteMask(m) => f.write_mask = m,
        }
    }

    fn set_transform(&mut self, slot: MatrixType, matrix: &Mat4) {
        match slot {
            MatrixType::View => self.view = *matrix,
            MatrixType::Projection => self.projection = *matrix,
        }
    }

    fn set_texture_offset(&mut self, offset: Option<(f32, f32)>) {
        self.tex_offset = offset;
    }

    fn begin_scene(&mut self) -> NativeResult<()> {
        match &self.gpu {
            Some(gpu) if !gpu.lost.load(Ordering::Acquire) => Ok(()),
            _ => Err(NativeError::DeviceLost),
        }
    }

    fn clear(&mut self, col: PackedCol) -> NativeResult<()> {
        self.frame.ops.push(Op::Clear(col));
        Ok(())
    }

    fn draw(&mut self, call: DrawCall) {
        let lines = matches!(call, DrawCall::Lines { .. });
        let uniform = self.push_uniforms();
        let Some(gpu) = self.gpu.as_ref() else {
            return;
        };
        let Some(vb) = self.vbs.get(&self.bound_vb) else {
            return;
        };
        let source = match vb.arena_offset {
            Some(offset) => VertexSource::Arena(offset),
            None => VertexSource::Buffer(vb.buffer.clone()),
        };
        let indices = if lines {
            None
        } else {
            let Some(ib) = self.ibs.get(&self.bound_ib) else {
                return;
            };
            Some(ib.clone())
        };
        let texture = (self.format == VertexFormat::Textured).then(|| {
            let slot = usize::from(self.mipmaps);
            self.textures
                .get(&self.bound_tex)
                .map_or_else(|| gpu.white[slot].clone(), |t| t.groups[slot].clone())
        });

        self.frame.ops.push(Op::Draw(DrawOp {
            key: PipelineKey::new(&self.fixed, self.format, lines),
            source,
            indices,
            call,
            texture,
            uniform,
        }));
    }

    fn end_scene_and_present(&mut self) -> NativeResult<PresentStatus> {
        // Arena, uniform and readback buffers grow during replay.
        let device = self.gpu.as_ref().map(|gpu| gpu.device.clone());
        let scope = device
            .as_ref()
            .map(|d| d.push_error_scope(wgpu::ErrorFilter::OutOfMemory));
        let result = self.render_frame();
        self.finish_frame();
        match scope {
            Some(scope) => alloc_status(pollster::block_on(scope.pop())).and(result),
            None => result,
        }
    }

    fn request_capture(&mut self) {
        match &self.gpu {
            Some(gpu) if gpu.can_capture => self.screenshot_requested = true,
            Some(_) => warn!("This surface cannot be read back; screenshots are unavailable."),
            None => {}
        }
    }

    fn capture_frame(&mut self) -> NativeResult<RgbaImage> {
        self.captured.take().ok_or(NativeError::Fault(E_FAIL))
    }

    fn api_info(&self) -> Vec<String> {
        let Some(gpu) = &self.gpu else {
            return vec![format!("{} (wgpu): no device", self.api.name())];
        };
        let info = gpu.adapter.get_info();
        vec![
            format!("Adapter: {}", info.name),
            format!("Backend: {:?} ({:?})", info.backend, info.device_type),
            format!("Driver: {} {}", info.driver, info.driver_info),
            format!(
                "Surface: {}x{} {:?}, {:?}",
                gpu.config.width, gpu.config.height, gpu.config.format, gpu.config.present_mode
            ),
            format!("VSync requested: {}", self.vsync),
        ]
    }

    fn warning(&self) -> Option<String> {
        let gpu = self.gpu.as_ref()?;
        (gpu.adapter.get_info().device_type == wgpu::DeviceType::Cpu).then(|| {
            "wgpu is running on a CPU adapter; expect low frame rates.".to_string()
        })
    }
}

fn encode_pass(
    gpu: &GpuDevice,
    encoder: &mut wgpu::CommandEncoder,
    target: &wgpu::TextureView,
    clear: Option<PackedCol>,
    draws: &[Op],
) {
    let (color_load, depth_load) = match clear {
        Some(col) => {
            let [r, g, b, a] = col.to_f32();
            (
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(r),
                    g: f64::from(g),
                    b: f64::from(b),
                    a: f64::from(a),
                }),
                // Reversed depth: far is 0.
                wgpu::LoadOp::Clear(0.0),
            )
        }
        None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
    };

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("cubegfx pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: target,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations {
                load: color_load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view: &gpu.depth_view,
            depth_ops: Some(wgpu::Operations {
                load: depth_load,
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        }),
        occlusion_query_set: None,
        timestamp_writes: None,
        multiview_mask: None,
    });

    for op in draws {
        let Op::Draw(d) = op else {
            continue;
        };
        let Some(pipeline) = gpu.pipelines.get(&d.key) else {
            continue;
        };
        pass.set_pipeline(pipeline);
        pass.set_bind_group(
            0,
            &gpu.uniform_group,
            &[(u64::from(d.uniform) * gpu.uniform_stride) as u32],
        );
        if let Some(group) = &d.texture {
            pass.set_bind_group(1, group, &[]);
        }
        match &d.source {
            VertexSource::Buffer(buffer) => pass.set_vertex_buffer(0, buffer.slice(..)),
            VertexSource::Arena(offset) => {
                pass.set_vertex_buffer(0, gpu.arena_buffer.slice(*offset..));
            }
        }
        match (d.call, &d.indices) {
            (DrawCall::Lines { vertex_count }, _) => pass.draw(0..vertex_count, 0..1),
            (
                DrawCall::IndexedTris {
                    index_count,
                    start_vertex,
                    ..
                },
                Some(ib),
            ) => {
                pass.set_index_buffer(ib.slice(..), wgpu::IndexFormat::Uint16);
                pass.draw_indexed(0..index_count, start_vertex as i32, 0..1);
            }
            (DrawCall::IndexedTris { .. }, None) => {}
        }
    }
}

fn upload_uniforms(gpu: &mut GpuDevice, uniforms: &[Uniforms]) {
    if uniforms.is_empty() {
        return;
    }
    if uniforms.len() > gpu.uniform_capacity {
        let capacity = uniforms.len().next_power_of_two();
        let (buffer, group) =
            uniform_storage(&gpu.device, &gpu.uniform_layout, gpu.uniform_stride, capacity);
        gpu.uniform_buffer = buffer;
        gpu.uniform_group = group;
        gpu.uniform_capacity = capacity;
    }
    let stride = gpu.uniform_stride as usize;
    let mut bytes = vec![0u8; uniforms.len() * stride];
    for (chunk, u) in bytes.chunks_exact_mut(stride).zip(uniforms) {
        chunk[..UNIFORM_BYTES as usize].copy_from_slice(bytemuck::bytes_of(u));
    }
    gpu.queue.write_buffer(&gpu.uniform_buffer, 0, &bytes);
}

/// Runs a device allocation inside an out-of-memory error scope, so VRAM
/// exhaustion comes back as a result instead of reaching the uncaptured
/// error handler.
fn scoped_alloc<T>(device: &wgpu::Device, alloc: impl FnOnce() -> T) -> NativeResult<T> {
    let scope = device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let value = alloc();
    alloc_status(pollster::block_on(scope.pop()))?;
    Ok(value)
}

fn alloc_status(err: Option<wgpu::Error>) -> NativeResult<()> {
    match err {
        None => Ok(()),
        Some(err @ wgpu::Error::OutOfMemory { .. }) => {
            warn!("wgpu allocation failed: {err}");
            Err(NativeError::OutOfVideoMemory)
        }
        Some(err) => {
            warn!("wgpu allocation raised an unexpected error: {err}");
            Err(NativeError::Fault(E_FAIL))
        }
    }
}

fn ensure_arena_capacity(gpu: &mut GpuDevice, needed: u64) {
    if needed <= gpu.arena_capacity {
        return;
    }
    let capacity = needed.next_power_of_two();
    gpu.arena_buffer = arena_storage(&gpu.device, capacity);
    gpu.arena_capacity = capacity;
}

struct Readback {
    buffer: wgpu::Buffer,
    width: usize,
    height: usize,
    padded_row_bytes: usize,
    format: wgpu::TextureFormat,
}

fn start_readback(
    gpu: &GpuDevice,
    encoder: &mut wgpu::CommandEncoder,
    texture: &wgpu::Texture,
) -> Readback {
    let width = gpu.config.width.max(1);
    let height = gpu.config.height.max(1);
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = (4 * width).div_ceil(align) * align;
    let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cubegfx screenshot readback"),
        size: u64::from(padded_bytes_per_row) * u64::from(height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    Readback {
        buffer,
        width: width as usize,
        height: height as usize,
        padded_row_bytes: padded_bytes_per_row as usize,
        format: gpu.config.format,
    }
}

fn finish_readback(gpu: &GpuDevice, rb: Readback) -> Option<RgbaImage> {
    let slice = rb.buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    let _ = gpu.device.poll(wgpu::PollType::Wait {
        submission_index: None,
        timeout: None,
    });
    if !rx.recv().is_ok_and(|res| res.is_ok()) {
        rb.buffer.unmap();
        warn!("wgpu screenshot readback failed: map_async returned error");
        return None;
    }

    let data = slice.get_mapped_range();
    let row_bytes = rb.width * 4;
    let mut rgba = vec![0u8; row_bytes * rb.height];
    let swap_rb = matches!(
        rb.format,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
    );
    for y in 0..rb.height {
        let src = &data[y * rb.padded_row_bytes..y * rb.padded_row_bytes + row_bytes];
        let dst = &mut rgba[y * row_bytes..(y + 1) * row_bytes];
        dst.copy_from_slice(src);
        if swap_rb {
            for px in dst.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
    }
    drop(data);
    rb.buffer.unmap();
    RgbaImage::from_raw(rb.width as u32, rb.height as u32, rgba)
}

fn build_pipeline(gpu: &GpuDevice, key: PipelineKey) -> wgpu::RenderPipeline {
    let (layout, vs, fs) = match key.format {
        VertexFormat::Coloured => (&gpu.coloured_layout, "vs_coloured", "fs_coloured"),
        VertexFormat::Textured => (&gpu.textured_layout, "vs_textured", "fs_textured"),
    };
    gpu.device
        .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("cubegfx pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: &gpu.shader,
                entry_point: Some(vs),
                buffers: &[vertex_layout(key.format)],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &gpu.shader,
                entry_point: Some(fs),
                targets: &[Some(wgpu::ColorTargetState {
                    format: gpu.config.format,
                    blend: blend_state(key.blend),
                    write_mask: color_writes(key.mask),
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: if key.lines {
                    wgpu::PrimitiveTopology::LineList
                } else {
                    wgpu::PrimitiveTopology::TriangleList
                },
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: key.cull.then_some(wgpu::Face::Back),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(key.depth_state()),
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        })
}

fn texture_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    view: &wgpu::TextureView,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cubegfx texture bind group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(view),
            },
        ],
    })
}

fn uniform_storage(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    stride: u64,
    capacity: usize,
) -> (wgpu::Buffer, wgpu::BindGroup) {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cubegfx uniforms"),
        size: stride * capacity as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cubegfx uniform group"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &buffer,
                offset: 0,
                size: wgpu::BufferSize::new(UNIFORM_BYTES),
            }),
        }],
    });
    (buffer, group)
}

fn arena_storage(device: &wgpu::Device, capacity: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cubegfx frame vertex arena"),
        size: capacity,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn depth_target(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("cubegfx depth buffer"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

fn pick_format(caps: &wgpu::SurfaceCapabilities) -> wgpu::TextureFormat {
    // Avoid sRGB conversion to keep colors consistent across backends.
    caps.formats
        .iter()
        .copied()
        .find(|f| !f.is_srgb())
        .or_else(|| caps.formats.first().copied())
        .unwrap_or(wgpu::TextureFormat::Bgra8Unorm)
}

fn pick_present_mode(modes: &[wgpu::PresentMode], vsync: bool) -> wgpu::PresentMode {
    let preferred = if vsync {
        [
            wgpu::PresentMode::AutoVsync,
            wgpu::PresentMode::Fifo,
            wgpu::PresentMode::FifoRelaxed,
        ]
    } else {
        [
            wgpu::PresentMode::AutoNoVsync,
            wgpu::PresentMode::Immediate,
            wgpu::PresentMode::Mailbox,
        ]
    };

    preferred
        .iter()
        .copied()
        .find(|p| modes.contains(p))
        .or_else(|| modes.first().copied())
        .unwrap_or(wgpu::PresentMode::Fifo)
}

fn blend_state(enabled: bool) -> Option<wgpu::BlendState> {
    enabled.then_some(wgpu::BlendState::ALPHA_BLENDING)
}

fn color_writes(mask: ColorMask) -> wgpu::ColorWrites {
    let mut writes = wgpu::ColorWrites::empty();
    writes.set(wgpu::ColorWrites::RED, mask.contains(ColorMask::R));
    writes.set(wgpu::ColorWrites::GREEN, mask.contains(ColorMask::G));
    writes.set(wgpu::ColorWrites::BLUE, mask.contains(ColorMask::B));
    writes.set(wgpu::ColorWrites::ALPHA, mask.contains(ColorMask::A));
    writes
}

fn sampler_descriptor(mipmaps: bool) -> wgpu::SamplerDescriptor<'static> {
    wgpu::SamplerDescriptor {
        label: Some(if mipmaps {
            "cubegfx mipmapped sampler"
        } else {
            "cubegfx sampler"
        }),
        address_mode_u: wgpu::AddressMode::Repeat,
        address_mode_v: wgpu::AddressMode::Repeat,
        address_mode_w: wgpu::AddressMode::Repeat,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::MipmapFilterMode::Nearest,
        lod_max_clamp: if mipmaps { 32.0 } else { 0.0 },
        ..Default::default()
    }
}

const fn vertex_layout(fmt: VertexFormat) -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: fmt.stride() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: match fmt {
            VertexFormat::Coloured => &COLOURED_ATTRS,
            VertexFormat::Textured => &TEXTURED_ATTRS,
        },
    }
}

const COLOURED_ATTRS: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![
    0 => Float32x3, // pos
    1 => Unorm8x4,  // packed colour
];

const TEXTURED_ATTRS: [wgpu::VertexAttribute; 3] = wgpu::vertex_attr_array![
    0 => Float32x3, // pos
    1 => Unorm8x4,  // packed colour
    2 => Float32x2, // uv
];

#[inline(always)]
const fn align_to(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_allocations_report_video_memory_exhaustion() {
        let oom = wgpu::Error::OutOfMemory {
            source: Box::new(std::io::Error::other("vram exhausted")),
        };
        assert_eq!(alloc_status(Some(oom)), Err(NativeError::OutOfVideoMemory));
        assert_eq!(alloc_status(None), Ok(()));
        assert!(NativeError::OutOfVideoMemory.is_exhaustion());
    }

    #[test]
    fn scoped_allocation_on_real_adapter() {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::empty(),
            memory_budget_thresholds: Default::default(),
            backend_options: Default::default(),
            display: None,
        });
        let Ok(adapter) = pollster::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        )) else {
            eprintln!("no wgpu adapter available; skipping");
            return;
        };
        let Ok((device, _queue)) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
        else {
            eprintln!("wgpu device request failed; skipping");
            return;
        };
        let buffer = scoped_alloc(&device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("scoped test buffer"),
                size: 256,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })
        .expect("small allocation should succeed");
        assert_eq!(buffer.size(), 256);
    }

    #[test]
    fn disabled_depth_test_never_writes_depth() {
        let mut st = FixedState {
            depth_test: false,
            ..FixedState::default()
        };
        let off = PipelineKey::new(&st, VertexFormat::Coloured, false).depth_state();
        assert_eq!(off.depth_compare, Some(wgpu::CompareFunction::Always));
        assert_eq!(off.depth_write_enabled, Some(false));

        st.depth_test = true;
        let on = PipelineKey::new(&st, VertexFormat::Coloured, false).depth_state();
        assert_eq!(on.depth_compare, Some(wgpu::CompareFunction::GreaterEqual));
        assert_eq!(on.depth_write_enabled, Some(true));
    }

    #[test]
    fn pipeline_keys_follow_fixed_state() {
        let st = FixedState::default();
        let base = PipelineKey::new(&st, VertexFormat::Textured, false);
        let blended = PipelineKey::new(
            &FixedState {
                alpha_blending: true,
                ..st
            },
            VertexFormat::Textured,
            false,
        );
        assert_ne!(base, blended);
        // Fog and alpha test live in uniforms, not in the pipeline.
        let fogged = PipelineKey::new(
            &FixedState {
                fog: true,
                alpha_test: true,
                ..st
            },
            VertexFormat::Textured,
            false,
        );
        assert_eq!(base, fogged);
    }

    #[test]
    fn color_mask_maps_per_channel() {
        let writes = color_writes(ColorMask::R | ColorMask::A);
        assert_eq!(writes, wgpu::ColorWrites::RED | wgpu::ColorWrites::ALPHA);
        assert_eq!(color_writes(ColorMask::all()), wgpu::ColorWrites::ALL);
    }

    #[test]
    fn blending_is_src_alpha_over() {
        assert_eq!(blend_state(false), None);
        let blend = blend_state(true).expect("blend state");
        assert_eq!(blend.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
    }

    #[test]
    fn present_mode_prefers_vsync_modes() {
        let modes = [wgpu::PresentMode::Immediate, wgpu::PresentMode::Fifo];
        assert_eq!(pick_present_mode(&modes, true), wgpu::PresentMode::Fifo);
        assert_eq!(pick_present_mode(&modes, false), wgpu::PresentMode::Immediate);
        assert_eq!(
            pick_present_mode(&[wgpu::PresentMode::Mailbox], true),
            wgpu::PresentMode::Mailbox
        );
        assert_eq!(pick_present_mode(&[], false), wgpu::PresentMode::Fifo);
    }

    #[test]
    fn uniforms_encode_fog_and_alpha_flags() {
        let st = FixedState {
            fog: true,
            fog_mode: FogFunc::Exp2,
            fog_density: 0.25,
            fog_end: 96.0,
            alpha_test: true,
            ..FixedState::default()
        };
        let view = Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -5.0));
        let u = Uniforms::new(&st, &view, &Mat4::IDENTITY, Some((0.5, 0.0)));
        assert_eq!(u.fog, [1.0, 2.0, 0.25, 96.0]);
        assert_eq!(u.params, [0.5, 0.0, 1.0, 0.0]);
        // Third view row yields eye-space z.
        assert_eq!(u.view_z, [0.0, 0.0, 1.0, -5.0]);
    }

    #[test]
    fn uniform_block_matches_shader_layout() {
        assert_eq!(UNIFORM_BYTES, 128);
        assert_eq!(align_to(UNIFORM_BYTES, 256), 256);
        assert_eq!(align_to(100, 0), 100);
    }

    #[test]
    fn vertex_layouts_match_formats() {
        assert_eq!(vertex_layout(VertexFormat::Coloured).array_stride, 16);
        assert_eq!(vertex_layout(VertexFormat::Textured).array_stride, 24);
        assert_eq!(TEXTURED_ATTRS[2].offset, 16);
    }
}
