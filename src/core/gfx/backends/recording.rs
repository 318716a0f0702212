//! Call-counting backend for tests. Every native call is appended to a log
//! shared with the test, and failures can be injected through it.

use crate::core::gfx::{
    DrawCall, GfxResourceId, MatrixType, PackedCol, VertexFormat,
    backends::{
        Backend, BackendCaps, BufferUsage, HandleAlloc, LockMode, PresentParams, PresentStatus,
        TextureDesc,
    },
    bitmap::{BitmapCol, TexelRect},
    error::{NativeError, NativeResult},
    state::StateChange,
};
use glam::Mat4;
use image::RgbaImage;
use rustc_hash::FxHashMap;
use std::{cell::RefCell, rc::Rc};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateDevice,
    RestoreDevice,
    ResetSwapchain(PresentParams),
    ReleaseDevice,
    CreateTexture(TextureDesc),
    WriteTexture(GfxResourceId, u32),
    BindTexture(GfxResourceId),
    DeleteTexture(GfxResourceId),
    MipmapFilter(bool),
    CreateIb(usize),
    BindIb(GfxResourceId),
    DeleteIb(GfxResourceId),
    CreateVb(VertexFormat, usize, BufferUsage),
    Lock(GfxResourceId, usize, LockMode),
    Unlock(GfxResourceId),
    BindVb(GfxResourceId),
    DeleteVb(GfxResourceId),
    VertexFormat(VertexFormat),
    State(StateChange),
    Transform(MatrixType),
    TextureOffset(Option<(f32, f32)>),
    BeginScene,
    Clear(PackedCol),
    Draw(DrawCall),
    Present,
    Capture,
}

struct Inner {
    calls: Vec<Call>,
    outstanding_refs: u32,
    fail_next_create: Option<NativeError>,
    fail_next_write: Option<NativeError>,
    create_device: NativeResult<()>,
    restore: NativeResult<bool>,
    reset: NativeResult<()>,
    present: NativeResult<PresentStatus>,
    texture_levels: FxHashMap<(GfxResourceId, u32), Vec<BitmapCol>>,
}

/// Test-side handle onto the recording backend.
#[derive(Clone)]
pub struct CallLog(Rc<RefCell<Inner>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().calls.clear();
    }

    pub fn set_outstanding_refs(&self, refs: u32) {
        self.0.borrow_mut().outstanding_refs = refs;
    }

    /// The next texture/buffer creation fails with `err`.
    pub fn fail_next_create(&self, err: NativeError) {
        self.0.borrow_mut().fail_next_create = Some(err);
    }

    /// The next texture upload fails with `err`.
    pub fn fail_next_write(&self, err: NativeError) {
        self.0.borrow_mut().fail_next_write = Some(err);
    }

    pub fn set_create_device_result(&self, res: NativeResult<()>) {
        self.0.borrow_mut().create_device = res;
    }

    pub fn set_restore_result(&self, res: NativeResult<bool>) {
        self.0.borrow_mut().restore = res;
    }

    pub fn set_reset_result(&self, res: NativeResult<()>) {
        self.0.borrow_mut().reset = res;
    }

    pub fn set_present_result(&self, res: NativeResult<PresentStatus>) {
        self.0.borrow_mut().present = res;
    }

    /// Pixels last written to one mip level of a texture.
    pub fn texture_level(&self, tex: GfxResourceId, level: u32) -> Option<Vec<BitmapCol>> {
        self.0.borrow().texture_levels.get(&(tex, level)).cloned()
    }
}

pub struct RecordingBackend {
    log: CallLog,
    handles: HandleAlloc,
    staging: FxHashMap<GfxResourceId, Vec<u32>>,
}

impl RecordingBackend {
    pub fn new() -> (Self, CallLog) {
        let log = CallLog(Rc::new(RefCell::new(Inner {
            calls: Vec::new(),
            outstanding_refs: 0,
            fail_next_create: None,
            fail_next_write: None,
            create_device: Ok(()),
            restore: Ok(true),
            reset: Ok(()),
            present: Ok(PresentStatus::Presented),
            texture_levels: FxHashMap::default(),
        })));
        let backend = Self {
            log: log.clone(),
            handles: HandleAlloc::default(),
            staging: FxHashMap::default(),
        };
        (backend, log)
    }

    fn record(&self, call: Call) {
        self.log.0.borrow_mut().calls.push(call);
    }

    fn allocate(&mut self, call: Call) -> NativeResult<GfxResourceId> {
        self.record(call);
        if let Some(err) = self.log.0.borrow_mut().fail_next_create.take() {
            return Err(err);
        }
        Ok(self.handles.next())
    }

    fn refs(&self) -> u32 {
        self.log.0.borrow().outstanding_refs
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "Recording"
    }

    fn caps(&self) -> BackendCaps {
        BackendCaps {
            managed_textures: true,
            strict_pow2: true,
            custom_mipmap_levels: true,
            half_pixel_offset: true,
            depth_bits: 24,
            max_texture_size: 4096,
        }
    }

    fn create_device(&mut self, _params: &PresentParams) -> NativeResult<()> {
        self.record(Call::CreateDevice);
        self.log.0.borrow().create_device
    }

    fn restore_device(&mut self, _params: &PresentParams) -> NativeResult<bool> {
        self.record(Call::RestoreDevice);
        self.log.0.borrow().restore
    }

    fn reset_swapchain(&mut self, params: &PresentParams) -> NativeResult<()> {
        self.record(Call::ResetSwapchain(*params));
        self.log.0.borrow().reset
    }

    fn release_device(&mut self) {
        self.staging.clear();
        self.record(Call::ReleaseDevice);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> NativeResult<GfxResourceId> {
        self.allocate(Call::CreateTexture(*desc))
    }

    fn write_texture(
        &mut self,
        tex: GfxResourceId,
        level: u32,
        rect: &TexelRect<'_>,
    ) -> NativeResult<()> {
        self.record(Call::WriteTexture(tex, level));
        if let Some(err) = self.log.0.borrow_mut().fail_next_write.take() {
            return Err(err);
        }
        let pixels = (0..rect.height).flat_map(|y| rect.row(y).iter().copied()).collect();
        self.log
            .0
            .borrow_mut()
            .texture_levels
            .insert((tex, level), pixels);
        Ok(())
    }

    fn bind_texture(&mut self, tex: GfxResourceId) {
        self.record(Call::BindTexture(tex));
    }

    fn delete_texture(&mut self, tex: GfxResourceId) -> u32 {
        self.record(Call::DeleteTexture(tex));
        self.refs()
    }

    fn set_mipmap_filter(&mut self, enabled: bool) {
        self.record(Call::MipmapFilter(enabled));
    }

    fn create_ib(&mut self, indices: &[u16]) -> NativeResult<GfxResourceId> {
        self.allocate(Call::CreateIb(indices.len()))
    }

    fn bind_ib(&mut self, ib: GfxResourceId) {
        self.record(Call::BindIb(ib));
    }

    fn delete_ib(&mut self, ib: GfxResourceId) -> u32 {
        self.record(Call::DeleteIb(ib));
        self.refs()
    }

    fn create_vb(
        &mut self,
        fmt: VertexFormat,
        count: usize,
        usage: BufferUsage,
    ) -> NativeResult<GfxResourceId> {
        self.allocate(Call::CreateVb(fmt, count, usage))
    }

    fn lock_vb(
        &mut self,
        vb: GfxResourceId,
        len: usize,
        mode: LockMode,
    ) -> NativeResult<Option<&mut [u8]>> {
        self.record(Call::Lock(vb, len, mode));
        let words = self.staging.entry(vb).or_default();
        words.resize(len.div_ceil(4), 0);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
        Ok(Some(&mut bytes[..len]))
    }

    fn unlock_vb(&mut self, vb: GfxResourceId) -> NativeResult<()> {
        self.record(Call::Unlock(vb));
        Ok(())
    }

    fn bind_vb(&mut self, vb: GfxResourceId) {
        self.record(Call::BindVb(vb));
    }

    fn delete_vb(&mut self, vb: GfxResourceId) -> u32 {
        self.staging.remove(&vb);
        self.record(Call::DeleteVb(vb));
        self.refs()
    }

    fn set_vertex_format(&mut self, fmt: VertexFormat) {
        self.record(Call::VertexFormat(fmt));
    }

    fn apply_state(&mut self, change: StateChange) {
        self.record(Call::State(change));
    }

    fn set_transform(&mut self, slot: MatrixType, _matrix: &Mat4) {
        self.record(Call::Transform(slot));
    }

    fn set_texture_offset(&mut self, offset: Option<(f32, f32)>) {
        self.record(Call::TextureOffset(offset));
    }

    fn begin_scene(&mut self) -> NativeResult<()> {
        self.record(Call::BeginScene);
        Ok(())
    }

    fn clear(&mut self, col: PackedCol) -> NativeResult<()> {
        self.record(Call::Clear(col));
        Ok(())
    }

    fn draw(&mut self, call: DrawCall) {
        self.record(Call::Draw(call));
    }

    fn end_scene_and_present(&mut self) -> NativeResult<PresentStatus> {
        self.record(Call::Present);
        self.log.0.borrow().present
    }

    fn capture_frame(&mut self) -> NativeResult<RgbaImage> {
        self.record(Call::Capture);
        Ok(RgbaImage::new(2, 2))
    }

    fn api_info(&self) -> Vec<String> {
        vec!["Recording backend".to_string()]
    }
}
