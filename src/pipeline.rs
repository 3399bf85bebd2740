//! Per-frame processing: crop, scale, readback and publish.
//!
//! The pipeline is written against two seams so it can run without a GPU:
//! [`FrameGpu`] covers the device work and [`FrameSource`] covers frame
//! retrieval from the capture service. The Windows backend implements
//! both on top of D3D11 and WGC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, trace, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::exchange::{FrameExchange, PublishOutcome};
use crate::frame::{FrameDescriptor, SourceFrame, validate_source_dimensions};
use crate::geometry::CropRect;
use crate::readback::{MappedSurface, compact_rows};
use crate::settings::{CaptureSettings, FrameSettings};

/// What a cached working texture is used for. Each purpose owns at most one
/// live texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TexturePurpose {
    /// Shareable GPU texture holding the cropped sub-rectangle.
    Crop,
    /// Shareable render target the scale pass draws into.
    ScaleTarget,
    /// CPU-readable texture used for readback.
    Staging,
}

impl TexturePurpose {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::ScaleTarget => "scale-target",
            Self::Staging => "staging",
        }
    }
}

/// GPU operations the pipeline needs. All calls come from the single
/// producer thread that holds the pipeline's worker lock.
pub trait FrameGpu {
    type Texture: Clone;
    type Scaler;

    fn create_texture(
        &mut self,
        purpose: TexturePurpose,
        width: u32,
        height: u32,
    ) -> BridgeResult<Self::Texture>;

    /// Copies `rect` of `src` to the origin of `dst`.
    fn copy_region(
        &mut self,
        dst: &Self::Texture,
        src: &Self::Texture,
        rect: CropRect,
    ) -> BridgeResult<()>;

    /// Builds the textured-quad scale pipeline.
    fn build_scaler(&mut self) -> BridgeResult<Self::Scaler>;

    /// Draws `src` stretched over the whole of `dst` (`width` x `height`).
    fn render_scaled(
        &mut self,
        scaler: &Self::Scaler,
        src: &Self::Texture,
        dst: &Self::Texture,
        width: u32,
        height: u32,
    ) -> BridgeResult<()>;

    fn copy_resource(&mut self, dst: &Self::Texture, src: &Self::Texture) -> BridgeResult<()>;

    fn flush(&mut self);

    /// Maps `staging` for reading and hands the mapping to `read`. The
    /// texture is unmapped before this returns.
    fn read_mapped<R, F>(&mut self, staging: &Self::Texture, read: F) -> BridgeResult<R>
    where
        F: FnOnce(MappedSurface<'_>) -> BridgeResult<R>;
}

/// Pulls frames from the capture service. Dropping a `Guard` hands the
/// frame's buffer back to the service.
pub trait FrameSource {
    type Texture;
    type Guard;

    fn try_next_frame(&mut self) -> BridgeResult<Option<(SourceFrame<Self::Texture>, Self::Guard)>>;
}

#[derive(Debug)]
struct CachedTexture<T> {
    texture: T,
    width: u32,
    height: u32,
}

/// Single-owner cache for one working texture, keyed by dimensions.
#[derive(Debug)]
pub struct TextureSlot<T> {
    purpose: TexturePurpose,
    cached: Option<CachedTexture<T>>,
}

impl<T: Clone> TextureSlot<T> {
    pub const fn new(purpose: TexturePurpose) -> Self {
        Self {
            purpose,
            cached: None,
        }
    }

    /// Returns the cached texture when its size matches, otherwise releases
    /// it and creates a replacement. A failed creation leaves the slot empty.
    pub fn ensure<G>(&mut self, gpu: &mut G, width: u32, height: u32) -> BridgeResult<T>
    where
        G: FrameGpu<Texture = T>,
    {
        if let Some(cached) = &self.cached
            && cached.width == width
            && cached.height == height
        {
            return Ok(cached.texture.clone());
        }

        self.cached = None;
        let texture = gpu.create_texture(self.purpose, width, height)?;
        debug!(
            purpose = self.purpose.as_str(),
            width, height, "working texture created"
        );
        self.cached = Some(CachedTexture {
            texture: texture.clone(),
            width,
            height,
        });
        Ok(texture)
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.cached.as_ref().map(|c| (c.width, c.height))
    }
}

/// One-shot lifecycle of the scale pipeline. A failed build is final.
#[derive(Debug)]
pub enum ScalerState<S> {
    Unbuilt,
    Ready(S),
    Failed,
}

impl<S> ScalerState<S> {
    fn get_or_build<F>(&mut self, build: F) -> Option<&S>
    where
        F: FnOnce() -> BridgeResult<S>,
    {
        if matches!(self, Self::Unbuilt) {
            *self = match build() {
                Ok(scaler) => {
                    debug!("scale pipeline built");
                    Self::Ready(scaler)
                }
                Err(err) => {
                    warn!(error = %err, "scale pipeline build failed; frames stay unscaled");
                    Self::Failed
                }
            };
        }
        match self {
            Self::Ready(scaler) => Some(scaler),
            Self::Unbuilt | Self::Failed => None,
        }
    }
}

/// State shared between the producer callback and consumers.
#[derive(Debug, Default)]
pub struct BridgeState {
    closing: AtomicBool,
    pub settings: CaptureSettings,
    pub exchange: FrameExchange,
}

impl BridgeState {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            closing: AtomicBool::new(false),
            settings,
            exchange: FrameExchange::new(),
        }
    }

    /// Marks the session as closing. Returns `true` for the first caller.
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Result of one frame-arrived notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Closing,
    /// Another notification is still processing.
    Busy,
    NoFrame,
    Rejected { width: u32, height: u32 },
    ReadbackFailed,
    Published { frame_count: u64, width: u32, height: u32 },
    Dropped { readers: usize },
}

struct Worker<G: FrameGpu> {
    gpu: G,
    crop: TextureSlot<G::Texture>,
    scale_target: TextureSlot<G::Texture>,
    staging: TextureSlot<G::Texture>,
    scaler: ScalerState<G::Scaler>,
    back_buffer: Vec<u8>,
}

impl<G: FrameGpu> Worker<G> {
    fn crop(&mut self, src: &G::Texture, rect: CropRect) -> BridgeResult<G::Texture> {
        let target = self.crop.ensure(&mut self.gpu, rect.width, rect.height)?;
        self.gpu.copy_region(&target, src, rect)?;
        Ok(target)
    }

    fn scale(&mut self, src: &G::Texture, width: u32, height: u32) -> BridgeResult<G::Texture> {
        let gpu = &mut self.gpu;
        if self.scaler.get_or_build(|| gpu.build_scaler()).is_none() {
            return Err(BridgeError::BackendUnavailable(
                "scale pipeline unavailable".into(),
            ));
        }
        let target = self.scale_target.ensure(&mut self.gpu, width, height)?;
        let ScalerState::Ready(scaler) = &self.scaler else {
            return Err(BridgeError::BackendUnavailable(
                "scale pipeline unavailable".into(),
            ));
        };
        self.gpu.render_scaled(scaler, src, &target, width, height)?;
        Ok(target)
    }

    /// Copies `texture` through the staging slot into the back buffer.
    fn read_back(&mut self, texture: &G::Texture, width: u32, height: u32) -> BridgeResult<()> {
        let staging = self.staging.ensure(&mut self.gpu, width, height)?;
        self.gpu.copy_resource(&staging, texture)?;
        self.gpu.flush();
        let desc = FrameDescriptor::bgra(width, height);
        let back = &mut self.back_buffer;
        self.gpu
            .read_mapped(&staging, |mapped| compact_rows(mapped, &desc, back))
    }
}

/// The producer side of a session.
pub struct FramePipeline<G: FrameGpu> {
    state: Arc<BridgeState>,
    worker: Mutex<Worker<G>>,
    latest_texture: Mutex<Option<G::Texture>>,
}

impl<G: FrameGpu> FramePipeline<G> {
    pub fn new(gpu: G, state: Arc<BridgeState>) -> Self {
        Self {
            state,
            worker: Mutex::new(Worker {
                gpu,
                crop: TextureSlot::new(TexturePurpose::Crop),
                scale_target: TextureSlot::new(TexturePurpose::ScaleTarget),
                staging: TextureSlot::new(TexturePurpose::Staging),
                scaler: ScalerState::Unbuilt,
                back_buffer: Vec::new(),
            }),
            latest_texture: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// The most recent post-crop, post-scale texture.
    pub fn latest_texture(&self) -> Option<G::Texture> {
        self.lock_latest_texture().clone()
    }

    fn lock_latest_texture(&self) -> MutexGuard<'_, Option<G::Texture>> {
        match self.latest_texture.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_latest_texture(&self, texture: &G::Texture) {
        *self.lock_latest_texture() = Some(texture.clone());
    }

    /// Handles one frame-arrived notification. Never blocks on consumers
    /// and never surfaces errors; the outcome is for logging and tests.
    pub fn on_frame_arrived<S>(&self, source: &mut S) -> FrameOutcome
    where
        S: FrameSource<Texture = G::Texture>,
    {
        if self.state.is_closing() {
            return FrameOutcome::Closing;
        }

        let mut worker = match self.worker.try_lock() {
            Ok(worker) => worker,
            Err(TryLockError::WouldBlock) => {
                trace!("frame notification skipped: previous frame still processing");
                return FrameOutcome::Busy;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let Some((frame, _guard)) = newest_frame(source) else {
            return FrameOutcome::NoFrame;
        };

        if let Err(err) = validate_source_dimensions(frame.width, frame.height) {
            trace!(error = %err, "frame rejected");
            return FrameOutcome::Rejected {
                width: frame.width,
                height: frame.height,
            };
        }

        let settings = self.state.settings.snapshot();
        self.process(&mut worker, frame, settings)
    }

    fn process(
        &self,
        worker: &mut Worker<G>,
        frame: SourceFrame<G::Texture>,
        settings: FrameSettings,
    ) -> FrameOutcome {
        let SourceFrame {
            texture: mut current,
            mut width,
            mut height,
        } = frame;

        if let Some(rect) = settings.crop.within_source(width, height) {
            match worker.crop(&current, rect) {
                Ok(cropped) => {
                    current = cropped;
                    width = rect.width;
                    height = rect.height;
                }
                Err(err) => warn!(error = %err, ?rect, "crop skipped for this frame"),
            }
        }
        self.record_latest_texture(&current);

        if let Some((target_width, target_height)) = settings.max_bound.fit(width, height) {
            match worker.scale(&current, target_width, target_height) {
                Ok(scaled) => {
                    self.record_latest_texture(&scaled);
                    match worker.read_back(&scaled, target_width, target_height) {
                        Ok(()) => return self.publish(worker, target_width, target_height),
                        Err(err) => warn!(error = %err, "scaled readback failed"),
                    }
                }
                Err(BridgeError::BackendUnavailable(_)) => {}
                Err(err) => warn!(error = %err, "scale pass failed"),
            }
        }

        match worker.read_back(&current, width, height) {
            Ok(()) => self.publish(worker, width, height),
            Err(err) => {
                warn!(error = %err, width, height, "readback failed; frame dropped");
                FrameOutcome::ReadbackFailed
            }
        }
    }

    fn publish(&self, worker: &mut Worker<G>, width: u32, height: u32) -> FrameOutcome {
        match self
            .state
            .exchange
            .publish(&mut worker.back_buffer, width, height)
        {
            PublishOutcome::Published { frame_count } => FrameOutcome::Published {
                frame_count,
                width,
                height,
            },
            PublishOutcome::Dropped { readers } => FrameOutcome::Dropped { readers },
        }
    }
}

/// Drains every queued frame, returning only the newest. Older frames are
/// handed back to the service as soon as a newer one is seen.
fn newest_frame<S: FrameSource>(source: &mut S) -> Option<(SourceFrame<S::Texture>, S::Guard)> {
    let mut newest = None;
    loop {
        match source.try_next_frame() {
            Ok(Some(frame)) => newest = Some(frame),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to retrieve next frame");
                break;
            }
        }
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_DIMENSION;
    use crate::geometry::MaxBound;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct MockSurface {
        purpose: Option<TexturePurpose>,
        width: u32,
        height: u32,
        pixels: Mutex<Vec<u8>>,
    }

    #[derive(Clone, Debug)]
    struct MockTexture(Arc<MockSurface>);

    impl MockTexture {
        fn blank(purpose: Option<TexturePurpose>, width: u32, height: u32) -> Self {
            Self(Arc::new(MockSurface {
                purpose,
                width,
                height,
                pixels: Mutex::new(vec![0; width as usize * height as usize * 4]),
            }))
        }

        /// Each pixel encodes its own coordinates.
        fn source(width: u32, height: u32) -> Self {
            let texture = Self::blank(None, width, height);
            {
                let mut pixels = texture.0.pixels.lock().unwrap();
                for y in 0..height {
                    for x in 0..width {
                        let offset = (y as usize * width as usize + x as usize) * 4;
                        pixels[offset..offset + 4].copy_from_slice(&encode(x, y));
                    }
                }
            }
            texture
        }

        fn pixels(&self) -> Vec<u8> {
            self.0.pixels.lock().unwrap().clone()
        }
    }

    fn encode(x: u32, y: u32) -> [u8; 4] {
        [x as u8, (x >> 8) as u8, y as u8, (y >> 8) as u8]
    }

    fn decode(pixel: &[u8]) -> (u32, u32) {
        (
            pixel[0] as u32 | (pixel[1] as u32) << 8,
            pixel[2] as u32 | (pixel[3] as u32) << 8,
        )
    }

    struct MockScaler;

    #[derive(Default)]
    struct GpuLog {
        created: Vec<(TexturePurpose, u32, u32)>,
        scaler_builds: usize,
        renders: usize,
    }

    #[derive(Default)]
    struct MockGpu {
        log: Arc<Mutex<GpuLog>>,
        fail_purpose: Option<TexturePurpose>,
        fail_staging_size: Option<(u32, u32)>,
        fail_scaler: bool,
        row_padding: usize,
    }

    impl MockGpu {
        fn padded(row_padding: usize) -> Self {
            Self {
                row_padding,
                ..Self::default()
            }
        }
    }

    impl FrameGpu for MockGpu {
        type Texture = MockTexture;
        type Scaler = MockScaler;

        fn create_texture(
            &mut self,
            purpose: TexturePurpose,
            width: u32,
            height: u32,
        ) -> BridgeResult<MockTexture> {
            if self.fail_purpose == Some(purpose)
                || (purpose == TexturePurpose::Staging
                    && self.fail_staging_size == Some((width, height)))
            {
                return Err(BridgeError::Platform(anyhow::anyhow!(
                    "mock {} allocation failure",
                    purpose.as_str()
                )));
            }
            self.log
                .lock()
                .unwrap()
                .created
                .push((purpose, width, height));
            Ok(MockTexture::blank(Some(purpose), width, height))
        }

        fn copy_region(
            &mut self,
            dst: &MockTexture,
            src: &MockTexture,
            rect: CropRect,
        ) -> BridgeResult<()> {
            assert!(rect.right() <= src.0.width && rect.bottom() <= src.0.height);
            assert_eq!((dst.0.width, dst.0.height), (rect.width, rect.height));
            let src_pixels = src.pixels();
            let mut dst_pixels = dst.0.pixels.lock().unwrap();
            let row_bytes = rect.width as usize * 4;
            for row in 0..rect.height as usize {
                let src_offset =
                    ((rect.y as usize + row) * src.0.width as usize + rect.x as usize) * 4;
                dst_pixels[row * row_bytes..(row + 1) * row_bytes]
                    .copy_from_slice(&src_pixels[src_offset..src_offset + row_bytes]);
            }
            Ok(())
        }

        fn build_scaler(&mut self) -> BridgeResult<MockScaler> {
            self.log.lock().unwrap().scaler_builds += 1;
            if self.fail_scaler {
                return Err(BridgeError::Platform(anyhow::anyhow!(
                    "mock shader compile failure"
                )));
            }
            Ok(MockScaler)
        }

        fn render_scaled(
            &mut self,
            _scaler: &MockScaler,
            src: &MockTexture,
            dst: &MockTexture,
            width: u32,
            height: u32,
        ) -> BridgeResult<()> {
            self.log.lock().unwrap().renders += 1;
            assert_eq!(dst.0.purpose, Some(TexturePurpose::ScaleTarget));
            let src_pixels = src.pixels();
            let mut dst_pixels = dst.0.pixels.lock().unwrap();
            for y in 0..height as usize {
                let sy = y * src.0.height as usize / height as usize;
                for x in 0..width as usize {
                    let sx = x * src.0.width as usize / width as usize;
                    let s = (sy * src.0.width as usize + sx) * 4;
                    let d = (y * width as usize + x) * 4;
                    dst_pixels[d..d + 4].copy_from_slice(&src_pixels[s..s + 4]);
                }
            }
            Ok(())
        }

        fn copy_resource(&mut self, dst: &MockTexture, src: &MockTexture) -> BridgeResult<()> {
            assert_eq!(
                (dst.0.width, dst.0.height),
                (src.0.width, src.0.height),
                "copy_resource requires matching sizes"
            );
            *dst.0.pixels.lock().unwrap() = src.pixels();
            Ok(())
        }

        fn flush(&mut self) {}

        fn read_mapped<R, F>(&mut self, staging: &MockTexture, read: F) -> BridgeResult<R>
        where
            F: FnOnce(MappedSurface<'_>) -> BridgeResult<R>,
        {
            assert_eq!(staging.0.purpose, Some(TexturePurpose::Staging));
            let row_bytes = staging.0.width as usize * 4;
            let row_pitch = row_bytes + self.row_padding;
            let tight = staging.pixels();
            let mut mapped = vec![0xCD; row_pitch * staging.0.height as usize];
            for (row, chunk) in tight.chunks(row_bytes).enumerate() {
                mapped[row * row_pitch..row * row_pitch + row_bytes].copy_from_slice(chunk);
            }
            read(MappedSurface {
                data: &mapped,
                row_pitch,
            })
        }
    }

    struct MockSource {
        frames: VecDeque<SourceFrame<MockTexture>>,
        closed: Arc<AtomicUsize>,
    }

    struct MockGuard(Arc<AtomicUsize>);

    impl Drop for MockGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                frames: VecDeque::new(),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_frame(width: u32, height: u32) -> Self {
            let mut source = Self::new();
            source.push(width, height);
            source
        }

        fn push(&mut self, width: u32, height: u32) {
            let texture = if width == 0 || height == 0 || width > MAX_DIMENSION {
                MockTexture::blank(None, 1, 1)
            } else {
                MockTexture::source(width, height)
            };
            self.frames.push_back(SourceFrame {
                texture,
                width,
                height,
            });
        }
    }

    impl FrameSource for MockSource {
        type Texture = MockTexture;
        type Guard = MockGuard;

        fn try_next_frame(
            &mut self,
        ) -> BridgeResult<Option<(SourceFrame<MockTexture>, MockGuard)>> {
            Ok(self
                .frames
                .pop_front()
                .map(|frame| (frame, MockGuard(Arc::clone(&self.closed)))))
        }
    }

    fn pipeline(gpu: MockGpu) -> FramePipeline<MockGpu> {
        FramePipeline::new(gpu, Arc::new(BridgeState::default()))
    }

    fn published(outcome: FrameOutcome) -> (u64, u32, u32) {
        match outcome {
            FrameOutcome::Published {
                frame_count,
                width,
                height,
            } => (frame_count, width, height),
            other => panic!("expected a publish, got {other:?}"),
        }
    }

    #[test]
    fn unbounded_frame_is_published_unscaled() {
        let pipeline = pipeline(MockGpu::padded(64));
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(1920, 1080));
        assert_eq!(published(outcome), (1, 1920, 1080));

        let exchange = &pipeline.state().exchange;
        let lease = exchange.acquire().unwrap();
        assert_eq!(lease.descriptor(), FrameDescriptor::bgra(1920, 1080));
        assert_eq!(lease.len(), 1920 * 1080 * 4);
        assert_eq!(&lease[..], &MockTexture::source(1920, 1080).pixels()[..]);
    }

    #[test]
    fn uhd_frame_is_scaled_into_full_hd_bound() {
        let pipeline = pipeline(MockGpu::default());
        pipeline
            .state()
            .settings
            .set_max_bound(MaxBound::new(1920, 1080));
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(3840, 2160));
        assert_eq!(published(outcome), (1, 1920, 1080));

        let latest = pipeline.latest_texture().unwrap();
        assert_eq!(latest.0.purpose, Some(TexturePurpose::ScaleTarget));

        let mut out = vec![0u8; 1920 * 1080 * 4];
        pipeline.state().exchange.copy_out(&mut out).unwrap();
        let last = (1080 * 1920 - 1) * 4;
        assert_eq!(decode(&out[0..4]), (0, 0));
        assert_eq!(decode(&out[last..last + 4]), (3838, 2158));
    }

    #[test]
    fn crop_output_matches_requested_rectangle() {
        let pipeline = pipeline(MockGpu::padded(32));
        pipeline.state().settings.set_crop_rect(100, 100, 640, 480);
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(1920, 1080));
        assert_eq!(published(outcome), (1, 640, 480));

        let lease = pipeline.state().exchange.acquire().unwrap();
        assert_eq!(decode(&lease[0..4]), (100, 100));
        let last = lease.len() - 4;
        assert_eq!(decode(&lease[last..]), (739, 579));
        assert_eq!(
            pipeline.latest_texture().unwrap().0.purpose,
            Some(TexturePurpose::Crop)
        );
    }

    #[test]
    fn cropped_frame_feeds_the_scale_stage() {
        let gpu = MockGpu::default();
        let log = Arc::clone(&gpu.log);
        let pipeline = pipeline(gpu);
        let settings = &pipeline.state().settings;
        settings.set_crop_rect(100, 100, 640, 480);
        settings.set_max_bound(MaxBound::new(320, 320));

        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(1920, 1080));
        assert_eq!(published(outcome), (1, 320, 240));
        let created = log.lock().unwrap().created.clone();
        assert!(created.contains(&(TexturePurpose::Crop, 640, 480)));
        assert!(created.contains(&(TexturePurpose::ScaleTarget, 320, 240)));
        assert!(created.contains(&(TexturePurpose::Staging, 320, 240)));
    }

    #[test]
    fn frame_counter_advances_once_per_publish() {
        let pipeline = pipeline(MockGpu::default());
        let exchange = &pipeline.state().exchange;
        for expected in 1..=3 {
            let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(64, 32));
            assert_eq!(published(outcome).0, expected);
            assert_eq!(exchange.frame_count(), expected);
        }
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::new()),
            FrameOutcome::NoFrame
        );
        assert_eq!(exchange.frame_count(), 3);
    }

    #[test]
    fn outstanding_leases_drop_new_frames() {
        let pipeline = pipeline(MockGpu::default());
        let exchange = &pipeline.state().exchange;
        published(pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16)));

        let first = exchange.acquire().unwrap();
        let second = exchange.acquire().unwrap();
        let leased = first.to_vec();
        assert_eq!(exchange.reader_count(), 2);

        pipeline.state().settings.set_crop_rect(0, 0, 8, 8);
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16)),
            FrameOutcome::Dropped { readers: 2 }
        );
        assert_eq!(exchange.frame_count(), 1);
        assert_eq!(&first[..], &leased[..]);
        assert_eq!(first.as_ptr(), second.as_ptr());

        drop(first);
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16)),
            FrameOutcome::Dropped { readers: 1 }
        );
        drop(second);
        assert_eq!(exchange.frame_count(), 1);

        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16));
        assert_eq!(published(outcome), (2, 8, 8));
    }

    #[test]
    fn vetoed_scaled_frame_is_not_republished_unscaled() {
        let gpu = MockGpu::default();
        let log = Arc::clone(&gpu.log);
        let pipeline = pipeline(gpu);
        let exchange = &pipeline.state().exchange;
        published(pipeline.on_frame_arrived(&mut MockSource::with_frame(8, 8)));
        let lease = exchange.acquire().unwrap();

        pipeline
            .state()
            .settings
            .set_max_bound(MaxBound::new(4, 4));
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16)),
            FrameOutcome::Dropped { readers: 1 }
        );
        assert_eq!(
            log.lock().unwrap().created,
            vec![
                (TexturePurpose::Staging, 8, 8),
                (TexturePurpose::ScaleTarget, 4, 4),
                (TexturePurpose::Staging, 4, 4),
            ]
        );
        assert_eq!(exchange.frame_count(), 1);
        assert_eq!(lease.descriptor(), FrameDescriptor::bgra(8, 8));
    }

    #[test]
    fn failed_scaled_readback_falls_back_to_full_size() {
        let pipeline = pipeline(MockGpu {
            fail_staging_size: Some((4, 4)),
            ..MockGpu::default()
        });
        pipeline
            .state()
            .settings
            .set_max_bound(MaxBound::new(4, 4));
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(16, 16));
        assert_eq!(published(outcome), (1, 16, 16));
        assert_eq!(
            pipeline.latest_texture().unwrap().0.purpose,
            Some(TexturePurpose::ScaleTarget)
        );

        let lease = pipeline.state().exchange.acquire().unwrap();
        assert_eq!(&lease[..], &MockTexture::source(16, 16).pixels()[..]);
    }

    #[test]
    fn clamped_crop_applies_to_next_frame() {
        let pipeline = pipeline(MockGpu::default());
        let stored = pipeline.state().settings.set_crop_rect(-40, 0, 9000, 100);
        assert_eq!(
            stored,
            CropRect {
                x: 0,
                y: 0,
                width: MAX_DIMENSION,
                height: 100
            }
        );
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(200, 200));
        assert_eq!(published(outcome), (1, 200, 100));
    }

    #[test]
    fn working_textures_are_reused_until_size_changes() {
        let gpu = MockGpu::default();
        let log = Arc::clone(&gpu.log);
        let pipeline = pipeline(gpu);
        pipeline.state().settings.set_crop_rect(0, 0, 32, 32);
        pipeline
            .state()
            .settings
            .set_max_bound(MaxBound::new(16, 16));

        for _ in 0..3 {
            published(pipeline.on_frame_arrived(&mut MockSource::with_frame(64, 64)));
        }
        {
            let log = log.lock().unwrap();
            assert_eq!(log.created.len(), 3, "one texture per purpose");
            assert_eq!(log.scaler_builds, 1);
            assert_eq!(log.renders, 3);
        }

        pipeline.state().settings.set_crop_rect(0, 0, 48, 24);
        published(pipeline.on_frame_arrived(&mut MockSource::with_frame(64, 64)));
        let log = log.lock().unwrap();
        assert_eq!(
            &log.created[3..],
            &[
                (TexturePurpose::Crop, 48, 24),
                (TexturePurpose::ScaleTarget, 16, 8),
                (TexturePurpose::Staging, 16, 8),
            ]
        );
        assert_eq!(log.scaler_builds, 1);
    }

    #[test]
    fn closing_pipeline_leaves_source_untouched() {
        let pipeline = pipeline(MockGpu::default());
        assert!(pipeline.state().begin_close());
        assert!(!pipeline.state().begin_close());
        let mut source = MockSource::with_frame(10, 10);
        assert_eq!(pipeline.on_frame_arrived(&mut source), FrameOutcome::Closing);
        assert_eq!(source.frames.len(), 1);
    }

    #[test]
    fn overlapping_notification_is_skipped() {
        let pipeline = pipeline(MockGpu::default());
        let held = pipeline.worker.lock().unwrap();
        let mut source = MockSource::with_frame(10, 10);
        assert_eq!(pipeline.on_frame_arrived(&mut source), FrameOutcome::Busy);
        assert_eq!(source.frames.len(), 1, "busy skip leaves frames queued");
        drop(held);
        published(pipeline.on_frame_arrived(&mut source));
    }

    #[test]
    fn queued_frames_are_drained_to_the_newest() {
        let pipeline = pipeline(MockGpu::default());
        let mut source = MockSource::new();
        source.push(10, 10);
        source.push(20, 20);
        source.push(30, 30);
        let outcome = pipeline.on_frame_arrived(&mut source);
        assert_eq!(published(outcome), (1, 30, 30));
        assert_eq!(source.closed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn out_of_range_frames_are_rejected() {
        let pipeline = pipeline(MockGpu::default());
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(0, 10)),
            FrameOutcome::Rejected {
                width: 0,
                height: 10
            }
        );
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(MAX_DIMENSION + 1, 10)),
            FrameOutcome::Rejected {
                width: MAX_DIMENSION + 1,
                height: 10
            }
        );
        assert_eq!(pipeline.state().exchange.frame_count(), 0);
    }

    #[test]
    fn crop_allocation_failure_falls_back_to_source() {
        let pipeline = pipeline(MockGpu {
            fail_purpose: Some(TexturePurpose::Crop),
            ..MockGpu::default()
        });
        pipeline.state().settings.set_crop_rect(10, 10, 20, 20);
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(100, 50));
        assert_eq!(published(outcome), (1, 100, 50));
    }

    #[test]
    fn scaler_build_failure_is_final_and_frames_stay_unscaled() {
        let gpu = MockGpu {
            fail_scaler: true,
            ..MockGpu::default()
        };
        let log = Arc::clone(&gpu.log);
        let pipeline = pipeline(gpu);
        pipeline
            .state()
            .settings
            .set_max_bound(MaxBound::new(50, 50));
        for expected in 1..=2 {
            let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(100, 80));
            assert_eq!(published(outcome), (expected, 100, 80));
        }
        assert_eq!(log.lock().unwrap().scaler_builds, 1);
    }

    #[test]
    fn staging_failure_drops_the_frame() {
        let pipeline = pipeline(MockGpu {
            fail_purpose: Some(TexturePurpose::Staging),
            ..MockGpu::default()
        });
        assert_eq!(
            pipeline.on_frame_arrived(&mut MockSource::with_frame(10, 10)),
            FrameOutcome::ReadbackFailed
        );
        assert!(matches!(
            pipeline.state().exchange.peek(),
            Err(BridgeError::NoFrame)
        ));
    }

    #[test]
    fn empty_crop_intersection_passes_source_through() {
        let pipeline = pipeline(MockGpu::default());
        pipeline.state().settings.set_crop_rect(500, 500, 10, 10);
        let outcome = pipeline.on_frame_arrived(&mut MockSource::with_frame(100, 100));
        assert_eq!(published(outcome), (1, 100, 100));
    }
}
