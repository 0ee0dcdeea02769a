// Frame Driver - begin/end frame on top of the swapchain and sync objects
//
//  frame_begin                              frame_end
//  ┌──────────────────────────────────────┐ ┌──────────────────────────────────────────┐
//  │ rebuild owed? -> recreate, skip      │ │ end rendering, barrier to PRESENT_SRC    │
//  │ wait in_flight[frame]                │ │ wait fence of the image's previous owner │
//  │ acquire (signals image_available)    │ │ owner = frame, reset in_flight[frame]    │
//  │ record: viewport, barriers, begin    │ │ submit, present, advance frame           │
//  └──────────────────────────────────────┘ └──────────────────────────────────────────┘
//
// Frame slots and swapchain images are different counters. The slot cycles
// through `MAX_FRAMES_IN_FLIGHT`; the image index is whatever the
// presentation engine returns.
//
// Resizes are never applied from the window callback. `on_resize` only bumps
// a pending generation; the next `frame_begin` rebuilds the swapchain and
// skips that frame. A rebuild that cannot happen yet (surface with no area)
// or that failed halfway is owed, and retried by every `frame_begin` until
// it succeeds.

use ash::vk;
use log::{debug, error, info, warn};

use crate::backend::gpu::{
    AcquireOutcome, FenceWait, FrameSubmission, Gpu, ImageTransition, PresentOutcome,
    RenderTargets,
};
use crate::backend::swapchain::{Swapchain, SwapchainPreferences};
use crate::backend::sync::FrameSync;
use crate::error::{RenderError, RenderResult};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// A surface size tagged with the resize request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
    pub generation: u64,
}

/// Current frame slot plus applied and pending surface sizes.
#[derive(Debug, Clone)]
pub struct FrameCursor {
    current_frame: usize,
    applied: SurfaceSize,
    pending: SurfaceSize,
}

impl FrameCursor {
    pub fn new(width: u32, height: u32) -> Self {
        let size = SurfaceSize {
            width,
            height,
            generation: 0,
        };
        Self {
            current_frame: 0,
            applied: size,
            pending: size,
        }
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn applied(&self) -> SurfaceSize {
        self.applied
    }

    pub fn pending(&self) -> SurfaceSize {
        self.pending
    }

    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.pending = SurfaceSize {
            width,
            height,
            generation: self.pending.generation.wrapping_add(1),
        };
    }

    pub fn resize_pending(&self) -> bool {
        self.pending.generation != self.applied.generation
    }

    pub fn apply_pending(&mut self) {
        self.applied = self.pending;
    }

    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Per-frame behavior that is not negotiated with the surface.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSettings {
    pub clear_color: [f32; 4],
    /// Timeout for the in-flight fence wait and acquire; `u64::MAX` blocks.
    pub fence_timeout_ns: u64,
    pub swapchain: SwapchainPreferences,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout_ns: u64::MAX,
            swapchain: SwapchainPreferences::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub swapchain_recreations: u64,
}

/// Everything needed to drive frames to one surface.
///
/// Field order matters for Drop: the context is shut down before the GPU
/// backend it owns is dropped.
pub struct RenderContext<G: Gpu> {
    swapchain: Swapchain,
    sync: FrameSync,
    /// One per frame slot, reused once that slot's fence has signaled.
    command_buffers: Vec<vk::CommandBuffer>,
    cursor: FrameCursor,
    state: FrameState,
    image_index: u32,
    settings: FrameSettings,
    stats: FrameStats,
    /// Set while a swapchain rebuild is owed
    needs_rebuild: bool,
    initialized: bool,
    gpu: G,
}

impl<G: Gpu> RenderContext<G> {
    /// Builds the swapchain, sync objects and command buffers.
    /// Nothing is left allocated on failure.
    pub fn create(gpu: G, width: u32, height: u32, settings: FrameSettings) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidSize { width, height });
        }

        let mut swapchain = Swapchain::create(&gpu, width, height, settings.swapchain.clone())?;

        let mut sync = match FrameSync::create(&gpu, MAX_FRAMES_IN_FLIGHT, swapchain.image_count()) {
            Ok(sync) => sync,
            Err(e) => {
                swapchain.destroy(&gpu);
                return Err(e);
            }
        };

        let command_buffers = match gpu.allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32) {
            Ok(buffers) => buffers,
            Err(e) => {
                sync.destroy(&gpu);
                swapchain.destroy(&gpu);
                return Err(e);
            }
        };

        info!(
            "Render context ready: {}x{}, {} images, {} frames in flight",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count(),
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            swapchain,
            sync,
            command_buffers,
            cursor: FrameCursor::new(width, height),
            state: FrameState::Idle,
            image_index: 0,
            settings,
            stats: FrameStats::default(),
            needs_rebuild: false,
            initialized: true,
            gpu,
        })
    }

    /// Waits for the GPU and releases everything. Safe to call twice.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            warn!("Render context already shut down");
            return;
        }
        info!("Shutting down render context...");

        if let Err(e) = self.gpu.wait_idle() {
            error!("wait_idle failed during shutdown: {}", e);
        }
        if !self.command_buffers.is_empty() {
            self.gpu.free_command_buffers(&self.command_buffers);
            self.command_buffers.clear();
        }
        if !self.sync.is_destroyed() {
            self.sync.destroy(&self.gpu);
        }
        if !self.swapchain.is_destroyed() {
            self.swapchain.destroy(&self.gpu);
        }
        self.state = FrameState::Idle;
        self.initialized = false;
    }

    /// Records a new window size. Applied at the next `frame_begin`.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            warn!(
                "Resize to {}x{} has no area; holding it until the window is restored",
                width, height
            );
        } else {
            debug!("Resize requested: {}x{}", width, height);
        }
        self.cursor.request_resize(width, height);
    }

    /// Starts a frame. `Ok(false)` means skip this frame's draw calls.
    pub fn frame_begin(&mut self) -> RenderResult<bool> {
        if !self.initialized {
            return Ok(contract_violation("frame_begin on an uninitialized context"));
        }
        if self.state != FrameState::Idle {
            return Ok(contract_violation("frame_begin while a frame is in progress"));
        }

        let result = self.begin();
        match result {
            Ok(true) => {}
            Ok(false) => {
                self.state = FrameState::Idle;
                self.stats.frames_skipped += 1;
            }
            Err(_) => self.state = FrameState::Idle,
        }
        result
    }

    fn begin(&mut self) -> RenderResult<bool> {
        let resize = self.cursor.resize_pending();
        if resize || self.rebuild_owed() {
            let size = if resize {
                self.cursor.pending()
            } else {
                self.cursor.applied()
            };
            if size.width == 0 || size.height == 0 {
                debug!("Holding resize to {}x{}", size.width, size.height);
                return Ok(false);
            }
            if self.rebuild(size.width, size.height)? && resize {
                self.cursor.apply_pending();
            }
            return Ok(false);
        }

        let frame = self.cursor.current_frame();
        let timeout = self.settings.fence_timeout_ns;

        // Admission control: at most MAX_FRAMES_IN_FLIGHT frames queued
        if self.gpu.wait_for_fence(self.sync.in_flight(frame), timeout)? == FenceWait::TimedOut {
            debug!("Frame slot {} still busy", frame);
            return Ok(false);
        }

        self.state = FrameState::Acquiring;
        let acquired = self.gpu.acquire_next_image(
            self.swapchain.handle(),
            timeout,
            self.sync.image_available(frame),
        )?;
        let image_index = match acquired {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    // Still usable; present will report it again and trigger a rebuild
                    debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                let applied = self.cursor.applied();
                self.rebuild(applied.width, applied.height)?;
                return Ok(false);
            }
            AcquireOutcome::NotReady => return Ok(false),
        };
        self.image_index = image_index;

        let cmd = self.command_buffers[frame];
        let extent = self.swapchain.extent();
        let depth = *self.swapchain.depth();

        self.gpu.begin_commands(cmd)?;
        self.gpu.cmd_set_viewport_scissor(cmd, extent);
        self.gpu.cmd_transition_images(
            cmd,
            &[
                ImageTransition::color_to_attachment(self.swapchain.image(image_index)),
                ImageTransition::depth_to_attachment(depth.image, depth.aspect()),
            ],
        );
        self.gpu.cmd_begin_rendering(
            cmd,
            &RenderTargets {
                color_view: self.swapchain.image_view(image_index),
                depth_view: depth.view,
                extent,
                clear_color: self.settings.clear_color,
                clear_depth: 1.0,
            },
        );

        self.state = FrameState::Recording;
        Ok(true)
    }

    /// Submits and presents the frame started by `frame_begin`.
    /// `Ok(false)` means no image reached the screen.
    pub fn frame_end(&mut self) -> RenderResult<bool> {
        if !self.initialized {
            return Ok(contract_violation("frame_end on an uninitialized context"));
        }
        if self.state != FrameState::Recording {
            return Ok(contract_violation("frame_end without a successful frame_begin"));
        }

        let result = self.end();
        self.state = FrameState::Idle;
        if let Ok(false) = result {
            self.stats.frames_skipped += 1;
        }
        result
    }

    fn end(&mut self) -> RenderResult<bool> {
        let frame = self.cursor.current_frame();
        let image_index = self.image_index;
        let cmd = self.command_buffers[frame];

        self.gpu.cmd_end_rendering(cmd);
        self.gpu.cmd_transition_images(
            cmd,
            &[ImageTransition::color_to_present(self.swapchain.image(image_index))],
        );
        self.gpu.end_commands(cmd)?;

        // The image may still belong to another slot when images outnumber
        // slots. Unbounded: the image is acquired and has to be presented.
        if let Some(owner) = self.sync.image_owner(image_index) {
            self.gpu.wait_for_fence(self.sync.in_flight(owner), u64::MAX)?;
        }
        self.sync.claim_image(image_index, frame);

        let in_flight = self.sync.in_flight(frame);
        self.gpu.reset_fence(in_flight)?;

        self.gpu.submit_frame(&FrameSubmission {
            command_buffer: cmd,
            wait_semaphore: self.sync.image_available(frame),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: self.sync.image_complete(image_index),
            fence: in_flight,
        })?;
        self.state = FrameState::Submitted;

        self.state = FrameState::Presenting;
        let outcome = self.gpu.present(
            self.swapchain.handle(),
            image_index,
            self.sync.image_complete(image_index),
        )?;

        match outcome {
            PresentOutcome::Presented => {
                self.stats.frames_presented += 1;
                self.cursor.advance();
                Ok(true)
            }
            PresentOutcome::Suboptimal => {
                self.stats.frames_presented += 1;
                self.cursor.advance();
                self.recreate_after_present()?;
                Ok(true)
            }
            PresentOutcome::OutOfDate => {
                self.recreate_after_present()?;
                Ok(false)
            }
        }
    }

    /// Rebuild after present said the swapchain no longer fits. A valid
    /// pending resize is folded in so the next frame does not rebuild again.
    fn recreate_after_present(&mut self) -> RenderResult<()> {
        let pending = self.cursor.pending();
        if self.cursor.resize_pending() && pending.width > 0 && pending.height > 0 {
            if self.rebuild(pending.width, pending.height)? {
                self.cursor.apply_pending();
            }
        } else {
            let applied = self.cursor.applied();
            self.rebuild(applied.width, applied.height)?;
        }
        Ok(())
    }

    /// True when the last rebuild was deferred or failed partway.
    fn rebuild_owed(&self) -> bool {
        self.needs_rebuild || self.swapchain.is_destroyed() || self.sync.is_destroyed()
    }

    /// `Ok(false)` when the surface currently has no area; the rebuild stays
    /// owed and the next `frame_begin` tries again.
    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<bool> {
        match self.recreate_swapchain(width, height) {
            Ok(()) => Ok(true),
            Err(RenderError::InvalidSize { width, height }) => {
                if !self.needs_rebuild {
                    warn!(
                        "Surface reports {}x{}; deferring swapchain rebuild",
                        width, height
                    );
                }
                self.needs_rebuild = true;
                Ok(false)
            }
            Err(e) => {
                self.needs_rebuild = true;
                Err(e)
            }
        }
    }

    /// Stop-the-world rebuild of the swapchain and every sync object.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        info!("Recreating swapchain for {}x{}", width, height);

        // Waits for device idle before touching anything
        self.swapchain.recreate(&self.gpu, width, height)?;

        // Image count may have changed; old owners refer to dead images
        if !self.sync.is_destroyed() {
            self.sync.destroy(&self.gpu);
        }
        self.sync = FrameSync::create(&self.gpu, MAX_FRAMES_IN_FLIGHT, self.swapchain.image_count())?;

        self.needs_rebuild = false;
        self.stats.swapchain_recreations += 1;
        Ok(())
    }

    /// The command buffer being recorded, between a successful `frame_begin`
    /// and the matching `frame_end`.
    pub fn current_command_buffer(&self) -> Option<vk::CommandBuffer> {
        (self.state == FrameState::Recording)
            .then(|| self.command_buffers[self.cursor.current_frame()])
    }

    pub fn image_index(&self) -> Option<u32> {
        (self.state == FrameState::Recording).then_some(self.image_index)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn cursor(&self) -> &FrameCursor {
        &self.cursor
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }
}

impl<G: Gpu> Drop for RenderContext<G> {
    fn drop(&mut self) {
        if self.initialized {
            self.shutdown();
        }
    }
}

/// Halts debug builds; release builds log and skip.
fn contract_violation(what: &str) -> bool {
    error!("Contract violation: {}", what);
    if cfg!(debug_assertions) {
        panic!("contract violation: {}", what);
    }
    false
}
