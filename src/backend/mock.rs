// In-memory GPU for tests (no device required)
//
// Tracks every live object and the state of each fence and semaphore, and
// panics on the mistakes a validation layer would catch: waiting forever on
// a fence nobody will signal, submitting against an unsignaled semaphore,
// resetting a fence in use, destroying a handle twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::{Mutex, MutexGuard};

use super::gpu::{
    AcquireOutcome, FenceWait, FrameSubmission, Gpu, ImageTransition, PresentOutcome,
    RenderTargets, SwapchainDesc,
};
use crate::error::RenderResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    /// Submitted; signals when waited on (if the GPU "completes") or on idle.
    Pending,
    Signaled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Begin,
    Viewport(vk::Extent2D),
    Barrier(Vec<ImageTransition>),
    BeginRendering(RenderTargets),
    EndRendering,
    End,
}

pub struct MockState {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub depth_formats: Vec<vk::Format>,
    /// Consumed front to back; when empty images are handed out round-robin.
    pub acquire_script: VecDeque<AcquireOutcome>,
    pub present_script: VecDeque<PresentOutcome>,
    /// When false, pending fences never signal on a wait.
    pub completes_on_wait: bool,
    /// Number of object creations left before creation starts failing.
    pub creation_budget: Option<usize>,
    pub device_lost: bool,

    pub swapchains_created: Vec<SwapchainDesc>,
    pub fence_waits: Vec<vk::Fence>,
    pub idle_waits: usize,
    pub acquired: Vec<u32>,
    pub submissions: Vec<FrameSubmission>,
    pub presented: Vec<u32>,
    pub commands: HashMap<vk::CommandBuffer, Vec<Command>>,

    next_handle: u64,
    live: HashSet<u64>,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, bool>,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    recording: HashSet<vk::CommandBuffer>,
    next_image: u32,
}

impl MockState {
    fn new_handle<H: Handle>(&mut self) -> RenderResult<H> {
        if let Some(budget) = self.creation_budget.as_mut() {
            if *budget == 0 {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
            }
            *budget -= 1;
        }
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        Ok(H::from_raw(self.next_handle))
    }

    fn release<H: Handle>(&mut self, handle: H) {
        let raw = handle.as_raw();
        assert!(self.live.remove(&raw), "destroying dead handle {:#x}", raw);
    }

    fn check_lost(&self) -> RenderResult<()> {
        if self.device_lost {
            Err(vk::Result::ERROR_DEVICE_LOST.into())
        } else {
            Ok(())
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: Command) {
        assert!(self.recording.contains(&cmd), "{:?} is not recording", cmd);
        self.commands.entry(cmd).or_default().push(command);
    }

    pub fn fence_state(&self, fence: vk::Fence) -> FenceState {
        self.fences[&fence]
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.semaphores[&semaphore]
    }
}

/// Clones share the same state, so a test can keep watching a GPU it
/// handed over to a `RenderContext`.
#[derive(Clone)]
pub struct MockGpu {
    state: Arc<Mutex<MockState>>,
}

impl MockGpu {
    /// A surface accepting 1..=4096 in both dimensions, min 2 / max 4 images,
    /// sRGB output, FIFO + MAILBOX, and D32 depth.
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };

        Self {
            state: Arc::new(Mutex::new(MockState {
                capabilities,
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                depth_formats: vec![vk::Format::D32_SFLOAT],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                completes_on_wait: true,
                creation_budget: None,
                device_lost: false,
                swapchains_created: Vec::new(),
                fence_waits: Vec::new(),
                idle_waits: 0,
                acquired: Vec::new(),
                submissions: Vec::new(),
                presented: Vec::new(),
                commands: HashMap::new(),
                next_handle: 0,
                live: HashSet::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                swapchain_images: HashMap::new(),
                recording: HashSet::new(),
                next_image: 0,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpu for MockGpu {
    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        self.state.lock().depth_formats.contains(&format)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        state.check_lost()?;
        assert!(desc.extent.width > 0 && desc.extent.height > 0);
        let swapchain: vk::SwapchainKHR = state.new_handle()?;
        let images = (0..desc.image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchain_images.insert(swapchain, images);
        state.swapchains_created.push(*desc);
        state.next_image = 0;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        Ok(self.state.lock().swapchain_images[&swapchain].clone())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.release(swapchain);
        state.swapchain_images.remove(&swapchain);
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> RenderResult<vk::ImageView> {
        self.state.lock().new_handle()
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().release(view);
    }

    fn create_depth_image(
        &self,
        _extent: vk::Extent2D,
        format: vk::Format,
    ) -> RenderResult<vk::Image> {
        let mut state = self.state.lock();
        assert!(state.depth_formats.contains(&format));
        state.new_handle()
    }

    fn destroy_depth_image(&self, image: vk::Image) {
        self.state.lock().release(image);
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.new_handle()?;
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.release(semaphore);
        state.semaphores.remove(&semaphore);
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.new_handle()?;
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        assert_ne!(state.fences[&fence], FenceState::Pending, "destroying fence in use");
        state.release(fence);
        state.fences.remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<FenceWait> {
        let mut state = self.state.lock();
        state.check_lost()?;
        state.fence_waits.push(fence);
        let completes = state.completes_on_wait;
        let fence_state = state.fences.get_mut(&fence).expect("waiting on unknown fence");
        match *fence_state {
            FenceState::Signaled => Ok(FenceWait::Signaled),
            FenceState::Pending if completes => {
                *fence_state = FenceState::Signaled;
                Ok(FenceWait::Signaled)
            }
            _ if timeout_ns == u64::MAX => {
                panic!("deadlock: unbounded wait on {:?} ({:?})", fence, fence_state)
            }
            _ => Ok(FenceWait::TimedOut),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.check_lost()?;
        let fence_state = state.fences.get_mut(&fence).expect("resetting unknown fence");
        assert_ne!(*fence_state, FenceState::Pending, "resetting fence in use");
        *fence_state = FenceState::Unsignaled;
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state.lock();
        // A lost device runs nothing more, so nothing is in use either
        for fence_state in state.fences.values_mut() {
            if *fence_state == FenceState::Pending {
                *fence_state = FenceState::Signaled;
            }
        }
        state.check_lost()?;
        state.idle_waits += 1;
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        // All or nothing, like the real allocation
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match state.new_handle() {
                Ok(cmd) => buffers.push(cmd),
                Err(e) => {
                    for cmd in buffers {
                        state.release(cmd);
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &cmd in buffers {
            state.release(cmd);
            state.commands.remove(&cmd);
            state.recording.remove(&cmd);
        }
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.check_lost()?;
        assert!(state.recording.insert(cmd), "{:?} is already recording", cmd);
        state.commands.insert(cmd, vec![Command::Begin]);
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.record(cmd, Command::End);
        state.recording.remove(&cmd);
        Ok(())
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.state.lock().record(cmd, Command::Viewport(extent));
    }

    fn cmd_transition_images(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]) {
        self.state
            .lock()
            .record(cmd, Command::Barrier(transitions.to_vec()));
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, targets: &RenderTargets) {
        self.state
            .lock()
            .record(cmd, Command::BeginRendering(*targets));
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        self.state.lock().record(cmd, Command::EndRendering);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let mut state = self.state.lock();
        state.check_lost()?;
        let image_count = state.swapchain_images[&swapchain].len() as u32;
        let outcome = match state.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => {
                let index = state.next_image % image_count;
                state.next_image += 1;
                AcquireOutcome::Acquired {
                    index,
                    suboptimal: false,
                }
            }
        };
        if let AcquireOutcome::Acquired { index, .. } = outcome {
            assert!(index < image_count);
            let signaled = state.semaphores.get_mut(&signal).expect("unknown semaphore");
            assert!(!*signaled, "acquire would signal an already signaled semaphore");
            *signaled = true;
            state.acquired.push(index);
        }
        Ok(outcome)
    }

    fn submit_frame(&self, submission: &FrameSubmission) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.check_lost()?;
        assert!(
            !state.recording.contains(&submission.command_buffer),
            "submitting a buffer that is still recording"
        );
        let wait = state
            .semaphores
            .get_mut(&submission.wait_semaphore)
            .expect("unknown wait semaphore");
        assert!(*wait, "submission waits on an unsignaled semaphore");
        *wait = false;
        let fence = state
            .fences
            .get_mut(&submission.fence)
            .expect("unknown fence");
        assert_eq!(*fence, FenceState::Unsignaled, "submitting with a signaled fence");
        *fence = FenceState::Pending;
        state.semaphores.insert(submission.signal_semaphore, true);
        state.submissions.push(*submission);
        Ok(())
    }

    fn present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let mut state = self.state.lock();
        state.check_lost()?;
        let signaled = state.semaphores.get_mut(&wait).expect("unknown semaphore");
        assert!(*signaled, "present waits on an unsignaled semaphore");
        *signaled = false;
        let outcome = state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented);
        if outcome != PresentOutcome::OutOfDate {
            state.presented.push(image_index);
        }
        Ok(outcome)
    }
}
