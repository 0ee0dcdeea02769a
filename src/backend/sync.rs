// Synchronization primitives
//
// Per frame in flight: an `image_available` semaphore and an `in_flight`
// fence. Per swapchain image: an `image_complete` semaphore and the index of
// the in-flight fence currently using that image, if any.

use ash::vk;
use log::{debug, warn};

use super::gpu::Gpu;
use crate::error::RenderResult;

pub struct FrameSync {
    image_available: Vec<vk::Semaphore>,
    in_flight: Vec<vk::Fence>,
    image_complete: Vec<vk::Semaphore>,
    /// For each swapchain image, the frame slot whose fence guards it.
    images_in_flight: Vec<Option<usize>>,
}

impl FrameSync {
    /// In-flight fences start signaled so the first frames do not block.
    pub fn create<G: Gpu>(
        gpu: &G,
        frames_in_flight: usize,
        image_count: usize,
    ) -> RenderResult<Self> {
        let mut sync = Self {
            image_available: Vec::with_capacity(frames_in_flight),
            in_flight: Vec::with_capacity(frames_in_flight),
            image_complete: Vec::with_capacity(image_count),
            images_in_flight: vec![None; image_count],
        };

        if let Err(e) = sync.populate(gpu, frames_in_flight, image_count) {
            sync.destroy(gpu);
            return Err(e);
        }

        debug!(
            "Created sync objects for {} frames in flight, {} images",
            frames_in_flight, image_count
        );
        Ok(sync)
    }

    fn populate<G: Gpu>(
        &mut self,
        gpu: &G,
        frames_in_flight: usize,
        image_count: usize,
    ) -> RenderResult<()> {
        for _ in 0..frames_in_flight {
            self.image_available.push(gpu.create_semaphore()?);
            self.in_flight.push(gpu.create_fence(true)?);
        }
        for _ in 0..image_count {
            self.image_complete.push(gpu.create_semaphore()?);
        }
        Ok(())
    }

    /// Destroys every object. The caller makes sure the GPU is done with them.
    pub fn destroy<G: Gpu>(&mut self, gpu: &G) {
        if self.is_destroyed() {
            warn!("Frame sync objects already destroyed");
            return;
        }
        for semaphore in self.image_available.drain(..) {
            gpu.destroy_semaphore(semaphore);
        }
        for fence in self.in_flight.drain(..) {
            gpu.destroy_fence(fence);
        }
        for semaphore in self.image_complete.drain(..) {
            gpu.destroy_semaphore(semaphore);
        }
        self.images_in_flight.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.image_available.is_empty() && self.in_flight.is_empty() && self.image_complete.is_empty()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn image_count(&self) -> usize {
        self.image_complete.len()
    }

    pub fn image_available(&self, frame: usize) -> vk::Semaphore {
        self.image_available[frame]
    }

    pub fn in_flight(&self, frame: usize) -> vk::Fence {
        self.in_flight[frame]
    }

    pub fn image_complete(&self, image_index: u32) -> vk::Semaphore {
        self.image_complete[image_index as usize]
    }

    /// Frame slot still using `image_index`, if any.
    pub fn image_owner(&self, image_index: u32) -> Option<usize> {
        self.images_in_flight[image_index as usize]
    }

    pub fn claim_image(&mut self, image_index: u32, frame: usize) {
        self.images_in_flight[image_index as usize] = Some(frame);
    }
}
