// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation (ash-window)
// - Physical device selection and queue roles (policy in queues.rs)
// - Logical device, queues and command pools
// - Depth image memory (gpu-allocator)
// - The `Gpu` operations the frame core runs on

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use super::gpu::{
    AcquireOutcome, FenceWait, FrameSubmission, Gpu, ImageTransition, PresentOutcome,
    RenderTargets, SwapchainDesc,
};
use super::queues::{
    select_physical_device, DeviceRequirements, PhysicalDeviceInfo, QueueAssignment,
    QueueFamilyInfo, QueueRole,
};
use crate::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A retrieved queue, where it came from, and the pool its command
/// buffers are allocated from. Queues of one family share the pool.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family: u32,
    pub index: u32,
    pub pool: vk::CommandPool,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Memory first: freed before the device goes away
    depth_allocations: Mutex<HashMap<vk::Image, Allocation>>,
    allocator: Mutex<Option<Allocator>>,

    /// One per distinct family, destroyed on drop
    command_pools: Vec<(u32, vk::CommandPool)>,
    queues: [Queue; 4],
    assignment: QueueAssignment,

    swapchain_loader: khr::Swapchain,
    device: ash::Device,
    info: PhysicalDeviceInfo,

    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: Entry,
}

/// Everything created after the instance and surface.
struct Opened {
    info: PhysicalDeviceInfo,
    assignment: QueueAssignment,
    device: ash::Device,
    queues: [Queue; 4],
    command_pools: Vec<(u32, vk::CommandPool)>,
    allocator: Allocator,
}

impl VulkanDevice {
    /// Create Vulkan device presenting to `window`
    ///
    /// # Arguments
    /// * `window` - Anything exposing raw display and window handles
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `requirements` - What a physical device must offer to be picked
    pub fn new<W>(
        window: &W,
        app_name: &str,
        enable_validation: bool,
        requirements: &DeviceRequirements,
    ) -> RenderResult<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Create instance
        let display_handle = window.raw_display_handle();
        let enable_validation = enable_validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Step 4: Surface for the window
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle,
                window.raw_window_handle(),
                None,
            )
        } {
            Ok(surface) => surface,
            Err(e) => {
                Self::destroy_instance_objects(&instance, &surface_loader, None, debug_utils);
                return Err(RenderError::Surface(format!("surface creation failed: {}", e)));
            }
        };

        // Step 5: Pick GPU, open device, queues, pools, allocator
        let opened = match Self::open(&instance, &surface_loader, surface, requirements) {
            Ok(opened) => opened,
            Err(e) => {
                Self::destroy_instance_objects(
                    &instance,
                    &surface_loader,
                    Some(surface),
                    debug_utils,
                );
                return Err(e);
            }
        };

        log::info!(
            "Selected GPU: {} ({}, {} MiB device-local)",
            opened.info.name,
            opened.info.device_type_name(),
            opened.info.device_local_memory() / (1024 * 1024)
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(opened.info.api_version),
            vk::api_version_minor(opened.info.api_version),
            vk::api_version_patch(opened.info.api_version)
        );
        for role in QueueRole::ALL {
            let slot = opened.assignment.slot(role);
            log::info!(
                "{:?} queue: family {} index {}{}",
                role,
                slot.family,
                slot.index,
                if slot.dedicated { " (dedicated)" } else { "" }
            );
        }

        let swapchain_loader = khr::Swapchain::new(&instance, &opened.device);

        Ok(Self {
            depth_allocations: Mutex::new(HashMap::new()),
            allocator: Mutex::new(Some(opened.allocator)),
            command_pools: opened.command_pools,
            queues: opened.queues,
            assignment: opened.assignment,
            swapchain_loader,
            device: opened.device,
            info: opened.info,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
        })
    }

    fn validation_available(entry: &Entry) -> bool {
        let available = entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                    name == VALIDATION_LAYER
                })
            })
            .unwrap_or(false);
        if !available {
            log::warn!("Validation layers requested but not installed, continuing without");
        }
        available
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> RenderResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name.replace('\0', "")).unwrap_or_default();
        let engine_name = c"swapframe";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions for this display
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn open(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        requirements: &DeviceRequirements,
    ) -> RenderResult<Opened> {
        let handles = unsafe { instance.enumerate_physical_devices() }?;
        if handles.is_empty() {
            return Err(RenderError::NoSuitableDevice);
        }

        let mut devices = Vec::with_capacity(handles.len());
        for handle in handles {
            devices.push(Self::describe_physical_device(
                instance,
                surface_loader,
                surface,
                handle,
            )?);
        }

        let (chosen, assignment) = select_physical_device(&devices, requirements)?;
        let info = devices.swap_remove(chosen);

        let device = Self::create_logical_device(instance, &info, &assignment, requirements)?;

        let command_pools = match Self::create_command_pools(&device, &assignment) {
            Ok(pools) => pools,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        // Every role's family got a pool in create_command_pools
        let queues = QueueRole::ALL.map(|role| {
            let slot = assignment.slot(role);
            let pool = command_pools
                .iter()
                .find(|(family, _)| *family == slot.family)
                .map(|&(_, pool)| pool)
                .unwrap_or_default();
            Queue {
                handle: unsafe { device.get_device_queue(slot.family, slot.index) },
                family: slot.family,
                index: slot.index,
                pool,
            }
        });

        let allocator = match Self::create_allocator(instance, info.handle, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    for &(_, pool) in &command_pools {
                        device.destroy_command_pool(pool, None);
                    }
                    device.destroy_device(None);
                }
                return Err(e);
            }
        };

        Ok(Opened {
            info,
            assignment,
            device,
            queues,
            command_pools,
            allocator,
        })
    }

    /// Snapshot of everything the selection policy looks at.
    fn describe_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        handle: vk::PhysicalDevice,
    ) -> RenderResult<PhysicalDeviceInfo> {
        let props = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        let family_props = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let mut queue_families = Vec::with_capacity(family_props.len());
        for (index, family) in family_props.iter().enumerate() {
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(handle, index as u32, surface)
            }?;
            queue_families.push(QueueFamilyInfo {
                queue_count: family.queue_count,
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                compute: family.queue_flags.contains(vk::QueueFlags::COMPUTE),
                transfer: family.queue_flags.contains(vk::QueueFlags::TRANSFER),
                present,
            });
        }

        Ok(PhysicalDeviceInfo {
            handle,
            name,
            device_type: props.device_type,
            api_version: props.api_version,
            features,
            memory_properties,
            extensions,
            queue_families,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        info: &PhysicalDeviceInfo,
        assignment: &QueueAssignment,
        requirements: &DeviceRequirements,
    ) -> RenderResult<ash::Device> {
        let requests = assignment.queue_requests();
        let priorities: Vec<Vec<f32>> = requests
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();
        let queue_create_infos: Vec<_> = requests
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extension_names: Vec<CString> = requirements
            .extensions
            .iter()
            .filter_map(|name| CString::new(name.as_str()).ok())
            .collect();
        let extensions: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: if requirements.sampler_anisotropy {
                vk::TRUE
            } else {
                vk::FALSE
            },
            ..Default::default()
        };
        // Vulkan 1.3 dynamic rendering replaces render passes
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan13);

        let device = unsafe { instance.create_device(info.handle, &create_info, None) }?;
        Ok(device)
    }

    fn create_command_pools(
        device: &ash::Device,
        assignment: &QueueAssignment,
    ) -> RenderResult<Vec<(u32, vk::CommandPool)>> {
        let mut pools = Vec::new();
        for family in assignment.pool_families() {
            let create_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            match unsafe { device.create_command_pool(&create_info, None) } {
                Ok(pool) => pools.push((family, pool)),
                Err(e) => {
                    for (_, pool) in pools {
                        unsafe { device.destroy_command_pool(pool, None) };
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(pools)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> RenderResult<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    fn destroy_instance_objects(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: Option<vk::SurfaceKHR>,
        debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    ) {
        unsafe {
            if let Some(surface) = surface {
                surface_loader.destroy_surface(surface, None);
            }
            if let Some((debug_utils, messenger)) = debug_utils {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        }
    }

    pub fn queue(&self, role: QueueRole) -> Queue {
        let position = QueueRole::ALL
            .iter()
            .position(|&r| r == role)
            .unwrap_or_default();
        self.queues[position]
    }

    fn swapchain_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let graphics = self.assignment.graphics.family;
        let present = self.assignment.present.family;
        if graphics == present {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![graphics, present])
        }
    }
}

impl Gpu for VulkanDevice {
    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.info.handle, self.surface)
        }?;
        Ok(caps)
    }

    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.info.handle, self.surface)
        }?;
        Ok(formats)
    }

    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.info.handle, self.surface)
        }?;
        Ok(modes)
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.info.handle, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let (sharing_mode, families) = self.swapchain_sharing();

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?;
        Ok(images)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RenderResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.create_image_view(&create_info, None) }?;
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_depth_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> RenderResult<vk::Image> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut allocator = self.allocator.lock();
        let Some(allocator) = allocator.as_mut() else {
            unsafe { self.device.destroy_image(image, None) };
            return Err(RenderError::NotInitialized);
        };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: "depth buffer",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Err(free_err) = allocator.free(allocation) {
                log::error!("Failed to free depth memory: {}", free_err);
            }
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        self.depth_allocations.lock().insert(image, allocation);
        Ok(image)
    }

    fn destroy_depth_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        let Some(allocation) = self.depth_allocations.lock().remove(&image) else {
            log::warn!("Depth image {:?} had no tracked allocation", image);
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free depth memory: {}", e);
            }
        }
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }?;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.create_fence(&create_info, None) }?;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<FenceWait> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.queue(QueueRole::Graphics).pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(self.queue(QueueRole::Graphics).pool, buffers) };
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }?;
        Ok(())
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_transition_images(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]) {
        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();
        let barriers: Vec<_> = transitions
            .iter()
            .map(|t| {
                src_stage |= t.src_stage;
                dst_stage |= t.dst_stage;
                vk::ImageMemoryBarrier::builder()
                    .old_layout(t.old_layout)
                    .new_layout(t.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(t.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: t.aspect,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .src_access_mask(t.src_access)
                    .dst_access_mask(t.dst_access)
                    .build()
            })
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, targets: &RenderTargets) {
        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(targets.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: targets.clear_color,
                },
            })
            .build()];
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(targets.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: targets.clear_depth,
                    stencil: 0,
                },
            });

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        unsafe { self.device.cmd_begin_rendering(cmd, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireOutcome::NotReady),
            Err(e) => Err(e.into()),
        }
    }

    fn submit_frame(&self, submission: &FrameSubmission) -> RenderResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        let queue = self.queue(QueueRole::Graphics).handle;
        unsafe {
            self.device
                .queue_submit(queue, &[submit_info], submission.fence)
        }?;
        Ok(())
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue(QueueRole::Present).handle;
        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("wait_idle failed during teardown: {}", e);
        }

        // Allocator must go before the device it allocates from
        {
            let mut allocator = self.allocator.lock();
            let leftovers: Vec<_> = self.depth_allocations.lock().drain().collect();
            for (image, allocation) in leftovers {
                log::warn!("Depth image {:?} still alive at teardown", image);
                unsafe { self.device.destroy_image(image, None) };
                if let Some(allocator) = allocator.as_mut() {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free depth memory: {}", e);
                    }
                }
            }
            allocator.take();
        }

        // Cleanup in reverse order
        unsafe {
            for &(_, pool) in &self.command_pools {
                self.device.destroy_command_pool(pool, None);
            }
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
