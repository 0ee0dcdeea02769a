// Device Selector - physical device ranking and queue role assignment
//
// Works on immutable `PhysicalDeviceInfo` snapshots, so the policy can be
// tested without a GPU. Enumeration and opening the device live in device.rs.
//
// Queue roles are assigned in one pass over the queue families:
// 1. graphics takes a family that can also present, else any graphics family
// 2. present collapses onto the graphics queue when that family can present,
//    otherwise it takes the first present-capable family
// 3. compute prefers a family other than graphics
// 4. transfer takes the least loaded family, transfer-only families first
//
// Every claim consumes one queue index from its family. Once a family runs
// out, later roles prefer another candidate and only share an index when
// nothing else is left.

use ash::vk;
use log::debug;

use crate::error::{RenderError, RenderResult};

/// The four logical queue roles the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Compute,
    Transfer,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [
        QueueRole::Graphics,
        QueueRole::Present,
        QueueRole::Compute,
        QueueRole::Transfer,
    ];
}

/// Capabilities of one queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyInfo {
    pub queue_count: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub present: bool,
}

impl QueueFamilyInfo {
    /// Graphics and compute families accept transfer work even when the
    /// transfer bit is not advertised.
    pub fn supports_transfer(&self) -> bool {
        self.transfer || self.graphics || self.compute
    }

    pub fn is_transfer_only(&self) -> bool {
        self.supports_transfer() && !self.graphics && !self.compute
    }

    pub fn supports(&self, role: QueueRole) -> bool {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.supports_transfer(),
        }
    }
}

/// Snapshot of one physical device, taken once at enumeration.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamilyInfo>,
}

impl PhysicalDeviceInfo {
    pub fn device_type_name(&self) -> &'static str {
        match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

/// What a device must offer to be considered at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub extensions: Vec<String>,
    pub sampler_anisotropy: bool,
    pub min_api_version: u32,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            extensions: vec!["VK_KHR_swapchain".to_string()],
            sampler_anisotropy: true,
            min_api_version: vk::API_VERSION_1_3,
        }
    }
}

/// Where one role's queue lives.
///
/// `dedicated` means no other role was placed in the same family. It is a
/// "no known contention" hint, not a hardware guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
    pub dedicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAssignment {
    pub graphics: QueueSlot,
    pub present: QueueSlot,
    pub compute: QueueSlot,
    pub transfer: QueueSlot,
}

impl QueueAssignment {
    pub fn slot(&self, role: QueueRole) -> QueueSlot {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
        }
    }

    /// `(family, queue count)` to request at device creation, in role order.
    pub fn queue_requests(&self) -> Vec<(u32, u32)> {
        let mut requests: Vec<(u32, u32)> = Vec::with_capacity(4);
        for role in QueueRole::ALL {
            let slot = self.slot(role);
            match requests.iter_mut().find(|(family, _)| *family == slot.family) {
                Some((_, count)) => *count = (*count).max(slot.index + 1),
                None => requests.push((slot.family, slot.index + 1)),
            }
        }
        requests
    }

    /// Families that get a command pool. Roles sharing a family share its pool.
    pub fn pool_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for role in QueueRole::ALL {
            let family = self.slot(role).family;
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Per-family bookkeeping while roles are being placed.
struct FamilyLedger {
    remaining: Vec<u32>,
    next_index: Vec<u32>,
    load: Vec<u32>,
}

impl FamilyLedger {
    fn new(families: &[QueueFamilyInfo]) -> Self {
        Self {
            remaining: families.iter().map(|f| f.queue_count).collect(),
            next_index: vec![0; families.len()],
            load: vec![0; families.len()],
        }
    }

    fn has_free(&self, family: usize) -> bool {
        self.remaining[family] > 0
    }

    /// Takes the next free queue index, or shares the last one handed out
    /// when the family is depleted.
    fn claim(&mut self, family: usize) -> u32 {
        self.load[family] += 1;
        if self.remaining[family] > 0 {
            let index = self.next_index[family];
            self.next_index[family] += 1;
            self.remaining[family] -= 1;
            index
        } else {
            self.next_index[family].saturating_sub(1)
        }
    }

    fn share(&mut self, family: usize) {
        self.load[family] += 1;
    }
}

/// Maps the four roles onto the device's queue families.
pub fn assign_queues(info: &PhysicalDeviceInfo) -> RenderResult<QueueAssignment> {
    let families = &info.queue_families;

    let mut graphics_with_present = None;
    let mut graphics_any = None;
    let mut present_any = None;
    let mut compute_candidates = Vec::new();
    let mut transfer_candidates = Vec::new();

    for (i, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        if family.graphics {
            if family.present && graphics_with_present.is_none() {
                graphics_with_present = Some(i);
            }
            graphics_any.get_or_insert(i);
        }
        if family.present {
            present_any.get_or_insert(i);
        }
        if family.compute {
            compute_candidates.push(i);
        }
        if family.supports_transfer() {
            transfer_candidates.push(i);
        }
    }

    let graphics = graphics_with_present
        .or(graphics_any)
        .ok_or(RenderError::MissingQueueSupport(QueueRole::Graphics))?;
    let present = if families[graphics].present {
        graphics
    } else {
        present_any.ok_or(RenderError::MissingQueueSupport(QueueRole::Present))?
    };
    if compute_candidates.is_empty() {
        return Err(RenderError::MissingQueueSupport(QueueRole::Compute));
    }
    if transfer_candidates.is_empty() {
        return Err(RenderError::MissingQueueSupport(QueueRole::Transfer));
    }

    let mut ledger = FamilyLedger::new(families);

    let graphics_index = ledger.claim(graphics);
    let present_index = if present == graphics {
        ledger.share(graphics);
        graphics_index
    } else {
        ledger.claim(present)
    };

    // min_by_key keeps the first minimum, so ties go to the earliest family.
    let compute = compute_candidates
        .iter()
        .copied()
        .min_by_key(|&f| (f == graphics, !ledger.has_free(f)))
        .ok_or(RenderError::MissingQueueSupport(QueueRole::Compute))?;
    let compute_index = ledger.claim(compute);

    let transfer = transfer_candidates
        .iter()
        .copied()
        .min_by_key(|&f| {
            (
                ledger.load[f],
                !families[f].is_transfer_only(),
                !ledger.has_free(f),
            )
        })
        .ok_or(RenderError::MissingQueueSupport(QueueRole::Transfer))?;
    let transfer_index = ledger.claim(transfer);

    let placed = [graphics, present, compute, transfer];
    let slot = |family: usize, index: u32| QueueSlot {
        family: family as u32,
        index,
        dedicated: placed.iter().filter(|&&f| f == family).count() == 1,
    };

    Ok(QueueAssignment {
        graphics: slot(graphics, graphics_index),
        present: slot(present, present_index),
        compute: slot(compute, compute_index),
        transfer: slot(transfer, transfer_index),
    })
}

/// Why a device fails `requirements`, if it does.
pub fn unmet_requirement(
    info: &PhysicalDeviceInfo,
    requirements: &DeviceRequirements,
) -> Option<String> {
    if info.api_version < requirements.min_api_version {
        return Some(format!(
            "Vulkan {}.{} < required {}.{}",
            vk::api_version_major(info.api_version),
            vk::api_version_minor(info.api_version),
            vk::api_version_major(requirements.min_api_version),
            vk::api_version_minor(requirements.min_api_version),
        ));
    }
    if let Some(missing) = requirements
        .extensions
        .iter()
        .find(|ext| !info.extensions.contains(ext))
    {
        return Some(format!("missing extension {}", missing));
    }
    if requirements.sampler_anisotropy && info.features.sampler_anisotropy == vk::FALSE {
        return Some("sampler anisotropy not supported".to_string());
    }
    None
}

fn device_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 2,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 0,
    }
}

/// Picks the device to open and its queue assignment.
///
/// A discrete GPU wins; otherwise the first integrated GPU; any other
/// suitable device is a last resort. Returns the index into `devices`.
pub fn select_physical_device(
    devices: &[PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
) -> RenderResult<(usize, QueueAssignment)> {
    let mut best: Option<(usize, QueueAssignment, u32)> = None;

    for (i, info) in devices.iter().enumerate() {
        if let Some(reason) = unmet_requirement(info, requirements) {
            debug!("GPU '{}' skipped: {}", info.name, reason);
            continue;
        }
        let assignment = match assign_queues(info) {
            Ok(assignment) => assignment,
            Err(e) => {
                debug!("GPU '{}' skipped: {}", info.name, e);
                continue;
            }
        };

        let rank = device_rank(info.device_type);
        debug!(
            "GPU '{}' ({}) is suitable, rank {}",
            info.name,
            info.device_type_name(),
            rank
        );
        if best.map_or(true, |(_, _, best_rank)| rank > best_rank) {
            best = Some((i, assignment, rank));
        }
    }

    best.map(|(i, assignment, _)| (i, assignment))
        .ok_or(RenderError::NoSuitableDevice)
}
