// GPU enumeration and ranking
//
// Every physical device is recorded once at startup together with the
// information later stages need (queue families, extensions, limits) and a
// suitability score. Ranking itself is pure so it can be checked without a GPU.

use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;

use crate::error::{RenderError, RenderResult};

/// Score contribution of the device type. `Other` is the baseline floor.
pub fn type_weight(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 750,
        vk::PhysicalDeviceType::CPU => 500,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 250,
        _ => 0,
    }
}

/// Type weight plus the max 2D image dimension as a capability tiebreaker.
pub fn device_score(properties: &vk::PhysicalDeviceProperties) -> u32 {
    type_weight(properties.device_type)
        .saturating_add(properties.limits.max_image_dimension2_d)
}

/// Logical role a queue family can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    SparseBinding,
    Protected,
}

impl QueueRole {
    const ALL: [(QueueRole, vk::QueueFlags); 5] = [
        (QueueRole::Graphics, vk::QueueFlags::GRAPHICS),
        (QueueRole::Compute, vk::QueueFlags::COMPUTE),
        (QueueRole::Transfer, vk::QueueFlags::TRANSFER),
        (QueueRole::SparseBinding, vk::QueueFlags::SPARSE_BINDING),
        (QueueRole::Protected, vk::QueueFlags::PROTECTED),
    ];
}

/// Map each role to the first family whose flags advertise it.
pub fn map_roles(families: &[vk::QueueFamilyProperties]) -> BTreeMap<QueueRole, u32> {
    let mut roles = BTreeMap::new();
    for (index, family) in families.iter().enumerate() {
        for (role, flag) in QueueRole::ALL {
            if family.queue_flags.contains(flag) {
                roles.entry(role).or_insert(index as u32);
            }
        }
    }
    roles
}

/// A physical GPU as seen at enumeration time.
#[derive(Clone)]
pub struct GpuDevice {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub roles: BTreeMap<QueueRole, u32>,
    extensions: Vec<String>,
    score: u32,
}

impl GpuDevice {
    pub fn new(
        handle: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        features: vk::PhysicalDeviceFeatures,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        queue_families: Vec<vk::QueueFamilyProperties>,
        extensions: Vec<String>,
    ) -> Self {
        let roles = map_roles(&queue_families);
        let score = device_score(&properties);
        Self {
            handle,
            properties,
            features,
            memory_properties,
            queue_families,
            roles,
            extensions,
            score,
        }
    }

    fn query(instance: &ash::Instance, handle: vk::PhysicalDevice) -> RenderResult<Self> {
        let (properties, features, memory_properties, queue_families) = unsafe {
            (
                instance.get_physical_device_properties(handle),
                instance.get_physical_device_features(handle),
                instance.get_physical_device_memory_properties(handle),
                instance.get_physical_device_queue_family_properties(handle),
            )
        };

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }
            .map_err(RenderError::backend("device extension query"))?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        Ok(Self::new(
            handle,
            properties,
            features,
            memory_properties,
            queue_families,
            extensions,
        ))
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn device_id(&self) -> u32 {
        self.properties.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            _ => "Unknown",
        }
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|ext| *ext == name)
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    pub fn log_info(&self) {
        let version = self.properties.api_version;
        log::info!("GPU Information");
        log::info!("  Device Id:   {:#06x}", self.device_id());
        log::info!("  Vendor Id:   {:#06x}", self.vendor_id());
        log::info!("  Device Name: {}", self.name());
        log::info!("  Device Type: {}", self.type_name());
        log::info!("  GPU Score:   {}", self.score);
        log::info!(
            "  API Version: {}.{}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version)
        );
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.name())
            .field("type", &self.type_name())
            .field("score", &self.score)
            .field("roles", &self.roles)
            .finish()
    }
}

/// Order candidates best-first. Devices of an unrecognised type are left out;
/// the list fails only if nothing recognisable remains.
pub fn rank_devices(candidates: Vec<GpuDevice>) -> RenderResult<Vec<GpuDevice>> {
    if candidates.is_empty() {
        return Err(RenderError::DeviceUnavailable {
            reason: "no Vulkan-capable GPU reported".into(),
        });
    }

    let total = candidates.len();
    let mut ranked: Vec<GpuDevice> = candidates
        .into_iter()
        .filter(|device| {
            let known = type_weight(device.properties.device_type) > 0;
            if !known {
                log::warn!("Ignoring GPU '{}' with unrecognised device type", device.name());
            }
            known
        })
        .collect();

    if ranked.is_empty() {
        return Err(RenderError::DeviceUnavailable {
            reason: format!("none of the {} GPU(s) has a recognised device type", total),
        });
    }

    // Stable sort keeps enumeration order between equal scores
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    Ok(ranked)
}

/// Enumerate every GPU on the system, highest score first.
pub fn enumerate(instance: &ash::Instance) -> RenderResult<Vec<GpuDevice>> {
    let handles = unsafe { instance.enumerate_physical_devices() }
        .map_err(RenderError::backend("physical device enumeration"))?;

    log::info!("Found {} GPU(s)", handles.len());

    let candidates = handles
        .into_iter()
        .map(|handle| GpuDevice::query(instance, handle))
        .collect::<RenderResult<Vec<_>>>()?;

    for device in &candidates {
        log::debug!("GPU '{}' ({}) - Score: {}", device.name(), device.type_name(), device.score);
    }

    rank_devices(candidates)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fake_device(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        max_dim: u32,
        families: Vec<vk::QueueFamilyProperties>,
    ) -> GpuDevice {
        let mut properties = vk::PhysicalDeviceProperties {
            device_type,
            ..Default::default()
        };
        properties.limits.max_image_dimension2_d = max_dim;
        for (dst, src) in properties.device_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::ffi::c_char;
        }

        GpuDevice::new(
            vk::PhysicalDevice::null(),
            properties,
            vk::PhysicalDeviceFeatures::default(),
            vk::PhysicalDeviceMemoryProperties::default(),
            families,
            vec!["VK_KHR_swapchain".to_string()],
        )
    }

    pub(crate) fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn discrete_beats_integrated_with_expected_scores() {
        let ranked = rank_devices(vec![
            fake_device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096, vec![]),
            fake_device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![]),
        ])
        .unwrap();

        assert_eq!(ranked[0].name(), "dgpu");
        assert_eq!(ranked[0].score(), 9192);
        assert_eq!(ranked[1].score(), 4846);
    }

    #[test]
    fn type_order_holds_when_only_type_differs() {
        let order = [
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::OTHER,
        ];

        for pair in order.windows(2) {
            let ranked = rank_devices(vec![
                fake_device("lower", pair[1], 16384, vec![]),
                fake_device("higher", pair[0], 16384, vec![]),
            ])
            .unwrap();
            assert_eq!(ranked[0].name(), "higher", "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_devices_is_unavailable() {
        assert!(matches!(
            rank_devices(vec![]),
            Err(RenderError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn baseline_only_devices_are_unavailable() {
        let result = rank_devices(vec![
            fake_device("a", vk::PhysicalDeviceType::OTHER, 8192, vec![]),
            fake_device("b", vk::PhysicalDeviceType::OTHER, 4096, vec![]),
        ]);
        assert!(matches!(result, Err(RenderError::DeviceUnavailable { .. })));
    }

    #[test]
    fn unrecognised_type_never_outranks_a_usable_gpu() {
        let ranked = rank_devices(vec![
            fake_device("other", vk::PhysicalDeviceType::OTHER, 16384, vec![]),
            fake_device("virt", vk::PhysicalDeviceType::VIRTUAL_GPU, 4096, vec![]),
        ])
        .unwrap();

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name(), "virt");
        assert_eq!(ranked[0].score(), 4346);
    }

    #[test]
    fn image_dimension_breaks_ties() {
        let ranked = rank_devices(vec![
            fake_device("small", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![]),
            fake_device("big", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![]),
        ])
        .unwrap();
        assert_eq!(ranked[0].name(), "big");
    }

    #[test]
    fn roles_map_to_first_advertising_family() {
        let device = fake_device(
            "gpu",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8192,
            vec![
                family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
                family(vk::QueueFlags::TRANSFER),
                family(vk::QueueFlags::COMPUTE | vk::QueueFlags::SPARSE_BINDING),
            ],
        );

        assert_eq!(device.roles.get(&QueueRole::Graphics), Some(&0));
        assert_eq!(device.roles.get(&QueueRole::Transfer), Some(&0));
        assert_eq!(device.roles.get(&QueueRole::SparseBinding), Some(&2));
        assert_eq!(device.roles.get(&QueueRole::Protected), None);
    }

    #[test]
    fn extension_lookup() {
        let device = fake_device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![]);
        assert!(device.supports_extension(ash::extensions::khr::Swapchain::name()));
        assert!(!device.supports_extension(c"VK_KHR_ray_query"));
    }
}
