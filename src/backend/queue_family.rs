// Queue family mapping
//
// Graphics and transfer roles come from the family flags. Presentation can't
// be read off the flags, so it's answered by an explicit per-family surface
// query passed in as a closure.

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// What the selected device must offer beyond graphics + present.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueRequirements {
    /// Only accept a transfer family that lacks the graphics bit
    pub dedicated_transfer: bool,
}

/// Queue family indices, possibly incomplete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub transfer: Option<u32>,
    pub present: Option<u32>,
}

/// Queue family indices with every role resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedQueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    fn is_complete(&self, requirements: QueueRequirements) -> bool {
        self.graphics.is_some()
            && self.present.is_some()
            && (!requirements.dedicated_transfer || self.transfer.is_some())
    }

    /// Fill the transfer role and check the mandatory ones.
    pub fn resolve(self, requirements: QueueRequirements) -> RenderResult<ResolvedQueueFamilies> {
        let graphics = self
            .graphics
            .ok_or_else(|| RenderError::capability("graphics queue family"))?;
        let present = self
            .present
            .ok_or_else(|| RenderError::capability("present queue family"))?;

        let transfer = match self.transfer {
            Some(transfer) => transfer,
            None if requirements.dedicated_transfer => {
                return Err(RenderError::capability("dedicated transfer queue family"));
            }
            // Graphics families implicitly support transfer
            None => graphics,
        };

        Ok(ResolvedQueueFamilies {
            graphics,
            transfer,
            present,
        })
    }
}

impl ResolvedQueueFamilies {
    /// Deduplicated families, one queue create info each.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.transfer, self.present];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Whether graphics and present alias the same family.
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Sharing mode + family list for images used by graphics and present.
    pub fn image_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.is_shared() {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![self.graphics, self.present])
        }
    }

    /// Sharing mode + family list for buffers filled by transfer, read by graphics.
    pub fn buffer_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.graphics == self.transfer {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![self.graphics, self.transfer])
        }
    }
}

/// Walk the family list once, stopping as soon as every role is filled.
pub fn map_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    requirements: QueueRequirements,
    mut present_support: F,
) -> RenderResult<QueueFamilyIndices>
where
    F: FnMut(u32) -> RenderResult<bool>,
{
    let mut indices = QueueFamilyIndices::default();

    for (index, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;
        let flags = family.queue_flags;

        if indices.graphics.is_none() && flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }

        if indices.transfer.is_none() && flags.contains(vk::QueueFlags::TRANSFER) {
            let dedicated = !flags.contains(vk::QueueFlags::GRAPHICS);
            if dedicated || !requirements.dedicated_transfer {
                indices.transfer = Some(index);
            }
        }

        if indices.present.is_none() && present_support(index)? {
            indices.present = Some(index);
        }

        if indices.is_complete(requirements) && indices.transfer.is_some() {
            break;
        }
    }

    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::enumerate::tests::family;

    const GFX: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const XFER: vk::QueueFlags = vk::QueueFlags::TRANSFER;
    const COMPUTE: vk::QueueFlags = vk::QueueFlags::COMPUTE;

    #[test]
    fn single_family_aliases_every_role() {
        let families = [family(GFX | COMPUTE | XFER)];
        let resolved = map_queue_families(&families, QueueRequirements::default(), |_| Ok(true))
            .unwrap()
            .resolve(QueueRequirements::default())
            .unwrap();

        assert_eq!(resolved.graphics, 0);
        assert_eq!(resolved.present, 0);
        assert_eq!(resolved.transfer, 0);
        assert_eq!(resolved.unique_families(), vec![0]);
        assert_eq!(resolved.image_sharing().0, vk::SharingMode::EXCLUSIVE);
    }

    #[test]
    fn present_on_separate_family_uses_concurrent_sharing() {
        let families = [family(GFX | XFER), family(COMPUTE)];
        let resolved = map_queue_families(&families, QueueRequirements::default(), |i| Ok(i == 1))
            .unwrap()
            .resolve(QueueRequirements::default())
            .unwrap();

        assert_eq!(resolved.graphics, 0);
        assert_eq!(resolved.present, 1);
        assert_eq!(resolved.unique_families(), vec![0, 1]);
        assert_eq!(
            resolved.image_sharing(),
            (vk::SharingMode::CONCURRENT, vec![0, 1])
        );
    }

    #[test]
    fn dedicated_transfer_skips_graphics_families() {
        let families = [family(GFX | XFER), family(COMPUTE | XFER), family(XFER)];
        let requirements = QueueRequirements {
            dedicated_transfer: true,
        };
        let resolved = map_queue_families(&families, requirements, |i| Ok(i == 0))
            .unwrap()
            .resolve(requirements)
            .unwrap();

        assert_eq!(resolved.transfer, 1);
        assert_eq!(resolved.unique_families(), vec![0, 1]);
        assert_eq!(resolved.buffer_sharing().0, vk::SharingMode::CONCURRENT);
    }

    #[test]
    fn missing_dedicated_transfer_is_capability_missing() {
        let families = [family(GFX | XFER)];
        let requirements = QueueRequirements {
            dedicated_transfer: true,
        };
        let indices = map_queue_families(&families, requirements, |_| Ok(true)).unwrap();
        assert!(matches!(
            indices.resolve(requirements),
            Err(RenderError::CapabilityMissing { .. })
        ));
    }

    #[test]
    fn transfer_falls_back_to_graphics_family() {
        let families = [family(GFX)];
        let resolved = map_queue_families(&families, QueueRequirements::default(), |_| Ok(true))
            .unwrap()
            .resolve(QueueRequirements::default())
            .unwrap();
        assert_eq!(resolved.transfer, resolved.graphics);
    }

    #[test]
    fn no_present_support_is_capability_missing() {
        let families = [family(GFX | XFER)];
        let result = map_queue_families(&families, QueueRequirements::default(), |_| Ok(false))
            .unwrap()
            .resolve(QueueRequirements::default());
        match result {
            Err(RenderError::CapabilityMissing { capability }) => {
                assert!(capability.contains("present"));
            }
            other => panic!("expected CapabilityMissing, got {other:?}"),
        }
    }

    #[test]
    fn stops_querying_once_resolved() {
        let families = [family(GFX | XFER), family(GFX | XFER), family(XFER)];
        let mut queried = Vec::new();
        map_queue_families(&families, QueueRequirements::default(), |i| {
            queried.push(i);
            Ok(true)
        })
        .unwrap();
        assert_eq!(queried, vec![0]);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(GFX | XFER);
        empty.queue_count = 0;
        let families = [empty, family(GFX | XFER)];
        let indices =
            map_queue_families(&families, QueueRequirements::default(), |_| Ok(true)).unwrap();
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn surface_query_errors_propagate() {
        let families = [family(GFX)];
        let result = map_queue_families(&families, QueueRequirements::default(), |_| {
            Err(RenderError::backend("surface support query")(
                vk::Result::ERROR_SURFACE_LOST_KHR,
            ))
        });
        assert!(result.is_err());
    }
}
