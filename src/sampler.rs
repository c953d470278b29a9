use ash::vk;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Linear,
    #[default]
    Nearest,
}

impl FilterMode {
    pub(crate) fn to_vk(self) -> vk::Filter {
        match self {
            FilterMode::Linear => vk::Filter::LINEAR,
            FilterMode::Nearest => vk::Filter::NEAREST,
        }
    }

    pub(crate) fn mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
            FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    ClampToEdge,
}

impl WrapMode {
    pub(crate) fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
            WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }
}

/// Sampler description. Doubles as the key of the device sampler cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerState {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub wrap_w: WrapMode,
    /// Zero disables anisotropic filtering.
    pub max_anisotropy: f32,
}

impl SamplerState {
    pub fn linear() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            ..Self::default()
        }
    }

    pub fn with_wrap(mut self, wrap: WrapMode) -> Self {
        self.wrap_u = wrap;
        self.wrap_v = wrap;
        self.wrap_w = wrap;
        self
    }

    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy = max_anisotropy;
        self
    }

    /// Anisotropy to request, clamped to what the device allows.
    pub(crate) fn effective_anisotropy(&self, supported: bool, device_max: f32) -> Option<f32> {
        if !supported || self.max_anisotropy <= 0.0 {
            return None;
        }
        Some(self.max_anisotropy.min(device_max))
    }

    fn anisotropy_bits(&self) -> u32 {
        // Treat -0.0 and 0.0 as the same key
        if self.max_anisotropy == 0.0 {
            0
        } else {
            self.max_anisotropy.to_bits()
        }
    }
}

impl PartialEq for SamplerState {
    fn eq(&self, other: &Self) -> bool {
        self.min_filter == other.min_filter
            && self.mag_filter == other.mag_filter
            && self.wrap_u == other.wrap_u
            && self.wrap_v == other.wrap_v
            && self.wrap_w == other.wrap_w
            && self.anisotropy_bits() == other.anisotropy_bits()
    }
}

impl Eq for SamplerState {}

impl Hash for SamplerState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_filter.hash(state);
        self.mag_filter.hash(state);
        self.wrap_u.hash(state);
        self.wrap_v.hash(state);
        self.wrap_w.hash(state);
        self.anisotropy_bits().hash(state);
    }
}

/// Cached sampler handle. Owned by the device cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler(pub(crate) vk::Sampler);

impl Sampler {
    pub fn raw(&self) -> vk::Sampler {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equal_states_collapse_to_one_key() {
        let mut keys = HashSet::new();
        keys.insert(SamplerState::linear().with_anisotropy(8.0));
        keys.insert(SamplerState::linear().with_anisotropy(8.0));
        keys.insert(SamplerState::linear().with_anisotropy(-0.0));
        keys.insert(SamplerState::linear());
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn anisotropy_is_clamped_and_optional() {
        let state = SamplerState::default().with_anisotropy(32.0);
        assert_eq!(state.effective_anisotropy(true, 16.0), Some(16.0));
        assert_eq!(state.effective_anisotropy(false, 16.0), None);
        assert_eq!(SamplerState::default().effective_anisotropy(true, 16.0), None);
    }
}
