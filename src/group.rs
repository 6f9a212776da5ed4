//! Engine-owned audio groups.
//!
//! Every source belongs to one group (group 0 unless moved). A group scales
//! the volume of its sources and can mute them all at once.

use parking_lot::RwLock;

/// Settings of one audio group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSettings {
    /// Disabled groups output silence.
    pub enabled: bool,
    /// Linear gain applied on top of each source's own volume.
    pub volume: f32,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 1.0,
        }
    }
}

/// The group table of one engine.
#[derive(Debug)]
pub struct AudioGroups {
    groups: RwLock<Vec<GroupSettings>>,
}

impl AudioGroups {
    /// Creates `count` enabled groups at unit volume.
    pub fn new(count: usize) -> Self {
        Self {
            groups: RwLock::new(vec![GroupSettings::default(); count]),
        }
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Returns `true` if the engine was configured without groups.
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Settings of group `index`.
    pub fn get(&self, index: usize) -> Option<GroupSettings> {
        self.groups.read().get(index).copied()
    }

    /// Enables or disables a group. Returns `false` for an unknown index.
    pub fn set_enabled(&self, index: usize, enabled: bool) -> bool {
        match self.groups.write().get_mut(index) {
            Some(group) => {
                group.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Sets a group's volume, clamped to be non-negative. Returns `false` for
    /// an unknown index.
    pub fn set_volume(&self, index: usize, volume: f32) -> bool {
        match self.groups.write().get_mut(index) {
            Some(group) => {
                group.volume = volume.max(0.0);
                true
            }
            None => false,
        }
    }

    /// The gain a source with `volume` in group `index` should play at.
    ///
    /// Sources in unknown groups play at their own volume.
    pub fn effective_gain(&self, index: usize, volume: f32) -> f32 {
        match self.get(index) {
            Some(group) if !group.enabled => 0.0,
            Some(group) => volume * group.volume,
            None => volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_start_enabled_at_unit_volume() {
        let groups = AudioGroups::new(2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.effective_gain(1, 0.5), 0.5);
    }

    #[test]
    fn test_disabled_group_is_silent() {
        let groups = AudioGroups::new(1);
        assert!(groups.set_enabled(0, false));
        assert_eq!(groups.effective_gain(0, 1.0), 0.0);
        groups.set_enabled(0, true);
        assert_eq!(groups.effective_gain(0, 1.0), 1.0);
    }

    #[test]
    fn test_group_volume_multiplies() {
        let groups = AudioGroups::new(1);
        groups.set_volume(0, 0.5);
        assert_eq!(groups.effective_gain(0, 0.5), 0.25);
        groups.set_volume(0, -3.0);
        assert_eq!(groups.get(0).unwrap().volume, 0.0);
    }

    #[test]
    fn test_unknown_group() {
        let groups = AudioGroups::new(1);
        assert!(!groups.set_volume(5, 0.1));
        assert_eq!(groups.effective_gain(5, 0.8), 0.8);
    }
}
