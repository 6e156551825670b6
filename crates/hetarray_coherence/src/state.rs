//! Coherence state machine.
//!
//! The controller never inspects flags ad hoc: it takes a [`RefreshInputs`]
//! snapshot of an array and asks [`plan_refresh`] what to do. Classification
//! and planning are pure so every transition can be tested without a backend.

use hetarray_compute::Location;
use serde::{Deserialize, Serialize};

use crate::error::{CoherenceError, CoherenceResult};
use crate::validity::ValidityMap;

/// Observable coherence state of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoherenceState {
    /// Root array with at least one valid copy.
    RootValid,
    /// Root array invalid everywhere whose children tile it and all hold
    /// newer data.
    RootStaleRebuildableFromChildren,
    /// Root array invalid everywhere; its last contents at `base` must be
    /// fetched and overlaid with the updated children.
    RootStaleNeedsDeviceFetch {
        /// Location holding the last valid contents.
        base: Location,
    },
    /// Child array with at least one valid copy.
    ChildValid,
    /// Child array invalid everywhere.
    ChildStale,
}

impl CoherenceState {
    /// Whether some location holds the current data.
    pub fn is_valid(&self) -> bool {
        matches!(self, CoherenceState::RootValid | CoherenceState::ChildValid)
    }
}

/// Everything the planner needs to know about one array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshInputs {
    /// Current validity.
    pub validity: ValidityMap,
    /// Whether the array is a child.
    pub has_parent: bool,
    /// Whether the parent is valid at the refresh target.
    pub parent_valid_at_target: bool,
    /// Whether the array has registered children.
    pub has_children: bool,
    /// Children tile the array exactly and every one of them is updated.
    pub children_rebuild_all: bool,
    /// Where the array was last valid, while children hold newer data.
    pub rebuild_base: Option<Location>,
    /// Valid locations with a direct copy path to the target.
    pub direct_sources: ValidityMap,
}

/// How a parent is reassembled at the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    /// Copy every child into the parent's host storage.
    Simple,
    /// Fetch the contents last valid at `base`, then overlay updated children.
    Complex {
        /// Location of the base copy.
        base: Location,
    },
}

/// Action that makes an array valid at a target location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Nothing to do.
    AlreadyValid,
    /// Extract the array's region from its parent, valid at the target.
    DeriveFromParent,
    /// Copy the whole array from another valid location.
    CopyFrom {
        /// Source location.
        src: Location,
    },
    /// Reassemble the array at the host from its children, then copy it to
    /// the target when that is a device.
    Rebuild(RebuildKind),
    /// Make the parent valid at the target first, then derive.
    RefreshParentThenDerive,
}

/// Classify an array.
pub fn classify(inputs: &RefreshInputs) -> CoherenceState {
    match (inputs.has_parent, inputs.validity.is_empty()) {
        (true, false) => CoherenceState::ChildValid,
        (true, true) => CoherenceState::ChildStale,
        (false, false) => CoherenceState::RootValid,
        (false, true) if inputs.has_children && inputs.children_rebuild_all => {
            CoherenceState::RootStaleRebuildableFromChildren
        }
        (false, true) => CoherenceState::RootStaleNeedsDeviceFetch {
            base: inputs.rebuild_base.unwrap_or(Location::Host),
        },
    }
}

/// Choose how to make an array valid at `target`.
pub fn plan_refresh(inputs: &RefreshInputs, target: Location) -> CoherenceResult<RefreshPlan> {
    if inputs.validity.is_valid(target) {
        return Ok(RefreshPlan::AlreadyValid);
    }
    if inputs.has_parent && inputs.parent_valid_at_target {
        return Ok(RefreshPlan::DeriveFromParent);
    }
    if !inputs.validity.is_empty() {
        return Ok(RefreshPlan::CopyFrom {
            src: choose_source(inputs, target),
        });
    }
    if inputs.has_children {
        if inputs.children_rebuild_all {
            return Ok(RefreshPlan::Rebuild(RebuildKind::Simple));
        }
        if let Some(base) = inputs.rebuild_base {
            return Ok(RefreshPlan::Rebuild(RebuildKind::Complex { base }));
        }
    }
    if inputs.has_parent {
        return Ok(RefreshPlan::RefreshParentThenDerive);
    }
    Err(CoherenceError::violation(format!(
        "no valid copy to refresh {} from",
        target
    )))
}

/// Copy source for a target the array is not valid at.
///
/// Devices prefer a direct peer, then the host, then any device (bounced
/// through the host). The host takes the first valid device.
fn choose_source(inputs: &RefreshInputs, target: Location) -> Location {
    if target.is_host() {
        return inputs.validity.first_device().unwrap_or(Location::Host);
    }
    if let Some(peer) = inputs.direct_sources.first_device() {
        return peer;
    }
    if inputs.validity.is_valid(Location::Host) {
        return Location::Host;
    }
    inputs.validity.first_device().unwrap_or(Location::Host)
}

/// Base kept by an ancestor whose child was just written.
///
/// The host is preferred since it needs no fetch. An ancestor already
/// invalid keeps the base it has.
pub fn rebuild_base_after_child_write(
    validity: ValidityMap,
    current: Option<Location>,
) -> Option<Location> {
    if validity.is_empty() {
        return current;
    }
    if validity.is_valid(Location::Host) {
        return Some(Location::Host);
    }
    validity.first_device().or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetarray_compute::DeviceId;

    const GPU0: Location = Location::Device(DeviceId::gpu(0));
    const GPU1: Location = Location::Device(DeviceId::gpu(1));

    fn root(validity: ValidityMap) -> RefreshInputs {
        RefreshInputs {
            validity,
            has_parent: false,
            parent_valid_at_target: false,
            has_children: false,
            children_rebuild_all: false,
            rebuild_base: None,
            direct_sources: ValidityMap::empty(),
        }
    }

    fn child(validity: ValidityMap, parent_valid_at_target: bool) -> RefreshInputs {
        RefreshInputs {
            has_parent: true,
            parent_valid_at_target,
            ..root(validity)
        }
    }

    #[test]
    fn test_already_valid() {
        let inputs = root(ValidityMap::host_only());
        assert_eq!(
            plan_refresh(&inputs, Location::Host).unwrap(),
            RefreshPlan::AlreadyValid
        );
        assert_eq!(classify(&inputs), CoherenceState::RootValid);
    }

    #[test]
    fn test_root_copies_from_host_or_peer() {
        let inputs = root(ValidityMap::host_only());
        assert_eq!(
            plan_refresh(&inputs, GPU0).unwrap(),
            RefreshPlan::CopyFrom {
                src: Location::Host
            }
        );

        let mut validity = ValidityMap::host_only();
        validity.set(GPU0);
        let inputs = RefreshInputs {
            direct_sources: ValidityMap::only(GPU0),
            ..root(validity)
        };
        assert_eq!(
            plan_refresh(&inputs, GPU1).unwrap(),
            RefreshPlan::CopyFrom { src: GPU0 }
        );
    }

    #[test]
    fn test_device_only_copy_without_peer_bounces() {
        let inputs = root(ValidityMap::only(GPU0));
        // No direct path: the source is still the device; the controller
        // refreshes the host from it first.
        assert_eq!(
            plan_refresh(&inputs, GPU1).unwrap(),
            RefreshPlan::CopyFrom { src: GPU0 }
        );
        assert_eq!(
            plan_refresh(&inputs, Location::Host).unwrap(),
            RefreshPlan::CopyFrom { src: GPU0 }
        );
    }

    #[test]
    fn test_child_derives_from_parent() {
        let inputs = child(ValidityMap::empty(), true);
        assert_eq!(classify(&inputs), CoherenceState::ChildStale);
        assert_eq!(
            plan_refresh(&inputs, GPU0).unwrap(),
            RefreshPlan::DeriveFromParent
        );

        let inputs = child(ValidityMap::empty(), false);
        assert_eq!(
            plan_refresh(&inputs, GPU0).unwrap(),
            RefreshPlan::RefreshParentThenDerive
        );
    }

    #[test]
    fn test_written_child_copies_from_itself() {
        let inputs = child(ValidityMap::only(GPU1), false);
        assert_eq!(classify(&inputs), CoherenceState::ChildValid);
        assert_eq!(
            plan_refresh(&inputs, Location::Host).unwrap(),
            RefreshPlan::CopyFrom { src: GPU1 }
        );
    }

    #[test]
    fn test_stale_parent_rebuilds() {
        let covered = RefreshInputs {
            has_children: true,
            children_rebuild_all: true,
            rebuild_base: Some(GPU0),
            ..root(ValidityMap::empty())
        };
        assert_eq!(
            classify(&covered),
            CoherenceState::RootStaleRebuildableFromChildren
        );
        assert_eq!(
            plan_refresh(&covered, GPU1).unwrap(),
            RefreshPlan::Rebuild(RebuildKind::Simple)
        );

        let partial = RefreshInputs {
            children_rebuild_all: false,
            ..covered
        };
        assert_eq!(
            classify(&partial),
            CoherenceState::RootStaleNeedsDeviceFetch { base: GPU0 }
        );
        assert_eq!(
            plan_refresh(&partial, Location::Host).unwrap(),
            RefreshPlan::Rebuild(RebuildKind::Complex { base: GPU0 })
        );
    }

    #[test]
    fn test_disabled_intermediate_derives() {
        // A child with children of its own, invalidated by its parent.
        let inputs = RefreshInputs {
            has_children: true,
            ..child(ValidityMap::empty(), false)
        };
        assert_eq!(
            plan_refresh(&inputs, Location::Host).unwrap(),
            RefreshPlan::RefreshParentThenDerive
        );
    }

    #[test]
    fn test_nothing_valid_is_violation() {
        let inputs = root(ValidityMap::empty());
        let err = plan_refresh(&inputs, Location::Host).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rebuild_base_choice() {
        let mut both = ValidityMap::only(GPU0);
        both.set(Location::Host);
        assert_eq!(
            rebuild_base_after_child_write(both, None),
            Some(Location::Host)
        );
        assert_eq!(
            rebuild_base_after_child_write(ValidityMap::only(GPU1), None),
            Some(GPU1)
        );
        assert_eq!(
            rebuild_base_after_child_write(ValidityMap::empty(), Some(GPU0)),
            Some(GPU0)
        );
    }
}
