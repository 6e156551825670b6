//! Parent/child registry and ghost links.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::array::ArrayId;
use crate::error::{CoherenceError, CoherenceResult};
use crate::region::{classify_overlap, Overlap, Region};

/// Halo band shared by two sibling children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapLink {
    /// Axis the siblings are adjacent along.
    pub axis: usize,
    /// Sibling whose region starts first along `axis`.
    pub lower: ArrayId,
    /// Sibling whose region starts last along `axis`.
    pub upper: ArrayId,
    /// Shared cells, in parent coordinates.
    pub band: Region,
}

impl OverlapLink {
    /// Width of the band along the link axis.
    pub fn width(&self) -> usize {
        self.band.len(self.axis)
    }

    /// Cells each side owns when both sides were written: half the band,
    /// at least one.
    pub fn halo(&self) -> usize {
        (self.width() / 2).max(1)
    }

    /// Whether `id` is one of the two siblings.
    pub fn involves(&self, id: ArrayId) -> bool {
        self.lower == id || self.upper == id
    }
}

/// Children of one parent.
#[derive(Debug, Default)]
pub(crate) struct ChildRegistry {
    children: BTreeMap<Region, ArrayId>,
    links: Vec<OverlapLink>,
    /// Parent gained exclusive ownership; children are stale until resolved.
    pub children_disabled: bool,
    /// Children tile the parent exactly.
    pub totally_cover: bool,
}

impl ChildRegistry {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, region: &Region) -> Option<ArrayId> {
        self.children.get(region).copied()
    }

    pub fn children(&self) -> Vec<ArrayId> {
        self.children.values().copied().collect()
    }

    pub fn regions(&self) -> impl Iterator<Item = (&Region, &ArrayId)> {
        self.children.iter()
    }

    pub fn links(&self) -> &[OverlapLink] {
        &self.links
    }

    pub fn has_links(&self, id: ArrayId) -> bool {
        self.links.iter().any(|l| l.involves(id))
    }

    /// Links a child at `region` would need with the current children.
    ///
    /// Fails if an overlap is not a halo band, or if a child would end up
    /// with more than one neighbour on the same side of an axis.
    pub fn plan_links(&self, id: ArrayId, region: &Region) -> CoherenceResult<Vec<OverlapLink>> {
        let mut links = Vec::new();
        for (other_region, &other) in &self.children {
            if let Overlap::Band {
                axis,
                first_is_lower,
                band,
            } = classify_overlap(region, other_region)?
            {
                let (lower, upper) = if first_is_lower { (id, other) } else { (other, id) };
                links.push(OverlapLink {
                    axis,
                    lower,
                    upper,
                    band,
                });
            }
        }

        let all: Vec<&OverlapLink> = self.links.iter().chain(links.iter()).collect();
        for link in &links {
            for side in [link.lower, link.upper] {
                let as_lower = all
                    .iter()
                    .filter(|l| l.axis == link.axis && l.lower == side)
                    .count();
                let as_upper = all
                    .iter()
                    .filter(|l| l.axis == link.axis && l.upper == side)
                    .count();
                if as_lower > 1 || as_upper > 1 {
                    return Err(CoherenceError::violation(format!(
                        "{} would have more than two ghost neighbours along axis {}",
                        side, link.axis
                    )));
                }
            }
        }
        Ok(links)
    }

    pub fn insert(&mut self, region: Region, id: ArrayId, links: Vec<OverlapLink>, parent_shape: &[usize]) {
        self.children.insert(region, id);
        self.links.extend(links);
        self.recompute_cover(parent_shape);
    }

    pub fn remove(&mut self, id: ArrayId, parent_shape: &[usize]) {
        self.children.retain(|_, &mut child| child != id);
        self.links.retain(|l| !l.involves(id));
        self.recompute_cover(parent_shape);
    }

    fn recompute_cover(&mut self, parent_shape: &[usize]) {
        let regions: Vec<&Region> = self.children.keys().collect();
        self.totally_cover = children_cover(parent_shape, &regions);
    }
}

/// Whether `regions` tile an array of `shape` exactly: pairwise disjoint,
/// with volumes summing to the array's.
pub fn children_cover(shape: &[usize], regions: &[&Region]) -> bool {
    if regions.is_empty() {
        return false;
    }
    let total: usize = shape.iter().product();
    let covered: usize = regions.iter().map(|r| r.volume()).sum();
    if covered != total {
        return false;
    }
    regions.iter().enumerate().all(|(i, a)| {
        regions[i + 1..]
            .iter()
            .all(|b| a.intersect(b).is_none())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayDesc, ArrayEntry, Arena};

    fn r(origin: &[usize], end: &[usize]) -> Region {
        Region::new(origin, end).unwrap()
    }

    fn ids(n: usize) -> Vec<ArrayId> {
        let mut arena: Arena<()> = Arena::default();
        (0..n)
            .map(|_| {
                let desc = ArrayDesc::new(1, &[1]).unwrap();
                arena.insert(ArrayEntry::root(desc, vec![0]))
            })
            .collect()
    }

    #[test]
    fn test_cover() {
        let halves = [r(&[0], &[49]), r(&[50], &[99])];
        assert!(children_cover(&[100], &halves.iter().collect::<Vec<_>>()));

        let gap = [r(&[0], &[49]), r(&[51], &[99])];
        assert!(!children_cover(&[100], &gap.iter().collect::<Vec<_>>()));

        // Overlap and gap that cancel out in volume.
        let skewed = [r(&[0], &[50]), r(&[50], &[98])];
        assert!(!children_cover(&[100], &skewed.iter().collect::<Vec<_>>()));
        assert!(!children_cover(&[100], &[]));
    }

    #[test]
    fn test_registry_links_and_cover() {
        let id = ids(3);
        let shape = [20, 4];
        let mut registry = ChildRegistry::default();

        let a = r(&[0, 0], &[10, 3]);
        let links = registry.plan_links(id[0], &a).unwrap();
        assert!(links.is_empty());
        registry.insert(a, id[0], links, &shape);

        let b = r(&[9, 0], &[19, 3]);
        let links = registry.plan_links(id[1], &b).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].lower, id[0]);
        assert_eq!(links[0].upper, id[1]);
        assert_eq!(links[0].width(), 2);
        assert_eq!(links[0].halo(), 1);
        registry.insert(b, id[1], links, &shape);

        assert!(registry.has_links(id[0]));
        assert!(!registry.totally_cover);

        registry.remove(id[1], &shape);
        assert!(!registry.has_links(id[0]));
        assert_eq!(registry.children(), vec![id[0]]);
    }

    #[test]
    fn test_third_neighbour_rejected() {
        let id = ids(3);
        let shape = [30];
        let mut registry = ChildRegistry::default();

        let a = r(&[0], &[15]);
        registry.insert(a, id[0], Vec::new(), &shape);
        let b = r(&[14], &[29]);
        let links = registry.plan_links(id[1], &b).unwrap();
        registry.insert(b, id[1], links, &shape);

        // Another upper neighbour for the first child.
        let c = r(&[12], &[20]);
        assert!(registry.plan_links(id[2], &c).is_err());
    }
}
