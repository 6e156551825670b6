//! Axis-aligned regions and their placement inside dense arrays.
//!
//! Regions are stored in the rank of the array they index (1 to 3 axes, the
//! last axis contiguous). For transfers every shape is widened to three axes
//! by prepending length-one axes, so axis 2 is always the innermost.

use std::cmp::Ordering;
use std::fmt;

use hetarray_compute::RectLayout;
use serde::{Deserialize, Serialize};

use crate::error::{CoherenceError, CoherenceResult};

/// Maximum array rank.
pub const MAX_RANK: usize = 3;

/// Inclusive `[origin, end]` box, one pair per axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    origin: Vec<usize>,
    end: Vec<usize>,
}

impl Region {
    /// Create a region from inclusive bounds.
    pub fn new(origin: &[usize], end: &[usize]) -> CoherenceResult<Self> {
        if origin.is_empty() || origin.len() > MAX_RANK {
            return Err(CoherenceError::violation(format!(
                "region rank {} outside 1..={}",
                origin.len(),
                MAX_RANK
            )));
        }
        if origin.len() != end.len() {
            return Err(CoherenceError::violation(format!(
                "region origin has {} axes, end has {}",
                origin.len(),
                end.len()
            )));
        }
        if let Some(axis) = (0..origin.len()).find(|&a| end[a] < origin[a]) {
            return Err(CoherenceError::violation(format!(
                "region axis {} ends at {} before it starts at {}",
                axis, end[axis], origin[axis]
            )));
        }
        Ok(Self {
            origin: origin.to_vec(),
            end: end.to_vec(),
        })
    }

    /// Region of `lengths` cells starting at `origin`.
    pub fn span(origin: &[usize], lengths: &[usize]) -> CoherenceResult<Self> {
        if lengths.iter().any(|&l| l == 0) {
            return Err(CoherenceError::violation("region with an empty axis"));
        }
        if origin.len() != lengths.len() {
            return Err(CoherenceError::violation(format!(
                "region origin has {} axes, lengths have {}",
                origin.len(),
                lengths.len()
            )));
        }
        let end: Vec<usize> = origin.iter().zip(lengths).map(|(o, l)| o + l - 1).collect();
        Self::new(origin, &end)
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.origin.len()
    }

    /// First cell per axis.
    pub fn origin(&self) -> &[usize] {
        &self.origin
    }

    /// Last cell per axis (inclusive).
    pub fn end(&self) -> &[usize] {
        &self.end
    }

    /// Length along `axis`.
    pub fn len(&self, axis: usize) -> usize {
        self.end[axis] - self.origin[axis] + 1
    }

    /// Lengths along every axis.
    pub fn extent(&self) -> Vec<usize> {
        (0..self.rank()).map(|a| self.len(a)).collect()
    }

    /// Number of cells.
    pub fn volume(&self) -> usize {
        (0..self.rank()).map(|a| self.len(a)).product()
    }

    /// Whether the region lies inside an array of `shape`.
    pub fn fits_within(&self, shape: &[usize]) -> bool {
        shape.len() == self.rank() && self.end.iter().zip(shape).all(|(&e, &s)| e < s)
    }

    /// Whether `other` lies entirely inside this region.
    pub fn contains(&self, other: &Region) -> bool {
        self.rank() == other.rank()
            && (0..self.rank())
                .all(|a| self.origin[a] <= other.origin[a] && other.end[a] <= self.end[a])
    }

    /// Common cells, if any.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.rank() != other.rank() {
            return None;
        }
        let mut origin = Vec::with_capacity(self.rank());
        let mut end = Vec::with_capacity(self.rank());
        for a in 0..self.rank() {
            let lo = self.origin[a].max(other.origin[a]);
            let hi = self.end[a].min(other.end[a]);
            if lo > hi {
                return None;
            }
            origin.push(lo);
            end.push(hi);
        }
        Some(Region { origin, end })
    }

    /// This region expressed in the coordinates of `outer`, which must contain it.
    pub fn relative_to(&self, outer: &Region) -> Option<Region> {
        if !outer.contains(self) {
            return None;
        }
        Some(Region {
            origin: self.origin.iter().zip(&outer.origin).map(|(a, b)| a - b).collect(),
            end: self.end.iter().zip(&outer.origin).map(|(a, b)| a - b).collect(),
        })
    }

    /// Copy of this region with `axis` narrowed to `[origin, end]`.
    pub fn with_axis(&self, axis: usize, origin: usize, end: usize) -> Region {
        let mut region = self.clone();
        region.origin[axis] = origin;
        region.end[axis] = end;
        region
    }

    /// Whether the region occupies one contiguous byte range of a dense
    /// array of `shape`: once an axis is partial, every outer axis has
    /// length one.
    pub fn is_contiguous_in(&self, shape: &[usize]) -> bool {
        let dims = dims3(shape);
        let (origin, lengths) = self.padded();
        let mut partial = false;
        for axis in (0..MAX_RANK).rev() {
            if partial && lengths[axis] != 1 {
                return false;
            }
            if origin[axis] != 0 || lengths[axis] != dims[axis] {
                partial = true;
            }
        }
        true
    }

    /// Byte offset of the first cell in a dense array of `shape`.
    pub fn byte_offset_in(&self, shape: &[usize], elem_size: usize) -> usize {
        let dims = dims3(shape);
        let (origin, _) = self.padded();
        (origin[0] * dims[1] * dims[2] + origin[1] * dims[2] + origin[2]) * elem_size
    }

    /// Placement of this region inside a dense array of `shape`, with the
    /// byte extent of the rectangle.
    pub fn layout_in(&self, shape: &[usize], elem_size: usize) -> (RectLayout, [usize; 3]) {
        let dims = dims3(shape);
        let (origin, lengths) = self.padded();
        let layout = RectLayout {
            origin: [origin[2] * elem_size, origin[1], origin[0]],
            row_pitch: dims[2] * elem_size,
            slice_pitch: dims[1] * dims[2] * elem_size,
        };
        (layout, [lengths[2] * elem_size, lengths[1], lengths[0]])
    }

    fn padded(&self) -> ([usize; 3], [usize; 3]) {
        let mut origin = [0; MAX_RANK];
        let mut lengths = [1; MAX_RANK];
        let pad = MAX_RANK - self.rank();
        for a in 0..self.rank() {
            origin[pad + a] = self.origin[a];
            lengths[pad + a] = self.len(a);
        }
        (origin, lengths)
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.origin
            .cmp(&other.origin)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for a in 0..self.rank() {
            if a > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..={}", self.origin[a], self.end[a])?;
        }
        write!(f, "]")
    }
}

/// Widen a shape of rank 0 to 3 into three axes, innermost last.
pub fn dims3(shape: &[usize]) -> [usize; 3] {
    let mut dims = [1; MAX_RANK];
    let pad = MAX_RANK.saturating_sub(shape.len());
    for (a, &len) in shape.iter().take(MAX_RANK).enumerate() {
        dims[pad + a] = len;
    }
    dims
}

/// Dense layout and byte extent of a whole array of `shape`.
pub fn dense_layout(shape: &[usize], elem_size: usize) -> (RectLayout, [usize; 3]) {
    let dims = dims3(shape);
    let extent = [dims[2] * elem_size, dims[1], dims[0]];
    (RectLayout::dense(extent), extent)
}

/// How two sibling regions overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlap {
    /// No common cell.
    Disjoint,
    /// A halo band: the regions differ along exactly `axis`, where neither
    /// contains the other. `first_is_lower` tells which side starts first.
    Band {
        /// Axis the siblings are adjacent along.
        axis: usize,
        /// Whether the first region is the lower neighbour.
        first_is_lower: bool,
        /// Shared cells.
        band: Region,
    },
}

/// Classify the overlap of two sibling regions.
///
/// Overlaps that are not a one-axis halo band (nested regions, corner
/// overlaps) cannot be kept coherent and are rejected.
pub fn classify_overlap(a: &Region, b: &Region) -> CoherenceResult<Overlap> {
    let band = match a.intersect(b) {
        Some(band) => band,
        None => return Ok(Overlap::Disjoint),
    };

    let differing: Vec<usize> = (0..a.rank())
        .filter(|&axis| a.origin[axis] != b.origin[axis] || a.end[axis] != b.end[axis])
        .collect();
    if differing.len() != 1 {
        return Err(CoherenceError::violation(format!(
            "regions {} and {} overlap along {} axes",
            a,
            b,
            differing.len()
        )));
    }

    let axis = differing[0];
    let first_is_lower = a.origin[axis] < b.origin[axis] && a.end[axis] < b.end[axis];
    let second_is_lower = b.origin[axis] < a.origin[axis] && b.end[axis] < a.end[axis];
    if !first_is_lower && !second_is_lower {
        return Err(CoherenceError::violation(format!(
            "region {} nests inside {} along axis {}",
            if a.len(axis) < b.len(axis) { a } else { b },
            if a.len(axis) < b.len(axis) { b } else { a },
            axis
        )));
    }

    Ok(Overlap::Band {
        axis,
        first_is_lower,
        band,
    })
}
