//! Buffer handles and rectangular copy descriptors.

use crate::device::DeviceId;
use crate::error::{ComputeError, ComputeResult};

/// Opaque handle to a device allocation.
///
/// Handles are cheap to clone; cloning never duplicates device memory.
pub trait Buffer: Clone + Send + Sync + 'static {
    /// Get the buffer size in bytes.
    fn size(&self) -> usize;

    /// Get the device this buffer is allocated on.
    fn device_id(&self) -> DeviceId;

    /// Whether this handle aliases a byte range of another buffer.
    fn is_sub_buffer(&self) -> bool;

    /// Byte offset inside the parent allocation (0 for owned buffers).
    fn parent_offset(&self) -> usize {
        0
    }
}

/// Placement of a rectangle inside a linear byte buffer.
///
/// Axis 0 is the innermost (contiguous) axis and is measured in bytes;
/// axes 1 and 2 are measured in rows and slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RectLayout {
    /// Origin of the rectangle: `[byte, row, slice]`.
    pub origin: [usize; 3],
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: usize,
    /// Bytes between the starts of consecutive slices.
    pub slice_pitch: usize,
}

impl RectLayout {
    /// Tightly packed layout for a block of `extent` (bytes, rows, slices).
    pub fn dense(extent: [usize; 3]) -> Self {
        Self {
            origin: [0, 0, 0],
            row_pitch: extent[0],
            slice_pitch: extent[0] * extent[1],
        }
    }

    /// Same pitches, different origin.
    pub fn with_origin(mut self, origin: [usize; 3]) -> Self {
        self.origin = origin;
        self
    }

    /// Byte offset of row `y` of slice `z` of the rectangle.
    pub fn row_offset(&self, y: usize, z: usize) -> usize {
        self.origin[0] + (self.origin[1] + y) * self.row_pitch + (self.origin[2] + z) * self.slice_pitch
    }

    /// Smallest buffer length able to hold a rectangle of `extent` at this origin.
    pub fn required_len(&self, extent: [usize; 3]) -> usize {
        if extent.iter().any(|&e| e == 0) {
            return 0;
        }
        self.row_offset(extent[1] - 1, extent[2] - 1) + extent[0]
    }

    fn validate(&self, extent: [usize; 3], len: usize, side: &str) -> ComputeResult<()> {
        if extent.iter().any(|&e| e == 0) {
            return Ok(());
        }
        if self.origin[0] + extent[0] > self.row_pitch && (extent[1] > 1 || extent[2] > 1) {
            return Err(ComputeError::TransferError(format!(
                "{} rows overlap: origin {} + width {} exceeds row pitch {}",
                side, self.origin[0], extent[0], self.row_pitch
            )));
        }
        let needed = self.required_len(extent);
        if needed > len {
            return Err(ComputeError::TransferError(format!(
                "{} rectangle needs {} bytes, buffer holds {}",
                side, needed, len
            )));
        }
        Ok(())
    }
}

/// A rectangular transfer between a device buffer and host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyRect {
    /// Placement on the device-buffer side.
    pub buffer: RectLayout,
    /// Placement on the host side.
    pub host: RectLayout,
    /// Size of the rectangle: `[bytes, rows, slices]`.
    pub extent: [usize; 3],
}

impl CopyRect {
    /// Copy of `len` contiguous bytes starting at offset 0 on both sides.
    pub fn linear(len: usize) -> Self {
        let extent = [len, 1, 1];
        Self {
            buffer: RectLayout::dense(extent),
            host: RectLayout::dense(extent),
            extent,
        }
    }

    /// Total number of bytes moved.
    pub fn bytes(&self) -> usize {
        self.extent.iter().product()
    }

    /// Check both sides against the lengths of the memory they address.
    pub fn validate(&self, buffer_len: usize, host_len: usize) -> ComputeResult<()> {
        self.buffer.validate(self.extent, buffer_len, "buffer")?;
        self.host.validate(self.extent, host_len, "host")
    }
}

/// Iterate `(src_offset, dst_offset)` for every row of a rectangle.
pub fn row_pairs(
    src: RectLayout,
    dst: RectLayout,
    extent: [usize; 3],
) -> impl Iterator<Item = (usize, usize)> {
    let rows = if extent[0] == 0 { 0 } else { extent[1] };
    (0..extent[2]).flat_map(move |z| {
        (0..rows).map(move |y| (src.row_offset(y, z), dst.row_offset(y, z)))
    })
}

/// Copy a rectangle between two linear byte buffers.
pub fn copy_rect(
    src: &[u8],
    src_layout: &RectLayout,
    dst: &mut [u8],
    dst_layout: &RectLayout,
    extent: [usize; 3],
) -> ComputeResult<()> {
    src_layout.validate(extent, src.len(), "source")?;
    dst_layout.validate(extent, dst.len(), "destination")?;

    let width = extent[0];
    for (s, d) in row_pairs(*src_layout, *dst_layout, extent) {
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layout() {
        let layout = RectLayout::dense([8, 4, 2]);
        assert_eq!(layout.row_pitch, 8);
        assert_eq!(layout.slice_pitch, 32);
        assert_eq!(layout.required_len([8, 4, 2]), 64);
        assert_eq!(layout.row_offset(1, 1), 40);
    }

    #[test]
    fn test_copy_rect_extracts_sub_block() {
        // 4x4 matrix of bytes 0..16, take rows 1..=2, columns 1..=2.
        let src: Vec<u8> = (0..16).collect();
        let src_layout = RectLayout::dense([4, 4, 1]).with_origin([1, 1, 0]);
        let dst_layout = RectLayout::dense([2, 2, 1]);
        let mut dst = vec![0u8; 4];

        copy_rect(&src, &src_layout, &mut dst, &dst_layout, [2, 2, 1]).unwrap();
        assert_eq!(dst, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_rect_bounds_checked() {
        let src = vec![0u8; 8];
        let mut dst = vec![0u8; 4];
        let err = copy_rect(
            &src,
            &RectLayout::dense([8, 1, 1]),
            &mut dst,
            &RectLayout::dense([4, 1, 1]),
            [8, 1, 1],
        )
        .unwrap_err();
        assert!(matches!(err, ComputeError::TransferError(_)));
    }

    #[test]
    fn test_copy_rect_empty_extent_is_noop() {
        let src: Vec<u8> = Vec::new();
        let mut dst: Vec<u8> = Vec::new();
        copy_rect(
            &src,
            &RectLayout::dense([0, 1, 1]),
            &mut dst,
            &RectLayout::dense([0, 1, 1]),
            [0, 1, 1],
        )
        .unwrap();
    }

    #[test]
    fn test_linear_rect() {
        let rect = CopyRect::linear(128);
        assert_eq!(rect.bytes(), 128);
        assert!(rect.validate(128, 128).is_ok());
        assert!(rect.validate(64, 128).is_err());
    }
}
