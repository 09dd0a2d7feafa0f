//! Owned 8-bit monochrome sensor frame.
//!
//! The wavefront sensor path is fixed at 8 bpp, so unlike a generic
//! machine-vision frame there is no pixel-format parameter. The
//! [machine_vision_formats] traits are implemented for `Mono8` so the
//! image-processing crates can stay generic over `ImageStride<Mono8>`.

use machine_vision_formats::{
    pixel_format::Mono8, ImageBuffer, ImageBufferMutRef, ImageBufferRef, ImageData, ImageMutData,
    Stride,
};

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a `Vec<u8>` as the backing store for a frame.
    ///
    /// Returns `None` if the buffer is too small for the requested
    /// geometry.
    pub fn new(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Option<Self> {
        if stride < width {
            return None;
        }
        let sz = stride as usize * (height as usize - 1) + width as usize;
        if data.len() < sz {
            return None;
        }
        Some(Self {
            width,
            height,
            stride,
            data,
        })
    }

    /// Allocate a zero-filled frame with packed rows.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width,
            data: vec![0u8; width as usize * height as usize],
        }
    }

    /// Allocate a frame filled with `value`, packed rows.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            stride: width,
            data: vec![value; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes occupied by the pixel data.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.stride as usize + x as usize]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut u8 {
        &mut self.data[y as usize * self.stride as usize + x as usize]
    }

    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.width as usize]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

fn _test_frame_is_send() {
    fn implements<T: Send>() {}
    implements::<Frame>();
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {{ {}x{} }}", self.width, self.height)
    }
}

impl ImageData<Mono8> for Frame {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn buffer_ref(&self) -> ImageBufferRef<'_, Mono8> {
        ImageBufferRef::new(&self.data)
    }
    fn buffer(self) -> ImageBuffer<Mono8> {
        ImageBuffer::new(self.data)
    }
}

impl ImageMutData<Mono8> for Frame {
    fn buffer_mut_ref(&mut self) -> ImageBufferMutRef<'_, Mono8> {
        ImageBufferMutRef::new(&mut self.data)
    }
}

impl Stride for Frame {
    fn stride(&self) -> usize {
        self.stride as usize
    }
}

impl From<Frame> for Vec<u8> {
    fn from(orig: Frame) -> Vec<u8> {
        orig.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_short_buffer() {
        assert!(Frame::new(16, 16, 16, vec![0u8; 255]).is_none());
        assert!(Frame::new(16, 16, 16, vec![0u8; 256]).is_some());
        // stride smaller than width is invalid
        assert!(Frame::new(16, 16, 8, vec![0u8; 256]).is_none());
    }

    #[test]
    fn strided_last_row() {
        // last row only needs `width` valid bytes, not `stride`
        let stride = 20;
        let data = vec![7u8; stride * 9 + 16];
        let im = Frame::new(16, 10, stride as u32, data).unwrap();
        assert_eq!(im.pixel(15, 9), 7);
        assert_eq!(im.row(9).len(), 16);
    }

    #[test]
    fn pixel_addressing() {
        let mut im = Frame::zeros(8, 4);
        *im.pixel_mut(3, 2) = 99;
        assert_eq!(im.pixel(3, 2), 99);
        assert_eq!(im.row(2)[3], 99);
        let bytes: Vec<u8> = im.into();
        assert_eq!(bytes[2 * 8 + 3], 99);
    }
}
