//! Sample and frame buffers passed through the render graph.

use montage_common::logging::GRAPH_TARGET;

/// A growable run of samples with a movable read/write offset.
///
/// Callers address the buffer through [`Samples::window`] and
/// [`Samples::window_mut`], which start at the current offset. The
/// attachment point moves the offset to each sub-fragment before invoking
/// a plugin and restores it afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples {
    data: Vec<f64>,
    offset: usize,
}

impl Samples {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
            offset: 0,
        }
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { data, offset: 0 }
    }

    /// Allocated length, independent of the offset.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Grow so that `len` samples fit after the current offset. Never shrinks.
    pub fn ensure(&mut self, len: usize) {
        let needed = self.offset + len;
        if self.data.len() < needed {
            self.data.resize(needed, 0.0);
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// `len` samples starting at the offset, truncated to what is allocated.
    pub fn window(&self, len: usize) -> &[f64] {
        let start = self.offset.min(self.data.len());
        let end = (self.offset + len).min(self.data.len());
        &self.data[start..end]
    }

    /// `len` samples starting at the offset, growing the buffer if needed.
    pub fn window_mut(&mut self, len: usize) -> &mut [f64] {
        self.ensure(len);
        &mut self.data[self.offset..self.offset + len]
    }

    /// Zero `len` samples at the offset.
    pub fn clear(&mut self, len: usize) {
        self.window_mut(len).fill(0.0);
    }

    /// Copy `len` samples from the window of `other` into this window.
    pub fn copy_from(&mut self, other: &Samples, len: usize) {
        let source = other.window(len);
        let target = self.window_mut(len);
        target[..source.len()].copy_from_slice(source);
        target[source.len()..].fill(0.0);
    }

    /// Reverse `len` samples at the offset in place.
    pub fn reverse(&mut self, len: usize) {
        self.window_mut(len).reverse();
    }

    /// Largest absolute value in the window.
    pub fn peak(&self, len: usize) -> f64 {
        self.window(len).iter().fold(0.0, |peak, s| peak.max(s.abs()))
    }
}

/// Where a frame's pixels currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLocation {
    #[default]
    Ram,
    /// Resident on the rendering device; must be transferred before CPU access.
    Device,
}

/// An RGBA frame with float channels in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
    location: FrameLocation,
    number: i64,
}

impl Frame {
    /// A transparent frame in RAM.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0; 4]; width as usize * height as usize],
            location: FrameLocation::Ram,
            number: -1,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [[f32; 4]] {
        &mut self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Timeline frame number stamped by the writer.
    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn set_number(&mut self, number: i64) {
        self.number = number;
    }

    /// Reallocate for new dimensions. Contents become transparent.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width != width || self.height != height {
            self.width = width;
            self.height = height;
            self.pixels = vec![[0.0; 4]; width as usize * height as usize];
        }
    }

    /// Make every pixel transparent black.
    pub fn clear(&mut self) {
        self.fill([0.0; 4]);
    }

    pub fn fill(&mut self, rgba: [f32; 4]) {
        self.pixels.fill(rgba);
    }

    pub fn copy_from(&mut self, other: &Frame) {
        self.resize(other.width, other.height);
        self.pixels.copy_from_slice(&other.pixels);
        self.location = other.location;
        self.number = other.number;
    }

    pub fn location(&self) -> FrameLocation {
        self.location
    }

    /// Move the pixels to `location`. Returns true if a transfer happened.
    pub fn transfer_to(&mut self, location: FrameLocation) -> bool {
        if self.location == location {
            return false;
        }
        tracing::debug!(
            target: GRAPH_TARGET,
            from = ?self.location,
            to = ?location,
            width = self.width,
            height = self.height,
            "Frame transfer"
        );
        self.location = location;
        true
    }

    /// Pack to 8-bit RGBA, row-major.
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .flat_map(|px| px.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_respects_offset_and_grows() {
        let mut samples = Samples::new(4);
        samples.window_mut(4).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        samples.set_offset(2);
        assert_eq!(samples.window(2), &[3.0, 4.0]);

        samples.window_mut(4)[3] = 9.0;
        assert_eq!(samples.capacity(), 6);
        samples.set_offset(0);
        assert_eq!(samples.window(6), &[1.0, 2.0, 3.0, 4.0, 0.0, 9.0]);
    }

    #[test]
    fn test_ensure_never_shrinks() {
        let mut samples = Samples::new(16);
        samples.ensure(4);
        assert_eq!(samples.capacity(), 16);
    }

    #[test]
    fn test_copy_from_zero_fills_short_source() {
        let source = Samples::from_vec(vec![0.5, -0.5]);
        let mut target = Samples::from_vec(vec![1.0; 4]);
        target.copy_from(&source, 4);
        assert_eq!(target.window(4), &[0.5, -0.5, 0.0, 0.0]);
        assert_eq!(target.peak(4), 0.5);
    }

    #[test]
    fn test_frame_transfer_is_tracked() {
        let mut frame = Frame::new(2, 2);
        assert!(!frame.transfer_to(FrameLocation::Ram));
        assert!(frame.transfer_to(FrameLocation::Device));
        assert_eq!(frame.location(), FrameLocation::Device);
    }

    #[test]
    fn test_rgba8_packing() {
        let mut frame = Frame::new(1, 1);
        frame.fill([1.0, 0.5, 0.0, 2.0]);
        assert_eq!(frame.to_rgba8(), vec![255, 128, 0, 255]);
    }
}
