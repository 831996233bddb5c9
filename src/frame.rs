//! Raw camera frames as handed from a frame source to the evaluation cycle.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Immutable snapshot of the live feed at one point in time.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self { data, width, height, format }
    }

    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(data, width, height, PixelFormat::Rgb8)
    }

    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(data, width, height, PixelFormat::Rgba8)
    }

    /// Builds a frame by evaluating `pixel(x, y) -> [r, g, b]` for every position.
    pub fn from_fn<F>(width: u32, height: u32, mut pixel: F) -> Self
    where
        F: FnMut(u32, u32) -> [u8; 3],
    {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&pixel(x, y));
            }
        }
        Self::from_rgb(data, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// False for zero-sized frames or buffers that don't match the dimensions.
    pub fn is_ready(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * self.format.channels()
    }

    /// Luminance of the pixel at `(x, y)`. Caller guarantees the frame is ready
    /// and the position is in bounds.
    pub fn luma(&self, x: u32, y: u32) -> f64 {
        let channels = self.format.channels();
        let idx = (y as usize * self.width as usize + x as usize) * channels;
        let px = &self.data[idx..idx + 3];
        0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64
    }

    /// Horizontally flipped copy, matching what a mirrored preview shows.
    pub fn mirrored(&self) -> Self {
        if !self.is_ready() {
            return self.clone();
        }

        let channels = self.format.channels();
        let row_len = self.width as usize * channels;
        let mut data = Vec::with_capacity(self.data.len());

        for row in self.data.chunks_exact(row_len) {
            for px in row.chunks_exact(channels).rev() {
                data.extend_from_slice(px);
            }
        }

        Self::new(data, self.width, self.height, self.format)
    }

    /// Tightly packed RGB samples, dropping alpha if present.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        }
    }
}
