/// Row-major interleaved image storage
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Image {
    pub fn new(data: Vec<u8>, width: usize, height: usize, channels: usize) -> Image {
        Image {
            data,
            width,
            height,
            channels,
        }
    }

    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
            channels: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the buffer length matches the declared shape
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width * self.height * self.channels
    }
}
