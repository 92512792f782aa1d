// rust/feed-core/src/prefetch/tensor.rs

use crate::memory::{BytesMut, BytesRef, DualLocationBuffer};

/// A shaped array of fixed-size elements backed by a [`DualLocationBuffer`].
#[derive(Debug)]
pub struct Tensor {
    shape: Vec<usize>,
    elem_size: usize,
    buffer: DualLocationBuffer,
}

impl Tensor {
    /// Creates an unshaped tensor whose elements are `elem_size` bytes.
    pub fn new(elem_size: usize) -> Self {
        Self {
            shape: Vec::new(),
            elem_size,
            buffer: DualLocationBuffer::new(0),
        }
    }

    pub fn with_shape(shape: &[usize], elem_size: usize) -> Self {
        let mut tensor = Self::new(elem_size);
        tensor.reshape(shape);
        tensor
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of elements; zero while unshaped.
    pub fn count(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    pub fn byte_len(&self) -> usize {
        self.count() * self.elem_size
    }

    /// Changes the shape. The backing memory is only reallocated when the
    /// byte length changes.
    pub fn reshape(&mut self, shape: &[usize]) {
        self.shape.clear();
        self.shape.extend_from_slice(shape);
        self.buffer.resize(self.byte_len());
    }

    /// Takes the shape and element size of `other`.
    pub fn reshape_like(&mut self, other: &Tensor) {
        self.elem_size = other.elem_size;
        self.reshape(&other.shape);
    }

    pub fn buffer(&self) -> &DualLocationBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut DualLocationBuffer {
        &mut self.buffer
    }

    pub fn host_bytes(&mut self) -> BytesRef<'_> {
        self.buffer.host_view()
    }

    pub fn host_bytes_mut(&mut self) -> BytesMut<'_> {
        self.buffer.mutable_host_view()
    }

    pub fn device_bytes(&mut self) -> BytesRef<'_> {
        self.buffer.device_view()
    }

    /// Copies the contents of `src`, which must have the same byte length,
    /// through device memory when `on_device` is set and host memory
    /// otherwise.
    pub fn copy_from(&mut self, src: &mut Tensor, on_device: bool) {
        if on_device {
            let from = src.buffer.device_view();
            self.buffer.mutable_device_view().copy_from_slice(&from);
        } else {
            let from = src.buffer.host_view();
            self.buffer.mutable_host_view().copy_from_slice(&from);
        }
    }

    /// Reads the tensor as little-endian `i32` elements.
    pub fn host_i32s(&mut self) -> Vec<i32> {
        self.host_bytes()
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }
}

/// One training step's worth of samples and, optionally, their labels.
#[derive(Debug)]
pub struct Batch {
    pub data: Tensor,
    /// One little-endian `i32` per sample.
    pub label: Option<Tensor>,
}

impl Batch {
    pub fn new(output_labels: bool) -> Self {
        Self {
            data: Tensor::new(1),
            label: output_labels.then(|| Tensor::new(4)),
        }
    }

    /// Number of samples, taken from the leading dimension.
    pub fn len(&self) -> usize {
        self.data.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
