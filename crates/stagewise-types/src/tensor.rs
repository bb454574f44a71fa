// Tensor value types shared by the config layer, the scheduler and engines.
//
// Data is kept as raw little-endian bytes; the scheduler only needs element
// counts for buffer sizing and an f32 read of logits for greedy decoding.

use serde::{Deserialize, Serialize};

// ── Tensor Dtype ─────────────────────────────────────────────────────────────

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    F16,
    BF16,
    F32,
    I32,
    I64,
}

impl TensorDtype {
    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::I64 => 8,
        }
    }
}

// ── Device placement ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

/// Where a stage executes, or where a caller wants an output to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePlacement {
    pub kind: DeviceKind,
    #[serde(default)]
    pub ordinal: u32,
}

impl DevicePlacement {
    pub const CPU: Self = Self { kind: DeviceKind::Cpu, ordinal: 0 };

    pub fn cuda(ordinal: u32) -> Self {
        Self { kind: DeviceKind::Cuda, ordinal }
    }
}

impl Default for DevicePlacement {
    fn default() -> Self {
        Self::CPU
    }
}

impl std::fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DeviceKind::Cpu   => write!(f, "cpu:{}", self.ordinal),
            DeviceKind::Cuda  => write!(f, "cuda:{}", self.ordinal),
            DeviceKind::Metal => write!(f, "metal:{}", self.ordinal),
        }
    }
}

// ── Shapes ───────────────────────────────────────────────────────────────────

/// Number of elements in a concrete shape. `None` if any dimension is
/// symbolic (negative) or the product overflows.
pub fn element_count(shape: &[i64]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| {
        let d = usize::try_from(d).ok()?;
        acc.checked_mul(d)
    })
}

// ── Tensor ───────────────────────────────────────────────────────────────────

/// An owned tensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: TensorDtype,
    pub shape: Vec<i64>,
    pub data: Vec<u8>,
}

impl Tensor {
    /// Zero-filled tensor of the given concrete shape.
    pub fn zeros(dtype: TensorDtype, shape: Vec<i64>) -> Option<Self> {
        let len = element_count(&shape)?.checked_mul(dtype.element_bytes())?;
        Some(Self { dtype, shape, data: vec![0u8; len] })
    }

    pub fn from_i64(shape: Vec<i64>, values: &[i64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { dtype: TensorDtype::I64, shape, data }
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { dtype: TensorDtype::F32, shape, data }
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView { dtype: self.dtype, shape: &self.shape, data: &self.data }
    }
}

/// A borrowed tensor: either an owned [`Tensor`] or a region of a
/// pre-allocated buffer.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub dtype: TensorDtype,
    pub shape: &'a [i64],
    pub data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn to_owned_tensor(&self) -> Tensor {
        Tensor {
            dtype: self.dtype,
            shape: self.shape.to_vec(),
            data: self.data.to_vec(),
        }
    }

    /// Size of dimension `axis`, if the axis exists and is concrete.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape.get(axis).and_then(|&d| usize::try_from(d).ok())
    }

    /// Decode every element as `f32`. Integer tensors are converted lossily.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let width = self.dtype.element_bytes();
        self.data
            .chunks_exact(width)
            .map(|b| match self.dtype {
                TensorDtype::F16  => half::f16::from_le_bytes([b[0], b[1]]).to_f32(),
                TensorDtype::BF16 => half::bf16::from_le_bytes([b[0], b[1]]).to_f32(),
                TensorDtype::F32  => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                TensorDtype::I32  => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
                TensorDtype::I64  => i64::from_le_bytes(
                    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]],
                ) as f32,
            })
            .collect()
    }

    /// Decode an integer tensor. `None` for floating point dtypes.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self.dtype {
            TensorDtype::I64 => Some(
                self.data
                    .chunks_exact(8)
                    .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect(),
            ),
            TensorDtype::I32 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                    .collect(),
            ),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
