//! Device identification and capability limits.

use std::fmt;

use crate::error::{InvalidDeviceSnafu, Result};

/// Local size the block-size heuristic aims for before hardware caps apply.
pub const TARGET_LOCAL_SIZE: usize = 256;

/// Identifies a backend device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    /// Host CPU, kernels built by the system C compiler.
    Host,
    /// CUDA device by ordinal.
    Cuda { device_id: usize },
}

impl DeviceSpec {
    /// Parse a device string.
    ///
    /// Examples:
    /// - "HOST" or "CPU" -> DeviceSpec::Host
    /// - "CUDA:1" -> DeviceSpec::Cuda { device_id: 1 }
    /// - "cuda" or "GPU" -> DeviceSpec::Cuda { device_id: 0 }
    pub fn parse(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        let mut parts = upper.splitn(2, ':');
        let kind = parts.next().unwrap_or_default();
        let ordinal = parts.next();

        match kind {
            "HOST" | "CPU" if ordinal.is_none() => Ok(Self::Host),
            "CUDA" | "GPU" => {
                let device_id = match ordinal {
                    Some(id) => id.parse().map_err(|_| InvalidDeviceSnafu { device: s }.build())?,
                    None => 0,
                };
                Ok(Self::Cuda { device_id })
            }
            _ => InvalidDeviceSnafu { device: s }.fail(),
        }
    }

    /// Device type key without the ordinal ("HOST", "CUDA").
    pub fn base_type(&self) -> &'static str {
        match self {
            Self::Host => "HOST",
            Self::Cuda { .. } => "CUDA",
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("HOST"),
            Self::Cuda { device_id } => write!(f, "CUDA:{device_id}"),
        }
    }
}

/// Hardware limits a context reports, used to pick launch geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Preferred multiple for the local size (warp / wavefront / SIMD width).
    pub warp_size: usize,
    /// Maximum local size per dimension.
    pub max_local_size: [usize; 2],
    /// Maximum product of local sizes.
    pub max_local_total: usize,
    /// Maximum grid size per dimension.
    pub max_grid_size: [usize; 2],
    /// Number of independent processors (SMs, compute units, cores).
    pub compute_units: usize,
    /// Maximum number of kernel arguments.
    pub max_kernel_args: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_local_size: [1024, 1024],
            max_local_total: 1024,
            max_grid_size: [i32::MAX as usize, 65535],
            compute_units: 1,
            max_kernel_args: 256,
        }
    }
}

impl DeviceLimits {
    /// Occupancy-aware local size for `n` instances along dimension `dim`.
    ///
    /// Starts from `n` rounded up to a warp multiple, capped at
    /// [`TARGET_LOCAL_SIZE`], the hardware limits and `budget` (block
    /// instances left over by the other dimension), then halves (staying on
    /// warp multiples) while there would be fewer blocks than compute units.
    /// Never returns 0.
    pub fn block_size_for(&self, dim: usize, n: usize, budget: usize) -> usize {
        let warp = self.warp_size.max(1);
        let cap = self.max_local_size[dim.min(1)].min(self.max_local_total).min(budget).max(1);
        let target = TARGET_LOCAL_SIZE.min(cap);

        let mut ls = n.max(1).div_ceil(warp).saturating_mul(warp).min(target);
        while ls > warp && n.div_ceil(ls) < self.compute_units {
            ls = ((ls / 2) / warp).max(1) * warp;
        }
        ls.max(1)
    }
}
