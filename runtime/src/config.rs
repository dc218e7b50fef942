//! Host backend configuration.
//!
//! Built explicitly with [`HostConfig::builder`] or read from the environment
//! with [`HostConfig::from_env`]:
//!
//! * `SKEIN_HOST_CC` - C compiler executable (default `cc`)
//! * `SKEIN_HOST_OPT` - optimization flag (default `-O2`)
//! * `SKEIN_HOST_CFLAGS` - extra whitespace-separated compiler flags

use bon::bon;
use skein_device::DeviceLimits;

pub const DEFAULT_COMPILER: &str = "cc";
pub const DEFAULT_OPT_LEVEL: &str = "-O2";

/// How the host backend builds and runs kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// C compiler used to build kernel sources into shared libraries.
    pub compiler: String,
    pub opt_level: String,
    /// Appended after the built-in flags.
    pub extra_flags: Vec<String>,
    /// Limits reported by host contexts.
    pub limits: DeviceLimits,
}

#[bon]
impl HostConfig {
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_COMPILER.to_string())] compiler: String,
        #[builder(into, default = DEFAULT_OPT_LEVEL.to_string())] opt_level: String,
        #[builder(default)] extra_flags: Vec<String>,
        #[builder(default = host_limits())] limits: DeviceLimits,
    ) -> Self {
        Self { compiler, opt_level, extra_flags, limits }
    }
}

impl HostConfig {
    /// Defaults overridden by `SKEIN_HOST_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(cc) = std::env::var("SKEIN_HOST_CC")
            && !cc.trim().is_empty()
        {
            config.compiler = cc.trim().to_string();
        }
        if let Ok(opt) = std::env::var("SKEIN_HOST_OPT")
            && !opt.trim().is_empty()
        {
            config.opt_level = opt.trim().to_string();
        }
        if let Ok(flags) = std::env::var("SKEIN_HOST_CFLAGS") {
            config.extra_flags = flags.split_whitespace().map(str::to_string).collect();
        }

        config
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Limits of the sequential host executor.
///
/// Blocks run one after another, so only the block-size heuristic cares about
/// `warp_size` (vector width) and `compute_units`.
pub fn host_limits() -> DeviceLimits {
    DeviceLimits {
        warp_size: 8,
        max_local_size: [1024, 1024],
        max_local_total: 1024,
        max_grid_size: [u32::MAX as usize, u32::MAX as usize],
        compute_units: std::thread::available_parallelism().map_or(1, |n| n.get()),
        max_kernel_args: 64,
    }
}
