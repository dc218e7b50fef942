//! Host backend: kernels are C functions built by the system C compiler.
//!
//! Sources are written to a temporary directory, compiled into a shared
//! library and loaded with `libloading`. The entry point has the signature
//!
//! ```c
//! void NAME(void **args, const size_t *ix);
//! ```
//!
//! where `args[i]` points at argument `i` (the element storage for buffers,
//! an 8-byte aligned copy of the value for scalars) and `ix` holds
//! `[gid0, gid1, lid0, lid1, bid0, bid1, ls0, ls1, gs0, gs1]`. Launches run
//! every instance of the grid sequentially on the calling thread.
//!
//! A library may export `const unsigned int NAME_nargs` to declare how many
//! arguments the entry point reads; launches then require all of them to be
//! bound. Without it every slot up to the highest bound one is required.

use std::ffi::c_void;
use std::fmt;
use std::process::Command;
use std::ptr;

use libloading::Library;
use skein_device::{
    Buffer, Context, DeviceSpec, KernelArg, KernelFlags, KernelHandle, KernelOps, LaunchDims, OpsCapabilities,
    WeakBuffer,
};
use smallvec::SmallVec;
use tempfile::TempDir;
use tracing::debug;

use crate::config::HostConfig;
use crate::error::{CompilationSnafu, Error, InvalidArgumentSnafu, LaunchFailureSnafu, Result};

pub const BACKEND_NAME: &str = "host";

type EntryFn = unsafe extern "C" fn(args: *mut *mut c_void, ix: *const usize);

/// Preprocessor symbols defined (as `1`) for each flag present at compile time.
const FLAG_DEFINES: &[(KernelFlags, &str)] = &[
    (KernelFlags::CLUDA, "SKEIN_CLUDA"),
    (KernelFlags::SMALL, "SKEIN_SMALL"),
    (KernelFlags::DOUBLE, "SKEIN_DOUBLE"),
    (KernelFlags::COMPLEX, "SKEIN_COMPLEX"),
    (KernelFlags::HALF, "SKEIN_HALF"),
];

/// Source kinds the C compiler cannot consume.
const FOREIGN_SOURCES: KernelFlags =
    KernelFlags::BINARY.union(KernelFlags::PTX).union(KernelFlags::CUDA).union(KernelFlags::OPENCL);

/// Operations vector of the host backend.
#[derive(Debug, Clone)]
pub struct HostOps {
    config: HostConfig,
}

impl HostOps {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Backend configured from `SKEIN_HOST_*` variables.
    pub fn from_env() -> Self {
        Self::new(HostConfig::from_env())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// A fresh host context; buffers are tagged with its id.
    pub fn create_context(&self) -> Context {
        Context::new(BACKEND_NAME, DeviceSpec::Host, self.config.limits.clone())
    }

    /// Whether the configured compiler can be executed.
    pub fn compiler_available(&self) -> bool {
        Command::new(&self.config.compiler).arg("--version").output().is_ok_and(|out| out.status.success())
    }

    fn build_library(&self, source: &str, name: &str, flags: KernelFlags) -> Result<(Library, TempDir)> {
        let tmp_dir = tempfile::tempdir().map_err(|e| build_error(name, format!("cannot create temp directory: {e}")))?;
        let src_path = tmp_dir.path().join("kernel.c");
        let lib_path = tmp_dir.path().join(format!("kernel.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&src_path, source).map_err(|e| build_error(name, format!("cannot write source: {e}")))?;

        let mut command = Command::new(&self.config.compiler);
        command.args(["-shared", "-fPIC"]).arg(&self.config.opt_level);
        for (flag, define) in FLAG_DEFINES {
            if flags.contains(*flag) {
                command.arg(format!("-D{define}=1"));
            }
        }
        command.args(&self.config.extra_flags).arg("-o").arg(&lib_path).arg(&src_path).arg("-lm");

        let output = command
            .output()
            .map_err(|e| build_error(name, format!("cannot run '{}': {e}", self.config.compiler)))?;
        if !output.status.success() {
            return CompilationSnafu { name, log: String::from_utf8_lossy(&output.stderr).into_owned() }.fail();
        }

        // SAFETY: the library was just built from the caller's source; running
        // its initializers is running the caller's code.
        let lib = unsafe { Library::new(&lib_path) }
            .map_err(|e| build_error(name, format!("cannot load shared library: {e}")))?;
        Ok((lib, tmp_dir))
    }
}

impl Default for HostOps {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

#[derive(Debug, Clone)]
enum HostArg {
    /// Value bytes at the start of an aligned word.
    Scalar(u64),
    Buffer(WeakBuffer),
}

struct HostKernel {
    name: String,
    entry: EntryFn,
    max_args: u32,
    /// `max_args` comes from the library's `NAME_nargs` export.
    declared: bool,
    args: SmallVec<[Option<HostArg>; 8]>,
    _lib: Library,
    /// Keeps the shared object on disk while it is loaded.
    _tmp_dir: TempDir,
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.name)
            .field("max_args", &self.max_args)
            .field("declared", &self.declared)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl KernelOps for HostOps {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    /// Launch failures are detected before the entry point runs, so bound
    /// arguments are still valid afterwards.
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities { launch_failure_invalidates_args: false }
    }

    #[tracing::instrument(skip_all, fields(kernel.name = name))]
    fn compile(&self, ctx: &Context, sources: &[&str], name: &str, flags: KernelFlags) -> Result<KernelHandle> {
        let foreign = flags & FOREIGN_SOURCES;
        snafu::ensure!(
            foreign.is_empty(),
            InvalidArgumentSnafu { reason: format!("host backend cannot build {foreign:?} sources") }
        );

        let source = sources.concat();
        let (lib, tmp_dir) = self.build_library(&source, name, flags)?;

        // SAFETY: the symbol is only called through the documented entry ABI.
        let entry: EntryFn = unsafe { lib.get::<EntryFn>(name.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|e| build_error(name, format!("entry point not found: {e}")))?;

        let limit = ctx.limits().max_kernel_args;
        let nargs_symbol = format!("{name}_nargs");
        // SAFETY: `NAME_nargs` is documented as a `const unsigned int`.
        let declared = unsafe { lib.get::<*const u32>(nargs_symbol.as_bytes()) }.ok().map(|symbol| unsafe { **symbol });
        if let Some(count) = declared {
            snafu::ensure!(
                count <= limit,
                CompilationSnafu { name, log: format!("kernel declares {count} arguments, limit is {limit}") }
            );
        }

        debug!(kernel.declared_args = ?declared, compiler = %self.config.compiler, "host kernel loaded");
        let kernel = HostKernel {
            name: name.to_string(),
            entry,
            max_args: declared.unwrap_or(limit),
            declared: declared.is_some(),
            args: SmallVec::new(),
            _lib: lib,
            _tmp_dir: tmp_dir,
        };
        Ok(KernelHandle::new(BACKEND_NAME, kernel))
    }

    fn release(&self, handle: KernelHandle) -> Result<()> {
        let kernel = handle.into_inner::<HostKernel>()?;
        debug!(kernel.name = %kernel.name, "host kernel unloaded");
        Ok(())
    }

    fn max_args(&self, handle: &KernelHandle) -> u32 {
        handle.downcast_ref::<HostKernel>().map_or(0, |kernel| kernel.max_args)
    }

    fn set_arg(&self, handle: &mut KernelHandle, index: u32, arg: KernelArg<'_>) -> Result<()> {
        let kernel = handle.downcast_mut::<HostKernel>()?;
        snafu::ensure!(
            index < kernel.max_args,
            InvalidArgumentSnafu { reason: format!("argument index {index} out of range ({} slots)", kernel.max_args) }
        );

        let value = match arg {
            KernelArg::Scalar(scalar) => {
                let mut raw = [0u8; 8];
                raw[..scalar.as_bytes().len()].copy_from_slice(scalar.as_bytes());
                HostArg::Scalar(u64::from_ne_bytes(raw))
            }
            KernelArg::Buffer(buffer) => {
                // Fails early for device-only memory.
                buffer.host_ptr()?;
                HostArg::Buffer(buffer.downgrade())
            }
        };

        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize_with(index + 1, || None);
        }
        kernel.args[index] = Some(value);
        Ok(())
    }

    fn launch(&self, handle: &mut KernelHandle, dims: &LaunchDims) -> Result<()> {
        let kernel = handle.downcast_mut::<HostKernel>()?;
        check_limits(&self.config, dims)?;

        let required = if kernel.declared { kernel.max_args as usize } else { kernel.args.len() };
        let mut live: SmallVec<[Buffer; 8]> = SmallVec::new();
        let mut ptrs: SmallVec<[*mut c_void; 8]> = SmallVec::with_capacity(required);
        // Scalar pointers must all come from this single mutable pass over `kernel.args`.
        for (index, slot) in kernel.args.iter_mut().enumerate().take(required) {
            match slot {
                None => {
                    return LaunchFailureSnafu { reason: format!("argument {index} of '{}' is not bound", kernel.name) }
                        .fail();
                }
                Some(HostArg::Scalar(word)) => ptrs.push(ptr::from_mut(word).cast()),
                Some(HostArg::Buffer(weak)) => {
                    let buffer = weak.upgrade().ok_or_else(|| {
                        LaunchFailureSnafu { reason: format!("buffer bound to argument {index} was dropped") }.build()
                    })?;
                    let data = buffer
                        .host_ptr()
                        .map_err(|e| LaunchFailureSnafu { reason: format!("argument {index}: {e}") }.build())?;
                    ptrs.push(data.cast());
                    live.push(buffer);
                }
            }
        }
        snafu::ensure!(
            ptrs.len() == required,
            LaunchFailureSnafu { reason: format!("argument {} of '{}' is not bound", ptrs.len(), kernel.name) }
        );

        let [ls0, ls1] = dims.local;
        let [gs0, gs1] = dims.grid;
        let mut ix = [0, 0, 0, 0, 0, 0, ls0, ls1, gs0, gs1];
        for bid1 in 0..gs1 {
            for bid0 in 0..gs0 {
                for lid1 in 0..ls1 {
                    for lid0 in 0..ls0 {
                        ix[..6].copy_from_slice(&[bid0 * ls0 + lid0, bid1 * ls1 + lid1, lid0, lid1, bid0, bid1]);
                        // SAFETY: every pointer in `ptrs` targets storage kept alive by
                        // `kernel.args` or `live`, and `kernel.args` is not touched again
                        // until the loop ends.
                        unsafe { (kernel.entry)(ptrs.as_mut_ptr(), ix.as_ptr()) };
                    }
                }
            }
        }

        debug!(kernel.name = %kernel.name, kernel.args = ptrs.len(), instances = dims.total(), "host kernel finished");
        Ok(())
    }
}

fn check_limits(config: &HostConfig, dims: &LaunchDims) -> Result<()> {
    let limits = &config.limits;
    for dim in 0..2 {
        snafu::ensure!(
            dims.local[dim] <= limits.max_local_size[dim],
            LaunchFailureSnafu {
                reason: format!("local size {} exceeds {} in dimension {dim}", dims.local[dim], limits.max_local_size[dim])
            }
        );
        snafu::ensure!(
            dims.grid[dim] <= limits.max_grid_size[dim],
            LaunchFailureSnafu {
                reason: format!("grid size {} exceeds {} in dimension {dim}", dims.grid[dim], limits.max_grid_size[dim])
            }
        );
    }
    let block = dims.local[0] * dims.local[1];
    snafu::ensure!(
        block <= limits.max_local_total,
        LaunchFailureSnafu { reason: format!("block of {block} instances exceeds {}", limits.max_local_total) }
    );
    Ok(())
}

fn build_error(name: &str, log: String) -> Error {
    CompilationSnafu { name, log }.build()
}
