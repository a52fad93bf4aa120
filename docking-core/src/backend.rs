//! Execution backends for task launches.
//!
//! - `Serial`: items in order on the calling thread (reference behaviour)
//! - `Rayon`: items spread over the rayon pool, same per-item arithmetic
//! - `Cuda`: one CUDA thread per item, kernels compiled with NVRTC at first use
//!
//! Stages without a device kernel run their host code on the rayon pool
//! when handed a `Cuda` backend.

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
#[cfg(feature = "cuda")]
use std::sync::Arc;

use rayon::prelude::*;
use std::fmt;

use crate::error::{EngineError, Result};

#[derive(Clone)]
pub enum Backend {
    Serial,
    Rayon,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaDevice>),
}

impl Backend {
    /// CUDA when compiled in and a device opens, otherwise the rayon pool.
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        {
            match CudaDevice::new(0) {
                Ok(dev) => {
                    tracing::info!("CUDA device 0 opened, using GPU backend");
                    return Backend::Cuda(dev);
                }
                Err(e) => tracing::warn!("No CUDA device ({e}), using rayon backend"),
            }
        }
        Backend::Rayon
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "serial" => Ok(Backend::Serial),
            "rayon" | "cpu" => Ok(Backend::Rayon),
            "auto" => Ok(Backend::detect()),
            #[cfg(feature = "cuda")]
            "cuda" | "gpu" => CudaDevice::new(0)
                .map(Backend::Cuda)
                .map_err(|e| EngineError::backend("device", format!("cannot open CUDA device 0: {e}"))),
            #[cfg(not(feature = "cuda"))]
            "cuda" | "gpu" => Err(EngineError::InvalidConfig(
                "backend 'cuda' requires building with the `cuda` feature".into(),
            )),
            other => Err(EngineError::InvalidConfig(format!("unknown backend '{other}'"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Serial => "serial",
            Backend::Rayon => "rayon",
            #[cfg(feature = "cuda")]
            Backend::Cuda(_) => "cuda",
        }
    }

    /// Runs `f(item_index, item_output)` for every `width`-sized chunk of `out`.
    ///
    /// `f` must only read other buffers at `item_index`; no item may observe
    /// another item's output.
    pub fn map_items<F>(&self, out: &mut [f64], width: usize, f: F)
    where
        F: Fn(usize, &mut [f64]) + Send + Sync,
    {
        if width == 0 {
            return;
        }
        match self {
            Backend::Serial => out
                .chunks_mut(width)
                .enumerate()
                .for_each(|(i, chunk)| f(i, chunk)),
            _ => out
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(i, chunk)| f(i, chunk)),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Rayon
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device helpers shared by the integrator and fitness kernels.
#[cfg(feature = "cuda")]
pub(crate) mod device {
    use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, LaunchConfig};
    use cudarc::nvrtc::compile_ptx;
    use std::sync::Arc;

    use crate::error::{EngineError, Result};

    /// Compiles `src` into `module` unless it is already loaded, then returns `kernel`.
    pub fn kernel(
        dev: &Arc<CudaDevice>,
        stage: &str,
        module: &str,
        src: &str,
        kernel: &'static str,
    ) -> Result<CudaFunction> {
        if !dev.has_func(module, kernel) {
            let ptx = compile_ptx(src)
                .map_err(|e| EngineError::backend(stage, format!("NVRTC compile failed: {e:?}")))?;
            dev.load_ptx(ptx, module, &[kernel])
                .map_err(|e| EngineError::backend(stage, format!("PTX load failed: {e}")))?;
            tracing::debug!(stage, module, kernel, "CUDA kernel compiled");
        }
        dev.get_func(module, kernel)
            .ok_or_else(|| EngineError::backend(stage, format!("kernel '{kernel}' not found")))
    }

    pub fn upload(dev: &Arc<CudaDevice>, stage: &str, host: &[f64]) -> Result<CudaSlice<f64>> {
        dev.htod_sync_copy(host)
            .map_err(|e| EngineError::backend(stage, format!("upload failed: {e}")))
    }

    pub fn download(dev: &Arc<CudaDevice>, stage: &str, buf: &CudaSlice<f64>) -> Result<Vec<f64>> {
        dev.dtoh_sync_copy(buf)
            .map_err(|e| EngineError::backend(stage, format!("download failed: {e}")))
    }

    pub fn launch_config(items: usize) -> LaunchConfig {
        let block = 256;
        let grid = ((items + block - 1) / block).max(1) as u32;
        LaunchConfig {
            block_dim: (block as u32, 1, 1),
            grid_dim: (grid, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_and_rayon_agree() {
        let input: Vec<f64> = (0..300).map(|i| i as f64 * 0.37).collect();
        let run = |backend: Backend| {
            let mut out = vec![0.0; 200];
            backend.map_items(&mut out, 2, |i, chunk| {
                let a = &input[i * 3..i * 3 + 3];
                chunk[0] = a[0].sin() + a[1];
                chunk[1] = a[2] * a[2];
            });
            out
        };
        assert_eq!(run(Backend::Serial), run(Backend::Rayon));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(Backend::from_name("serial").unwrap().name(), "serial");
        assert_eq!(Backend::from_name("cpu").unwrap().name(), "rayon");
        assert!(matches!(
            Backend::from_name("tpu"),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_requires_feature() {
        assert!(Backend::from_name("cuda").is_err());
        assert_eq!(Backend::detect().name(), "rayon");
    }
}
