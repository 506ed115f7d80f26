use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use cudarc::cublas::{result::CublasError, sys::cublasOperation_t, CudaBlas, Gemm, GemmConfig};
use cudarc::driver::{self, CudaContext, CudaSlice, CudaStream, DeviceRepr, DriverError};

use crate::backend::{
    AcceleratorDevice, AcceleratorPlatform, ComputeCapability, DeviceProperties, HostMatrix,
};

const BACKEND_NAME: &str = "nvidia";

/// CUDA driver + cuBLAS platform. Devices are addressed by driver ordinal.
pub struct NvidiaPlatform;

impl AcceleratorPlatform for NvidiaPlatform {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn device_count(&self) -> Result<usize> {
        driver::result::init().map_err(|err| cuda_call_err(None, "cuInit", err))?;
        let count = driver::result::device::get_count()
            .map_err(|err| cuda_call_err(None, "cuDeviceGetCount", err))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn open(&self, index: usize) -> Result<Box<dyn AcceleratorDevice>> {
        Ok(Box::new(NvidiaDevice::open(index)?))
    }
}

struct GemmBuffers<T> {
    a: CudaSlice<T>,
    b: CudaSlice<T>,
    results: Vec<CudaSlice<T>>,
}

enum DeviceOperands {
    Empty,
    Single(GemmBuffers<f32>),
    Double(GemmBuffers<f64>),
}

pub struct NvidiaDevice {
    properties: DeviceProperties,
    dimension: i32,
    operands: DeviceOperands,
    blas: CudaBlas,
    stream: Arc<CudaStream>,
    _ctx: Arc<CudaContext>,
}

impl NvidiaDevice {
    fn open(index: usize) -> Result<Self> {
        let ctx = CudaContext::new(index)
            .map_err(|err| cuda_call_err(Some(index), "cuCtxCreate", err))?;
        ctx.bind_to_thread()
            .map_err(|err| cuda_call_err(Some(index), "cuCtxSetCurrent", err))?;
        let stream = ctx.default_stream();
        let blas = CudaBlas::new(Arc::clone(&stream))
            .map_err(|err| cublas_call_err(index, "cublasCreate", err))?;

        let name = ctx
            .name()
            .map_err(|err| cuda_call_err(Some(index), "cuDeviceGetName", err))?;
        let (major, minor) = ctx
            .compute_capability()
            .map_err(|err| cuda_call_err(Some(index), "cuDeviceGetAttribute", err))?;
        let (free, total) = driver::result::mem_get_info()
            .map_err(|err| cuda_call_err(Some(index), "cuMemGetInfo", err))?;

        Ok(Self {
            properties: DeviceProperties {
                index,
                name,
                capability: ComputeCapability {
                    major: major as u32,
                    minor: minor as u32,
                },
                memory_total_bytes: total as u64,
                memory_free_bytes: free as u64,
            },
            dimension: 0,
            operands: DeviceOperands::Empty,
            blas,
            stream,
            _ctx: ctx,
        })
    }
}

impl AcceleratorDevice for NvidiaDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn upload(
        &mut self,
        dimension: usize,
        a: &HostMatrix,
        b: &HostMatrix,
        slots: usize,
    ) -> Result<()> {
        let index = self.properties.index;
        self.dimension = i32::try_from(dimension)
            .map_err(|_| anyhow!("matrix dimension {dimension} exceeds cuBLAS limits"))?;
        let expected = dimension * dimension;
        if a.len() != expected || b.len() != expected {
            bail!(
                "operands for device {index} hold {} and {} elements, expected {expected}",
                a.len(),
                b.len()
            );
        }
        self.operands = match (a, b) {
            (HostMatrix::Single(a), HostMatrix::Single(b)) => {
                DeviceOperands::Single(upload_buffers(&self.stream, index, a, b, slots)?)
            }
            (HostMatrix::Double(a), HostMatrix::Double(b)) => {
                DeviceOperands::Double(upload_buffers(&self.stream, index, a, b, slots)?)
            }
            _ => bail!("operand precision mismatch on device {index}"),
        };
        Ok(())
    }

    fn multiply(&mut self, slot: usize) -> Result<()> {
        let index = self.properties.index;
        let n = self.dimension;
        match &mut self.operands {
            DeviceOperands::Empty => bail!("device {index} has no operands uploaded"),
            DeviceOperands::Single(GemmBuffers { a, b, results }) => {
                let c = results
                    .get_mut(slot)
                    .ok_or_else(|| anyhow!("result slot {slot} out of range on device {index}"))?;
                unsafe { self.blas.gemm(gemm_config(n, 1.0f32, 0.0f32), a, b, c) }
                    .map_err(|err| cublas_call_err(index, "cublasSgemm", err))?;
            }
            DeviceOperands::Double(GemmBuffers { a, b, results }) => {
                let c = results
                    .get_mut(slot)
                    .ok_or_else(|| anyhow!("result slot {slot} out of range on device {index}"))?;
                unsafe { self.blas.gemm(gemm_config(n, 1.0f64, 0.0f64), a, b, c) }
                    .map_err(|err| cublas_call_err(index, "cublasDgemm", err))?;
            }
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        let index = self.properties.index;
        self.stream
            .synchronize()
            .map_err(|err| cuda_call_err(Some(index), "cuStreamSynchronize", err))
    }
}

fn upload_buffers<T: DeviceRepr>(
    stream: &Arc<CudaStream>,
    index: usize,
    a: &[T],
    b: &[T],
    slots: usize,
) -> Result<GemmBuffers<T>> {
    let dev_a = stream
        .memcpy_stod(a)
        .map_err(|err| cuda_call_err(Some(index), "cuMemcpyHtoD(A)", err))?;
    let dev_b = stream
        .memcpy_stod(b)
        .map_err(|err| cuda_call_err(Some(index), "cuMemcpyHtoD(B)", err))?;
    let mut results = Vec::with_capacity(slots);
    for _ in 0..slots {
        results.push(
            stream
                .memcpy_stod(a)
                .map_err(|err| cuda_call_err(Some(index), "cuMemcpyHtoD(C)", err))?,
        );
    }
    Ok(GemmBuffers {
        a: dev_a,
        b: dev_b,
        results,
    })
}

fn gemm_config<T>(n: i32, alpha: T, beta: T) -> GemmConfig<T> {
    GemmConfig {
        transa: cublasOperation_t::CUBLAS_OP_N,
        transb: cublasOperation_t::CUBLAS_OP_N,
        m: n,
        n,
        k: n,
        alpha,
        lda: n,
        ldb: n,
        beta,
        ldc: n,
    }
}

fn cuda_call_err(device: Option<usize>, call: &str, err: DriverError) -> anyhow::Error {
    match device {
        Some(index) => anyhow!("CUDA error at {call}: {err:?}, device index: {index}"),
        None => anyhow!("CUDA error at {call}: {err:?}"),
    }
}

fn cublas_call_err(index: usize, call: &str, err: CublasError) -> anyhow::Error {
    anyhow!("cuBLAS error at {call}: {err:?}, device index: {index}")
}
