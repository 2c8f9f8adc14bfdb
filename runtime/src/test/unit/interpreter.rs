use fuser_lower::{GpuLower, Kernel, TensorRole};

use crate::error::Error;
use crate::kernel::{ArgValue, CompiledKernel, LaunchDims, TensorArg};
use crate::test::helpers::*;
use crate::{HostKernel, interpreter::MAX_HOST_THREADS};

fn pointwise_kernel() -> Kernel {
    let (fusion, _) = pointwise_fusion();
    GpuLower::new(&fusion).unwrap().into_kernel()
}

/// One buffer per tensor parameter, inputs filled from `values`.
fn bind(kernel: &Kernel, sizes: &[usize], values: &[f64]) -> (Vec<ArgValue>, Vec<Vec<f64>>) {
    let numel: usize = sizes.iter().product();
    let strides = crate::tensor::contiguous_strides(sizes);
    let mut args = Vec::new();
    let mut buffers = Vec::new();
    for (tv, dtype, role, _) in kernel.tensor_params() {
        let buffer = match role {
            TensorRole::Input => values.to_vec(),
            _ => vec![0.0; numel],
        };
        args.push(ArgValue::Tensor(TensorArg {
            tv,
            buffer: buffers.len(),
            dtype,
            sizes: sizes.to_vec(),
            strides: strides.clone(),
        }));
        buffers.push(buffer);
    }
    (args, buffers)
}

fn single_thread() -> LaunchDims {
    LaunchDims { grid: [1; 3], block: [1; 3], shared_mem_bytes: 0 }
}

#[test]
fn test_serial_kernel_on_one_thread() {
    let kernel = pointwise_kernel();
    let values: Vec<f64> = (0..6).map(f64::from).collect();
    let (args, mut buffers) = bind(&kernel, &[2, 3], &values);
    HostKernel::new(kernel).launch(&single_thread(), &args, &mut buffers).unwrap();

    // Inputs come first, then the output.
    let expected: Vec<f64> = values.iter().map(|v| (v + 1.0) * 2.0).collect();
    assert_eq!(buffers[1], expected);
    assert_eq!(buffers[0], values);
}

#[test]
fn test_grid_beyond_limit_is_rejected() {
    let kernel = pointwise_kernel();
    let (args, mut buffers) = bind(&kernel, &[2, 3], &[0.0; 6]);
    let dims = LaunchDims { grid: [1 << 12, 1, 1], block: [1 << 11, 1, 1], shared_mem_bytes: 0 };
    let err = HostKernel::new(kernel).launch(&dims, &args, &mut buffers).unwrap_err();
    assert!(matches!(err, Error::LaunchTooLarge { threads, limit } if threads == 1 << 23 && limit == MAX_HOST_THREADS));
}

#[test]
fn test_short_buffer_is_out_of_bounds() {
    let kernel = pointwise_kernel();
    let (args, mut buffers) = bind(&kernel, &[2, 3], &[1.0, 2.0]);
    let err = HostKernel::new(kernel).launch(&single_thread(), &args, &mut buffers).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds { index: 2, len: 2, .. }), "{err}");
}

#[test]
fn test_kernel_name_is_entry_point() {
    let kernel = pointwise_kernel();
    let name = kernel.name.clone();
    assert_eq!(HostKernel::new(kernel).name(), name);
}
