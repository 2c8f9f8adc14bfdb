use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::Fusion;

use crate::kernel_cache::{CachedKernel, get_or_compile_kernel, is_cached, prune_unused};
use crate::test::helpers::*;
use crate::{Argument, FuserConfig, FusionExecutorCache, HostKernel, interpreter::HostBackend, kernel::KernelBackend};

#[test]
fn test_identical_fusions_share_a_module() {
    let (first, _) = pointwise_fusion();
    let (second, _) = pointwise_fusion();
    let a = host_executor(&first);
    let b = host_executor(&second);
    assert_eq!(a.kernel_code(), b.kernel_code());
    assert!(Arc::ptr_eq(a.module().unwrap(), b.module().unwrap()));

    let (other, _) = row_sum_fusion();
    let c = host_executor(&other);
    assert!(!Arc::ptr_eq(a.module().unwrap(), c.module().unwrap()));
}

fn host_module(code: &str) -> Result<CachedKernel, &'static str> {
    let (fusion, _) = pointwise_fusion();
    let kernel = fuser_lower::GpuLower::new(&fusion).unwrap().into_kernel();
    Ok(CachedKernel {
        kernel: Box::new(HostKernel::new(kernel)),
        backend: "keyed-by-source".into(),
        code: code.into(),
        entry_point: "k".into(),
    })
}

#[test]
fn test_lookup_matches_the_full_source() {
    let sources: Vec<String> = (0..64).map(|i| format!("// keyed by source {i}")).collect();
    let modules: Vec<_> = sources
        .iter()
        .map(|code| get_or_compile_kernel(code, "keyed-by-source", || host_module(code)).unwrap())
        .collect();
    for (code, module) in sources.iter().zip(&modules) {
        let hit = get_or_compile_kernel(code, "keyed-by-source", || Err("not called")).unwrap();
        assert_eq!(&hit.code, code);
        assert!(std::sync::Arc::ptr_eq(&hit, module));
    }
}

/// `t1 = t0 * 3.5; t2 = t1 - 1.25`, unique to this test so no other test
/// holds its modules.
fn scaled_fusion() -> Fusion {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.mul(t0, 3.5).unwrap();
    let t2 = fusion.sub(t1, 1.25).unwrap();
    fusion.add_output(t2).unwrap();
    fusion
}

#[test]
fn test_evicted_runtime_releases_its_module() {
    let cache = FusionExecutorCache::with_config(scaled_fusion(), FuserConfig::builder().cache_capacity(1).build());
    let vectorized: [Argument; 1] = [float(&input(4, 8)).into()];
    let scalar: [Argument; 1] = [float(&input(3, 5)).into()];

    let code = |args: &[Argument]| {
        let runtime = cache.runtime_for(args).unwrap();
        runtime.executors()[0].kernel_code().unwrap().to_string()
    };
    let first = code(&vectorized);
    assert!(is_cached(&first, HostBackend.name()));

    let second = code(&scalar);
    assert_ne!(first, second);
    assert!(!cache.is_compiled(&vectorized));
    assert!(!is_cached(&first, HostBackend.name()));
    assert!(is_cached(&second, HostBackend.name()));

    cache.clear();
    prune_unused();
    assert!(!is_cached(&second, HostBackend.name()));
}

#[test]
fn test_failed_compile_is_not_cached() {
    let code = "// fails to compile once";
    let err = get_or_compile_kernel(code, "test-backend", || Err::<CachedKernel, _>("broken")).unwrap_err();
    assert_eq!(err, "broken");

    let (fusion, _) = pointwise_fusion();
    let kernel = fuser_lower::GpuLower::new(&fusion).unwrap().into_kernel();
    let compiled = get_or_compile_kernel(code, "test-backend", || {
        Ok::<_, &str>(CachedKernel {
            kernel: Box::new(HostKernel::new(kernel)),
            backend: "test-backend".into(),
            code: code.into(),
            entry_point: "k".into(),
        })
    })
    .unwrap();
    assert_eq!(compiled.entry_point, "k");

    let hit = get_or_compile_kernel(code, "test-backend", || Err::<CachedKernel, _>("not called")).unwrap();
    assert!(Arc::ptr_eq(&compiled, &hit));
}

#[test]
fn test_backend_is_part_of_the_key() {
    let code = "// keyed by backend";
    let make = |backend: &str| {
        let (fusion, _) = pointwise_fusion();
        let kernel = fuser_lower::GpuLower::new(&fusion).unwrap().into_kernel();
        Ok::<_, &str>(CachedKernel {
            kernel: Box::new(HostKernel::new(kernel)),
            backend: backend.into(),
            code: code.into(),
            entry_point: "k".into(),
        })
    };
    let host = get_or_compile_kernel(code, HostBackend.name(), || make(HostBackend.name())).unwrap();
    let other = get_or_compile_kernel(code, "other", || make("other")).unwrap();
    assert!(!Arc::ptr_eq(&host, &other));
    assert_eq!(other.backend, "other");
}
