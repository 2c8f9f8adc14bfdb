use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::Fusion;
use ndarray::Axis;

use crate::test::helpers::*;
use crate::{Argument, CacheStats, FuserConfig, FusionExecutorCache, HostTensor, InputSignature};

fn cache(fusion: Fusion, capacity: usize) -> FusionExecutorCache {
    FusionExecutorCache::with_config(fusion, FuserConfig::builder().cache_capacity(capacity).build())
}

#[test]
fn test_repeated_signature_hits() {
    let (fusion, _) = pointwise_fusion();
    let cache = cache(fusion, 4);
    let x = input(4, 8);
    let args = [float(&x).into()];

    for _ in 0..3 {
        let outputs = cache.run_fusion_with_inputs(&args).unwrap();
        assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
    }
    assert_eq!(cache.stats(), CacheStats { hits: 2, misses: 1, entries: 1, evictions: 0 });
    assert!(cache.is_compiled(&args));

    let first = cache.most_recent_runtime().unwrap();
    let again = cache.runtime_for(&args).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
}

#[test]
fn test_new_shape_compiles_again() {
    let (fusion, _) = row_sum_fusion();
    let cache = cache(fusion, 4);
    for (rows, cols) in [(4, 100), (4, 3000), (4, 100)] {
        let x = input(rows, cols);
        let outputs = cache.run_fusion_with_inputs(&[float(&x).into()]).unwrap();
        assert_close(&outputs[0], &(&x * 2.0).sum_axis(Axis(1)).into_dyn(), 0.0);
    }
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 2, 2));
}

#[test]
fn test_least_recently_used_is_evicted() {
    let (fusion, _) = pointwise_fusion();
    let cache = cache(fusion, 2);
    let a: [Argument; 1] = [float(&input(2, 2)).into()];
    let b: [Argument; 1] = [float(&input(3, 3)).into()];
    let c: [Argument; 1] = [float(&input(4, 4)).into()];

    cache.run_fusion_with_inputs(&a).unwrap();
    cache.run_fusion_with_inputs(&b).unwrap();
    cache.run_fusion_with_inputs(&a).unwrap();
    cache.run_fusion_with_inputs(&c).unwrap();

    assert!(cache.is_compiled(&a));
    assert!(!cache.is_compiled(&b));
    assert!(cache.is_compiled(&c));
    assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 3, entries: 2, evictions: 1 });

    cache.clear();
    assert!(!cache.is_compiled(&a));
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn test_signature_covers_strides_and_scalars() {
    let x = input(3, 4);
    let contiguous = float(&x);
    let transposed = HostTensor::from_array(DataType::Float, x.t().into_dyn());
    let same_shape = float(&x.t().as_standard_layout().to_owned());
    assert_eq!(transposed.sizes(), same_shape.sizes());

    let sig = |args: &[Argument]| InputSignature::new(args);
    assert_ne!(sig(&[transposed.into()]), sig(&[same_shape.clone().into()]));
    assert_eq!(sig(&[same_shape.clone().into()]), sig(&[same_shape.into()]));
    assert_ne!(sig(&[contiguous.clone().into(), 1.0.into()]), sig(&[contiguous.clone().into(), 2.0.into()]));
    assert_ne!(sig(&[contiguous.clone().into(), 1.0.into()]), sig(&[contiguous.into(), 1i64.into()]));
}

#[test]
fn test_segmented_fusion_through_cache() {
    let (fusion, _) = conflicting_reductions();
    let cache = cache(fusion, 2);
    let x = input(16, 200);
    let outputs = cache.run_fusion_with_inputs(&[float(&x).into()]).unwrap();
    let rows = x.sum_axis(Axis(1)).insert_axis(Axis(1));
    assert_close(&outputs[0], &(&x + &rows).sum_axis(Axis(0)).into_dyn(), 0.0);
    assert!(cache.most_recent_runtime().unwrap().is_segmented());
}
