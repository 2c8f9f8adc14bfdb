use crate::error::ScheduleError;
use crate::test::helpers::{centering_fusion, row_sum_fusion};
use crate::{ComputeAtRootDomainMap, PairwiseRootDomainMap};

#[test]
fn test_pairwise_skips_new_broadcast_axes() {
    let (fusion, [_, t1, t2, _]) = centering_fusion();
    let map = PairwiseRootDomainMap::new(&fusion, t1, t2).unwrap();
    let t1_root = fusion.tv(t1).domain().root().to_vec();
    let t2_root = fusion.tv(t2).domain().root().to_vec();
    assert_eq!(map.pairs(), &[(t1_root[0], t2_root[0])]);
    assert!(!map.producer_to_consumer().contains_key(&t1_root[1]));
    assert!(!map.consumer_to_producer().contains_key(&t2_root[1]));
}

#[test]
fn test_pairwise_requires_direct_edge() {
    let (fusion, [t0, _, t2]) = row_sum_fusion();
    assert!(matches!(
        PairwiseRootDomainMap::new(&fusion, t0, t2),
        Err(ScheduleError::NotAProducer { producer, consumer }) if producer == t0 && consumer == t2
    ));
}

#[test]
fn test_reduction_axis_maps_to_its_producer() {
    let (fusion, [t0, t1, t2]) = row_sum_fusion();
    let map = ComputeAtRootDomainMap::build(&fusion);
    let t0_root = fusion.tv(t0).domain().root().to_vec();
    let t2_root = fusion.tv(t2).domain().root().to_vec();
    assert!(map.can_map(t0, t0_root[1], t2, t2_root[1]));
    assert!(map.can_map(t0, t0_root[0], t2, t2_root[0]));
    assert!(!map.can_map(t0, t0_root[0], t2, t2_root[1]));
    assert_eq!(map.mappable_pairs(&fusion, t1, t2).len(), 2);
}

#[test]
fn test_reduction_axis_does_not_map_downstream() {
    let (fusion, [t0, t1, t2, t3]) = centering_fusion();
    let map = ComputeAtRootDomainMap::build(&fusion);
    let t0_root = fusion.tv(t0).domain().root().to_vec();
    let t1_root = fusion.tv(t1).domain().root().to_vec();
    let t2_root = fusion.tv(t2).domain().root().to_vec();
    let t3_root = fusion.tv(t3).domain().root().to_vec();

    assert!(map.can_map(t1, t1_root[0], t3, t3_root[0]));
    assert!(!map.can_map(t1, t1_root[1], t3, t3_root[1]));
    assert!(map.can_map(t0, t0_root[1], t3, t3_root[1]));
    assert!(map.can_map(t2, t2_root[1], t3, t3_root[1]));
    assert_eq!(map.mappable_pairs(&fusion, t2, t3).len(), 2);
    assert_eq!(map.mappable_pairs(&fusion, t0, t1).len(), 2);
}
