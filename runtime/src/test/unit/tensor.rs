use fuser_dtype::DataType;
use fuser_ir::ConstValue;
use ndarray::{Array2, ArrayD, IxDyn};

use crate::tensor::{Argument, HostTensor, contiguous_strides, required_len};

#[test]
fn test_from_vec_is_row_major() {
    let t = HostTensor::from_vec(DataType::Float, &[2, 3], (0..6).map(f64::from).collect()).unwrap();
    assert_eq!(t.strides(), &[3, 1]);
    assert_eq!(t.get(&[1, 2]), Some(5.0));
    assert_eq!(t.get(&[2, 0]), None);
    assert!(HostTensor::from_vec(DataType::Float, &[2, 3], vec![0.0; 5]).is_err());
}

#[test]
fn test_transposed_array_keeps_memory_order() {
    let a = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f64);
    let t = HostTensor::from_array(DataType::Double, a.t().into_dyn());
    assert_eq!(t.sizes(), &[3, 2]);
    assert_eq!(t.strides(), &[1, 3]);
    assert!(!t.is_contiguous_at(0));
    assert!(!t.is_contiguous_at(1));
    assert_eq!(t.to_array(), a.t().to_owned().into_dyn());
}

#[test]
fn test_values_are_rounded_to_the_dtype() {
    let t = HostTensor::from_vec(DataType::Int32, &[3], vec![1.7, -2.5, 3.0]).unwrap();
    assert_eq!(t.storage(), &[1.0, -2.0, 3.0]);
    let h = HostTensor::from_vec(DataType::Half, &[1], vec![1.0 + 1e-4]).unwrap();
    assert_eq!(h.storage(), &[1.0]);
}

#[test]
fn test_strided_views() {
    // Every other column of a 2x4 buffer.
    let t = HostTensor::strided(DataType::Float, &[2, 2], &[4, 2], (0..8).map(f64::from).collect()).unwrap();
    assert_eq!(t.to_array(), ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.0, 2.0, 4.0, 6.0]).unwrap());
    assert!(!t.is_contiguous_at(1));
    assert!(t.is_contiguous_at(0));

    assert!(HostTensor::strided(DataType::Float, &[2, 2], &[4, 2], vec![0.0; 6]).is_err());
    assert!(HostTensor::strided(DataType::Float, &[2, 2], &[-1, 1], vec![0.0; 8]).is_err());
    assert!(HostTensor::strided(DataType::Float, &[2], &[1, 1], vec![0.0; 8]).is_err());
}

#[test]
fn test_unit_dimensions_never_break_contiguity() {
    let t = HostTensor::strided(DataType::Float, &[4, 1, 3], &[3, 100, 1], vec![0.0; 12]).unwrap();
    assert!((0..3).all(|d| t.is_contiguous_at(d)));
}

#[test]
fn test_layout_helpers() {
    assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
    assert_eq!(contiguous_strides(&[2, 0, 4]), vec![4, 4, 1]);
    assert_eq!(required_len(&[2, 3], &[3, 1]), 6);
    assert_eq!(required_len(&[2, 3], &[1, 2]), 6);
    assert_eq!(required_len(&[2, 0], &[1, 2]), 0);
    assert_eq!(required_len(&[], &[]), 1);
}

#[test]
fn test_argument_conversions() {
    assert_eq!(Argument::from(2.5), Argument::Scalar(ConstValue::Float(2.5)));
    assert_eq!(Argument::from(3i64), Argument::Scalar(ConstValue::Int(3)));
    let t = HostTensor::zeros(DataType::Float, &[2, 2]);
    let arg = Argument::from(t.clone());
    assert_eq!(arg.as_tensor(), Some(&t));
    let fuser_schedule::ArgInfo::Tensor { sizes, strides, .. } = arg.arg_info() else { panic!("expected a tensor") };
    assert_eq!((sizes, strides), (vec![2, 2], vec![2, 1]));
}
