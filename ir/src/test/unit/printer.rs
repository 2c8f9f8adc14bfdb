use super::fusion::diamond_fusion;

#[test]
fn test_print_math_lists_every_expression() {
    let (fusion, t) = diamond_fusion();
    let text = fusion.print_math();
    assert!(text.starts_with("Inputs:"));
    assert!(text.contains("%kernel_math {"));
    assert_eq!(text.matches(" = ").count(), 7);
    assert!(text.contains(&format!("T{} + T{}", t[1].index(), t[4].index())));
}

#[test]
fn test_tensor_notation() {
    let (fusion, t) = diamond_fusion();
    let text = fusion.tensor_to_string(t[0]);
    assert!(text.starts_with(&format!("T{}_l[ iS", t[0].index())), "{text}");
    assert!(!text.contains("ca_pos"));
}
