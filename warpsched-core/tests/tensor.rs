use warpsched_core::{DType, Error, Model};

fn root(err: &Error) -> &Error {
    match err {
        Error::WithBacktrace { inner, .. } => root(inner),
        e => e,
    }
}

#[test]
fn zero_component_rejected() {
    let mut m = Model::new("t");
    let err = m.tensor("x", &[3, 0, 2], DType::F32).unwrap_err();
    assert!(matches!(root(&err), Error::ShapeInvalid { .. }));
}

#[test]
fn rank_over_four_rejected() {
    let mut m = Model::new("t");
    let err = m.tensor("x", &[1, 2, 3, 4, 5], DType::F32).unwrap_err();
    assert!(matches!(root(&err), Error::ShapeInvalid { .. }));
}

#[test]
fn offset_law_on_views() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[4, 8], DType::F32).unwrap();
    let v = m.view(x, &[2, 3], &[1, 2]).unwrap();
    let t = m.get(v);
    // stride of axis 0 is ldims[1] = 8
    assert_eq!(t.offset_of(&[0, 0]), 1 * 8 + 2);
    assert_eq!(t.offset_of(&[1, 2]), 2 * 8 + 4);
    assert_eq!(t.byte_origin(), (8 + 2) * 4);
}

#[test]
fn view_out_of_bounds_rejected() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[4, 8], DType::F32).unwrap();
    // 3 + 2 > 4 on axis 0
    let err = m.view(x, &[3, 4], &[2, 0]).unwrap_err();
    assert!(matches!(root(&err), Error::ShapeInvalid { .. }));
}

#[test]
fn overlapping_sibling_views_rejected() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[4, 8], DType::F32).unwrap();
    let _a = m.view(x, &[2, 4], &[0, 0]).unwrap();
    let err = m.view(x, &[2, 4], &[1, 2]).unwrap_err();
    assert!(matches!(root(&err), Error::ShapeInvalid { .. }));
}

#[test]
fn disjoint_sibling_views_allowed() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[4, 8], DType::F32).unwrap();
    let _a = m.view(x, &[2, 4], &[0, 0]).unwrap();
    let _b = m.view(x, &[2, 4], &[2, 4]).unwrap();
}

#[test]
fn update_pads_monotonic() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[3, 5], DType::F32).unwrap();
    m.update_pads(x, &[1, 4]).unwrap();
    assert_eq!(m.get(x).pads().as_slice(), &[1, 4]);
    assert_eq!(m.get(x).ldims().as_slice(), &[3, 8]);

    m.update_pads(x, &[2, 3]).unwrap();
    // new pads are lcm of old and requested
    assert_eq!(m.get(x).pads().as_slice(), &[2, 12]);
    assert_eq!(m.get(x).ldims().as_slice(), &[4, 12]);

    // buffer grew with the stride skeleton
    let buf = m.get_buf(m.get(x).buf());
    assert_eq!(buf.bytes(), 4 * 12 * 4);
}

#[test]
fn update_pads_zero_unit_rejected() {
    let mut m = Model::new("t");
    let x = m.tensor("x", &[3, 5], DType::F32).unwrap();
    let err = m.update_pads(x, &[0, 1]).unwrap_err();
    assert!(matches!(root(&err), Error::ShapeInvalid { .. }));
}

#[test]
fn dtype_widths() {
    assert_eq!(DType::U8.size_in_bytes(), 1);
    assert_eq!(DType::I32.size_in_bytes(), 4);
    assert_eq!(DType::F16.size_in_bytes(), 2);
    assert_eq!(DType::F32.size_in_bytes(), 4);
}
