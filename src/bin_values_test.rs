use test_case::test_case;

use crate::bin_values::{BinValues, InvalidBinValues};

#[test]
fn insert_and_contains() {
    let mut values = BinValues::NONE;
    assert!(values.is_empty());
    assert!(values.insert(false));
    assert_eq!(values, BinValues::ZERO);
    assert!(values.contains(false));
    assert!(!values.contains(true));
    // Re-inserting is a no-op.
    assert!(!values.insert(false));
    assert!(values.insert(true));
    assert_eq!(values, BinValues::BOTH);
}

#[test_case(BinValues::ZERO, Some(false))]
#[test_case(BinValues::ONE, Some(true))]
#[test_case(BinValues::BOTH, None)]
#[test_case(BinValues::NONE, None)]
fn singleton(values: BinValues, expected: Option<bool>) {
    assert_eq!(values.as_singleton(), expected);
}

#[test]
fn subset() {
    assert!(BinValues::NONE.is_subset_of(BinValues::ZERO));
    assert!(BinValues::ZERO.is_subset_of(BinValues::BOTH));
    assert!(!BinValues::BOTH.is_subset_of(BinValues::ONE));
    assert!(!BinValues::ZERO.is_subset_of(BinValues::ONE));
}

#[test]
fn wire_encoding() {
    for values in [BinValues::NONE, BinValues::ZERO, BinValues::ONE, BinValues::BOTH] {
        assert_eq!(BinValues::try_from(values.bits()), Ok(values));
    }
    assert_eq!(BinValues::try_from(4), Err(InvalidBinValues(4)));
    assert_eq!(BinValues::try_from(0xff), Err(InvalidBinValues(0xff)));
}

#[test]
fn serde_rejects_out_of_range() {
    let encoded = serde_json::to_string(&BinValues::BOTH).expect("serialize");
    assert_eq!(encoded, "3");
    assert_eq!(serde_json::from_str::<BinValues>("2").expect("deserialize"), BinValues::ONE);
    assert!(serde_json::from_str::<BinValues>("7").is_err());
}
