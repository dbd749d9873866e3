//! Property-based checks for ordering invariants: round-trip, reflexivity,
//! antisymmetry, and transitivity of `Version::compare`.

use nlink_version::Version;
use proptest::prelude::*;

fn version_strategy() -> impl Strategy<Value = (u32, u32, u32)> {
    (0u32..1000, 0u32..1000, 0u32..1000)
}

proptest! {
    #[test]
    fn round_trip_without_build_metadata((major, minor, patch) in version_strategy()) {
        let s = format!("{major}.{minor}.{patch}");
        let v = Version::parse(&s).unwrap();
        prop_assert_eq!(v.to_string(), s);
    }

    #[test]
    fn compare_is_reflexive((major, minor, patch) in version_strategy()) {
        let s = format!("{major}.{minor}.{patch}");
        let v = Version::parse(&s).unwrap();
        prop_assert_eq!(v.compare(&v), std::cmp::Ordering::Equal);
    }

    #[test]
    fn compare_is_antisymmetric(
        (a_major, a_minor, a_patch) in version_strategy(),
        (b_major, b_minor, b_patch) in version_strategy(),
    ) {
        let a = Version::parse(&format!("{a_major}.{a_minor}.{a_patch}")).unwrap();
        let b = Version::parse(&format!("{b_major}.{b_minor}.{b_patch}")).unwrap();
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn compare_is_transitive(
        (a_major, a_minor, a_patch) in version_strategy(),
        (b_major, b_minor, b_patch) in version_strategy(),
        (c_major, c_minor, c_patch) in version_strategy(),
    ) {
        let a = Version::parse(&format!("{a_major}.{a_minor}.{a_patch}")).unwrap();
        let b = Version::parse(&format!("{b_major}.{b_minor}.{b_patch}")).unwrap();
        let c = Version::parse(&format!("{c_major}.{c_minor}.{c_patch}")).unwrap();
        if a <= b && b <= c {
            prop_assert!(a <= c);
        }
    }
}
