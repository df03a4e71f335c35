#![no_main]

use libfuzzer_sys::fuzz_target;
use vdec_kms::stream::AnnexBAccessUnits;

fuzz_target!(|data: &[u8]| {
    let mut total = 0;
    for unit in AnnexBAccessUnits::new(data) {
        assert!(!unit.is_empty());
        total += unit.len();
    }
    assert!(total <= data.len());
});
