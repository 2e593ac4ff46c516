#![no_main]
use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;

const CHECK_EVERY: usize = 8;

fuzz_target!(|data: Vec<u16>| {
    if data.len() < 3 {
        return;
    }
    let qbits = (data[0] % 3 + 6) as u8;
    let rbits = (data[1] % 8 + 7) as u8;
    let Ok(mut f) = rsqf::Filter::with_qr(qbits.try_into().unwrap(), rbits.try_into().unwrap())
    else {
        return;
    };
    let fingerprint_mask = (1u64 << f.fingerprint_bits()) - 1;

    // The "Model", tracks the fingerprints that were admitted
    let mut model = HashSet::new();
    for (i, &item) in data.iter().enumerate().skip(2) {
        let hash = item as u64;
        match f.insert_fingerprint(hash) {
            Ok(_) => {
                model.insert(hash & fingerprint_mask);
            }
            // No wraparound, clustering can exhaust the tail of the filter
            Err(_) => continue,
        }
        if i % CHECK_EVERY == 0 {
            for m in &model {
                assert!(f.contains_fingerprint(*m), "missing fingerprint {m:#x}");
            }
            assert_eq!(f.len(), model.len() as u64);
        }
    }
    for m in &model {
        assert!(f.contains_fingerprint(*m), "missing fingerprint {m:#x}");
    }
    assert_eq!(f.len(), model.len() as u64);
});
