#![no_main]

use libfuzzer_sys::fuzz_target;
use tiercache_storage::Manifest;

fuzz_target!(|data: &[u8]| {
    // Manifest documents come from the object store and may be truncated,
    // hand-edited or written by a newer version. Parsing must never panic,
    // and anything that parses must satisfy the ordering checks again after
    // a roundtrip.
    if let Ok(manifest) = Manifest::deserialize(data) {
        let _ = manifest.last_committed_offset();
        let _ = manifest.total_size_bytes();

        for window in manifest.segments().windows(2) {
            assert!(window[0].committed_offset <= window[1].base_offset);
        }

        let _ = manifest.resolve(0..u64::MAX);
        if let Some(end) = manifest.last_committed_offset() {
            let _ = manifest.resolve(end.saturating_sub(1)..end);
        }

        let encoded = manifest.serialize().expect("valid manifest serializes");
        let decoded = Manifest::deserialize(&encoded).expect("roundtrip parses");
        assert_eq!(decoded, manifest);
    }
});
