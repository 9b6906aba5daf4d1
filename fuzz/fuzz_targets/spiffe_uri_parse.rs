#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_trust::SpiffeId;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    if let Ok(id) = SpiffeId::parse(&s) {
        let reparsed = SpiffeId::parse(&id.uri()).expect("rendered id must parse");
        assert_eq!(reparsed, id);
    }
});
