#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_trust::intention::{authorize, MatchType};
use mesh_trust::Intention;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(ixn) = serde_json::from_str::<Intention>(s) {
            let _ = ixn.validate();
            let _ = authorize("web", "default", "", &ixn, MatchType::Source);
            let _ = authorize("web", "default", "", &ixn, MatchType::Destination);
        }
    }
});
