#![no_main]

use libfuzzer_sys::fuzz_target;
use scbench::duration::{format_duration, parse_time_spec};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Must not panic; anything accepted must render back
        if let Ok(duration) = parse_time_spec(input) {
            let _ = format_duration(duration);
        }
    }
});
