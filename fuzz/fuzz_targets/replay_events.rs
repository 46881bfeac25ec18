#![no_main]

use libfuzzer_sys::fuzz_target;
use scbench::engine::{Engine, Event, ProbeConfig};

fuzz_target!(|data: &[u8]| {
    // Arbitrary event streams must never panic the hooks
    let Ok(engine) = Engine::attach(ProbeConfig::new(1, 4).with_target(2).following(true)) else {
        return;
    };
    for line in data.split(|&b| b == b'\n') {
        if let Ok(event) = serde_json::from_slice::<Event>(line) {
            engine.dispatch(&event);
        }
    }
    let _ = engine.counters().snapshot().merge();
});
