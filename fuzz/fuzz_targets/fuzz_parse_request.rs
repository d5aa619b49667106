#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Expectation: never panic. Either Ok(_) or a clean Err(_).
    if let Ok(file) = subspawn::config::parse_request(data) {
        let _ = file.to_spawn_request().map(|req| req.validate());
    }
});
