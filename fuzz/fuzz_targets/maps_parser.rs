#![no_main]

use libfuzzer_sys::fuzz_target;
use reloj::library::parse_maps_line;
use reloj::os::parse_stat_state;

fuzz_target!(|data: &[u8]| {
    // Both parsers consume untrusted /proc text; neither may panic on any
    // input.
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = parse_maps_line(input);
        let _ = parse_stat_state(input);
    }
});
