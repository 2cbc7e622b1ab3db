//! Fuzz harness for `/proc/stat` parsing and the CPU usage computation.
//!
//! Consecutive samples come from arbitrary text, so counters may go
//! backwards or overflow; the reported usage must stay within 0..=100.

#![no_main]
use libfuzzer_sys::fuzz_target;
use thanatos_daemon::telemetry::{CpuSample, CpuSampler};

fuzz_target!(|data: &[u8]| {
    let (first, second) = data.split_at(data.len() / 2);

    let sampler = CpuSampler::new();
    for half in [first, second] {
        if let Some(sample) = CpuSample::parse(&String::from_utf8_lossy(half)) {
            let usage = sampler.usage_from(sample);
            assert!((0.0..=100.0).contains(&usage), "usage out of range: {usage}");
        }
    }
});
