#![no_main]
use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    slots: u16,
    total_ml: f32,
    start_hour: u8,
    end_hour: u8,
    pct_in: f32,
    pct_out: f32,
}

fuzz_target!(|input: Input| {
    let Ok(table) = pump_core::generate_weighted_schedule(
        u32::from(input.slots),
        input.total_ml,
        input.start_hour,
        input.end_hour,
        input.pct_in,
        input.pct_out,
    ) else {
        return;
    };
    assert_eq!(table.len(), usize::from(input.slots));
    // Pools with slots are dispensed in full; the table never exceeds the total.
    let sum: f64 = table.iter().map(|e| f64::from(e.volume_ml)).sum();
    let cap = f64::from(input.total_ml) * (f64::from(input.pct_in) + f64::from(input.pct_out));
    assert!(sum <= cap * (1.0 + 1e-4) + 1e-4, "sum {sum} > cap {cap}");
    for e in &table {
        assert!(e.hour < 24 && e.minute < 60);
        assert!(e.volume_ml >= 0.0);
    }
});
