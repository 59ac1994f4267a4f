use pump_config::{DEFAULT_STEPS_PER_ML, load_toml};
use rstest::rstest;

const MINIMAL: &str = r#"
[pins]
step = 5
dir = 2
enable = 26
"#;

#[test]
fn minimal_config_uses_defaults_and_validates() {
    let cfg = load_toml(MINIMAL).expect("parse TOML");
    cfg.validate().expect("defaults should validate");
    assert_eq!(cfg.pins.enable, Some(26));
    assert_eq!(cfg.calibration.dosing_steps_per_ml, DEFAULT_STEPS_PER_ML);
    assert_eq!(cfg.schedule.day_start_hour, 11);
    assert_eq!(cfg.schedule.day_end_hour, 23);
    assert_eq!(cfg.schedule.doses_per_hour, 2);
    assert_eq!(cfg.schedule.slots, 48);
    assert_eq!(cfg.motor.microsteps, 256);
}

#[test]
fn missing_pins_section_fails_to_parse() {
    let toml = r#"
[motor]
max_speed = 1000.0
"#;
    assert!(load_toml(toml).is_err());
}

#[test]
fn full_config_round_trips_values() {
    let toml = r#"
[pins]
step = 13
dir = 19

[motor]
max_speed = 8000.0
acceleration = 400.0
microsteps = 16
steps_per_tick = 32
hold_delay_ms = 1000
default_speed = 1500.0

[calibration]
dosing_steps_per_ml = 650.0
peristaltic_steps_per_ml = 720.5
fixed_steps = 100000
speed = 3000.0
timeout_ms = 60000
stall_ms = 1500

[schedule]
default_daily_volume_ml = 100.0
day_start_hour = 8
day_end_hour = 20
doses_per_hour = 4
day_ratio = 0.6
night_ratio = 0.4
slots = 96
utc_offset_minutes = 120

[storage]
path = "/tmp/pump.toml"

[logging]
level = "debug"
rotation = "daily"

[control_loop]
period_ms = 1
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.motor.steps_per_tick, 32);
    assert_eq!(cfg.calibration.fixed_steps, 100_000);
    assert_eq!(cfg.schedule.utc_offset_minutes, 120);
    assert_eq!(cfg.logging.rotation.as_deref(), Some("daily"));
    assert_eq!(cfg.control_loop.period_ms, 1);
}

#[rstest]
#[case("[motor]\nmax_speed = 0.0", "motor.max_speed must be > 0")]
#[case("[motor]\nmicrosteps = 3", "motor.microsteps must be a power of two")]
#[case("[motor]\nsteps_per_tick = 0", "motor.steps_per_tick must be >= 1")]
#[case("[motor]\ndefault_speed = 5000.0", "motor.default_speed must be in")]
#[case(
    "[calibration]\ndosing_steps_per_ml = 0.0",
    "calibration.dosing_steps_per_ml must be > 0"
)]
#[case("[calibration]\nfixed_steps = 0", "calibration.fixed_steps must be > 0")]
#[case("[calibration]\nstall_ms = 120000", "calibration.stall_ms must be in")]
#[case("[schedule]\nday_end_hour = 11", "schedule.day_end_hour must be in")]
#[case("[schedule]\ndoses_per_hour = 7", "schedule.doses_per_hour must divide 60")]
#[case(
    "[schedule]\nday_ratio = 0.8\nnight_ratio = 0.3",
    "schedule.day_ratio + schedule.night_ratio must be <= 1.0"
)]
#[case("[schedule]\nnight_ratio = -0.1", "schedule.night_ratio must be in")]
#[case("[schedule]\nslots = 0", "schedule.slots must be in [1, 1440]")]
#[case("[schedule]\nutc_offset_minutes = 900", "utc_offset_minutes must be within")]
#[case("[storage]\npath = \"  \"", "storage.path must not be empty")]
#[case("[control_loop]\nperiod_ms = 50", "control_loop.period_ms must be <= 10")]
fn rejects_invalid_values(#[case] section: &str, #[case] needle: &str) {
    let toml = format!("{MINIMAL}\n{section}\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(
        format!("{err}").contains(needle),
        "expected {needle:?} in {err}"
    );
}

#[test]
fn non_divisor_slot_count_is_accepted() {
    let toml = format!("{MINIMAL}\n[schedule]\nslots = 7\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("non-divisor slots only warn");
}

#[test]
fn load_file_reports_missing_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = pump_config::load_file(&dir.path().join("absent.toml")).expect_err("missing");
    assert!(format!("{err}").contains("read config"));
}

#[test]
fn shipped_sample_config_validates() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../etc/pump_config.toml");
    let cfg = pump_config::load_file(&path).expect("sample config");
    assert_eq!(cfg.storage.path, "var/pump_state.toml");
    assert_eq!(cfg.logging.rotation.as_deref(), Some("daily"));
}
