//! Command execution: hardware assembly, control-loop driving and output.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use pump_config::{Config, FileStore};
use pump_core::persist;
use pump_core::{
    AutoDoser, CalibrationError, CalibrationState, ControlLoop, ControlLoopBuilder, PumpCalibration,
    PumpError, PumpMode, ScheduleSettings,
};
use pump_traits::{StatusSink, StepperDriver};
use serde_json::json;

use crate::cli::{Cli, Commands, ScheduleFormat};

type Driver = Box<dyn StepperDriver>;
type Loop = ControlLoop<Driver, FileStore>;

/// Prints status lines to stdout (one JSON object per line with `--json`) and
/// mirrors them to the log.
pub struct ConsoleSink {
    json: bool,
}

impl ConsoleSink {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl StatusSink for ConsoleSink {
    fn show(&mut self, line: &str) {
        tracing::info!(target: "pump::status", "{line}");
        if self.json {
            println!("{}", json!({ "status": line }));
        } else {
            println!("{line}");
        }
    }
}

fn open_driver(cfg: &Config, sim: bool) -> eyre::Result<Driver> {
    #[cfg(feature = "hardware")]
    if !sim {
        let d = pump_hardware::GpioStepper::new(cfg.pins.step, cfg.pins.dir, cfg.pins.enable)
            .map_err(|e| eyre::Report::new(pump_core::hw_error::map_hw_error(&e)))?;
        tracing::info!(step = cfg.pins.step, dir = cfg.pins.dir, "using GPIO stepper");
        return Ok(Box::new(d));
    }
    let _ = (cfg, sim);
    tracing::info!("using simulated stepper");
    Ok(Box::new(pump_hardware::SimulatedStepper::new()))
}

fn build_loop(cfg: &Config, cli: &Cli) -> eyre::Result<Loop> {
    let store = FileStore::open(&cfg.storage.path)?;
    ControlLoopBuilder::new()
        .with_config(cfg)
        .with_driver(open_driver(cfg, cli.sim)?)
        .with_store(store)
        .with_sink(Box::new(ConsoleSink::new(cli.json)))
        .build()
}

/// Scheduler state only; no driver is touched.
fn open_doser(cfg: &Config) -> eyre::Result<(AutoDoser, FileStore)> {
    let store = FileStore::open(&cfg.storage.path)?;
    let mut doser = AutoDoser::new(ScheduleSettings::from(&cfg.schedule));
    doser.load_state(&store);
    Ok((doser, store))
}

fn shutdown_flag() -> eyre::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&flag);
    ctrlc::set_handler(move || f.store(true, Ordering::Relaxed))?;
    Ok(flag)
}

fn period(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.control_loop.period_ms)
}

/// Poll until the pump is idle and no calibration move is in flight.
fn wait_idle(
    lp: &mut Loop,
    shutdown: &AtomicBool,
    period: Duration,
    timeout: Duration,
) -> eyre::Result<()> {
    let start = Instant::now();
    loop {
        lp.poll()?;
        if !(lp.pump().is_moving() || lp.calibration().is_active()) {
            return Ok(());
        }
        if shutdown.load(Ordering::Relaxed) {
            lp.stop_pump();
            return Err(eyre::Report::new(PumpError::State("interrupted".into())));
        }
        if start.elapsed() >= timeout {
            lp.stop_pump();
            return Err(eyre::Report::new(PumpError::State(format!(
                "move not finished after {} ms",
                timeout.as_millis()
            ))));
        }
        std::thread::sleep(period);
    }
}

fn prompt_volume() -> eyre::Result<f32> {
    print!("Measured volume (mL): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    line.trim()
        .parse::<f32>()
        .map_err(|e| eyre::eyre!("measured volume {:?}: {e}", line.trim()))
}

pub fn execute(cli: &Cli, cfg: &Config) -> eyre::Result<()> {
    match &cli.cmd {
        Commands::Run => {
            let shutdown = shutdown_flag()?;
            let mut lp = build_loop(cfg, cli)?;
            lp.log_status();
            lp.run(&shutdown, period(cfg));
            Ok(())
        }
        Commands::Dose { ml, timeout_ms } => {
            let shutdown = shutdown_flag()?;
            let mut lp = build_loop(cfg, cli)?;
            let steps = lp.dose_now(*ml)?;
            if steps != 0 {
                wait_idle(
                    &mut lp,
                    &shutdown,
                    period(cfg),
                    Duration::from_millis(*timeout_ms),
                )?;
            }
            let done = lp.pump().last_completed_steps();
            if cli.json {
                println!("{}", json!({ "ml": ml, "steps": steps, "completed_steps": done }));
            } else if steps != 0 {
                println!("Dosed {ml:.2} mL ({done} steps)");
            }
            Ok(())
        }
        Commands::Continuous { speed } => {
            let shutdown = shutdown_flag()?;
            let mut lp = build_loop(cfg, cli)?;
            let speed = speed.unwrap_or_else(|| lp.pump().speed());
            lp.start_continuous(speed)?;
            while !shutdown.load(Ordering::Relaxed) {
                if let Err(e) = lp.poll() {
                    lp.stop_pump();
                    return Err(e);
                }
                std::thread::sleep(period(cfg));
            }
            lp.stop_pump();
            Ok(())
        }
        Commands::Stop => {
            let mut lp = build_loop(cfg, cli)?;
            lp.stop_pump();
            Ok(())
        }
        Commands::Calibrate { mode, measured_ml } => {
            let shutdown = shutdown_flag()?;
            let mut lp = build_loop(cfg, cli)?;
            let mode = PumpMode::from(*mode);
            lp.start_calibration(mode)?;
            let timeout = Duration::from_millis(cfg.calibration.timeout_ms.saturating_mul(2));
            if let Err(e) = wait_idle(&mut lp, &shutdown, period(cfg), timeout) {
                lp.abort_calibration();
                if shutdown.load(Ordering::Relaxed) {
                    return Err(eyre::Report::new(CalibrationError::Aborted));
                }
                return Err(e);
            }
            match lp.calibration().state() {
                CalibrationState::AwaitingVolume { .. } => {}
                CalibrationState::Failed(e) => return Err(eyre::Report::new(e.clone())),
                other => {
                    return Err(eyre::Report::new(PumpError::State(format!(
                        "calibration ended in {other:?}"
                    ))));
                }
            }
            let ml = match measured_ml {
                Some(v) => *v,
                None => prompt_volume()?,
            };
            let out = lp.confirm_calibration(ml)?;
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "mode": out.mode.as_str(),
                        "measured_ml": out.measured_ml,
                        "previous_steps_per_ml": out.previous_steps_per_ml,
                        "steps_per_ml": out.steps_per_ml,
                        "updated": out.updated,
                    })
                );
            }
            Ok(())
        }
        Commands::Schedule { format } => {
            let (doser, _) = open_doser(cfg)?;
            print_schedule(&doser, *format)
        }
        Commands::Status => {
            let (doser, store) = open_doser(cfg)?;
            let cal = persist::load_calibration(&store, PumpCalibration::from(&cfg.calibration));
            let motion = persist::load_motion(&store, cfg.motor.default_speed);
            if cli.json {
                let s = doser.status();
                println!(
                    "{}",
                    json!({
                        "enabled": s.meta.enabled,
                        "daily_volume_ml": s.meta.total_daily_volume,
                        "day_volume_ml": s.meta.day_volume,
                        "night_volume_ml": s.meta.night_volume,
                        "dosed_today_ml": s.meta.total_dosed_volume,
                        "remaining_ml": s.remaining_daily_volume,
                        "last_dosing_time": s.meta.last_dosing_time,
                        "day_ratio": s.day_ratio,
                        "night_ratio": s.night_ratio,
                        "dosing_steps_per_ml": cal.dosing_steps_per_ml,
                        "peristaltic_steps_per_ml": cal.peristaltic_steps_per_ml,
                        "speed": motion.speed,
                        "mode": motion.mode.as_str(),
                    })
                );
            } else {
                for line in doser.status_lines() {
                    println!("{line}");
                }
                println!(
                    "Steps/mL: dosing {:.2}, peristaltic {:.2}",
                    cal.dosing_steps_per_ml, cal.peristaltic_steps_per_ml
                );
                println!("Saved motion: {} at {:.0} steps/s", motion.mode, motion.speed);
            }
            Ok(())
        }
        Commands::Enable => {
            let (mut doser, mut store) = open_doser(cfg)?;
            doser.enable(&mut store)?;
            ConsoleSink::new(cli.json).show("Auto dosing enabled");
            Ok(())
        }
        Commands::Disable => {
            let (mut doser, mut store) = open_doser(cfg)?;
            doser.disable(&mut store)?;
            ConsoleSink::new(cli.json).show("Auto dosing disabled");
            Ok(())
        }
        Commands::SetVolume { ml } => {
            let (mut doser, mut store) = open_doser(cfg)?;
            doser.set_daily_volume(*ml, &mut store)?;
            ConsoleSink::new(cli.json).show(&format!("Daily volume: {ml:.2} mL"));
            Ok(())
        }
        Commands::Split { day, night } => {
            let (mut doser, mut store) = open_doser(cfg)?;
            doser.set_split(*day, *night, &mut store)?;
            let m = doser.meta();
            ConsoleSink::new(cli.json).show(&format!(
                "Split: {:.2} mL day / {:.2} mL night",
                m.day_volume, m.night_volume
            ));
            Ok(())
        }
    }
}

fn print_schedule(doser: &AutoDoser, format: ScheduleFormat) -> eyre::Result<()> {
    match format {
        ScheduleFormat::Text => {
            for line in doser.schedule_lines() {
                println!("{line}");
            }
        }
        ScheduleFormat::Csv => {
            let mut w = csv::Writer::from_writer(std::io::stdout().lock());
            w.write_record(["time", "hour", "minute", "volume_ml"])?;
            for e in doser.table() {
                w.write_record([
                    format!("{:02}:{:02}", e.hour, e.minute),
                    e.hour.to_string(),
                    e.minute.to_string(),
                    format!("{:.4}", e.volume_ml),
                ])?;
            }
            w.flush()?;
        }
        ScheduleFormat::Json => {
            let entries: Vec<_> = doser
                .table()
                .iter()
                .map(|e| json!({ "hour": e.hour, "minute": e.minute, "volume_ml": e.volume_ml }))
                .collect();
            println!(
                "{}",
                json!({
                    "slots": entries.len(),
                    "daily_volume_ml": doser.daily_volume(),
                    "entries": entries,
                })
            );
        }
    }
    Ok(())
}
