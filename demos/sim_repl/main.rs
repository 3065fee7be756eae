//! Interactive command REPL over a single in-process `SimulatorController`,
//! standing in for the original's `sim` executable (`local/tekkotsu/sim.cc`).
//!
//! Run with `cargo run --bin sim-repl -- --config sim.json`, then type
//! `help` at the prompt for the command surface.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use log::info;

use robocore::clock::SharedClock;
use robocore::config::Document;
use robocore::drivers::{DataSource, Frame, MotionBuffer, MotionHook, PidUpdate};
use robocore::process::ProcessId;
use robocore::runlevel::{Runlevel, RunlevelBarrier};
use robocore::semaphore::SemaphoreSet;
use robocore::simulator::{SimulatorController, EXIT_STARTUP_FAILURE};

#[derive(Parser)]
struct Args {
  /// Configuration file to load at startup (JSON).
  #[arg(long)]
  config: Option<String>,
  /// `Key.Path=Value` overrides applied after the config file loads.
  #[arg(long = "set")]
  overrides: Vec<String>,
}

struct LoggingHook;
impl MotionHook for LoggingHook {
  fn motion_check(&self, outputs: &MotionBuffer) {
    info!("motion tick: output[0] = {}", outputs[0][0]);
  }
  fn motion_starting(&self) {
    info!("motion starting");
  }
  fn motion_stopping(&self) {
    info!("motion stopping");
  }
  fn update_pids(&self, pids: &[PidUpdate]) {
    info!("{} PID update(s) received", pids.len());
  }
}

/// A sensor source that reports a monotonically increasing counter once per
/// second of simulated time, standing in for a real sensor driver.
struct HeartbeatSensor {
  last_reported_ms: u32,
  counter: u32,
}
impl DataSource for HeartbeatSensor {
  fn advance(&mut self, target_time_ms: u32) -> Option<Frame> {
    if target_time_ms.saturating_sub(self.last_reported_ms) >= 1000 {
      self.last_reported_ms = target_time_ms;
      self.counter += 1;
      Some(Frame::new(self.counter.to_le_bytes().to_vec()))
    } else {
      None
    }
  }
  fn is_dirty(&self) -> bool {
    false
  }
}

fn main() {
  env_logger::init();
  let args = Args::parse();
  ProcessId::assign_current(ProcessId::Simulator);

  let semgr = match SemaphoreSet::new(64) {
    Ok(s) => s,
    Err(err) => {
      eprintln!("failed to allocate semaphore set: {err}");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };
  let clock = SharedClock::new(0, -1.0);
  let runlevel = match RunlevelBarrier::new(&semgr) {
    Some(r) => r,
    None => {
      eprintln!("failed to allocate runlevel barrier");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };
  runlevel.reserve_created();

  let mut config = match &args.config {
    Some(path) => Document::load_file(path).unwrap_or_else(|err| {
      eprintln!("warning: failed to load {path}: {err}, starting from defaults");
      Document::default()
    }),
    None => Document::default(),
  };
  for over in &args.overrides {
    if let Err(err) = config.apply_override(over) {
      eprintln!("warning: ignoring override '{over}': {err}");
    }
  }

  let sim = match SimulatorController::new(&semgr, &clock, &runlevel, config) {
    Some(s) => Arc::new(s),
    None => {
      eprintln!("failed to construct SimulatorController");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };
  sim.register_motion_hook(Arc::new(LoggingHook));
  sim.add_sensor_source(Box::new(HeartbeatSensor { last_reported_ms: 0, counter: 0 }));

  let watchdog_sim = sim.clone();
  let _watchdog = watchdog_sim.start_watchdog();

  {
    let sim = sim.clone();
    ctrlc::set_handler(move || {
      info!("received interrupt, shutting down");
      sim.stop();
      std::process::exit(0);
    })
    .expect("failed to install Ctrl-C handler");
  }

  runlevel.enter(Runlevel::Constructing);
  sim.enter_runlevel(Runlevel::Starting);
  sim.enter_runlevel(Runlevel::Running);

  println!("robocore simulator REPL -- type 'help' for commands, 'quit' to exit");
  let stdin = std::io::stdin();
  let code = sim.run_repl(stdin.lock(), std::io::stdout().lock());
  std::io::stdout().flush().ok();

  sim.enter_runlevel(Runlevel::Stopping);
  sim.stop();
  std::process::exit(code);
}
