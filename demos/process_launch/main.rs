//! Launches Main/Motion/Simulator as real OS threads (or, with
//! `--multiprocess`, forked OS processes) coordinated entirely through this
//! crate's IPC primitives, standing in for the original's per-process
//! `Process.cc` entry points.
//!
//! `semgr`/`clock`/`runlevel` are leaked to `'static` so the spawned
//! processes — which, like real Tekkotsu processes, must be allowed to
//! outlive the function that launched them — can hold references into them
//! without a lifetime tied to `main`'s stack frame.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use robocore::clock::SharedClock;
use robocore::config::Document;
use robocore::drivers::{MotionBuffer, MotionHook, PidUpdate};
use robocore::process::{spawn_process, LaunchMode, ProcessId};
use robocore::runlevel::Runlevel;
use robocore::runlevel::RunlevelBarrier;
use robocore::semaphore::SemaphoreSet;
use robocore::simulator::{SimulatorController, EXIT_STARTUP_FAILURE};

#[derive(Parser)]
struct Args {
  /// Launch Main/Motion/Simulator as forked OS processes instead of threads.
  #[arg(long)]
  multiprocess: bool,
  /// How long the demo runs before shutting itself down cleanly.
  #[arg(long, default_value_t = 500)]
  duration_ms: u32,
}

struct DemoHook {
  ticks: AtomicU32,
}
impl MotionHook for DemoHook {
  fn motion_check(&self, _outputs: &MotionBuffer) {
    self.ticks.fetch_add(1, Ordering::SeqCst);
  }
  fn update_pids(&self, pids: &[PidUpdate]) {
    info!("simulator applied {} PID update(s)", pids.len());
  }
}

fn main() {
  env_logger::init();
  let args = Args::parse();

  LaunchMode::set(if args.multiprocess { LaunchMode::Multiprocess } else { LaunchMode::Threaded });
  ProcessId::assign_current(ProcessId::Main);

  let semgr: &'static SemaphoreSet = match SemaphoreSet::new(64) {
    Ok(s) => Box::leak(Box::new(s)),
    Err(err) => {
      eprintln!("failed to allocate semaphore set: {err}");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };
  let clock: &'static SharedClock = Box::leak(Box::new(SharedClock::new(0, 1.0)));
  let runlevel: &'static RunlevelBarrier<'static> = match RunlevelBarrier::new(semgr) {
    Some(r) => Box::leak(Box::new(r)),
    None => {
      eprintln!("failed to allocate runlevel barrier");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };

  // Main, Motion, and Simulator all participate in this demo's runlevel
  // barrier; each reserves its own CREATED slot before the others wait on it.
  runlevel.reserve_created();
  runlevel.reserve_created();
  runlevel.reserve_created();

  let sim: &'static SimulatorController<'static> = match SimulatorController::new(semgr, clock, runlevel, Document::default()) {
    Some(s) => Box::leak(Box::new(s)),
    None => {
      eprintln!("failed to construct SimulatorController");
      std::process::exit(EXIT_STARTUP_FAILURE);
    }
  };
  let hook = Arc::new(DemoHook { ticks: AtomicU32::new(0) });
  sim.register_motion_hook(hook.clone());

  let motion_handle = spawn_process(ProcessId::Motion, move || {
    runlevel.enter(Runlevel::Constructing);
    runlevel.enter(Runlevel::Starting);
    runlevel.enter(Runlevel::Running);
    let mut buf: MotionBuffer = [[0.0; robocore::drivers::NUM_OUTPUTS]; robocore::drivers::NUM_FRAMES];
    loop {
      let t = clock.get_time(ProcessId::current(), &robocore::clock::NullController);
      if t >= 400 {
        break;
      }
      buf[0][0] = t as f32 / 1000.0;
      sim.post_motion_output(&buf).ok();
      std::thread::sleep(Duration::from_millis(8));
    }
    runlevel.enter(Runlevel::Stopping);
  });

  sim.enter_runlevel(Runlevel::Constructing);
  sim.enter_runlevel(Runlevel::Starting);
  sim.enter_runlevel(Runlevel::Running);

  let start = std::time::Instant::now();
  while (start.elapsed().as_millis() as u32) < args.duration_ms {
    sim.step_frame();
    std::thread::sleep(Duration::from_millis(8));
  }

  sim.enter_runlevel(Runlevel::Stopping);
  motion_handle.join();
  sim.stop();

  info!("demo finished: simulator observed {} motion tick(s)", hook.ticks.load(Ordering::SeqCst));
}
