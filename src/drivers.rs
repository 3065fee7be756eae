//! Lifecycle hooks for device drivers, motion hooks, and frame/sensor data
//! sources (ambient addition; the device-driver registry, kinematics math,
//! and sensor/vision codecs themselves are out of scope — only the plug-in
//! lifecycle these collaborators expose to the core is required).
//!
//! Grounded in `local/MotionHooks/IPCMotionHook.h`/`.cc`
//! (the motion-hook dispatch surface `MotionExecutor` and
//! `SimulatorController` drive) and `local/tekkotsu/MotionExecThread.cc`
//! (the motion-manager collaborator and per-output sensor feedback sink it
//! polls each tick). Per the design note on polymorphism, these are
//! behavioral trait objects rather than a deep class hierarchy.

use std::sync::Arc;

/// Number of servo/output channels a motion buffer carries. Stands in for
/// the original's robot-model-specific `NumOutputs` constant.
pub const NUM_OUTPUTS: usize = 20;
/// Number of frames batched per motion tick (the original's `NumFrames`).
pub const NUM_FRAMES: usize = 1;
/// Milliseconds per frame (the original's `FrameTime`).
pub const FRAME_TIME_MS: u32 = 8;

/// One tick's worth of output values for every frame and output channel.
pub type MotionBuffer = [[f32; NUM_OUTPUTS]; NUM_FRAMES];

/// Mechanical range limit for one output channel, applied by
/// [`crate::motion::MotionExecutor`]'s posture-feedback step when
/// `Motion.FeedbackRangeLimits` is set.
#[derive(Debug, Clone, Copy)]
pub struct OutputRange {
  pub min: f32,
  pub max: f32,
}

/// A single PID gain update for one output channel. Grounded in
/// `MotionHook::PIDUpdate`.
#[derive(Debug, Clone, Copy)]
pub struct PidUpdate {
  pub output_index: u32,
  pub p: f32,
  pub i: f32,
  pub d: f32,
}

/// Receives motion-buffer and PID-update dispatch from
/// [`crate::motion::MotionExecutor`] and [`crate::simulator::SimulatorController`].
/// Grounded in `local/MotionHooks/IPCMotionHook.h`: a hook has no return value to the
/// caller (fire-and-forget dispatch); `motion_starting`/`motion_stopping`
/// and the realtime-transition pair are runlevel/clock-regime
/// notifications with no per-tick data.
pub trait MotionHook: Send + Sync {
  fn motion_starting(&self) {}
  fn motion_stopping(&self) {}
  /// Called once per motion tick with the frame(s) just computed.
  fn motion_check(&self, outputs: &MotionBuffer);
  /// Called when the motion-manager collaborator reports gain changes.
  fn update_pids(&self, _pids: &[PidUpdate]) {}
  /// The clock's time scale crossed from non-positive to positive.
  fn entering_realtime(&self) {}
  /// The clock's time scale crossed from positive to non-positive.
  fn leaving_realtime(&self) {}
}

/// Stands in for the original's `MotionManager` collaborator (kinematics
/// math is explicitly out of scope): fills a tick's output buffer and
/// reports any PID gain changes observed since the last tick.
pub trait MotionSource: Send + Sync {
  fn get_outputs(&mut self, buf: &mut MotionBuffer);
  fn collect_pid_updates(&mut self) -> Vec<PidUpdate>;
}

/// Where [`crate::motion::MotionExecutor`] writes delayed posture feedback:
/// outputs whose driver isn't already supplying real sensor values get the
/// motion buffer's value instead, unless `Motion.OverrideSensors` is set.
pub trait SensorFeedbackSink: Send + Sync {
  fn has_provided_output(&self, index: usize) -> bool;
  fn set_output(&self, index: usize, value: f32);
}

/// One camera/vision/sensor frame handed from a [`DataSource`] to
/// [`crate::simulator::SimulatorController`] for posting on its queue.
#[derive(Debug, Clone, Default)]
pub struct Frame {
  pub payload: Vec<u8>,
}

impl Frame {
  pub fn new(payload: Vec<u8>) -> Self {
    Frame { payload }
  }
}

/// A camera, vision, or sensor collaborator [`crate::simulator::SimulatorController`]
/// polls once per frame. Grounded in `SimulatorController`'s per-frame
/// "advance data sources" step; no concrete camera codec or kinematics is
/// implemented, only this lifecycle contract.
pub trait DataSource: Send + Sync {
  /// Advances the source to `target_time_ms`, returning a fresh frame if
  /// one is ready at that time.
  fn advance(&mut self, target_time_ms: u32) -> Option<Frame>;
  /// Whether a frame is available that hasn't yet been sent (used for the
  /// "only send if dirty or heartbeat elapsed" gating).
  fn is_dirty(&self) -> bool;
}

/// Tagged description of one sensor channel. Per the design note on
/// polymorphism, this uses tagged variants rather than a deep hierarchy,
/// since the set of sensor kinds is closed and small.
#[derive(Debug, Clone)]
pub enum SensorInfo {
  Analog { name: String, output_index: u32, min: f32, max: f32 },
  Digital { name: String, output_index: u32 },
  Button { name: String, output_index: u32 },
}

impl SensorInfo {
  pub fn name(&self) -> &str {
    match self {
      SensorInfo::Analog { name, .. } => name,
      SensorInfo::Digital { name, .. } => name,
      SensorInfo::Button { name, .. } => name,
    }
  }

  pub fn output_index(&self) -> u32 {
    match self {
      SensorInfo::Analog { output_index, .. }
      | SensorInfo::Digital { output_index, .. }
      | SensorInfo::Button { output_index, .. } => *output_index,
    }
  }
}

/// A registered motion hook plus whatever handle the caller used to
/// register it — mostly a convenience alias used by
/// [`crate::simulator::SimulatorController`]'s hook list.
pub type SharedMotionHook = Arc<dyn MotionHook>;

#[cfg(test)]
mod tests {
  use super::*;

  struct RecordingHook {
    checks: std::sync::atomic::AtomicUsize,
  }
  impl MotionHook for RecordingHook {
    fn motion_check(&self, _outputs: &MotionBuffer) {
      self.checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
  }

  #[test]
  fn motion_hook_default_methods_are_inert() {
    let hook = RecordingHook { checks: std::sync::atomic::AtomicUsize::new(0) };
    hook.motion_starting();
    hook.motion_stopping();
    hook.entering_realtime();
    hook.leaving_realtime();
    hook.update_pids(&[]);
    assert_eq!(hook.checks.load(std::sync::atomic::Ordering::SeqCst), 0);
    hook.motion_check(&[[0.0; NUM_OUTPUTS]; NUM_FRAMES]);
    assert_eq!(hook.checks.load(std::sync::atomic::Ordering::SeqCst), 1);
  }

  #[test]
  fn sensor_info_exposes_common_fields_across_variants() {
    let a = SensorInfo::Analog { name: "IRDist".into(), output_index: 3, min: 0.0, max: 1.0 };
    let d = SensorInfo::Digital { name: "Bump".into(), output_index: 4 };
    assert_eq!(a.name(), "IRDist");
    assert_eq!(a.output_index(), 3);
    assert_eq!(d.output_index(), 4);
  }
}
