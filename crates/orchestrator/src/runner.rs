//! Simulation runner with lifecycle management
//!
//! This module provides the `SimulationRunner` which advances a solver in a
//! background thread, including start, pause, resume, stop, and status
//! tracking. After every frame the runner publishes a position snapshot and
//! the solver's statistics.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fluid_kernel::{BoundaryBox, FluidSolver, FrameStats};
use parking_lot::Mutex;

/// Runner state enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Simulation created but not yet started
    Created,
    /// Simulation actively running
    Running,
    /// Simulation paused
    Paused,
    /// Simulation finished (reached stopping condition or stopped)
    Finished,
    /// Simulation encountered an error
    Error,
}

/// Shared state between the runner thread and control interface
struct SharedState {
    state: RunnerState,
    frame_count: u64,
    /// Positions after the most recent frame
    positions: Vec<[f32; 3]>,
    stats: FrameStats,
    /// Box requested by the caller, applied before the next frame
    pending_boundary: Option<BoundaryBox>,
    boundary: BoundaryBox,
    error_message: Option<String>,
}

/// Handle for controlling and querying a running simulation
pub struct SimulationRunner {
    shared: Arc<Mutex<SharedState>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl SimulationRunner {
    /// Move `solver` onto a background thread.
    ///
    /// The thread waits in `Created` until [`start`](Self::start) and stops
    /// on its own after `max_frames` frames, if given.
    pub fn new(solver: Box<dyn FluidSolver + Send>, max_frames: Option<u64>) -> Self {
        let shared = Arc::new(Mutex::new(SharedState {
            state: RunnerState::Created,
            frame_count: 0,
            positions: solver.positions(),
            stats: solver.stats(),
            pending_boundary: None,
            boundary: solver.boundary(),
            error_message: None,
        }));

        let shared_clone = Arc::clone(&shared);
        let thread_handle = thread::spawn(move || {
            run_simulation_loop(solver, shared_clone, max_frames);
        });

        Self {
            shared,
            thread_handle: Some(thread_handle),
        }
    }

    /// Get current runner state
    pub fn state(&self) -> RunnerState {
        self.shared.lock().state
    }

    /// Frames completed so far
    pub fn frame_count(&self) -> u64 {
        self.shared.lock().frame_count
    }

    /// Positions after the most recent frame
    pub fn positions_snapshot(&self) -> Vec<[f32; 3]> {
        self.shared.lock().positions.clone()
    }

    /// Statistics after the most recent frame
    pub fn stats(&self) -> FrameStats {
        self.shared.lock().stats
    }

    /// Box currently applied by the solver
    pub fn boundary(&self) -> BoundaryBox {
        self.shared.lock().boundary
    }

    /// Get error message if state is Error
    pub fn error_message(&self) -> Option<String> {
        self.shared.lock().error_message.clone()
    }

    /// Request a new reflecting box. It takes effect before the next frame;
    /// a box the solver rejects is logged and ignored.
    pub fn set_boundary(&self, boundary: BoundaryBox) {
        self.shared.lock().pending_boundary = Some(boundary);
    }

    /// Start the simulation (transition from Created to Running)
    pub fn start(&self) {
        let mut shared = self.shared.lock();
        if shared.state == RunnerState::Created {
            shared.state = RunnerState::Running;
        }
    }

    /// Pause the simulation
    pub fn pause(&self) {
        let mut shared = self.shared.lock();
        if shared.state == RunnerState::Running {
            shared.state = RunnerState::Paused;
        }
    }

    /// Resume the simulation
    pub fn resume(&self) {
        let mut shared = self.shared.lock();
        if shared.state == RunnerState::Paused {
            shared.state = RunnerState::Running;
        }
    }

    /// Ask the thread to exit after its current frame
    pub fn stop(&self) {
        let mut shared = self.shared.lock();
        if matches!(
            shared.state,
            RunnerState::Created | RunnerState::Running | RunnerState::Paused
        ) {
            shared.state = RunnerState::Finished;
        }
    }

    /// Wait for the simulation thread to complete
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| "Thread panicked".to_string())?;
        }
        Ok(())
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        // Signal the thread to exit, then wait so the solver is released
        self.stop();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Main simulation loop executed in background thread
fn run_simulation_loop(
    mut solver: Box<dyn FluidSolver + Send>,
    shared: Arc<Mutex<SharedState>>,
    max_frames: Option<u64>,
) {
    // Wait for start signal
    loop {
        let state = shared.lock().state;
        match state {
            RunnerState::Created => thread::sleep(Duration::from_millis(10)),
            RunnerState::Running => break,
            _ => return,
        }
    }

    let start_wall_time = Instant::now();
    let mut frame_count = 0_u64;
    let mut positions = vec![[0.0_f32; 3]; solver.particle_count()];

    loop {
        let (state, pending) = {
            let mut guard = shared.lock();
            (guard.state, guard.pending_boundary.take())
        };

        match state {
            RunnerState::Running => {
                if let Some(boundary) = pending {
                    match solver.set_boundary(boundary) {
                        Ok(()) => shared.lock().boundary = boundary,
                        Err(e) => tracing::warn!("Rejected boundary update: {e}"),
                    }
                }

                if let Err(e) = solver.step_frame() {
                    tracing::error!("Simulation failed at frame {}: {e}", frame_count);
                    let mut guard = shared.lock();
                    guard.state = RunnerState::Error;
                    guard.error_message = Some(e.to_string());
                    break;
                }
                frame_count += 1;

                solver.copy_positions(&mut positions);
                let stats = solver.stats();
                {
                    let mut guard = shared.lock();
                    guard.frame_count = frame_count;
                    guard.positions.copy_from_slice(&positions);
                    guard.stats = stats;
                }

                if let Some(max) = max_frames {
                    if frame_count >= max {
                        tracing::info!("Simulation finished: reached max_frames = {}", max);
                        let mut guard = shared.lock();
                        if guard.state == RunnerState::Running {
                            guard.state = RunnerState::Finished;
                        }
                        break;
                    }
                }

                if frame_count % 100 == 0 {
                    tracing::debug!(
                        "Frame {}: max_density_error={:.4}, max_speed={:.3}, wall_time={:.2}s",
                        frame_count,
                        stats.max_density_error,
                        stats.max_speed,
                        start_wall_time.elapsed().as_secs_f64(),
                    );
                }
            }
            RunnerState::Paused => {
                // Keep the request for when the runner resumes
                if let Some(boundary) = pending {
                    shared.lock().pending_boundary.get_or_insert(boundary);
                }
                thread::sleep(Duration::from_millis(20));
            }
            RunnerState::Finished | RunnerState::Error | RunnerState::Created => break,
        }
    }

    tracing::info!(
        "Simulation thread exiting: {} frames in {:.2}s",
        frame_count,
        start_wall_time.elapsed().as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluid_kernel::{CpuSolver, SolverOptions, SphParams};

    fn small_solver() -> Box<dyn FluidSolver + Send> {
        let positions = crate::scene::lattice([4, 4, 4], 0.5, [0.0; 3]);
        Box::new(
            CpuSolver::from_positions(
                &positions,
                SphParams::default(),
                BoundaryBox::new([3.0; 3]),
                SolverOptions::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_runner_lifecycle() {
        let runner = SimulationRunner::new(small_solver(), Some(10));

        // Initially Created
        assert_eq!(runner.state(), RunnerState::Created);
        assert_eq!(runner.positions_snapshot().len(), 64);

        runner.start();
        let deadline = Instant::now() + Duration::from_secs(30);
        while runner.state() == RunnerState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(runner.state(), RunnerState::Finished);
        assert_eq!(runner.frame_count(), 10);
        assert_eq!(runner.stats().substeps, 20);
        runner.join().unwrap();
    }

    #[test]
    fn test_runner_pause_resume() {
        let runner = SimulationRunner::new(small_solver(), None);

        runner.start();
        thread::sleep(Duration::from_millis(50));
        runner.pause();

        // Wait for pause to take effect
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runner.state(), RunnerState::Paused);

        let frames_paused = runner.frame_count();
        thread::sleep(Duration::from_millis(100));

        // Should not advance while paused
        assert_eq!(runner.frame_count(), frames_paused);

        runner.resume();
        assert_eq!(runner.state(), RunnerState::Running);

        runner.stop();
        runner.join().unwrap();
    }

    #[test]
    fn test_stop_before_start_exits() {
        let runner = SimulationRunner::new(small_solver(), None);
        runner.stop();
        assert_eq!(runner.state(), RunnerState::Finished);
        runner.join().unwrap();
    }
}
