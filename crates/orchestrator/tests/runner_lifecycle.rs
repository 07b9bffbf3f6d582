//! Scene file to finished run, through the public orchestrator API.

use std::thread;
use std::time::{Duration, Instant};

use fluid_kernel::BoundaryBox;
use fluid_orchestrator::{create_simulation, ConfigError, RunnerState};

fn write_scene(name: &str, json: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "fluid_orchestrator_{}_{}.json",
        name,
        std::process::id()
    ));
    std::fs::write(&path, json).unwrap();
    path
}

fn wait_while_running(runner: &fluid_orchestrator::SimulationRunner) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while runner.state() == RunnerState::Running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn scene_file_runs_to_completion() {
    let path = write_scene(
        "dam_break",
        r#"{
            "name": "small dam break",
            "backend": "cpu",
            "seed": { "kind": "dam_break", "fill": [0.4, 0.6, 0.5] },
            "box_half_extents": [2.0, 2.0, 2.0],
            "max_frames": 15
        }"#,
    );
    let runner = create_simulation(&path).unwrap();
    let initial = runner.positions_snapshot();
    assert!(!initial.is_empty());

    runner.start();
    wait_while_running(&runner);

    assert_eq!(runner.state(), RunnerState::Finished);
    assert_eq!(runner.frame_count(), 15);

    let stats = runner.stats();
    assert_eq!(stats.particle_count, initial.len());
    assert_eq!(stats.non_finite, 0);

    // Gravity pulls the block down.
    let mean_y = |p: &[[f32; 3]]| p.iter().map(|q| q[1]).sum::<f32>() / p.len() as f32;
    let after = runner.positions_snapshot();
    assert!(mean_y(&after) < mean_y(&initial));

    let b = BoundaryBox::new([2.0; 3]);
    assert!(after.iter().all(|&p| b.contains(p)));

    runner.join().unwrap();
    let _ = std::fs::remove_file(path);
}

#[test]
fn boundary_can_shrink_while_running() {
    let path = write_scene(
        "shrink",
        r#"{
            "backend": "cpu",
            "seed": { "kind": "random_cube", "count": 200, "half_extent": 1.5, "seed": 9 },
            "box_half_extents": [2.0, 2.0, 2.0]
        }"#,
    );
    let runner = create_simulation(&path).unwrap();
    runner.set_boundary(BoundaryBox::new([1.0, 2.0, 1.0]));
    runner.start();

    let deadline = Instant::now() + Duration::from_secs(60);
    while runner.frame_count() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    runner.pause();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(runner.boundary().half_extents, [1.0, 2.0, 1.0]);
    let positions = runner.positions_snapshot();
    assert!(positions.iter().all(|p| p[0].abs() <= 1.0 && p[2].abs() <= 1.0));

    // Larger than the hashed region: ignored.
    runner.set_boundary(BoundaryBox::new([5.0; 3]));
    runner.resume();
    let seen = runner.frame_count();
    while runner.frame_count() < seen + 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(runner.boundary().half_extents, [1.0, 2.0, 1.0]);

    runner.stop();
    runner.join().unwrap();
    let _ = std::fs::remove_file(path);
}

#[test]
fn invalid_scene_is_rejected() {
    let path = write_scene("invalid", r#"{ "particle_spacing": 0.0 }"#);
    assert!(matches!(
        create_simulation(&path),
        Err(ConfigError::Invalid(_))
    ));
    let _ = std::fs::remove_file(path);

    let path = write_scene("malformed", "{ not json");
    assert!(matches!(create_simulation(&path), Err(ConfigError::Json(_))));
    let _ = std::fs::remove_file(path);
}
