use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nalgebra::Vector3;
use tracing_subscriber::EnvFilter;

use collab_vslam::exchange::{InterRobotExchange, LoopbackBus};
use collab_vslam::geometry::Sim3;
use collab_vslam::harness::{SceneConfig, SyntheticScene};
use collab_vslam::loop_closing::{spawn_loop_closer, spawn_subscriber, LoopClosing};
use collab_vslam::system::SharedState;
use collab_vslam::vocabulary::OrbVocabulary;
use collab_vslam::LoopClosingConfig;

const KEYFRAMES_PER_ROBOT: usize = 5;

struct Robot {
    name: &'static str,
    engine: Arc<LoopClosing>,
    threads: Vec<thread::JoinHandle<()>>,
    inbox: Option<crossbeam_channel::Receiver<Vec<u8>>>,
}

fn robot_config(base: &LoopClosingConfig, robot_id: u32, symbol: char) -> LoopClosingConfig {
    let mut config = base.clone();
    config.exchange.robot_id = robot_id;
    config.exchange.robot_symbol = symbol;
    config
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collab_vslam=info")),
        )
        .init();

    let base = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => LoopClosingConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LoopClosingConfig::default(),
    };

    let scene = SyntheticScene::generate(&SceneConfig::default());
    let vocabulary: Arc<OrbVocabulary> = Arc::new(scene.vocabulary()?);
    let bus = LoopbackBus::new();

    // Robot B's map is twice as large and shifted.
    let frames = [
        ("robot-a", 0, 'a', Sim3::identity(), 0.0),
        (
            "robot-b",
            1,
            'b',
            Sim3::from_quaternion(0.98, 0.0, 0.2, 0.0, Vector3::new(3.0, -1.0, 0.5), 2.0),
            0.25,
        ),
    ];

    let mut robots = Vec::new();
    for (name, robot_id, symbol, frame, lateral_offset) in frames {
        let config = robot_config(&base, robot_id, symbol);
        let shared = SharedState::new(Arc::clone(&vocabulary));
        let (endpoint, inbox) = bus.connect(robot_id);
        let exchange = Arc::new(InterRobotExchange::new(&config, Arc::clone(&shared), Arc::new(endpoint)));

        let poses = scene.viewpoints(0, KEYFRAMES_PER_ROBOT, lateral_offset);
        let observation = {
            let mut map = shared.map.write();
            scene.observe(&mut map, &vocabulary, config.bow_levels_up, 0, &poses, &frame, None)
        };
        tracing::info!(
            robot = name,
            keyframes = observation.keyframes.len(),
            points = observation.num_map_points,
            "Built local map"
        );

        let engine = LoopClosing::new(shared, exchange, config);
        let threads = vec![spawn_loop_closer(Arc::clone(&engine))];
        for &kf_id in &observation.keyframes {
            engine.insert_keyframe(kf_id)?;
        }
        robots.push(Robot {
            name,
            engine,
            threads,
            inbox: Some(inbox),
        });
    }

    // Let every robot publish its own keyframes before listening, so remote
    // evidence always meets a populated database.
    for robot in &robots {
        let engine = &robot.engine;
        if !wait_until(Duration::from_secs(10), || {
            engine.stats().keyframes_processed as usize >= KEYFRAMES_PER_ROBOT
        }) {
            bail!("{} did not process its keyframes", robot.name);
        }
    }
    for robot in &mut robots {
        if let Some(inbox) = robot.inbox.take() {
            robot.threads.push(spawn_subscriber(Arc::clone(&robot.engine), inbox));
        }
    }

    for robot in &robots {
        let engine = &robot.engine;
        if !wait_until(Duration::from_secs(10), || engine.loop_closure_is_retrieved()) {
            println!("{}: no inter-robot loop closure", robot.name);
            continue;
        }
        if let Some(result) = engine.latest_loop_closure() {
            let s = &result.relative;
            println!(
                "{}: loop with robot {} ('{}'), remote kf {} <-> local kf {}",
                robot.name, result.robot_id, result.robot_symbol, result.remote_kf_id, result.local_kf_id
            );
            println!(
                "  scale {:.3}, translation [{:.3}, {:.3}, {:.3}], rotation {:.2} deg",
                s.scale,
                s.translation.x,
                s.translation.y,
                s.translation.z,
                s.rotation.angle().to_degrees()
            );
        }
        engine.set_loop_closure_retrieved_to_false();
    }

    for robot in &robots {
        robot.engine.request_finish();
    }
    for robot in robots {
        for handle in robot.threads {
            if handle.join().is_err() {
                bail!("{} thread panicked", robot.name);
            }
        }
        let stats = robot.engine.stats();
        println!(
            "{}: processed {} keyframes, {} remote accepted, {} dropped, {} remote loops",
            robot.name, stats.keyframes_processed, stats.remote_accepted, stats.remote_dropped, stats.remote_loops
        );
    }

    Ok(())
}
