//! `tpu`: drive the TPU scheduling stack against the software engine.
//!
//! ```text
//! USAGE:
//!   tpu config                       Print the effective driver configuration
//!   tpu simulate [options]           Concurrent requests through the full stack
//!   tpu realtime [options]           Deadline admission on a simulated clock
//! ```
//!
//! Environment overrides (`TPU_WATCHDOG_TIMEOUT_MS`, `TPU_WATCHDOG_TIMER`,
//! `TPU_REALTIME`, `TPU_REGISTER_POLL_TIMEOUT_MS`) apply before flags.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tpu_driver::{
    Buffer, Clock, CloseMode, DmaScheduler, DriverConfig, DriverStack, EngineConfig, Executable,
    ExecutableId, ExecutableTiming, HardwareRequest, LayerInfo, ManualClock, MemoryRegisters,
    Request, StepOutcome, TpuRequest,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tpu", about = "TPU DMA scheduling stack", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the configuration after environment overrides.
    Config,
    /// Submit requests from several threads and run them on the software engine.
    Simulate {
        /// Submitting threads.
        #[arg(long, default_value_t = 4)]
        submitters: usize,
        /// Requests per submitting thread.
        #[arg(long, default_value_t = 8)]
        requests: u64,
        /// Batch size of each request.
        #[arg(long, default_value_t = 10)]
        batch: usize,
        /// Native batch size of the executables.
        #[arg(long, default_value_t = 4)]
        hardware_batch: usize,
        /// Distinct executables, used round-robin.
        #[arg(long, default_value_t = 2)]
        executables: u64,
        /// Input activation bytes per batch element.
        #[arg(long, default_value_t = 4096)]
        input_bytes: usize,
        /// Simulated time per descriptor, in microseconds.
        #[arg(long, default_value_t = 0)]
        transfer_us: u64,
        /// Stall the engine after this many descriptors.
        #[arg(long)]
        stall_after: Option<u64>,
        /// Watchdog level timeouts in ms (comma separated).
        #[arg(long, value_delimiter = ',')]
        watchdog_ms: Option<Vec<u64>>,
    },
    /// Show which frames a periodic model mix gets admitted.
    Realtime {
        /// Frame rate of the camera model.
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Worst-case execution time of the camera model, ms.
        #[arg(long, default_value_t = 10)]
        met_ms: u64,
        /// Arrival tolerance of the camera model, ms.
        #[arg(long, default_value_t = 5)]
        tolerance_ms: u64,
        /// Worst-case execution time of the detector model, ms.
        #[arg(long, default_value_t = 15)]
        detector_met_ms: u64,
        /// Detector submissions attempted per camera frame.
        #[arg(long, default_value_t = 2)]
        detector_per_frame: u32,
        /// Camera frames to simulate.
        #[arg(long, default_value_t = 10)]
        frames: u32,
        /// Camera frames to skip before the last few, to show it going idle.
        #[arg(long, default_value_t = 0)]
        pause_frames: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = DriverConfig::from_env().context("reading TPU_* environment")?;

    match cli.command {
        Cmd::Config => cmd_config(&config),
        Cmd::Simulate {
            submitters,
            requests,
            batch,
            hardware_batch,
            executables,
            input_bytes,
            transfer_us,
            stall_after,
            watchdog_ms,
        } => {
            let mut config = config;
            if let Some(levels) = watchdog_ms {
                config.watchdog.levels = levels.into_iter().map(Duration::from_millis).collect();
            }
            let sim = Simulation {
                submitters,
                requests,
                batch,
                hardware_batch,
                executables,
                input_bytes,
                engine: EngineConfig {
                    transfer_time: Duration::from_micros(transfer_us),
                    stall_after,
                    ..EngineConfig::default()
                },
            };
            cmd_simulate(config, &sim)?;
        }
        Cmd::Realtime {
            fps,
            met_ms,
            tolerance_ms,
            detector_met_ms,
            detector_per_frame,
            frames,
            pause_frames,
        } => {
            let camera = ExecutableTiming {
                fps,
                max_execution_time: Duration::from_millis(met_ms),
                tolerance: Duration::from_millis(tolerance_ms),
            };
            cmd_realtime(
                config,
                camera,
                Duration::from_millis(detector_met_ms),
                detector_per_frame,
                frames,
                pause_frames,
            )?;
        }
    }

    Ok(())
}

fn cmd_config(config: &DriverConfig) {
    let levels: Vec<String> = config
        .watchdog
        .levels
        .iter()
        .map(|d| format!("{}ms", d.as_millis()))
        .collect();
    println!("Watchdog levels   : {}", levels.join(" → "));
    println!("Watchdog timer    : {}", config.watchdog.timer);
    println!("Real-time mode    : {}", config.real_time.enabled);
    println!("Inactive multiple : {}", config.real_time.inactive_frame_multiple);
    println!("Register poll     : {:?}", config.register_poll_timeout);
}

struct Simulation {
    submitters: usize,
    requests: u64,
    batch: usize,
    hardware_batch: usize,
    executables: u64,
    input_bytes: usize,
    engine: EngineConfig,
}

fn build_executables(sim: &Simulation) -> Result<Vec<Arc<Executable>>> {
    (0..sim.executables.max(1))
        .map(|n| {
            let exe = Executable::builder(ExecutableId::new(n + 1), format!("model{n}"))
                .hardware_batch_size(sim.hardware_batch)
                .input(LayerInfo::new("input", sim.input_bytes))
                .output(LayerInfo::new("output", sim.input_bytes / 4 + 1))
                .instruction_bytes(4096)
                .estimated_cycles(10_000)
                .build()?;
            Ok(Arc::new(exe))
        })
        .collect()
}

fn make_request(
    id: u64,
    exe: &Arc<Executable>,
    batch: usize,
) -> Result<(Arc<Request>, Receiver<bool>)> {
    let (tx, rx) = unbounded();
    let request = Arc::new(Request::new(id, Arc::clone(exe)));
    let input = Bytes::from(vec![0x5a; exe.inputs()[0].actual_size_bytes()]);
    for _ in 0..batch {
        // every batch element shares one input buffer
        request.add_input("input", Buffer::from_bytes(input.clone()))?;
        request.add_output(
            "output",
            Buffer::from(vec![0u8; exe.outputs()[0].actual_size_bytes()]),
        )?;
    }
    request.set_done(move |id, status| {
        if let Err(e) = &status {
            warn!("request {id} failed: {e}");
        }
        let _ = tx.send(status.is_ok());
    })?;
    request.prepare()?;
    Ok((request, rx))
}

fn cmd_simulate(config: DriverConfig, sim: &Simulation) -> Result<()> {
    let expiries = Arc::new(AtomicU64::new(0));
    let stack = {
        let expiries = Arc::clone(&expiries);
        Arc::new(DriverStack::new(config, move |level, id| {
            warn!("watchdog level {level} expired (activation {id})");
            expiries.fetch_add(1, Ordering::Relaxed);
        })?)
    };
    let mut engine = stack.software_engine(Arc::new(MemoryRegisters::new()), sim.engine.clone())?;
    let executables = Arc::new(build_executables(sim)?);
    let (done_tx, done_rx) = unbounded::<bool>();

    let started = Instant::now();
    let submitters: Vec<_> = (0..sim.submitters)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let executables = Arc::clone(&executables);
            let done_tx = done_tx.clone();
            let (requests, batch) = (sim.requests, sim.batch);
            thread::Builder::new()
                .name(format!("submitter-{t}"))
                .spawn(move || -> Result<()> {
                    for n in 0..requests {
                        let id = (t as u64) * requests + n;
                        let exe = &executables[(id % executables.len() as u64) as usize];
                        let (request, rx) = make_request(id, exe, batch)?;
                        if let Err(e) = stack.submit(&request) {
                            warn!("request {id} rejected: {e}");
                        }
                        let done_tx = done_tx.clone();
                        // forward without blocking the submitter
                        thread::spawn(move || {
                            if let Ok(ok) = rx.recv() {
                                let _ = done_tx.send(ok);
                            }
                        });
                    }
                    Ok(())
                })
                .context("spawning submitter")
        })
        .collect::<Result<_>>()?;
    drop(done_tx);

    let expected = sim.submitters as u64 * sim.requests;
    let (mut ok, mut failed) = (0u64, 0u64);
    let mut stalled = false;
    while ok + failed < expected {
        for status in done_rx.try_iter() {
            if status {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        if stalled {
            break;
        }
        match engine.step()? {
            StepOutcome::Stalled => stalled = true,
            StepOutcome::Idle => thread::sleep(Duration::from_micros(50)),
            StepOutcome::Dispatched(_) | StepOutcome::RequestCompleted => {}
        }
    }

    for s in submitters {
        match s.join() {
            Ok(result) => result?,
            Err(_) => bail!("submitter thread panicked"),
        }
    }

    if stalled {
        let grace: Duration = stack.config().watchdog.levels.iter().sum();
        println!("Engine stalled; waiting {grace:?} for the watchdog cascade ...");
        thread::sleep(grace + Duration::from_millis(50));
        stack.shutdown(CloseMode::Asap)?;
        while let Ok(status) = done_rx.recv_timeout(Duration::from_millis(200)) {
            if status {
                ok += 1;
            } else {
                failed += 1;
            }
        }
    } else {
        stack.shutdown(CloseMode::Graceful)?;
    }

    let stats = engine.stats();
    let elapsed = started.elapsed();
    println!("Requests          : {expected} ({ok} ok, {failed} failed)");
    println!("Hardware requests : {}", stats.requests);
    println!("Descriptors       : {}", stats.descriptors);
    println!("Bytes moved       : {}", stats.bytes);
    println!("Watchdog expiries : {}", expiries.load(Ordering::Relaxed));
    println!("Elapsed           : {elapsed:.2?}");
    info!("simulation finished in {elapsed:?}");
    Ok(())
}

fn cmd_realtime(
    mut config: DriverConfig,
    camera_timing: ExecutableTiming,
    detector_met: Duration,
    detector_per_frame: u32,
    frames: u32,
    pause_frames: u32,
) -> Result<()> {
    let Some(frame) = camera_timing.frame_time() else {
        bail!("--fps must be greater than zero");
    };
    config.real_time.enabled = true;

    let clock = Arc::new(ManualClock::default());
    let stack = DriverStack::with_clock(config, Arc::clone(&clock) as Arc<dyn Clock>, |level, _| {
        warn!("watchdog level {level} expired");
    })?;
    let mut engine =
        stack.software_engine(Arc::new(MemoryRegisters::new()), EngineConfig::default())?;

    let camera = Arc::new(Executable::builder(ExecutableId::new(1), "camera").build()?);
    let detector = Arc::new(Executable::builder(ExecutableId::new(2), "detector").build()?);
    let rt = stack.scheduler();
    rt.set_executable_timing(camera.id(), camera_timing.into())?;
    rt.set_executable_timing(
        detector.id(),
        ExecutableTiming {
            fps: camera_timing.fps,
            max_execution_time: detector_met,
            tolerance: Duration::ZERO,
        }
        .into(),
    )?;

    println!("frame  time      camera    detector");
    let mut next_id = 0u64;
    let mut submit = |exe: &Arc<Executable>| {
        next_id += 1;
        rt.submit(Arc::new(HardwareRequest::new(next_id, Arc::clone(exe))) as Arc<dyn TpuRequest>)
            .is_ok()
    };
    let mark = |admitted: bool| if admitted { "admit" } else { "reject" };

    let camera_stops = frames.saturating_sub(pause_frames);
    for n in 0..frames {
        clock.set(frame * n);
        let camera_status = if n < camera_stops {
            mark(submit(&camera))
        } else {
            "idle"
        };
        let detector_status: Vec<_> = (0..detector_per_frame)
            .map(|_| mark(submit(&detector)))
            .collect();
        println!(
            "{n:>5}  {:>8.1?}  {camera_status:<8}  {}",
            clock.now(),
            detector_status.join(",")
        );
        engine.run_until_idle()?;
    }

    stack.shutdown(CloseMode::Graceful)?;
    Ok(())
}
