//! Scripted lesson narrated on stdout
//!
//! Drives the engine through every phase the way the interactive front
//! end would, printing the hint line before each stage and the event
//! log after it. Pick a scenario by name, or get the smallest one.

use std::error::Error;

use packetflow_core::EngineEvent;
use packetflow_engine::SimConfig;
use packetflow_test::{scenarios, DriverError, LessonDriver};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let scenario = match args.get(1).map(String::as_str) {
        Some("minimal") | None => scenarios::minimal(),
        Some("standard") => scenarios::standard(),
        Some("lossy") => scenarios::lossy(),
        Some("flood") => scenarios::frame_flood(),
        Some(other) => {
            println!("Unknown scenario '{}'", other);
            println!("Usage: flow-demo [minimal|standard|lossy|flood]");
            return Ok(());
        }
    };

    println!("╔══════════════════════════════════════════════╗");
    println!("║   Packetflow - one lesson, front to back     ║");
    println!("╚══════════════════════════════════════════════╝");

    let mut driver = LessonDriver::new(scenario, SimConfig::default())?;
    println!(
        "file splits into {} fragments, broadcast sends {} frames",
        driver.fragment_total(),
        driver.frame_count()
    );

    let stages: [(&str, fn(&mut LessonDriver) -> Result<(), DriverError>); 5] = [
        ("Fragmentation", LessonDriver::run_fragmentation),
        ("Handshake", LessonDriver::run_handshake),
        ("Transfer", LessonDriver::run_transfer),
        ("Teardown", LessonDriver::run_teardown),
        ("Broadcast", LessonDriver::run_broadcast),
    ];

    for (name, stage) in stages {
        println!();
        println!("--- {} ---", name);
        println!("hint: {}", driver.sim().hint());
        stage(&mut driver)?;
        for event in driver.take_log() {
            println!("  {}", describe(&event));
        }
    }

    let stats = driver.sim().stats();
    println!();
    println!("Done in {} virtual ms", driver.sim().now().as_millis());
    println!(
        "  placements {}  rejections {}  losses {}  retransmit signals {}",
        stats.placements, stats.rejections, stats.losses, stats.retransmit_signals
    );
    println!(
        "  frames delivered {}  missed {}  timers fired {}",
        stats.frames_delivered, stats.frames_missed, stats.timers_fired
    );

    Ok(())
}

fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::StatusChanged(update) => {
            let mut line = format!("packet {} is now {}", update.id, update.status);
            if let Some(seq) = update.seq {
                line.push_str(&format!(", seq {}", seq));
            }
            if let Some(ack) = update.ack {
                line.push_str(&format!(", ack {}", ack));
            }
            line
        }
        EngineEvent::PhaseChanged { from, to } => format!("lesson phase: {} -> {}", from, to),
        EngineEvent::ConnectionPhase { client, from, to } => {
            format!("client {} connection: {} -> {}", client, from, to)
        }
        EngineEvent::RetransmitNeeded { client, seq } => {
            format!(
                "client {} needs fragment {} again (duplicate acks)",
                client, seq
            )
        }
        EngineEvent::SimulatedLoss { id, seq } => {
            format!("packet {} carrying fragment {} faded out on the wire", id, seq)
        }
        EngineEvent::FileComplete { file } => {
            format!("file {} reassembled from its fragments", file)
        }
        EngineEvent::FrameDelivered {
            number,
            delivered,
            missed,
        } => format!(
            "frame {} reached {} client(s), missed {}",
            number,
            delivered.len(),
            missed.len()
        ),
        EngineEvent::Rejected { id, reason } => format!("packet {} refused: {}", id, reason),
        EngineEvent::LessonComplete => "lesson complete".to_string(),
    }
}
