//! Benchmarks for the packet-flow engine

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use packetflow_core::{ClientId, PacketId, SimTime};
use packetflow_engine::{Connection, PhaseTag, TimerAction, TimerQueue};
use packetflow_test::{scenarios, LessonDriver};

fn bench_full_lesson(c: &mut Criterion) {
    c.bench_function("full_lesson_minimal", |b| {
        b.iter(|| {
            let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
            driver.run_full_lesson().expect("scripted lesson");
            black_box(driver.sim().now())
        })
    });
}

fn bench_reliable_half(c: &mut Criterion) {
    c.bench_function("reliable_half_standard", |b| {
        b.iter(|| {
            let mut driver = LessonDriver::fast(scenarios::standard()).unwrap();
            driver.run_reliable().expect("scripted lesson");
            black_box(driver.sim().now())
        })
    });
}

fn bench_timer_queue_churn(c: &mut Criterion) {
    c.bench_function("timer_queue_churn", |b| {
        b.iter(|| {
            let mut queue = TimerQueue::new();
            for i in 0..64u64 {
                queue.schedule(
                    SimTime::from_millis(i),
                    PhaseTag::Reliable,
                    TimerAction::FadeOut {
                        packet: PacketId::new(i),
                    },
                );
            }
            let mut fired = 0u32;
            while let Some(entry) = queue.pop_due(SimTime::from_millis(64)) {
                fired += 1;
                black_box(entry.fire_at);
            }
            black_box(fired)
        })
    });
}

fn bench_connection_out_of_order(c: &mut Criterion) {
    // Worst case for the reorder buffer: everything waits on sequence 1.
    let order: Vec<u32> = (2..=32).chain([1]).collect();

    c.bench_function("connection_out_of_order", |b| {
        b.iter(|| {
            let mut conn = Connection::new(ClientId::new(1), 32, 3);
            conn.open();
            conn.establish();
            for &seq in &order {
                black_box(conn.on_data(black_box(seq)));
            }
            black_box(conn.is_complete())
        })
    });
}

fn bench_advance_idle(c: &mut Criterion) {
    let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
    driver.run_reliable().expect("scripted lesson");
    let sim = driver.sim_mut();

    c.bench_function("advance_idle", |b| {
        b.iter(|| {
            sim.advance(Duration::from_millis(1));
            black_box(sim.now())
        })
    });
}

criterion_group!(
    benches,
    bench_full_lesson,
    bench_reliable_half,
    bench_timer_queue_churn,
    bench_connection_out_of_order,
    bench_advance_idle,
);
criterion_main!(benches);
