//! Performance benchmarks for the frame codec and the Pong simulation

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use server::game::GameState;
use shared::framing::encode_frame;
use shared::{Delimiter, FrameCodec};
use std::time::Instant;

/// Benchmarks decoding many frames delivered in one buffer
#[test]
fn benchmark_codec_bulk_decode() {
    let frame = encode_frame(&json!({"command": "message", "message": "hello world"}), Delimiter::Newline)
        .unwrap();
    let frames = 10_000;
    let input: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * frames).collect();

    let start = Instant::now();
    let mut codec = FrameCodec::new(Delimiter::Newline);
    let decoded = codec.decode(&input);
    let duration = start.elapsed();

    println!(
        "Codec bulk decode: {} frames in {:?} ({:.2} ns/frame)",
        frames,
        duration,
        duration.as_nanos() as f64 / frames as f64
    );

    assert_eq!(decoded.len(), frames);
    assert!(decoded.iter().all(|f| f.is_ok()));
    assert!(duration.as_millis() < 500);
}

/// Benchmarks decoding when the stream arrives in small fragments
#[test]
fn benchmark_codec_fragmented_decode() {
    let frame = encode_frame(&json!({"paddle": 250.5}), Delimiter::Pipe).unwrap();
    let frames = 5_000;
    let input: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * frames).collect();

    let start = Instant::now();
    let mut codec = FrameCodec::new(Delimiter::Pipe);
    let mut decoded = 0;
    for chunk in input.chunks(7) {
        decoded += codec.decode(chunk).len();
    }
    let duration = start.elapsed();

    println!(
        "Codec fragmented decode: {} frames in {:?} ({:.2} ns/frame)",
        frames,
        duration,
        duration.as_nanos() as f64 / frames as f64
    );

    assert_eq!(decoded, frames);
    assert_eq!(codec.buffered(), 0);
    assert!(duration.as_millis() < 500);
}

/// Benchmarks simulation steps at the default tick rate
#[test]
fn benchmark_simulation_step() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut state = GameState::new(&mut rng);
    state.set_paddle_target(0, 100.0);
    state.set_paddle_target(1, 500.0);

    let iterations = 100_000;
    let start = Instant::now();
    let mut points = 0;

    for _ in 0..iterations {
        if state.step(1.0 / 60.0, &mut rng).is_some() {
            points += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Simulation step: {} iterations in {:?} ({:.2} ns/iter), {} points",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64,
        points
    );

    assert_eq!(
        points,
        state.players.iter().map(|p| p.score).sum::<u32>()
    );
    assert!(duration.as_millis() < 500);
}

/// Benchmarks building and serializing the per-tick snapshot
#[test]
fn benchmark_snapshot_serialization() {
    let mut rng = StdRng::seed_from_u64(7);
    let state = GameState::new(&mut rng);

    let iterations = 10_000;
    let start = Instant::now();
    let mut bytes = 0;

    for _ in 0..iterations {
        let frame = encode_frame(&state.snapshot(), Delimiter::Newline).unwrap();
        bytes += frame.len();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot serialization: {} iterations in {:?} ({:.2} μs/iter, {} bytes)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        bytes
    );

    assert!(bytes > 0);
    assert!(duration.as_millis() < 2000);
}
