//! Exercises the tracker end to end. Pick a scenario by name on the command
//! line; each one is the minimal program that makes the Tracker take the
//! corresponding path.
//!
//!     cargo run --bin demo -- round-trip
//!     cargo run --bin demo -- leak
//!     cargo run --bin demo -- corruption   # aborts the process
//!     cargo run --bin demo -- double-free  # aborts the process

use std::env;

fn scenario_round_trip() {
    let data = vec![0u8; 800];
    drop(data);

    let boxed = Box::new([0u32; 4]);
    drop(boxed);
}

fn scenario_realloc_move() {
    let mut v: Vec<u8> = Vec::with_capacity(8);
    v.resize(3_200_000, 0); // forces a move once the small inline buffer is outgrown
    drop(v);
}

fn scenario_leak() {
    let data = vec![0u8; 256];
    std::mem::forget(data); // never freed: reported at shutdown
}

fn scenario_corruption() {
    let mut data = vec![0u8; 8];
    let ptr = data.as_mut_ptr();
    // Writes one byte past the requested length, into the tail guard.
    // Detected only once the delayed free actually drains, not on this write.
    unsafe {
        *ptr.add(8) = 0xFF;
    }
    drop(data);
    std::thread::sleep(std::time::Duration::from_millis(1_200));
    heapwatch::shutdown(); // forces the drain that discovers the corruption
}

fn scenario_double_free() {
    let layout = std::alloc::Layout::from_size_align(64, 8).unwrap();
    unsafe {
        let ptr = std::alloc::alloc(layout);
        std::alloc::dealloc(ptr, layout);
        std::alloc::dealloc(ptr, layout); // still on the delayed-free queue: aborts
    }
}

fn main() {
    heapwatch::init(heapwatch::Config {
        delay_ms: 1_000,
        ..heapwatch::Config::default()
    })
    .expect("install heapwatch");

    let scenario = env::args().nth(1).unwrap_or_else(|| "round-trip".to_string());
    match scenario.as_str() {
        "round-trip" => scenario_round_trip(),
        "realloc-move" => scenario_realloc_move(),
        "leak" => scenario_leak(),
        "corruption" => scenario_corruption(),
        "double-free" => scenario_double_free(),
        other => {
            eprintln!("unknown scenario: {other}");
            eprintln!("choices: round-trip, realloc-move, leak, corruption, double-free");
            std::process::exit(2);
        }
    }

    heapwatch::shutdown();
}
