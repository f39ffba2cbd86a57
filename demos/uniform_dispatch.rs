// demos/uniform_dispatch.rs - drive mixed reactions through the uniform handle.
//
// Walks the whole surface once:
//   1. print the buffer [0, 1, ..., 31]
//   2. Scale(0.1) via the concrete type, print
//   3. Offset(2) via the concrete type, print
//   4. reset the buffer
//   5. rebuild both reactions through the factory into a heterogeneous
//      collection and drive them through `SharedReaction`, printing after
//      each one
//
// USAGE
//   cargo run --example uniform_dispatch

use std::process::ExitCode;

use dasher::{make_reaction, GpuDevice, Offset, Reaction, Scale, SharedReaction};

const N: usize = 32;

fn print_buffer(data: &[f32]) {
    let line: Vec<String> = data.iter().map(|x| format!("{x}")).collect();
    println!("{}", line.join(" "));
}

fn main() -> ExitCode {
    println!("Initialising GPU...");
    let gpu = match GpuDevice::new() {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("failed to initialise a Vulkan GPU: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("Using {}", gpu.adapter_info);

    let mut data: Vec<f32> = (0..N).map(|i| i as f32).collect();
    print_buffer(&data);

    // Concrete call path.
    let scale = Scale::new(0.1).expect("0.1 is a valid factor");
    if let Err(e) = scale.react(&gpu, &mut data) {
        eprintln!("scale reaction failed: {e}");
        return ExitCode::FAILURE;
    }
    print_buffer(&data);

    let offset = Offset::new(2);
    if let Err(e) = offset.react(&gpu, &mut data) {
        eprintln!("offset reaction failed: {e}");
        return ExitCode::FAILURE;
    }
    print_buffer(&data);

    // Reset, then the same two reactions through the uniform handle.
    for (i, x) in data.iter_mut().enumerate() {
        *x = i as f32;
    }

    let reactions: Vec<SharedReaction> = vec![
        make_reaction::<Scale>(0.1).expect("0.1 is a valid factor"),
        make_reaction::<Offset>(2).expect("Offset construction is infallible"),
    ];

    for rx in &reactions {
        if let Err(e) = rx.react(&gpu, &mut data) {
            eprintln!("reaction failed: {e}");
            return ExitCode::FAILURE;
        }
        print_buffer(&data);
    }

    ExitCode::SUCCESS
}
