use std::error::Error;

use bindery::{BufferClass, ComputeContext, Headless, ShaderSource, device::Command};

fn main() -> Result<(), Box<dyn Error>> {
    let shader = r#"
struct Params {
    count: u32,
    stride: u32,
    pad0: u32,
    pad1: u32,
}

var<push_constant> params: Params;

@group(0) @binding(0) var<storage, read> samples: array<f32>;
@group(0) @binding(1) var<storage, read_write> freq: array<vec2<f32>>;

const TAU: f32 = 6.2831853;

@compute @workgroup_size(64, 1, 1)
fn transform(@builtin(global_invocation_id) index: vec3<u32>) {
    let k = index.x;
    if (k < params.count) {
        var sum = vec2<f32>(0.0);
        for (var n = 0u; n < params.count; n += 1u) {
            let phase = TAU * f32(k * n) / f32(params.count);
            sum += samples[n * params.stride] * vec2<f32>(cos(phase), -sin(phase));
        }
        freq[k] = sum;
    }
}
"#;

    let mut context = ComputeContext::new(Headless::new());

    let samples: Vec<f32> = (0..64).map(|n| (n as f32 * 0.1).sin()).collect();
    context.create_buffer(
        "Samples",
        BufferClass::Storage,
        256,
        Some(bytemuck::cast_slice(&samples)),
    )?;
    context.create_buffer("Freq", BufferClass::Storage, 512, None)?;

    let program = context.add_program(ShaderSource::inline(shader));
    context.bind(program, 0, 0, "Samples")?;
    context.bind(program, 0, 1, "Freq")?;

    let push: [u32; 4] = [64, 1, 0, 0];
    context.dispatch(program, 64, 1, 1, Some(bytemuck::bytes_of(&push)))?;
    context.sync();

    for command in context.device().submitted() {
        match command {
            Command::BindPipeline(pipeline) => println!("bind pipeline   {pipeline}"),
            Command::PushConstants(data) => println!("push constants  {} bytes", data.len()),
            Command::BindUniformSet { set, index } => println!("bind set        {set} at {index}"),
            Command::Dispatch([x, y, z]) => println!("dispatch        ({x}, {y}, {z})"),
        }
    }

    let freq = context.read_back("Freq")?;
    println!("read back       {} bytes", freq.len());

    context.close(program)?;
    Ok(())
}
