use anyhow::Result;
use sonal::math::Vec3;
use sonal::{
    BufferFormat, BufferId, ContextTicker, SoftwareGraph, SonalContext, SonalContextDesc,
    SonalDevice, SonalEngine,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const SAMPLE_RATE: u32 = 48000;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let desc = SonalContextDesc::default().sample_rate(SAMPLE_RATE);
    let graph = SoftwareGraph::new(desc.sample_rate, desc.channels)?;
    let device = SonalDevice::new();
    let context = Arc::new(Mutex::new(
        device.create_context(desc.clone(), graph.clone())?,
    ));

    let mut engine = SonalEngine::new(desc.clone(), graph)?;
    engine.start()?;
    let mut ticker = ContextTicker::spawn(Arc::clone(&context), desc.tick_interval)?;

    log::info!("=== Streaming queue orbiting the listener ===");
    run_orbit(&device, &context)?;

    log::info!("=== Looping static buffer with pause/resume ===");
    run_loop(&device, &context)?;

    ticker.stop();
    engine.stop()?;
    log::info!(
        "Demo finished after {} frames",
        engine.frames_rendered()
    );
    Ok(())
}

/// Interleaved little-endian 16-bit mono sine.
fn sine_pcm(frequency: f32, seconds: f32) -> Vec<u8> {
    let frames = (seconds * SAMPLE_RATE as f32) as usize;
    (0..frames)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            ((t * frequency * std::f32::consts::TAU).sin() * 0.3 * i16::MAX as f32) as i16
        })
        .flat_map(i16::to_le_bytes)
        .collect()
}

fn drain_events(context: &Mutex<SonalContext<SoftwareGraph>>) {
    let ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for event in ctx.poll_events() {
        log::info!("Event: {:?}", event);
    }
}

fn run_orbit(device: &SonalDevice, context: &Mutex<SonalContext<SoftwareGraph>>) -> Result<()> {
    let chunks: Vec<BufferId> = [330.0, 392.0, 440.0, 494.0, 523.0, 494.0, 440.0, 392.0]
        .iter()
        .map(|&f| device.create_buffer_from_pcm(BufferFormat::Mono16, &sine_pcm(f, 0.5), SAMPLE_RATE))
        .collect::<sonal::error::Result<_>>()?;

    let source = {
        let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let source = ctx.create_source()?;
        ctx.queue_buffers(source, &chunks)?;
        ctx.set_reference_distance(source, 1.0)?;
        ctx.set_max_distance(source, 20.0)?;
        ctx.play(source)?;
        source
    };

    // Orbit at radius 2 for the length of the queue
    let steps = 80;
    for step in 0..steps {
        let angle = step as f32 / steps as f32 * std::f32::consts::TAU;
        let position = Vec3::new(angle.sin() * 2.0, 0.0, -angle.cos() * 2.0);
        context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set_position(source, position)?;
        thread::sleep(Duration::from_millis(50));
    }
    drain_events(context);

    let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let processed = ctx.buffers_processed(source)?;
    let unqueued = ctx.unqueue_buffers(source, processed)?;
    log::info!("Unqueued {} processed buffer(s)", unqueued.len());
    ctx.delete_source(source)?;
    drop(ctx);
    device.delete_buffers(&chunks)?;
    Ok(())
}

fn run_loop(device: &SonalDevice, context: &Mutex<SonalContext<SoftwareGraph>>) -> Result<()> {
    let buffer = device.create_buffer_from_pcm(BufferFormat::Mono16, &sine_pcm(262.0, 0.3), SAMPLE_RATE)?;

    let source = {
        let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let source = ctx.create_source()?;
        ctx.bind_buffer(source, Some(buffer))?;
        ctx.set_looping(source, true)?;
        ctx.set_relative(source, true)?;
        ctx.set_position(source, Vec3::new(-1.0, 0.0, 0.0))?;
        ctx.play(source)?;
        source
    };

    thread::sleep(Duration::from_millis(1500));
    {
        let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ctx.pause(source)?;
        log::info!(
            "Paused at {:.3} s",
            ctx.offset(source, sonal::OffsetUnit::Seconds)?
        );
    }
    thread::sleep(Duration::from_millis(500));
    {
        let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ctx.set_playback_rate(source, 1.5)?;
        ctx.play(source)?;
    }
    thread::sleep(Duration::from_millis(1500));

    let mut ctx = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    ctx.stop(source)?;
    ctx.delete_source(source)?;
    drop(ctx);
    drain_events(context);
    device.delete_buffer(buffer)?;
    Ok(())
}
