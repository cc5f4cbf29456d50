//! voxduplex console entrypoint: wires microphone, conversational service and
//! speaker into one pipeline and talks until `quit`.
//!
//! # Threads
//!
//! - Stage workers: capture, generation, playback (one each, owned by the pipeline)
//! - Capture producer: reads the input device
//! - Playback worker: feeds the output device
//! - Stdin reader: line commands for the console loop

mod console;
mod devices;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use voxduplex::audio::{CpalInput, CpalOutput};
use voxduplex::config::AppConfig;
use voxduplex::pipeline::ChannelObserver;
use voxduplex::playback::Player;
use voxduplex::service::OmniClient;
use voxduplex::stages::{
    build_classifier, voice_pipeline, CaptureStage, GenerationStage, PlaybackStage,
};
use voxduplex::telemetry::init_tracing;

/// Max pending turn-state updates for the console.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Max pending pipeline events for the console.
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn main() -> Result<()> {
    let mut config = AppConfig::parse();
    if config.list_input_devices {
        devices::print_input_devices();
        return Ok(());
    }
    config.validate()?;
    if let Some(path) = init_tracing(&config) {
        eprintln!("tracing to {}", path.display());
    }

    let service = OmniClient::new(config.service_config()?)
        .context("failed to build the service client")?;
    let voice = config.voice_pipeline_config();
    let classifier = build_classifier(&voice)?;
    let ears = Arc::new(CaptureStage::new(
        Arc::new(CpalInput::new(config.input_device.clone())),
        classifier,
        voice,
    ));
    let brain = Arc::new(GenerationStage::new(
        Arc::new(service),
        config.generation_config(),
    ));
    let mouth = Arc::new(PlaybackStage::new(Player::new(
        Arc::new(CpalOutput::new(config.output_device.clone())),
        config.playback_config(),
    )));
    let pipeline = voice_pipeline(ears, Arc::clone(&brain), mouth);

    let (observer, states) = ChannelObserver::new(STATE_CHANNEL_CAPACITY);
    pipeline.add_observer(observer);
    let events = pipeline.subscribe(EVENT_CHANNEL_CAPACITY);
    let commands = console::spawn_command_reader().context("failed to spawn stdin reader")?;

    pipeline.start().context("failed to start the voice pipeline")?;
    tracing::info!(stages = ?pipeline.stage_names(), "voxduplex started");
    if !config.json_events {
        println!("Listening. Commands: interrupt | history | quit");
    }

    console::run(
        &pipeline,
        &brain,
        states,
        events,
        commands,
        config.json_events,
    );

    pipeline.stop();
    tracing::info!("voxduplex stopped");
    Ok(())
}
