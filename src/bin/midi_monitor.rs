//! MIDI Monitor - Console tool for debugging the sequencer's MIDI traffic
//!
//! Publishes the playback destination and prints every message it receives.
//!
//! Usage: cargo run --bin midi_monitor -- [--duration <secs>] [--play <file.mid>]
//!        [--record <file.mid>] [--thru]

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use midi_sequencer::endpoint::system::MidirBackend;
use midi_sequencer::{
    dispatch, EndpointRegistry, EndpointRole, ListenerRegistry, MidiBackend,
    MidiEvent, MidiListener, PlaybackDriver, Recorder, Sampler, SequencerConfig, Sequencer,
    SmfStore, SoundEngine, WallClock,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let arg_value = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let duration_secs: Option<u64> = arg_value("--duration").and_then(|s| s.parse().ok());
    let play_path = arg_value("--play").map(PathBuf::from);
    let record_path = arg_value("--record").map(PathBuf::from);
    let thru = args.iter().any(|a| a == "--thru");

    let config = SequencerConfig::load(SequencerConfig::default_path())
        .context("Failed to load sequencer config")?;

    println!("=== MIDI Monitor ===");

    let backend = Arc::new(MidirBackend::new(config.application_identity.clone()));
    let destinations = backend
        .destination_names()
        .context("Failed to list MIDI destinations")?;
    println!("Available MIDI destinations:");
    for (i, name) in destinations.iter().enumerate() {
        println!("  {}: {}", i, name);
    }
    println!();

    let registry = Arc::new(
        EndpointRegistry::new(backend, config.endpoint_names()).with_warmup(config.endpoint_warmup()),
    );

    let listeners = ListenerRegistry::new();
    let printer = Arc::new(Printer);
    listeners.subscribe(&printer);
    let (sender, mut dispatcher) = dispatch::channel(listeners);

    // Keeps the endpoints alive until the end of main
    let _monitor;
    let driver;
    let mut sequencer = None;
    let mut recorder = None;

    if let Some(path) = &play_path {
        let shared = Arc::new(Mutex::new(Sequencer::from_config(
            &config,
            registry.clone(),
            Arc::new(SmfStore::new()),
            sender.clone(),
        )));
        {
            let mut sequencer = shared.lock().unwrap_or_else(|e| e.into_inner());
            sequencer
                .play_file(path)
                .with_context(|| format!("Failed to play {}", path.display()))?;
            info!(
                "Playing {} ({:.1} s at {:.1} bpm)",
                path.display(),
                sequencer.length_in_seconds(),
                sequencer.bpm()
            );
        }
        driver = Some(PlaybackDriver::spawn(&shared, Duration::from_millis(1))?);
        sequencer = Some(shared);
        _monitor = None;
    } else {
        driver = None;
        let endpoint = registry
            .ensure_role(EndpointRole::Playback, config.endpoint_policy.playback)
            .context("Failed to create playback destination")?;
        println!("Listening on: {}\n", endpoint.name());

        if thru {
            let sampler = Arc::new(Sampler::new(
                Arc::new(PrintingEngine),
                registry.clone(),
                config.wire_channel(),
            ));
            sampler.attach(&endpoint)?;
            _monitor = Some((endpoint, Some(sampler)));
        } else {
            endpoint.on_packet_received(print_midi_message)?;
            _monitor = Some((endpoint, None));
        }
    }

    if let Some(path) = &record_path {
        let mut session = Recorder::from_config(
            &config,
            registry.clone(),
            Arc::new(SmfStore::new()),
            Arc::new(WallClock),
        );
        session.begin();
        if let Some(endpoint) = session.endpoint() {
            println!("Recording from: {} into {}\n", endpoint.name(), path.display());
        }
        recorder = Some(session);
    }

    println!("{:<26} {:<20} {:<30} DETAILS", "TIMESTAMP", "TYPE", "DATA (HEX)");
    println!("{}", "-".repeat(94));

    if let Some(secs) = duration_secs {
        println!("\nMonitoring for {} seconds...\n", secs);
        let deadline = std::time::Instant::now() + Duration::from_secs(secs);
        while std::time::Instant::now() < deadline {
            dispatcher.drain();
            std::thread::sleep(Duration::from_millis(10));
        }
    } else {
        println!("\nPress Enter to quit (or use --duration <secs>)...\n");
        let waiter = std::thread::spawn(|| {
            let mut input = String::new();
            io::stdin().read_line(&mut input).map(|_| ())
        });
        while !waiter.is_finished() {
            dispatcher.drain();
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    dispatcher.drain();

    if let (Some(mut session), Some(path)) = (recorder, record_path) {
        session
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        println!("Saved recording to {}", path.display());
    }

    drop(driver);
    if let Some(shared) = sequencer {
        shared.lock().unwrap_or_else(|e| e.into_inner()).stop();
    }
    Ok(())
}

/// Prints listener notifications as they are delivered.
struct Printer;

impl MidiListener for Printer {
    fn on_note_on(&self, note: u8, velocity: u8, channel: u8) {
        println!(
            "{:<26} {:<20} {:<30} Ch:{} Note:{} Vel:{}",
            timestamp(),
            "LISTENER_NOTE_ON",
            "",
            channel + 1,
            note_name(note),
            velocity
        );
    }

    fn on_note_off(&self, note: u8, channel: u8) {
        println!(
            "{:<26} {:<20} {:<30} Ch:{} Note:{}",
            timestamp(),
            "LISTENER_NOTE_OFF",
            "",
            channel + 1,
            note_name(note)
        );
    }

    fn on_sequence_finished(&self) {
        println!("{:<26} {:<20}", timestamp(), "SEQUENCE_FINISHED");
    }
}

/// Sound engine stand-in that prints what it would play.
struct PrintingEngine;

impl SoundEngine for PrintingEngine {
    fn start_note(&self, note: u8, velocity: u8, channel: u8) {
        println!("  engine: start {} vel {} ch {}", note_name(note), velocity, channel + 1);
    }

    fn stop_note(&self, note: u8, channel: u8) {
        println!("  engine: stop {} ch {}", note_name(note), channel + 1);
    }

    fn send_controller(&self, controller: u8, value: u8, channel: u8) {
        println!("  engine: CC {} = {} ch {}", controller, value, channel + 1);
    }

    fn send_program_change(&self, program: u8, bank_msb: u8, bank_lsb: u8, channel: u8) {
        println!(
            "  engine: program {} bank {:02X}/{:02X} ch {}",
            program,
            bank_msb,
            bank_lsb,
            channel + 1
        );
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

fn print_midi_message(message: &[u8]) {
    let Some(event) = MidiEvent::from_bytes(message) else {
        return;
    };

    let hex_str: String = message.iter().map(|b| format!("{:02X} ", b)).collect();
    let (msg_type, details) = describe(message, &event);

    // Flush to ensure immediate output
    println!("{:<26} {:<20} {:<30} {}", timestamp(), msg_type, hex_str.trim(), details);
    let _ = io::stdout().flush();
}

fn describe(message: &[u8], event: &MidiEvent) -> (&'static str, String) {
    // 1-indexed for display
    let ch = |channel: u8| channel + 1;

    match *event {
        MidiEvent::NoteOn {
            channel,
            note,
            velocity,
        } => {
            let msg_type = if velocity == 0 { "NOTE_ON (VEL 0)" } else { "NOTE_ON" };
            (msg_type, format!("Ch:{} Note:{} Vel:{}", ch(channel), note_name(note), velocity))
        }
        MidiEvent::NoteOff {
            channel,
            note,
            velocity,
        } => (
            "NOTE_OFF",
            format!("Ch:{} Note:{} Vel:{}", ch(channel), note_name(note), velocity),
        ),
        MidiEvent::PolyAftertouch {
            channel,
            note,
            pressure,
        } => (
            "POLY_PRESSURE",
            format!("Ch:{} Note:{} Pressure:{}", ch(channel), note_name(note), pressure),
        ),
        MidiEvent::ControlChange {
            channel,
            controller,
            value,
        } => (
            "CONTROL_CHANGE",
            format!("Ch:{} CC:{} Val:{}", ch(channel), controller, value),
        ),
        MidiEvent::ProgramChange { channel, program } => {
            ("PROGRAM_CHANGE", format!("Ch:{} Prog:{}", ch(channel), program))
        }
        MidiEvent::ChannelAftertouch { channel, pressure } => {
            ("CHANNEL_PRESSURE", format!("Ch:{} Pressure:{}", ch(channel), pressure))
        }
        MidiEvent::PitchBend { channel, lsb, msb } => {
            let value = (u16::from(msb) << 7) | u16::from(lsb);
            ("PITCH_BEND", format!("Ch:{} Val:{}", ch(channel), value))
        }
        MidiEvent::Unknown { raw_status } => match raw_status {
            0xF0 => ("SYSEX", format!("{} bytes", message.len())),
            0xF8 => ("CLOCK", "MIDI Clock pulse (24 ppqn)".to_string()),
            0xFA => ("START", "Start playback from beginning".to_string()),
            0xFB => ("CONTINUE", "Continue playback".to_string()),
            0xFC => ("STOP", "Stop playback".to_string()),
            0xFE => ("ACTIVE_SENSE", "Active sensing".to_string()),
            0xFF => ("RESET", "System reset".to_string()),
            _ => ("UNKNOWN", format!("Status: 0x{:02X}", raw_status)),
        },
    }
}

fn note_name(note: u8) -> String {
    let names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1;
    let name = names[(note % 12) as usize];
    format!("{}{}", name, octave)
}
