//! Application entry point: a spoken round-table in the terminal.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Build the text-generation and speech-synthesis clients from config.
//! 5. Open the speaker, or fall back to silent real-time playback.
//! 6. Load Whisper for spoken interruptions (`whisper` feature only).
//! 7. Spawn the conversation and the caption printer.
//! 8. Read commands from stdin until `/quit` or end of input.
//!
//! # Commands
//!
//! | input      | effect                                          |
//! |------------|-------------------------------------------------|
//! | any text   | interrupt the hosts with that text              |
//! | `/talk`    | start recording; `/talk` again sends the clip   |
//! | `/start`   | restart the rotation                            |
//! | `/stop`    | silence everyone and idle                       |
//! | `/quit`    | shut down                                       |

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use voice_roundtable::{
    audio::{AudioOutput, PlaybackSlot, SilentOutput},
    config::AppConfig,
    conversation::{
        ChannelObserver, Conversation, ConversationEvent, ConversationHandle, Host, LogObserver,
        Observers,
    },
    llm::{OpenAiGenerator, TextGenerator},
    speech::{OpenAiSynthesizer, SpeechBackend},
    stt::SttEngine,
};

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-roundtable starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 4. Backends
    let generator: Arc<dyn TextGenerator> = Arc::new(OpenAiGenerator::from_config(&config.llm));
    let synth = Arc::new(OpenAiSynthesizer::from_config(&config.tts));

    // 5. Output
    let output = Arc::new(PlaybackSlot::new(open_output(&config)));
    let backend = SpeechBackend::new(
        synth,
        output,
        config.tts.dispatch_config(),
        config.tts.cache_capacity,
    );

    // 6. Speech-to-text
    let stt = load_stt(&config);

    // 7. Conversation + captions
    let (captions, events) = ChannelObserver::new();
    let observer = Arc::new(
        Observers::new()
            .with(Arc::new(LogObserver))
            .with(Arc::new(captions)),
    );
    tokio::spawn(print_captions(events));

    let (handle, task) = Conversation::spawn(
        generator,
        backend,
        observer,
        stt,
        &config.conversation,
    );

    let hosts = config.roster();
    println!(
        "Topic: {}. Type to interrupt, /talk to speak, /stop, /start, /quit.",
        config.conversation.topic
    );
    handle.start(hosts.clone()).await?;

    // 8. Command loop
    read_commands(&handle, &hosts).await?;

    if handle.shutdown().await.is_err() {
        log::warn!("conversation loop already gone");
    }
    task.await.context("conversation task failed")?;
    log::info!("voice-roundtable shut down");
    Ok(())
}

#[cfg(feature = "device")]
fn open_output(config: &AppConfig) -> Arc<dyn AudioOutput> {
    use voice_roundtable::audio::CpalOutput;

    if !config.audio.use_device {
        return Arc::new(SilentOutput);
    }
    match CpalOutput::open() {
        Ok(output) => Arc::new(output),
        Err(e) => {
            log::warn!("Speaker unavailable ({e}); playing silently");
            Arc::new(SilentOutput)
        }
    }
}

#[cfg(not(feature = "device"))]
fn open_output(_config: &AppConfig) -> Arc<dyn AudioOutput> {
    Arc::new(SilentOutput)
}

#[cfg(feature = "whisper")]
fn load_stt(config: &AppConfig) -> Option<Arc<dyn SttEngine>> {
    use voice_roundtable::config::AppPaths;
    use voice_roundtable::stt::{TranscribeParams, WhisperEngine};

    let path = AppPaths::new().model_file(&config.stt.model);
    match WhisperEngine::load(&path, TranscribeParams::from_config(&config.stt)) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            log::warn!("Spoken interruptions disabled: {e}");
            None
        }
    }
}

#[cfg(not(feature = "whisper"))]
fn load_stt(_config: &AppConfig) -> Option<Arc<dyn SttEngine>> {
    log::info!("Built without `whisper`; interruptions are typed only");
    None
}

async fn print_captions(mut events: mpsc::UnboundedReceiver<ConversationEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConversationEvent::Sentence { host, sentence } => {
                println!("{}: {}", host.name, sentence.text);
            }
            ConversationEvent::Error(msg) => eprintln!("! {msg}"),
            ConversationEvent::State(_) | ConversationEvent::TurnEnded(_) => {}
        }
    }
}

async fn read_commands(handle: &ConversationHandle, hosts: &[Host]) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut mic = Mic::default();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/stop" => handle.stop().await?,
            "/start" => handle.start(hosts.to_vec()).await?,
            "/talk" => mic.toggle(handle).await?,
            text => handle.interrupt(text).await?,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mic: push-to-talk toggle for `/talk`
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Mic {
    #[cfg(feature = "device")]
    recording: Option<voice_roundtable::audio::Recording>,
}

impl Mic {
    #[cfg(feature = "device")]
    async fn toggle(&mut self, handle: &ConversationHandle) -> anyhow::Result<()> {
        use voice_roundtable::audio::MicRecorder;

        match self.recording.take() {
            Some(recording) => {
                let samples = tokio::task::spawn_blocking(move || recording.finish()).await?;
                println!("(sending {:.1} s of audio)", samples.len() as f32 / 16_000.0);
                handle.interrupt_with_audio(samples).await?;
            }
            None => match MicRecorder::start() {
                Ok(recording) => {
                    println!("(recording; /talk again to send)");
                    self.recording = Some(recording);
                }
                Err(e) => eprintln!("! microphone unavailable: {e}"),
            },
        }
        Ok(())
    }

    #[cfg(not(feature = "device"))]
    async fn toggle(&mut self, _handle: &ConversationHandle) -> anyhow::Result<()> {
        eprintln!("! built without `device`; microphone unavailable");
        Ok(())
    }
}
