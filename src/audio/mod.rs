pub mod sounds;

use anyhow::{Context, Result};
use rodio::{Decoder, OutputStream, Sink, Source};
use sounds::{AlarmChime, BrownNoise, Rain};
use std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::ports::AudioPlayer;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// What a [`RodioPlayer`] plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundAsset {
    BrownNoise,
    Rain,
    Chime,
    File(PathBuf),
}

impl SoundAsset {
    /// Built-in names map to synthesized sounds; anything else is a path.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "brown_noise" => Self::BrownNoise,
            "rain" => Self::Rain,
            "chime" => Self::Chime,
            other => Self::File(PathBuf::from(other)),
        }
    }
}

enum AudioCommand {
    Start,
    Pause,
    Resume,
    Stop,
}

/// How often the audio thread checks whether a finite sound has run out.
const FINISH_POLL: Duration = Duration::from_millis(200);

/// An opened output the audio thread can drive.
trait Playback {
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn is_finished(&self) -> bool;
}

struct RodioOutput {
    _stream: OutputStream,
    sink: Sink,
}

impl Playback for RodioOutput {
    fn pause(&self) {
        self.sink.pause();
    }

    fn resume(&self) {
        self.sink.play();
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }
}

/// Plays one sound asset on a dedicated audio thread. The rodio output
/// stream is not `Send`, so it lives on that thread and is driven by
/// commands.
pub struct RodioPlayer {
    name: &'static str,
    asset: SoundAsset,
    looping: bool,
    volume: f32,
    tx: Mutex<Option<Sender<AudioCommand>>>,
    playing: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

impl RodioPlayer {
    pub fn new(name: &'static str, asset: SoundAsset, looping: bool, volume: f32) -> Self {
        Self {
            name,
            asset,
            looping,
            volume: volume.clamp(0.0, 1.0),
            tx: Mutex::new(None),
            playing: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|_| anyhow::anyhow!("audio command lock poisoned"))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let asset = self.asset.clone();
        let looping = self.looping;
        let volume = self.volume;
        let tx = spawn_audio_thread(
            self.name,
            move || open_sink(&asset, looping, volume),
            Arc::clone(&self.playing),
            Arc::clone(&self.started),
        )?;

        *guard = Some(tx.clone());
        Ok(tx)
    }

    fn send(&self, cmd: AudioCommand) {
        let sent = self
            .ensure_thread()
            .and_then(|tx| tx.send(cmd).context("audio thread stopped"));
        if let Err(err) = sent {
            log_warn!("{} player command dropped: {err:#}", self.name);
        }
    }
}

/// Runs until every command sender is gone. A sound that ends on its own
/// clears `playing` and `started`, so the next play starts it over.
fn spawn_audio_thread<P, F>(
    name: &'static str,
    mut open: F,
    playing: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
) -> Result<Sender<AudioCommand>>
where
    P: Playback + 'static,
    F: FnMut() -> Result<P> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<AudioCommand>();

    thread::Builder::new()
        .name(format!("audio-{name}"))
        .spawn(move || {
            let mut output: Option<P> = None;
            let mut start = |output: &mut Option<P>| {
                if let Some(old) = output.take() {
                    old.stop();
                }
                match open() {
                    Ok(opened) => {
                        log_info!("{name} player started");
                        *output = Some(opened);
                        playing.store(true, Ordering::SeqCst);
                    }
                    Err(err) => {
                        log_error!("{name} player failed to start: {err:#}");
                        playing.store(false, Ordering::SeqCst);
                    }
                }
            };

            loop {
                match rx.recv_timeout(FINISH_POLL) {
                    Ok(AudioCommand::Start) => start(&mut output),
                    Ok(AudioCommand::Pause) => {
                        if let Some(current) = output.as_ref() {
                            current.pause();
                        }
                    }
                    // Resume after the sound ran out plays it again.
                    Ok(AudioCommand::Resume) => match output.as_ref() {
                        Some(current) => current.resume(),
                        None => start(&mut output),
                    },
                    Ok(AudioCommand::Stop) => {
                        if let Some(current) = output.take() {
                            current.stop();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if output.as_ref().is_some_and(|current| current.is_finished()) {
                            output = None;
                            started.store(false, Ordering::SeqCst);
                            playing.store(false, Ordering::SeqCst);
                            log_info!("{name} player finished");
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("Failed to spawn audio thread")?;

    Ok(tx)
}

fn open_sink(asset: &SoundAsset, looping: bool, volume: f32) -> Result<RodioOutput> {
    let (stream, handle) =
        OutputStream::try_default().context("Failed to create audio output stream")?;
    let sink = Sink::try_new(&handle).context("Failed to create audio sink")?;
    sink.set_volume(volume);

    match asset {
        SoundAsset::BrownNoise => sink.append(BrownNoise::new()),
        SoundAsset::Rain => sink.append(Rain::new()),
        SoundAsset::Chime if looping => sink.append(AlarmChime::new().repeat_infinite()),
        SoundAsset::Chime => sink.append(AlarmChime::new()),
        SoundAsset::File(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open sound file {}", path.display()))?;
            let decoder = Decoder::new(BufReader::new(file))
                .with_context(|| format!("Failed to decode sound file {}", path.display()))?;
            if looping {
                sink.append(decoder.repeat_infinite());
            } else {
                sink.append(decoder);
            }
        }
    }

    log_info!("opened output for {asset:?}");
    Ok(RodioOutput {
        _stream: stream,
        sink,
    })
}

impl AudioPlayer for RodioPlayer {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn play(&self) {
        let cmd = if self.started.swap(true, Ordering::SeqCst) {
            AudioCommand::Resume
        } else {
            AudioCommand::Start
        };
        self.playing.store(true, Ordering::SeqCst);
        self.send(cmd);
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if self.started.load(Ordering::SeqCst) {
            self.send(AudioCommand::Pause);
        }
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if self.started.swap(false, Ordering::SeqCst) {
            self.send(AudioCommand::Stop);
        }
    }
}

impl Drop for RodioPlayer {
    fn drop(&mut self) {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(AudioCommand::Stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn asset_names_resolve() {
        assert_eq!(SoundAsset::from_name("rain"), SoundAsset::Rain);
        assert_eq!(SoundAsset::from_name(" brown_noise "), SoundAsset::BrownNoise);
        assert_eq!(SoundAsset::from_name("chime"), SoundAsset::Chime);
        assert_eq!(
            SoundAsset::from_name("/usr/share/sounds/alarm.ogg"),
            SoundAsset::File(PathBuf::from("/usr/share/sounds/alarm.ogg"))
        );
    }

    #[test]
    fn idle_player_never_spawns_audio_thread() {
        let player = RodioPlayer::new("test", SoundAsset::Rain, true, 1.0);
        player.pause();
        player.stop();

        assert!(!player.is_playing());
        assert!(player.tx.lock().unwrap().is_none());
    }

    struct FakeOutput {
        finished: Arc<AtomicBool>,
    }

    impl Playback for FakeOutput {
        fn pause(&self) {}
        fn resume(&self) {}
        fn stop(&self) {}
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
    }

    fn wait_for(flag: &AtomicBool, expected: bool) -> bool {
        for _ in 0..50 {
            if flag.load(Ordering::SeqCst) == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn finished_sound_stops_reporting_playing() {
        let finished = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let playing = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(true));

        let tx = spawn_audio_thread(
            "test",
            {
                let finished = Arc::clone(&finished);
                let opens = Arc::clone(&opens);
                move || {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeOutput {
                        finished: Arc::clone(&finished),
                    })
                }
            },
            Arc::clone(&playing),
            Arc::clone(&started),
        )
        .unwrap();

        tx.send(AudioCommand::Start).unwrap();
        assert!(wait_for(&playing, true));

        finished.store(true, Ordering::SeqCst);
        assert!(wait_for(&playing, false));
        assert!(!started.load(Ordering::SeqCst));

        // A later resume starts the sound over.
        finished.store(false, Ordering::SeqCst);
        tx.send(AudioCommand::Resume).unwrap();
        assert!(wait_for(&playing, true));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}
