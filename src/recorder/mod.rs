mod wav;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};
use tokio::sync::oneshot;

use crate::ports::AudioRecorder;

pub use wav::WavWriter;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// `recordedAudio_dd-MM-yyyy_HH-mm-ss.wav`
pub fn recording_file_name(at: NaiveDateTime) -> String {
    format!("recordedAudio_{}.wav", at.format("%d-%m-%Y_%H-%M-%S"))
}

/// Name for a file started at `at` that does not clobber an existing one.
fn unused_recording_path(dir: &Path, at: NaiveDateTime) -> PathBuf {
    let path = dir.join(recording_file_name(at));
    if !path.exists() {
        return path;
    }
    let stem = format!("recordedAudio_{}", at.format("%d-%m-%Y_%H-%M-%S"));
    (2u32..)
        .map(|n| dir.join(format!("{stem}_{n}.wav")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

enum RecorderMsg {
    Record(oneshot::Sender<Result<()>>),
    Pause,
    Stop,
    Samples(Vec<i16>),
}

/// What the capture thread needs from an input stream.
trait CaptureStream {
    fn start(&self) -> Result<()>;
    fn halt(&self) -> Result<()>;
}

impl CaptureStream for cpal::Stream {
    fn start(&self) -> Result<()> {
        self.play().context("Failed to start input stream")
    }

    fn halt(&self) -> Result<()> {
        self.pause().context("Failed to pause input stream")
    }
}

/// Mono recording split across as many WAV files as the size limit needs.
struct RecordingFiles {
    dir: PathBuf,
    sample_rate: u32,
    limit: u32,
    path: PathBuf,
    writer: WavWriter,
}

impl RecordingFiles {
    fn open(dir: PathBuf, sample_rate: u32, limit: u32) -> Result<Self> {
        let path = unused_recording_path(&dir, Local::now().naive_local());
        let limit = limit.max(2);
        let writer = WavWriter::create_with_limit(&path, 1, sample_rate, limit)?;
        Ok(Self {
            dir,
            sample_rate,
            limit,
            path,
            writer,
        })
    }

    fn write(&mut self, mut samples: &[i16]) -> Result<()> {
        loop {
            let written = self.writer.write_samples(samples)?;
            samples = &samples[written..];
            if samples.is_empty() {
                return Ok(());
            }
            self.roll_over()?;
        }
    }

    fn roll_over(&mut self) -> Result<()> {
        let path = unused_recording_path(&self.dir, Local::now().naive_local());
        let writer = WavWriter::create_with_limit(&path, 1, self.sample_rate, self.limit)?;
        let full = std::mem::replace(&mut self.writer, writer);
        full.finalize()?;
        log_info!(
            "Recording {} is full; continuing in {}",
            self.path.display(),
            path.display()
        );
        self.path = path;
        Ok(())
    }

    fn finish(self) -> Result<PathBuf> {
        self.writer.finalize()?;
        Ok(self.path)
    }
}

struct Capture {
    tx: Sender<RecorderMsg>,
    path: PathBuf,
    thread: JoinHandle<()>,
}

/// Records the default input device, downmixed to mono, into WAV files.
///
/// `prepare` opens the device and the file on a dedicated thread (cpal
/// streams are not `Send`); `record` and `pause` start and halt the stream;
/// `stop` asks the thread to finalize the file and release the device.
/// [`shutdown`](Self::shutdown) waits until every stopped capture has
/// finished writing.
pub struct CpalRecorder {
    recordings_dir: PathBuf,
    capture: Mutex<Option<Capture>>,
    stopped: Mutex<Vec<JoinHandle<()>>>,
    recording: Arc<AtomicBool>,
}

impl CpalRecorder {
    pub fn new(recordings_dir: PathBuf) -> Self {
        Self {
            recordings_dir,
            capture: Mutex::new(None),
            stopped: Mutex::new(Vec::new()),
            recording: Arc::new(AtomicBool::new(false)),
        }
    }

    /// File the capture in progress started in, if any.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.capture
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|capture| capture.path.clone()))
    }

    /// Stop any capture and block until all capture threads have finalized
    /// their files.
    pub fn shutdown(&self) {
        self.stop();
        let threads = self
            .stopped
            .lock()
            .map(|mut stopped| std::mem::take(&mut *stopped))
            .unwrap_or_default();
        for thread in threads {
            if thread.join().is_err() {
                log_error!("Recorder thread panicked");
            }
        }
    }

    fn sender(&self) -> Option<Sender<RecorderMsg>> {
        self.capture
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|capture| capture.tx.clone()))
    }

    /// Send `Stop` and keep the thread around for [`shutdown`](Self::shutdown).
    fn retire(&self, capture: Capture) {
        let _ = capture.tx.send(RecorderMsg::Stop);
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.retain(|thread| !thread.is_finished());
            stopped.push(capture.thread);
        }
    }

    async fn prepare_with<S, F>(&self, open: F, limit: u32) -> Result<()>
    where
        S: CaptureStream + 'static,
        F: FnOnce(Sender<RecorderMsg>) -> Result<(S, u32)> + Send + 'static,
    {
        std::fs::create_dir_all(&self.recordings_dir).with_context(|| {
            format!(
                "Failed to create recordings directory {}",
                self.recordings_dir.display()
            )
        })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, thread) = spawn_capture_thread(
            self.recordings_dir.clone(),
            limit,
            open,
            Arc::clone(&self.recording),
            ready_tx,
        )?;
        let path = ready_rx
            .await
            .map_err(|_| anyhow!("recorder thread exited during setup"))??;

        log_info!("Recorder prepared: {}", path.display());
        let stale = self
            .capture
            .lock()
            .map_err(|_| anyhow!("recorder lock poisoned"))?
            .replace(Capture { tx, path, thread });
        if let Some(stale) = stale {
            self.retire(stale);
        }
        Ok(())
    }
}

#[async_trait]
impl AudioRecorder for CpalRecorder {
    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    async fn prepare(&self) -> Result<()> {
        self.prepare_with(open_input, wav::MAX_DATA_LEN).await
    }

    async fn record(&self) -> Result<()> {
        if self.sender().is_none() {
            self.prepare().await?;
        }
        let tx = self
            .sender()
            .ok_or_else(|| anyhow!("recorder is not prepared"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RecorderMsg::Record(reply_tx))
            .map_err(|_| anyhow!("recorder thread stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("recorder thread stopped"))?
    }

    fn pause(&self) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(RecorderMsg::Pause);
        }
        self.recording.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        let capture = self.capture.lock().ok().and_then(|mut guard| guard.take());
        if let Some(capture) = capture {
            log_info!("Stopping recording {}", capture.path.display());
            self.retire(capture);
        }
        self.recording.store(false, Ordering::SeqCst);
    }

    async fn request_permission(&self) -> bool {
        let available = tokio::task::spawn_blocking(|| {
            cpal::default_host().default_input_device().is_some()
        })
        .await
        .unwrap_or(false);

        if !available {
            log_warn!("No audio input device available; recording is not permitted");
        }
        available
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_capture_thread<S, F>(
    dir: PathBuf,
    limit: u32,
    open: F,
    recording: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<PathBuf>>,
) -> Result<(Sender<RecorderMsg>, JoinHandle<()>)>
where
    S: CaptureStream + 'static,
    F: FnOnce(Sender<RecorderMsg>) -> Result<(S, u32)> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<RecorderMsg>();
    let samples_tx = tx.clone();

    let thread = thread::Builder::new()
        .name("sleepalarm-recorder".into())
        .spawn(move || {
            let opened = open(samples_tx).and_then(|(stream, sample_rate)| {
                Ok((stream, RecordingFiles::open(dir, sample_rate, limit)?))
            });
            let (stream, mut files) = match opened {
                Ok((stream, files)) => {
                    let _ = ready.send(Ok(files.path.clone()));
                    (stream, files)
                }
                Err(err) => {
                    let _ = ready.send(Err(err));
                    return;
                }
            };

            while let Ok(msg) = rx.recv() {
                match msg {
                    RecorderMsg::Samples(samples) => {
                        if let Err(err) = files.write(&samples) {
                            log_error!("Failed to write recording: {err:#}");
                        }
                    }
                    RecorderMsg::Record(reply) => {
                        let result = stream.start();
                        recording.store(result.is_ok(), Ordering::SeqCst);
                        let _ = reply.send(result);
                    }
                    RecorderMsg::Pause => {
                        if let Err(err) = stream.halt() {
                            log_warn!("{err:#}");
                        }
                        recording.store(false, Ordering::SeqCst);
                    }
                    RecorderMsg::Stop => break,
                }
            }

            drop(stream);
            recording.store(false, Ordering::SeqCst);
            // Samples queued before the stream went away still belong to the file.
            while let Ok(msg) = rx.try_recv() {
                if let RecorderMsg::Samples(samples) = msg {
                    let _ = files.write(&samples);
                }
            }
            match files.finish() {
                Ok(path) => log_info!("Recording saved to {}", path.display()),
                Err(err) => log_error!("Failed to finalize recording: {err:#}"),
            }
        })
        .context("Failed to spawn recorder thread")?;

    Ok((tx, thread))
}

/// Open the default input device, paused. Returns the stream and its
/// sample rate.
fn open_input(samples_tx: Sender<RecorderMsg>) -> Result<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| anyhow!("no audio input device available"))?;
    let supported = device
        .default_input_config()
        .context("Failed to query input configuration")?;
    let config = supported.config();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, samples_tx)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, samples_tx)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, samples_tx)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, samples_tx)?,
        other => bail!("unsupported input sample format {other:?}"),
    };
    // Some hosts start capturing as soon as the stream exists.
    let _ = stream.pause();

    Ok((stream, config.sample_rate.0))
}

/// Average interleaved frames down to one channel.
fn downmix(samples: Vec<i16>, channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&sample| i32::from(sample)).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples_tx: Sender<RecorderMsg>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let err_fn = |err| {
        log_error!("input stream error: {err}");
    };
    let channels = usize::from(config.channels);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples = data.iter().map(|sample| sample.to_sample::<i16>()).collect();
                let _ = samples_tx.send(RecorderMsg::Samples(downmix(samples, channels)));
            },
            err_fn,
            None,
        )
        .context("Failed to build input stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_name_uses_day_first_timestamp() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(23, 5, 9)
            .unwrap();
        assert_eq!(recording_file_name(at), "recordedAudio_07-03-2024_23-05-09.wav");
    }

    #[test]
    fn idle_recorder_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CpalRecorder::new(dir.path().to_path_buf());
        recorder.pause();
        recorder.stop();

        assert!(!recorder.is_recording());
        assert!(recorder.current_file().is_none());
    }

    struct SilentStream;

    impl CaptureStream for SilentStream {
        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn halt(&self) -> Result<()> {
            Ok(())
        }
    }

    fn data_len_of(path: &Path) -> u32 {
        let bytes = std::fs::read(path).unwrap();
        u32::from_le_bytes(bytes[40..44].try_into().unwrap())
    }

    #[test]
    fn downmix_averages_each_frame() {
        assert_eq!(downmix(vec![100, 300, -10, 10, 7], 2), vec![200, 0, 7]);
        assert_eq!(downmix(vec![1, 2, 3], 1), vec![1, 2, 3]);
        assert_eq!(downmix(vec![i16::MAX, i16::MAX], 2), vec![i16::MAX]);
    }

    #[test]
    fn taken_file_names_get_a_counter() {
        let dir = tempfile::tempdir().unwrap();
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(23, 5, 9)
            .unwrap();
        let first = unused_recording_path(dir.path(), at);
        std::fs::write(&first, b"").unwrap();
        let second = unused_recording_path(dir.path(), at);
        assert_eq!(
            second.file_name().unwrap(),
            "recordedAudio_07-03-2024_23-05-09_2.wav"
        );
    }

    #[test]
    fn full_files_roll_over_into_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = RecordingFiles::open(dir.path().to_path_buf(), 8_000, 4).unwrap();
        let first = files.path.clone();
        files.write(&[1, 2, 3, 4, 5]).unwrap();
        let last = files.finish().unwrap();
        assert_ne!(first, last);

        let mut lens: Vec<u32> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| data_len_of(&entry.unwrap().path()))
            .collect();
        lens.sort_unstable();
        assert_eq!(lens, vec![2, 4, 4]);
        assert_eq!(data_len_of(&first), 4);
        assert_eq!(data_len_of(&last), 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_stopped_capture_to_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CpalRecorder::new(dir.path().to_path_buf());
        recorder
            .prepare_with(|_| Ok((SilentStream, 8_000)), wav::MAX_DATA_LEN)
            .await
            .unwrap();
        recorder.record().await.unwrap();
        assert!(recorder.is_recording());

        let path = recorder.current_file().unwrap();
        let tx = recorder.sender().unwrap();
        tx.send(RecorderMsg::Samples(vec![1, 2, 3])).unwrap();
        recorder.stop();
        recorder.shutdown();

        assert!(!recorder.is_recording());
        assert!(recorder.current_file().is_none());
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 6);
        assert_eq!(data_len_of(&path), 6);
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 1);
    }
}
