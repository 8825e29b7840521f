//! # Utterance Recorder
//!
//! The bundled recognition engine: voice-activity segmentation around two Whisper passes.
//!
//! ## How it works:
//! 1. `feed` converts 16-bit PCM to floats and slices it into 32 ms VAD frames
//! 2. While listening, frames go into a pre-roll ring; enough consecutive voiced frames
//!    open an utterance that starts with the pre-roll
//! 3. An open utterance closes after enough trailing silence (once it is long enough),
//!    when it hits the maximum length, or when `stop` flushes it
//! 4. Closed utterances queue up for `next_final`, which runs the main model
//! 5. A realtime thread periodically transcribes the open utterance with the realtime
//!    model and reports it through the partial callback
//!
//! ## Ordering:
//! Utterances close, and partials are reported, while holding the recorder lock, and a
//! partial is only reported if its utterance is still the open one. No partial for an
//! utterance can therefore be produced after that utterance has been queued for its final.

use crate::audio::SAMPLE_RATE;
use crate::config::RecognitionConfig;
use crate::transcription::engine::{PartialCallback, RecognitionEngine};
use crate::transcription::vad::{VoiceDetector, FRAME_SAMPLES};
use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Speech-to-text over a complete buffer of 16 kHz mono samples.
pub trait Transcriber: Send {
    fn transcribe(&mut self, samples: &[f32]) -> Result<String>;
}

/// How often a blocked `next_final` re-checks for shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Minimum new audio between two realtime passes over the same utterance.
const MIN_PARTIAL_ADVANCE: usize = SAMPLE_RATE as usize / 10;

/// Segmentation limits, converted from seconds to samples.
#[derive(Debug, Clone)]
struct Limits {
    /// Consecutive voiced frames that open an utterance
    onset_frames: usize,
    pre_roll: usize,
    post_silence: usize,
    min_length: usize,
    max_length: usize,
}

impl Limits {
    fn from_config(config: &RecognitionConfig) -> Self {
        let samples = |secs: f32| (secs.max(0.0) * SAMPLE_RATE as f32).round() as usize;
        Self {
            onset_frames: config.webrtc_sensitivity.min(3) as usize + 1,
            pre_roll: samples(config.pre_recording_buffer_duration),
            post_silence: samples(config.post_speech_silence_duration),
            min_length: samples(config.min_length_of_recording),
            max_length: samples(config.max_length_of_recording).max(FRAME_SAMPLES),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listening,
    Recording,
}

struct RecorderState {
    vad: Box<dyn VoiceDetector>,
    limits: Limits,
    phase: Phase,
    /// Samples waiting to fill a whole VAD frame
    pending: Vec<f32>,
    pre_roll: VecDeque<f32>,
    voiced_run: usize,
    utterance: Vec<f32>,
    silence: usize,
    /// Incremented every time an utterance opens
    generation: u64,
    /// Utterance length at the last realtime pass
    partial_mark: usize,
    completed: VecDeque<Vec<f32>>,
    stopped: bool,
}

impl RecorderState {
    fn push_samples(&mut self, samples: &[f32]) -> Result<bool> {
        self.pending.extend_from_slice(samples);
        let mut closed = false;
        let whole = self.pending.len() / FRAME_SAMPLES * FRAME_SAMPLES;
        let frames: Vec<f32> = self.pending.drain(..whole).collect();
        for frame in frames.chunks(FRAME_SAMPLES) {
            closed |= self.push_frame(frame)?;
        }
        Ok(closed)
    }

    /// Returns true when the frame closed an utterance.
    fn push_frame(&mut self, frame: &[f32]) -> Result<bool> {
        let voiced = self.vad.is_voiced(frame)?;
        match self.phase {
            Phase::Listening => {
                self.pre_roll.extend(frame.iter().copied());
                let excess = self.pre_roll.len().saturating_sub(self.limits.pre_roll.max(frame.len()));
                self.pre_roll.drain(..excess);

                self.voiced_run = if voiced { self.voiced_run + 1 } else { 0 };
                if self.voiced_run >= self.limits.onset_frames {
                    self.open();
                }
                Ok(false)
            }
            Phase::Recording => {
                self.utterance.extend_from_slice(frame);
                self.silence = if voiced { 0 } else { self.silence + frame.len() };

                let ended_on_silence = self.silence >= self.limits.post_silence
                    && self.utterance.len() >= self.limits.min_length;
                if ended_on_silence || self.utterance.len() >= self.limits.max_length {
                    self.close();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn open(&mut self) {
        self.phase = Phase::Recording;
        self.generation += 1;
        self.utterance = self.pre_roll.drain(..).collect();
        self.voiced_run = 0;
        self.silence = 0;
        self.partial_mark = 0;
        debug!("Utterance {} opened", self.generation);
    }

    fn close(&mut self) {
        self.phase = Phase::Listening;
        self.silence = 0;
        let utterance = std::mem::take(&mut self.utterance);
        debug!(
            "Utterance {} closed ({:.2}s)",
            self.generation,
            utterance.len() as f64 / SAMPLE_RATE as f64
        );
        self.completed.push_back(utterance);
    }

    /// Close whatever is open, including samples short of a whole frame.
    fn flush(&mut self) {
        if self.phase == Phase::Recording {
            let rest = std::mem::take(&mut self.pending);
            self.utterance.extend(rest);
            self.close();
        }
        self.pending.clear();
        self.pre_roll.clear();
    }
}

struct Shared {
    state: Mutex<RecorderState>,
    changed: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Voice-activity driven recognition engine.
pub struct Recorder {
    shared: Arc<Shared>,
    main: Mutex<Box<dyn Transcriber>>,
    realtime: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Build a recorder and start its realtime thread (when a realtime transcriber is given).
    pub fn new(
        config: &RecognitionConfig,
        vad: Box<dyn VoiceDetector>,
        main: Box<dyn Transcriber>,
        realtime: Option<Box<dyn Transcriber>>,
        on_partial: PartialCallback,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(RecorderState {
                vad,
                limits: Limits::from_config(config),
                phase: Phase::Listening,
                pending: Vec::with_capacity(FRAME_SAMPLES),
                pre_roll: VecDeque::new(),
                voiced_run: 0,
                utterance: Vec::new(),
                silence: 0,
                generation: 0,
                partial_mark: 0,
                completed: VecDeque::new(),
                stopped: false,
            }),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let realtime = match realtime {
            Some(transcriber) if config.enable_realtime_transcription => {
                let pause = Duration::from_secs_f32(config.realtime_processing_pause.max(0.01));
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("realtime-stt".to_string())
                    .spawn(move || realtime_loop(shared, transcriber, on_partial, pause))
                    .map_err(|e| anyhow!("Failed to spawn realtime thread: {}", e))?;
                Some(handle)
            }
            _ => None,
        };

        Ok(Self {
            shared,
            main: Mutex::new(main),
            realtime: Mutex::new(realtime),
        })
    }
}

impl RecognitionEngine for Recorder {
    fn feed(&self, pcm: &[u8]) -> Result<()> {
        if pcm.len() % 2 != 0 {
            return Err(anyhow!("16-bit PCM of {} bytes has a partial sample", pcm.len()));
        }
        let mut ints = vec![0i16; pcm.len() / 2];
        LittleEndian::read_i16_into(pcm, &mut ints);
        let samples: Vec<f32> = ints.iter().map(|&s| s as f32 / 32768.0).collect();

        let mut state = self.shared.lock();
        if state.stopped || self.shared.shutdown.load(Ordering::SeqCst) {
            debug!("Dropping {} samples fed after stop", samples.len());
            return Ok(());
        }
        if state.push_samples(&samples)? {
            self.shared.changed.notify_all();
        }
        Ok(())
    }

    fn next_final(&self) -> Result<Option<String>> {
        let audio = {
            let mut state = self.shared.lock();
            loop {
                if self.shared.shutdown.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if let Some(audio) = state.completed.pop_front() {
                    break audio;
                }
                if state.stopped {
                    return Ok(None);
                }
                state = self
                    .shared
                    .changed
                    .wait_timeout(state, WAIT_SLICE)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0;
            }
        };

        let mut main = self.main.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let text = main.transcribe(&audio)?;
        Ok(Some(text.trim().to_string()))
    }

    fn stop(&self) {
        let mut state = self.shared.lock();
        if !state.stopped {
            state.flush();
            state.stopped = true;
            debug!("Recorder stopped with {} utterance(s) pending", state.completed.len());
        }
        self.shared.changed.notify_all();
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Cycle the lock so a waiter between its flag check and its wait cannot miss this.
        drop(self.shared.lock());
        self.shared.changed.notify_all();

        // A realtime pass may be mid-inference; the thread exits once it sees the flag.
        self.realtime.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn realtime_loop(
    shared: Arc<Shared>,
    mut transcriber: Box<dyn Transcriber>,
    on_partial: PartialCallback,
    pause: Duration,
) {
    loop {
        let (generation, snapshot) = {
            let state = shared.lock();
            let (mut state, _) = shared
                .changed
                .wait_timeout(state, pause)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if state.phase != Phase::Recording
                || state.utterance.len() < state.partial_mark + MIN_PARTIAL_ADVANCE
            {
                continue;
            }
            state.partial_mark = state.utterance.len();
            (state.generation, state.utterance.clone())
        };

        let text = match transcriber.transcribe(&snapshot) {
            Ok(text) => text,
            Err(e) => {
                warn!("Realtime transcription failed: {:#}", e);
                continue;
            }
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let state = shared.lock();
        if state.phase == Phase::Recording
            && state.generation == generation
            && !shared.shutdown.load(Ordering::SeqCst)
        {
            on_partial(text);
        }
    }
    debug!("Realtime thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::adapt;
    use crate::transcription::vad::EnergyVad;
    use std::sync::mpsc;

    /// Reports how many samples it was given.
    struct CountingTranscriber;

    impl Transcriber for CountingTranscriber {
        fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
            Ok(format!("{} samples", samples.len()))
        }
    }

    struct FailingTranscriber;

    impl Transcriber for FailingTranscriber {
        fn transcribe(&mut self, _samples: &[f32]) -> Result<String> {
            Err(anyhow!("model exploded"))
        }
    }

    /// Blocks inside `transcribe` until released.
    struct GatedTranscriber {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Transcriber for GatedTranscriber {
        fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(format!("{} samples", samples.len()))
        }
    }

    struct BrokenVad;

    impl VoiceDetector for BrokenVad {
        fn is_voiced(&mut self, _frame: &[f32]) -> Result<bool> {
            Err(anyhow!("vad offline"))
        }
    }

    fn partial_channel() -> (PartialCallback, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel::<String>();
        let tx = Mutex::new(tx);
        let on_partial: PartialCallback = Arc::new(move |text: &str| {
            let _ = tx.lock().unwrap().send(text.to_string());
        });
        (on_partial, rx)
    }

    fn config() -> RecognitionConfig {
        RecognitionConfig {
            pre_recording_buffer_duration: 0.0,
            post_speech_silence_duration: 0.09,
            min_length_of_recording: 0.0,
            max_length_of_recording: 30.0,
            webrtc_sensitivity: 0,
            enable_realtime_transcription: false,
            ..RecognitionConfig::default()
        }
    }

    fn speech(frames: usize) -> Vec<u8> {
        let samples: Vec<f32> = (0..frames * FRAME_SAMPLES)
            .map(|i| 0.4 * (i as f32 * 0.2).sin())
            .collect();
        adapt(&samples)
    }

    fn silence(frames: usize) -> Vec<u8> {
        adapt(&vec![0.0; frames * FRAME_SAMPLES])
    }

    fn energy(config: &RecognitionConfig) -> Box<dyn VoiceDetector> {
        Box::new(EnergyVad::new(config.energy_threshold))
    }

    fn recorder(config: &RecognitionConfig) -> Recorder {
        Recorder::new(
            config,
            energy(config),
            Box::new(CountingTranscriber),
            None,
            Arc::new(|_: &str| {}),
        )
        .unwrap()
    }

    #[test]
    fn test_silence_ends_utterance() {
        let rec = recorder(&config());
        rec.feed(&silence(5)).unwrap();
        rec.feed(&speech(4)).unwrap();
        rec.feed(&silence(3)).unwrap();

        let expected = format!("{} samples", 7 * FRAME_SAMPLES);
        assert_eq!(rec.next_final().unwrap(), Some(expected));
    }

    #[test]
    fn test_stop_flushes_open_utterance() {
        let rec = recorder(&config());
        rec.feed(&speech(2)).unwrap();
        // Half a frame is still pending when stop arrives.
        rec.feed(&adapt(&vec![0.4; FRAME_SAMPLES / 2])).unwrap();
        rec.stop();

        let expected = format!("{} samples", 2 * FRAME_SAMPLES + FRAME_SAMPLES / 2);
        assert_eq!(rec.next_final().unwrap(), Some(expected));
        assert_eq!(rec.next_final().unwrap(), None);
    }

    #[test]
    fn test_stop_without_speech_yields_nothing() {
        let rec = recorder(&config());
        rec.feed(&silence(10)).unwrap();
        rec.stop();
        assert_eq!(rec.next_final().unwrap(), None);

        // Audio after stop is ignored.
        rec.feed(&speech(10)).unwrap();
        assert_eq!(rec.next_final().unwrap(), None);
    }

    #[test]
    fn test_max_length_forces_final() {
        let config = RecognitionConfig {
            max_length_of_recording: 0.3,
            ..config()
        };
        let rec = recorder(&config);
        rec.feed(&speech(25)).unwrap();

        let max = (0.3 * SAMPLE_RATE as f32) as usize;
        let first = rec.next_final().unwrap().unwrap();
        let len: usize = first.split(' ').next().unwrap().parse().unwrap();
        assert!(len >= max && len < max + FRAME_SAMPLES);
    }

    #[test]
    fn test_pre_roll_is_kept() {
        let config = RecognitionConfig {
            pre_recording_buffer_duration: 0.064,
            ..config()
        };
        let rec = recorder(&config);
        rec.feed(&silence(5)).unwrap();
        rec.feed(&speech(1)).unwrap();
        rec.stop();

        // Two frames of pre-roll; the onset frame is one of them.
        let expected = format!("{} samples", 2 * FRAME_SAMPLES);
        assert_eq!(rec.next_final().unwrap(), Some(expected));
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let rec = Arc::new(recorder(&config()));
        let waiter = {
            let rec = Arc::clone(&rec);
            thread::spawn(move || rec.next_final())
        };
        thread::sleep(Duration::from_millis(50));
        rec.shutdown();
        assert_eq!(waiter.join().unwrap().unwrap(), None);
    }

    #[test]
    fn test_inference_failure_is_reported() {
        let rec = Recorder::new(
            &config(),
            energy(&config()),
            Box::new(FailingTranscriber),
            None,
            Arc::new(|_: &str| {}),
        )
        .unwrap();
        rec.feed(&speech(2)).unwrap();
        rec.stop();
        assert!(rec.next_final().is_err());
    }

    #[test]
    fn test_rejects_odd_byte_count() {
        let rec = recorder(&config());
        assert!(rec.feed(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_realtime_partials_precede_final() {
        let (on_partial, rx) = partial_channel();
        let config = RecognitionConfig {
            enable_realtime_transcription: true,
            realtime_processing_pause: 0.01,
            ..config()
        };
        let rec = Recorder::new(
            &config,
            energy(&config),
            Box::new(CountingTranscriber),
            Some(Box::new(CountingTranscriber)),
            on_partial,
        )
        .unwrap();

        rec.feed(&speech(10)).unwrap();
        let partial = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(partial.ends_with("samples"));

        rec.stop();
        assert!(rec.next_final().unwrap().is_some());
    }

    #[test]
    fn test_no_partial_after_utterance_closes() {
        let (on_partial, rx) = partial_channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let config = RecognitionConfig {
            enable_realtime_transcription: true,
            realtime_processing_pause: 0.01,
            ..config()
        };
        let rec = Recorder::new(
            &config,
            energy(&config),
            Box::new(CountingTranscriber),
            Some(Box::new(GatedTranscriber {
                entered: entered_tx,
                release: release_rx,
            })),
            on_partial,
        )
        .unwrap();

        rec.feed(&speech(10)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // The utterance closes while a realtime pass over it is still running.
        rec.stop();
        release_tx.send(()).unwrap();

        let expected = format!("{} samples", 10 * FRAME_SAMPLES);
        assert_eq!(rec.next_final().unwrap(), Some(expected));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_onset_needs_consecutive_voiced_frames() {
        let config = RecognitionConfig {
            webrtc_sensitivity: 3,
            ..config()
        };
        let rec = recorder(&config);
        rec.feed(&speech(3)).unwrap();
        rec.feed(&silence(1)).unwrap();
        rec.stop();
        assert_eq!(rec.next_final().unwrap(), None);
    }

    #[test]
    fn test_vad_failure_fails_feed() {
        let rec = Recorder::new(
            &config(),
            Box::new(BrokenVad),
            Box::new(CountingTranscriber),
            None,
            Arc::new(|_: &str| {}),
        )
        .unwrap();
        assert!(rec.feed(&speech(1)).is_err());
        // Less than a frame never reaches the detector.
        assert!(rec.feed(&adapt(&[0.1; 10])).is_ok());
    }
}
