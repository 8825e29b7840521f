//! Scripted engine used by the bridge's tests.
//!
//! Every fed frame adds a word (`w1`, `w2`, ...) to the open utterance and reports the
//! utterance so far as a partial. An utterance is finalized every `finalize_every`
//! frames, or by `stop`.

use crate::config::RecognitionConfig;
use crate::transcription::engine::{EngineFactory, PartialCallback, RecognitionEngine};
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Finalize after this many frames (never, when `None`)
    pub finalize_every: Option<usize>,
    /// `next_final` returns an error instead of the first final
    pub fail_inference: bool,
    /// `next_final` ignores shutdown and blocks this long once audio has arrived
    pub hang: Option<Duration>,
    /// Wrapped around every partial and final (Whisper output usually starts with a space)
    pub padding: String,
}

#[derive(Default)]
struct ScriptState {
    frames: usize,
    words: Vec<String>,
    finals: VecDeque<String>,
    fed: Vec<Vec<u8>>,
    stopped: bool,
    shutdown_calls: usize,
}

pub struct ScriptedEngine {
    script: Script,
    on_partial: PartialCallback,
    state: Mutex<ScriptState>,
    changed: Condvar,
}

impl ScriptedEngine {
    pub fn new(script: Script, on_partial: PartialCallback) -> Self {
        Self {
            script,
            on_partial,
            state: Mutex::new(ScriptState::default()),
            changed: Condvar::new(),
        }
    }

    /// Every PCM buffer accepted by `feed`, in order.
    pub fn fed(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().fed.clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.state.lock().unwrap().shutdown_calls
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    fn padded(&self, words: &[String]) -> String {
        let pad = &self.script.padding;
        format!("{}{}{}", pad, words.join(" "), pad)
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn feed(&self, pcm: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.shutdown_calls > 0 {
            return Ok(());
        }
        state.fed.push(pcm.to_vec());
        state.frames += 1;
        let word = format!("w{}", state.frames);
        state.words.push(word);
        (self.on_partial)(&self.padded(&state.words));

        if self.script.finalize_every == Some(state.words.len()) {
            let text = self.padded(&state.words);
            state.words.clear();
            state.finals.push_back(text);
            self.changed.notify_all();
        }
        Ok(())
    }

    fn next_final(&self) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(hang) = self.script.hang {
                if state.frames > 0 {
                    drop(state);
                    std::thread::sleep(hang);
                    return Ok(None);
                }
            }
            if state.shutdown_calls > 0 {
                return Ok(None);
            }
            if let Some(text) = state.finals.pop_front() {
                if self.script.fail_inference {
                    return Err(anyhow!("scripted inference failure"));
                }
                return Ok(Some(text));
            }
            if state.stopped {
                return Ok(None);
            }
            state = self
                .changed
                .wait_timeout(state, Duration::from_millis(20))
                .unwrap()
                .0;
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.words.is_empty() || !self.script.padding.is_empty() {
            let text = self.padded(&state.words);
            state.words.clear();
            state.finals.push_back(text);
        }
        state.stopped = true;
        self.changed.notify_all();
    }

    fn shutdown(&self) {
        self.state.lock().unwrap().shutdown_calls += 1;
        self.changed.notify_all();
    }
}

/// Factory handing out [`ScriptedEngine`]s and remembering them for inspection.
#[derive(Default)]
pub struct ScriptedFactory {
    pub script: Script,
    pub fail_create: bool,
    engines: Mutex<Vec<Arc<ScriptedEngine>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn engines(&self) -> Vec<Arc<ScriptedEngine>> {
        self.engines.lock().unwrap().clone()
    }
}

impl EngineFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create(
        &self,
        _config: &RecognitionConfig,
        on_partial: PartialCallback,
    ) -> Result<Arc<dyn RecognitionEngine>> {
        if self.fail_create {
            return Err(anyhow!("model weights not found"));
        }
        let engine = Arc::new(ScriptedEngine::new(self.script.clone(), on_partial));
        self.engines.lock().unwrap().push(Arc::clone(&engine));
        Ok(engine)
    }
}
