#![allow(dead_code)]

use semvault_core::{LanguageModel, ModelError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BAG_OF_WORDS_DIMS: usize = 256;

/// Deterministic model double.
///
/// - `generate` answers with the first rule whose needle occurs in the
///   prompt; a `None` answer means the backend is unavailable.
/// - `embed` returns the explicit vector registered for the first needle
///   contained in the text, else a hashed bag-of-words vector.
pub struct ScriptedModel {
    model_id: Mutex<&'static str>,
    vectors: Mutex<Vec<(String, Vec<f64>)>>,
    rules: Mutex<Vec<(String, Option<String>)>>,
    default_answer: Mutex<Option<String>>,
    down: AtomicBool,
    pub generate_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(model_id: &'static str) -> Self {
        Self {
            model_id: Mutex::new(model_id),
            vectors: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            default_answer: Mutex::new(Some("A group of related notes.".to_string())),
            down: AtomicBool::new(false),
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_vector(self, needle: &str, vector: &[f64]) -> Self {
        self.vectors
            .lock()
            .unwrap()
            .push((needle.to_string(), vector.to_vec()));
        self
    }

    pub fn with_rule(self, needle: &str, answer: &str) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((needle.to_string(), Some(answer.to_string())));
        self
    }

    pub fn with_failing_rule(self, needle: &str) -> Self {
        self.rules.lock().unwrap().push((needle.to_string(), None));
        self
    }

    pub fn set_model_id(&self, model_id: &'static str) {
        *self.model_id.lock().unwrap() = model_id;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        *self.model_id.lock().unwrap()
    }

    fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ModelError::Unavailable("scripted outage".to_string()));
        }
        let rules = self.rules.lock().unwrap();
        let answer = rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| self.default_answer.lock().unwrap().clone());
        answer.ok_or_else(|| ModelError::Unavailable("scripted failure".to_string()))
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ModelError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ModelError::Unavailable("scripted outage".to_string()));
        }
        let vectors = self.vectors.lock().unwrap();
        Ok(texts
            .iter()
            .map(|text| {
                vectors
                    .iter()
                    .find(|(needle, _)| text.contains(needle.as_str()))
                    .map(|(_, vector)| vector.clone())
                    .unwrap_or_else(|| bag_of_words(text))
            })
            .collect())
    }
}

/// Hashed word counts; identical texts map to identical vectors.
pub fn bag_of_words(text: &str) -> Vec<f64> {
    let mut vector = vec![0.0; BAG_OF_WORDS_DIMS];
    let mut counts: HashMap<usize, f64> = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        *counts.entry(fnv1a(&word.to_lowercase()) % BAG_OF_WORDS_DIMS).or_default() += 1.0;
    }
    for (index, count) in counts {
        vector[index] = count;
    }
    vector
}

fn fnv1a(text: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as usize
}

/// Polls `condition` until it holds or `timeout` runs out.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
