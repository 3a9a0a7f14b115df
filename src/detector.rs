//! Detector adapter.
//!
//! A [`Detector`] turns one RGB frame into either a list of labelled
//! detections or a map of precomputed counts. [`CategorySet`] folds either
//! shape into the per-category counts stored in the timeline.
//!
//! [`HttpDetector`] talks to a hosted detection endpoint. [`DetectorSlot`]
//! owns the process-wide detector and remembers a failed initialisation so
//! every later request reports the same error.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::CrowdscanError;
use crate::timeline::{CategoryCounts, RESERVED_KEYS, TOTAL_KEY};

/// A single labelled detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Class label as reported by the model.
    pub label: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
}

impl Detection {
    /// Create a detection.
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// What a detector returns for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutput {
    /// Individual detections to be filtered and tallied.
    Detections(Vec<Detection>),
    /// Counts keyed by label, already aggregated by the model.
    Counts(IndexMap<String, u64>),
}

/// An object-detection model.
///
/// Implementations must be shareable across threads; a single detector
/// serves every analysis in the process.
pub trait Detector: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Run detection on one frame.
    fn infer(&self, frame: &RgbImage) -> Result<DetectorOutput, CrowdscanError>;
}

/// A named category and the labels that count towards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    name: String,
    labels: Vec<String>,
}

impl Category {
    /// Create a category. The category name itself is always the first
    /// accepted label.
    pub fn new<I, S>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let mut accepted = vec![name.to_lowercase()];
        for label in labels {
            let label = label.into().to_lowercase();
            if !accepted.contains(&label) {
                accepted.push(label);
            }
        }
        Self {
            name,
            labels: accepted,
        }
    }

    /// Category name, used as the column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accepted labels in priority order (lowercase).
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// `folded` must already be lowercased with [`str::to_lowercase`].
    fn matches(&self, folded: &str) -> bool {
        self.labels.iter().any(|accepted| accepted == folded)
    }
}

fn is_reserved_name(name: &str) -> bool {
    RESERVED_KEYS.iter().any(|key| key.eq_ignore_ascii_case(name))
}

/// Ordered categories tracked by an analysis.
///
/// The default set is `men` (labels `men`, `man`) and `women` (labels
/// `women`, `woman`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySet {
    categories: Vec<Category>,
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::new(vec![
            Category::new("men", ["men", "man"]),
            Category::new("women", ["women", "woman"]),
        ])
    }
}

impl CategorySet {
    /// Create a set from categories in column order.
    ///
    /// Categories whose name repeats an earlier one, or names a record
    /// field (`timestamp`, `total`, `frame_index`, `total_frames`), are
    /// dropped.
    pub fn new(categories: Vec<Category>) -> Self {
        let mut unique: Vec<Category> = Vec::with_capacity(categories.len());
        for category in categories {
            if is_reserved_name(&category.name) {
                log::warn!("Ignoring category with reserved name {:?}", category.name);
                continue;
            }
            if unique.iter().any(|existing| existing.name == category.name) {
                log::warn!("Ignoring duplicate category {:?}", category.name);
                continue;
            }
            unique.push(category);
        }
        Self { categories: unique }
    }

    /// Parse a `name=label,label` specification, as accepted on the
    /// command line. A bare `name` accepts only itself.
    pub fn parse_category(spec: &str) -> Result<Category, String> {
        let (name, labels) = match spec.split_once('=') {
            Some((name, labels)) => (name.trim(), labels),
            None => (spec.trim(), ""),
        };
        if name.is_empty() {
            return Err(format!("category name missing in {spec:?}"));
        }
        if is_reserved_name(name) {
            return Err(format!("{name:?} is reserved"));
        }
        let labels = labels
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty());
        Ok(Category::new(name, labels))
    }

    /// The categories in column order.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Category names in column order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(Category::name)
    }

    /// Fold a detector output into per-category counts.
    pub fn derive(&self, output: &DetectorOutput, confidence_threshold: f32) -> CategoryCounts {
        match output {
            DetectorOutput::Detections(detections) => {
                self.tally(detections, confidence_threshold)
            }
            DetectorOutput::Counts(counts) => self.pick(counts),
        }
    }

    fn tally(&self, detections: &[Detection], confidence_threshold: f32) -> CategoryCounts {
        let mut counts: IndexMap<String, u64> =
            self.names().map(|name| (name.to_string(), 0)).collect();

        for detection in detections {
            if detection.confidence < confidence_threshold {
                continue;
            }
            let label = detection.label.trim().to_lowercase();
            if let Some(category) = self.categories.iter().find(|c| c.matches(&label)) {
                if let Some(count) = counts.get_mut(&category.name) {
                    *count += 1;
                }
            }
        }

        CategoryCounts::summed(counts)
    }

    fn pick(&self, raw: &IndexMap<String, u64>) -> CategoryCounts {
        let folded: Vec<(String, u64)> = raw
            .iter()
            .map(|(name, &value)| (name.to_lowercase(), value))
            .collect();
        let lookup = |key: &str| {
            folded
                .iter()
                .find(|(name, _)| name == key)
                .map(|&(_, value)| value)
        };

        let counts: IndexMap<String, u64> = self
            .categories
            .iter()
            .map(|category| {
                let value = category
                    .labels
                    .iter()
                    .find_map(|label| lookup(label))
                    .unwrap_or(0);
                (category.name.clone(), value)
            })
            .collect();

        match lookup(TOTAL_KEY) {
            Some(total) => CategoryCounts::new(counts, total),
            None => CategoryCounts::summed(counts),
        }
    }
}

/// Credentials and endpoint for a hosted detector.
///
/// Immutable once built and passed by reference on each call, so one
/// process can serve requests against different accounts.
#[derive(Clone, PartialEq, Eq)]
pub struct DetectorCredentials {
    api_key: String,
    endpoint: String,
    model_id: String,
}

impl std::fmt::Debug for DetectorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorCredentials")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Default hosted detection endpoint.
pub const DEFAULT_DETECTOR_ENDPOINT: &str = "https://detect.roboflow.com";

/// Default detection model.
pub const DEFAULT_DETECTOR_MODEL: &str = "people-detection-o4rdr/1";

impl DetectorCredentials {
    /// Build credentials, validating that every part is present.
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<Self, CrowdscanError> {
        let api_key = api_key.into();
        let endpoint = endpoint.into();
        let model_id = model_id.into();

        if api_key.trim().is_empty() {
            return Err(CrowdscanError::DetectorInit("API key is missing".to_string()));
        }
        if model_id.trim().is_empty() {
            return Err(CrowdscanError::DetectorInit("model id is missing".to_string()));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(CrowdscanError::DetectorInit(format!(
                "endpoint {endpoint:?} is not an http(s) URL"
            )));
        }

        Ok(Self {
            api_key: api_key.trim().to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model_id: model_id.trim().trim_matches('/').to_string(),
        })
    }

    /// Read `ROBOFLOW_API_KEY`, `ROBOFLOW_MODEL_ID`, and `ROBOFLOW_API_URL`.
    pub fn from_env() -> Result<Self, CrowdscanError> {
        let api_key = std::env::var("ROBOFLOW_API_KEY").map_err(|_| {
            CrowdscanError::DetectorInit("ROBOFLOW_API_KEY is not set".to_string())
        })?;
        let model_id = std::env::var("ROBOFLOW_MODEL_ID")
            .unwrap_or_else(|_| DEFAULT_DETECTOR_MODEL.to_string());
        let endpoint = std::env::var("ROBOFLOW_API_URL")
            .unwrap_or_else(|_| DEFAULT_DETECTOR_ENDPOINT.to_string());
        Self::new(api_key, endpoint, model_id)
    }

    /// Endpoint base URL without a trailing slash.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Model identifier, e.g. `people-detection-o4rdr/1`.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn inference_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.model_id)
    }
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    class: String,
    confidence: f32,
}

/// Detector backed by a hosted HTTP inference endpoint.
///
/// Each frame is JPEG-encoded, base64-encoded, and posted as the request
/// body to `{endpoint}/{model_id}`. The response's `predictions` become
/// [`DetectorOutput::Detections`].
pub struct HttpDetector {
    agent: ureq::Agent,
    credentials: DetectorCredentials,
    confidence_threshold: f32,
    jpeg_quality: u8,
}

impl std::fmt::Debug for HttpDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDetector")
            .field("credentials", &self.credentials)
            .field("confidence_threshold", &self.confidence_threshold)
            .finish_non_exhaustive()
    }
}

impl HttpDetector {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a detector for the given credentials.
    ///
    /// `confidence_threshold` is forwarded to the endpoint so it can skip
    /// low-confidence predictions server-side.
    pub fn new(credentials: DetectorCredentials, confidence_threshold: f32) -> Self {
        Self::with_timeout(credentials, confidence_threshold, Self::DEFAULT_TIMEOUT)
    }

    /// Create a detector with a custom request timeout.
    pub fn with_timeout(
        credentials: DetectorCredentials,
        confidence_threshold: f32,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            credentials,
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
            jpeg_quality: 85,
        }
    }

    fn encode_frame(&self, frame: &RgbImage) -> Result<String, CrowdscanError> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(frame)?;
        Ok(STANDARD.encode(&jpeg))
    }
}

impl Detector for HttpDetector {
    fn name(&self) -> &str {
        self.credentials.model_id()
    }

    fn infer(&self, frame: &RgbImage) -> Result<DetectorOutput, CrowdscanError> {
        let body = self.encode_frame(frame)?;
        let confidence = ((self.confidence_threshold * 100.0).round() as u32).to_string();

        let response = self
            .agent
            .post(&self.credentials.inference_url())
            .query("api_key", &self.credentials.api_key)
            .query("confidence", &confidence)
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_string(&body)
            .map_err(|error| match error {
                ureq::Error::Status(code, _) => {
                    CrowdscanError::Inference(format!("detector returned HTTP {code}"))
                }
                ureq::Error::Transport(transport) => {
                    CrowdscanError::Inference(transport.to_string())
                }
            })?;

        let text = response
            .into_string()
            .map_err(|error| CrowdscanError::Inference(error.to_string()))?;
        let parsed: PredictionResponse = serde_json::from_str(&text)
            .map_err(|error| CrowdscanError::Inference(format!("bad response: {error}")))?;

        Ok(DetectorOutput::Detections(
            parsed
                .predictions
                .into_iter()
                .map(|prediction| Detection::new(prediction.class, prediction.confidence))
                .collect(),
        ))
    }
}

/// Process-wide detector state.
///
/// Initialise once at startup with [`initialize`](DetectorSlot::initialize).
/// A failed initialisation is kept and returned from every
/// [`get`](DetectorSlot::get) until the slot is initialised again; it is
/// never retried automatically.
#[derive(Default)]
pub struct DetectorSlot {
    state: RwLock<SlotState>,
}

#[derive(Default)]
enum SlotState {
    #[default]
    Empty,
    Ready(Arc<dyn Detector>),
    Failed(String),
}

impl DetectorSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `factory` and store its detector or its failure.
    ///
    /// Returns the factory's error, if any, after recording it.
    pub fn initialize<F>(&self, factory: F) -> Result<(), CrowdscanError>
    where
        F: FnOnce() -> Result<Arc<dyn Detector>, CrowdscanError>,
    {
        let (next, result) = match factory() {
            Ok(detector) => {
                log::info!("Detector {} initialized", detector.name());
                (SlotState::Ready(detector), Ok(()))
            }
            Err(error) => {
                let message = match &error {
                    CrowdscanError::DetectorInit(message) => message.clone(),
                    other => other.to_string(),
                };
                log::error!("Detector initialization failed: {message}");
                (
                    SlotState::Failed(message.clone()),
                    Err(CrowdscanError::DetectorInit(message)),
                )
            }
        };
        *self.write() = next;
        result
    }

    /// The initialised detector, or the recorded initialisation failure.
    pub fn get(&self) -> Result<Arc<dyn Detector>, CrowdscanError> {
        match &*self.read() {
            SlotState::Ready(detector) => Ok(Arc::clone(detector)),
            SlotState::Failed(message) => Err(CrowdscanError::DetectorInit(message.clone())),
            SlotState::Empty => Err(CrowdscanError::DetectorInit(
                "detector has not been initialized".to_string(),
            )),
        }
    }

    /// Returns `true` if a detector is ready.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.read(), SlotState::Ready(_))
    }

    /// Release the detector. Analyses holding a clone keep it alive until
    /// they finish.
    pub fn teardown(&self) {
        *self.write() = SlotState::Empty;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
