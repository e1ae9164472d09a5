use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PricingError;
use crate::task::{Task, TaskPlatform};

const DEFAULT_DURATION: &str = "5";
const DEFAULT_MULTI_IMAGE_MODEL: &str = "kling-v1-6";

/// Operation a task was submitted for. Drives duration rules and per-call pricing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TaskAction {
    #[default]
    Generate,
    TextGenerate,
    FirstTailGenerate,
    ReferenceGenerate,
    OmniVideo,
    MotionControl,
    MultiImage2Video,
    MultiElementsInit,
    MultiElementsAddSelection,
    MultiElementsDeleteSelection,
    MultiElementsClearSelection,
    MultiElementsPreview,
    MultiElementsCreate,
    MultiElementsQuery,
    VideoExtend,
    AdvancedLipSync,
    IdentifyFace,
    Tts,
    AvatarImage2Video,
    Other(String),
}

impl TaskAction {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "generate" => TaskAction::Generate,
            "textGenerate" => TaskAction::TextGenerate,
            "firstTailGenerate" => TaskAction::FirstTailGenerate,
            "referenceGenerate" => TaskAction::ReferenceGenerate,
            "omniVideo" => TaskAction::OmniVideo,
            "motionControl" => TaskAction::MotionControl,
            "multiImage2Video" => TaskAction::MultiImage2Video,
            "multiElementsInit" => TaskAction::MultiElementsInit,
            "multiElementsAddSelection" => TaskAction::MultiElementsAddSelection,
            "multiElementsDeleteSelection" => TaskAction::MultiElementsDeleteSelection,
            "multiElementsClearSelection" => TaskAction::MultiElementsClearSelection,
            "multiElementsPreview" => TaskAction::MultiElementsPreview,
            "multiElementsCreate" => TaskAction::MultiElementsCreate,
            "multiElementsQuery" => TaskAction::MultiElementsQuery,
            "videoExtend" => TaskAction::VideoExtend,
            "advancedLipSync" => TaskAction::AdvancedLipSync,
            "identifyFace" => TaskAction::IdentifyFace,
            "tts" => TaskAction::Tts,
            "avatarImage2Video" => TaskAction::AvatarImage2Video,
            other => TaskAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskAction::Generate => "generate",
            TaskAction::TextGenerate => "textGenerate",
            TaskAction::FirstTailGenerate => "firstTailGenerate",
            TaskAction::ReferenceGenerate => "referenceGenerate",
            TaskAction::OmniVideo => "omniVideo",
            TaskAction::MotionControl => "motionControl",
            TaskAction::MultiImage2Video => "multiImage2Video",
            TaskAction::MultiElementsInit => "multiElementsInit",
            TaskAction::MultiElementsAddSelection => "multiElementsAddSelection",
            TaskAction::MultiElementsDeleteSelection => "multiElementsDeleteSelection",
            TaskAction::MultiElementsClearSelection => "multiElementsClearSelection",
            TaskAction::MultiElementsPreview => "multiElementsPreview",
            TaskAction::MultiElementsCreate => "multiElementsCreate",
            TaskAction::MultiElementsQuery => "multiElementsQuery",
            TaskAction::VideoExtend => "videoExtend",
            TaskAction::AdvancedLipSync => "advancedLipSync",
            TaskAction::IdentifyFace => "identifyFace",
            TaskAction::Tts => "tts",
            TaskAction::AvatarImage2Video => "avatarImage2Video",
            TaskAction::Other(name) => name.as_str(),
        }
    }

    /// Preparatory editing steps that are never billed.
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            TaskAction::MultiElementsInit
                | TaskAction::MultiElementsAddSelection
                | TaskAction::MultiElementsDeleteSelection
                | TaskAction::MultiElementsClearSelection
                | TaskAction::MultiElementsPreview
        )
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model name used for ratio lookups. Auxiliary Kling actions are priced under
/// their own synthetic model names rather than the generation model.
pub fn billing_model_name(platform: &TaskPlatform, action: &TaskAction, model: &str) -> String {
    if *platform == TaskPlatform::Kling {
        let synthetic = match action {
            TaskAction::MultiElementsInit
            | TaskAction::MultiElementsAddSelection
            | TaskAction::MultiElementsDeleteSelection
            | TaskAction::MultiElementsClearSelection
            | TaskAction::MultiElementsPreview
            | TaskAction::MultiElementsCreate
            | TaskAction::MultiElementsQuery => Some("kling-multi-elements"),
            TaskAction::VideoExtend => Some("kling-video-extend"),
            TaskAction::AdvancedLipSync => Some("kling-lip-sync"),
            TaskAction::IdentifyFace => Some("kling-identify-face"),
            TaskAction::Tts => Some("kling-tts"),
            _ => None,
        };
        if let Some(name) = synthetic {
            return name.to_string();
        }
    }
    model.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Std,
    Pro,
    Master,
}

impl Mode {
    pub fn parse(raw: Option<&str>) -> Result<Self, PricingError> {
        match raw.map(str::trim).unwrap_or_default() {
            "" | "std" => Ok(Mode::Std),
            "pro" => Ok(Mode::Pro),
            "master" => Ok(Mode::Master),
            other => Err(PricingError::UnknownMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Std => "std",
            Mode::Pro => "pro",
            Mode::Master => "master",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoInput {
    pub refer_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInput {
    pub kind: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioSpan {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// The parts of a submission that affect feature pricing, decoded from the
/// task's stored request properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRequest {
    pub action: TaskAction,
    pub model: String,
    pub mode: Option<String>,
    pub duration: String,
    pub sound: bool,
    pub prompt: String,
    pub voice_count: usize,
    pub character_orientation: Option<String>,
    pub video_inputs: Vec<VideoInput>,
    pub image_inputs: Vec<ImageInput>,
    pub audio_spans: Vec<AudioSpan>,
}

impl FeatureRequest {
    pub fn from_task(task: &Task) -> Self {
        Self::from_properties(
            TaskAction::parse(&task.action),
            task.origin_model(),
            &task.properties,
        )
    }

    /// Fields under `metadata` take precedence over top-level ones.
    pub fn from_properties(action: TaskAction, model: &str, properties: &Value) -> Self {
        let model = if model.is_empty() {
            property_text(properties, "model_name").unwrap_or_default()
        } else {
            model.to_string()
        };

        Self {
            action,
            model,
            mode: property_text(properties, "mode").filter(|mode| !mode.is_empty()),
            duration: property_text(properties, "duration")
                .filter(|duration| !duration.is_empty() && duration != "0")
                .unwrap_or_else(|| DEFAULT_DURATION.to_string()),
            sound: property_text(properties, "sound").as_deref() == Some("on"),
            prompt: property_text(properties, "prompt").unwrap_or_default(),
            voice_count: property_list(properties, "voice_list").len(),
            character_orientation: property_text(properties, "character_orientation"),
            video_inputs: property_list(properties, "video_list")
                .iter()
                .map(|item| VideoInput {
                    refer_type: item_text(item, "refer_type"),
                })
                .collect(),
            image_inputs: property_list(properties, "image_list")
                .iter()
                .map(|item| ImageInput {
                    kind: item_text(item, "type"),
                })
                .collect(),
            audio_spans: property_list(properties, "face_choose")
                .iter()
                .map(|item| AudioSpan {
                    start_ms: item
                        .get("sound_start_time")
                        .and_then(Value::as_i64)
                        .unwrap_or_default(),
                    end_ms: item
                        .get("sound_end_time")
                        .and_then(Value::as_i64)
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Voice control counts only when the prompt references one of the supplied voices.
    pub fn uses_voice_control(&self) -> bool {
        (1..=self.voice_count).any(|i| self.prompt.contains(&format!("<<<voice_{i}>>>")))
    }

    fn mode(&self) -> Result<Mode, PricingError> {
        Mode::parse(self.mode.as_deref())
    }
}

fn property<'a>(properties: &'a Value, key: &str) -> Option<&'a Value> {
    properties
        .get("metadata")
        .and_then(|metadata| metadata.get(key))
        .filter(|value| !value.is_null())
        .or_else(|| properties.get(key).filter(|value| !value.is_null()))
}

fn property_text(properties: &Value, key: &str) -> Option<String> {
    property(properties, key).and_then(|value| match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn property_list<'a>(properties: &'a Value, key: &str) -> &'a [Value] {
    property(properties, key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn item_text(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// key: feature-scales -> per-model mode and add-on multipliers for video providers.
///
/// Scales are relative to a model's std-mode price. A model/mode combination with
/// no entry is an error, except video extension which has a documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureScaleTable {
    pub std_models: BTreeSet<String>,
    pub pro_scales: BTreeMap<String, f64>,
    pub master_scales: BTreeMap<String, f64>,
    pub video_input_scales: BTreeMap<String, f64>,
    pub sound_scales: BTreeMap<String, f64>,
    pub voice_control_scales: BTreeMap<String, f64>,
    pub motion_control_pro_scale: f64,
    pub multi_elements_pro_scale: f64,
    pub video_extend_default_model: String,
    pub video_extend_std_scales: BTreeMap<String, f64>,
    pub video_extend_pro_scales: BTreeMap<String, f64>,
    pub official_price_ratio: f64,
    pub identify_face_price: f64,
    pub tts_price: f64,
    pub avatar_std_price: f64,
    pub avatar_pro_price: f64,
    pub lip_sync_unit_price: f64,
    pub lip_sync_unit_seconds: f64,
}

fn scale_map(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries
        .iter()
        .map(|(model, scale)| (model.to_string(), *scale))
        .collect()
}

impl Default for FeatureScaleTable {
    fn default() -> Self {
        Self {
            std_models: [
                "kling-video-o1",
                "kling-v2-6",
                "kling-v2-5-turbo",
                "kling-v2-1",
                "kling-v1-6",
                "kling-v1-5",
                "kling-v1",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            pro_scales: scale_map(&[
                ("kling-video-o1", 4.0 / 3.0),
                ("kling-v2-6", 1.0),
                ("kling-v2-5-turbo", 5.0 / 3.0),
                ("kling-v2-1", 1.75),
                ("kling-v1-6", 1.75),
                ("kling-v1-5", 1.75),
                ("kling-v1", 3.5),
            ]),
            master_scales: scale_map(&[("kling-v2-1-master", 1.0), ("kling-v2-master", 1.0)]),
            video_input_scales: scale_map(&[("kling-video-o1", 1.5)]),
            sound_scales: scale_map(&[("kling-v2-6", 2.0)]),
            voice_control_scales: scale_map(&[("kling-v2-6", 1.2)]),
            motion_control_pro_scale: 1.6,
            multi_elements_pro_scale: 5.0 / 3.0,
            video_extend_default_model: DEFAULT_MULTI_IMAGE_MODEL.to_string(),
            video_extend_std_scales: scale_map(&[
                ("kling-v1", 1.0),
                ("kling-v1-5", 2.0),
                ("kling-v1-6", 2.0),
            ]),
            video_extend_pro_scales: scale_map(&[
                ("kling-v1", 3.5),
                ("kling-v1-5", 1.75),
                ("kling-v1-6", 1.75),
            ]),
            official_price_ratio: 0.14,
            identify_face_price: 0.05,
            tts_price: 0.05,
            avatar_std_price: 1.0,
            avatar_pro_price: 2.0,
            lip_sync_unit_price: 0.5,
            lip_sync_unit_seconds: 5.0,
        }
    }
}

impl FeatureScaleTable {
    pub fn mode_scale(&self, mode: Mode, model: &str) -> Result<f64, PricingError> {
        let unsupported = || PricingError::UnsupportedMode {
            model: model.to_string(),
            mode: mode.as_str().to_string(),
        };
        match mode {
            Mode::Std if self.std_models.contains(model) => Ok(1.0),
            // Master-only models are submitted without a mode.
            Mode::Std => self.master_scales.get(model).copied().ok_or_else(unsupported),
            Mode::Pro => self.pro_scales.get(model).copied().ok_or_else(unsupported),
            Mode::Master => self.master_scales.get(model).copied().ok_or_else(unsupported),
        }
    }

    /// Product of the optional add-on surcharges: video input, sound, voice control.
    pub fn advance_scale(&self, request: &FeatureRequest) -> f64 {
        let model = request.model.as_str();
        let mut scale = 1.0;

        if request.action == TaskAction::OmniVideo && !request.video_inputs.is_empty() {
            if let Some(video) = self.video_input_scales.get(model) {
                scale *= video;
            }
        }

        if request.sound {
            if let Some(sound) = self.sound_scales.get(model) {
                scale *= sound;
                if request.uses_voice_control() {
                    if let Some(voice) = self.voice_control_scales.get(model) {
                        scale *= voice;
                    }
                }
            }
        }

        scale
    }

    /// Per-unit multiplier applied on top of the model ratio at settlement.
    pub fn unit_price_scale(&self, request: &FeatureRequest) -> Result<f64, PricingError> {
        let mode = request.mode()?;
        let base = match request.action {
            TaskAction::MotionControl => match mode {
                Mode::Pro => self.motion_control_pro_scale,
                _ => 1.0,
            },
            TaskAction::MultiElementsCreate => match mode {
                Mode::Pro => self.multi_elements_pro_scale,
                _ => 1.0,
            },
            TaskAction::VideoExtend => self.video_extend_scale(mode, &request.model),
            TaskAction::AdvancedLipSync | TaskAction::AvatarImage2Video => 1.0,
            TaskAction::MultiImage2Video => {
                let model = if request.model.is_empty() {
                    DEFAULT_MULTI_IMAGE_MODEL
                } else {
                    request.model.as_str()
                };
                self.mode_scale(mode, model)?
            }
            _ => self.mode_scale(mode, &request.model)?,
        };
        Ok(base * self.advance_scale(request))
    }

    /// Total multiplier against the model's fixed price, used for pre-deduction:
    /// per-call actions return a price ratio, everything else unit scale times
    /// estimated duration.
    pub fn price_scale(&self, request: &FeatureRequest) -> Result<f64, PricingError> {
        let action = &request.action;
        if action.is_free() {
            return Ok(0.0);
        }
        match action {
            TaskAction::IdentifyFace => return Ok(self.identify_face_price / self.official_price_ratio),
            TaskAction::Tts => return Ok(self.tts_price / self.official_price_ratio),
            TaskAction::AvatarImage2Video => {
                let price = match request.mode()? {
                    Mode::Pro => self.avatar_pro_price,
                    _ => self.avatar_std_price,
                };
                return Ok(price / self.official_price_ratio);
            }
            _ => {}
        }

        let unit = self.unit_price_scale(request)?;
        let duration = match action {
            TaskAction::MotionControl => {
                if request.character_orientation.as_deref() == Some("video") {
                    30.0
                } else {
                    10.0
                }
            }
            TaskAction::MultiImage2Video | TaskAction::MultiElementsCreate => {
                if request.duration == "10" {
                    10.0
                } else {
                    5.0
                }
            }
            TaskAction::VideoExtend => 1.0,
            TaskAction::AdvancedLipSync => self.lip_sync_units(request),
            TaskAction::OmniVideo => omni_video_duration(request)? as f64,
            _ => legacy_duration(&request.duration)? as f64,
        };
        Ok(duration * unit)
    }

    fn video_extend_scale(&self, mode: Mode, model: &str) -> f64 {
        let model = if model.is_empty() {
            self.video_extend_default_model.as_str()
        } else {
            model
        };
        let lookup = |table: &BTreeMap<String, f64>| {
            table
                .get(model)
                .or_else(|| table.get(&self.video_extend_default_model))
                .copied()
                .unwrap_or(1.0)
        };
        let std = lookup(&self.video_extend_std_scales);
        match mode {
            Mode::Pro => std * lookup(&self.video_extend_pro_scales),
            _ => std,
        }
    }

    /// Lip sync is billed per started unit of audio, with a one-unit minimum.
    fn lip_sync_units(&self, request: &FeatureRequest) -> f64 {
        if request.audio_spans.is_empty() {
            return self.lip_sync_unit_price;
        }
        let total_ms: i64 = request
            .audio_spans
            .iter()
            .map(|span| (span.end_ms - span.start_ms).max(0))
            .sum();
        let seconds = (total_ms as f64 / 1000.0).max(self.lip_sync_unit_seconds);
        (seconds / self.lip_sync_unit_seconds).ceil() * self.lip_sync_unit_price
    }
}

fn integer_duration(raw: &str) -> Result<i64, PricingError> {
    raw.parse::<i64>()
        .ok()
        .filter(|value| value.to_string() == raw)
        .ok_or_else(|| PricingError::InvalidDuration(raw.to_string()))
}

fn five_or_ten(raw: &str) -> Result<i64, PricingError> {
    match raw {
        "5" | "10" => integer_duration(raw),
        other => Err(PricingError::InvalidDuration(format!(
            "only 5 or 10 seconds supported, got {other}"
        ))),
    }
}

fn three_to_ten(raw: &str) -> Result<i64, PricingError> {
    let value = integer_duration(raw)?;
    if !(3..=10).contains(&value) {
        return Err(PricingError::InvalidDuration(format!(
            "duration must be between 3 and 10 seconds, got {value}"
        )));
    }
    Ok(value)
}

fn legacy_duration(raw: &str) -> Result<i64, PricingError> {
    if raw.is_empty() {
        return Ok(5);
    }
    five_or_ten(raw)
}

fn omni_video_duration(request: &FeatureRequest) -> Result<i64, PricingError> {
    let has_video = !request.video_inputs.is_empty();
    let has_image = !request.image_inputs.is_empty();

    if request.video_inputs.iter().any(|video| video.refer_type == "base") {
        return Err(PricingError::InvalidDuration(
            "video editing (refer_type=base) has no billable duration".to_string(),
        ));
    }

    match (has_video, has_image) {
        (false, false) => five_or_ten(&request.duration),
        (false, true) => {
            let framed = request
                .image_inputs
                .iter()
                .any(|image| image.kind == "first_frame" || image.kind == "end_frame");
            if framed {
                three_to_ten(&request.duration)
            } else {
                five_or_ten(&request.duration)
            }
        }
        _ => three_to_ten(&request.duration),
    }
}
