use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Easy,
    #[default]
    Mid,
    Hard,
}

impl DifficultyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Mid => "mid",
            Self::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "easy" => Self::Easy,
            "hard" => Self::Hard,
            _ => Self::Mid,
        }
    }

    /// Numeric encoding used by the bandit context.
    pub fn level(&self) -> f64 {
        match self {
            Self::Easy => 0.3,
            Self::Mid => 0.6,
            Self::Hard => 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveProfile {
    pub mem: f64,
    pub speed: f64,
    pub stability: f64,
}

impl Default for CognitiveProfile {
    fn default() -> Self {
        Self {
            mem: 0.5,
            speed: 0.5,
            stability: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    #[serde(rename = "A")]
    pub attention: f64,
    #[serde(rename = "F")]
    pub fatigue: f64,
    #[serde(rename = "C")]
    pub cognitive: CognitiveProfile,
    #[serde(rename = "M")]
    pub motivation: f64,
    pub conf: f64,
    pub ts: i64,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            attention: 0.7,
            fatigue: 0.0,
            cognitive: CognitiveProfile::default(),
            motivation: 0.5,
            conf: 0.3,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl UserState {
    pub fn is_finite(&self) -> bool {
        [
            self.attention,
            self.fatigue,
            self.motivation,
            self.conf,
            self.cognitive.mem,
            self.cognitive.speed,
            self.cognitive.stability,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub interval_scale: f64,
    pub new_ratio: f64,
    pub difficulty: DifficultyLevel,
    pub batch_size: i32,
    pub hint_level: i32,
}

impl Default for Action {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            new_ratio: 0.2,
            difficulty: DifficultyLevel::Mid,
            batch_size: 8,
            hint_level: 1,
        }
    }
}

pub const ACTION_FEATURE_DIM: usize = 5;

impl Action {
    pub fn features(&self) -> [f64; ACTION_FEATURE_DIM] {
        [
            self.difficulty.level(),
            self.new_ratio,
            self.batch_size as f64 / 20.0,
            self.interval_scale,
            self.hint_level as f64 / 2.0,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub values: Vec<f64>,
    pub labels: Vec<String>,
    pub ts: i64,
}

impl FeatureVector {
    pub fn new(values: Vec<f64>, labels: Vec<String>, ts: i64) -> Self {
        Self { values, labels, ts }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|idx| self.values.get(idx).copied())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub word_id: Option<String>,
    pub is_correct: bool,
    pub response_time: i64,
    pub dwell_time: Option<i64>,
    pub retry_count: i32,
    pub pause_count: i32,
    pub switch_count: i32,
    pub focus_loss_duration: Option<i64>,
    #[serde(default)]
    pub hint_used: bool,
    #[serde(default)]
    pub is_quit: bool,
    pub timestamp: i64,
}

impl Default for RawEvent {
    fn default() -> Self {
        Self {
            word_id: None,
            is_correct: true,
            response_time: 3000,
            dwell_time: None,
            retry_count: 0,
            pause_count: 0,
            switch_count: 0,
            focus_loss_duration: None,
            hint_used: false,
            is_quit: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub value: f64,
    pub reason: String,
    pub ts: i64,
}

impl Reward {
    pub fn new(value: f64, reason: impl Into<String>, ts: i64) -> Self {
        Self {
            value,
            reason: reason.into(),
            ts,
        }
    }
}

/// Ridge-regression sufficient statistics of one user's bandit.
///
/// `a` and `l` are row-major `d × d`. `l` is a cache of the Cholesky factor of
/// `a` and is rebuilt whenever it is absent or has the wrong size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditModel {
    #[serde(rename = "A")]
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    #[serde(rename = "L", default)]
    pub l: Vec<f64>,
    pub lambda: f64,
    pub alpha: f64,
    pub d: usize,
    pub update_count: u64,
}

/// Legacy layout: nested rows, no factor, no ridge term.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditModelV1 {
    #[serde(rename = "A")]
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    pub d: usize,
    pub alpha: f64,
    #[serde(default)]
    pub update_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum PersistedBanditModel {
    #[serde(rename = "1")]
    V1(BanditModelV1),
    #[serde(rename = "2")]
    V2(BanditModel),
}

pub const LEGACY_BANDIT_LAMBDA: f64 = 1.0;

impl PersistedBanditModel {
    pub fn into_current(self) -> BanditModel {
        match self {
            Self::V1(legacy) => migrate_bandit_v1(legacy),
            Self::V2(model) => model,
        }
    }
}

impl From<BanditModel> for PersistedBanditModel {
    fn from(model: BanditModel) -> Self {
        Self::V2(model)
    }
}

fn migrate_bandit_v1(legacy: BanditModelV1) -> BanditModel {
    let d = legacy.d;
    let mut a = vec![0.0; d * d];
    for (i, row) in legacy.a.iter().take(d).enumerate() {
        for (j, value) in row.iter().take(d).enumerate() {
            a[i * d + j] = *value;
        }
    }
    let mut b = legacy.b;
    b.resize(d, 0.0);

    BanditModel {
        a,
        b,
        l: Vec::new(),
        lambda: LEGACY_BANDIT_LAMBDA,
        alpha: legacy.alpha,
        d,
        update_count: legacy.update_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Online,
    Offline,
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Perception,
    Modeling,
    Learning,
    Decision,
    Evaluation,
    Optimization,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Perception => "PERCEPTION",
            Self::Modeling => "MODELING",
            Self::Learning => "LEARNING",
            Self::Decision => "DECISION",
            Self::Evaluation => "EVALUATION",
            Self::Optimization => "OPTIMIZATION",
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            Self::Perception => 1,
            Self::Modeling => 2,
            Self::Learning => 3,
            Self::Decision => 4,
            Self::Evaluation => 5,
            Self::Optimization => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStageTrace {
    pub stage: PipelineStage,
    pub stage_name: String,
    pub status: StageStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub duration_ms: Option<f64>,
    pub input_summary: Option<serde_json::Value>,
    pub output_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl PipelineStageTrace {
    pub fn completed(
        stage: PipelineStage,
        stage_name: impl Into<String>,
        started_at: i64,
        duration_ms: f64,
    ) -> Self {
        Self {
            stage,
            stage_name: stage_name.into(),
            status: StageStatus::Success,
            started_at,
            ended_at: Some(started_at + duration_ms.round() as i64),
            duration_ms: Some(duration_ms),
            input_summary: None,
            output_summary: None,
            error_message: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output_summary = Some(output);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = StageStatus::Failed;
        self.error_message = Some(message.into());
        self
    }
}

pub const DECISION_TRACE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionTrace {
    pub decision_id: String,
    pub user_id: Option<String>,
    pub timestamp: i64,
    pub decision_source: DecisionSource,
    pub state_snapshot: serde_json::Value,
    pub weights_snapshot: Option<serde_json::Value>,
    pub selected_action: Action,
    pub confidence: f64,
    pub reward: Option<f64>,
    #[serde(default)]
    pub feature_vector: Option<Vec<f64>>,
    #[serde(default)]
    pub pipeline_stages: Vec<PipelineStageTrace>,
    pub trace_version: u32,
    #[serde(default)]
    pub is_simulation: bool,
}

impl DecisionTrace {
    pub fn new(decision_id: impl Into<String>, selected_action: Action, timestamp: i64) -> Self {
        Self {
            decision_id: decision_id.into(),
            user_id: None,
            timestamp,
            decision_source: DecisionSource::Online,
            state_snapshot: serde_json::Value::Null,
            weights_snapshot: None,
            selected_action,
            confidence: 0.0,
            reward: None,
            feature_vector: None,
            pipeline_stages: Vec::new(),
            trace_version: DECISION_TRACE_VERSION,
            is_simulation: false,
        }
    }
}
