//! Subtext analysis of a candidate thread through the reasoning model.
//!
//! `Analyzer::analyze` is total: model failures and unparseable output both
//! produce a degraded `AnalysisRecord` instead of an error, so the delivery
//! handler can always acknowledge deterministically.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::llm::ReasoningModel;
use crate::model::{AnalysisRecord, Candidate};

pub const MAX_REPLY_EXCERPTS: usize = 10;
pub const RAW_RESPONSE_LIMIT: usize = 500;

pub const FALLBACK_CONFIDENCE: f64 = 0.1;
pub const FALLBACK_SUBTEXT_SCORE: u8 = 1;
pub const MODEL_FAILURE_REPLY: &str = "🧠 This thread has a few layers worth a closer look...";
pub const PARSE_FAILURE_REPLY: &str = "🧠 There is more going on in this thread than it first seems...";

const REQUIRED_FIELDS: [&str; 5] = [
    "surface_message",
    "hidden_meaning",
    "confidence",
    "subtext_score",
    "viral_reply",
];

const ANALYSIS_PROMPT: &str = r#"You are a sharp reader of social media threads, with a focus on founders, startups, and tech personalities. Your job is to read between the lines.

Analyze the thread below for psychological subtext and the emotional undertones that are not obvious on first read. Consider:

1. Surface vs reality: what the author appears to say vs what they actually communicate.
2. Power dynamics: attempts to establish authority, status, or credibility.
3. Emotional pressure: FOMO, urgency, guilt, or social proof used as leverage.
4. Stress indicators: burnout, uncertainty, or trouble presented as confidence.
5. Business subtext: what the thread reveals about the company, product, or situation.

Watch for relentlessly positive language covering problems, humble brags, defensive answers to criticism, buzzwords used to dodge specifics, and manufactured deadlines.

Respond with a single JSON object and nothing else (no markdown):

{
  "surface_message": "what the author appears to be saying",
  "hidden_meaning": "what is being communicated underneath",
  "power_dynamics": "how authority or credibility is being claimed",
  "emotional_tactics": "pressure or emotional hooks in use",
  "stress_indicators": "signs of hidden problems or strain",
  "confidence": 0.85,
  "subtext_score": 8,
  "viral_reply": "a witty reply of at most 200 characters that surfaces the subtext"
}

The viral_reply must add something to the conversation and be worth sharing."#;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?\s*|\s*```").expect("valid code fence regex"));

pub struct Analyzer {
    model: Arc<dyn ReasoningModel>,
}

impl Analyzer {
    pub fn new(model: Arc<dyn ReasoningModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    #[instrument(skip_all, fields(candidate_id = %candidate.id))]
    pub async fn analyze(&self, candidate: &Candidate, replies: &[String]) -> AnalysisRecord {
        let prompt = build_prompt(candidate, replies);
        match self.model.generate(&prompt).await {
            Ok(raw) => parse_analysis(&raw),
            Err(err) => {
                warn!(?err, "model call failed; using fallback analysis");
                model_failure_record(&err.to_string())
            }
        }
    }
}

pub fn build_prompt(candidate: &Candidate, replies: &[String]) -> String {
    format!(
        "{}\n\nThread to analyze:\n---\n{}",
        ANALYSIS_PROMPT,
        thread_text(candidate, replies)
    )
}

/// Serialized view of the thread handed to the model.
pub fn thread_text(candidate: &Candidate, replies: &[String]) -> String {
    let m = &candidate.metrics;
    let mut text = format!("ORIGINAL POST: {}\n\n", candidate.text);
    let _ = write!(
        text,
        "ENGAGEMENT: {} likes, {} replies, {} shares\n\n",
        m.like_count, m.reply_count, m.share_count
    );
    let excerpts: Vec<&String> = replies
        .iter()
        .filter(|r| !r.trim().is_empty())
        .take(MAX_REPLY_EXCERPTS)
        .collect();
    if !excerpts.is_empty() {
        text.push_str("TOP REPLIES:\n");
        for (i, reply) in excerpts.iter().enumerate() {
            let _ = writeln!(text, "{}. {}", i + 1, reply.trim());
        }
    }
    text
}

/// Strip code fences and keep the outermost `{ ... }` span.
pub fn extract_json(raw: &str) -> String {
    let cleaned = CODE_FENCE.replace_all(raw, "");
    let cleaned = cleaned.trim();
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => cleaned[start..=end].to_string(),
        _ => cleaned.to_string(),
    }
}

#[derive(Deserialize, Default)]
struct RawAnalysis {
    #[serde(default)]
    surface_message: Value,
    #[serde(default)]
    hidden_meaning: Value,
    #[serde(default)]
    power_dynamics: Value,
    #[serde(default)]
    emotional_tactics: Value,
    #[serde(default)]
    stress_indicators: Value,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    subtext_score: Value,
    #[serde(default)]
    viral_reply: Value,
}

/// Parse model output into a normalized record; never fails.
pub fn parse_analysis(raw: &str) -> AnalysisRecord {
    let json = extract_json(raw);
    let parsed = serde_json::from_str::<Value>(&json)
        .map_err(|e| e.to_string())
        .and_then(|v| {
            if v.is_object() {
                serde_json::from_value::<RawAnalysis>(v).map_err(|e| e.to_string())
            } else {
                Err("expected a JSON object".to_string())
            }
        });
    let parsed = match parsed {
        Ok(p) => p,
        Err(err) => {
            warn!(%err, raw_len = raw.len(), "could not parse model response");
            return parse_failure_record(&err, raw);
        }
    };

    let missing = missing_fields(&parsed);
    if !missing.is_empty() {
        warn!(?missing, "model response is missing required fields");
    }

    let record = AnalysisRecord {
        surface_message: as_text(&parsed.surface_message),
        hidden_meaning: as_text(&parsed.hidden_meaning),
        power_dynamics: as_text(&parsed.power_dynamics),
        emotional_tactics: as_text(&parsed.emotional_tactics),
        stress_indicators: as_text(&parsed.stress_indicators),
        confidence: as_number(&parsed.confidence)
            .map(normalize_confidence)
            .unwrap_or(FALLBACK_CONFIDENCE),
        subtext_score: as_number(&parsed.subtext_score)
            .map(normalize_subtext_score)
            .unwrap_or(FALLBACK_SUBTEXT_SCORE),
        viral_reply: as_text(&parsed.viral_reply),
        error: None,
        parse_error: None,
        raw_response: None,
    };
    info!(
        confidence = record.confidence,
        subtext_score = record.subtext_score,
        "parsed analysis"
    );
    record
}

/// Values above 1 are read as percentages.
pub fn normalize_confidence(value: f64) -> f64 {
    let v = if value > 1.0 { value / 100.0 } else { value };
    v.clamp(0.0, 1.0)
}

pub fn normalize_subtext_score(value: f64) -> u8 {
    value.round().clamp(1.0, 10.0) as u8
}

fn missing_fields(parsed: &RawAnalysis) -> Vec<&'static str> {
    let values = [
        &parsed.surface_message,
        &parsed.hidden_meaning,
        &parsed.confidence,
        &parsed.subtext_score,
        &parsed.viral_reply,
    ];
    REQUIRED_FIELDS
        .iter()
        .zip(values)
        .filter(|(_, v)| match v {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        })
        .map(|(name, _)| *name)
        .collect()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

fn model_failure_record(error: &str) -> AnalysisRecord {
    AnalysisRecord {
        surface_message: "Unable to analyze due to a model error".into(),
        hidden_meaning: "Analysis failed".into(),
        power_dynamics: "Could not determine".into(),
        emotional_tactics: "Could not analyze".into(),
        stress_indicators: "Could not detect".into(),
        confidence: FALLBACK_CONFIDENCE,
        subtext_score: FALLBACK_SUBTEXT_SCORE,
        viral_reply: MODEL_FAILURE_REPLY.into(),
        error: Some(error.to_string()),
        parse_error: None,
        raw_response: None,
    }
}

fn parse_failure_record(error: &str, raw: &str) -> AnalysisRecord {
    AnalysisRecord {
        surface_message: "Could not parse analysis".into(),
        hidden_meaning: "Analysis parsing failed".into(),
        power_dynamics: "Unknown".into(),
        emotional_tactics: "Unknown".into(),
        stress_indicators: "Unknown".into(),
        confidence: FALLBACK_CONFIDENCE,
        subtext_score: FALLBACK_SUBTEXT_SCORE,
        viral_reply: PARSE_FAILURE_REPLY.into(),
        error: None,
        parse_error: Some(error.to_string()),
        raw_response: Some(truncate_chars(raw, RAW_RESPONSE_LIMIT)),
    }
}
