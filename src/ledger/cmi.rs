//! CMI data-model normalisation.
//!
//! The runtime reports a flat tree of CMI keys. SCORM 1.2 and SCORM 2004 name
//! the same facts differently, so each version gets a mapper that knows its
//! key paths and duration format. The mapper is chosen once per attempt.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::models::ScormVersion;

/// Key paths for the facts the ledger derives from the raw tree.
#[derive(Debug)]
pub struct CmiPaths {
    pub score_raw: &'static str,
    pub score_min: &'static str,
    pub score_max: &'static str,
    pub score_scaled: Option<&'static str>,
    pub completion_status: &'static str,
    pub success_status: Option<&'static str>,
    pub session_time: &'static str,
    pub total_time: &'static str,
    pub location: &'static str,
    pub suspend_data: &'static str,
    pub entry: &'static str,
    pub exit: &'static str,
}

/// Facts derived from one raw tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedCmi {
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub session_time: Option<String>,
    pub session_time_seconds: i64,
    pub total_time: Option<String>,
    pub total_time_seconds: i64,
    pub location: Option<String>,
    pub suspend_data: Option<String>,
    pub entry: Option<String>,
    pub exit: Option<String>,
    pub interactions: Vec<Value>,
    pub objectives: Vec<Value>,
    pub learner_comments: Vec<Value>,
}

impl NormalizedCmi {
    /// completion ∈ {completed, passed} or success = passed
    pub fn is_complete(&self) -> bool {
        matches!(self.completion_status.as_deref(), Some("completed") | Some("passed"))
            || self.success_status.as_deref() == Some("passed")
    }
}

pub trait CmiMapper: Send + Sync {
    fn version(&self) -> ScormVersion;

    fn paths(&self) -> &'static CmiPaths;

    /// Parses the version's duration format into whole seconds; malformed input is 0.
    fn parse_duration(&self, v: &str) -> i64;

    /// Largest value the runtime may store under `key`.
    fn max_len(&self, key: &str) -> usize;

    fn learner_comments(&self, raw: &Map<String, Value>) -> Vec<Value>;

    /// Success status implied by the tree, for versions that carry it separately.
    fn success_status(&self, raw: &Map<String, Value>, completion: Option<&str>) -> Option<String> {
        let _ = completion;
        self.paths()
            .success_status
            .and_then(|p| str_at(raw, p))
            .and_then(|s| normalize_status(&s))
    }

    fn normalize(&self, raw: &Map<String, Value>) -> NormalizedCmi {
        let p = self.paths();
        let completion_status = str_at(raw, p.completion_status).and_then(|s| normalize_status(&s));
        let success_status = self.success_status(raw, completion_status.as_deref());

        let (score_raw, score_min, score_max, score_scaled) = derive_score(
            num_at(raw, p.score_raw),
            num_at(raw, p.score_min),
            num_at(raw, p.score_max),
            p.score_scaled.and_then(|k| num_at(raw, k)),
        );

        let session_time = str_at(raw, p.session_time);
        let total_time = str_at(raw, p.total_time);

        NormalizedCmi {
            score_raw,
            score_min,
            score_max,
            score_scaled,
            completion_status,
            success_status,
            session_time_seconds: session_time.as_deref().map(|t| self.parse_duration(t)).unwrap_or(0),
            session_time,
            total_time_seconds: total_time.as_deref().map(|t| self.parse_duration(t)).unwrap_or(0),
            total_time,
            location: str_at(raw, p.location),
            suspend_data: str_at(raw, p.suspend_data),
            entry: str_at(raw, p.entry),
            exit: str_at(raw, p.exit),
            interactions: extract_indexed(raw, "cmi.interactions"),
            objectives: extract_indexed(raw, "cmi.objectives"),
            learner_comments: self.learner_comments(raw),
        }
    }
}

pub struct Cmi12Mapper;
pub struct Cmi2004Mapper;

static PATHS_12: CmiPaths = CmiPaths {
    score_raw: "cmi.core.score.raw",
    score_min: "cmi.core.score.min",
    score_max: "cmi.core.score.max",
    score_scaled: None,
    completion_status: "cmi.core.lesson_status",
    success_status: None,
    session_time: "cmi.core.session_time",
    total_time: "cmi.core.total_time",
    location: "cmi.core.lesson_location",
    suspend_data: "cmi.suspend_data",
    entry: "cmi.core.entry",
    exit: "cmi.core.exit",
};

static PATHS_2004: CmiPaths = CmiPaths {
    score_raw: "cmi.score.raw",
    score_min: "cmi.score.min",
    score_max: "cmi.score.max",
    score_scaled: Some("cmi.score.scaled"),
    completion_status: "cmi.completion_status",
    success_status: Some("cmi.success_status"),
    session_time: "cmi.session_time",
    total_time: "cmi.total_time",
    location: "cmi.location",
    suspend_data: "cmi.suspend_data",
    entry: "cmi.entry",
    exit: "cmi.exit",
};

impl CmiMapper for Cmi12Mapper {
    fn version(&self) -> ScormVersion {
        ScormVersion::Scorm12
    }

    fn paths(&self) -> &'static CmiPaths {
        &PATHS_12
    }

    fn parse_duration(&self, v: &str) -> i64 {
        parse_duration_12(v)
    }

    fn max_len(&self, key: &str) -> usize {
        match key {
            "cmi.suspend_data" => 4096, // common de facto 1.2 limit
            "cmi.comments" => 4096,
            _ => 255,
        }
    }

    // 1.2 folds success into lesson_status.
    fn success_status(&self, _raw: &Map<String, Value>, completion: Option<&str>) -> Option<String> {
        match completion {
            Some("passed") => Some("passed".into()),
            Some("failed") => Some("failed".into()),
            _ => None,
        }
    }

    fn learner_comments(&self, raw: &Map<String, Value>) -> Vec<Value> {
        match str_at(raw, "cmi.comments") {
            Some(c) => vec![json!({ "comment": c })],
            None => Vec::new(),
        }
    }
}

impl CmiMapper for Cmi2004Mapper {
    fn version(&self) -> ScormVersion {
        ScormVersion::Scorm2004
    }

    fn paths(&self) -> &'static CmiPaths {
        &PATHS_2004
    }

    fn parse_duration(&self, v: &str) -> i64 {
        parse_duration_2004(v)
    }

    fn max_len(&self, key: &str) -> usize {
        match key {
            "cmi.suspend_data" => 64000,
            "cmi.location" => 1000,
            _ => 4000,
        }
    }

    fn learner_comments(&self, raw: &Map<String, Value>) -> Vec<Value> {
        extract_indexed(raw, "cmi.comments_from_learner")
    }
}

pub fn mapper_for(version: ScormVersion) -> &'static dyn CmiMapper {
    match version {
        ScormVersion::Scorm12 => &Cmi12Mapper,
        ScormVersion::Scorm2004 => &Cmi2004Mapper,
    }
}

/// Canonical lowercase status, folding vendor casing and aliases.
pub fn normalize_status(v: &str) -> Option<String> {
    let v = v.trim().to_ascii_lowercase().replace(['_', '-'], " ");
    let canonical = match v.as_str() {
        "" => return None,
        "complete" | "completed" => "completed",
        "incomplete" => "incomplete",
        "pass" | "passed" => "passed",
        "fail" | "failed" => "failed",
        "browsed" => "browsed",
        "not attempted" | "notattempted" => "not attempted",
        "unknown" => "unknown",
        other => return Some(other.to_string()),
    };
    Some(canonical.to_string())
}

/// Whether a raw key may be stored at all.
pub fn is_storable_key(key: &str) -> bool {
    key.starts_with("cmi.") || key.starts_with("adl.")
}

/// `HH:MM:SS[.ss]` (hours may exceed two digits). Malformed input is 0.
pub fn parse_duration_12(v: &str) -> i64 {
    let parts: Vec<&str> = v.trim().split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    let h = parts[0].parse::<i64>();
    let m = parts[1].parse::<i64>();
    let s = parts[2].parse::<f64>();
    match (h, m, s) {
        (Ok(h), Ok(m), Ok(s)) if h >= 0 && (0..60).contains(&m) && (0.0..60.0).contains(&s) => h
            .checked_mul(3600)
            .and_then(|secs| secs.checked_add(m * 60 + s.floor() as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// ISO-8601 duration, e.g. `PT1H2M3.5S` or `P1DT2H`. Malformed input is 0.
pub fn parse_duration_2004(v: &str) -> i64 {
    let v = v.trim();
    let Some(body) = v.strip_prefix('P') else {
        return 0;
    };
    if body.is_empty() {
        return 0;
    }

    let mut total = 0.0_f64;
    let mut num = String::new();
    let mut in_time = false;
    for c in body.chars() {
        match c {
            'T' => {
                if in_time || !num.is_empty() {
                    return 0;
                }
                in_time = true;
            }
            '0'..='9' | '.' => num.push(c),
            unit => {
                let Ok(n) = num.parse::<f64>() else {
                    return 0;
                };
                num.clear();
                let factor = match (in_time, unit) {
                    (false, 'Y') => 365.0 * 86400.0,
                    (false, 'M') => 30.0 * 86400.0,
                    (false, 'W') => 7.0 * 86400.0,
                    (false, 'D') => 86400.0,
                    (true, 'H') => 3600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return 0,
                };
                total += n * factor;
            }
        }
    }
    if !num.is_empty() {
        return 0;
    }
    // `as` saturates, so out-of-range totals are malformed rather than clamped.
    if !total.is_finite() || total >= i64::MAX as f64 {
        return 0;
    }
    total.floor() as i64
}

/// Formats whole seconds as a SCORM 2004 duration.
pub fn format_duration_2004(secs: i64) -> String {
    let secs = secs.max(0);
    format!("PT{}H{}M{}S", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Groups `prefix.N.rest` keys into an ordered list of `{rest: value}` objects.
pub fn extract_indexed(raw: &Map<String, Value>, prefix: &str) -> Vec<Value> {
    let lead = format!("{prefix}.");
    let mut grouped: BTreeMap<u32, Map<String, Value>> = BTreeMap::new();
    for (k, v) in raw {
        let Some(rest) = k.strip_prefix(&lead) else {
            continue;
        };
        let Some((idx, field)) = rest.split_once('.') else {
            continue; // e.g. cmi.interactions._count
        };
        let Ok(idx) = idx.parse::<u32>() else {
            continue;
        };
        grouped.entry(idx).or_default().insert(field.to_string(), v.clone());
    }
    grouped.into_values().map(Value::Object).collect()
}

/// Key-level diff between two raw trees: `{changed: {k: {old, new}}, removed: [k]}`.
pub fn diff_trees(old: &Map<String, Value>, new: &Map<String, Value>) -> Value {
    let mut changed = Map::new();
    for (k, v) in new {
        match old.get(k) {
            Some(prev) if prev == v => {}
            prev => {
                changed.insert(
                    k.clone(),
                    json!({ "old": prev.cloned().unwrap_or(Value::Null), "new": v }),
                );
            }
        }
    }
    let removed: Vec<&String> = old.keys().filter(|k| !new.contains_key(*k)).collect();
    json!({ "changed": changed, "removed": removed })
}

pub fn str_at(raw: &Map<String, Value>, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn num_at(raw: &Map<String, Value>, key: &str) -> Option<f64> {
    let n = match raw.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

fn derive_score(
    raw: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    scaled: Option<f64>,
) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    let scaled = scaled.or_else(|| match (raw, min, max) {
        (Some(r), lo, Some(hi)) if hi > lo.unwrap_or(0.0) => {
            let lo = lo.unwrap_or(0.0);
            Some((r - lo) / (hi - lo))
        }
        _ => None,
    });
    let raw = raw.or_else(|| scaled.map(|s| s * max.unwrap_or(100.0)));
    (raw, min, max, scaled)
}
