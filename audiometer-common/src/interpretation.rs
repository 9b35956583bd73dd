//! Audiogram interpretation
//!
//! Rule-based summary of a session: pure-tone average per ear, WHO/ASHA
//! grade, audiogram shape and inter-ear asymmetry. NO_RESPONSE records do
//! not contribute to any average.

use crate::types::{Ear, SessionReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frequencies averaged for the pure-tone average
pub const SPEECH_FREQUENCIES: [u32; 3] = [500, 1000, 2000];

/// PTA difference flagged as asymmetric (dB)
pub const ASYMMETRY_THRESHOLD_DB: f64 = 15.0;

/// Hearing loss grade from the pure-tone average
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HearingGrade {
    Normal,
    Mild,
    Moderate,
    ModeratelySevere,
    Severe,
    Profound,
}

impl HearingGrade {
    pub fn from_pta(pta: f64) -> Self {
        match pta {
            p if p <= 25.0 => HearingGrade::Normal,
            p if p <= 40.0 => HearingGrade::Mild,
            p if p <= 55.0 => HearingGrade::Moderate,
            p if p <= 70.0 => HearingGrade::ModeratelySevere,
            p if p <= 90.0 => HearingGrade::Severe,
            _ => HearingGrade::Profound,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HearingGrade::Normal => "Normal Hearing",
            HearingGrade::Mild => "Mild Loss",
            HearingGrade::Moderate => "Moderate Loss",
            HearingGrade::ModeratelySevere => "Moderately Severe Loss",
            HearingGrade::Severe => "Severe Loss",
            HearingGrade::Profound => "Profound Loss",
        }
    }
}

/// Audiogram shape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudiogramPattern {
    InsufficientData,
    Flat,
    Notched4k,
    HighFrequencySloping,
    LowFrequencyRising,
    CookieBite,
    Irregular,
}

/// Interpretation of one ear
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarInterpretation {
    pub ear: Ear,
    pub pta_db: Option<f64>,
    pub grade: Option<HearingGrade>,
    pub pattern: AudiogramPattern,
    /// Frequencies without a confirmed threshold
    pub no_response_frequencies: Vec<u32>,
}

/// Interpretation of a whole session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interpretation {
    pub ears: Vec<EarInterpretation>,
    /// True when both PTAs exist and differ by at least 15 dB
    pub asymmetric: bool,
    pub summary: String,
}

/// Interpret every ear present in the report
pub fn interpret(report: &SessionReport) -> Interpretation {
    let mut ears: Vec<Ear> = report.records.iter().map(|r| r.ear).collect();
    ears.sort();
    ears.dedup();

    let ears: Vec<EarInterpretation> = ears
        .into_iter()
        .map(|ear| {
            let thresholds: BTreeMap<u32, f64> = report
                .thresholds_for(ear)
                .into_iter()
                .map(|(f, l)| (f, l as f64))
                .collect();
            let pta = pure_tone_average(&thresholds);
            EarInterpretation {
                ear,
                pta_db: pta,
                grade: pta.map(HearingGrade::from_pta),
                pattern: detect_pattern(&thresholds),
                no_response_frequencies: report
                    .records
                    .iter()
                    .filter(|r| r.ear == ear && r.level().is_none())
                    .map(|r| r.frequency_hz)
                    .collect(),
            }
        })
        .collect();

    let ptas: Vec<f64> = ears.iter().filter_map(|e| e.pta_db).collect();
    let asymmetric = ptas.len() == 2 && (ptas[0] - ptas[1]).abs() >= ASYMMETRY_THRESHOLD_DB;

    let mut parts: Vec<String> = ears
        .iter()
        .map(|e| match (e.pta_db, e.grade) {
            (Some(pta), Some(grade)) => format!("{} ear: {} (PTA {:.1} dB)", capitalize(e.ear.as_str()), grade.label(), pta),
            _ => format!("{} ear: no thresholds", capitalize(e.ear.as_str())),
        })
        .collect();
    if asymmetric {
        parts.push("asymmetric hearing".to_string());
    }

    Interpretation {
        ears,
        asymmetric,
        summary: parts.join("; "),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Average over 500/1000/2000 Hz, or over all thresholds when fewer than
/// two speech frequencies were measured
pub fn pure_tone_average(thresholds: &BTreeMap<u32, f64>) -> Option<f64> {
    let speech: Vec<f64> = SPEECH_FREQUENCIES
        .iter()
        .filter_map(|f| thresholds.get(f).copied())
        .collect();
    if speech.len() >= 2 {
        return Some(mean(&speech));
    }
    if thresholds.is_empty() {
        return None;
    }
    Some(mean(&thresholds.values().copied().collect::<Vec<_>>()))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_of(thresholds: &BTreeMap<u32, f64>, freqs: &[u32]) -> Option<f64> {
    let values: Vec<f64> = freqs.iter().filter_map(|f| thresholds.get(f).copied()).collect();
    (!values.is_empty()).then(|| mean(&values))
}

/// Classify the audiogram shape
pub fn detect_pattern(thresholds: &BTreeMap<u32, f64>) -> AudiogramPattern {
    if thresholds.len() < 3 {
        return AudiogramPattern::InsufficientData;
    }

    let max = thresholds.values().copied().fold(f64::MIN, f64::max);
    let min = thresholds.values().copied().fold(f64::MAX, f64::min);
    if max - min < 20.0 {
        return AudiogramPattern::Flat;
    }

    if let Some(at_4k) = thresholds.get(&4000) {
        let neighbours: Vec<f64> = [2000, 8000]
            .iter()
            .filter_map(|f| thresholds.get(f).map(|n| at_4k - n))
            .collect();
        if !neighbours.is_empty() && mean(&neighbours) >= 10.0 {
            return AudiogramPattern::Notched4k;
        }
    }

    let low = mean_of(thresholds, &[250, 500]);
    let mid = mean_of(thresholds, &[1000, 2000]);
    let high = mean_of(thresholds, &[4000, 8000]);

    if let (Some(low), Some(high)) = (low, high) {
        if high > low + 15.0 {
            return AudiogramPattern::HighFrequencySloping;
        }
        if low > high + 15.0 {
            return AudiogramPattern::LowFrequencyRising;
        }
        if let Some(mid) = mid {
            if mid > low + 10.0 && mid > high + 10.0 {
                return AudiogramPattern::CookieBite;
            }
        }
    }

    AudiogramPattern::Irregular
}
