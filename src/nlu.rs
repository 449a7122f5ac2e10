//! Keyword intent classification, entity extraction and script-based
//! language detection for free-text activity notes.

use crate::types::ActivityKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const INTENT_LOG_ACTIVITY: &str = "log_activity";
pub const INTENT_ASK_KB: &str = "ask_kb";
pub const INTENT_REQUEST_ADVICE: &str = "request_advice";
pub const INTENT_SMALLTALK: &str = "smalltalk_other";

/// Confidence reported when no keyword matched at all
const NO_MATCH_CONFIDENCE: f64 = 0.5;

type IntentTable = &'static [(&'static str, &'static [&'static str])];

// Declaration order breaks ties between equally scored intents
const EN_INTENTS: IntentTable = &[
    (
        INTENT_LOG_ACTIVITY,
        &["plant", "sow", "water", "fertilizer", "pesticide", "harvest", "farming"],
    ),
    (INTENT_ASK_KB, &["what", "how", "when", "where", "why", "help"]),
    (INTENT_REQUEST_ADVICE, &["advice", "help", "what to do", "how to"]),
    (INTENT_SMALLTALK, &["hello", "hi", "thanks", "bye"]),
];

const ML_INTENTS: IntentTable = &[
    (
        INTENT_LOG_ACTIVITY,
        &["നടൽ", "തളിക്കൽ", "വെള്ളം", "വളം", "വിളവെടുപ്പ്", "കൃഷി"],
    ),
    (
        INTENT_ASK_KB,
        &["എന്ത്", "എങ്ങനെ", "എപ്പോൾ", "എവിടെ", "എന്തുകൊണ്ട്", "സഹായം"],
    ),
    (
        INTENT_REQUEST_ADVICE,
        &["ഉപദേശം", "സഹായം", "എന്ത് ചെയ്യണം", "എങ്ങനെ ചെയ്യണം"],
    ),
    (INTENT_SMALLTALK, &["നമസ്കാരം", "ഹലോ", "ധന്യവാദം", "വിട"]),
];

struct EntityPatterns {
    crop: Regex,
    activity: Regex,
    quantity: Regex,
    time: Regex,
}

fn compile(pattern: &str) -> Regex {
    // Patterns are literals in this file; a bad one is a programming error
    Regex::new(pattern).expect("static NLU pattern must compile")
}

static EN_ENTITIES: LazyLock<EntityPatterns> = LazyLock::new(|| EntityPatterns {
    crop: compile(r"(?i)\b(rice|paddy|banana|brinjal|tomato|coconut|pepper|ginger|cardamom)\b"),
    activity: compile(
        r"(?i)\b(plant\w*|sow\w*|water\w*|irrigat\w*|fertili[sz]\w*|pesticide|spray\w*|harvest\w*|plow\w*|plough\w*|weed\w*|prun\w*)",
    ),
    quantity: compile(r"(?i)(\d+(?:\.\d+)?)\s*(kg|kilogram|liter|litre|gram)s?\b"),
    time: compile(r"(?i)\b(tomorrow|today|yesterday|this week|next week)\b"),
});

static ML_ENTITIES: LazyLock<EntityPatterns> = LazyLock::new(|| EntityPatterns {
    crop: compile(r"(നെല്ല്|വാഴ|കുരുമുളക്|തക്കാളി|തെങ്ങ്|ഇഞ്ചി|ഏലം)"),
    activity: compile(r"(നടൽ|തളിക്കൽ|വെള്ളം|വളം|വിളവെടുപ്പ്|കീടനാശിനി)"),
    quantity: compile(r"(\d+(?:\.\d+)?)\s*(കിലോഗ്രാം|കിലോ|ലിറ്റർ|ഗ്രാം)"),
    time: compile(r"(നാളെ|ഇന്ന്|ഇന്നലെ|ഈ ആഴ്ച|അടുത്ത ആഴ്ച)"),
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub crop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub activity: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub quantity: Vec<Quantity>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub time: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NluResult {
    pub intent: String,
    pub confidence: f64,
    pub entities: Entities,
    pub language: String,
}

impl NluResult {
    /// Confidence as a 0..=100 integer score
    pub fn confidence_score(&self) -> i32 {
        (self.confidence * 100.0).round().clamp(0.0, 100.0) as i32
    }
}

fn is_malayalam(language: &str) -> bool {
    language.to_ascii_lowercase().starts_with("ml")
}

/// Classify `text` and pull out crop, activity, quantity and time mentions
pub fn analyze(text: &str, language: &str) -> NluResult {
    let lowered = text.to_lowercase();
    let (table, patterns) = if is_malayalam(language) {
        (ML_INTENTS, &*ML_ENTITIES)
    } else {
        (EN_INTENTS, &*EN_ENTITIES)
    };

    let mut best: Option<(&str, usize, usize)> = None;
    for (intent, keywords) in table {
        let matches = keywords.iter().filter(|k| lowered.contains(*k)).count();
        if matches == 0 {
            continue;
        }
        match best {
            Some((_, best_matches, _)) if best_matches >= matches => {}
            _ => best = Some((intent, matches, keywords.len())),
        }
    }

    let (intent, confidence) = match best {
        Some((intent, matches, total)) => (intent, (matches as f64 / total as f64).min(1.0)),
        None => (INTENT_SMALLTALK, NO_MATCH_CONFIDENCE),
    };

    NluResult {
        intent: intent.to_string(),
        confidence,
        entities: extract_entities(text, patterns),
        language: language.to_string(),
    }
}

fn extract_entities(text: &str, patterns: &EntityPatterns) -> Entities {
    let words = |re: &Regex| -> Vec<String> {
        re.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
    };
    let quantity = patterns
        .quantity
        .captures_iter(text)
        .filter_map(|c| {
            let value = c.get(1)?.as_str().parse().ok()?;
            Some(Quantity {
                value,
                unit: c.get(2)?.as_str().to_lowercase(),
            })
        })
        .collect();
    Entities {
        crop: words(&patterns.crop),
        activity: words(&patterns.activity),
        quantity,
        time: words(&patterns.time),
    }
}

const KIND_KEYWORDS: &[(ActivityKind, &[&str])] = &[
    (ActivityKind::Sowing, &["plant", "sow", "നടൽ"]),
    (ActivityKind::Irrigation, &["water", "irrigat", "വെള്ളം"]),
    (ActivityKind::Fertilizer, &["fertili", "വളം"]),
    (
        ActivityKind::Pesticide,
        &["pesticide", "spray", "തളിക്കൽ", "കീടനാശിനി"],
    ),
    (ActivityKind::Harvest, &["harvest", "വിളവെടുപ്പ്"]),
    (ActivityKind::Plowing, &["plow", "plough"]),
    (ActivityKind::Weeding, &["weed"]),
    (ActivityKind::Pruning, &["prun"]),
];

/// Activity kind from the first recognised activity mention, falling back to
/// a scan of the whole text
pub fn activity_kind(result: &NluResult, text: &str) -> ActivityKind {
    let lowered = text.to_lowercase();
    let candidates = result
        .entities
        .activity
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(lowered.as_str()));
    for candidate in candidates {
        for (kind, stems) in KIND_KEYWORDS {
            if stems.iter().any(|s| candidate.contains(s)) {
                return *kind;
            }
        }
    }
    ActivityKind::Other
}

/// Structured payload stored alongside an activity
pub fn activity_data(result: &NluResult) -> serde_json::Value {
    let mut map = BTreeMap::new();
    map.insert("intent", serde_json::json!(result.intent));
    map.insert("confidence", serde_json::json!(result.confidence));
    map.insert("entities", serde_json::json!(result.entities));
    serde_json::json!(map)
}

/// `ml-IN` when Malayalam script letters outnumber ASCII letters, else `en-IN`
pub fn detect_language(text: &str) -> &'static str {
    let (mut malayalam, mut latin) = (0usize, 0usize);
    for ch in text.chars() {
        if ('\u{0D00}'..='\u{0D7F}').contains(&ch) {
            malayalam += 1;
        } else if ch.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    if malayalam > latin {
        "ml-IN"
    } else {
        "en-IN"
    }
}

/// Collapse whitespace; used as the processed form of activity text
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_activity_intent() {
        let r = analyze("Today I will water and harvest the rice", "en-IN");
        assert_eq!(r.intent, INTENT_LOG_ACTIVITY);
        // 2 of 7 keywords
        assert!((r.confidence - 2.0 / 7.0).abs() < 1e-9);
        assert_eq!(r.confidence_score(), 29);
        assert_eq!(r.entities.crop, vec!["rice"]);
        assert_eq!(r.entities.time, vec!["today"]);
    }

    #[test]
    fn test_no_keywords_is_smalltalk_with_half_confidence() {
        let r = analyze("zzz qqq", "en-IN");
        assert_eq!(r.intent, INTENT_SMALLTALK);
        assert_eq!(r.confidence, 0.5);
        assert_eq!(r.confidence_score(), 50);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        // "help" scores one for ask_kb and one for request_advice
        let r = analyze("help", "en");
        assert_eq!(r.intent, INTENT_ASK_KB);
    }

    #[test]
    fn test_quantity_entity() {
        let r = analyze("applied 25 kg of urea fertilizer", "en-IN");
        assert_eq!(
            r.entities.quantity,
            vec![Quantity {
                value: 25.0,
                unit: "kg".into()
            }]
        );
        assert_eq!(activity_kind(&r, "applied 25 kg of urea fertilizer"), ActivityKind::Fertilizer);
    }

    #[test]
    fn test_malayalam_intent_and_kind() {
        let text = "ഇന്ന് വാഴയ്ക്ക് വെള്ളം ഒഴിച്ചു";
        assert_eq!(detect_language(text), "ml-IN");
        let r = analyze(text, "ml-IN");
        assert_eq!(r.intent, INTENT_LOG_ACTIVITY);
        assert_eq!(activity_kind(&r, text), ActivityKind::Irrigation);
        assert_eq!(r.entities.time, vec!["ഇന്ന്"]);
    }

    #[test]
    fn test_activity_kind_mapping() {
        let cases = [
            ("sowed paddy seeds", ActivityKind::Sowing),
            ("irrigated the plot", ActivityKind::Irrigation),
            ("sprayed neem oil", ActivityKind::Pesticide),
            ("harvested bananas", ActivityKind::Harvest),
            ("ploughed the field", ActivityKind::Plowing),
            ("removed weeds", ActivityKind::Weeding),
            ("pruned the pepper vines", ActivityKind::Pruning),
            ("visited the market", ActivityKind::Other),
        ];
        for (text, expected) in cases {
            let r = analyze(text, "en-IN");
            assert_eq!(activity_kind(&r, text), expected, "{}", text);
        }
    }

    #[test]
    fn test_detect_language_defaults() {
        assert_eq!(detect_language(""), "en-IN");
        assert_eq!(detect_language("1234 !!"), "en-IN");
        assert_eq!(detect_language("water the rice"), "en-IN");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  water \n the   rice "), "water the rice");
    }
}
