use std::collections::HashMap;

/// Track value that matches every track of a level.
pub const ANY_TRACK: &str = "*";

/// Resolves the weight of a subject for one academic (level, track).
///
/// A result of `0.0` means the subject does not count for that track. It is
/// an omission, not an error.
pub trait CoefficientResolver {
    fn resolve(&self, subject_id: &str, level: &str, track: &str) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientRow {
    pub subject_id: String,
    pub level: String,
    pub track: String,
    pub coefficient: f64,
}

/// In-memory lookup table keyed by (subject, level, track).
#[derive(Debug, Clone, Default)]
pub struct CoefficientTable {
    entries: HashMap<(String, String, String), f64>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = CoefficientRow>,
    {
        let mut table = Self::new();
        for r in rows {
            table.insert(&r.subject_id, &r.level, &r.track, r.coefficient);
        }
        table
    }

    pub fn insert(&mut self, subject_id: &str, level: &str, track: &str, coefficient: f64) {
        self.entries.insert(
            (
                subject_id.to_string(),
                normalize_key(level),
                normalize_key(track),
            ),
            coefficient,
        );
    }

    fn lookup(&self, subject_id: &str, level: &str, track: &str) -> Option<f64> {
        self.entries
            .get(&(subject_id.to_string(), level.to_string(), track.to_string()))
            .copied()
    }
}

impl CoefficientResolver for CoefficientTable {
    fn resolve(&self, subject_id: &str, level: &str, track: &str) -> f64 {
        let level = normalize_key(level);
        let track = normalize_key(track);
        let found = self
            .lookup(subject_id, &level, &track)
            .or_else(|| self.lookup(subject_id, &level, ANY_TRACK))
            .unwrap_or(0.0);
        // NaN and negatives collapse to "not applicable".
        if found > 0.0 {
            found
        } else {
            0.0
        }
    }
}

/// Level and track codes compare case-insensitively and ignore padding.
pub fn normalize_key(raw: &str) -> String {
    let t = raw.trim();
    if t.is_empty() {
        ANY_TRACK.to_string()
    } else {
        t.to_ascii_uppercase()
    }
}
