use serde::{Deserialize, Serialize};

/// Round to 2 decimals, half away from zero.
///
/// Rounds the binary value, so a decimal tie that is stored just below
/// the half (1.005 is 1.00499...) goes down.
pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LetterGrade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
    #[serde(rename = "ABS")]
    Absent,
}

/// Lower bound of each band, highest first. Bands are half-open so a score
/// sitting on a boundary takes the higher letter.
const BANDS: [(f64, LetterGrade); 8] = [
    (16.0, LetterGrade::APlus),
    (15.0, LetterGrade::A),
    (14.0, LetterGrade::BPlus),
    (13.0, LetterGrade::B),
    (12.0, LetterGrade::CPlus),
    (11.0, LetterGrade::C),
    (10.0, LetterGrade::DPlus),
    (8.0, LetterGrade::D),
];

impl LetterGrade {
    pub fn from_weighted(weighted: f64) -> Self {
        BANDS
            .iter()
            .find(|(min, _)| weighted >= *min)
            .map(|(_, letter)| *letter)
            .unwrap_or(LetterGrade::F)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LetterGrade::APlus => "A+",
            LetterGrade::A => "A",
            LetterGrade::BPlus => "B+",
            LetterGrade::B => "B",
            LetterGrade::CPlus => "C+",
            LetterGrade::C => "C",
            LetterGrade::DPlus => "D+",
            LetterGrade::D => "D",
            LetterGrade::F => "F",
            LetterGrade::Absent => "ABS",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let up = raw.trim().to_ascii_uppercase();
        [
            LetterGrade::APlus,
            LetterGrade::A,
            LetterGrade::BPlus,
            LetterGrade::B,
            LetterGrade::CPlus,
            LetterGrade::C,
            LetterGrade::DPlus,
            LetterGrade::D,
            LetterGrade::F,
            LetterGrade::Absent,
        ]
        .into_iter()
        .find(|l| l.as_str() == up)
    }

    /// Absences count as not passing, same as an F.
    pub fn is_passing(self) -> bool {
        !matches!(self, LetterGrade::F | LetterGrade::Absent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredGrade {
    pub weighted_score: Option<f64>,
    pub letter: LetterGrade,
}

impl ScoredGrade {
    pub fn is_passing(&self) -> bool {
        self.letter.is_passing()
    }
}

/// Derive the weighted score and letter for one grade.
///
/// Must be called on every write of a grade or of the evaluation it belongs
/// to; stored derived values are never reused.
pub fn score(
    raw_score: Option<f64>,
    absent: bool,
    evaluation_coefficient: f64,
    weight_percent: f64,
) -> ScoredGrade {
    let raw = match raw_score {
        Some(v) if !absent => v,
        _ => {
            return ScoredGrade {
                weighted_score: None,
                letter: LetterGrade::Absent,
            }
        }
    };
    let weighted = raw * evaluation_coefficient * (weight_percent / 100.0);
    ScoredGrade {
        weighted_score: Some(weighted),
        letter: LetterGrade::from_weighted(weighted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficient_two_half_weight() {
        let s = score(Some(15.0), false, 2.0, 50.0);
        assert_eq!(s.weighted_score, Some(15.0));
        assert_eq!(s.letter, LetterGrade::A);
        assert!(s.is_passing());
    }

    #[test]
    fn boundaries_take_the_higher_band() {
        let cases = [
            (16.0, LetterGrade::APlus),
            (15.99, LetterGrade::A),
            (15.0, LetterGrade::A),
            (14.0, LetterGrade::BPlus),
            (13.0, LetterGrade::B),
            (12.0, LetterGrade::CPlus),
            (11.0, LetterGrade::C),
            (10.0, LetterGrade::DPlus),
            (9.99, LetterGrade::D),
            (8.0, LetterGrade::D),
            (7.99, LetterGrade::F),
            (0.0, LetterGrade::F),
        ];
        for (weighted, expected) in cases {
            assert_eq!(LetterGrade::from_weighted(weighted), expected, "{weighted}");
        }
    }

    #[test]
    fn absent_has_no_weighted_score() {
        let s = score(Some(18.0), true, 1.0, 100.0);
        assert_eq!(s.weighted_score, None);
        assert_eq!(s.letter, LetterGrade::Absent);
        assert!(!s.is_passing());

        // A missing raw score is treated the same way.
        let s = score(None, false, 1.0, 100.0);
        assert_eq!(s.letter, LetterGrade::Absent);
    }

    #[test]
    fn rescoring_follows_new_inputs() {
        let before = score(Some(12.0), false, 1.0, 100.0);
        let after = score(Some(12.0), false, 2.0, 100.0);
        assert_eq!(before.letter, LetterGrade::CPlus);
        assert_eq!(after.weighted_score, Some(24.0));
        assert_eq!(after.letter, LetterGrade::APlus);
    }

    #[test]
    fn round_2dp_half_away_from_zero() {
        assert_eq!(round_2dp(12.345_000_1), 12.35);
        assert_eq!(round_2dp(-2.5), -2.5);
        assert_eq!(round_2dp(0.125), 0.13);
        assert_eq!(round_2dp(-0.125), -0.13);
        assert_eq!(round_2dp(13.333_333), 13.33);
        // 1.005 is stored as 1.00499...
        assert_eq!(round_2dp(1.005), 1.0);
    }

    #[test]
    fn letters_parse_and_serialize() {
        assert_eq!(LetterGrade::parse("b+"), Some(LetterGrade::BPlus));
        assert_eq!(LetterGrade::parse("abs"), Some(LetterGrade::Absent));
        assert_eq!(LetterGrade::parse("E"), None);
        assert_eq!(
            serde_json::to_string(&LetterGrade::APlus).expect("serialize"),
            "\"A+\""
        );
    }
}
