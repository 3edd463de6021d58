use crate::coeff::CoefficientResolver;
use crate::error::{CalcError, CalcResult};
use crate::scoring::{self, round_2dp, LetterGrade};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Scale that raw scores are normalized to before averaging.
pub const DEFAULT_SCALE: f64 = 20.0;

/// Identifies one grading period of one class. Every aggregation takes it
/// explicitly; there is no notion of a "current" year or period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodKey {
    pub class_id: String,
    pub year: String,
    pub period: i64,
}

impl PeriodKey {
    pub fn new(class_id: impl Into<String>, year: impl Into<String>, period: i64) -> Self {
        Self {
            class_id: class_id.into(),
            year: year.into(),
            period,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationKind {
    Quiz,
    Exam,
    Continuous,
}

impl EvaluationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationKind::Quiz => "quiz",
            EvaluationKind::Exam => "exam",
            EvaluationKind::Continuous => "continuous",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quiz" => Some(EvaluationKind::Quiz),
            "exam" => Some(EvaluationKind::Exam),
            "continuous" => Some(EvaluationKind::Continuous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Planned => "planned",
            EvaluationStatus::Ongoing => "ongoing",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planned" => Some(EvaluationStatus::Planned),
            "ongoing" => Some(EvaluationStatus::Ongoing),
            "completed" => Some(EvaluationStatus::Completed),
            "cancelled" => Some(EvaluationStatus::Cancelled),
            _ => None,
        }
    }

    /// planned -> ongoing -> completed, with cancellation allowed from any
    /// non-terminal state. Staying in place is always allowed.
    pub fn transition(self, to: EvaluationStatus) -> CalcResult<EvaluationStatus> {
        use EvaluationStatus::*;
        let allowed = self == to
            || matches!(
                (self, to),
                (Planned, Ongoing)
                    | (Planned, Completed)
                    | (Planned, Cancelled)
                    | (Ongoing, Completed)
                    | (Ongoing, Cancelled)
            );
        if allowed {
            Ok(to)
        } else {
            Err(CalcError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// Cancelled evaluations never reach aggregation.
    pub fn counts_toward_average(self) -> bool {
        self != EvaluationStatus::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectDef {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDef {
    pub id: String,
    pub subject_id: String,
    pub title: String,
    pub kind: EvaluationKind,
    pub coefficient: f64,
    pub weight_percent: f64,
    pub max_score: f64,
    pub status: EvaluationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeInput {
    pub evaluation_id: String,
    pub raw_score: Option<f64>,
    pub absent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentInput {
    pub student_id: String,
    pub display_name: String,
    pub level: String,
    pub track: String,
    pub grades: Vec<GradeInput>,
}

/// Everything needed to build the cards of one class for one period.
#[derive(Debug, Clone)]
pub struct ClassInputs {
    pub key: PeriodKey,
    pub subjects: Vec<SubjectDef>,
    pub evaluations: Vec<EvaluationDef>,
    pub students: Vec<StudentInput>,
}

/// One present or absent grade as seen by the subject aggregator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectGrade {
    pub raw_score: Option<f64>,
    pub absent: bool,
    pub coefficient: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectResult {
    pub coefficient: f64,
    pub average: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardTotals {
    pub total_points: f64,
    pub total_coefficients: f64,
    pub overall_average: f64,
    pub incomplete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Draft,
    Ranked,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Draft => "draft",
            CardStatus::Ranked => "ranked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(CardStatus::Draft),
            "ranked" => Some(CardStatus::Ranked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    pub evaluation_id: String,
    pub title: String,
    pub coefficient: f64,
    pub weight_percent: f64,
    pub max_score: f64,
    pub raw_score: Option<f64>,
    pub absent: bool,
    pub weighted_score: Option<f64>,
    pub letter: LetterGrade,
    pub passing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectEntry {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
    pub average: f64,
    pub points: f64,
    pub evaluations: Vec<EvaluationDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: String,
    pub display_name: String,
    pub class_id: String,
    pub year: String,
    pub period: i64,
    pub level: String,
    pub track: String,
    pub subjects: Vec<SubjectEntry>,
    pub total_points: f64,
    pub total_coefficients: f64,
    pub overall_average: f64,
    pub incomplete: bool,
    pub class_size: usize,
    pub class_average: f64,
    pub top_average: f64,
    pub bottom_average: f64,
    pub rank: usize,
    pub status: CardStatus,
}

impl ReportCard {
    pub fn key(&self) -> PeriodKey {
        PeriodKey::new(&self.class_id, &self.year, self.period)
    }
}

fn normalized_score(raw: f64, max_score: f64, scale: f64) -> f64 {
    if max_score > 0.0 && (max_score - scale).abs() > f64::EPSILON {
        raw * scale / max_score
    } else {
        raw
    }
}

/// Weighted mean of the present grades of one subject.
///
/// Absent grades contribute nothing to either side of the mean. Returns
/// `None` when the subject coefficient is not positive or when no grade is
/// present, so the subject drops out of the card instead of scoring zero.
pub fn aggregate_subject(
    subject_coefficient: f64,
    grades: &[SubjectGrade],
    scale: f64,
) -> Option<SubjectResult> {
    if subject_coefficient <= 0.0 {
        return None;
    }

    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for g in grades {
        let raw = match g.raw_score {
            Some(v) if !g.absent => v,
            _ => continue,
        };
        let weight = if g.coefficient > 0.0 { g.coefficient } else { 1.0 };
        sum += normalized_score(raw, g.max_score, scale) * weight;
        denom += weight;
    }
    if denom <= 0.0 {
        return None;
    }

    // Points come from the unrounded mean; only the shown average is rounded.
    let mean = sum / denom;
    Some(SubjectResult {
        coefficient: subject_coefficient,
        average: round_2dp(mean),
        points: round_2dp(mean * subject_coefficient),
    })
}

pub fn aggregate_report_card<I>(subjects: I) -> CalcResult<CardTotals>
where
    I: IntoIterator<Item = SubjectResult>,
{
    let mut total_points = 0.0_f64;
    let mut total_coefficients = 0.0_f64;
    for s in subjects {
        total_points += s.points;
        total_coefficients += s.coefficient;
    }

    if total_coefficients < 0.0 || !total_coefficients.is_finite() || !total_points.is_finite() {
        tracing::error!(total_coefficients, total_points, "report card totals out of range");
        return Err(CalcError::Invariant(format!(
            "total coefficients must be a non-negative number, got {total_coefficients}"
        )));
    }

    let incomplete = total_coefficients <= 0.0;
    let overall_average = if incomplete {
        0.0
    } else {
        round_2dp(total_points / total_coefficients)
    };
    Ok(CardTotals {
        total_points: round_2dp(total_points),
        total_coefficients,
        overall_average,
        incomplete,
    })
}

/// Build one student's card for a period. Rank and class fields are left at
/// their zero placeholders; only a ranking pass fills them in.
pub fn build_report_card(
    key: &PeriodKey,
    subjects: &[SubjectDef],
    evaluations: &[EvaluationDef],
    student: &StudentInput,
    resolver: &dyn CoefficientResolver,
    scale: f64,
) -> CalcResult<ReportCard> {
    let grade_by_eval: HashMap<&str, &GradeInput> = student
        .grades
        .iter()
        .map(|g| (g.evaluation_id.as_str(), g))
        .collect();

    let mut ordered: Vec<&SubjectDef> = subjects.iter().collect();
    ordered.sort_by(|a, b| match a.sort_order.cmp(&b.sort_order) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });

    let mut entries: Vec<SubjectEntry> = Vec::new();
    for subject in ordered {
        let coefficient = resolver.resolve(&subject.id, &student.level, &student.track);
        if coefficient <= 0.0 {
            continue;
        }

        let mut detail: Vec<EvaluationDetail> = Vec::new();
        let mut samples: Vec<SubjectGrade> = Vec::new();
        for e in evaluations
            .iter()
            .filter(|e| e.subject_id == subject.id && e.status.counts_toward_average())
        {
            let Some(g) = grade_by_eval.get(e.id.as_str()) else {
                continue;
            };
            let absent = g.absent || g.raw_score.is_none();
            let scored = scoring::score(g.raw_score, absent, e.coefficient, e.weight_percent);
            detail.push(EvaluationDetail {
                evaluation_id: e.id.clone(),
                title: e.title.clone(),
                coefficient: e.coefficient,
                weight_percent: e.weight_percent,
                max_score: e.max_score,
                raw_score: if absent { None } else { g.raw_score },
                absent,
                weighted_score: scored.weighted_score,
                letter: scored.letter,
                passing: scored.is_passing(),
            });
            samples.push(SubjectGrade {
                raw_score: g.raw_score,
                absent,
                coefficient: e.coefficient,
                max_score: e.max_score,
            });
        }

        let Some(result) = aggregate_subject(coefficient, &samples, scale) else {
            continue;
        };
        entries.push(SubjectEntry {
            subject_id: subject.id.clone(),
            name: subject.name.clone(),
            coefficient: result.coefficient,
            average: result.average,
            points: result.points,
            evaluations: detail,
        });
    }

    let totals = aggregate_report_card(entries.iter().map(|e| SubjectResult {
        coefficient: e.coefficient,
        average: e.average,
        points: e.points,
    }))?;

    Ok(ReportCard {
        student_id: student.student_id.clone(),
        display_name: student.display_name.clone(),
        class_id: key.class_id.clone(),
        year: key.year.clone(),
        period: key.period,
        level: student.level.clone(),
        track: student.track.clone(),
        subjects: entries,
        total_points: totals.total_points,
        total_coefficients: totals.total_coefficients,
        overall_average: totals.overall_average,
        incomplete: totals.incomplete,
        class_size: 0,
        class_average: 0.0,
        top_average: 0.0,
        bottom_average: 0.0,
        rank: 0,
        status: CardStatus::Draft,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::CoefficientTable;

    fn present(raw: f64, coefficient: f64) -> SubjectGrade {
        SubjectGrade {
            raw_score: Some(raw),
            absent: false,
            coefficient,
            max_score: 20.0,
        }
    }

    fn absent(coefficient: f64) -> SubjectGrade {
        SubjectGrade {
            raw_score: None,
            absent: true,
            coefficient,
            max_score: 20.0,
        }
    }

    fn eval(id: &str, subject: &str, coefficient: f64) -> EvaluationDef {
        EvaluationDef {
            id: id.to_string(),
            subject_id: subject.to_string(),
            title: format!("Eval {id}"),
            kind: EvaluationKind::Exam,
            coefficient,
            weight_percent: 100.0,
            max_score: 20.0,
            status: EvaluationStatus::Completed,
        }
    }

    fn grade(eval_id: &str, raw: Option<f64>) -> GradeInput {
        GradeInput {
            evaluation_id: eval_id.to_string(),
            raw_score: raw,
            absent: raw.is_none(),
        }
    }

    fn subjects() -> Vec<SubjectDef> {
        vec![
            SubjectDef {
                id: "math".into(),
                name: "Mathematics".into(),
                sort_order: 1,
            },
            SubjectDef {
                id: "philo".into(),
                name: "Philosophy".into(),
                sort_order: 2,
            },
            SubjectDef {
                id: "french".into(),
                name: "French".into(),
                sort_order: 0,
            },
        ]
    }

    fn table() -> CoefficientTable {
        let mut t = CoefficientTable::new();
        t.insert("math", "TLE", "C", 5.0);
        t.insert("philo", "TLE", "C", 0.0);
        t.insert("philo", "TLE", "A", 4.0);
        t.insert("french", "TLE", "*", 2.0);
        t
    }

    fn student(track: &str, grades: Vec<GradeInput>) -> StudentInput {
        StudentInput {
            student_id: "s1".into(),
            display_name: "Doe, Jane".into(),
            level: "TLE".into(),
            track: track.into(),
            grades,
        }
    }

    #[test]
    fn absent_grade_is_left_out_of_both_sides() {
        let r = aggregate_subject(1.0, &[absent(1.0), present(15.0, 1.0)], DEFAULT_SCALE)
            .expect("subject result");
        assert_eq!(r.average, 15.0);
        assert_eq!(r.points, 15.0);
    }

    #[test]
    fn weights_come_from_grade_coefficients_with_default_one() {
        let r = aggregate_subject(
            3.0,
            &[present(10.0, 2.0), present(16.0, 0.0)],
            DEFAULT_SCALE,
        )
        .expect("subject result");
        // (10*2 + 16*1) / 3 = 12
        assert_eq!(r.average, 12.0);
        assert_eq!(r.points, 36.0);
    }

    #[test]
    fn scores_are_normalized_to_the_scale() {
        let mut g = present(8.0, 1.0);
        g.max_score = 10.0;
        let r = aggregate_subject(1.0, &[g], DEFAULT_SCALE).expect("subject result");
        assert_eq!(r.average, 16.0);
    }

    #[test]
    fn subject_without_present_grades_is_excluded() {
        assert_eq!(aggregate_subject(2.0, &[], DEFAULT_SCALE), None);
        assert_eq!(aggregate_subject(2.0, &[absent(1.0)], DEFAULT_SCALE), None);
        assert_eq!(aggregate_subject(0.0, &[present(12.0, 1.0)], DEFAULT_SCALE), None);
    }

    #[test]
    fn points_use_the_unrounded_mean() {
        // mean 40/3, coefficient 3 -> 40, not 13.33 * 3
        let r = aggregate_subject(
            3.0,
            &[present(13.0, 1.0), present(13.0, 1.0), present(14.0, 1.0)],
            DEFAULT_SCALE,
        )
        .expect("subject result");
        assert_eq!(r.average, 13.33);
        assert_eq!(r.points, 40.0);
    }

    #[test]
    fn totals_and_incomplete_state() {
        let t = aggregate_report_card(vec![
            SubjectResult {
                coefficient: 5.0,
                average: 12.0,
                points: 60.0,
            },
            SubjectResult {
                coefficient: 2.0,
                average: 15.5,
                points: 31.0,
            },
        ])
        .expect("totals");
        assert_eq!(t.total_points, 91.0);
        assert_eq!(t.total_coefficients, 7.0);
        assert_eq!(t.overall_average, 13.0);
        assert!(!t.incomplete);

        let empty = aggregate_report_card(Vec::new()).expect("empty totals");
        assert_eq!(empty.overall_average, 0.0);
        assert!(empty.incomplete);
    }

    #[test]
    fn negative_total_coefficient_is_an_invariant_error() {
        let res = aggregate_report_card(vec![SubjectResult {
            coefficient: -1.0,
            average: 10.0,
            points: -10.0,
        }]);
        assert!(matches!(res, Err(CalcError::Invariant(_))));
    }

    #[test]
    fn zero_coefficient_subject_never_appears_even_with_grades() {
        let key = PeriodKey::new("c1", "2025-2026", 1);
        let evals = vec![eval("e1", "math", 1.0), eval("e2", "philo", 1.0)];
        let s = student("C", vec![grade("e1", Some(14.0)), grade("e2", Some(18.0))]);
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        assert!(card.subjects.iter().all(|e| e.subject_id != "philo"));
        assert_eq!(card.total_coefficients, 5.0);
        assert_eq!(card.overall_average, 14.0);

        // The literary track does count philosophy.
        let s = student("A", vec![grade("e1", Some(14.0)), grade("e2", Some(18.0))]);
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        assert_eq!(card.subjects.len(), 1);
        assert_eq!(card.subjects[0].subject_id, "philo");
    }

    #[test]
    fn card_points_carry_the_unrounded_subject_mean() {
        let key = PeriodKey::new("c1", "2025-2026", 1);
        let evals = vec![
            eval("e1", "math", 1.0),
            eval("e2", "math", 1.0),
            eval("e3", "math", 1.0),
            eval("e4", "french", 1.0),
        ];
        let s = student(
            "C",
            vec![
                grade("e1", Some(13.0)),
                grade("e2", Some(13.0)),
                grade("e3", Some(14.0)),
                grade("e4", Some(12.0)),
            ],
        );
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        let math = card
            .subjects
            .iter()
            .find(|e| e.subject_id == "math")
            .expect("math entry");
        assert_eq!(math.average, 13.33);
        // 40/3 * 5, not 13.33 * 5 = 66.65
        assert_eq!(math.points, 66.67);
        assert_eq!(card.total_points, 90.67);
        assert_eq!(card.total_coefficients, 7.0);
        assert_eq!(card.overall_average, 12.95);
    }

    #[test]
    fn subjects_follow_sort_order_and_skip_ungraded() {
        let key = PeriodKey::new("c1", "2025-2026", 1);
        let evals = vec![
            eval("e1", "math", 2.0),
            eval("e2", "french", 1.0),
            eval("e3", "french", 1.0),
        ];
        let s = student(
            "C",
            vec![grade("e1", Some(12.0)), grade("e2", Some(16.0)), grade("e3", None)],
        );
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        let ids: Vec<&str> = card.subjects.iter().map(|e| e.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["french", "math"]);

        let french = &card.subjects[0];
        assert_eq!(french.average, 16.0);
        assert_eq!(french.points, 32.0);
        assert_eq!(french.evaluations.len(), 2);
        assert_eq!(french.evaluations[1].letter, LetterGrade::Absent);
        assert!(!french.evaluations[1].passing);

        // (32 + 60) / 7
        assert_eq!(card.total_points, 92.0);
        assert_eq!(card.overall_average, 13.14);
        assert_eq!(card.rank, 0);
        assert_eq!(card.class_size, 0);
        assert_eq!(card.status, CardStatus::Draft);
    }

    #[test]
    fn student_with_only_absences_is_incomplete() {
        let key = PeriodKey::new("c1", "2025-2026", 1);
        let evals = vec![eval("e1", "math", 1.0)];
        let s = student("C", vec![grade("e1", None)]);
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        assert!(card.subjects.is_empty());
        assert!(card.incomplete);
        assert_eq!(card.overall_average, 0.0);
    }

    #[test]
    fn cancelled_evaluations_do_not_count() {
        let key = PeriodKey::new("c1", "2025-2026", 1);
        let mut cancelled = eval("e2", "math", 1.0);
        cancelled.status = EvaluationStatus::Cancelled;
        let evals = vec![eval("e1", "math", 1.0), cancelled];
        let s = student("C", vec![grade("e1", Some(10.0)), grade("e2", Some(20.0))]);
        let card = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card");
        assert_eq!(card.subjects[0].average, 10.0);
        assert_eq!(card.subjects[0].evaluations.len(), 1);
    }

    #[test]
    fn building_twice_is_byte_identical() {
        let key = PeriodKey::new("c1", "2025-2026", 2);
        let evals = vec![eval("e1", "math", 1.5), eval("e2", "french", 1.0)];
        let s = student("C", vec![grade("e1", Some(11.25)), grade("e2", Some(17.0))]);
        let a = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card a");
        let b = build_report_card(&key, &subjects(), &evals, &s, &table(), DEFAULT_SCALE)
            .expect("card b");
        assert_eq!(
            serde_json::to_vec(&a).expect("json a"),
            serde_json::to_vec(&b).expect("json b")
        );
    }

    #[test]
    fn evaluation_status_transitions() {
        use EvaluationStatus::*;
        assert_eq!(Planned.transition(Ongoing).expect("planned->ongoing"), Ongoing);
        assert_eq!(Ongoing.transition(Completed).expect("ongoing->completed"), Completed);
        assert_eq!(Completed.transition(Completed).expect("noop"), Completed);
        assert!(Completed.transition(Ongoing).is_err());
        assert!(Cancelled.transition(Planned).is_err());
        assert!(Ongoing.transition(Planned).is_err());
    }
}
