use serde::{Deserialize, Serialize};
use serde_json::json;

/// Letter grades in descending order of merit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    O,
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::O => "O",
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
        }
    }
}

/// Percentage-to-grade bands, descending; first cutoff at or below the
/// percentage wins. The final F band catches everything below 40, so every
/// percentage in [0,100] maps to exactly one row.
pub const GRADE_BANDS: [(f64, Grade, i64); 8] = [
    (90.0, Grade::O, 10),
    (80.0, Grade::APlus, 9),
    (70.0, Grade::A, 8),
    (60.0, Grade::BPlus, 7),
    (50.0, Grade::B, 6),
    (45.0, Grade::C, 5),
    (40.0, Grade::D, 4),
    (f64::NEG_INFINITY, Grade::F, 0),
];

const REMARK_BANDS: [(f64, &str); 6] = [
    (90.0, "Outstanding performance!"),
    (80.0, "Excellent performance!"),
    (70.0, "Good performance!"),
    (60.0, "Satisfactory performance."),
    (50.0, "Average performance."),
    (f64::NEG_INFINITY, "Needs improvement."),
];

pub fn grade_for_percentage(percentage: f64) -> (Grade, i64) {
    for &(cutoff, grade, point) in &GRADE_BANDS {
        if percentage >= cutoff {
            return (grade, point);
        }
    }
    (Grade::F, 0)
}

pub fn remarks_for_percentage(percentage: f64) -> &'static str {
    for &(cutoff, text) in &REMARK_BANDS {
        if percentage >= cutoff {
            return text;
        }
    }
    "Needs improvement."
}

pub const THEORY_MAX: f64 = 70.0;
pub const INTERNAL_MAX: f64 = 20.0;
pub const PRACTICAL_MAX: f64 = 10.0;
pub const SUBJECT_TOTAL_MARKS: f64 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ValidationError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn for_subject(
        code: &str,
        index: usize,
        subject_name: &str,
        field: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(json!({
                "subjectIndex": index,
                "subjectName": subject_name,
                "field": field,
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Marks {
    #[serde(default)]
    pub theory: f64,
    #[serde(default)]
    pub internal: f64,
    #[serde(default)]
    pub practical: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInput {
    pub subject_name: String,
    pub marks: Marks,
    pub credit: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectComputed {
    pub subject_name: String,
    pub marks: Marks,
    pub total_marks: f64,
    pub obtained_marks: f64,
    pub credit: f64,
    pub grade: Grade,
    pub grade_point: i64,
    pub result: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub subjects: Vec<SubjectComputed>,
    pub total_credits: f64,
    pub total_marks: f64,
    pub obtained_marks: f64,
    pub percentage: f64,
    pub cgpa: f64,
    pub result: Outcome,
    pub remarks: String,
}

/// Decode the wire form of a subject list. A mark component that is absent
/// or null counts as 0 (0 is a valid score); any present value must be a
/// number. Domain checks (ranges, credit sign) happen in `compute_result`.
pub fn parse_subjects(raw: Option<&serde_json::Value>) -> Result<Vec<SubjectInput>, ValidationError> {
    let Some(raw) = raw else {
        return Err(ValidationError::new("bad_params", "missing subjects"));
    };
    let Some(items) = raw.as_array() else {
        return Err(ValidationError::new("bad_params", "subjects must be an array"));
    };

    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(ValidationError::new(
                "bad_params",
                format!("subject #{}: must be an object", index + 1),
            ));
        };

        let subject_name = match obj.get("subjectName") {
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(ValidationError::new(
                        "bad_params",
                        format!("subject #{}: subjectName must be a string", index + 1),
                    ));
                };
                s.trim().to_string()
            }
            None => {
                return Err(ValidationError::new(
                    "bad_params",
                    format!("subject #{}: missing subjectName", index + 1),
                ))
            }
        };

        let Some(marks_raw) = obj.get("marks") else {
            return Err(ValidationError::for_subject(
                "bad_params",
                index,
                &subject_name,
                "marks",
                format!("subject #{}: missing marks object", index + 1),
            ));
        };
        let Some(marks_obj) = marks_raw.as_object() else {
            return Err(ValidationError::for_subject(
                "bad_params",
                index,
                &subject_name,
                "marks",
                format!("subject #{}: marks must be an object", index + 1),
            ));
        };

        let component = |field: &str| -> Result<f64, ValidationError> {
            match marks_obj.get(field) {
                None => Ok(0.0),
                Some(v) if v.is_null() => Ok(0.0),
                Some(v) => v.as_f64().ok_or_else(|| {
                    ValidationError::for_subject(
                        "bad_params",
                        index,
                        &subject_name,
                        field,
                        format!("subject #{}: marks.{} must be a number", index + 1, field),
                    )
                }),
            }
        };
        let marks = Marks {
            theory: component("theory")?,
            internal: component("internal")?,
            practical: component("practical")?,
        };

        let credit = match obj.get("credit") {
            Some(v) => v.as_f64().ok_or_else(|| {
                ValidationError::for_subject(
                    "bad_params",
                    index,
                    &subject_name,
                    "credit",
                    format!("subject #{}: credit must be a number", index + 1),
                )
            })?,
            None => {
                return Err(ValidationError::for_subject(
                    "bad_params",
                    index,
                    &subject_name,
                    "credit",
                    format!("subject #{}: missing credit", index + 1),
                ))
            }
        };

        out.push(SubjectInput {
            subject_name,
            marks,
            credit,
        });
    }

    Ok(out)
}

fn check_mark_range(
    index: usize,
    subject_name: &str,
    field: &str,
    value: f64,
    max: f64,
) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(ValidationError::for_subject(
            "out_of_range",
            index,
            subject_name,
            field,
            format!(
                "subject '{}': {} marks must be between 0 and {}",
                subject_name, field, max
            ),
        ));
    }
    Ok(())
}

fn validate_subject(index: usize, subject: &SubjectInput) -> Result<(), ValidationError> {
    if subject.subject_name.trim().is_empty() {
        return Err(ValidationError::for_subject(
            "invalid_subject",
            index,
            &subject.subject_name,
            "subjectName",
            format!("subject #{}: subjectName must not be empty", index + 1),
        ));
    }
    if !subject.credit.is_finite() || subject.credit < 0.0 {
        return Err(ValidationError::for_subject(
            "invalid_subject",
            index,
            &subject.subject_name,
            "credit",
            format!(
                "subject '{}': credit must be a non-negative number",
                subject.subject_name
            ),
        ));
    }
    check_mark_range(index, &subject.subject_name, "theory", subject.marks.theory, THEORY_MAX)?;
    check_mark_range(
        index,
        &subject.subject_name,
        "internal",
        subject.marks.internal,
        INTERNAL_MAX,
    )?;
    check_mark_range(
        index,
        &subject.subject_name,
        "practical",
        subject.marks.practical,
        PRACTICAL_MAX,
    )?;
    Ok(())
}

/// Grade a semester's subject list and derive the whole-result aggregates.
///
/// Pure and deterministic: the output is a function of the input list alone,
/// so re-running it on save always reproduces the same aggregates. All
/// preconditions are checked up front; no partial summary is ever returned.
pub fn compute_result(subjects: &[SubjectInput]) -> Result<ResultSummary, ValidationError> {
    if subjects.is_empty() {
        return Err(ValidationError::new(
            "empty_subjects",
            "at least one subject is required",
        ));
    }
    for (index, subject) in subjects.iter().enumerate() {
        validate_subject(index, subject)?;
    }

    let mut computed: Vec<SubjectComputed> = Vec::with_capacity(subjects.len());
    let mut total_credits = 0.0_f64;
    let mut obtained_total = 0.0_f64;

    for subject in subjects {
        let obtained = subject.marks.theory + subject.marks.internal + subject.marks.practical;
        // Per-subject total is fixed at 100, so the subject percentage is
        // numerically the obtained marks.
        let (grade, grade_point) = grade_for_percentage(obtained);
        let result = if grade == Grade::F {
            Outcome::Fail
        } else {
            Outcome::Pass
        };

        total_credits += subject.credit;
        obtained_total += obtained;

        computed.push(SubjectComputed {
            subject_name: subject.subject_name.clone(),
            marks: subject.marks,
            total_marks: SUBJECT_TOTAL_MARKS,
            obtained_marks: obtained,
            credit: subject.credit,
            grade,
            grade_point,
            result,
        });
    }

    let total_marks = (subjects.len() as f64) * SUBJECT_TOTAL_MARKS;
    let percentage = obtained_total / total_marks * 100.0;

    // CGPA is the aggregate percentage banded once, not a credit-weighted
    // average of subject points.
    let (overall_grade, overall_point) = grade_for_percentage(percentage);
    let any_subject_failed = computed.iter().any(|s| s.result == Outcome::Fail);
    let result = if overall_grade == Grade::F || any_subject_failed {
        Outcome::Fail
    } else {
        Outcome::Pass
    };

    Ok(ResultSummary {
        subjects: computed,
        total_credits,
        total_marks,
        obtained_marks: obtained_total,
        percentage,
        cgpa: overall_point as f64,
        result,
        remarks: remarks_for_percentage(percentage).to_string(),
    })
}
