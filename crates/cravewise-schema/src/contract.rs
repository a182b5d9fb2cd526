//! Canonical shape of the coping-plan reply.
//!
//! [`AI_RESPONSE`] is rendered into the outbound `responseSchema` and is also
//! what inbound replies are checked against, so the two can never drift.

use std::fmt;

use serde_json::{json, Map, Value};

use crate::FollowupQuestion;

/// Allowed `type` tags for follow-up questions.
pub const FOLLOWUP_TYPES: &[&str] = &["single", "multi", "text"];

/// Maximum number of options on a follow-up question.
pub const MAX_FOLLOWUP_OPTIONS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub enum Shape {
    String,
    Boolean,
    Enum(&'static [&'static str]),
    Array {
        items: &'static Shape,
        max_items: Option<usize>,
    },
    Object(&'static [Field]),
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub required: bool,
    pub description: Option<&'static str>,
}

const fn required(name: &'static str, shape: Shape) -> Field {
    Field {
        name,
        shape,
        required: true,
        description: None,
    }
}

const fn described(name: &'static str, shape: Shape, description: &'static str) -> Field {
    Field {
        name,
        shape,
        required: true,
        description: Some(description),
    }
}

const STRING_LIST: Shape = Shape::Array {
    items: &Shape::String,
    max_items: None,
};

const PLAN_STEP: Shape = Shape::Object(&[
    required("step", Shape::String),
    required("duration", Shape::String),
    described("why", Shape::String, "Short justification grounded in the user's data"),
]);

const TRIGGER_STRATEGY: Shape = Shape::Object(&[
    required("trigger", Shape::String),
    required("strategy", Shape::String),
]);

const FOLLOWUP_QUESTION: Shape = Shape::Object(&[
    required("id", Shape::String),
    required("type", Shape::Enum(FOLLOWUP_TYPES)),
    required("question", Shape::String),
    Field {
        name: "options",
        shape: Shape::Array {
            items: &Shape::String,
            max_items: Some(MAX_FOLLOWUP_OPTIONS),
        },
        required: false,
        description: None,
    },
]);

const TREND_WARNING: Shape = Shape::Object(&[
    required("is_flagged", Shape::Boolean),
    required("message", Shape::String),
    required("suggested_adjustment", Shape::String),
]);

const CRISIS: Shape = Shape::Object(&[
    required("is_flagged", Shape::Boolean),
    required("message", Shape::String),
    required("hotlines", STRING_LIST),
]);

pub const AI_RESPONSE: Shape = Shape::Object(&[
    required("language", Shape::String),
    described("summary", Shape::String, "1-2 sentences about the current state"),
    described("insight", Shape::String, "A concrete observation from history or feedback"),
    required(
        "plan",
        Shape::Array {
            items: &PLAN_STEP,
            max_items: None,
        },
    ),
    required(
        "if_trigger_then_strategy",
        Shape::Array {
            items: &TRIGGER_STRATEGY,
            max_items: None,
        },
    ),
    described("motivation", Shape::String, "One sentence"),
    described("reflect_question", Shape::String, "One self-reflection question"),
    required(
        "followup_questions",
        Shape::Array {
            items: &FOLLOWUP_QUESTION,
            max_items: None,
        },
    ),
    required("trend_warning", TREND_WARNING),
    required("crisis", CRISIS),
]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    Missing,
    WrongType { expected: &'static str },
    NotAllowed { value: String },
    TooMany { max: usize, found: usize },
    MissingOptions,
}

/// First structural mismatch found, with a JSON-path-like location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {kind}")]
pub struct SchemaViolation {
    pub path: String,
    pub kind: ViolationKind,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "required field missing"),
            Self::WrongType { expected } => write!(f, "expected {expected}"),
            Self::NotAllowed { value } => write!(f, "value {value:?} not allowed"),
            Self::TooMany { max, found } => write!(f, "at most {max} items allowed, found {found}"),
            Self::MissingOptions => write!(f, "choice question without options"),
        }
    }
}

impl Shape {
    /// Render as a Gemini `responseSchema` (OpenAPI subset).
    pub fn to_json_schema(&self) -> Value {
        match self {
            Shape::String => json!({ "type": "STRING" }),
            Shape::Boolean => json!({ "type": "BOOLEAN" }),
            Shape::Enum(values) => json!({ "type": "STRING", "format": "enum", "enum": values }),
            Shape::Array { items, max_items } => {
                let mut schema = json!({ "type": "ARRAY", "items": items.to_json_schema() });
                if let Some(max) = max_items {
                    schema["maxItems"] = json!(max);
                }
                schema
            }
            Shape::Object(fields) => {
                let mut properties = Map::new();
                for field in fields.iter() {
                    let mut prop = field.shape.to_json_schema();
                    if let Some(description) = field.description {
                        prop["description"] = json!(description);
                    }
                    properties.insert(field.name.to_string(), prop);
                }
                let required: Vec<&str> = fields
                    .iter()
                    .filter(|f| f.required)
                    .map(|f| f.name)
                    .collect();
                let ordering: Vec<&str> = fields.iter().map(|f| f.name).collect();
                json!({
                    "type": "OBJECT",
                    "properties": properties,
                    "required": required,
                    "propertyOrdering": ordering,
                })
            }
        }
    }

    /// Check `value` against this shape. Unknown extra fields are ignored.
    pub fn check(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.check_at(value, "$")
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        let wrong = |expected| SchemaViolation {
            path: path.to_string(),
            kind: ViolationKind::WrongType { expected },
        };
        match self {
            Shape::String => value.as_str().map(|_| ()).ok_or_else(|| wrong("string")),
            Shape::Boolean => value.as_bool().map(|_| ()).ok_or_else(|| wrong("boolean")),
            Shape::Enum(allowed) => {
                let s = value.as_str().ok_or_else(|| wrong("string"))?;
                if allowed.contains(&s) {
                    Ok(())
                } else {
                    Err(SchemaViolation {
                        path: path.to_string(),
                        kind: ViolationKind::NotAllowed { value: s.to_string() },
                    })
                }
            }
            Shape::Array { items, max_items } => {
                let arr = value.as_array().ok_or_else(|| wrong("array"))?;
                if let Some(max) = max_items {
                    if arr.len() > *max {
                        return Err(SchemaViolation {
                            path: path.to_string(),
                            kind: ViolationKind::TooMany {
                                max: *max,
                                found: arr.len(),
                            },
                        });
                    }
                }
                for (i, item) in arr.iter().enumerate() {
                    items.check_at(item, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Shape::Object(fields) => {
                let obj = value.as_object().ok_or_else(|| wrong("object"))?;
                for field in fields.iter() {
                    let child = format!("{path}.{}", field.name);
                    match obj.get(field.name) {
                        Some(v) => field.shape.check_at(v, &child)?,
                        None if field.required => {
                            return Err(SchemaViolation {
                                path: child,
                                kind: ViolationKind::Missing,
                            })
                        }
                        None => {}
                    }
                }
                Ok(())
            }
        }
    }
}

/// Rules the structural shape cannot express: choice questions need options.
pub fn check_followup_rules(questions: &[FollowupQuestion]) -> Result<(), SchemaViolation> {
    for (i, question) in questions.iter().enumerate() {
        let needs_options = matches!(
            question,
            FollowupQuestion::Single { .. } | FollowupQuestion::Multi { .. }
        );
        if needs_options && question.options().is_empty() {
            return Err(SchemaViolation {
                path: format!("$.followup_questions[{i}].options"),
                kind: ViolationKind::MissingOptions,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crisis_fallback;

    #[test]
    fn json_schema_lists_every_top_level_field_as_required() {
        let schema = AI_RESPONSE.to_json_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            required,
            vec![
                "language",
                "summary",
                "insight",
                "plan",
                "if_trigger_then_strategy",
                "motivation",
                "reflect_question",
                "followup_questions",
                "trend_warning",
                "crisis"
            ]
        );
        let options = &schema["properties"]["followup_questions"]["items"]["properties"]["options"];
        assert_eq!(options["maxItems"], 4);
        let kinds = &schema["properties"]["followup_questions"]["items"]["properties"]["type"];
        assert_eq!(kinds["enum"], json!(["single", "multi", "text"]));
    }

    #[test]
    fn fallback_conforms_to_contract() {
        let value = serde_json::to_value(crisis_fallback()).unwrap();
        assert_eq!(AI_RESPONSE.check(&value), Ok(()));
    }

    #[test]
    fn missing_nested_field_reports_path() {
        let mut value = serde_json::to_value(crisis_fallback()).unwrap();
        value["crisis"].as_object_mut().unwrap().remove("hotlines");
        let err = AI_RESPONSE.check(&value).unwrap_err();
        assert_eq!(err.path, "$.crisis.hotlines");
        assert_eq!(err.kind, ViolationKind::Missing);
    }

    #[test]
    fn too_many_options_is_a_violation() {
        let mut value = serde_json::to_value(crisis_fallback()).unwrap();
        value["followup_questions"] = json!([{
            "id": "fq_01",
            "type": "single",
            "question": "Which?",
            "options": ["A", "B", "C", "D", "E"]
        }]);
        let err = AI_RESPONSE.check(&value).unwrap_err();
        assert_eq!(err.path, "$.followup_questions[0].options");
        assert_eq!(err.kind, ViolationKind::TooMany { max: 4, found: 5 });
    }

    #[test]
    fn unknown_followup_type_is_a_violation() {
        let mut value = serde_json::to_value(crisis_fallback()).unwrap();
        value["followup_questions"] = json!([{ "id": "q", "type": "scale", "question": "?" }]);
        let err = AI_RESPONSE.check(&value).unwrap_err();
        assert_eq!(err.kind, ViolationKind::NotAllowed { value: "scale".into() });
    }

    #[test]
    fn choice_question_without_options_is_rejected() {
        let questions = vec![FollowupQuestion::Multi {
            id: "fq".into(),
            question: "?".into(),
            options: vec![],
        }];
        assert_eq!(
            check_followup_rules(&questions).unwrap_err().kind,
            ViolationKind::MissingOptions
        );
        let text = vec![FollowupQuestion::Text {
            id: "fq".into(),
            question: "?".into(),
            options: vec![],
        }];
        assert!(check_followup_rules(&text).is_ok());
    }
}
