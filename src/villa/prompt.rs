use std::str::FromStr;

use crate::villa::catalog::Step;
use crate::villa::error::VillaError;
use crate::villa::session::{Session, SessionState};

const DETAIL_SUFFIX: &str = "_detail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Label(Step),
    Detail(Step),
}

impl Field {
    fn step(self) -> Step {
        match self {
            Field::Label(step) | Field::Detail(step) => step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Prompt text with `{budget}`-style placeholders, parsed once at startup.
///
/// `{step}` renders the selected option's label and `{step_detail}` its
/// detail text, falling back to the label. Every step must be referenced.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(source: &str) -> Result<Self, VillaError> {
        if source.trim().is_empty() {
            return Err(VillaError::config("prompt template is empty"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        if inner == '{' {
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(VillaError::config(format!(
                            "prompt template has an unclosed placeholder near '{{{name}'"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(parse_field(&name)?));
                }
                '}' => {
                    return Err(VillaError::config(
                        "prompt template has a '}' without a matching '{'",
                    ));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let missing = Step::ALL
            .iter()
            .filter(|step| {
                !segments
                    .iter()
                    .any(|segment| matches!(segment, Segment::Field(field) if field.step() == **step))
            })
            .map(|step| step.key())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(VillaError::config(format!(
                "prompt template does not reference: {}",
                missing.join(", ")
            )));
        }

        Ok(PromptTemplate {
            source: source.to_string(),
            segments,
        })
    }

    /// Renders a completed session. Pure: equal sessions give equal prompts.
    pub fn compose(&self, session: &Session) -> Result<String, VillaError> {
        if session.state != SessionState::Ready {
            return Err(VillaError::IncompleteSession {
                state: session.state,
            });
        }

        let mut prompt = String::with_capacity(self.source.len() + 64);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => prompt.push_str(text),
                Segment::Field(field) => {
                    let option = session.selection(field.step()).ok_or(
                        VillaError::IncompleteSession {
                            state: session.state,
                        },
                    )?;
                    match field {
                        Field::Label(_) => prompt.push_str(&option.label),
                        Field::Detail(_) => prompt.push_str(option.detail_or_label()),
                    }
                }
            }
        }
        Ok(prompt)
    }
}

fn parse_field(name: &str) -> Result<Field, VillaError> {
    let name = name.trim();
    let unknown = || VillaError::config(format!("prompt template has unknown placeholder '{{{name}}}'"));
    match name.strip_suffix(DETAIL_SUFFIX) {
        Some(base) => Step::from_str(base)
            .map(Field::Detail)
            .map_err(|_| unknown()),
        None => Step::from_str(name).map(Field::Label).map_err(|_| unknown()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::villa::catalog::sample_catalog;
    use crate::villa::machine::Conversation;
    use crate::villa::session::SessionStore;

    fn completed_session(choices: [&str; 4]) -> Session {
        let conversation = Conversation::new(SessionStore::new(), Arc::new(sample_catalog()));
        conversation.start(7, 7);
        for (step, value) in Step::ALL.iter().zip(choices) {
            conversation.select(7, *step, value).unwrap();
        }
        conversation.session(7).unwrap()
    }

    #[test]
    fn composes_the_bundled_template() {
        let catalog = sample_catalog();
        let session = completed_session(["$200K-$300K", "Seaside", "Mediterranean", "Orbit"]);
        assert_eq!(
            catalog.template().compose(&session).unwrap(),
            "Mediterranean villa at Seaside, budget $200K-$300K, Orbit camera angle, photorealistic."
        );
    }

    #[test]
    fn compose_is_deterministic() {
        let catalog = sample_catalog();
        let first = completed_session(["$1M+", "Jungle", "Rustic", "Flyover"]);
        let second = completed_session(["$1M+", "Jungle", "Rustic", "Flyover"]);
        assert_eq!(
            catalog.template().compose(&first).unwrap(),
            catalog.template().compose(&second).unwrap()
        );
        assert_eq!(
            catalog.template().compose(&first).unwrap(),
            catalog.template().compose(&first).unwrap()
        );
    }

    #[test]
    fn detail_placeholders_fall_back_to_labels() {
        let template = PromptTemplate::parse(
            "A photorealistic {angle_detail} {budget_detail} {style} villa located at the {location_detail}",
        )
        .unwrap();
        let session = completed_session(["$300K-$500K", "Urban", "Modern", "Top-Down"]);
        assert_eq!(
            template.compose(&session).unwrap(),
            "A photorealistic top-down aerial view of a premium Modern villa located at the Urban"
        );
    }

    #[test]
    fn compose_rejects_unfinished_sessions() {
        let catalog = sample_catalog();
        let conversation = Conversation::new(SessionStore::new(), Arc::new(sample_catalog()));
        conversation.start(1, 1);
        let fresh = conversation.session(1).unwrap();
        assert!(matches!(
            catalog.template().compose(&fresh),
            Err(VillaError::IncompleteSession {
                state: SessionState::AwaitingBudget
            })
        ));

        conversation.select(1, Step::Budget, "$1M+").unwrap();
        conversation.select(1, Step::Location, "Seaside").unwrap();
        conversation.select(1, Step::Style, "Modern").unwrap();
        let almost = conversation.session(1).unwrap();
        assert!(matches!(
            catalog.template().compose(&almost),
            Err(VillaError::IncompleteSession {
                state: SessionState::AwaitingAngle
            })
        ));
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(PromptTemplate::parse("   ").is_err());
        assert!(PromptTemplate::parse("{style} at {location} for {budget} from {angle").is_err());
        assert!(PromptTemplate::parse("{style} at {location} for {budget} from angle}").is_err());
        assert!(PromptTemplate::parse("{style} {location} {budget} {angle} {pool}").is_err());
        let err = PromptTemplate::parse("{style} villa at {location}").unwrap_err();
        assert!(err.to_string().contains("budget"));
        assert!(err.to_string().contains("camera_angle"));
    }
}
