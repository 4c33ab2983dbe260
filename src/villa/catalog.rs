use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::info;

use crate::villa::error::VillaError;
use crate::villa::prompt::PromptTemplate;

pub const CALLBACK_PREFIX: &str = "villa:";
const TELEGRAM_CALLBACK_DATA_LIMIT: usize = 64;

/// One stage of the villa questionnaire, in the order it is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Budget,
    Location,
    Style,
    Angle,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Budget, Step::Location, Step::Style, Step::Angle];

    /// Stable identifier used in callback data and the catalog file.
    pub fn key(self) -> &'static str {
        match self {
            Step::Budget => "budget",
            Step::Location => "location",
            Step::Style => "style",
            Step::Angle => "camera_angle",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Step::Budget => "Budget",
            Step::Location => "Location",
            Step::Style => "Style",
            Step::Angle => "Camera Angle",
        }
    }

    /// 1-based position in the questionnaire.
    pub fn position(self) -> usize {
        match self {
            Step::Budget => 1,
            Step::Location => 2,
            Step::Style => 3,
            Step::Angle => 4,
        }
    }

    pub fn next(self) -> Option<Step> {
        match self {
            Step::Budget => Some(Step::Location),
            Step::Location => Some(Step::Style),
            Step::Style => Some(Step::Angle),
            Step::Angle => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Step {
    type Err = VillaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "budget" => Ok(Step::Budget),
            "location" => Ok(Step::Location),
            "style" => Ok(Step::Style),
            "angle" | "camera_angle" | "camera-angle" => Ok(Step::Angle),
            other => Err(VillaError::config(format!("unknown step '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VillaOption {
    pub label: String,
    pub value: String,
    pub detail: Option<String>,
}

impl VillaOption {
    pub fn detail_or_label(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Debug, Clone)]
pub struct StepCatalog {
    pub question: String,
    pub options: Vec<VillaOption>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    template: String,
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
struct StepEntry {
    step: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    options: Vec<OptionEntry>,
}

#[derive(Debug, Deserialize)]
struct OptionEntry {
    label: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Option lists for every step plus the prompt template. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Catalog {
    budget: StepCatalog,
    location: StepCatalog,
    style: StepCatalog,
    angle: StepCatalog,
    template: PromptTemplate,
}

pub fn callback_data(step: Step, value: &str) -> String {
    format!("{CALLBACK_PREFIX}{}|{}", step.key(), value)
}

/// Splits `villa:<step>|<value>` into its step key and value.
pub fn parse_callback_data(data: &str) -> Option<(&str, &str)> {
    data.strip_prefix(CALLBACK_PREFIX)?.split_once('|')
}

impl Catalog {
    pub fn from_path(path: &Path) -> Result<Self, VillaError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            VillaError::config(format!(
                "failed to read villa catalog at {}: {}",
                path.display(),
                err
            ))
        })?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let catalog = if is_yaml {
            Catalog::from_yaml_str(&raw)?
        } else {
            Catalog::from_json_str(&raw)?
        };
        info!(
            "Loaded villa catalog from {} ({} options)",
            path.display(),
            Step::ALL
                .iter()
                .map(|step| catalog.options_for(*step).len())
                .sum::<usize>()
        );
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, VillaError> {
        let file: CatalogFile = serde_json::from_str(raw)
            .map_err(|err| VillaError::config(format!("malformed villa catalog JSON: {err}")))?;
        Catalog::build(file)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, VillaError> {
        let file: CatalogFile = serde_yaml::from_str(raw)
            .map_err(|err| VillaError::config(format!("malformed villa catalog YAML: {err}")))?;
        Catalog::build(file)
    }

    fn build(file: CatalogFile) -> Result<Self, VillaError> {
        let mut budget = None;
        let mut location = None;
        let mut style = None;
        let mut angle = None;

        for entry in file.steps {
            let step = Step::from_str(&entry.step)?;
            let slot = match step {
                Step::Budget => &mut budget,
                Step::Location => &mut location,
                Step::Style => &mut style,
                Step::Angle => &mut angle,
            };
            if slot.is_some() {
                return Err(VillaError::config(format!(
                    "step '{}' is defined more than once",
                    step.key()
                )));
            }
            *slot = Some(build_step(step, entry)?);
        }

        let missing = [
            (Step::Budget, budget.is_none()),
            (Step::Location, location.is_none()),
            (Step::Style, style.is_none()),
            (Step::Angle, angle.is_none()),
        ]
        .into_iter()
        .filter(|(_, is_missing)| *is_missing)
        .map(|(step, _)| step.key())
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(VillaError::config(format!(
                "villa catalog is missing steps: {}",
                missing.join(", ")
            )));
        }

        let template = PromptTemplate::parse(&file.template)?;

        match (budget, location, style, angle) {
            (Some(budget), Some(location), Some(style), Some(angle)) => Ok(Catalog {
                budget,
                location,
                style,
                angle,
                template,
            }),
            _ => Err(VillaError::config("villa catalog is incomplete")),
        }
    }

    pub fn step(&self, step: Step) -> &StepCatalog {
        match step {
            Step::Budget => &self.budget,
            Step::Location => &self.location,
            Step::Style => &self.style,
            Step::Angle => &self.angle,
        }
    }

    pub fn options_for(&self, step: Step) -> &[VillaOption] {
        &self.step(step).options
    }

    #[allow(dead_code)]
    pub fn options_for_key(&self, step_key: &str) -> Result<&[VillaOption], VillaError> {
        let step = Step::from_str(step_key)?;
        Ok(self.options_for(step))
    }

    pub fn question(&self, step: Step) -> &str {
        &self.step(step).question
    }

    pub fn find(&self, step: Step, value: &str) -> Option<&VillaOption> {
        self.options_for(step)
            .iter()
            .find(|option| option.value == value)
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }
}

fn build_step(step: Step, entry: StepEntry) -> Result<StepCatalog, VillaError> {
    if entry.options.is_empty() {
        return Err(VillaError::config(format!(
            "step '{}' has no options",
            step.key()
        )));
    }

    let mut seen = HashSet::new();
    let mut options = Vec::with_capacity(entry.options.len());
    for option in entry.options {
        let label = option.label.trim().to_string();
        if label.is_empty() {
            return Err(VillaError::config(format!(
                "step '{}' has an option with an empty label",
                step.key()
            )));
        }

        let value = option
            .value
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| label.clone());
        if value.is_empty() {
            return Err(VillaError::config(format!(
                "option '{}' of step '{}' has an empty value",
                label,
                step.key()
            )));
        }
        if !seen.insert(value.clone()) {
            return Err(VillaError::config(format!(
                "step '{}' lists value '{}' more than once",
                step.key(),
                value
            )));
        }
        if callback_data(step, &value).len() > TELEGRAM_CALLBACK_DATA_LIMIT {
            return Err(VillaError::config(format!(
                "value '{}' of step '{}' does not fit in Telegram callback data",
                value,
                step.key()
            )));
        }

        let detail = option
            .detail
            .map(|detail| detail.trim().to_string())
            .filter(|detail| !detail.is_empty());
        options.push(VillaOption {
            label,
            value,
            detail,
        });
    }

    let question = entry
        .question
        .map(|question| question.trim().to_string())
        .filter(|question| !question.is_empty())
        .unwrap_or_else(|| format!("Choose a {}:", step.label().to_lowercase()));

    Ok(StepCatalog { question, options })
}

#[cfg(test)]
pub(crate) fn sample_catalog() -> Catalog {
    Catalog::from_json_str(include_str!("../../villa_catalog.json"))
        .expect("bundled catalog should be valid")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TEMPLATE: &str = "{style} villa at {location}, budget {budget}, {angle} camera angle";

    fn catalog_json(steps: &str) -> String {
        format!(r#"{{ "template": "{TEMPLATE}", "steps": [{steps}] }}"#)
    }

    fn step_json(step: &str, options: &str) -> String {
        format!(r#"{{ "step": "{step}", "options": [{options}] }}"#)
    }

    fn all_steps() -> Vec<String> {
        vec![
            step_json("budget", r#"{ "label": "$1M+" }"#),
            step_json("location", r#"{ "label": "Seaside" }"#),
            step_json("style", r#"{ "label": "Modern" }"#),
            step_json("camera_angle", r#"{ "label": "Orbit" }"#),
        ]
    }

    #[test]
    fn bundled_catalog_keeps_option_order() {
        let catalog = sample_catalog();
        let budgets = catalog
            .options_for(Step::Budget)
            .iter()
            .map(|option| option.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            budgets,
            vec![
                "$100K-$200K",
                "$200K-$300K",
                "$300K-$500K",
                "$500K-$750K",
                "$750K-$1M",
                "$1M+"
            ]
        );
        assert_eq!(catalog.options_for(Step::Angle)[0].label, "Orbit");
        assert_eq!(
            catalog.question(Step::Location),
            "Where would you like your villa to be located?"
        );
    }

    #[test]
    fn value_defaults_to_label() {
        let catalog = sample_catalog();
        let seaside = catalog.find(Step::Location, "Seaside").unwrap();
        assert_eq!(seaside.label, "Seaside");
        assert!(catalog.find(Step::Location, "seaside").is_none());
    }

    #[test]
    fn options_for_key_rejects_unknown_step() {
        let catalog = sample_catalog();
        assert_eq!(catalog.options_for_key("angle").unwrap().len(), 5);
        assert!(matches!(
            catalog.options_for_key("roof"),
            Err(VillaError::Config(_))
        ));
    }

    #[test]
    fn step_parsing_accepts_aliases() {
        assert_eq!("Budget".parse::<Step>().unwrap(), Step::Budget);
        assert_eq!("Angle".parse::<Step>().unwrap(), Step::Angle);
        assert_eq!("camera_angle".parse::<Step>().unwrap(), Step::Angle);
        assert!("pool".parse::<Step>().is_err());
    }

    #[test]
    fn step_order_is_fixed() {
        let mut order = vec![Step::Budget];
        while let Some(next) = order.last().and_then(|step| step.next()) {
            order.push(next);
        }
        assert_eq!(order, Step::ALL.to_vec());
    }

    #[test]
    fn rejects_missing_step() {
        let steps = all_steps()[..3].join(",");
        let err = Catalog::from_json_str(&catalog_json(&steps)).unwrap_err();
        assert!(err.to_string().contains("camera_angle"));
    }

    #[test]
    fn rejects_duplicate_step() {
        let mut steps = all_steps();
        steps.push(step_json("budget", r#"{ "label": "$100K" }"#));
        let err = Catalog::from_json_str(&catalog_json(&steps.join(","))).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_empty_options_and_duplicate_values() {
        let mut steps = all_steps();
        steps[1] = step_json("location", "");
        assert!(Catalog::from_json_str(&catalog_json(&steps.join(","))).is_err());

        let mut steps = all_steps();
        steps[2] = step_json(
            "style",
            r#"{ "label": "Modern" }, { "label": "Modern Too", "value": "Modern" }"#,
        );
        let err = Catalog::from_json_str(&catalog_json(&steps.join(","))).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_oversized_callback_values() {
        let mut steps = all_steps();
        let long_label = "x".repeat(60);
        steps[0] = step_json("budget", &format!(r#"{{ "label": "{long_label}" }}"#));
        let err = Catalog::from_json_str(&catalog_json(&steps.join(","))).unwrap_err();
        assert!(err.to_string().contains("callback data"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Catalog::from_json_str("{ not json"),
            Err(VillaError::Config(_))
        ));
    }

    #[test]
    fn loads_yaml_catalog_from_disk() {
        let yaml = format!(
            "template: \"{TEMPLATE}\"\nsteps:\n  - step: budget\n    options:\n      - label: \"$1M+\"\n        value: elite\n  - step: location\n    question: Where?\n    options:\n      - label: Jungle\n  - step: style\n    options:\n      - label: Minimalist\n  - step: angle\n    options:\n      - label: Flyover\n"
        );
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let catalog = Catalog::from_path(file.path()).unwrap();
        assert_eq!(catalog.find(Step::Budget, "elite").unwrap().label, "$1M+");
        assert_eq!(catalog.question(Step::Location), "Where?");
        assert_eq!(catalog.question(Step::Style), "Choose a style:");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Catalog::from_path(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(VillaError::Config(_))));
    }

    #[test]
    fn callback_data_round_trips_through_parser() {
        let data = callback_data(Step::Budget, "$200K-$300K");
        assert_eq!(data, "villa:budget|$200K-$300K");
        assert_eq!(parse_callback_data(&data), Some(("budget", "$200K-$300K")));
        assert_eq!(parse_callback_data("image_res:abc|2K"), None);
    }
}
