//! Stages of the transformation pipeline and their prompt templates.
//!
//! Domain logic only: rendering a stage prompt never touches a backend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gateway::{Attribution, Example, GenerateRequest};

// =============================================================================
// Stage identifiers
// =============================================================================

/// One named step of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    /// Extract and structure the raw request.
    PrimaMateria,
    /// Loosen structure into natural language.
    Solutio,
    /// Condense into the final, precise form.
    Coagulatio,
    /// Caller-defined stage rendered with the generic template.
    Custom(String),
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::PrimaMateria => "prima-materia",
            Stage::Solutio => "solutio",
            Stage::Coagulatio => "coagulatio",
            Stage::Custom(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "prima-materia" => Stage::PrimaMateria,
            "solutio" => Stage::Solutio,
            "coagulatio" => Stage::Coagulatio,
            _ => Stage::Custom(name.trim().to_string()),
        }
    }

    pub fn template(&self) -> &'static StageTemplate {
        match self {
            Stage::PrimaMateria => &PRIMA_MATERIA,
            Stage::Solutio => &SOLUTIO,
            Stage::Coagulatio => &COAGULATIO,
            Stage::Custom(_) => &GENERIC,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Stage {
    fn from(s: String) -> Self {
        Stage::parse(&s)
    }
}

impl From<Stage> for String {
    fn from(s: Stage) -> Self {
        s.as_str().to_string()
    }
}

/// The fixed three-stage sequence used when a request names no stages.
pub fn default_stages() -> Vec<Stage> {
    vec![Stage::PrimaMateria, Stage::Solutio, Stage::Coagulatio]
}

// =============================================================================
// Prompt templates
// =============================================================================

const BASE_SYSTEM: &str = "You are an expert prompt engineer who turns rough requests into prompts that language models follow precisely.";

/// A stage prompt template. `{{INPUT}}` is replaced with the stage input.
#[derive(Debug, Clone, Copy)]
pub struct StageTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

pub const PRIMA_MATERIA: StageTemplate = StageTemplate {
    slug: "prima-materia",
    system: "Your task is to analyse the request and produce a comprehensive, well-structured prompt that states the goal, the constraints, and the expected output.",
    user: "Analyse the following request and write a complete, well-organised prompt for it.

Request:
{{INPUT}}

Requirements:
- State the task and its purpose explicitly
- List constraints and edge cases the answer must handle
- Describe the expected output format",
};

pub const SOLUTIO: StageTemplate = StageTemplate {
    slug: "solutio",
    system: "Your task is to rewrite prompts into natural, conversational language while keeping every requirement intact.",
    user: "Rewrite the prompt below so it reads naturally and engagingly.

Prompt:
{{INPUT}}

Requirements:
- Replace rigid structure with flowing prose
- Keep every constraint from the original
- Address the reader directly",
};

pub const COAGULATIO: StageTemplate = StageTemplate {
    slug: "coagulatio",
    system: "Your task is to condense prompts into their most precise and token-efficient form.",
    user: "Condense the prompt below into its most precise form.

Prompt:
{{INPUT}}

Requirements:
- Remove redundancy and filler
- Keep every requirement and constraint
- Prefer short, unambiguous sentences",
};

pub const GENERIC: StageTemplate = StageTemplate {
    slug: "generic",
    system: "Your task is to improve the prompt you are given for the stated stage.",
    user: "Improve the following prompt.

Prompt:
{{INPUT}}",
};

/// Everything a stage needs to render its request.
#[derive(Debug, Clone, Default)]
pub struct StagePromptOptions<'a> {
    pub context: &'a [String],
    pub persona: Option<&'a str>,
    pub examples: &'a [Example],
}

impl StageTemplate {
    pub fn render_system(&self, stage: &Stage, persona: Option<&str>) -> String {
        let mut system = format!("{BASE_SYSTEM} {}", self.system);
        if let Stage::Custom(name) = stage {
            system.push_str(&format!(" The current stage is \"{name}\"."));
        }
        if let Some(persona) = persona.map(str::trim).filter(|p| !p.is_empty()) {
            system.push_str(&format!(" Write as {persona}."));
        }
        system
    }

    pub fn render_user(&self, input: &str, context: &[String]) -> String {
        let mut content = self.user.replace("{{INPUT}}", input);
        let context: Vec<&str> = context
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        if !context.is_empty() {
            content.push_str("\n\nAdditional Context:\n");
            for ctx in context {
                content.push_str("- ");
                content.push_str(ctx);
                content.push('\n');
            }
        }
        content
    }
}

/// Build the backend request for one stage call.
pub fn build_stage_request(
    stage: &Stage,
    input: &str,
    opts: &StagePromptOptions<'_>,
    temperature: f32,
    max_tokens: u32,
    attribution: Attribution,
) -> GenerateRequest {
    let template = stage.template();
    GenerateRequest::new(template.render_user(input, opts.context), attribution)
        .system(template.render_system(stage, opts.persona))
        .examples(opts.examples.to_vec())
        .temperature(temperature)
        .max_tokens(max_tokens)
}

// =============================================================================
// Scoring profiles
// =============================================================================

/// Per-stage targets the ranking engine scores against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageProfile {
    pub ideal_temperature: f32,
    /// Distance from the ideal at which temperature-fit reaches zero.
    pub temperature_spread: f32,
    /// Target fraction of `max_tokens` actually used.
    pub target_utilization: f32,
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for StageProfile {
    fn default() -> Self {
        Self {
            ideal_temperature: 0.7,
            temperature_spread: 0.7,
            target_utilization: 0.6,
            min_chars: 100,
            max_chars: 2000,
        }
    }
}

impl StageProfile {
    pub fn for_stage(stage: &Stage) -> Self {
        match stage {
            Stage::PrimaMateria => Self {
                ideal_temperature: 0.7,
                min_chars: 200,
                max_chars: 2500,
                ..Self::default()
            },
            Stage::Solutio => Self {
                ideal_temperature: 0.8,
                temperature_spread: 0.8,
                ..Self::default()
            },
            Stage::Coagulatio => Self {
                ideal_temperature: 0.4,
                temperature_spread: 0.6,
                target_utilization: 0.4,
                min_chars: 80,
                max_chars: 1200,
            },
            Stage::Custom(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_round_trip() {
        for stage in default_stages() {
            assert_eq!(Stage::parse(stage.as_str()), stage);
        }
        assert_eq!(Stage::parse("Prima_Materia"), Stage::PrimaMateria);
        assert_eq!(Stage::parse("review"), Stage::Custom("review".into()));
    }

    #[test]
    fn context_block_is_appended() {
        let ctx = vec!["audience: developers".to_string(), "  ".to_string()];
        let user = SOLUTIO.render_user("do x", &ctx);
        assert!(user.contains("do x"));
        assert!(user.ends_with("Additional Context:\n- audience: developers\n"));
    }

    #[test]
    fn persona_and_custom_name_reach_system_prompt() {
        let stage = Stage::Custom("review".into());
        let system = stage.template().render_system(&stage, Some("a senior engineer"));
        assert!(system.contains("\"review\""));
        assert!(system.ends_with("Write as a senior engineer."));
    }
}
