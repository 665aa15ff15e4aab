//! Plan text parser: lifts a [`Plan`] out of a `[PLAN]` block.
//!
//! The accepted shape:
//!
//! ```text
//! [PLAN]
//! ## Workflow: <name>
//! <description lines>
//! ### Step 1: <description>
//! - Agent: <agent_id>
//! - Tool: <tool>
//! - Arguments: {"key": "value"}
//! - Dependencies: none | Step 2, Step 3
//! - Estimated Time: 30s | 5m | 1h
//! ## Total Estimated Time: 6m
//! ## Cost Estimate: $0.12
//! [/PLAN]
//! ```
//!
//! Parsing is two-pass: pass one assigns every step a fresh UUID keyed by
//! its declared number, pass two resolves `Step N` references against that
//! map, so forward references work. A body that does not satisfy the
//! grammar yields `None`; malformed plans are never an error.

use super::{Plan, PlanStep, StepStatus};
use regex::Regex;
use std::collections::HashMap;
use uuid::Uuid;

/// Parse at most one plan out of `text`.
///
/// Accepts either a bare plan body or one still wrapped in
/// `[PLAN]`/`[/PLAN]` tags.
pub fn parse_plan(text: &str) -> Option<Plan> {
    let body = strip_tags(text);

    let header_re = Regex::new(r"(?m)^##\s*Workflow:\s*(.+)$").unwrap();
    let header = header_re.captures(body)?;
    let name = header[1].trim().to_string();
    let header_end = header.get(0).unwrap().end();

    let step_re = Regex::new(r"(?m)^###\s*Step\s+(\d+):\s*(.+)$").unwrap();
    let headings: Vec<(usize, usize, u32, String)> = step_re
        .captures_iter(body)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            (
                whole.start(),
                whole.end(),
                caps[1].parse::<u32>().unwrap_or(0),
                caps[2].trim().to_string(),
            )
        })
        .collect();

    if headings.is_empty() {
        return None;
    }

    // Free text between the header and the first step is the description.
    let description = if headings[0].0 > header_end {
        body[header_end..headings[0].0]
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        String::new()
    };

    // Pass 1: build steps with fresh ids, remembering raw dependency lists.
    let mut steps = Vec::with_capacity(headings.len());
    let mut ids_by_number: HashMap<u32, Uuid> = HashMap::new();
    let mut raw_deps: Vec<String> = Vec::with_capacity(headings.len());

    for (i, (_, fields_start, number, step_description)) in headings.iter().enumerate() {
        let fields_end = headings
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(body.len());
        let fields = &body[*fields_start..fields_end];

        let agent_id = field(fields, "Agent")?;
        let tool = field(fields, "Tool")?;
        let arguments: serde_json::Value =
            serde_json::from_str(field(fields, "Arguments")?.trim()).ok()?;
        if !arguments.is_object() {
            return None;
        }

        let estimated_seconds = match field(fields, "Estimated Time") {
            Some(raw) => parse_duration(&raw)?,
            None => 0,
        };

        let id = Uuid::new_v4();
        if ids_by_number.insert(*number, id).is_some() {
            // duplicate step numbers make references ambiguous
            return None;
        }

        raw_deps.push(field(fields, "Dependencies").unwrap_or_default());
        steps.push(PlanStep {
            id,
            order_hint: *number,
            description: step_description.clone(),
            agent_id,
            tool,
            arguments,
            dependencies: Vec::new(),
            estimated_seconds,
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            started_at: None,
            finished_at: None,
        });
    }

    // Pass 2: resolve "Step N" references, forward ones included.
    let dep_re = Regex::new(r"Step\s+(\d+)").unwrap();
    for (step, raw) in steps.iter_mut().zip(&raw_deps) {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
            continue;
        }
        for caps in dep_re.captures_iter(raw) {
            let number: u32 = caps[1].parse().ok()?;
            let id = *ids_by_number.get(&number)?;
            if !step.dependencies.contains(&id) {
                step.dependencies.push(id);
            }
        }
        if step.dependencies.is_empty() {
            // a non-"none" list that resolved nothing is malformed
            return None;
        }
    }

    let mut plan = Plan::new(name, description);
    plan.steps = steps;
    Some(plan)
}

/// Pull the `[PLAN]`-wrapped body out of `text`, or use `text` whole.
fn strip_tags(text: &str) -> &str {
    if let Some(open) = text.find("[PLAN]") {
        if let Some(close) = text.rfind("[/PLAN]") {
            if open + "[PLAN]".len() <= close {
                return &text[open + "[PLAN]".len()..close];
            }
        }
    }
    text
}

/// Read a `- Name: value` bullet from a step block.
fn field(fields: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?m)^-\s*{}:\s*(.+)$", regex::escape(name))).unwrap();
    re.captures(fields).map(|caps| caps[1].trim().to_string())
}

/// Normalise `30s` / `5m` / `1h` to seconds.
fn parse_duration(raw: &str) -> Option<u64> {
    let re = Regex::new(r"^(\d+)\s*([smh])$").unwrap();
    let caps = re.captures(raw.trim())?;
    let amount: u64 = caps[1].parse().ok()?;
    let unit = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return None,
    };
    Some(amount * unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[PLAN]
## Workflow: Refresh fixtures
Regenerate the fixture files and verify the directory.

### Step 1: Write the fixture
- Agent: implementer
- Tool: write_file_tool
- Arguments: {"path": "work/fixture.txt", "content": "x"}
- Dependencies: none
- Estimated Time: 30s

### Step 2: Verify the directory
- Agent: tester
- Tool: list_files_tool
- Arguments: {"directory": "work"}
- Dependencies: Step 1
- Estimated Time: 5m

## Total Estimated Time: 6m
## Cost Estimate: $0.04
[/PLAN]"#;

    #[test]
    fn parses_the_sample_plan() {
        let plan = parse_plan(SAMPLE).unwrap();

        assert_eq!(plan.name, "Refresh fixtures");
        assert!(plan.description.contains("Regenerate"));
        assert_eq!(plan.steps.len(), 2);

        let first = &plan.steps[0];
        assert_eq!(first.agent_id, "implementer");
        assert_eq!(first.tool, "write_file_tool");
        assert_eq!(first.arguments["path"], "work/fixture.txt");
        assert!(first.dependencies.is_empty());
        assert_eq!(first.estimated_seconds, 30);

        let second = &plan.steps[1];
        assert_eq!(second.dependencies, vec![first.id]);
        assert_eq!(second.estimated_seconds, 300);
        assert_eq!(plan.total_estimated_seconds(), 330);
    }

    #[test]
    fn works_without_the_tag_wrapper() {
        let bare = SAMPLE
            .trim_start_matches("[PLAN]")
            .trim_end_matches("[/PLAN]");
        assert!(parse_plan(bare).is_some());
    }

    #[test]
    fn forward_references_resolve() {
        let text = r#"
## Workflow: Backwards
### Step 1: Later
- Agent: main
- Tool: list_files_tool
- Arguments: {"directory": "."}
- Dependencies: Step 2
### Step 2: Earlier
- Agent: main
- Tool: list_files_tool
- Arguments: {"directory": "."}
- Dependencies: none
"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps[0].dependencies, vec![plan.steps[1].id]);
    }

    #[test]
    fn each_reference_maps_to_the_declared_step() {
        let plan = parse_plan(SAMPLE).unwrap();
        // Step 2's single reference is exactly step 1's id and nothing else
        let referenced = &plan.steps[1].dependencies;
        assert_eq!(referenced.len(), 1);
        assert_eq!(referenced[0], plan.steps[0].id);
        assert_ne!(referenced[0], plan.steps[1].id);
    }

    #[test]
    fn unknown_tool_and_agent_are_kept_verbatim() {
        let text = r#"
## Workflow: Odd
### Step 1: Strange
- Agent: wizard
- Tool: cast_spell
- Arguments: {}
"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps[0].agent_id, "wizard");
        assert_eq!(plan.steps[0].tool, "cast_spell");
        // validation, not parsing, rejects them
        assert!(!plan.validate(&["main".to_string()]).is_empty());
    }

    #[test]
    fn malformed_bodies_yield_none() {
        assert!(parse_plan("no plan here").is_none());
        assert!(parse_plan("## Workflow: Empty\nno steps follow").is_none());

        // arguments must be a JSON object
        let bad_args = r#"
## Workflow: Bad
### Step 1: x
- Agent: main
- Tool: list_files_tool
- Arguments: not json
"#;
        assert!(parse_plan(bad_args).is_none());

        // a reference to a step that does not exist
        let bad_ref = r#"
## Workflow: Bad
### Step 1: x
- Agent: main
- Tool: list_files_tool
- Arguments: {}
- Dependencies: Step 9
"#;
        assert!(parse_plan(bad_ref).is_none());
    }

    #[test]
    fn durations_normalise_to_seconds() {
        assert_eq!(parse_duration("45s"), Some(45));
        assert_eq!(parse_duration("5m"), Some(300));
        assert_eq!(parse_duration("2h"), Some(7200));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn missing_required_bullet_yields_none() {
        let text = r#"
## Workflow: Bad
### Step 1: x
- Tool: list_files_tool
- Arguments: {}
"#;
        assert!(parse_plan(text).is_none());
    }
}
