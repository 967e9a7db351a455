//! Parsing of test-scenario generator output into `ScenarioSet`.

use page_analysis_types::{ScenarioSet, ScenarioSummary, TestScenario};
use serde_json::{Deserializer, Value};

pub const PARSED_CONFIDENCE: f64 = 0.8;

const SCENARIOS_KEY: &str = "suggested_test_scenarios";

/// Parse generator text. Falls back to the built-in default scenario when
/// nothing usable is found.
pub fn parse(text: &str) -> ScenarioSet {
    match find_scenario_object(text) {
        Some(entries) => {
            let scenarios: Vec<TestScenario> = entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<TestScenario>(entry) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        log::warn!("[SCENARIOS] Skipping undecodable scenario: {}", e);
                        None
                    }
                })
                .collect();

            if scenarios.is_empty() {
                log::warn!("[SCENARIOS] Scenario list empty after decoding, using default");
                return default_set();
            }

            ScenarioSet {
                summary: summarize(&scenarios),
                scenarios,
                confidence: PARSED_CONFIDENCE,
                degraded: false,
            }
        }
        None => {
            log::warn!("[SCENARIOS] No scenario JSON found in generator output, using default");
            default_set()
        }
    }
}

/// Scan each `{` and decode the first complete JSON value starting there.
/// The first object carrying a scenario array wins.
fn find_scenario_object(text: &str) -> Option<Vec<Value>> {
    for (start, _) in text.match_indices('{') {
        let mut stream = Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(mut map))) = stream.next() {
            if let Some(Value::Array(entries)) = map.remove(SCENARIOS_KEY) {
                return Some(entries);
            }
        }
    }
    None
}

fn priority_bucket(priority: &str) -> Option<usize> {
    match priority.trim().to_lowercase().as_str() {
        "高" | "high" => Some(0),
        "中" | "medium" => Some(1),
        "低" | "low" => Some(2),
        _ => None,
    }
}

pub fn summarize(scenarios: &[TestScenario]) -> ScenarioSummary {
    let mut summary = ScenarioSummary {
        total_scenarios: scenarios.len(),
        ..Default::default()
    };

    for scenario in scenarios {
        match priority_bucket(&scenario.priority) {
            Some(0) => summary.high_priority += 1,
            Some(1) => summary.medium_priority += 1,
            Some(2) => summary.low_priority += 1,
            _ => {}
        }
        if !scenario.category.is_empty() && !summary.categories.contains(&scenario.category) {
            summary.categories.push(scenario.category.clone());
        }
    }

    summary
}

/// Built-in scenario substituted for unusable generator output
pub fn default_set() -> ScenarioSet {
    let scenarios = vec![TestScenario {
        scenario_id: "TC001".to_string(),
        scenario_name: "Basic page functionality".to_string(),
        description: "Verify the page loads and its basic features work".to_string(),
        category: "functional".to_string(),
        priority: "high".to_string(),
        estimated_duration: "2 minutes".to_string(),
        preconditions: vec!["Page has loaded".to_string()],
        test_steps: vec![
            "Verify the page finished loading".to_string(),
            "Check the main elements are displayed".to_string(),
            "Exercise the basic interactions".to_string(),
        ],
        expected_results: vec![
            "Page renders correctly".to_string(),
            "Elements respond to interaction".to_string(),
        ],
        test_data: Value::Object(Default::default()),
        tags: vec!["smoke".to_string(), "ui".to_string()],
    }];

    ScenarioSet {
        summary: summarize(&scenarios),
        scenarios,
        confidence: 0.0,
        degraded: true,
    }
}

/// Empty placeholder stored for a failed scenario item
pub fn failed_set() -> ScenarioSet {
    ScenarioSet {
        scenarios: Vec::new(),
        summary: ScenarioSummary::default(),
        confidence: 0.0,
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATED: &str = r#"Sure, here are the scenarios:
```json
{
  "suggested_test_scenarios": [
    {"scenario_id": "TC001", "scenario_name": "Login works", "category": "功能测试",
     "priority": "高", "test_steps": ["open", "submit"], "test_data": {"user": "a"}},
    {"scenario_id": "TC002", "scenario_name": "Bad password", "category": "异常测试",
     "priority": "medium"},
    {"scenario_id": "TC003", "scenario_name": 42},
    {"scenario_id": "TC004", "scenario_name": "Logout", "category": "功能测试", "priority": "Low"}
  ],
  "analysis_summary": {"total_scenarios": 99}
}
```"#;

    #[test]
    fn parses_fenced_output_and_recomputes_summary() {
        let set = parse(GENERATED);
        assert!(!set.degraded);
        assert_eq!(set.confidence, PARSED_CONFIDENCE);
        // TC003 has a non-string name and is skipped
        assert_eq!(set.scenarios.len(), 3);
        assert_eq!(set.scenarios[0].test_steps, vec!["open", "submit"]);
        assert_eq!(set.summary.total_scenarios, 3);
        assert_eq!(set.summary.high_priority, 1);
        assert_eq!(set.summary.medium_priority, 1);
        assert_eq!(set.summary.low_priority, 1);
        assert_eq!(set.summary.categories, vec!["功能测试", "异常测试"]);
    }

    #[test]
    fn skips_leading_objects_without_scenarios() {
        let text = r#"{"note": "preamble"} then {"suggested_test_scenarios": [{"scenario_name": "x"}]}"#;
        let set = parse(text);
        assert!(!set.degraded);
        assert_eq!(set.scenarios[0].scenario_name, "x");
    }

    #[test]
    fn garbage_yields_default_set() {
        let set = parse("I could not produce JSON today.");
        assert!(set.degraded);
        assert_eq!(set.confidence, 0.0);
        assert_eq!(set.scenarios.len(), 1);
        assert_eq!(set.summary.high_priority, 1);
    }
}
