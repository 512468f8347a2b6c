//! Human and JSON output.

use console::style;
use meridian_core::{NodeStatus, StackId};
use meridian_plan::{CompiledPlan, Graph, Plan};
use meridian_runtime::{ExecutionResult, Outcome};
use serde_json::{Value, json};
use std::fmt::Write;

fn stage_lists(plan: &Plan) -> Value {
    plan.stages()
        .iter()
        .map(|stage| stage.nodes().iter().map(|id| id.as_str()).collect::<Vec<_>>())
        .collect::<Vec<_>>()
        .into()
}

/// Compiled plan as JSON
#[must_use]
pub fn plan_json(stack: &StackId, plan: &CompiledPlan) -> Value {
    json!({
        "stack": stack,
        "forward": stage_lists(&plan.forward),
        "teardown": stage_lists(&plan.teardown),
        "warnings": plan.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
    })
}

/// Compiled plan for a terminal
#[must_use]
pub fn plan_text(stack: &StackId, graph: &Graph, plan: &CompiledPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({} nodes, {} stages)",
        style("plan").bold(),
        stack,
        graph.node_count(),
        plan.forward.len()
    );
    for (index, stage) in plan.forward.stages().iter().enumerate() {
        let _ = writeln!(out, "  stage {}:", index);
        for id in stage.nodes() {
            let kind = graph.node(id).map(|n| n.kind.as_str()).unwrap_or("?");
            let _ = writeln!(out, "    {} {}", id, style(kind).dim());
        }
    }
    for warning in &plan.warnings {
        let _ = writeln!(out, "{} {}", style("warning:").yellow().bold(), warning);
    }
    out
}

fn status_label(status: NodeStatus) -> String {
    let label = status.to_string();
    match status {
        NodeStatus::Succeeded => style(label).green().to_string(),
        NodeStatus::Failed => style(label).red().bold().to_string(),
        NodeStatus::RolledBack => style(label).yellow().to_string(),
        NodeStatus::Pending | NodeStatus::InProgress => style(label).dim().to_string(),
    }
}

/// Execution result for a terminal
#[must_use]
pub fn result_text(result: &ExecutionResult) -> String {
    let mut out = String::new();
    for (id, record) in &result.nodes {
        let _ = write!(out, "  {:<24} {}", id.as_str(), status_label(record.status));
        if let Some(handle) = &record.handle {
            let _ = write!(out, " {}", style(&handle.physical_id).dim());
        }
        let _ = writeln!(out);
    }
    for failure in &result.failures {
        let _ = writeln!(out, "{} {}", style("error:").red().bold(), failure);
        if !failure.rolled_back.is_empty() {
            let rolled: Vec<&str> = failure.rolled_back.iter().map(|id| id.as_str()).collect();
            let _ = writeln!(out, "  rolled back: {}", rolled.join(", "));
        }
    }
    let summary = match result.outcome {
        Outcome::Succeeded => style(result.to_string()).green().bold(),
        Outcome::Failed => style(result.to_string()).red().bold(),
        Outcome::Cancelled => style(result.to_string()).yellow().bold(),
    };
    let _ = writeln!(out, "{} in {} ms", summary, result.duration().num_milliseconds());
    out
}
