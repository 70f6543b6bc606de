//! 各阶段的 system prompt
//!
//! 每个 prompt 以固定的首句开头，日志与测试据此区分调用阶段。

use crate::react::plan::plan_step_schema_json;

pub const PLANNER_MARKER: &str = "You are the planning module of an autonomous agent.";
pub const REFLECTION_MARKER: &str = "You review the outcome of one step";
pub const REPLAN_MARKER: &str = "You revise an execution plan";
pub const REFINE_MARKER: &str = "You prepare precise instructions";
pub const SYNTHESIS_MARKER: &str = "You write the final answer";
pub const FILE_OPS_MARKER: &str = "You translate a file-system step into actions";
pub const CODE_MARKER: &str = "You write a single self-contained program";
pub const RESEARCH_MARKER: &str = "You are a research assistant";
pub const GENERATION_MARKER: &str = "You produce the requested content";
pub const TOOL_CHOICE_MARKER: &str = "You choose one external tool";

const EXECUTORS: &str = "\
- codeExecution: write and run a short program (python, sh or javascript) in an isolated sandbox. params: {\"language\", \"code\"} (optional).
- fileSystem: create, append, read, list or delete files in the sandbox workspace. params: {\"actions\": [{\"op\": \"write\", \"path\", \"content\"}, ...]} (optional).
- research: gather information on a topic. params: {\"query\", \"urls\": [...]} (optional). Use intensity low / medium / high for depth.
- generation: write text such as a summary, report or code listing. params: {\"path\"} (optional, saves the text as a file).
- toolCall: call an external tool server. params: {\"server\", \"tool\", \"arguments\"} (optional).";

/// 初始规划 prompt：列出执行器与单步 JSON 格式
pub fn planner_system(workdir: &str, external_tools: &str) -> String {
    let tools = if external_tools.is_empty() {
        "(none)".to_string()
    } else {
        external_tools.to_string()
    };
    format!(
        "{PLANNER_MARKER}
Break the user's task into an ordered list of steps. Each step is executed by exactly one executor:
{EXECUTORS}

External tools currently available:
{tools}

The sandbox working directory is {workdir}. Relative paths resolve against it.

Reply with JSON only. Use an object whose keys are step1, step2, ... and whose values follow this schema:
{schema}

usingData names earlier steps (1-based) whose results the step needs, or \"none\" / \"all\".
If the task needs no execution at all (a greeting, a simple fact), reply {{\"directAnswer\": true, \"answer\": \"...\"}} instead.",
        schema = plan_step_schema_json()
    )
}

pub fn reflection_system() -> String {
    format!(
        "{REFLECTION_MARKER} of a multi-step plan and decide whether the remaining plan still fits.
Reply with JSON only: {{\"changePlan\": true|false, \"reason\": \"...\"}}.
Ask for a change only when the result makes the remaining steps wrong or useless; a failed step alone is not a reason if later steps do not depend on it."
    )
}

pub fn replan_system() -> String {
    format!(
        "{REPLAN_MARKER} after some steps have already run.
Return the COMPLETE plan in the same JSON format as before (step1, step2, ...), keeping the steps that already ran unchanged and in place; execution resumes right after the last completed step.
Available executors:
{EXECUTORS}
Reply with JSON only."
    )
}

pub fn refine_system() -> String {
    format!(
        "{REFINE_MARKER} for the next step of a plan, using the results of earlier steps.
Reply with the concrete instructions for this step only, as plain text. Include exact values (names, numbers, paths) taken from the earlier results."
    )
}

pub fn synthesis_system() -> String {
    format!(
        "{SYNTHESIS_MARKER} for the user's task from the results of the executed steps.
Be direct. Mention files that were produced by path. If some steps failed, say what could not be done."
    )
}

pub fn file_ops_system(workdir: &str) -> String {
    format!(
        "{FILE_OPS_MARKER} inside a sandbox whose working directory is {workdir}.
Reply with JSON only: {{\"actions\": [{{\"op\": \"write|append|read|mkdir|list|delete\", \"path\": \"...\", \"content\": \"...\"}}], \"done\": true}}.
Set done to false only if you need to see the results of these actions before deciding the next ones."
    )
}

pub fn code_system() -> String {
    format!(
        "{CODE_MARKER} that accomplishes the step. It runs non-interactively in a sandbox with no network access.
Reply with JSON only: {{\"language\": \"python|sh|javascript\", \"code\": \"...\"}}. Print results to stdout."
    )
}

pub fn research_system() -> String {
    format!(
        "{RESEARCH_MARKER}. Answer the research request from your own knowledge, clearly separating facts from uncertainty. Keep it concise and structured."
    )
}

pub fn generation_system() -> String {
    format!("{GENERATION_MARKER} for one step of a larger task. Output only the content itself, without preamble.")
}

pub fn tool_choice_system(tools: &str) -> String {
    format!(
        "{TOOL_CHOICE_MARKER} to accomplish the step.
Available tools (server / name: description, input schema):
{tools}
Reply with JSON only: {{\"server\": \"...\", \"tool\": \"...\", \"arguments\": {{...}}}}."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_start_with_markers() {
        assert!(planner_system("/workspace", "").starts_with(PLANNER_MARKER));
        assert!(planner_system("/workspace", "").contains("directAnswer"));
        assert!(reflection_system().starts_with(REFLECTION_MARKER));
        assert!(file_ops_system("/w").contains("/w"));
        assert!(tool_choice_system("- a / b").starts_with(TOOL_CHOICE_MARKER));
    }
}
