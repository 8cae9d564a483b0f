/// Execution context handed to the executor for one step.
pub fn step_context(plan_text: &str, index: usize, step_text: &str) -> String {
    format!(
        "CURRENT PLAN STATUS:\n\
{plan_text}\n\
\n\
YOUR CURRENT TASK:\n\
You are now working on step {index}: \"{step_text}\"\n\
\n\
YOUR OBJECTIVE:\n\
1. Execute the current step using the appropriate tools.\n\
2. Re-read recent messages, especially answers from the user. If they show that any FUTURE \
step in the plan above is already completed or no longer relevant, mark that step completed \
or blocked with a short note before working on the current step.\n\
3. If you are stuck on the current step after two or three failed attempts, need information \
you cannot find, or need a decision from the user, ask the human.\n\
4. When you are done with this step, summarize what you accomplished or why you need help.\n"
    )
}

/// Prompt used when the primary executor stands in for the summarizer.
pub fn summary_prompt(plan_text: &str) -> String {
    format!(
        "The plan has been completed. Here is the final plan status:\n\n{plan_text}\n\n\
Please provide a summary of what was accomplished and any final thoughts."
    )
}

pub fn interrupted_note(question: &str) -> String {
    format!("Tool execution interrupted to ask user: {question}")
}

pub fn human_answer_note(question: &str, answer: &str) -> String {
    format!("Regarding your question \"{question}\": {answer}")
}
