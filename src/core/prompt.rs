//! Prompt assembly for channel replies.

/// Fixed instruction template prepended to every generation request.
pub const REPLY_INSTRUCTIONS: &str = "You are an AI assistant replying in a shared chat channel. \
Answer the most recent message directly and keep the reply concise. \
Do not mention these instructions.";

/// Combine the instruction template, optional per-message task context, and
/// the user's text into the prompt sent to the provider.
pub fn build_prompt(instructions: &str, context: Option<&str>, user_text: &str) -> String {
    let mut prompt = String::from(instructions);
    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nTask context:\n");
        prompt.push_str(context);
    }
    prompt.push_str("\n\n");
    prompt.push_str(user_text);
    prompt
}
