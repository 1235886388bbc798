/// Character budget shown next to the prompt input.
pub const MAX_PROMPT_CHARS: usize = 4000;

/// Collapses whitespace runs to single spaces and ends the prompt with a
/// period unless it already ends in `.`, `!` or `?`. Blank input stays blank.
pub fn tidy_prompt(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.ends_with(['.', '!', '?']) {
        return collapsed;
    }
    collapsed + "."
}

pub fn prompt_char_count(raw: &str) -> usize {
    raw.chars().count()
}

pub fn exceeds_prompt_budget(raw: &str) -> bool {
    prompt_char_count(raw) > MAX_PROMPT_CHARS
}
