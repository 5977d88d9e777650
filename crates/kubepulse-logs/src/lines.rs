/// Split a chunk of log output into lines.
///
/// Accepts `\n` and `\r\n` endings. Only the fragment after the last newline
/// is dropped when it is blank; every line that was terminated is kept, even
/// if it is empty or whitespace.
pub fn split_lines(chunk: &str) -> Vec<String> {
    let mut lines: Vec<String> = chunk
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();

    if lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    lines
}
