/// Cuts `output` to at most `max_bytes` (on a char boundary) and appends a
/// marker naming the original length. Output within the limit is returned
/// unchanged.
pub fn truncate_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let original_bytes = output.len();
    mark_truncated(output, max_bytes, original_bytes)
}

/// Like [`truncate_output`] for output whose full length was only counted,
/// not kept: `output` is the retained prefix of `original_bytes`.
pub fn mark_truncated(mut output: String, max_bytes: usize, original_bytes: usize) -> String {
    let mut cutoff = max_bytes.min(output.len());
    while cutoff > 0 && !output.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    output.truncate(cutoff);
    output.push_str(&truncation_marker(original_bytes));
    output
}

pub fn truncation_marker(original_bytes: usize) -> String {
    format!("\n...[output truncated: {original_bytes} bytes total]")
}
