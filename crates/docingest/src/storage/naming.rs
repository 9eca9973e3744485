const MAX_NAME_BYTES: usize = 255;

/// Reduces an arbitrary client-supplied name to a safe single path
/// component.
///
/// Only the last path component is kept. Characters that are reserved on
/// common filesystems, and control characters, become `_`; runs of
/// whitespace collapse to one space. Names longer than 255 bytes are cut
/// at a character boundary with the extension preserved. An empty result
/// becomes `file`.
pub fn safe_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let replaced: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_whitespace() => ' ',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.');

    if trimmed.is_empty() {
        return "file".to_string();
    }
    truncate_keeping_extension(trimmed, MAX_NAME_BYTES)
}

/// Splits `name.ext` into `("name", Some("ext"))`. A leading dot does not
/// start an extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let suffix = ext.map(|e| format!(".{}", e)).unwrap_or_default();
    let budget = max.saturating_sub(suffix.len());
    let mut cut = budget.min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stem[..cut], suffix)
}
