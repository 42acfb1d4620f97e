//! Wildcard message patterns translated to SQLite `LIKE` syntax

/// Escape character used in the generated `LIKE ... ESCAPE` clause
pub const LIKE_ESCAPE: char = '\\';

/// Translate a user pattern into a substring `LIKE` pattern.
///
/// `*` becomes `%`, `\*` becomes a literal `*`, and the `LIKE` metacharacters
/// `%`, `_` and the escape character itself are escaped so they match literally.
/// The result is wrapped in `%` so the pattern can match anywhere in the message.
pub fn to_like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('%');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push('*');
            }
            '*' => out.push('%'),
            '%' | '_' | LIKE_ESCAPE => {
                out.push(LIKE_ESCAPE);
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out.push('%');
    out
}
