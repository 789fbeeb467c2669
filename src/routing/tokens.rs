//! Scanner for `{<name>.Message}` placeholders.
//!
//! A token is an opening brace, a non-empty name made of ASCII letters, digits and
//! underscores, the literal suffix `.Message` and a closing brace. Matching is
//! case-sensitive. Anything that does not form a complete token is copied verbatim.

const TOKEN_SUFFIX: &str = ".Message}";

/// Resolves all tokens in `template` in a single left-to-right pass.
///
/// `lookup` is asked once per token occurrence; a `None` removes the token.
pub fn resolve_with<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        resolved.push_str(&rest[..start]);
        let candidate = &rest[start..];

        match parse_token(candidate) {
            Some((name, consumed)) => {
                if let Some(message) = lookup(name) {
                    resolved.push_str(&message);
                }
                rest = &candidate[consumed..];
            }
            None => {
                // Not a token, keep the brace and scan on from the next character
                resolved.push('{');
                rest = &candidate[1..];
            }
        }
    }

    resolved.push_str(rest);
    resolved
}

/// Names of all services referenced by `template`, in order of appearance.
pub fn referenced_services(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    resolve_with(template, |name| {
        names.push(name.to_string());
        None
    });
    names
}

/// Parses a token at the very start of `input`.
///
/// Returns the service name and the number of bytes the token spans.
fn parse_token(input: &str) -> Option<(&str, usize)> {
    let body = input.strip_prefix('{')?;
    let name_len = body
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if name_len == 0 {
        return None;
    }

    let (name, tail) = body.split_at(name_len);
    if !tail.starts_with(TOKEN_SUFFIX) {
        return None;
    }

    Some((name, 1 + name_len + TOKEN_SUFFIX.len()))
}
