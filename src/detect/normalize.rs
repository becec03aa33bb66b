//! Signature normalization: collapse volatile parts of routes and log text so
//! recurring anomalies share one signature.

/// Maximum length of a message template used inside a signature.
pub const MAX_TEMPLATE_LEN: usize = 160;

/// Turn a concrete request path into a route template.
///
/// `/users/42/orders/9f1c...` becomes `/users/:id/orders/:id`. Query strings
/// and trailing slashes are dropped.
pub fn route_template(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("").trim();
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_identifier(s) { ":id" } else { s })
        .collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Turn a log line into a template with numbers, identifiers and quoted
/// values masked.
pub fn message_template(line: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_quote: Option<char> = None;

    for token in line.split_whitespace() {
        if let Some(q) = in_quote {
            if token.ends_with(q) {
                in_quote = None;
            }
            continue;
        }
        let first = token.chars().next().unwrap_or(' ');
        if first == '"' || first == '\'' {
            if !(token.len() > 1 && token.ends_with(first)) {
                in_quote = Some(first);
            }
            out.push("<str>".to_string());
            continue;
        }

        let core = token.trim_matches(|c: char| !c.is_alphanumeric());
        if is_uuid(core) {
            out.push(token.replace(core, "<uuid>"));
        } else if is_long_hex(core) {
            out.push(token.replace(core, "<hex>"));
        } else if token.chars().any(|c| c.is_ascii_digit()) {
            out.push(mask_digits(token));
        } else {
            out.push(token.to_string());
        }
    }

    let mut template = out.join(" ");
    if template.len() > MAX_TEMPLATE_LEN {
        let mut cut = MAX_TEMPLATE_LEN;
        while !template.is_char_boundary(cut) {
            cut -= 1;
        }
        template.truncate(cut);
    }
    template
}

fn is_identifier(segment: &str) -> bool {
    segment.chars().all(|c| c.is_ascii_digit()) || is_uuid(segment) || is_long_hex(segment)
}

fn is_uuid(s: &str) -> bool {
    s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

fn is_long_hex(s: &str) -> bool {
    s.len() >= 16
        && s.chars().all(|c| c.is_ascii_hexdigit())
        && s.chars().any(|c| c.is_ascii_digit())
}

fn mask_digits(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut in_digits = false;
    for c in token.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push_str("<n>");
                in_digits = true;
            }
        } else {
            // "1.5s" collapses to "<n>s" rather than "<n>.<n>s"
            if c == '.' && in_digits {
                continue;
            }
            in_digits = false;
            out.push(c);
        }
    }
    out
}
