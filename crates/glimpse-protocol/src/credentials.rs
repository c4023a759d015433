//! Paste-friendly credential parsing.
//!
//! Accepts the forms users actually paste:
//!   "ID: 123 456 7890\nPassword: abcd1234"
//!   "123 456 7890 abcd1234"
//!   "1234567890\nabcd1234"

/// A parsed username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Parse pasted credentials; `None` when no recognizable pair exists.
#[must_use]
pub fn parse_credentials(input: &str) -> Option<Credentials> {
    if let Some(parsed) = parse_labeled(input) {
        return Some(parsed);
    }
    parse_tokens(input)
}

fn parse_labeled(input: &str) -> Option<Credentials> {
    let mut username = None;
    let mut password = None;
    for line in input.lines() {
        let line = line.trim();
        if let Some(rest) = strip_label(line, "id") {
            username = Some(rest.split_whitespace().collect::<String>());
        } else if let Some(rest) = strip_label(line, "password") {
            password = Some(rest.trim().to_string());
        }
    }
    match (username, password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials {
            username: u,
            password: p,
        }),
        _ => None,
    }
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let (head, rest) = line.split_once(':')?;
    head.trim().eq_ignore_ascii_case(label).then_some(rest)
}

fn parse_tokens(input: &str) -> Option<Credentials> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }

    let (head, last) = tokens.split_at(tokens.len() - 1);
    let password = last[0].to_string();

    // A numeric id may be written with grouping spaces.
    if head.iter().all(|t| t.chars().all(|c| c.is_ascii_digit())) {
        return Some(Credentials {
            username: head.concat(),
            password,
        });
    }

    // Otherwise only the plain two-token form is unambiguous.
    if head.len() == 1 {
        return Some(Credentials {
            username: head[0].to_string(),
            password,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(input: &str) -> Credentials {
        parse_credentials(input).unwrap()
    }

    #[test]
    fn labeled_form() {
        let c = parsed("ID: 123 456 7890\nPassword: abcd1234");
        assert_eq!(c.username, "1234567890");
        assert_eq!(c.password, "abcd1234");
    }

    #[test]
    fn labeled_form_is_case_insensitive() {
        let c = parsed("id: 42\npassword: pw");
        assert_eq!(c.username, "42");
        assert_eq!(c.password, "pw");
    }

    #[test]
    fn grouped_numeric_id_then_password() {
        let c = parsed("123 456 7890 secret1");
        assert_eq!(c.username, "1234567890");
        assert_eq!(c.password, "secret1");
    }

    #[test]
    fn two_lines() {
        let c = parsed("1234567890\nabcd1234");
        assert_eq!(c.username, "1234567890");
        assert_eq!(c.password, "abcd1234");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_credentials("").is_none());
        assert!(parse_credentials("justoneword").is_none());
        assert!(parse_credentials("not numeric id groups pw").is_none());
    }
}
