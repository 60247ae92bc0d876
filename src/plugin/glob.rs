//! Path globs for plugin selection.
//!
//! `*` matches within one path segment, `**` across segments, `?` one
//! character. A pattern without `/` is matched against the file name only.

pub fn glob_matches(pattern: &str, path: &str) -> bool {
    let subject = if pattern.contains('/') {
        path.trim_start_matches('/')
    } else {
        path.rsplit('/').next().unwrap_or(path)
    };
    let pattern: Vec<char> = pattern.trim_start_matches('/').chars().collect();
    let subject: Vec<char> = subject.chars().collect();
    matches_at(&pattern, &subject)
}

fn matches_at(pattern: &[char], subject: &[char]) -> bool {
    match pattern.first() {
        None => subject.is_empty(),
        Some('*') if pattern.get(1) == Some(&'*') => {
            let rest = &pattern[2..];
            // `**/` also matches zero directories.
            if rest.first() == Some(&'/') && matches_at(&rest[1..], subject) {
                return true;
            }
            (0..=subject.len()).any(|skip| matches_at(rest, &subject[skip..]))
        }
        Some('*') => {
            let rest = &pattern[1..];
            for skip in 0..=subject.len() {
                if matches_at(rest, &subject[skip..]) {
                    return true;
                }
                if subject.get(skip) == Some(&'/') {
                    break;
                }
            }
            false
        }
        Some('?') => match subject.first() {
            Some(c) if *c != '/' => matches_at(&pattern[1..], &subject[1..]),
            _ => false,
        },
        Some(c) => subject.first() == Some(c) && matches_at(&pattern[1..], &subject[1..]),
    }
}
