use std::cmp::Ordering;

/// Serde support for the `Arc<str>` names stored in replay log steps
pub mod serde_arc_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(s: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<str>, D::Error> {
        String::deserialize(deserializer).map(Arc::from)
    }
}

/// Compares names so that embedded numbers are ordered by value (`h2` < `h10`)
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chunks = chunks(a);
    let mut b_chunks = chunks(b);
    loop {
        match (a_chunks.next(), b_chunks.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

// Splits a string into alternating runs of digits and non-digits
fn chunks(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        rest = tail;
        Some(chunk)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_natural_cmp() {
        let mut names = vec!["h10", "s1", "h2", "ra", "h1", "h1a"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["h1", "h1a", "h2", "h10", "ra", "s1"]);
    }
}
