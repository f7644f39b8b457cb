//! Fuzzy scoring for registry search.

/// Edit distance between `value` and `needle`.
fn levenshtein(value: &[char], needle: &[char]) -> usize {
    let n = needle.len();
    if value.is_empty() {
        return n;
    }
    if n == 0 {
        return value.len();
    }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr: Vec<usize> = vec![0; n + 1];

    for (i, c) in value.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = if *c == needle[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

fn ratio(a: &[char], b: &[char]) -> u8 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 100;
    }
    let dist = levenshtein(a, b);
    (100 * (longest - dist.min(longest)) / longest) as u8
}

fn tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c.is_whitespace() || c == '_' || c == '-').filter(|t| !t.is_empty())
}

/// Similarity of `value` to `query` in `0..=100`.
///
/// 100 for exact matches, at least 90 when the query equals one token of the
/// value, otherwise the normalized edit distance of the whole strings or the
/// best single token, whichever is higher.
pub fn score(value: &str, query: &str, case_sensitive: bool) -> u8 {
    let (value, query) = if case_sensitive {
        (value.to_string(), query.to_string())
    } else {
        (value.to_lowercase(), query.to_lowercase())
    };
    if value == query {
        return 100;
    }

    let q: Vec<char> = query.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let mut best = ratio(&v, &q);

    for token in tokens(&value) {
        if token == query {
            best = best.max(90);
            continue;
        }
        let t: Vec<char> = token.chars().collect();
        // A close token match ranks just below a full-string one.
        best = best.max(ratio(&t, &q).saturating_sub(10));
    }
    best
}
