// src/takedown/typosquat.rs
use std::collections::BTreeSet;

const SUBSTITUTIONS: &[(char, &[&str])] = &[
    ('a', &["4", "@", "q"]),
    ('e', &["3", "€"]),
    ('i', &["1", "l", "!"]),
    ('o', &["0", "ø"]),
    ('s', &["5", "$", "z"]),
    ('l', &["1", "i"]),
    ('t', &["7", "+"]),
    ('g', &["9", "q"]),
];

const PREFIXES: &[&str] = &["my", "the", "get", "go", "i", "e", "web", "app", "official", "real", "secure", "login"];

const SUFFIXES: &[&str] = &["app", "web", "online", "login", "secure", "official", "support", "help", "verify", "account"];

fn substitutes(c: char) -> &'static [&'static str] {
    SUBSTITUTIONS
        .iter()
        .find(|(from, _)| *from == c)
        .map(|(_, to)| *to)
        .unwrap_or(&[])
}

/// Typosquatting variants of a brand name, sorted and de-duplicated
pub fn generate_patterns(brand: &str, max_patterns: usize) -> Vec<String> {
    let brand = brand.trim().to_lowercase();
    let chars: Vec<char> = brand.chars().collect();
    let mut patterns = BTreeSet::new();

    // Omission
    for i in 0..chars.len() {
        patterns.insert(chars[..i].iter().chain(&chars[i + 1..]).collect::<String>());
    }

    // Duplication
    for i in 0..chars.len() {
        patterns.insert(chars[..=i].iter().chain(&chars[i..]).collect::<String>());
    }

    // Adjacent swap
    for i in 0..chars.len().saturating_sub(1) {
        let mut swapped = chars.clone();
        swapped.swap(i, i + 1);
        patterns.insert(swapped.into_iter().collect::<String>());
    }

    // Homoglyph substitution
    for (i, c) in chars.iter().enumerate() {
        for sub in substitutes(*c) {
            let head: String = chars[..i].iter().collect();
            let tail: String = chars[i + 1..].iter().collect();
            patterns.insert(format!("{}{}{}", head, sub, tail));
        }
    }

    for prefix in PREFIXES {
        patterns.insert(format!("{}{}", prefix, brand));
        patterns.insert(format!("{}-{}", prefix, brand));
    }
    for suffix in SUFFIXES {
        patterns.insert(format!("{}{}", brand, suffix));
        patterns.insert(format!("{}-{}", brand, suffix));
    }

    patterns.remove(&brand);
    patterns.remove("");
    patterns.into_iter().take(max_patterns).collect()
}

/// Longest common block of `a[a_lo..a_hi]` and `b[b_lo..b_hi]` as (i, j, size)
fn longest_match(a: &[char], b: &[char], a_lo: usize, a_hi: usize, b_lo: usize, b_hi: usize) -> (usize, usize, usize) {
    let mut best = (a_lo, b_lo, 0);
    // lengths[j + 1] = length of the match ending at a[i], b[j]
    let mut lengths = vec![0usize; b_hi - b_lo + 1];
    for i in a_lo..a_hi {
        let mut next = vec![0usize; b_hi - b_lo + 1];
        for j in b_lo..b_hi {
            if a[i] == b[j] {
                let k = lengths[j - b_lo] + 1;
                next[j - b_lo + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        lengths = next;
    }
    best
}

fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((a_lo, a_hi, b_lo, b_hi)) = queue.pop() {
        let (i, j, size) = longest_match(a, b, a_lo, a_hi, b_lo, b_hi);
        if size == 0 {
            continue;
        }
        total += size;
        if a_lo < i && b_lo < j {
            queue.push((a_lo, i, b_lo, j));
        }
        if i + size < a_hi && j + size < b_hi {
            queue.push((i + size, a_hi, j + size, b_hi));
        }
    }
    total
}

/// Ratcliff/Obershelp similarity in `[0, 1]`
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    2.0 * matching_characters(&a, &b) as f64 / (a.len() + b.len()) as f64
}

/// First label of a domain
pub fn domain_base(domain: &str) -> String {
    domain.trim().to_lowercase().split('.').next().unwrap_or_default().to_string()
}

/// Similarity of a brand name (spaces removed) to a domain's first label
pub fn similarity(brand: &str, domain: &str) -> f64 {
    let brand = brand.to_lowercase().replace(' ', "");
    ratio(&brand, &domain_base(domain))
}
