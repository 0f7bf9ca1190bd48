//! Automatic renaming after a lost probe
//!
//! `Name` becomes `Name (2)`, then `Name (3)` up to `Name (9)`. After that
//! a random two-digit suffix is tried, then three digits, then four digits
//! for every further attempt. Host names take the same numbers with a
//! hyphen: `alpha` becomes `alpha-2`.

use crate::wire::name::MAX_LABEL_LEN;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuffixStyle {
    Parenthesized,
    Hyphenated,
}

impl SuffixStyle {
    fn format(self, value: u32) -> Vec<u8> {
        match self {
            SuffixStyle::Parenthesized => format!(" ({})", value).into_bytes(),
            SuffixStyle::Hyphenated => format!("-{}", value).into_bytes(),
        }
    }
}

/// Split `label` into its base and numeric suffix, if it has one
fn split_suffix(label: &[u8], style: SuffixStyle) -> Option<(&[u8], u32)> {
    let inner = match style {
        SuffixStyle::Parenthesized => label.strip_suffix(b")")?,
        SuffixStyle::Hyphenated => label,
    };
    let digits = inner.iter().rev().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits > 9 {
        return None;
    }
    let (head, number) = inner.split_at(inner.len() - digits);
    let base = match style {
        SuffixStyle::Parenthesized => head.strip_suffix(b" (")?,
        SuffixStyle::Hyphenated => head.strip_suffix(b"-")?,
    };
    if base.is_empty() {
        return None;
    }
    let value = std::str::from_utf8(number).ok()?.parse().ok()?;
    Some((base, value))
}

fn next_value(current: u32, rng: &mut impl Rng) -> u32 {
    match current {
        0 => 2,
        1..=8 => current + 1,
        9 => rng.random_range(10..=99),
        10..=99 => rng.random_range(100..=999),
        _ => rng.random_range(1000..=9999),
    }
}

/// The next label to try after `label` lost a conflict
pub fn increment_label_suffix(label: &[u8], rng: &mut impl Rng) -> Vec<u8> {
    increment(label, SuffixStyle::Parenthesized, rng)
}

/// The next host label to try after the host name lost a conflict
pub fn increment_host_label(label: &[u8], rng: &mut impl Rng) -> Vec<u8> {
    increment(label, SuffixStyle::Hyphenated, rng)
}

fn increment(label: &[u8], style: SuffixStyle, rng: &mut impl Rng) -> Vec<u8> {
    let (base, current) = split_suffix(label, style).unwrap_or((label, 0));
    let value = next_value(current, rng);
    let suffix = style.format(value);

    let mut base = base;
    while base.last() == Some(&b' ') {
        base = &base[..base.len() - 1];
    }

    let room = MAX_LABEL_LEN - suffix.len();
    let mut cut = base.len().min(room);
    // Do not split a multi-byte UTF-8 sequence
    while cut > 0 && cut < base.len() && (base[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }

    let mut out = Vec::with_capacity(cut + suffix.len());
    out.extend_from_slice(&base[..cut]);
    out.extend_from_slice(&suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_sequential_suffixes() {
        let mut rng = rng();
        let mut label = b"Printer".to_vec();
        let mut seen = Vec::new();
        for _ in 0..8 {
            label = increment_label_suffix(&label, &mut rng);
            seen.push(String::from_utf8(label.clone()).unwrap());
        }
        assert_eq!(seen[0], "Printer (2)");
        assert_eq!(seen[1], "Printer (3)");
        assert_eq!(seen[7], "Printer (9)");
    }

    #[test]
    fn test_random_suffix_widths() {
        let mut rng = rng();
        let two = increment_label_suffix(b"Printer (9)", &mut rng);
        let (_, value) = split_suffix(&two, SuffixStyle::Parenthesized).unwrap();
        assert!((10..=99).contains(&value));

        let three = increment_label_suffix(b"Printer (42)", &mut rng);
        let (_, value) = split_suffix(&three, SuffixStyle::Parenthesized).unwrap();
        assert!((100..=999).contains(&value));

        let four = increment_label_suffix(b"Printer (512)", &mut rng);
        let (base, value) = split_suffix(&four, SuffixStyle::Parenthesized).unwrap();
        assert!((1000..=9999).contains(&value));
        assert_eq!(base, b"Printer");
    }

    #[test]
    fn test_not_a_suffix() {
        let mut rng = rng();
        assert_eq!(increment_label_suffix(b"Room(4)", &mut rng), b"Room(4) (2)".to_vec());
        assert_eq!(increment_label_suffix(b"Room ()", &mut rng), b"Room () (2)".to_vec());
    }

    #[test]
    fn test_host_labels_take_a_hyphen() {
        let mut rng = rng();
        assert_eq!(increment_host_label(b"alpha", &mut rng), b"alpha-2".to_vec());
        assert_eq!(increment_host_label(b"alpha-2", &mut rng), b"alpha-3".to_vec());
        assert_eq!(increment_host_label(b"-7", &mut rng), b"-7-2".to_vec());

        let wide = increment_host_label(b"alpha-9", &mut rng);
        let (base, value) = split_suffix(&wide, SuffixStyle::Hyphenated).unwrap();
        assert_eq!(base, b"alpha");
        assert!((10..=99).contains(&value));
    }

    #[test]
    fn test_truncates_to_label_limit() {
        let mut rng = rng();
        let long = vec![b'a'; 63];
        let renamed = increment_label_suffix(&long, &mut rng);
        assert_eq!(renamed.len(), 63);
        assert!(renamed.ends_with(b" (2)"));
    }

    #[test]
    fn test_truncation_respects_utf8() {
        let mut rng = rng();
        // 58 ASCII bytes followed by a 3-byte character straddling the cut
        let mut label = vec![b'a'; 58];
        label.extend_from_slice("€".as_bytes());
        let renamed = increment_label_suffix(&label, &mut rng);
        assert!(std::str::from_utf8(&renamed).is_ok());
        assert_eq!(renamed, [vec![b'a'; 58], b" (2)".to_vec()].concat());
    }
}
